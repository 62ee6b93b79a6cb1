//! Access control and WebSocket token validation backed by PostgreSQL.
//!
//! A user's role on a resource is the highest role found on the resource
//! itself or any of its containers (block → note → notebook, task → note).
//! Creators of notes and tasks, and notebook owners, hold `owner`.

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use quire_core::{AccessControl, EntityType, Error, Result, Role, TokenValidator};

/// SHA-256 hex digest stored in `user_token.token_hash`.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// PostgreSQL implementation of AccessControl over `resource_member`.
#[derive(Clone)]
pub struct PgAccessControl {
    pool: Pool<Postgres>,
}

/// Resource scopes an access check considers, plus whether the user created
/// or owns any of them.
struct Scopes {
    resources: Vec<(EntityType, Uuid)>,
    owned: bool,
}

impl PgAccessControl {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Grant `role` on a resource, replacing any existing grant.
    pub async fn grant(
        &self,
        user_id: Uuid,
        resource_type: EntityType,
        resource_id: Uuid,
        role: Role,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO resource_member (user_id, resource_type, resource_id, role)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id, resource_type, resource_id) DO UPDATE SET role = EXCLUDED.role",
        )
        .bind(user_id)
        .bind(resource_type.as_str())
        .bind(resource_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn scopes(
        &self,
        user_id: Uuid,
        resource_type: EntityType,
        resource_id: Uuid,
    ) -> Result<Scopes> {
        let mut scopes = Scopes {
            resources: vec![(resource_type, resource_id)],
            owned: false,
        };

        let mut note_id = match resource_type {
            EntityType::Note => Some(resource_id),
            EntityType::Block => sqlx::query_scalar::<_, Uuid>(
                "SELECT note_id FROM block WHERE id = $1",
            )
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?,
            EntityType::Task => {
                let row = sqlx::query("SELECT note_id, created_by FROM task WHERE id = $1")
                    .bind(resource_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(Error::Database)?;
                row.and_then(|r| {
                    let created_by: Uuid = r.get("created_by");
                    scopes.owned |= created_by == user_id;
                    r.get::<Option<Uuid>, _>("note_id")
                })
            }
            EntityType::Notebook | EntityType::Sync => None,
        };

        let mut notebook_id = (resource_type == EntityType::Notebook).then_some(resource_id);

        if let Some(id) = note_id.take() {
            if resource_type != EntityType::Note {
                scopes.resources.push((EntityType::Note, id));
            }
            let row = sqlx::query("SELECT notebook_id, created_by FROM note WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
            if let Some(r) = row {
                let created_by: Uuid = r.get("created_by");
                scopes.owned |= created_by == user_id;
                notebook_id = r.get("notebook_id");
                if let Some(nb) = notebook_id {
                    scopes.resources.push((EntityType::Notebook, nb));
                }
            }
        }

        if let Some(nb) = notebook_id {
            let owner: Option<Uuid> =
                sqlx::query_scalar("SELECT owner_id FROM notebook WHERE id = $1")
                    .bind(nb)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(Error::Database)?;
            scopes.owned |= owner == Some(user_id);
        }

        Ok(scopes)
    }
}

#[async_trait]
impl AccessControl for PgAccessControl {
    async fn has_access(
        &self,
        user_id: Uuid,
        resource_id: Uuid,
        resource_type: EntityType,
        minimum_role: Role,
    ) -> Result<bool> {
        let scopes = self.scopes(user_id, resource_type, resource_id).await?;
        if scopes.owned {
            return Ok(true);
        }

        let (types, ids): (Vec<String>, Vec<Uuid>) = scopes
            .resources
            .iter()
            .map(|(t, id)| (t.as_str().to_string(), *id))
            .unzip();

        let roles: Vec<String> = sqlx::query_scalar(
            "SELECT role FROM resource_member
             WHERE user_id = $1
               AND (resource_type, resource_id) IN (
                   SELECT * FROM UNNEST($2::text[], $3::uuid[])
               )",
        )
        .bind(user_id)
        .bind(&types)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let best = roles.iter().filter_map(|r| r.parse::<Role>().ok()).max();
        let allowed = best.is_some_and(|role| role.satisfies(minimum_role));

        debug!(
            subsystem = "access",
            component = "access_control",
            user_id = %user_id,
            resource_id = %resource_id,
            resource_type = %resource_type,
            allowed,
            "Access check"
        );
        Ok(allowed)
    }
}

/// PostgreSQL implementation of TokenValidator over `user_token`.
#[derive(Clone)]
pub struct PgTokenValidator {
    pool: Pool<Postgres>,
}

impl PgTokenValidator {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Store a token for `user_id`. Only the hash is persisted.
    pub async fn issue(
        &self,
        token: &str,
        user_id: Uuid,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_token (token_hash, user_id, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(hash_token(token))
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}

#[async_trait]
impl TokenValidator for PgTokenValidator {
    async fn validate(&self, token: &str) -> Result<Option<Uuid>> {
        if token.is_empty() {
            return Ok(None);
        }
        let user_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM user_token
             WHERE token_hash = $1 AND (expires_at IS NULL OR expires_at > $2)",
        )
        .bind(hash_token(token))
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_is_stable_hex() {
        let a = hash_token("secret");
        assert_eq!(a, hash_token("secret"));
        assert_ne!(a, hash_token("Secret"));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
