//! Domain entities touched by the synchronization core.
//!
//! Entities are owned by the persistence layer; the core only reads them and
//! mutates them through repositories that also write the matching outbox
//! event.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// ACCESS ROLES
// =============================================================================

/// Role a user holds on a resource. Ordered: `Viewer < Editor < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Owner => "owner",
        }
    }

    /// Whether this role is at least `minimum`.
    pub fn satisfies(&self, minimum: Role) -> bool {
        *self >= minimum
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "editor" => Ok(Role::Editor),
            "owner" => Ok(Role::Owner),
            other => Err(Error::InvalidInput(format!("unknown role: {other}"))),
        }
    }
}

// =============================================================================
// NOTEBOOK / NOTE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateNotebookRequest {
    pub owner_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateNotebookRequest {
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: Uuid,
    pub notebook_id: Option<Uuid>,
    pub title: String,
    pub content: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateNoteRequest {
    pub notebook_id: Option<Uuid>,
    pub title: String,
    pub content: String,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateNoteRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    pub notebook_id: Option<Option<Uuid>>,
}

// =============================================================================
// BLOCK / TASK
// =============================================================================

/// Content block kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Text,
    Heading,
    Checklist,
    Code,
    /// A block backed by a Task; kept in sync with it.
    Task,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Text => "text",
            BlockType::Heading => "heading",
            BlockType::Checklist => "checklist",
            BlockType::Code => "code",
            BlockType::Task => "task",
        }
    }
}

impl FromStr for BlockType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(BlockType::Text),
            "heading" => Ok(BlockType::Heading),
            "checklist" => Ok(BlockType::Checklist),
            "code" => Ok(BlockType::Code),
            "task" => Ok(BlockType::Task),
            other => Err(Error::InvalidInput(format!("unknown block type: {other}"))),
        }
    }
}

/// The fields kept consistent between a task and its backing block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFields {
    pub title: String,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: Uuid,
    pub note_id: Uuid,
    pub block_type: BlockType,
    pub content: String,
    pub metadata: JsonValue,
    pub task_id: Option<Uuid>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Block {
    /// A block participates in task sync when it is a task block with a link.
    pub fn is_task_backed(&self) -> bool {
        self.block_type == BlockType::Task && self.task_id.is_some()
    }

    /// Current sync fields: `metadata.title` (falling back to `content`) and
    /// `metadata.completed` (default `false`).
    pub fn sync_fields(&self) -> SyncFields {
        let title = self
            .metadata
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.content.clone());
        let completed = self
            .metadata
            .get("completed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        SyncFields { title, completed }
    }

    /// Write sync fields into the metadata object, preserving other keys.
    pub fn set_sync_fields(&mut self, fields: &SyncFields) {
        let mut map = match std::mem::take(&mut self.metadata) {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        map.insert("title".to_string(), json!(fields.title));
        map.insert("completed".to_string(), json!(fields.completed));
        self.metadata = JsonValue::Object(map);
    }
}

#[derive(Debug, Clone)]
pub struct CreateBlockRequest {
    pub note_id: Uuid,
    pub block_type: BlockType,
    pub content: String,
    pub metadata: JsonValue,
    pub task_id: Option<Uuid>,
    pub position: i32,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateBlockRequest {
    pub content: Option<String>,
    pub metadata: Option<JsonValue>,
    pub task_id: Option<Option<Uuid>>,
    pub position: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub note_id: Option<Uuid>,
    pub title: String,
    pub completed: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn sync_fields(&self) -> SyncFields {
        SyncFields {
            title: self.title.clone(),
            completed: self.completed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub note_id: Option<Uuid>,
    pub title: String,
    pub completed: bool,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub completed: Option<bool>,
}

/// Name of the event announcing a task update.
///
/// A `false → true` transition of `completed` is announced as
/// `task.completed`; every other update is `task.updated`.
pub fn task_update_event_name(before: &Task, after: &Task) -> &'static str {
    if !before.completed && after.completed {
        crate::events::TASK_COMPLETED_EVENT
    } else {
        "task.updated"
    }
}

// =============================================================================
// SYNC OUTCOME
// =============================================================================

/// Result of applying sync fields to a task or block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The target was written; `event_id` is the update event it produced.
    Applied { event_id: Uuid },
    /// Stored values already matched; nothing written, no event.
    Unchanged,
    /// Nothing to do (not task-backed, deleted, link missing).
    Skipped(String),
}

impl SyncOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, SyncOutcome::Applied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(metadata: JsonValue) -> Block {
        Block {
            id: Uuid::new_v4(),
            note_id: Uuid::new_v4(),
            block_type: BlockType::Task,
            content: "Buy milk".to_string(),
            metadata,
            task_id: Some(Uuid::new_v4()),
            position: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn task(completed: bool) -> Task {
        Task {
            id: Uuid::new_v4(),
            note_id: None,
            title: "Buy milk".to_string(),
            completed,
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Owner.satisfies(Role::Viewer));
        assert!(Role::Editor.satisfies(Role::Editor));
        assert!(!Role::Viewer.satisfies(Role::Editor));
        assert_eq!("owner".parse::<Role>().unwrap(), Role::Owner);
    }

    #[test]
    fn test_block_sync_fields_fallback_to_content() {
        let b = block(json!({}));
        assert_eq!(
            b.sync_fields(),
            SyncFields {
                title: "Buy milk".to_string(),
                completed: false
            }
        );
    }

    #[test]
    fn test_block_sync_fields_from_metadata() {
        let b = block(json!({"title": "Buy oat milk", "completed": true}));
        let fields = b.sync_fields();
        assert_eq!(fields.title, "Buy oat milk");
        assert!(fields.completed);
    }

    #[test]
    fn test_set_sync_fields_preserves_other_keys() {
        let mut b = block(json!({"color": "red"}));
        b.set_sync_fields(&SyncFields {
            title: "T".to_string(),
            completed: true,
        });
        assert_eq!(b.metadata["color"], "red");
        assert_eq!(b.metadata["completed"], true);
        assert_eq!(b.metadata["title"], "T");
    }

    #[test]
    fn test_set_sync_fields_replaces_non_object_metadata() {
        let mut b = block(JsonValue::Null);
        b.set_sync_fields(&SyncFields {
            title: "T".to_string(),
            completed: false,
        });
        assert!(b.metadata.is_object());
    }

    #[test]
    fn test_task_backed_requires_type_and_link() {
        let mut b = block(json!({}));
        assert!(b.is_task_backed());
        b.task_id = None;
        assert!(!b.is_task_backed());
        b.task_id = Some(Uuid::new_v4());
        b.block_type = BlockType::Checklist;
        assert!(!b.is_task_backed());
    }

    #[test]
    fn test_task_update_event_name() {
        let open = task(false);
        let mut done = open.clone();
        done.completed = true;
        assert_eq!(task_update_event_name(&open, &done), "task.completed");
        assert_eq!(task_update_event_name(&done, &open), "task.updated");
        assert_eq!(task_update_event_name(&open, &open), "task.updated");
    }
}
