//! Tasks, projects and knowledge entries.
//!
//! Each resource is owned by one identity. The admission layer does not
//! interpret their fields; it only needs the kind (for cache keys) and the
//! capabilities that guard reads and writes.

use adapt_admission::capability::{
    KNOWLEDGE_READ, KNOWLEDGE_WRITE, PROJECTS_READ, PROJECTS_WRITE, TASKS_READ, TASKS_WRITE,
};
use adapt_admission::ResourceError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Resource collections served by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Tasks,
    Projects,
    Knowledge,
}

impl ResourceKind {
    /// Path segment and cache namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Tasks => "tasks",
            ResourceKind::Projects => "projects",
            ResourceKind::Knowledge => "knowledge",
        }
    }

    /// Singular name used in messages.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Tasks => "Task",
            ResourceKind::Projects => "Project",
            ResourceKind::Knowledge => "Knowledge entry",
        }
    }

    /// Field that must be unique per owner, if any.
    pub fn unique_field(&self) -> Option<&'static str> {
        match self {
            ResourceKind::Projects => Some("name"),
            _ => None,
        }
    }
}

/// Binds a payload type to its collection and capabilities.
pub trait Resource:
    Serialize + DeserializeOwned + Validate + Clone + Send + Sync + 'static
{
    const KIND: ResourceKind;
    const READ: &'static str;
    const WRITE: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Task {
    #[validate(length(min = 1, max = 200, message = "Title is required"))]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

impl Resource for Task {
    const KIND: ResourceKind = ResourceKind::Tasks;
    const READ: &'static str = TASKS_READ;
    const WRITE: &'static str = TASKS_WRITE;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Project {
    #[validate(length(min = 1, max = 200, message = "Name is required"))]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Resource for Project {
    const KIND: ResourceKind = ResourceKind::Projects;
    const READ: &'static str = PROJECTS_READ;
    const WRITE: &'static str = PROJECTS_WRITE;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct KnowledgeEntry {
    #[validate(length(min = 1, max = 200, message = "Title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "Content is required"))]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Resource for KnowledgeEntry {
    const KIND: ResourceKind = ResourceKind::Knowledge;
    const READ: &'static str = KNOWLEDGE_READ;
    const WRITE: &'static str = KNOWLEDGE_WRITE;
}

/// A persisted resource as returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stored<R> {
    pub id: u64,
    pub owner_id: String,
    #[serde(flatten)]
    pub fields: R,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<R: Resource> Stored<R> {
    /// Decode the repository's untyped record.
    pub fn from_record(record: crate::repository::Record) -> Result<Self, ResourceError> {
        let fields = serde_json::from_value(record.data).map_err(|e| {
            ResourceError::Internal(format!(
                "stored {} {} is unreadable: {}",
                R::KIND.label(),
                record.id,
                e
            ))
        })?;
        Ok(Self {
            id: record.id,
            owner_id: record.owner_id,
            fields,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}
