use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Workspace {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Project {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub client_id: Option<u64>,
    pub workspace_id: u64,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Client {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Tag {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub workspace_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TimeEntry {
    pub id: u64,
    #[serde(default)]
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub stop: Option<DateTime<Utc>>,
    pub duration: i64,
    #[serde(default)]
    pub project_id: Option<u64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tag_ids: Vec<u64>,
    pub workspace_id: u64,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub server_deleted_at: Option<DateTime<Utc>>,
}

impl TimeEntry {
    pub fn is_active(&self) -> bool {
        self.stop.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewTimeEntry {
    pub created_with: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tag_ids: Vec<u64>,
    pub workspace_id: u64,
    pub start: DateTime<Utc>,
    pub duration: i64,
}

const fn default_active() -> bool {
    true
}

// Toggl sends `null` for empty collections in several payloads.
pub fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
