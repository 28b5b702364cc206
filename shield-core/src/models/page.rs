use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormDescriptor {
    pub action: String,
    pub method: String,
    pub field_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub site_id: String,
    pub url: String,
    pub cache_path: String,
    pub content_type: String,
    pub status_code: u16,
    pub bytes: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub forms_detected: Vec<FormDescriptor>,
    pub created_at: DateTime<Utc>,
}
