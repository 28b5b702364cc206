use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlJobStatus {
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl CrawlJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CrawlJobStatus::Completed | CrawlJobStatus::Stopped | CrawlJobStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlJobStatus::Pending => "pending",
            CrawlJobStatus::Running => "running",
            CrawlJobStatus::Completed => "completed",
            CrawlJobStatus::Stopped => "stopped",
            CrawlJobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => CrawlJobStatus::Running,
            "completed" => CrawlJobStatus::Completed,
            "stopped" => CrawlJobStatus::Stopped,
            "failed" => CrawlJobStatus::Failed,
            _ => CrawlJobStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: String,
    pub site_id: String,
    pub status: CrawlJobStatus,
    pub pages_found: u64,
    pub pages_crawled: u64,
    pub assets_downloaded: u64,
    pub errors: u64,
    pub error_log: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CrawlJob {
    pub fn new(id: impl Into<String>, site_id: impl Into<String>) -> Self {
        CrawlJob {
            id: id.into(),
            site_id: site_id.into(),
            status: CrawlJobStatus::Pending,
            pages_found: 0,
            pages_crawled: 0,
            assets_downloaded: 0,
            errors: 0,
            error_log: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}
