use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub site_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub client_ip: String,
    pub path: String,
    pub method: String,
    pub user_agent: String,
    pub details: serde_json::Value,
    pub country: Option<String>,
    pub blocked: bool,
}

impl SecurityEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        site_id: Option<String>,
        event_type: impl Into<String>,
        severity: Severity,
        client_ip: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
        user_agent: impl Into<String>,
        details: serde_json::Value,
        country: Option<String>,
        blocked: bool,
    ) -> Self {
        let mut user_agent = user_agent.into();
        user_agent.truncate(500);
        SecurityEvent {
            site_id,
            timestamp: Utc::now(),
            event_type: event_type.into(),
            severity,
            client_ip: client_ip.into(),
            path: path.into(),
            method: method.into(),
            user_agent,
            details,
            country,
            blocked,
        }
    }
}
