use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Email,
    Phone,
    Number,
    Url,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Email => "email",
            FieldType::Phone => "phone",
            FieldType::Number => "number",
            FieldType::Url => "url",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "email" => FieldType::Email,
            "phone" => FieldType::Phone,
            "number" => FieldType::Number,
            "url" => FieldType::Url,
            _ => FieldType::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleField {
    pub field_name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub max_length: usize,
    pub validation_regex: Option<String>,
}

/// A whitelisted POST endpoint. The first active rule whose `url_pattern`
/// matches a request path wins — literal equality short-circuits regex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRule {
    pub id: String,
    pub site_id: String,
    pub url_pattern: String,
    pub forward_to: String,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
    pub honeypot_field: Option<String>,
    pub allowed_actions: Vec<String>,
    pub success_redirect: Option<String>,
    pub success_message: String,
    pub is_active: bool,
    pub fields: Vec<RuleField>,
}
