//! Input sanitizer for POST form data: SQL/XSS/command-injection detection,
//! per-field-type cleaning, and field-rule validation.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{FieldType, RuleField};

static SQL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\b(union|select|insert|update|delete|drop|alter|create|exec|execute)\b.*\b(from|into|table|database|where)\b").unwrap(),
        Regex::new(r"(--|;|/\*|\*/|@@|@)").unwrap(),
        Regex::new(r"(?i)\b(or|and)\b\s+\d+\s*=\s*\d+").unwrap(),
        Regex::new(r"(?i)'\s*(or|and)\s+'").unwrap(),
        Regex::new(r"0x[0-9a-fA-F]+").unwrap(),
    ]
});

static XSS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)<script[\s>]").unwrap(),
        Regex::new(r"(?i)javascript\s*:").unwrap(),
        Regex::new(r"(?i)on\w+\s*=").unwrap(),
        Regex::new(r"(?i)<iframe[\s>]").unwrap(),
        Regex::new(r"(?i)<object[\s>]").unwrap(),
        Regex::new(r"(?i)<embed[\s>]").unwrap(),
        Regex::new(r"(?i)<link[\s>]").unwrap(),
        Regex::new(r"(?i)expression\s*\(").unwrap(),
        Regex::new(r"(?i)vbscript\s*:").unwrap(),
        Regex::new(r"(?i)data\s*:\s*text/html").unwrap(),
    ]
});

static COMMAND_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"[;&|`$]").unwrap(),
        Regex::new(r"\.\./").unwrap(),
        Regex::new(r"(?i)\b(cat|ls|rm|mv|cp|chmod|chown|wget|curl|bash|sh|nc|netcat)\s").unwrap(),
    ]
});

static EMAIL_VALIDATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());
static PHONE_VALIDATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\d\s+\-().]{6,20}$").unwrap());
static NUMBER_VALIDATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+(\.\d+)?$").unwrap());
static URL_VALIDATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^https?://[^\s<>"']+$"#).unwrap());

static NON_EMAIL_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w.@+\-]").unwrap());
static NON_PHONE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d\s+\-().]").unwrap());
static NON_NUMBER_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d.\-]").unwrap());
static HTML_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<[^>]*>").unwrap());

pub fn detect_sql_injection(value: &str) -> bool {
    SQL_PATTERNS.iter().any(|re| re.is_match(value))
}

pub fn detect_xss(value: &str) -> bool {
    XSS_PATTERNS.iter().any(|re| re.is_match(value))
}

pub fn detect_command_injection(value: &str) -> bool {
    COMMAND_PATTERNS.iter().any(|re| re.is_match(value))
}

/// Strips HTML tags, unescapes entities, then strips again (handles
/// double-encoded payloads), and applies a per-type character whitelist.
pub fn sanitize_value(value: &str, field_type: FieldType) -> String {
    let normalized: String = value.nfc().collect();
    let normalized = normalized.replace('\0', "");
    let stripped = HTML_TAG_RE.replace_all(&normalized, "").into_owned();
    let unescaped = html_escape::decode_html_entities(&stripped).into_owned();
    let stripped_again = HTML_TAG_RE.replace_all(&unescaped, "").into_owned();

    let cleaned = match field_type {
        FieldType::Email => NON_EMAIL_CHARS.replace_all(&stripped_again, "").into_owned(),
        FieldType::Phone => NON_PHONE_CHARS.replace_all(&stripped_again, "").into_owned(),
        FieldType::Number => NON_NUMBER_CHARS.replace_all(&stripped_again, "").into_owned(),
        FieldType::Url => {
            if stripped_again.starts_with("http://") || stripped_again.starts_with("https://") {
                stripped_again
            } else {
                String::new()
            }
        }
        FieldType::Text => stripped_again,
    };

    cleaned.trim().to_string()
}

pub fn validate_field_type(value: &str, field_type: FieldType) -> bool {
    match field_type {
        FieldType::Email => EMAIL_VALIDATOR.is_match(value),
        FieldType::Phone => PHONE_VALIDATOR.is_match(value),
        FieldType::Number => NUMBER_VALIDATOR.is_match(value),
        FieldType::Url => URL_VALIDATOR.is_match(value),
        FieldType::Text => true,
    }
}

use unicode_normalization::UnicodeNormalization;

pub struct InputSanitizer;

impl InputSanitizer {
    pub fn new() -> Self {
        InputSanitizer
    }

    /// Sanitizes and validates raw POST data against field rules. Unknown
    /// keys are silently dropped. Returns (sanitized, errors) — a field with
    /// an error is simply absent from the sanitized map.
    pub fn sanitize_and_validate(
        &self,
        data: &std::collections::HashMap<String, String>,
        field_rules: &[RuleField],
    ) -> (std::collections::HashMap<String, String>, Vec<String>) {
        let mut sanitized = std::collections::HashMap::new();
        let mut errors = Vec::new();

        for rule in field_rules {
            let raw_value = data.get(&rule.field_name).cloned().unwrap_or_default();

            if rule.required && raw_value.is_empty() {
                errors.push(format!("Field '{}' is required", rule.field_name));
                continue;
            }
            if raw_value.is_empty() {
                continue;
            }
            if raw_value.len() > rule.max_length {
                errors.push(format!("Field '{}' exceeds max length ({})", rule.field_name, rule.max_length));
                continue;
            }
            if detect_sql_injection(&raw_value) || detect_xss(&raw_value) {
                errors.push(format!("Field '{}' contains potentially dangerous content", rule.field_name));
                continue;
            }

            let clean_value = sanitize_value(&raw_value, rule.field_type);

            if !validate_field_type(&clean_value, rule.field_type) {
                errors.push(format!("Field '{}' has invalid format for type '{}'", rule.field_name, rule.field_type.as_str()));
                continue;
            }

            if let Some(pattern) = &rule.validation_regex {
                if let Ok(re) = Regex::new(pattern) {
                    if !re.is_match(&clean_value) {
                        errors.push(format!("Field '{}' does not match required pattern", rule.field_name));
                        continue;
                    }
                }
            }

            sanitized.insert(rule.field_name.clone(), clean_value);
        }

        (sanitized, errors)
    }
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_sql_injection() {
        assert!(detect_sql_injection("1 OR 1=1"));
        assert!(detect_sql_injection("' OR '1'='1"));
        assert!(!detect_sql_injection("hello world"));
    }

    #[test]
    fn detects_xss() {
        assert!(detect_xss("<script>alert(1)</script>"));
        assert!(detect_xss("javascript:alert(1)"));
        assert!(!detect_xss("plain text"));
    }

    #[test]
    fn detects_command_injection() {
        assert!(detect_command_injection("; rm -rf /"));
        assert!(!detect_command_injection("normal input"));
    }

    #[test]
    fn sanitizes_html_out_of_text() {
        let out = sanitize_value("<b>hi</b>", FieldType::Text);
        assert_eq!(out, "hi");
    }

    #[test]
    fn email_field_strips_invalid_chars() {
        let out = sanitize_value("john doe<script>@example.com", FieldType::Email);
        assert!(!out.contains('<'));
    }

    #[test]
    fn url_field_rejects_non_http() {
        assert_eq!(sanitize_value("javascript:alert(1)", FieldType::Url), "");
    }

    #[test]
    fn validate_email_format() {
        assert!(validate_field_type("a@b.com", FieldType::Email));
        assert!(!validate_field_type("not-an-email", FieldType::Email));
    }

    #[test]
    fn sanitize_and_validate_rejects_unrequired_missing_field() {
        let sanitizer = InputSanitizer::new();
        let rules = vec![RuleField {
            field_name: "name".into(),
            field_type: FieldType::Text,
            required: false,
            max_length: 50,
            validation_regex: None,
        }];
        let data = std::collections::HashMap::new();
        let (sanitized, errors) = sanitizer.sanitize_and_validate(&data, &rules);
        assert!(sanitized.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn sanitize_and_validate_flags_required_missing() {
        let sanitizer = InputSanitizer::new();
        let rules = vec![RuleField {
            field_name: "email".into(),
            field_type: FieldType::Email,
            required: true,
            max_length: 254,
            validation_regex: None,
        }];
        let data = std::collections::HashMap::new();
        let (_, errors) = sanitizer.sanitize_and_validate(&data, &rules);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn sanitize_and_validate_blocks_sql_payload() {
        let sanitizer = InputSanitizer::new();
        let rules = vec![RuleField {
            field_name: "msg".into(),
            field_type: FieldType::Text,
            required: false,
            max_length: 1000,
            validation_regex: None,
        }];
        let mut data = std::collections::HashMap::new();
        data.insert("msg".to_string(), "1; DROP TABLE users".to_string());
        let (sanitized, errors) = sanitizer.sanitize_and_validate(&data, &rules);
        assert!(sanitized.is_empty());
        assert_eq!(errors.len(), 1);
    }
}
