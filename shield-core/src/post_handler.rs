//! POST Handler: rule match, per-endpoint rate limit, injection scan,
//! sanitizer, and origin forwarding for POST requests hitting a site's
//! shield listener (spec.md §4.10).

use std::collections::HashMap;
use std::time::Duration;

use actix_web::{http::header, HttpRequest, HttpResponse};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use uuid::Uuid;

use crate::db::Database;
use crate::events::SecurityEventCollector;
use crate::models::{FieldType, PostRule, RuleField, Severity};
use crate::rate_limiter::RateLimiter;
use crate::sanitizer::InputSanitizer;

const FORWARD_TIMEOUT_SECS: u64 = 30;
const LEARN_LOG_MAX: usize = 500;

static ADMIN_AJAX_PATHS: &[&str] = &["/wp-admin/admin-ajax.php", "/wp-admin/admin-post.php"];

static SUSPICIOUS_PARAM_NAMES: &[&str] =
    &["file", "path", "loop-file", "template", "page", "doc", "document", "include", "filename"];

static LFI_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\.\./").unwrap(),
        Regex::new(r"(?i)php://").unwrap(),
        Regex::new(r"(?i)/etc/passwd").unwrap(),
        Regex::new(r"(?i)wp-config\.php").unwrap(),
        Regex::new(r"(?i)\.\.\\").unwrap(),
        Regex::new(r"(?i)file://").unwrap(),
        Regex::new(r"(?i)data://").unwrap(),
    ]
});

/// Resolves the client IP the same way across the WAF and the POST handler:
/// `CF-Connecting-IP` > `X-Real-IP` > first hop of `X-Forwarded-For` > peer addr.
pub fn resolve_client_ip(req: &HttpRequest) -> String {
    if let Some(v) = header_str(req, "cf-connecting-ip") {
        return v;
    }
    if let Some(v) = header_str(req, "x-real-ip") {
        return v;
    }
    if let Some(v) = header_str(req, "x-forwarded-for") {
        if let Some(first) = v.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    req.peer_addr().map(|a| a.ip().to_string()).unwrap_or_else(|| "0.0.0.0".to_string())
}

fn header_str(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers().get(name).and_then(|v| v.to_str().ok()).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, serde::Serialize)]
struct LearnLogEntry {
    path: String,
    fields: Vec<String>,
    action: Option<String>,
}

enum ParseError {
    UnsupportedMediaType,
    BadRequest,
}

enum Verdict {
    Proceed,
    Reject(HttpResponse),
}

/// Per-site POST rule engine: matching, rate limiting, scanning, forwarding.
pub struct PostHandler {
    site_id: String,
    target_url: String,
    internal_url: Option<String>,
    override_host: Option<String>,
    db: Database,
    events: SecurityEventCollector,
    rules: RwLock<Vec<PostRule>>,
    rate_limiter: RateLimiter,
    sanitizer: InputSanitizer,
    learn_mode: bool,
    client: reqwest::Client,
    learn_log: Mutex<Vec<LearnLogEntry>>,
}

impl PostHandler {
    pub fn new(
        site_id: impl Into<String>,
        target_url: impl Into<String>,
        internal_url: Option<String>,
        override_host: Option<String>,
        learn_mode: bool,
        db: Database,
        events: SecurityEventCollector,
        rules: Vec<PostRule>,
    ) -> Self {
        PostHandler {
            site_id: site_id.into(),
            target_url: target_url.into(),
            internal_url,
            override_host,
            db,
            events,
            rules: RwLock::new(rules),
            rate_limiter: RateLimiter::new(30, 60),
            sanitizer: InputSanitizer::new(),
            learn_mode,
            client: reqwest::Client::new(),
            learn_log: Mutex::new(Vec::new()),
        }
    }

    pub fn has_matching_rule(&self, path: &str) -> bool {
        self.find_rule(path).is_some()
    }

    /// Snapshot of unregistered POST paths observed while learn mode is on.
    pub fn learn_log(&self) -> serde_json::Value {
        serde_json::json!(self.learn_log.lock().clone())
    }

    fn find_rule(&self, path: &str) -> Option<PostRule> {
        let rules = self.rules.read();
        if let Some(rule) = rules.iter().find(|r| r.is_active && r.url_pattern == path) {
            return Some(rule.clone());
        }
        rules
            .iter()
            .filter(|r| r.is_active && r.url_pattern != path)
            .find(|r| {
                Regex::new(&format!("(?i)^(?:{})$", r.url_pattern)).map(|re| re.is_match(path)).unwrap_or(false)
            })
            .cloned()
    }

    pub async fn handle(&self, req: &HttpRequest, body: actix_web::web::Bytes) -> HttpResponse {
        let client_ip = resolve_client_ip(req);
        let path = req.path().to_string();
        let user_agent = header_str(req, "user-agent").unwrap_or_default();

        let rule = match self.find_rule(&path) {
            Some(rule) => rule,
            None if self.learn_mode => self.learn_and_register(&path, &body, req).await,
            None => {
                self.events.emit(
                    Some(self.site_id.clone()),
                    "post_unregistered",
                    Severity::Low,
                    client_ip,
                    path,
                    "POST",
                    user_agent,
                    serde_json::json!({}),
                    None,
                    true,
                );
                return canonical_response(405, "post_unregistered");
            }
        };

        if !self.rate_limiter.check_endpoint(&client_ip, &rule.url_pattern, rule.rate_limit_requests, rule.rate_limit_window_secs) {
            self.events.emit(
                Some(self.site_id.clone()),
                "rate_limited",
                Severity::Medium,
                client_ip,
                path,
                "POST",
                user_agent,
                serde_json::json!({}),
                None,
                true,
            );
            return canonical_response(429, "rate_limited");
        }

        let raw_data = match self.parse_body(req, &body) {
            Ok(data) => data,
            Err(ParseError::UnsupportedMediaType) => return canonical_response(415, "unsupported_media_type"),
            Err(ParseError::BadRequest) => return canonical_response(400, "malformed_body"),
        };

        if let Verdict::Reject(resp) = self.scan_injection(&client_ip, &path, &user_agent, &raw_data) {
            return resp;
        }

        if let Verdict::Reject(resp) = self.check_admin_ajax(&client_ip, &path, &user_agent, &rule, &raw_data) {
            return resp;
        }

        if let Some(field) = &rule.honeypot_field {
            if raw_data.get(field).map(|v| !v.is_empty()).unwrap_or(false) {
                self.events.emit(
                    Some(self.site_id.clone()),
                    "honeypot_triggered",
                    Severity::Critical,
                    client_ip,
                    path,
                    "POST",
                    user_agent,
                    serde_json::json!({"field": field}),
                    None,
                    true,
                );
                return self.success_response(&rule);
            }
        }

        let (_sanitized, errors) = self.sanitizer.sanitize_and_validate(&raw_data, &rule.fields);
        if !errors.is_empty() {
            return HttpResponse::UnprocessableEntity().json(serde_json::json!({"status": "error", "errors": errors}));
        }

        self.forward(req, body, &rule).await
    }

    fn scan_injection(&self, client_ip: &str, path: &str, user_agent: &str, data: &HashMap<String, String>) -> Verdict {
        for (name, value) in data {
            let decoded = deep_decode(value);

            if decoded.contains('\0') || value.contains("%00") || value.to_ascii_lowercase().contains("\\x00") {
                self.events.emit(
                    Some(self.site_id.clone()),
                    "null_byte_blocked",
                    Severity::Critical,
                    client_ip.to_string(),
                    path.to_string(),
                    "POST",
                    user_agent.to_string(),
                    serde_json::json!({"field": name}),
                    None,
                    true,
                );
                return Verdict::Reject(canonical_response(403, "null_byte_blocked"));
            }

            if LFI_PATTERNS.iter().any(|re| re.is_match(&decoded)) {
                let event_type = if SUSPICIOUS_PARAM_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
                    "lfi_suspicious_param"
                } else {
                    "lfi_value"
                };
                self.events.emit(
                    Some(self.site_id.clone()),
                    event_type,
                    Severity::Critical,
                    client_ip.to_string(),
                    path.to_string(),
                    "POST",
                    user_agent.to_string(),
                    serde_json::json!({"field": name}),
                    None,
                    true,
                );
                return Verdict::Reject(canonical_response(403, "post_injection_blocked"));
            }
        }
        Verdict::Proceed
    }

    fn check_admin_ajax(&self, client_ip: &str, path: &str, user_agent: &str, rule: &PostRule, data: &HashMap<String, String>) -> Verdict {
        if !ADMIN_AJAX_PATHS.contains(&path) || rule.allowed_actions.is_empty() {
            return Verdict::Proceed;
        }
        let action = data.get("action").map(|s| s.to_ascii_lowercase());
        let allowed = action
            .as_ref()
            .map(|a| rule.allowed_actions.iter().any(|x| x.to_ascii_lowercase() == *a))
            .unwrap_or(false);
        if allowed {
            Verdict::Proceed
        } else {
            self.events.emit(
                Some(self.site_id.clone()),
                "post_action_blocked",
                Severity::High,
                client_ip.to_string(),
                path.to_string(),
                "POST",
                user_agent.to_string(),
                serde_json::json!({"action": action}),
                None,
                true,
            );
            Verdict::Reject(canonical_response(403, "post_action_blocked"))
        }
    }

    fn parse_body(&self, req: &HttpRequest, body: &[u8]) -> Result<HashMap<String, String>, ParseError> {
        let content_type = header_str(req, "content-type").unwrap_or_default();

        if content_type.starts_with("application/x-www-form-urlencoded") {
            let mut map = HashMap::new();
            for (k, v) in url::form_urlencoded::parse(body) {
                map.insert(k.into_owned(), v.into_owned());
            }
            Ok(map)
        } else if content_type.starts_with("multipart/form-data") {
            let boundary = content_type
                .split(';')
                .find_map(|part| part.trim().strip_prefix("boundary="))
                .map(|b| b.trim_matches('"').to_string())
                .ok_or(ParseError::BadRequest)?;
            parse_multipart(body, &boundary).ok_or(ParseError::BadRequest)
        } else if content_type.starts_with("application/json") {
            let value: serde_json::Value = serde_json::from_slice(body).map_err(|_| ParseError::BadRequest)?;
            let obj = value.as_object().ok_or(ParseError::BadRequest)?;
            let mut map = HashMap::new();
            for (k, v) in obj {
                let s = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                map.insert(k.clone(), s);
            }
            Ok(map)
        } else {
            Err(ParseError::UnsupportedMediaType)
        }
    }

    async fn learn_and_register(&self, path: &str, body: &[u8], req: &HttpRequest) -> PostRule {
        let data = self.parse_body(req, body).unwrap_or_default();
        let is_admin_ajax = ADMIN_AJAX_PATHS.contains(&path);
        let action = if is_admin_ajax { data.get("action").cloned() } else { None };

        {
            let mut log = self.learn_log.lock();
            if !log.iter().any(|e| e.path == path) {
                if log.len() >= LEARN_LOG_MAX {
                    log.remove(0);
                }
                log.push(LearnLogEntry {
                    path: path.to_string(),
                    fields: data.keys().cloned().collect(),
                    action: action.clone(),
                });
            }
        }

        if is_admin_ajax {
            if let Some(mut existing) = self.find_rule(path) {
                if let Some(action) = &action {
                    if !existing.allowed_actions.iter().any(|a| a.eq_ignore_ascii_case(action)) {
                        existing.allowed_actions.push(action.clone());
                        let _ = self.db.update_post_rule_allowed_actions(&existing.id, &existing.allowed_actions);
                        let mut rules = self.rules.write();
                        if let Some(r) = rules.iter_mut().find(|r| r.id == existing.id) {
                            r.allowed_actions = existing.allowed_actions.clone();
                        }
                    }
                }
                return existing;
            }
        }

        let fields: Vec<RuleField> = data
            .keys()
            .map(|name| RuleField { field_name: name.clone(), field_type: FieldType::Text, required: false, max_length: 1000, validation_regex: None })
            .collect();

        let rule = PostRule {
            id: Uuid::new_v4().to_string(),
            site_id: self.site_id.clone(),
            url_pattern: path.to_string(),
            forward_to: path.to_string(),
            rate_limit_requests: 30,
            rate_limit_window_secs: 60,
            honeypot_field: None,
            allowed_actions: if is_admin_ajax { action.into_iter().collect() } else { Vec::new() },
            success_redirect: None,
            success_message: "Thank you.".to_string(),
            is_active: true,
            fields,
        };

        let _ = self.db.insert_post_rule(&rule);
        self.rules.write().push(rule.clone());
        log::info!("learned POST rule for {path}");
        rule
    }

    fn success_response(&self, rule: &PostRule) -> HttpResponse {
        if let Some(redirect) = &rule.success_redirect {
            if self.is_same_origin(redirect) {
                return HttpResponse::SeeOther().insert_header((header::LOCATION, redirect.as_str())).finish();
            }
        }
        let escaped = html_escape::encode_text(&rule.success_message);
        HttpResponse::Ok().content_type("text/html; charset=utf-8").body(format!("<html><body>{escaped}</body></html>"))
    }

    fn is_same_origin(&self, url: &str) -> bool {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return true;
        }
        match (url::Url::parse(url), url::Url::parse(&self.target_url)) {
            (Ok(a), Ok(b)) => a.host_str() == b.host_str(),
            _ => false,
        }
    }

    async fn forward(&self, req: &HttpRequest, body: actix_web::web::Bytes, rule: &PostRule) -> HttpResponse {
        let base = self.internal_url.as_deref().unwrap_or(&self.target_url);
        let url = format!("{}{}", base.trim_end_matches('/'), req.path());

        let mut builder = self.client.post(&url).timeout(Duration::from_secs(FORWARD_TIMEOUT_SECS)).body(body.to_vec());

        if let Some(ct) = header_str(req, "content-type") {
            builder = builder.header(header::CONTENT_TYPE.as_str(), ct);
        }
        builder = builder.header("X-Forwarded-For", resolve_client_ip(req));
        builder = builder.header("X-Forwarded-Proto", req.connection_info().scheme().to_string());
        let forwarded_host = self.override_host.clone().unwrap_or_else(|| req.connection_info().host().to_string());
        builder = builder.header("X-Forwarded-Host", forwarded_host);
        if let Some(ua) = header_str(req, "user-agent") {
            builder = builder.header(header::USER_AGENT.as_str(), ua);
        }
        if let Some(xrw) = header_str(req, "x-requested-with") {
            builder = builder.header("X-Requested-With", xrw);
        }
        if let Some(accept) = header_str(req, "accept") {
            builder = builder.header(header::ACCEPT.as_str(), accept);
        }
        if let Some(host) = &self.override_host {
            builder = builder.header(header::HOST.as_str(), host.as_str());
        }

        let resp = match builder.send().await {
            Ok(r) => r,
            Err(err) if err.is_timeout() => return canonical_response(504, "forward_timeout"),
            Err(_) => return canonical_response(502, "forward_failed"),
        };

        let status = actix_web::http::StatusCode::from_u16(resp.status().as_u16()).unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);
        let mut out = HttpResponse::build(status);
        for (name, value) in resp.headers() {
            let lower = name.as_str().to_ascii_lowercase();
            if matches!(lower.as_str(), "transfer-encoding" | "content-encoding" | "connection") {
                continue;
            }
            if let Ok(v) = value.to_str() {
                out.insert_header((name.as_str(), v));
            }
        }
        let bytes = resp.bytes().await.unwrap_or_default();
        let _ = rule;
        out.body(bytes)
    }
}

fn canonical_response(status: u16, event_type: &str) -> HttpResponse {
    let code = actix_web::http::StatusCode::from_u16(status).unwrap_or(actix_web::http::StatusCode::BAD_REQUEST);
    HttpResponse::build(code).json(serde_json::json!({"status": "blocked", "reason": event_type}))
}

fn deep_decode(value: &str) -> String {
    let mut current = value.to_string();
    for _ in 0..3 {
        let decoded = percent_encoding::percent_decode_str(&current).decode_utf8_lossy().into_owned();
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

fn parse_multipart(body: &[u8], boundary: &str) -> Option<HashMap<String, String>> {
    let delimiter = format!("--{boundary}");
    let text = String::from_utf8_lossy(body);
    let mut map = HashMap::new();

    for part in text.split(&delimiter) {
        let part = part.trim_start_matches("\r\n").trim_end_matches("\r\n");
        if part.is_empty() || part == "--" {
            continue;
        }
        let Some((headers, value)) = part.split_once("\r\n\r\n") else { continue };
        if headers.to_ascii_lowercase().contains("filename=") {
            continue;
        }
        let name = headers
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with("content-disposition:"))
            .and_then(|line| line.split("name=\"").nth(1))
            .and_then(|rest| rest.split('"').next());
        if let Some(name) = name {
            map.insert(name.to_string(), value.trim_end_matches("--").trim_end_matches("\r\n").to_string());
        }
    }
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(learn_mode: bool, rules: Vec<PostRule>) -> PostHandler {
        let db = Database::open_in_memory().unwrap();
        let events = SecurityEventCollector::new(db.clone());
        PostHandler::new("site-1", "https://origin.example", None, None, learn_mode, db, events, rules)
    }

    fn rule() -> PostRule {
        PostRule {
            id: "r1".into(),
            site_id: "site-1".into(),
            url_pattern: "/contact".into(),
            forward_to: "/contact".into(),
            rate_limit_requests: 10,
            rate_limit_window_secs: 60,
            honeypot_field: Some("website".into()),
            allowed_actions: vec![],
            success_redirect: None,
            success_message: "Thanks!".into(),
            is_active: true,
            fields: vec![RuleField { field_name: "email".into(), field_type: FieldType::Email, required: true, max_length: 254, validation_regex: None }],
        }
    }

    #[test]
    fn literal_match_wins_over_regex() {
        let h = handler(false, vec![rule()]);
        assert!(h.has_matching_rule("/contact"));
        assert!(!h.has_matching_rule("/unregistered"));
    }

    #[test]
    fn deep_decode_unwraps_double_encoding() {
        assert_eq!(deep_decode("%252e%252e%252f"), "../");
    }

    #[test]
    fn lfi_pattern_detects_traversal() {
        assert!(LFI_PATTERNS.iter().any(|re| re.is_match("../../etc/passwd")));
        assert!(!LFI_PATTERNS.iter().any(|re| re.is_match("hello world")));
    }

    #[test]
    fn parse_multipart_drops_file_parts() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"msg\"\r\n\r\nhello\r\n--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\r\nDATA\r\n--B--\r\n";
        let map = parse_multipart(body, "B").unwrap();
        assert_eq!(map.get("msg").map(|s| s.as_str()), Some("hello"));
        assert!(!map.contains_key("f"));
    }
}
