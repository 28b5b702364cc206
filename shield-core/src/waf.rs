//! Web Application Firewall: fixed-order filter chain evaluated per request.
//!
//! Static assets skip every check except IP/geo blocking, since they carry
//! no attacker-controlled semantics worth inspecting and are the hot path.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::rate_limiter::RateLimiter;

static BOT_WORDS: &[&str] =
    &["sqlmap", "nikto", "nessus", "masscan", "dirbuster", "gobuster", "nmap", "havij", "w3af", "acunetix"];
static MALICIOUS_BOT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("(?i){}", BOT_WORDS.join("|"))).unwrap());

static SUSPICIOUS_PATH_WORDS: &[&str] = &[
    r"\.\./",
    r"\.\.\\",
    r"%2e%2e",
    r"%252e",
    r"/etc/passwd",
    r"/proc/self",
    r"wp-admin",
    r"wp-login\.php",
    r"xmlrpc\.php",
    r"wp-config",
    r"\.git/",
    r"\.env",
    r"phpmyadmin",
];
static SUSPICIOUS_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("(?i){}", SUSPICIOUS_PATH_WORDS.join("|"))).unwrap());

pub static STATIC_ASSET_EXTENSIONS: &[&str] = &[
    "css", "js", "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico", "woff", "woff2", "ttf",
    "eot", "otf", "map", "pdf", "mp4", "webm", "mp3", "ogg",
];

fn build_combined_re(custom: &[String]) -> Regex {
    if custom.is_empty() {
        return SUSPICIOUS_PATH_RE.clone();
    }
    let escaped: Vec<String> = custom.iter().map(|p| regex::escape(p)).collect();
    let combined = format!("{}|{}", SUSPICIOUS_PATH_RE.as_str(), escaped.join("|"));
    Regex::new(&format!("(?i){combined}")).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WafVerdict {
    Allow,
    BlockIpBlacklisted,
    BlockGeo { country: String },
    BlockBot,
    BlockRateLimited,
    BlockSuspiciousPath,
    BlockSuspiciousQuery,
    BlockPayloadTooLarge,
    BlockMalformedLength,
}

impl WafVerdict {
    pub fn is_blocked(&self) -> bool {
        !matches!(self, WafVerdict::Allow)
    }

    pub fn status_code(&self) -> u16 {
        match self {
            WafVerdict::Allow => 200,
            WafVerdict::BlockIpBlacklisted | WafVerdict::BlockGeo { .. } | WafVerdict::BlockBot | WafVerdict::BlockSuspiciousPath | WafVerdict::BlockSuspiciousQuery => 403,
            WafVerdict::BlockRateLimited => 429,
            WafVerdict::BlockPayloadTooLarge => 413,
            WafVerdict::BlockMalformedLength => 400,
        }
    }

    pub fn severity(&self) -> crate::models::Severity {
        use crate::models::Severity;
        match self {
            WafVerdict::Allow => Severity::Low,
            WafVerdict::BlockIpBlacklisted => Severity::Critical,
            WafVerdict::BlockGeo { .. } => Severity::High,
            WafVerdict::BlockBot => Severity::High,
            WafVerdict::BlockRateLimited => Severity::Medium,
            WafVerdict::BlockSuspiciousPath => Severity::High,
            WafVerdict::BlockSuspiciousQuery => Severity::High,
            WafVerdict::BlockPayloadTooLarge => Severity::Medium,
            WafVerdict::BlockMalformedLength => Severity::Medium,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            WafVerdict::Allow => "",
            WafVerdict::BlockIpBlacklisted => "ip_blacklisted",
            WafVerdict::BlockGeo { .. } => "country_blocked",
            WafVerdict::BlockBot => "bot_blocked",
            WafVerdict::BlockRateLimited => "rate_limited",
            WafVerdict::BlockSuspiciousPath => "suspicious_path",
            WafVerdict::BlockSuspiciousQuery => "suspicious_query",
            WafVerdict::BlockPayloadTooLarge => "payload_too_large",
            WafVerdict::BlockMalformedLength => "",
        }
    }
}

pub fn is_static_asset(path: &str) -> bool {
    path.rfind('.')
        .map(|dot| STATIC_ASSET_EXTENSIONS.contains(&path[dot + 1..].to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub struct WafContext<'a> {
    pub path: &'a str,
    pub query: &'a str,
    pub method: &'a str,
    pub user_agent: &'a str,
    pub client_ip: &'a str,
    pub country: Option<&'a str>,
    pub content_length: Option<u64>,
    pub post_has_matching_rule: bool,
    pub learn_mode_post: bool,
}

/// WAF configuration for one deployed site.
pub struct Waf {
    pub enabled: bool,
    pub block_bots: bool,
    pub block_suspicious_paths: bool,
    pub max_body_size: u64,
    pub ip_allowlist: HashSet<String>,
    pub ip_blocklist: HashSet<String>,
    pub blocked_countries: HashSet<String>,
    suspicious_re: Regex,
}

impl Waf {
    pub fn new(
        block_bots: bool,
        block_suspicious_paths: bool,
        max_body_size: u64,
        ip_allowlist: HashSet<String>,
        ip_blocklist: HashSet<String>,
        blocked_countries: HashSet<String>,
        custom_blocked_patterns: Vec<String>,
    ) -> Self {
        Waf {
            enabled: true,
            block_bots,
            block_suspicious_paths,
            max_body_size,
            ip_allowlist,
            ip_blocklist,
            blocked_countries,
            suspicious_re: build_combined_re(&custom_blocked_patterns),
        }
    }

    fn has_ip_checks(&self) -> bool {
        !self.ip_blocklist.is_empty() || !self.ip_allowlist.is_empty()
    }

    fn has_geo_checks(&self) -> bool {
        !self.blocked_countries.is_empty()
    }

    /// Evaluates the fixed-order filter chain: IP blacklist, geo, bot,
    /// rate limit, suspicious path/query, payload size.
    pub fn evaluate(&self, ctx: &WafContext, rate_limiter: Option<&RateLimiter>) -> WafVerdict {
        if !self.enabled {
            return WafVerdict::Allow;
        }

        let is_static = ctx.method == "GET" && is_static_asset(ctx.path);
        if is_static && !self.has_ip_checks() && !self.has_geo_checks() {
            return WafVerdict::Allow;
        }

        if !self.ip_blocklist.is_empty() && self.ip_blocklist.contains(ctx.client_ip) {
            return WafVerdict::BlockIpBlacklisted;
        }

        if self.has_geo_checks() {
            if let Some(country) = ctx.country {
                if self.blocked_countries.contains(country) {
                    return WafVerdict::BlockGeo { country: country.to_string() };
                }
            }
        }

        if is_static {
            return WafVerdict::Allow;
        }

        if self.block_bots && MALICIOUS_BOT_RE.is_match(ctx.user_agent) {
            return WafVerdict::BlockBot;
        }

        if let Some(limiter) = rate_limiter {
            if !limiter.check_global(ctx.client_ip) {
                return WafVerdict::BlockRateLimited;
            }
        }

        if self.block_suspicious_paths && self.suspicious_re.is_match(ctx.path) {
            let post_allowed = ctx.method == "POST" && (ctx.post_has_matching_rule || ctx.learn_mode_post);
            if !post_allowed {
                return WafVerdict::BlockSuspiciousPath;
            }
        }

        if !ctx.query.is_empty() && self.block_suspicious_paths && self.suspicious_re.is_match(ctx.query) {
            return WafVerdict::BlockSuspiciousQuery;
        }

        if let Some(len) = ctx.content_length {
            if len > self.max_body_size {
                return WafVerdict::BlockPayloadTooLarge;
            }
        }

        WafVerdict::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(path: &'a str, query: &'a str, method: &'a str, ua: &'a str) -> WafContext<'a> {
        WafContext {
            path,
            query,
            method,
            user_agent: ua,
            client_ip: "1.2.3.4",
            country: None,
            content_length: None,
            post_has_matching_rule: false,
            learn_mode_post: false,
        }
    }

    fn waf() -> Waf {
        Waf::new(true, true, 1_048_576, HashSet::new(), HashSet::new(), HashSet::new(), vec![])
    }

    #[test]
    fn allows_plain_request() {
        let w = waf();
        let c = ctx("/about", "", "GET", "Mozilla/5.0");
        assert_eq!(w.evaluate(&c, None), WafVerdict::Allow);
    }

    #[test]
    fn blocks_known_bot_user_agent() {
        let w = waf();
        let c = ctx("/about", "", "GET", "sqlmap/1.0");
        assert_eq!(w.evaluate(&c, None), WafVerdict::BlockBot);
    }

    #[test]
    fn blocks_path_traversal() {
        let w = waf();
        let c = ctx("/../etc/passwd", "", "GET", "curl/8.0");
        assert_eq!(w.evaluate(&c, None), WafVerdict::BlockSuspiciousPath);
    }

    #[test]
    fn static_assets_skip_checks_when_no_ip_or_geo_rules() {
        let w = waf();
        let c = ctx("/wp-admin/style.css", "", "GET", "sqlmap/1.0");
        assert_eq!(w.evaluate(&c, None), WafVerdict::Allow);
    }

    #[test]
    fn post_with_matching_rule_bypasses_suspicious_path_block() {
        let w = waf();
        let mut c = ctx("/wp-login.php", "", "POST", "Mozilla/5.0");
        c.post_has_matching_rule = true;
        assert_eq!(w.evaluate(&c, None), WafVerdict::Allow);
    }

    #[test]
    fn blocks_blacklisted_ip_even_for_static() {
        let mut blocklist = HashSet::new();
        blocklist.insert("1.2.3.4".to_string());
        let w = Waf::new(true, true, 1_048_576, HashSet::new(), blocklist, HashSet::new(), vec![]);
        let c = ctx("/style.css", "", "GET", "Mozilla/5.0");
        assert_eq!(w.evaluate(&c, None), WafVerdict::BlockIpBlacklisted);
    }

    #[test]
    fn blocks_oversized_payload() {
        let w = waf();
        let mut c = ctx("/contact", "", "POST", "Mozilla/5.0");
        c.post_has_matching_rule = true;
        c.content_length = Some(2_000_000);
        assert_eq!(w.evaluate(&c, None), WafVerdict::BlockPayloadTooLarge);
    }

    #[test]
    fn custom_blocked_pattern_is_merged() {
        let w = Waf::new(true, true, 1_048_576, HashSet::new(), HashSet::new(), HashSet::new(), vec!["/secret-panel".to_string()]);
        let c = ctx("/secret-panel", "", "GET", "Mozilla/5.0");
        assert_eq!(w.evaluate(&c, None), WafVerdict::BlockSuspiciousPath);
    }
}
