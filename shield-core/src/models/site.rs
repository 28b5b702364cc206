use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A protected legacy origin the Shield mirrors and fronts.
///
/// `cache_dir(site) = <cache_root>/<site.id>` is the sole writer contract:
/// only the Crawler Engine (during a run) and this site's Asset Learner
/// ever write under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub target_url: String,
    pub internal_url: Option<String>,
    pub override_host: Option<String>,

    pub crawl_max_concurrency: usize,
    pub crawl_delay_ms: u64,
    pub crawl_max_pages: usize,
    pub crawl_respect_robots: bool,

    pub waf_enabled: bool,
    pub waf_block_bots: bool,
    pub waf_block_suspicious_paths: bool,
    pub max_body_size: usize,
    pub ip_allowlist: HashSet<String>,
    pub ip_blocklist: HashSet<String>,
    pub blocked_countries: HashSet<String>,
    pub custom_suspicious_patterns: Vec<String>,

    pub learn_mode_post: bool,
    pub learn_mode_csp: bool,

    pub shield_port: Option<u16>,
    pub shield_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    pub fn new(id: impl Into<String>, name: impl Into<String>, target_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Site {
            id: id.into(),
            name: name.into(),
            target_url: target_url.into(),
            internal_url: None,
            override_host: None,
            crawl_max_concurrency: 5,
            crawl_delay_ms: 500,
            crawl_max_pages: 10_000,
            crawl_respect_robots: true,
            waf_enabled: true,
            waf_block_bots: true,
            waf_block_suspicious_paths: true,
            max_body_size: 1_048_576,
            ip_allowlist: HashSet::new(),
            ip_blocklist: HashSet::new(),
            blocked_countries: HashSet::new(),
            custom_suspicious_patterns: Vec::new(),
            learn_mode_post: false,
            learn_mode_csp: false,
            shield_port: None,
            shield_active: false,
            created_at: now,
            updated_at: now,
        }
    }
}
