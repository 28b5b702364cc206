//! Fetches and caches assets the crawler never saw, the moment a request
//! for them actually arrives (spec.md §4.9).
//!
//! One learner per deployed site. `_pending` dedup means two near-simultaneous
//! misses for the same path only ever trigger one origin fetch; the loser
//! just gets a 404 and the next request finds the file the winner wrote.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use crate::url_rewriter::UrlRewriter;

const FETCH_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Serialize)]
pub struct LearnedAsset {
    pub path: String,
    pub content_type: String,
    pub size: usize,
    pub timestamp: chrono::DateTime<Utc>,
}

pub struct AssetLearner {
    site_id: String,
    target_url: String,
    internal_url: Option<String>,
    override_host: String,
    cache_dir: PathBuf,
    rewriter: UrlRewriter,
    client: reqwest::Client,
    enabled: Mutex<bool>,
    pending: Mutex<HashSet<String>>,
    learned_assets: Mutex<Vec<LearnedAsset>>,
}

impl AssetLearner {
    pub fn new(
        site_id: impl Into<String>,
        target_url: impl Into<String>,
        cache_dir: PathBuf,
        internal_url: Option<String>,
        override_host: Option<String>,
    ) -> Self {
        let target_url = target_url.into().trim_end_matches('/').to_string();
        let override_host = override_host.unwrap_or_else(|| host_of(&target_url));
        AssetLearner {
            site_id: site_id.into(),
            rewriter: UrlRewriter::new(&target_url),
            target_url,
            internal_url: internal_url.map(|u| u.trim_end_matches('/').to_string()),
            override_host,
            cache_dir,
            client: reqwest::Client::new(),
            enabled: Mutex::new(false),
            pending: Mutex::new(HashSet::new()),
            learned_assets: Mutex::new(Vec::new()),
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock() = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    pub fn learned_assets(&self) -> Vec<LearnedAsset> {
        self.learned_assets.lock().clone()
    }

    fn build_fetch_url(&self, path: &str) -> String {
        let base = self.internal_url.as_deref().unwrap_or(&self.target_url);
        format!("{base}/{}", path.trim_start_matches('/'))
    }

    /// Fetches `path` (with optional `query`) from the origin, rewrites it if
    /// it's CSS/HTML, and writes it under the site's cache directory.
    /// Returns the on-disk path on success. All failures are silent (404).
    pub async fn try_fetch_and_cache(&self, path: &str, query: &str) -> Option<PathBuf> {
        if !self.is_enabled() {
            return None;
        }
        if !self.pending.lock().insert(path.to_string()) {
            return None;
        }

        let result = self.fetch_and_cache(path, query).await;
        self.pending.lock().remove(path);
        result
    }

    async fn fetch_and_cache(&self, path: &str, query: &str) -> Option<PathBuf> {
        let mut fetch_url = self.build_fetch_url(path);
        if !query.is_empty() {
            fetch_url.push('?');
            fetch_url.push_str(query);
        }

        let mut req = self
            .client
            .get(&fetch_url)
            .header("User-Agent", "Shield AssetLearner/1.0")
            .header("Accept", "*/*")
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS));
        if self.internal_url.is_some() {
            req = req.header("Host", self.override_host.clone());
        }

        let resp = req.send().await.ok()?;
        if resp.status() != reqwest::StatusCode::OK {
            return None;
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = resp.bytes().await.ok()?;

        let content = if content_type.contains("text/css") {
            let text = String::from_utf8_lossy(&bytes);
            self.rewriter.rewrite_css(&text).into_bytes()
        } else if content_type.contains("text/html") {
            let text = String::from_utf8_lossy(&bytes);
            self.rewriter.rewrite_html(&text).into_bytes()
        } else {
            bytes.to_vec()
        };

        let public_url = format!("{}/{}", self.target_url, path.trim_start_matches('/'));
        let cache_rel = self.rewriter.url_to_cache_path(&public_url);
        let full_path = self.cache_dir.join(&cache_rel);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).ok()?;
        }
        std::fs::write(&full_path, &content).ok()?;

        let clean_rel = self.rewriter.url_to_cache_path_no_query(&public_url);
        if clean_rel != cache_rel {
            let clean_path = self.cache_dir.join(&clean_rel);
            if !clean_path.exists() {
                if let Some(parent) = clean_path.parent() {
                    std::fs::create_dir_all(parent).ok()?;
                }
                std::fs::write(&clean_path, &content).ok()?;
            }
        }

        let normalized_path = format!("/{}", path.trim_start_matches('/'));
        let clean_type = content_type.split(';').next().unwrap_or("").trim().to_string();
        let mut learned = self.learned_assets.lock();
        if !learned.iter().any(|a| a.path == normalized_path) {
            learned.push(LearnedAsset {
                path: normalized_path,
                content_type: clean_type,
                size: content.len(),
                timestamp: Utc::now(),
            });
        }
        drop(learned);

        log::info!("learned asset {path} ({content_type}, {} bytes)", content.len());
        Some(full_path)
    }
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn learner() -> AssetLearner {
        let dir = tempfile::tempdir().unwrap();
        let l = AssetLearner::new("site-1", "https://origin.example", dir.path().to_path_buf(), None, None);
        std::mem::forget(dir);
        l
    }

    #[tokio::test]
    async fn disabled_learner_returns_none() {
        let l = learner();
        assert!(l.try_fetch_and_cache("/missing.css", "").await.is_none());
    }

    #[test]
    fn build_fetch_url_uses_internal_when_set() {
        let dir = tempfile::tempdir().unwrap();
        let l = AssetLearner::new(
            "site-1",
            "https://public.example",
            dir.path().to_path_buf(),
            Some("http://127.0.0.1:9000".to_string()),
            Some("public.example".to_string()),
        );
        assert_eq!(l.build_fetch_url("/a.css"), "http://127.0.0.1:9000/a.css");
    }

    #[test]
    fn enabled_flag_toggles() {
        let l = learner();
        assert!(!l.is_enabled());
        l.set_enabled(true);
        assert!(l.is_enabled());
    }
}
