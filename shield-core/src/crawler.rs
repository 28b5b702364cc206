//! Async BFS crawler that mirrors a legacy origin into static cache files.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Semaphore;

use crate::asset_processor::{download_asset, extract_asset_urls};
use crate::db::Database;
use crate::error::{CrawlError, CrawlResult};
use crate::models::{CrawlJob, CrawlJobStatus, FormDescriptor, Page};
use crate::sitemap::discover_urls_from_sitemaps;
use crate::url_rewriter::UrlRewriter;

static FORM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<form\b([^>]*)>(.*?)</form>").unwrap());
static FORM_ACTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\baction\s*=\s*["']([^"']*)["']"#).unwrap());
static FORM_METHOD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\bmethod\s*=\s*["']([^"']*)["']"#).unwrap());
static FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<(?:input|textarea|select)\b([^>]*)>"#).unwrap());
static NAME_ATTR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\bname\s*=\s*["']([^"']*)["']"#).unwrap());

const SKIP_EXTENSIONS: &[&str] = &[".zip", ".tar", ".gz", ".exe", ".dmg", ".iso"];

/// Detects `<form>` elements on a page for the crawl report (spec §3).
pub fn detect_forms(html: &str) -> Vec<FormDescriptor> {
    let mut forms = Vec::new();
    for caps in FORM_RE.captures_iter(html) {
        let attrs = &caps[1];
        let body = &caps[2];
        let action = FORM_ACTION_RE.captures(attrs).map(|c| c[1].to_string()).unwrap_or_default();
        let method = FORM_METHOD_RE
            .captures(attrs)
            .map(|c| c[1].to_uppercase())
            .unwrap_or_else(|| "GET".to_string());

        let mut field_names = Vec::new();
        for field in FIELD_RE.captures_iter(body) {
            if let Some(name) = NAME_ATTR_RE.captures(&field[1]) {
                field_names.push(name[1].to_string());
            }
        }

        forms.push(FormDescriptor { action, method, field_names });
    }
    forms
}

fn is_directory_listing(html: &str) -> bool {
    let head = &html[..html.len().min(4096)];
    let lower = head.to_ascii_lowercase();
    lower.contains("<title>index of ")
        || lower.contains("<title>index of/")
        || lower.contains(">[to parent directory]<")
}

fn normalize_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(u) => {
            let mut s = format!("{}://{}{}", u.scheme(), u.host_str().unwrap_or(""), u.path());
            if let Some(q) = u.query() {
                s.push('?');
                s.push_str(q);
            }
            s
        }
        Err(_) => url.to_string(),
    }
}

fn extract_links(html: &str, base_url: &str) -> Vec<String> {
    static HREF_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"(?is)<a\b[^>]*?\shref\s*=\s*["']([^"']*)["']"#).unwrap());
    let mut links = Vec::new();
    for caps in HREF_RE.captures_iter(html) {
        let href = &caps[1];
        if href.starts_with('#') || href.starts_with("mailto:") || href.starts_with("tel:") || href.starts_with("javascript:") {
            continue;
        }
        if let Ok(base) = reqwest::Url::parse(base_url) {
            if let Ok(absolute) = base.join(href) {
                links.push(normalize_url(absolute.as_str()));
            }
        }
    }
    links
}

pub struct CrawlerEngine {
    site_id: String,
    target_url: String,
    cache_dir: PathBuf,
    max_concurrency: usize,
    delay: Duration,
    max_pages: usize,
    respect_robots: bool,
    internal_url: Option<String>,
    override_host: String,
    rewriter: UrlRewriter,
    db: Database,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl CrawlerEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        site_id: impl Into<String>,
        target_url: impl Into<String>,
        cache_dir: PathBuf,
        max_concurrency: usize,
        delay_ms: u64,
        max_pages: usize,
        respect_robots: bool,
        internal_url: Option<String>,
        override_host: Option<String>,
        db: Database,
    ) -> Self {
        let target_url = target_url.into().trim_end_matches('/').to_string();
        let rewriter = UrlRewriter::new(&target_url);
        let override_host = override_host.unwrap_or_else(|| {
            reqwest::Url::parse(&target_url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
                .unwrap_or_default()
        });
        CrawlerEngine {
            site_id: site_id.into(),
            target_url,
            cache_dir,
            max_concurrency: max_concurrency.max(1),
            delay: Duration::from_millis(delay_ms),
            max_pages,
            respect_robots,
            internal_url: internal_url.map(|u| u.trim_end_matches('/').to_string()),
            override_host,
            rewriter,
            db,
            stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> Arc<std::sync::atomic::AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn to_fetch_url(&self, url: &str) -> String {
        let Some(internal) = &self.internal_url else { return url.to_string() };
        let Ok(parsed) = reqwest::Url::parse(url) else { return url.to_string() };
        let Ok(internal_parsed) = reqwest::Url::parse(internal) else { return url.to_string() };
        let mut s = format!(
            "{}://{}{}",
            internal_parsed.scheme(),
            internal_parsed.host_str().unwrap_or(""),
            parsed.path()
        );
        if let Some(q) = parsed.query() {
            s.push('?');
            s.push_str(q);
        }
        s
    }

    fn should_crawl(&self, url: &str, visited: &HashSet<String>, disallowed: &[String]) -> bool {
        if !self.rewriter.is_same_origin(url) {
            return false;
        }
        if visited.contains(url) {
            return false;
        }
        let path = reqwest::Url::parse(url).map(|u| u.path().to_string()).unwrap_or_default();
        if disallowed.iter().any(|d| path.starts_with(d.as_str())) {
            return false;
        }
        let lower = path.to_ascii_lowercase();
        if SKIP_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            return false;
        }
        true
    }

    async fn crawl_page(
        &self,
        client: &reqwest::Client,
        url: &str,
        job: &std::sync::Mutex<CrawlJob>,
    ) -> Vec<String> {
        let fetch_url = self.to_fetch_url(url);
        let resp = match client.get(&fetch_url).send().await {
            Ok(r) => r,
            Err(e) => {
                let mut job = job.lock().unwrap();
                job.errors += 1;
                job.error_log.push(format!("Error crawling {url}: {e}"));
                return Vec::new();
            }
        };

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("text/html") {
            return Vec::new();
        }

        let status_code = resp.status().as_u16();
        let etag = resp.headers().get(reqwest::header::ETAG).and_then(|v| v.to_str().ok()).map(String::from);
        let last_modified = resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let html = match resp.text().await {
            Ok(h) => h,
            Err(_) => return Vec::new(),
        };

        if is_directory_listing(&html) {
            return Vec::new();
        }

        let cache_path = self.rewriter.url_to_cache_path(url);
        let full_path = self.cache_dir.join(&cache_path);
        if let Some(parent) = full_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let rewritten = self.rewriter.rewrite_html(&html);
        let _ = tokio::fs::write(&full_path, &rewritten).await;

        let clean_path = self.rewriter.url_to_cache_path_no_query(url);
        if clean_path != cache_path {
            let clean_full = self.cache_dir.join(&clean_path);
            if !clean_full.exists() {
                if let Some(parent) = clean_full.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                let _ = tokio::fs::write(&clean_full, &rewritten).await;
            }
        }

        let forms_detected = detect_forms(&html);
        let page = Page {
            site_id: self.site_id.clone(),
            url: url.to_string(),
            cache_path: cache_path.clone(),
            content_type: content_type.split(';').next().unwrap_or("text/html").trim().to_string(),
            status_code,
            bytes: rewritten.len() as u64,
            etag,
            last_modified,
            forms_detected,
            created_at: chrono::Utc::now(),
        };
        let _ = self.db.upsert_page(&page);

        {
            let mut job = job.lock().unwrap();
            job.pages_crawled += 1;
        }

        let asset_urls = extract_asset_urls(&html, url);
        let mut assets_downloaded = 0u64;
        for asset_url in &asset_urls {
            if self.rewriter.is_same_origin(asset_url) {
                let translated =
                    self.internal_url.is_some().then(|| self.to_fetch_url(asset_url));
                let size = download_asset(
                    client,
                    asset_url,
                    &self.cache_dir,
                    &self.rewriter,
                    translated.as_deref(),
                )
                .await;
                if size > 0 {
                    assets_downloaded += 1;
                }
            }
        }
        if assets_downloaded > 0 {
            let mut job = job.lock().unwrap();
            job.assets_downloaded += assets_downloaded;
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        extract_links(&html, url)
    }

    pub async fn run(&self, job_id: &str) -> CrawlResult<()> {
        let mut job = self.db.get_crawl_job(job_id)?.ok_or(CrawlError::NoCacheDir)?;
        job.status = CrawlJobStatus::Running;
        self.db.update_crawl_job(&job)?;

        tokio::fs::create_dir_all(&self.cache_dir).await.map_err(crate::error::DatabaseError::Io)?;

        let headers_user_agent = "Shield Crawler/1.0";
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::USER_AGENT, headers_user_agent.parse().unwrap());
        if self.internal_url.is_some() {
            if let Ok(v) = self.override_host.parse() {
                headers.insert(reqwest::header::HOST, v);
            }
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .unwrap_or_default();

        let base_url = self.internal_url.as_deref().unwrap_or(&self.target_url);
        let (sitemap_urls, disallowed) = discover_urls_from_sitemaps(&client, base_url, self.respect_robots).await;

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(self.target_url.clone());
        for url in sitemap_urls {
            let normalized = normalize_url(&url);
            if self.should_crawl(&normalized, &visited, &disallowed) {
                queue.push_back(normalized);
            }
        }

        let job_lock = std::sync::Mutex::new(job);
        {
            let mut j = job_lock.lock().unwrap();
            j.pages_found = queue.len() as u64;
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut pages_crawled_total = 0usize;

        while !queue.is_empty() && !self.stop.load(std::sync::atomic::Ordering::Relaxed) {
            if pages_crawled_total >= self.max_pages {
                break;
            }

            let batch_size = self.max_concurrency.min(queue.len());
            let mut handles = Vec::with_capacity(batch_size);
            for _ in 0..batch_size {
                let Some(url) = queue.pop_front() else { break };
                if visited.contains(&url) {
                    continue;
                }
                visited.insert(url.clone());
                pages_crawled_total += 1;

                let permit = Arc::clone(&semaphore);
                let client = client.clone();
                let this = self;
                let job_ref = &job_lock;
                handles.push(async move {
                    let _permit = permit.acquire_owned().await;
                    this.crawl_page(&client, &url, job_ref).await
                });
            }

            let results = futures_util::future::join_all(handles).await;
            for links in results {
                for link in links {
                    if !visited.contains(&link) && !queue.contains(&link) && self.should_crawl(&link, &visited, &disallowed) {
                        queue.push_back(link);
                        let mut j = job_lock.lock().unwrap();
                        j.pages_found += 1;
                    }
                }
            }

            self.db.update_crawl_job(&job_lock.lock().unwrap().clone())?;
        }

        let mut final_job = job_lock.into_inner().unwrap();
        final_job.status = if self.stop.load(std::sync::atomic::Ordering::Relaxed) {
            CrawlJobStatus::Stopped
        } else {
            CrawlJobStatus::Completed
        };
        final_job.finished_at = Some(chrono::Utc::now());
        self.db.update_crawl_job(&final_job)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_single_form_with_fields() {
        let html = r#"<form action="/contact" method="post"><input name="email"><input name="msg"></form>"#;
        let forms = detect_forms(html);
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0].action, "/contact");
        assert_eq!(forms[0].method, "POST");
        assert_eq!(forms[0].field_names, vec!["email", "msg"]);
    }

    #[test]
    fn no_forms_returns_empty() {
        assert!(detect_forms("<html><body>hi</body></html>").is_empty());
    }

    #[test]
    fn directory_listing_detected() {
        assert!(is_directory_listing("<html><title>Index of /files</title></html>"));
        assert!(!is_directory_listing("<html><title>Welcome</title></html>"));
    }

    #[test]
    fn skip_extensions_filtered() {
        let visited = HashSet::new();
        let rewriter_host = "example.com";
        let _ = rewriter_host;
        let engine = CrawlerEngine::new(
            "s1",
            "https://example.com",
            PathBuf::from("/tmp/x"),
            2,
            0,
            10,
            true,
            None,
            None,
            crate::db::Database::open_in_memory().unwrap(),
        );
        assert!(!engine.should_crawl("https://example.com/archive.zip", &visited, &[]));
        assert!(engine.should_crawl("https://example.com/page", &visited, &[]));
    }
}
