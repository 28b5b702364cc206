//! Extraction and download of same-origin assets referenced by a crawled page.

use std::collections::HashSet;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::url_rewriter::UrlRewriter;

static ASSET_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<(?:link|script|img|source|video|audio)\b[^>]*?\s(?:href|src)\s*=\s*["']([^"']+)["']"#).unwrap()
});
static SRCSET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)\ssrcset\s*=\s*["']([^"']+)["']"#).unwrap());
static CSS_URL_FN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)url\(\s*['"]?([^)'"\s]+)['"]?\s*\)"#).unwrap());
static STYLE_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>(.*?)</style>").unwrap());
static INLINE_STYLE_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)\sstyle\s*=\s*(?:"([^"]*url\([^"]*)"|'([^']*url\([^']*)')"#).unwrap()
});

fn resolve(base: &str, maybe_relative: &str) -> Option<String> {
    let base_url = reqwest::Url::parse(base).ok()?;
    base_url.join(maybe_relative).ok().map(|u| u.to_string())
}

pub fn extract_css_asset_urls(css: &str, base_url: &str) -> HashSet<String> {
    let mut urls = HashSet::new();
    for caps in CSS_URL_FN_RE.captures_iter(css) {
        let raw = &caps[1];
        if raw.starts_with("data:") {
            continue;
        }
        if let Some(abs) = resolve(base_url, raw) {
            urls.insert(abs);
        }
    }
    urls
}

/// Extracts every asset URL (css/js/img/font/media, plus `srcset` and inline
/// `style="url(...)"`) referenced from an HTML page.
pub fn extract_asset_urls(html: &str, base_url: &str) -> HashSet<String> {
    let mut assets = HashSet::new();

    for caps in ASSET_ATTR_RE.captures_iter(html) {
        if let Some(abs) = resolve(base_url, &caps[1]) {
            assets.insert(abs);
        }
    }

    for caps in SRCSET_RE.captures_iter(html) {
        for entry in caps[1].split(',') {
            if let Some(first) = entry.trim().split_whitespace().next() {
                if let Some(abs) = resolve(base_url, first) {
                    assets.insert(abs);
                }
            }
        }
    }

    for caps in STYLE_TAG_RE.captures_iter(html) {
        assets.extend(extract_css_asset_urls(&caps[1], base_url));
    }

    for caps in INLINE_STYLE_ATTR_RE.captures_iter(html) {
        let style = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or("");
        assets.extend(extract_css_asset_urls(style, base_url));
    }

    assets
}

/// Downloads one asset (recursing into same-origin CSS `url()` references)
/// and writes it into `cache_dir`. Returns the byte count, or 0 on failure.
pub async fn download_asset(
    client: &reqwest::Client,
    url: &str,
    cache_dir: &Path,
    rewriter: &UrlRewriter,
    fetch_url_override: Option<&str>,
) -> u64 {
    if !rewriter.is_same_origin(url) {
        return 0;
    }

    let fetch_url = fetch_url_override.unwrap_or(url);
    let resp = match client.get(fetch_url).send().await {
        Ok(r) if r.status().is_success() => r,
        _ => return 0,
    };

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(_) => return 0,
    };

    let mut content = bytes.to_vec();

    if content_type.contains("text/css") {
        let text = String::from_utf8_lossy(&content).into_owned();
        let rewritten = rewriter.rewrite_css(&text);

        let sub_urls = extract_css_asset_urls(&rewritten, url);
        for sub_url in sub_urls {
            if rewriter.is_same_origin(&sub_url) {
                Box::pin(download_asset(client, &sub_url, cache_dir, rewriter, None)).await;
            }
        }

        content = rewritten.into_bytes();
    }

    let cache_path = rewriter.url_to_cache_path(url);
    let full_path = cache_dir.join(&cache_path);
    if let Some(parent) = full_path.parent() {
        if tokio::fs::create_dir_all(parent).await.is_err() {
            return 0;
        }
    }
    if tokio::fs::write(&full_path, &content).await.is_err() {
        return 0;
    }

    let clean_path = rewriter.url_to_cache_path_no_query(url);
    if clean_path != cache_path {
        let clean_full = cache_dir.join(&clean_path);
        if !clean_full.exists() {
            if let Some(parent) = clean_full.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let _ = tokio::fs::write(&clean_full, &content).await;
        }
    }

    content.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_link_and_script_and_img() {
        let html = r#"<link href="/a.css"><script src="/b.js"></script><img src="/c.png">"#;
        let assets = extract_asset_urls(html, "https://example.com/page");
        assert!(assets.contains("https://example.com/a.css"));
        assert!(assets.contains("https://example.com/b.js"));
        assert!(assets.contains("https://example.com/c.png"));
    }

    #[test]
    fn extracts_srcset_first_candidate() {
        let html = r#"<img srcset="/a-1x.png 1x, /a-2x.png 2x">"#;
        let assets = extract_asset_urls(html, "https://example.com/");
        assert!(assets.contains("https://example.com/a-1x.png"));
        assert!(assets.contains("https://example.com/a-2x.png"));
    }

    #[test]
    fn extracts_inline_style_and_style_tag() {
        let html = r#"<style>body { background: url(/bg.png); }</style><div style="background:url('/c.png')"></div>"#;
        let assets = extract_asset_urls(html, "https://example.com/");
        assert!(assets.contains("https://example.com/bg.png"));
        assert!(assets.contains("https://example.com/c.png"));
    }

    #[test]
    fn skips_data_uri() {
        let css = "a { background: url(data:image/png;base64,abc); }";
        assert!(extract_css_asset_urls(css, "https://example.com/").is_empty());
    }
}
