//! robots.txt and sitemap.xml discovery.
//!
//! Sitemap XML is scraped with a regex over `<loc>` tags rather than a
//! full XML parser — sitemaps are simple enough, and it keeps the same
//! regex-first approach the rest of the crawler uses for text extraction.

use once_cell::sync::Lazy;
use regex::Regex;

static LOC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<loc>\s*([^<]+?)\s*</loc>").unwrap());
static SITEMAP_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<sitemap>(.*?)</sitemap>").unwrap());
static URL_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<url>(.*?)</url>").unwrap());

pub async fn parse_robots_txt(client: &reqwest::Client, base_url: &str) -> (Vec<String>, Vec<String>) {
    let mut sitemaps = Vec::new();
    let mut disallowed = Vec::new();

    let url = match reqwest::Url::parse(base_url).and_then(|u| u.join("/robots.txt")) {
        Ok(u) => u,
        Err(_) => return (sitemaps, disallowed),
    };

    let text = match client.get(url).timeout(std::time::Duration::from_secs(10)).send().await {
        Ok(resp) if resp.status().is_success() => resp.text().await.unwrap_or_default(),
        _ => return (sitemaps, disallowed),
    };

    for line in text.lines() {
        let line = line.trim();
        let lower = line.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("sitemap:") {
            let value = line[line.len() - rest.len()..].trim().to_string();
            sitemaps.push(value);
        } else if let Some(rest) = lower.strip_prefix("disallow:") {
            let value = line[line.len() - rest.len()..].trim().to_string();
            if !value.is_empty() {
                disallowed.push(value);
            }
        }
    }

    (sitemaps, disallowed)
}

/// Recursively parses a sitemap (or sitemap index) and returns all `<loc>` URLs.
pub async fn parse_sitemap(client: &reqwest::Client, sitemap_url: &str) -> Vec<String> {
    let mut urls = Vec::new();

    let body = match client.get(sitemap_url).timeout(std::time::Duration::from_secs(15)).send().await {
        Ok(resp) if resp.status().is_success() => resp.text().await.unwrap_or_default(),
        _ => return urls,
    };

    if SITEMAP_TAG_RE.is_match(&body) {
        for caps in SITEMAP_TAG_RE.captures_iter(&body) {
            if let Some(loc) = LOC_RE.captures(&caps[1]) {
                let child = Box::pin(parse_sitemap(client, loc[1].trim())).await;
                urls.extend(child);
            }
        }
        return urls;
    }

    for caps in URL_TAG_RE.captures_iter(&body) {
        if let Some(loc) = LOC_RE.captures(&caps[1]) {
            urls.push(loc[1].trim().to_string());
        }
    }

    urls
}

pub async fn discover_urls_from_sitemaps(
    client: &reqwest::Client,
    base_url: &str,
    respect_robots: bool,
) -> (Vec<String>, Vec<String>) {
    let (mut sitemaps, mut disallowed) = parse_robots_txt(client, base_url).await;

    if sitemaps.is_empty() {
        if let Ok(u) = reqwest::Url::parse(base_url).and_then(|u| u.join("/sitemap.xml")) {
            sitemaps.push(u.to_string());
        }
    }

    let mut all_urls = Vec::new();
    for sitemap_url in &sitemaps {
        all_urls.extend(parse_sitemap(client, sitemap_url).await);
    }

    if !respect_robots {
        disallowed.clear();
    }

    (all_urls, disallowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_loc_tags() {
        let xml = "<urlset><url><loc>https://example.com/a</loc></url><url><loc>https://example.com/b</loc></url></urlset>";
        let locs: Vec<_> = URL_TAG_RE
            .captures_iter(xml)
            .filter_map(|c| LOC_RE.captures(&c[1]).map(|l| l[1].to_string()))
            .collect();
        assert_eq!(locs, vec!["https://example.com/a", "https://example.com/b"]);
    }

    #[test]
    fn extracts_nested_sitemap_index() {
        let xml = "<sitemapindex><sitemap><loc>https://example.com/sitemap-1.xml</loc></sitemap></sitemapindex>";
        assert!(SITEMAP_TAG_RE.is_match(xml));
    }
}
