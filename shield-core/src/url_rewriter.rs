//! Bidirectional map between origin URLs and cache filesystem paths, and
//! the HTML/CSS rewriters that strip absolute references to the origin.
//!
//! Rewriting is regex-based — one compiled alternation per concern — rather
//! than a full HTML tree walk, matching the amount of rewriting actually
//! needed (attribute values plus a handful of literal-substitution passes).

use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use regex::Regex;
use url::Url;

static ATTR_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)((?:href|src|action|srcset)\s*=\s*)"([^"]*)""#).unwrap()
});

static CSS_URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)url\(([^)]+)\)").unwrap());

/// Rewrites absolute origin URLs into cache-relative paths, and maps a URL
/// to the on-disk path the crawler/learner should write it at.
pub struct UrlRewriter {
    scheme: String,
    netloc: String,
}

impl UrlRewriter {
    pub fn new(target_origin: &str) -> Self {
        let (scheme, netloc) = parse_origin(target_origin);
        UrlRewriter { scheme, netloc }
    }

    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.netloc)
    }

    /// True when `url`'s host matches the origin host, scheme-independent.
    /// A relative URL (empty host) counts as same-origin.
    pub fn is_same_origin(&self, url: &str) -> bool {
        match host_of(url) {
            Some(host) => host == self.netloc,
            None => true,
        }
    }

    /// Deterministic URL -> cache-filesystem-path mapping (spec.md §4.1).
    pub fn url_to_cache_path(&self, url: &str) -> String {
        let (path, query) = path_and_query(url);
        let base = Self::normalize_cache_path(&path);

        if query.is_empty() {
            return base;
        }

        let safe_query: String = utf8_percent_encode(&query, NON_ALPHANUMERIC).to_string();
        match base.rsplit_once('.') {
            Some((stem, ext)) => format!("{stem}_{safe_query}.{ext}"),
            None => format!("{base}_{safe_query}"),
        }
    }

    pub fn url_to_cache_path_no_query(&self, url: &str) -> String {
        let (path, _) = path_and_query(url);
        Self::normalize_cache_path(&path)
    }

    fn normalize_cache_path(url_path: &str) -> String {
        let trimmed = url_path.trim_matches('/');
        if trimmed.is_empty() {
            return "index.html".to_string();
        }
        if url_path.ends_with('/') {
            return format!("{trimmed}/index.html");
        }
        let last_segment = trimmed.rsplit('/').next().unwrap_or(trimmed);
        if !last_segment.contains('.') {
            return format!("{trimmed}/index.html");
        }
        trimmed.to_string()
    }

    /// Replace every same-origin absolute reference in `html` with a
    /// relative path, including scheme-relative and JSON-escaped forms.
    pub fn rewrite_html(&self, html: &str) -> String {
        let netloc = self.netloc.clone();
        let mut out = ATTR_URL_RE
            .replace_all(html, |caps: &regex::Captures| {
                let prefix = &caps[1];
                let value = &caps[2];
                if self.is_same_origin(value) {
                    if let Some(rel) = self.to_relative(value) {
                        return format!(r#"{prefix}"{rel}""#);
                    }
                }
                caps[0].to_string()
            })
            .into_owned();

        for scheme in ["https", "http"] {
            let literal = format!("{scheme}://{netloc}");
            let re = Regex::new(&format!(r#"{}(/[^\s"'<>]*)"#, regex::escape(&literal))).unwrap();
            out = re.replace_all(&out, "$1").into_owned();
        }

        for scheme in ["https", "http"] {
            let json_origin = format!("{scheme}:\\/\\/{netloc}");
            out = out.replace(&json_origin, "");
        }
        out = out.replace(&format!("\\/\\/{netloc}"), "");
        out = out.replace(&format!("//{netloc}"), "");

        for scheme in ["https", "http"] {
            let bare = format!("{scheme}://{netloc}");
            out = out.replace(&format!(r#""{bare}""#), r#""/""#);
            out = out.replace(&format!("'{bare}'"), "'/'");
        }

        out
    }

    /// Replace same-origin `url(...)` CSS references; `data:` URIs are
    /// left untouched since `to_relative` only fires for a resolvable host.
    pub fn rewrite_css(&self, css: &str) -> String {
        CSS_URL_RE
            .replace_all(css, |caps: &regex::Captures| {
                let raw = caps[1].trim().trim_matches(|c| c == '\'' || c == '"');
                if raw.starts_with("data:") {
                    return caps[0].to_string();
                }
                if self.is_same_origin(raw) {
                    if let Some(rel) = self.to_relative(raw) {
                        return format!("url('{rel}')");
                    }
                }
                caps[0].to_string()
            })
            .into_owned()
    }

    fn to_relative(&self, value: &str) -> Option<String> {
        if value.is_empty() {
            return None;
        }
        let (path, query, fragment) = path_query_fragment(value);
        let mut rel = if path.is_empty() { "/".to_string() } else { path };
        if !query.is_empty() {
            rel.push('?');
            rel.push_str(&query);
        }
        if !fragment.is_empty() {
            rel.push('#');
            rel.push_str(&fragment);
        }
        Some(rel)
    }
}

fn parse_origin(origin: &str) -> (String, String) {
    if let Ok(u) = Url::parse(origin) {
        let host = u.host_str().unwrap_or("").to_string();
        let netloc = match u.port() {
            Some(p) => format!("{host}:{p}"),
            None => host,
        };
        return (u.scheme().to_string(), netloc);
    }
    ("https".to_string(), origin.to_string())
}

fn host_of(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("//") {
        let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        return Some(rest[..end].to_string());
    }
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(p) => format!("{host}:{p}"),
        None => host.to_string(),
    })
}

/// Splits a possibly-relative URL into (path, query) without requiring a
/// scheme/host, tolerating malformed input by passing it through as a path.
fn path_and_query(url: &str) -> (String, String) {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let stripped = strip_scheme_host(without_fragment);
    match stripped.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (stripped.to_string(), String::new()),
    }
}

fn path_query_fragment(url: &str) -> (String, String, String) {
    let (rest, fragment) = match url.split_once('#') {
        Some((r, f)) => (r, f.to_string()),
        None => (url, String::new()),
    };
    let stripped = strip_scheme_host(rest);
    let (path, query) = match stripped.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (stripped.to_string(), String::new()),
    };
    (path, query, fragment)
}

fn strip_scheme_host(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url) {
        if parsed.host().is_some() {
            return match parsed.query() {
                Some(q) => format!("{}?{}", parsed.path(), q),
                None => parsed.path().to_string(),
            };
        }
    }
    if let Some(rest) = url.strip_prefix("//") {
        let end = rest.find('/').unwrap_or(rest.len());
        return rest[end..].to_string();
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw() -> UrlRewriter {
        UrlRewriter::new("https://old-site.example")
    }

    #[test]
    fn cache_path_determinism() {
        let r = rw();
        let a = r.url_to_cache_path("https://old-site.example/about/");
        let b = r.url_to_cache_path("https://old-site.example/about/");
        assert_eq!(a, b);
        assert_eq!(a, "about/index.html");
    }

    #[test]
    fn cache_path_root() {
        let r = rw();
        assert_eq!(r.url_to_cache_path("https://old-site.example/"), "index.html");
        assert_eq!(r.url_to_cache_path("https://old-site.example"), "index.html");
    }

    #[test]
    fn cache_path_no_extension_gets_index() {
        let r = rw();
        assert_eq!(r.url_to_cache_path("https://old-site.example/blog/post-1"), "blog/post-1/index.html");
    }

    #[test]
    fn cache_path_with_query() {
        let r = rw();
        let p = r.url_to_cache_path("https://old-site.example/static/app.css?v=42");
        assert!(p.starts_with("static/app_"));
        assert!(p.ends_with(".css"));
    }

    #[test]
    fn fragment_does_not_affect_cache_path() {
        let r = rw();
        let a = r.url_to_cache_path("https://old-site.example/page");
        let b = r.url_to_cache_path("https://old-site.example/page#section");
        assert_eq!(a, b);
    }

    #[test]
    fn same_origin_both_schemes() {
        let r = rw();
        assert!(r.is_same_origin("http://old-site.example/x"));
        assert!(r.is_same_origin("https://old-site.example/x"));
        assert!(!r.is_same_origin("https://evil.example/x"));
        assert!(r.is_same_origin("/relative/path"));
    }

    #[test]
    fn rewrite_html_attr_and_bare() {
        let r = rw();
        let html = r#"<a href="https://old-site.example/about">x</a> see https://old-site.example/contact"#;
        let out = r.rewrite_html(html);
        assert!(out.contains(r#"href="/about""#));
        assert!(out.contains("/contact"));
        assert!(!out.contains("old-site.example"));
    }

    #[test]
    fn rewrite_idempotent_on_same_origin_html() {
        let r = rw();
        let html = r#"<img src="https://old-site.example/logo.png">"#;
        let once = r.rewrite_html(html);
        let twice = r.rewrite_html(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn rewrite_css_url() {
        let r = rw();
        let css = "body { background: url(https://old-site.example/bg.png); }";
        let out = r.rewrite_css(css);
        assert_eq!(out, "body { background: url('/bg.png'); }");
    }

    #[test]
    fn rewrite_css_leaves_data_uri() {
        let r = rw();
        let css = "a { background: url(data:image/png;base64,abc); }";
        assert_eq!(r.rewrite_css(css), css);
    }

    #[test]
    fn malformed_url_passes_through() {
        let r = rw();
        let html = r#"<a href="not a url at all">x</a>"#;
        assert_eq!(r.rewrite_html(html), html);
    }
}
