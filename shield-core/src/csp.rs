//! Content-Security-Policy builder: scans cached pages for external origins
//! referenced by the mirrored site and compiles a single `default-src` CSP.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[a-zA-Z0-9._-]+(?:\.[a-zA-Z]{2,})+").unwrap());
static INLINE_SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script(?:\s[^>]*)?>(.*?)</script>").unwrap());
static INLINE_HANDLER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\bon\w+\s*=\s*["']"#).unwrap());

static KNOWN_DOMAIN_GROUPS: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    HashMap::from([
        ("fonts.googleapis.com", &["fonts.gstatic.com", "fonts.googleapis.com"][..]),
        ("fonts.gstatic.com", &["fonts.gstatic.com", "fonts.googleapis.com"][..]),
        ("ajax.googleapis.com", &["ajax.googleapis.com"][..]),
        (
            "cdn.gtranslate.net",
            &["cdn.gtranslate.net", "translate.google.com", "translate.googleapis.com"][..],
        ),
        (
            "translate.google.com",
            &["cdn.gtranslate.net", "translate.google.com", "translate.googleapis.com"][..],
        ),
        ("maps.googleapis.com", &["maps.googleapis.com", "maps.gstatic.com", "maps.google.com"][..]),
        (
            "www.google-analytics.com",
            &["www.google-analytics.com", "www.googletagmanager.com", "analytics.google.com"][..],
        ),
        (
            "www.googletagmanager.com",
            &["www.googletagmanager.com", "www.google-analytics.com", "analytics.google.com"][..],
        ),
    ])
});

#[derive(Debug, Clone)]
pub struct CspScanResult {
    pub origins: Vec<String>,
    pub needs_unsafe_inline: bool,
    pub needs_unsafe_eval: bool,
}

fn extract_origins_from_text(text: &str) -> HashSet<String> {
    let mut origins = HashSet::new();
    for m in URL_RE.find_iter(text) {
        if let Ok(url) = reqwest::Url::parse(m.as_str()) {
            if let Some(host) = url.host_str() {
                origins.insert(format!("{}://{}", url.scheme(), host));
            }
        }
    }
    origins
}

fn expand_with_known_groups(origins: &HashSet<String>) -> HashSet<String> {
    let mut expanded = origins.clone();
    for origin in origins {
        if let Ok(url) = reqwest::Url::parse(origin) {
            if let Some(host) = url.host_str() {
                if let Some(related) = KNOWN_DOMAIN_GROUPS.get(host) {
                    for r in *related {
                        expanded.insert(format!("https://{r}"));
                    }
                }
            }
        }
    }
    expanded
}

/// Walks every `.html`/`.css`/`.js` file under `cache_dir` and collects the
/// external origins referenced, plus whether inline script handling is needed.
pub fn scan_cache_for_origins(cache_dir: &Path, target_url: Option<&str>) -> CspScanResult {
    let mut all_origins = HashSet::new();
    let mut has_inline_scripts = false;

    for path in walk(cache_dir) {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !matches!(ext, "html" | "css" | "js") {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&path) else { continue };
        all_origins.extend(extract_origins_from_text(&text));

        if ext == "html" {
            let has_nonempty_script_body = INLINE_SCRIPT_RE
                .captures_iter(&text)
                .any(|c| !c[1].trim().is_empty());
            if has_nonempty_script_body || INLINE_HANDLER_RE.is_match(&text) {
                has_inline_scripts = true;
            }
        }
    }

    all_origins = expand_with_known_groups(&all_origins);

    if let Some(target) = target_url {
        if let Ok(url) = reqwest::Url::parse(target) {
            if let Some(host) = url.host_str() {
                all_origins.insert(format!("https://{host}"));
                all_origins.insert(format!("http://{host}"));
            }
        }
    }

    let mut origins: Vec<String> = all_origins.into_iter().collect();
    origins.sort();

    CspScanResult { origins, needs_unsafe_inline: has_inline_scripts, needs_unsafe_eval: true }
}

/// Builds a compact CSP string with a single `default-src` directive so the
/// header stays within typical reverse-proxy buffer limits.
pub fn build_csp(scan: &CspScanResult) -> String {
    let origins_str = scan.origins.join(" ");

    let mut extras = vec!["'self'".to_string(), "'unsafe-inline'".to_string()];
    if scan.needs_unsafe_eval {
        extras.push("'unsafe-eval'".to_string());
    }
    extras.push("data:".to_string());
    extras.push("blob:".to_string());
    let extras_str = extras.join(" ");

    let directives = [
        format!("default-src {extras_str} {origins_str}").trim().to_string(),
        "frame-ancestors 'none'".to_string(),
        "base-uri 'self'".to_string(),
        "form-action 'self'".to_string(),
    ];

    directives.join("; ")
}

fn walk(root: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(read_dir) = std::fs::read_dir(&dir) else { continue };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_finds_external_origin_and_expands_group() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("index.html"),
            r#"<link href="https://fonts.googleapis.com/css?family=Roboto">"#,
        )
        .unwrap();

        let result = scan_cache_for_origins(dir.path(), None);
        assert!(result.origins.contains(&"https://fonts.googleapis.com".to_string()));
        assert!(result.origins.contains(&"https://fonts.gstatic.com".to_string()));
    }

    #[test]
    fn detects_inline_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<script>alert(1)</script>").unwrap();
        let result = scan_cache_for_origins(dir.path(), None);
        assert!(result.needs_unsafe_inline);
    }

    #[test]
    fn build_csp_includes_directives() {
        let scan = CspScanResult {
            origins: vec!["https://cdn.example.com".to_string()],
            needs_unsafe_inline: false,
            needs_unsafe_eval: true,
        };
        let csp = build_csp(&scan);
        assert!(csp.contains("default-src"));
        assert!(csp.contains("https://cdn.example.com"));
        assert!(csp.contains("frame-ancestors 'none'"));
        assert!(csp.contains("'unsafe-eval'"));
    }
}
