//! Pre-computed file index built at deploy time.
//!
//! Eliminates filesystem stat/exists calls from the request path: every
//! lookup is an O(1) map access. Files under [`IN_MEMORY_THRESHOLD`] are
//! loaded entirely into RAM, up to a [`MAX_MEMORY_TOTAL`] budget.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

pub const IN_MEMORY_THRESHOLD: u64 = 512 * 1024;
pub const MAX_MEMORY_TOTAL: u64 = 256 * 1024 * 1024;

const IMMUTABLE_EXTENSIONS: &[&str] = &[
    "css", "js", "woff", "woff2", "ttf", "eot", "otf", "png", "jpg", "jpeg", "gif", "svg", "webp",
    "avif", "ico", "mp4", "webm", "mp3", "ogg", "pdf", "map",
];

#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub disk_path: PathBuf,
    pub content_type: String,
    pub content_length: u64,
    pub is_immutable: bool,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IndexStats {
    pub files: usize,
    pub in_memory: usize,
    pub memory_bytes: u64,
    pub disk_only: usize,
}

/// Fully pre-computed mapping from URL path (and `path?query` alias) to
/// cached response metadata. Built once at deploy time; hot-extendable by
/// the asset learner afterward.
pub struct CacheIndex {
    entries: RwLock<HashMap<String, CachedEntry>>,
    query_entries: RwLock<HashMap<String, CachedEntry>>,
    stats: RwLock<IndexStats>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        CacheIndex {
            entries: RwLock::new(HashMap::new()),
            query_entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(IndexStats::default()),
        }
    }
}

fn is_immutable_ext(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMMUTABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl CacheIndex {
    pub fn new() -> Self {
        CacheIndex::default()
    }

    pub fn stats(&self) -> IndexStats {
        *self.stats.read()
    }

    pub fn lookup(&self, path: &str, query: &str) -> Option<CachedEntry> {
        if !query.is_empty() {
            let key = format!("{path}?{query}");
            if let Some(entry) = self.query_entries.read().get(&key) {
                return Some(entry.clone());
            }
        }
        self.entries.read().get(path).cloned()
    }

    /// Scans `cache_root` recursively and rebuilds the entire index.
    pub fn build(&self, cache_root: &Path) {
        if !cache_root.exists() {
            return;
        }

        let mut entries = HashMap::new();
        let mut query_entries = HashMap::new();
        let mut memory_used: u64 = 0;
        let mut files = 0usize;
        let mut in_memory = 0usize;

        for path in walk_files(cache_root) {
            let rel = match path.strip_prefix(cache_root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let url_path = rel.to_string_lossy().replace('\\', "/");

            let content_type = mime_guess::from_path(&path).first_or_octet_stream().to_string();
            let is_immutable = is_immutable_ext(&path);
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

            let body = if size <= IN_MEMORY_THRESHOLD && memory_used + size <= MAX_MEMORY_TOTAL {
                match std::fs::read(&path) {
                    Ok(b) => {
                        memory_used += size;
                        in_memory += 1;
                        Some(b)
                    }
                    Err(_) => None,
                }
            } else {
                None
            };

            let entry = CachedEntry {
                disk_path: path.clone(),
                content_type,
                content_length: size,
                is_immutable,
                body,
            };

            register_entry(&mut entries, &mut query_entries, &url_path, rel, entry);
            files += 1;
        }

        let disk_only = files.saturating_sub(in_memory);
        let total_files = files + query_entries.len();
        *self.entries.write() = entries;
        *self.query_entries.write() = query_entries;
        *self.stats.write() = IndexStats {
            files: total_files,
            in_memory,
            memory_bytes: memory_used,
            disk_only,
        };
    }

    /// Hot-adds a file the asset learner just wrote to disk.
    pub fn add_learned_file(&self, cache_root: &Path, rel_path: &str) -> Option<CachedEntry> {
        let file_path = cache_root.join(rel_path);
        if !file_path.is_file() {
            return None;
        }

        let content_type = mime_guess::from_path(&file_path).first_or_octet_stream().to_string();
        let size = std::fs::metadata(&file_path).ok()?.len();
        let body = if size <= IN_MEMORY_THRESHOLD { std::fs::read(&file_path).ok() } else { None };

        let entry = CachedEntry {
            disk_path: file_path.clone(),
            content_type,
            content_length: size,
            is_immutable: is_immutable_ext(&file_path),
            body,
        };

        let url_path = rel_path.replace('\\', "/");
        let mut entries = self.entries.write();
        entries.insert(url_path.clone(), entry.clone());

        if let Some(dir_path) = url_path.strip_suffix("index.html") {
            entries.insert(dir_path.to_string(), entry.clone());
            entries.insert(dir_path.trim_end_matches('/').to_string(), entry.clone());
        }

        Some(entry)
    }
}

fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(read_dir) = std::fs::read_dir(&dir) else { continue };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                out.push(path);
            }
        }
    }
    out
}

fn register_entry(
    entries: &mut HashMap<String, CachedEntry>,
    query_entries: &mut HashMap<String, CachedEntry>,
    url_path: &str,
    rel: &Path,
    entry: CachedEntry,
) {
    let filename = rel.file_name().and_then(|f| f.to_str()).unwrap_or("");

    if let Some(idx) = filename.rfind('_') {
        if !url_path.starts_with('_') {
            if let Some(dot_idx) = filename.rfind('.') {
                if dot_idx > idx {
                    let query_encoded = &filename[idx + 1..dot_idx];
                    let clean_name = format!("{}{}", &filename[..idx], &filename[dot_idx..]);
                    let parent = rel.parent().map(|p| p.to_string_lossy().replace('\\', "/")).unwrap_or_default();
                    let clean_path = if parent.is_empty() { clean_name } else { format!("{parent}/{clean_name}") };
                    query_entries.insert(format!("{clean_path}?{query_encoded}"), entry.clone());
                }
            }
        }
    }

    entries.insert(url_path.to_string(), entry.clone());

    if url_path == "index.html" {
        entries.insert(String::new(), entry.clone());
        entries.insert("/".to_string(), entry.clone());
    }

    if let Some(dir_path) = url_path.strip_suffix("index.html") {
        if dir_path != url_path {
            entries.insert(dir_path.to_string(), entry.clone());
            let bare = dir_path.trim_end_matches('/');
            if !bare.is_empty() {
                entries.insert(bare.to_string(), entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_indexes_root_and_nested_pages() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>root</html>").unwrap();
        std::fs::create_dir_all(dir.path().join("about")).unwrap();
        std::fs::write(dir.path().join("about/index.html"), "<html>about</html>").unwrap();

        let index = CacheIndex::new();
        index.build(dir.path());

        assert!(index.lookup("index.html", "").is_some());
        assert!(index.lookup("/", "").is_some());
        assert!(index.lookup("about/index.html", "").is_some());
        assert!(index.lookup("about/", "").is_some());
        assert!(index.lookup("about", "").is_some());
        assert_eq!(index.stats().files, 2);
    }

    #[test]
    fn query_alias_registered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("static")).unwrap();
        std::fs::write(dir.path().join("static/app_v%3D42.css"), "body{}").unwrap();

        let index = CacheIndex::new();
        index.build(dir.path());

        assert!(index.lookup("static/app.css", "v%3D42").is_some());
    }

    #[test]
    fn missing_root_is_noop() {
        let index = CacheIndex::new();
        index.build(Path::new("/nonexistent/path/xyz"));
        assert_eq!(index.stats().files, 0);
    }
}
