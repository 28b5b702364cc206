//! Process-wide configuration for the Shield.
//!
//! All knobs are read from the environment under the `WS_` prefix, with
//! sensible defaults baked in so a bare `Config::load()` works for local
//! development. Mirrors the plain enum-and-defaults style the gateway's
//! own config module uses, minus the custom config-store crate — there's
//! nothing dynamic to push updates into here, just process startup.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_or_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub admin_port: u16,
    pub log_level: String,

    pub jwt_alg: String,
    pub jwt_expiry_secs: u64,
    pub cookie_secure: bool,

    pub crawl_max_concurrency: usize,
    pub crawl_delay_ms: u64,
    pub crawl_max_pages: usize,
    pub crawl_respect_robots: bool,

    pub rate_global_requests: u32,
    pub rate_global_window_secs: u64,

    pub max_body_size: usize,

    pub geoip_db_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from(env_or_string("WS_DATA_DIR", "/tmp/shield/data")),
            admin_port: env_or("WS_ADMIN_PORT", 30199u16),
            log_level: env_or_string("WS_LOG_LEVEL", "info"),
            jwt_alg: env_or_string("WS_JWT_ALG", "HS256"),
            jwt_expiry_secs: env_or("WS_JWT_EXPIRY_SECS", 3600u64),
            cookie_secure: env_or("WS_COOKIE_SECURE", true),
            crawl_max_concurrency: env_or("WS_CRAWL_MAX_CONCURRENCY", 5usize),
            crawl_delay_ms: env_or("WS_CRAWL_DELAY_MS", 500u64),
            crawl_max_pages: env_or("WS_CRAWL_MAX_PAGES", 10_000usize),
            crawl_respect_robots: env_or("WS_CRAWL_RESPECT_ROBOTS", true),
            rate_global_requests: env_or("WS_RATE_GLOBAL_REQUESTS", 60u32),
            rate_global_window_secs: env_or("WS_RATE_GLOBAL_WINDOW_SECS", 60u64),
            max_body_size: env_or("WS_MAX_BODY_SIZE", 1_048_576usize),
            geoip_db_path: std::env::var("WS_GEOIP_DB_PATH").ok().map(PathBuf::from),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        Config::default()
    }

    pub fn cache_root(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn cache_dir(&self, site_id: &str) -> PathBuf {
        self.cache_root().join(site_id)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("shield.db")
    }

    /// Loads the process-wide secret key, generating one into
    /// `<data_dir>/.secret_key` (mode 0600) on first run.
    pub fn secret_key(&self) -> io::Result<Vec<u8>> {
        let path = self.data_dir.join(".secret_key");
        if path.exists() {
            return fs::read(&path);
        }

        fs::create_dir_all(&self.data_dir)?;
        let mut key = vec![0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut key);
        fs::write(&path, &key)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        Ok(key)
    }
}

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}
