//! Error types shared across the Shield's engines.
//!
//! Each engine that crosses a boundary (database, network, filesystem)
//! gets its own `thiserror` enum rather than a single catch-all, so
//! callers can match on what actually went wrong.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database connection not initialized")]
    NotInitialized,
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("site has no cache directory configured")]
    NoCacheDir,

    #[error("crawl already running for this site")]
    AlreadyRunning,
}

pub type CrawlResult<T> = Result<T, CrawlError>;

#[derive(Debug, Error)]
pub enum ShieldError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("site {0} has no shield_port configured")]
    NoPort(String),

    #[error("port {0} already in use by another deployed site")]
    PortInUse(u16),

    #[error("cache directory for site {0} does not exist")]
    NoCacheDir(String),

    #[error("site {0} is not currently deployed")]
    NotDeployed(String),

    #[error("failed to bind listener: {0}")]
    Bind(String),
}

pub type ShieldResult<T> = Result<T, ShieldError>;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request timed out")]
    Timeout,

    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}
