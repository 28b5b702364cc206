//! The Shield: a protective caching reverse-proxy layer for legacy
//! dynamic web origins.
//!
//! `shield-core` owns the data model, persistence, crawler, cache index,
//! WAF, rate limiting, CSP, sanitizer, POST handling, asset learning,
//! security event collection, and the per-site listener supervisor.
//! The thin `shield-admin` binary exposes a small external-collaborator
//! HTTP surface over this crate.

pub mod asset_learner;
pub mod asset_processor;
pub mod cache_index;
pub mod config;
pub mod crawler;
pub mod csp;
pub mod db;
pub mod error;
pub mod events;
pub mod geo;
pub mod hot_cache;
pub mod models;
pub mod post_handler;
pub mod rate_limiter;
pub mod sanitizer;
pub mod shield_server;
pub mod sitemap;
pub mod supervisor;
pub mod url_rewriter;
pub mod waf;

pub use config::Config;
pub use db::Database;
pub use error::{CrawlError, CrawlResult, DatabaseError, DatabaseResult, ForwardError, ShieldError, ShieldResult};
