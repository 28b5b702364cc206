//! Security Event Collector: a single-writer batched pipeline from WAF/POST
//! decision points down to the `security_events` table.
//!
//! `emit` never touches the database — it pushes into bounded in-memory
//! rings (for `get_recent`) and an unbounded queue drained by a background
//! flush loop, the same shape as a typical web app's async event sink.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::db::Database;
use crate::models::{SecurityEvent, Severity};

const FLUSH_INTERVAL_SECS: u64 = 2;
const CLEANUP_INTERVAL_SECS: u64 = 3600;
const RETENTION_DAYS: i64 = 30;
const RING_MAX: usize = 1000;
const FLUSH_BATCH_MAX: usize = 200;

struct Ring {
    items: VecDeque<SecurityEvent>,
}

impl Ring {
    fn new() -> Self {
        Ring { items: VecDeque::with_capacity(RING_MAX) }
    }

    fn push(&mut self, event: SecurityEvent) {
        if self.items.len() >= RING_MAX {
            self.items.pop_front();
        }
        self.items.push_back(event);
    }

    fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        self.items.iter().rev().take(limit).cloned().collect()
    }
}

struct Inner {
    global_ring: Ring,
    site_rings: HashMap<String, Ring>,
}

/// Summary counters for a site over a trailing window.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventSummary {
    pub total_events: i64,
    pub total_prev_period: i64,
    pub unique_ips: i64,
    pub top_event_type: Option<String>,
    pub threat_level: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TimelineBucket {
    pub bucket: String,
    pub critical: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
    pub total: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TopAttacker {
    pub ip: String,
    pub count: i64,
    pub last_seen: Option<DateTime<Utc>>,
    pub top_event_type: Option<String>,
    pub severity: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CountBreakdown {
    pub key: String,
    pub count: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GlobalSummary {
    pub total_events: i64,
    pub unique_ips: i64,
    pub top_event_type: Option<String>,
    pub affected_sites: i64,
}

/// The collector itself. Cloning shares the same rings, queue, and database.
#[derive(Clone)]
pub struct SecurityEventCollector {
    inner: Arc<Mutex<Inner>>,
    sender: mpsc::UnboundedSender<SecurityEvent>,
    receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<SecurityEvent>>>>,
    db: Database,
}

impl SecurityEventCollector {
    pub fn new(db: Database) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        SecurityEventCollector {
            inner: Arc::new(Mutex::new(Inner { global_ring: Ring::new(), site_rings: HashMap::new() })),
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            db,
        }
    }

    /// Spawns the background flush and cleanup loops. Call once per process.
    pub fn start(&self) {
        let Some(mut receiver) = self.receiver.lock().take() else { return };
        let db = self.db.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(FLUSH_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let mut batch = Vec::new();
                while batch.len() < FLUSH_BATCH_MAX {
                    match receiver.try_recv() {
                        Ok(event) => batch.push(event),
                        Err(_) => break,
                    }
                }
                if batch.is_empty() {
                    continue;
                }
                for event in &batch {
                    if let Err(err) = db.insert_security_event(event) {
                        log::error!("security event flush error: {err}");
                    }
                }
                log::debug!("flushed {} security events", batch.len());
            }
        });

        let db = self.db.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(CLEANUP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let cutoff = Utc::now() - ChronoDuration::days(RETENTION_DAYS);
                match db.purge_security_events_before(cutoff) {
                    Ok(n) if n > 0 => log::info!("purged {n} old security events"),
                    Ok(_) => {}
                    Err(err) => log::error!("security event cleanup error: {err}"),
                }
            }
        });
    }

    /// Synchronous, never blocks: updates rings and enqueues for the async
    /// flush loop to persist.
    #[allow(clippy::too_many_arguments)]
    pub fn emit(
        &self,
        site_id: Option<String>,
        event_type: impl Into<String>,
        severity: Severity,
        client_ip: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
        user_agent: impl Into<String>,
        details: serde_json::Value,
        country: Option<String>,
        blocked: bool,
    ) {
        let event = SecurityEvent::new(
            site_id.clone(),
            event_type,
            severity,
            client_ip,
            path,
            method,
            user_agent,
            details,
            country,
            blocked,
        );

        {
            let mut inner = self.inner.lock();
            inner.global_ring.push(event.clone());
            if let Some(site_id) = &site_id {
                inner.site_rings.entry(site_id.clone()).or_insert_with(Ring::new).push(event.clone());
            }
        }

        let _ = self.sender.send(event);
    }

    /// Returns recent events straight from the in-memory ring, no I/O.
    pub fn get_recent(&self, site_id: Option<&str>, limit: usize) -> Vec<SecurityEvent> {
        let inner = self.inner.lock();
        match site_id {
            Some(id) => inner.site_rings.get(id).map(|r| r.recent(limit)).unwrap_or_default(),
            None => inner.global_ring.recent(limit),
        }
    }

    pub fn summary(&self, site_id: &str, hours: i64) -> crate::error::DatabaseResult<EventSummary> {
        self.db.security_event_summary(site_id, hours)
    }

    pub fn timeline(&self, site_id: &str, hours: i64) -> crate::error::DatabaseResult<Vec<TimelineBucket>> {
        self.db.security_event_timeline(site_id, hours)
    }

    pub fn top_attackers(&self, site_id: &str, hours: i64, limit: usize) -> crate::error::DatabaseResult<Vec<TopAttacker>> {
        self.db.security_event_top_attackers(site_id, hours, limit)
    }

    pub fn event_type_breakdown(&self, site_id: &str, hours: i64) -> crate::error::DatabaseResult<Vec<CountBreakdown>> {
        self.db.security_event_breakdown(site_id, hours, "event_type")
    }

    pub fn severity_breakdown(&self, site_id: &str, hours: i64) -> crate::error::DatabaseResult<Vec<CountBreakdown>> {
        self.db.security_event_breakdown(site_id, hours, "severity")
    }

    pub fn global_summary(&self, hours: i64) -> crate::error::DatabaseResult<GlobalSummary> {
        self.db.security_event_global_summary(hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> SecurityEventCollector {
        SecurityEventCollector::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn emit_populates_global_and_site_ring() {
        let c = collector();
        c.emit(
            Some("site-1".into()),
            "bot_blocked",
            Severity::High,
            "1.2.3.4",
            "/",
            "GET",
            "sqlmap",
            serde_json::json!({}),
            None,
            true,
        );
        assert_eq!(c.get_recent(None, 10).len(), 1);
        assert_eq!(c.get_recent(Some("site-1"), 10).len(), 1);
        assert_eq!(c.get_recent(Some("site-2"), 10).len(), 0);
    }

    #[test]
    fn ring_drops_oldest_beyond_cap() {
        let c = collector();
        for i in 0..1100 {
            c.emit(
                None,
                "x",
                Severity::Low,
                format!("1.1.1.{i}"),
                "/",
                "GET",
                "ua",
                serde_json::json!({}),
                None,
                false,
            );
        }
        assert_eq!(c.get_recent(None, 2000).len(), RING_MAX);
    }

    #[test]
    fn recent_returns_newest_first() {
        let c = collector();
        c.emit(None, "a", Severity::Low, "1.1.1.1", "/a", "GET", "ua", serde_json::json!({}), None, false);
        c.emit(None, "b", Severity::Low, "1.1.1.1", "/b", "GET", "ua", serde_json::json!({}), None, false);
        let recent = c.get_recent(None, 1);
        assert_eq!(recent[0].event_type, "b");
    }
}
