//! SQLite-backed persistence for sites, pages, crawl jobs, POST rules and
//! security events.
//!
//! Mirrors the connection-management shape of a classic `Arc<Mutex<Connection>>`
//! wrapper with a fluent `execute`/`query`/`query_one` interface: one exclusive
//! lock per call, no long-lived transactions held across `.await` points.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{DatabaseError, DatabaseResult};
use crate::models::{
    CrawlJob, CrawlJobStatus, FieldType, FormDescriptor, Page, PostRule, RuleField,
    SecurityEvent, Severity, Site,
};

pub struct Database {
    connection: Arc<Mutex<Connection>>,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Database {
            connection: Arc::clone(&self.connection),
        }
    }
}

impl Database {
    pub fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(path)?;
        connection.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        let db = Database {
            connection: Arc::new(Mutex::new(connection)),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> DatabaseResult<Self> {
        let connection = Connection::open_in_memory()?;
        let db = Database {
            connection: Arc::new(Mutex::new(connection)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn execute<P: rusqlite::Params>(&self, sql: &str, p: P) -> DatabaseResult<usize> {
        let conn = self.connection.lock().map_err(|_| DatabaseError::NotInitialized)?;
        Ok(conn.execute(sql, p)?)
    }

    fn query<T, F, P>(&self, sql: &str, p: P, f: F) -> DatabaseResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
        P: rusqlite::Params,
    {
        let conn = self.connection.lock().map_err(|_| DatabaseError::NotInitialized)?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(p, f)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn query_one<T, F, P>(&self, sql: &str, p: P, f: F) -> DatabaseResult<Option<T>>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
        P: rusqlite::Params,
    {
        let conn = self.connection.lock().map_err(|_| DatabaseError::NotInitialized)?;
        let mut stmt = conn.prepare(sql)?;
        Ok(stmt.query_row(p, f).optional()?)
    }

    fn migrate(&self) -> DatabaseResult<()> {
        self.execute(
            "CREATE TABLE IF NOT EXISTS sites (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                target_url TEXT NOT NULL,
                internal_url TEXT,
                override_host TEXT,
                crawl_max_concurrency INTEGER NOT NULL,
                crawl_delay_ms INTEGER NOT NULL,
                crawl_max_pages INTEGER NOT NULL,
                crawl_respect_robots INTEGER NOT NULL,
                waf_enabled INTEGER NOT NULL,
                waf_block_bots INTEGER NOT NULL,
                waf_block_suspicious_paths INTEGER NOT NULL,
                max_body_size INTEGER NOT NULL,
                ip_allowlist TEXT NOT NULL,
                ip_blocklist TEXT NOT NULL,
                blocked_countries TEXT NOT NULL,
                custom_suspicious_patterns TEXT NOT NULL,
                learn_mode_post INTEGER NOT NULL,
                learn_mode_csp INTEGER NOT NULL,
                shield_port INTEGER,
                shield_active INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        self.execute(
            "CREATE TABLE IF NOT EXISTS pages (
                site_id TEXT NOT NULL,
                url TEXT NOT NULL,
                cache_path TEXT NOT NULL,
                content_type TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                bytes INTEGER NOT NULL,
                etag TEXT,
                last_modified TEXT,
                forms_detected TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (site_id, url)
            )",
            [],
        )?;

        self.execute(
            "CREATE TABLE IF NOT EXISTS crawl_jobs (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL,
                status TEXT NOT NULL,
                pages_found INTEGER NOT NULL,
                pages_crawled INTEGER NOT NULL,
                assets_downloaded INTEGER NOT NULL,
                errors INTEGER NOT NULL,
                error_log TEXT NOT NULL,
                created_at TEXT NOT NULL,
                finished_at TEXT
            )",
            [],
        )?;

        self.execute(
            "CREATE TABLE IF NOT EXISTS post_rules (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL,
                url_pattern TEXT NOT NULL,
                forward_to TEXT NOT NULL,
                rate_limit_requests INTEGER NOT NULL,
                rate_limit_window_secs INTEGER NOT NULL,
                honeypot_field TEXT,
                allowed_actions TEXT NOT NULL,
                success_redirect TEXT,
                success_message TEXT NOT NULL,
                is_active INTEGER NOT NULL
            )",
            [],
        )?;

        self.execute(
            "CREATE TABLE IF NOT EXISTS rule_fields (
                rule_id TEXT NOT NULL,
                field_name TEXT NOT NULL,
                field_type TEXT NOT NULL,
                required INTEGER NOT NULL,
                max_length INTEGER NOT NULL,
                validation_regex TEXT,
                PRIMARY KEY (rule_id, field_name)
            )",
            [],
        )?;

        self.execute(
            "CREATE TABLE IF NOT EXISTS security_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id TEXT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                client_ip TEXT NOT NULL,
                path TEXT NOT NULL,
                method TEXT NOT NULL,
                user_agent TEXT NOT NULL,
                details TEXT NOT NULL,
                country TEXT,
                blocked INTEGER NOT NULL
            )",
            [],
        )?;
        self.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_site_ts ON security_events(site_id, timestamp)",
            [],
        )?;

        Ok(())
    }

    // ---- sites ----

    pub fn insert_site(&self, site: &Site) -> DatabaseResult<()> {
        self.execute(
            "INSERT INTO sites (id, name, target_url, internal_url, override_host,
                crawl_max_concurrency, crawl_delay_ms, crawl_max_pages, crawl_respect_robots,
                waf_enabled, waf_block_bots, waf_block_suspicious_paths, max_body_size,
                ip_allowlist, ip_blocklist, blocked_countries, custom_suspicious_patterns,
                learn_mode_post, learn_mode_csp, shield_port, shield_active, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)",
            params![
                site.id,
                site.name,
                site.target_url,
                site.internal_url,
                site.override_host,
                site.crawl_max_concurrency as i64,
                site.crawl_delay_ms as i64,
                site.crawl_max_pages as i64,
                site.crawl_respect_robots,
                site.waf_enabled,
                site.waf_block_bots,
                site.waf_block_suspicious_paths,
                site.max_body_size as i64,
                set_to_json(&site.ip_allowlist),
                set_to_json(&site.ip_blocklist),
                set_to_json(&site.blocked_countries),
                serde_json::to_string(&site.custom_suspicious_patterns).unwrap(),
                site.learn_mode_post,
                site.learn_mode_csp,
                site.shield_port.map(|p| p as i64),
                site.shield_active,
                site.created_at.to_rfc3339(),
                site.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_site(&self, site: &Site) -> DatabaseResult<()> {
        self.execute(
            "UPDATE sites SET name=?2, target_url=?3, internal_url=?4, override_host=?5,
                crawl_max_concurrency=?6, crawl_delay_ms=?7, crawl_max_pages=?8, crawl_respect_robots=?9,
                waf_enabled=?10, waf_block_bots=?11, waf_block_suspicious_paths=?12, max_body_size=?13,
                ip_allowlist=?14, ip_blocklist=?15, blocked_countries=?16, custom_suspicious_patterns=?17,
                learn_mode_post=?18, learn_mode_csp=?19, shield_port=?20, shield_active=?21, updated_at=?22
             WHERE id=?1",
            params![
                site.id,
                site.name,
                site.target_url,
                site.internal_url,
                site.override_host,
                site.crawl_max_concurrency as i64,
                site.crawl_delay_ms as i64,
                site.crawl_max_pages as i64,
                site.crawl_respect_robots,
                site.waf_enabled,
                site.waf_block_bots,
                site.waf_block_suspicious_paths,
                site.max_body_size as i64,
                set_to_json(&site.ip_allowlist),
                set_to_json(&site.ip_blocklist),
                set_to_json(&site.blocked_countries),
                serde_json::to_string(&site.custom_suspicious_patterns).unwrap(),
                site.learn_mode_post,
                site.learn_mode_csp,
                site.shield_port.map(|p| p as i64),
                site.shield_active,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_site(&self, id: &str) -> DatabaseResult<()> {
        self.execute("DELETE FROM sites WHERE id=?1", params![id])?;
        Ok(())
    }

    pub fn get_site(&self, id: &str) -> DatabaseResult<Option<Site>> {
        self.query_one(
            "SELECT * FROM sites WHERE id=?1",
            params![id],
            row_to_site,
        )
    }

    pub fn list_sites(&self) -> DatabaseResult<Vec<Site>> {
        self.query("SELECT * FROM sites ORDER BY created_at", [], row_to_site)
    }

    pub fn list_active_sites(&self) -> DatabaseResult<Vec<Site>> {
        self.query(
            "SELECT * FROM sites WHERE shield_active=1 ORDER BY created_at",
            [],
            row_to_site,
        )
    }

    // ---- pages ----

    pub fn upsert_page(&self, page: &Page) -> DatabaseResult<()> {
        self.execute(
            "INSERT INTO pages (site_id, url, cache_path, content_type, status_code, bytes,
                etag, last_modified, forms_detected, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
             ON CONFLICT(site_id, url) DO UPDATE SET
                cache_path=excluded.cache_path, content_type=excluded.content_type,
                status_code=excluded.status_code, bytes=excluded.bytes, etag=excluded.etag,
                last_modified=excluded.last_modified, forms_detected=excluded.forms_detected",
            params![
                page.site_id,
                page.url,
                page.cache_path,
                page.content_type,
                page.status_code as i64,
                page.bytes as i64,
                page.etag,
                page.last_modified,
                serde_json::to_string(&page.forms_detected).unwrap(),
                page.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_page(&self, site_id: &str, url: &str) -> DatabaseResult<Option<Page>> {
        self.query_one(
            "SELECT * FROM pages WHERE site_id=?1 AND url=?2",
            params![site_id, url],
            row_to_page,
        )
    }

    pub fn list_pages(&self, site_id: &str) -> DatabaseResult<Vec<Page>> {
        self.query(
            "SELECT * FROM pages WHERE site_id=?1 ORDER BY url",
            params![site_id],
            row_to_page,
        )
    }

    pub fn delete_pages_for_site(&self, site_id: &str) -> DatabaseResult<()> {
        self.execute("DELETE FROM pages WHERE site_id=?1", params![site_id])?;
        Ok(())
    }

    // ---- crawl jobs ----

    pub fn insert_crawl_job(&self, job: &CrawlJob) -> DatabaseResult<()> {
        self.execute(
            "INSERT INTO crawl_jobs (id, site_id, status, pages_found, pages_crawled,
                assets_downloaded, errors, error_log, created_at, finished_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                job.id,
                job.site_id,
                job.status.as_str(),
                job.pages_found as i64,
                job.pages_crawled as i64,
                job.assets_downloaded as i64,
                job.errors as i64,
                job.error_log.join("\n"),
                job.created_at.to_rfc3339(),
                job.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn update_crawl_job(&self, job: &CrawlJob) -> DatabaseResult<()> {
        self.execute(
            "UPDATE crawl_jobs SET status=?2, pages_found=?3, pages_crawled=?4,
                assets_downloaded=?5, errors=?6, error_log=?7, finished_at=?8 WHERE id=?1",
            params![
                job.id,
                job.status.as_str(),
                job.pages_found as i64,
                job.pages_crawled as i64,
                job.assets_downloaded as i64,
                job.errors as i64,
                job.error_log.join("\n"),
                job.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_crawl_job(&self, id: &str) -> DatabaseResult<Option<CrawlJob>> {
        self.query_one(
            "SELECT * FROM crawl_jobs WHERE id=?1",
            params![id],
            row_to_crawl_job,
        )
    }

    pub fn latest_crawl_job_for_site(&self, site_id: &str) -> DatabaseResult<Option<CrawlJob>> {
        self.query_one(
            "SELECT * FROM crawl_jobs WHERE site_id=?1 ORDER BY created_at DESC LIMIT 1",
            params![site_id],
            row_to_crawl_job,
        )
    }

    pub fn running_crawl_job_for_site(&self, site_id: &str) -> DatabaseResult<Option<CrawlJob>> {
        self.query_one(
            "SELECT * FROM crawl_jobs WHERE site_id=?1 AND status='running' LIMIT 1",
            params![site_id],
            row_to_crawl_job,
        )
    }

    // ---- post rules ----

    pub fn insert_post_rule(&self, rule: &PostRule) -> DatabaseResult<()> {
        self.execute(
            "INSERT INTO post_rules (id, site_id, url_pattern, forward_to, rate_limit_requests,
                rate_limit_window_secs, honeypot_field, allowed_actions, success_redirect,
                success_message, is_active)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                rule.id,
                rule.site_id,
                rule.url_pattern,
                rule.forward_to,
                rule.rate_limit_requests as i64,
                rule.rate_limit_window_secs as i64,
                rule.honeypot_field,
                serde_json::to_string(&rule.allowed_actions).unwrap(),
                rule.success_redirect,
                rule.success_message,
                rule.is_active,
            ],
        )?;
        for field in &rule.fields {
            self.insert_rule_field(&rule.id, field)?;
        }
        Ok(())
    }

    fn insert_rule_field(&self, rule_id: &str, field: &RuleField) -> DatabaseResult<()> {
        self.execute(
            "INSERT INTO rule_fields (rule_id, field_name, field_type, required, max_length, validation_regex)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                rule_id,
                field.field_name,
                field.field_type.as_str(),
                field.required,
                field.max_length as i64,
                field.validation_regex,
            ],
        )?;
        Ok(())
    }

    pub fn list_active_post_rules(&self, site_id: &str) -> DatabaseResult<Vec<PostRule>> {
        let mut rules = self.query(
            "SELECT * FROM post_rules WHERE site_id=?1 AND is_active=1",
            params![site_id],
            row_to_post_rule,
        )?;
        for rule in &mut rules {
            rule.fields = self.query(
                "SELECT * FROM rule_fields WHERE rule_id=?1",
                params![rule.id],
                row_to_rule_field,
            )?;
        }
        Ok(rules)
    }

    // ---- security events ----

    pub fn insert_security_event(&self, event: &SecurityEvent) -> DatabaseResult<()> {
        self.execute(
            "INSERT INTO security_events (site_id, timestamp, event_type, severity, client_ip,
                path, method, user_agent, details, country, blocked)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                event.site_id,
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.severity.as_str(),
                event.client_ip,
                event.path,
                event.method,
                event.user_agent,
                event.details.to_string(),
                event.country,
                event.blocked,
            ],
        )?;
        Ok(())
    }

    pub fn recent_security_events(&self, site_id: &str, limit: u32) -> DatabaseResult<Vec<SecurityEvent>> {
        self.query(
            "SELECT * FROM security_events WHERE site_id=?1 ORDER BY timestamp DESC LIMIT ?2",
            params![site_id, limit],
            row_to_security_event,
        )
    }

    pub fn count_blocked_since(&self, site_id: &str, since: DateTime<Utc>) -> DatabaseResult<u64> {
        let rows = self.query(
            "SELECT COUNT(*) FROM security_events WHERE site_id=?1 AND blocked=1 AND timestamp>=?2",
            params![site_id, since.to_rfc3339()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(rows.first().copied().unwrap_or(0) as u64)
    }

    pub fn purge_security_events_before(&self, cutoff: DateTime<Utc>) -> DatabaseResult<usize> {
        self.execute("DELETE FROM security_events WHERE timestamp < ?1", params![cutoff.to_rfc3339()])
    }

    pub fn security_event_summary(&self, site_id: &str, hours: i64) -> DatabaseResult<crate::events::EventSummary> {
        let since = Utc::now() - chrono::Duration::hours(hours);
        let prev_start = since - chrono::Duration::hours(hours);

        let total_events = self.scalar_i64(
            "SELECT COUNT(*) FROM security_events WHERE site_id=?1 AND timestamp>=?2",
            params![site_id, since.to_rfc3339()],
        )?;
        let total_prev_period = self.scalar_i64(
            "SELECT COUNT(*) FROM security_events WHERE site_id=?1 AND timestamp>=?2 AND timestamp<?3",
            params![site_id, prev_start.to_rfc3339(), since.to_rfc3339()],
        )?;
        let unique_ips = self.scalar_i64(
            "SELECT COUNT(DISTINCT client_ip) FROM security_events WHERE site_id=?1 AND timestamp>=?2",
            params![site_id, since.to_rfc3339()],
        )?;
        let top_event_type = self.query_one(
            "SELECT event_type FROM security_events WHERE site_id=?1 AND timestamp>=?2
             GROUP BY event_type ORDER BY COUNT(*) DESC LIMIT 1",
            params![site_id, since.to_rfc3339()],
            |row| row.get::<_, String>(0),
        )?;
        let top_severity = self.query_one(
            "SELECT severity FROM security_events WHERE site_id=?1 AND timestamp>=?2
             GROUP BY severity ORDER BY COUNT(*) DESC LIMIT 1",
            params![site_id, since.to_rfc3339()],
            |row| row.get::<_, String>(0),
        )?;

        let threat_level = if total_events > 0 {
            top_severity.unwrap_or_else(|| "none".to_string())
        } else {
            "none".to_string()
        };

        Ok(crate::events::EventSummary {
            total_events,
            total_prev_period,
            unique_ips,
            top_event_type,
            threat_level,
        })
    }

    pub fn security_event_timeline(&self, site_id: &str, hours: i64) -> DatabaseResult<Vec<crate::events::TimelineBucket>> {
        let since = Utc::now() - chrono::Duration::hours(hours);
        let fmt = if hours > 24 * 3 { "%Y-%m-%d" } else { "%Y-%m-%d %H:00" };
        let rows = self.query(
            "SELECT strftime(?1, timestamp) AS bucket, severity, COUNT(*) AS cnt
             FROM security_events WHERE site_id=?2 AND timestamp>=?3
             GROUP BY bucket, severity ORDER BY bucket ASC",
            params![fmt, site_id, since.to_rfc3339()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?)),
        )?;

        let mut buckets: Vec<crate::events::TimelineBucket> = Vec::new();
        for (bucket, severity, cnt) in rows {
            let entry = match buckets.iter_mut().find(|b| b.bucket == bucket) {
                Some(b) => b,
                None => {
                    buckets.push(crate::events::TimelineBucket {
                        bucket: bucket.clone(),
                        critical: 0,
                        high: 0,
                        medium: 0,
                        low: 0,
                        total: 0,
                    });
                    buckets.last_mut().unwrap()
                }
            };
            match severity.as_str() {
                "critical" => entry.critical += cnt,
                "high" => entry.high += cnt,
                "medium" => entry.medium += cnt,
                _ => entry.low += cnt,
            }
            entry.total += cnt;
        }
        Ok(buckets)
    }

    pub fn security_event_top_attackers(
        &self,
        site_id: &str,
        hours: i64,
        limit: usize,
    ) -> DatabaseResult<Vec<crate::events::TopAttacker>> {
        let since = Utc::now() - chrono::Duration::hours(hours);
        let rows = self.query(
            "SELECT client_ip, COUNT(*) AS cnt, MAX(timestamp) AS last_seen
             FROM security_events WHERE site_id=?1 AND timestamp>=?2
             GROUP BY client_ip ORDER BY cnt DESC LIMIT ?3",
            params![site_id, since.to_rfc3339(), limit as i64],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )?;

        let mut out = Vec::new();
        for (ip, count, last_seen) in rows {
            let top_event_type = self.query_one(
                "SELECT event_type FROM security_events
                 WHERE site_id=?1 AND client_ip=?2 AND timestamp>=?3
                 GROUP BY event_type ORDER BY COUNT(*) DESC LIMIT 1",
                params![site_id, ip, since.to_rfc3339()],
                |row| row.get::<_, String>(0),
            )?;
            let severity = self
                .query_one(
                    "SELECT severity FROM security_events
                     WHERE site_id=?1 AND client_ip=?2 AND timestamp>=?3
                     ORDER BY CASE severity WHEN 'critical' THEN 0 WHEN 'high' THEN 1 WHEN 'medium' THEN 2 ELSE 3 END
                     LIMIT 1",
                    params![site_id, ip, since.to_rfc3339()],
                    |row| row.get::<_, String>(0),
                )?
                .unwrap_or_else(|| "low".to_string());

            out.push(crate::events::TopAttacker {
                ip,
                count,
                last_seen: last_seen.map(parse_dt),
                top_event_type,
                severity,
            });
        }
        Ok(out)
    }

    pub fn security_event_breakdown(
        &self,
        site_id: &str,
        hours: i64,
        column: &str,
    ) -> DatabaseResult<Vec<crate::events::CountBreakdown>> {
        let since = Utc::now() - chrono::Duration::hours(hours);
        let col = match column {
            "severity" => "severity",
            _ => "event_type",
        };
        let sql = format!(
            "SELECT {col}, COUNT(*) AS cnt FROM security_events
             WHERE site_id=?1 AND timestamp>=?2 GROUP BY {col} ORDER BY cnt DESC"
        );
        self.query(&sql, params![site_id, since.to_rfc3339()], |row| {
            Ok(crate::events::CountBreakdown { key: row.get::<_, String>(0)?, count: row.get::<_, i64>(1)? })
        })
    }

    pub fn security_event_global_summary(&self, hours: i64) -> DatabaseResult<crate::events::GlobalSummary> {
        let since = Utc::now() - chrono::Duration::hours(hours);
        let total_events = self.scalar_i64(
            "SELECT COUNT(*) FROM security_events WHERE timestamp>=?1",
            params![since.to_rfc3339()],
        )?;
        let unique_ips = self.scalar_i64(
            "SELECT COUNT(DISTINCT client_ip) FROM security_events WHERE timestamp>=?1",
            params![since.to_rfc3339()],
        )?;
        let top_event_type = self.query_one(
            "SELECT event_type FROM security_events WHERE timestamp>=?1
             GROUP BY event_type ORDER BY COUNT(*) DESC LIMIT 1",
            params![since.to_rfc3339()],
            |row| row.get::<_, String>(0),
        )?;
        let affected_sites = self.scalar_i64(
            "SELECT COUNT(DISTINCT site_id) FROM security_events WHERE timestamp>=?1",
            params![since.to_rfc3339()],
        )?;

        Ok(crate::events::GlobalSummary { total_events, unique_ips, top_event_type, affected_sites })
    }

    fn scalar_i64<P: rusqlite::Params>(&self, sql: &str, p: P) -> DatabaseResult<i64> {
        Ok(self.query_one(sql, p, |row| row.get::<_, i64>(0))?.unwrap_or(0))
    }

    // ---- post rule mutation (learn-mode autogeneration) ----

    pub fn set_post_rule_active(&self, rule_id: &str, is_active: bool) -> DatabaseResult<()> {
        self.execute("UPDATE post_rules SET is_active=?2 WHERE id=?1", params![rule_id, is_active])?;
        Ok(())
    }

    pub fn update_post_rule_allowed_actions(&self, rule_id: &str, actions: &[String]) -> DatabaseResult<()> {
        self.execute(
            "UPDATE post_rules SET allowed_actions=?2 WHERE id=?1",
            params![rule_id, serde_json::to_string(actions).unwrap()],
        )?;
        Ok(())
    }
}

fn set_to_json(set: &std::collections::HashSet<String>) -> String {
    let mut v: Vec<&String> = set.iter().collect();
    v.sort();
    serde_json::to_string(&v).unwrap()
}

fn json_to_set(s: &str) -> std::collections::HashSet<String> {
    serde_json::from_str::<Vec<String>>(s).unwrap_or_default().into_iter().collect()
}

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn row_to_site(row: &Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get("id")?,
        name: row.get("name")?,
        target_url: row.get("target_url")?,
        internal_url: row.get("internal_url")?,
        override_host: row.get("override_host")?,
        crawl_max_concurrency: row.get::<_, i64>("crawl_max_concurrency")? as usize,
        crawl_delay_ms: row.get::<_, i64>("crawl_delay_ms")? as u64,
        crawl_max_pages: row.get::<_, i64>("crawl_max_pages")? as usize,
        crawl_respect_robots: row.get("crawl_respect_robots")?,
        waf_enabled: row.get("waf_enabled")?,
        waf_block_bots: row.get("waf_block_bots")?,
        waf_block_suspicious_paths: row.get("waf_block_suspicious_paths")?,
        max_body_size: row.get::<_, i64>("max_body_size")? as usize,
        ip_allowlist: json_to_set(&row.get::<_, String>("ip_allowlist")?),
        ip_blocklist: json_to_set(&row.get::<_, String>("ip_blocklist")?),
        blocked_countries: json_to_set(&row.get::<_, String>("blocked_countries")?),
        custom_suspicious_patterns: serde_json::from_str(&row.get::<_, String>("custom_suspicious_patterns")?)
            .unwrap_or_default(),
        learn_mode_post: row.get("learn_mode_post")?,
        learn_mode_csp: row.get("learn_mode_csp")?,
        shield_port: row.get::<_, Option<i64>>("shield_port")?.map(|p| p as u16),
        shield_active: row.get("shield_active")?,
        created_at: parse_dt(row.get("created_at")?),
        updated_at: parse_dt(row.get("updated_at")?),
    })
}

fn row_to_page(row: &Row<'_>) -> rusqlite::Result<Page> {
    Ok(Page {
        site_id: row.get("site_id")?,
        url: row.get("url")?,
        cache_path: row.get("cache_path")?,
        content_type: row.get("content_type")?,
        status_code: row.get::<_, i64>("status_code")? as u16,
        bytes: row.get::<_, i64>("bytes")? as u64,
        etag: row.get("etag")?,
        last_modified: row.get("last_modified")?,
        forms_detected: serde_json::from_str::<Vec<FormDescriptor>>(&row.get::<_, String>("forms_detected")?)
            .unwrap_or_default(),
        created_at: parse_dt(row.get("created_at")?),
    })
}

fn row_to_crawl_job(row: &Row<'_>) -> rusqlite::Result<CrawlJob> {
    let error_log: String = row.get("error_log")?;
    Ok(CrawlJob {
        id: row.get("id")?,
        site_id: row.get("site_id")?,
        status: CrawlJobStatus::from_str(&row.get::<_, String>("status")?),
        pages_found: row.get::<_, i64>("pages_found")? as u64,
        pages_crawled: row.get::<_, i64>("pages_crawled")? as u64,
        assets_downloaded: row.get::<_, i64>("assets_downloaded")? as u64,
        errors: row.get::<_, i64>("errors")? as u64,
        error_log: if error_log.is_empty() {
            Vec::new()
        } else {
            error_log.split('\n').map(|s| s.to_string()).collect()
        },
        created_at: parse_dt(row.get("created_at")?),
        finished_at: row.get::<_, Option<String>>("finished_at")?.map(parse_dt),
    })
}

fn row_to_post_rule(row: &Row<'_>) -> rusqlite::Result<PostRule> {
    Ok(PostRule {
        id: row.get("id")?,
        site_id: row.get("site_id")?,
        url_pattern: row.get("url_pattern")?,
        forward_to: row.get("forward_to")?,
        rate_limit_requests: row.get::<_, i64>("rate_limit_requests")? as u32,
        rate_limit_window_secs: row.get::<_, i64>("rate_limit_window_secs")? as u64,
        honeypot_field: row.get("honeypot_field")?,
        allowed_actions: serde_json::from_str(&row.get::<_, String>("allowed_actions")?).unwrap_or_default(),
        success_redirect: row.get("success_redirect")?,
        success_message: row.get("success_message")?,
        is_active: row.get("is_active")?,
        fields: Vec::new(),
    })
}

fn row_to_rule_field(row: &Row<'_>) -> rusqlite::Result<RuleField> {
    Ok(RuleField {
        field_name: row.get("field_name")?,
        field_type: FieldType::from_str(&row.get::<_, String>("field_type")?),
        required: row.get("required")?,
        max_length: row.get::<_, i64>("max_length")? as usize,
        validation_regex: row.get("validation_regex")?,
    })
}

fn row_to_security_event(row: &Row<'_>) -> rusqlite::Result<SecurityEvent> {
    Ok(SecurityEvent {
        site_id: row.get("site_id")?,
        timestamp: parse_dt(row.get("timestamp")?),
        event_type: row.get("event_type")?,
        severity: match row.get::<_, String>("severity")?.as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            _ => Severity::Low,
        },
        client_ip: row.get("client_ip")?,
        path: row.get("path")?,
        method: row.get("method")?,
        user_agent: row.get("user_agent")?,
        details: serde_json::from_str(&row.get::<_, String>("details")?).unwrap_or(serde_json::Value::Null),
        country: row.get("country")?,
        blocked: row.get("blocked")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;

    #[test]
    fn site_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let site = Site::new("s1", "Example", "https://old.example");
        db.insert_site(&site).unwrap();
        let fetched = db.get_site("s1").unwrap().unwrap();
        assert_eq!(fetched.name, "Example");
        assert_eq!(fetched.target_url, "https://old.example");
        assert!(!fetched.shield_active);
    }

    #[test]
    fn site_update_persists() {
        let db = Database::open_in_memory().unwrap();
        let mut site = Site::new("s1", "Example", "https://old.example");
        db.insert_site(&site).unwrap();
        site.shield_active = true;
        site.shield_port = Some(9001);
        db.update_site(&site).unwrap();
        let fetched = db.get_site("s1").unwrap().unwrap();
        assert!(fetched.shield_active);
        assert_eq!(fetched.shield_port, Some(9001));
    }

    #[test]
    fn list_active_sites_filters() {
        let db = Database::open_in_memory().unwrap();
        let mut a = Site::new("a", "A", "https://a.example");
        let b = Site::new("b", "B", "https://b.example");
        a.shield_active = true;
        db.insert_site(&a).unwrap();
        db.insert_site(&b).unwrap();
        let active = db.list_active_sites().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[test]
    fn page_upsert_overwrites() {
        let db = Database::open_in_memory().unwrap();
        let mut page = Page {
            site_id: "s1".into(),
            url: "/about".into(),
            cache_path: "about/index.html".into(),
            content_type: "text/html".into(),
            status_code: 200,
            bytes: 100,
            etag: None,
            last_modified: None,
            forms_detected: vec![],
            created_at: Utc::now(),
        };
        db.upsert_page(&page).unwrap();
        page.bytes = 200;
        db.upsert_page(&page).unwrap();
        let fetched = db.get_page("s1", "/about").unwrap().unwrap();
        assert_eq!(fetched.bytes, 200);
        assert_eq!(db.list_pages("s1").unwrap().len(), 1);
    }

    #[test]
    fn crawl_job_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let mut job = CrawlJob::new("j1", "s1");
        db.insert_crawl_job(&job).unwrap();
        assert!(db.running_crawl_job_for_site("s1").unwrap().is_none());
        job.status = CrawlJobStatus::Running;
        job.pages_crawled = 10;
        db.update_crawl_job(&job).unwrap();
        assert!(db.running_crawl_job_for_site("s1").unwrap().is_some());
        let latest = db.latest_crawl_job_for_site("s1").unwrap().unwrap();
        assert_eq!(latest.pages_crawled, 10);
    }

    #[test]
    fn post_rule_with_fields_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let rule = PostRule {
            id: "r1".into(),
            site_id: "s1".into(),
            url_pattern: "/contact".into(),
            forward_to: "https://old.example/contact".into(),
            rate_limit_requests: 5,
            rate_limit_window_secs: 60,
            honeypot_field: Some("website".into()),
            allowed_actions: vec!["submit".into()],
            success_redirect: Some("/thanks".into()),
            success_message: "Thanks!".into(),
            is_active: true,
            fields: vec![RuleField {
                field_name: "email".into(),
                field_type: FieldType::Email,
                required: true,
                max_length: 254,
                validation_regex: None,
            }],
        };
        db.insert_post_rule(&rule).unwrap();
        let rules = db.list_active_post_rules("s1").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].fields.len(), 1);
        assert_eq!(rules[0].fields[0].field_name, "email");
    }

    #[test]
    fn security_event_counting() {
        let db = Database::open_in_memory().unwrap();
        let event = SecurityEvent::new(
            Some("s1".into()),
            "sql_injection",
            Severity::High,
            "1.2.3.4",
            "/login",
            "POST",
            "curl/8.0",
            serde_json::json!({"pattern": "UNION SELECT"}),
            None,
            true,
        );
        db.insert_security_event(&event).unwrap();
        let count = db.count_blocked_since("s1", Utc::now() - chrono::Duration::hours(1)).unwrap();
        assert_eq!(count, 1);
        let recent = db.recent_security_events("s1", 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, "sql_injection");
    }
}
