//! Owns the process-wide map of deployed shields and their lifecycle
//! (spec.md §4.13): one actix-web listener per site, started on demand.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpServer};
use parking_lot::Mutex;

use crate::asset_learner::AssetLearner;
use crate::cache_index::CacheIndex;
use crate::config::Config;
use crate::csp;
use crate::db::Database;
use crate::events::SecurityEventCollector;
use crate::geo::GeoResolver;
use crate::hot_cache::{HotResponseCache, DEFAULT_MAX_ENTRIES, DEFAULT_MAX_MEMORY};
use crate::models::Site;
use crate::post_handler::PostHandler;
use crate::rate_limiter::RateLimiter;
use crate::shield_server::{configure, ShieldAppState};
use crate::waf::Waf;

const UNDEPLOY_GRACE_SECS: u64 = 10;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("site {0} not found")]
    SiteNotFound(String),
    #[error("cache directory for site {0} does not exist; run a crawl first")]
    CacheDirMissing(String),
    #[error("site {0} has no shield_port configured")]
    PortNotConfigured(String),
    #[error("port {0} is already in use by shield for site {1}")]
    PortInUse(u16, String),
    #[error(transparent)]
    Database(#[from] crate::error::DatabaseError),
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

struct ShieldInstance {
    handle: ServerHandle,
    task: tokio::task::JoinHandle<()>,
    state: Arc<ShieldAppState>,
    port: u16,
}

/// Process-wide registry of deployed shields, keyed by site id.
/// Mutated only from admin deploy/undeploy calls and startup auto-deploy;
/// status reads take a snapshot under the lock and release it immediately.
pub struct ShieldSupervisor {
    db: Database,
    config: Config,
    events: SecurityEventCollector,
    shields: Mutex<HashMap<String, ShieldInstance>>,
}

impl ShieldSupervisor {
    pub fn new(db: Database, config: Config, events: SecurityEventCollector) -> Self {
        ShieldSupervisor { db, config, events, shields: Mutex::new(HashMap::new()) }
    }

    pub fn is_deployed(&self, site_id: &str) -> bool {
        self.shields.lock().contains_key(site_id)
    }

    pub fn active_ports(&self) -> Vec<(String, u16)> {
        self.shields.lock().iter().map(|(id, inst)| (id.clone(), inst.port)).collect()
    }

    pub async fn deploy_shield(&self, site_id: &str) -> Result<u16, SupervisorError> {
        if self.is_deployed(site_id) {
            self.undeploy_shield(site_id).await?;
        }

        let site = self
            .db
            .get_site(site_id)?
            .ok_or_else(|| SupervisorError::SiteNotFound(site_id.to_string()))?;

        let cache_dir = self.config.cache_dir(site_id);
        if !cache_dir.is_dir() {
            return Err(SupervisorError::CacheDirMissing(site_id.to_string()));
        }
        let port = site.shield_port.ok_or_else(|| SupervisorError::PortNotConfigured(site_id.to_string()))?;
        if let Some((other, _)) = self.active_ports().into_iter().find(|(id, p)| *p == port && id != site_id) {
            return Err(SupervisorError::PortInUse(port, other));
        }

        let scan = csp::scan_cache_for_origins(&cache_dir, Some(&site.target_url));
        let csp_value = csp::build_csp(&scan);

        let cache_index = CacheIndex::new();
        cache_index.build(&cache_dir);

        let rate_limiter = RateLimiter::new(100, 60);
        let geo = match &self.config.geoip_db_path {
            Some(path) => GeoResolver::open(path),
            None => GeoResolver::disabled(),
        };

        let waf = Waf::new(
            site.waf_block_bots,
            site.waf_block_suspicious_paths,
            site.max_body_size as u64,
            site.ip_allowlist.clone(),
            site.ip_blocklist.clone(),
            site.blocked_countries.clone(),
            site.custom_suspicious_patterns.clone(),
        );

        let rules = self.db.list_active_post_rules(site_id)?;
        let post_handler = PostHandler::new(
            site_id.to_string(),
            site.target_url.clone(),
            site.internal_url.clone(),
            site.override_host.clone(),
            site.learn_mode_post,
            self.db.clone(),
            self.events.clone(),
            rules,
        );

        let asset_learner = AssetLearner::new(
            site_id.to_string(),
            site.target_url.clone(),
            cache_dir.clone(),
            site.internal_url.clone(),
            site.override_host.clone(),
        );
        asset_learner.set_enabled(true);

        let state = Arc::new(ShieldAppState {
            site_id: site_id.to_string(),
            target_url: site.target_url.clone(),
            cache_dir: cache_dir.clone(),
            waf,
            rate_limiter,
            geo,
            cache_index,
            hot_cache: HotResponseCache::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_MEMORY),
            asset_learner,
            post_handler,
            events: self.events.clone(),
            csp: csp_value,
            learn_mode_post: site.learn_mode_post,
            learn_mode_csp: site.learn_mode_csp,
        });

        let waf_enabled = site.waf_enabled;
        let bind_state = state.clone();
        let server = HttpServer::new(move || App::new().configure(|cfg| configure(cfg, bind_state.clone(), waf_enabled)))
            .bind(("0.0.0.0", port))?
            .workers(2)
            .run();

        let handle = server.handle();
        let owned_site_id = site_id.to_string();
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                log::error!("shield listener for {owned_site_id} exited: {err}");
            }
        });

        let mut site = site;
        site.shield_active = true;
        self.db.update_site(&site)?;

        self.shields.lock().insert(site_id.to_string(), ShieldInstance { handle, task, state, port });

        Ok(port)
    }

    pub async fn undeploy_shield(&self, site_id: &str) -> Result<(), SupervisorError> {
        let instance = self.shields.lock().remove(site_id);
        let Some(instance) = instance else { return Ok(()) };

        instance.state.asset_learner.set_enabled(false);
        let graceful = tokio::time::timeout(Duration::from_secs(UNDEPLOY_GRACE_SECS), instance.handle.stop(true)).await;
        if graceful.is_err() {
            instance.handle.stop(false).await;
        }
        instance.task.abort();

        if let Some(mut site) = self.db.get_site(site_id)? {
            site.shield_active = false;
            self.db.update_site(&site)?;
        }

        Ok(())
    }

    /// Called once at process start: redeploys every site marked active in
    /// the database. Clears the flag for any site whose prerequisites are
    /// no longer satisfied instead of failing startup.
    pub async fn auto_deploy_if_needed(&self) {
        let sites = match self.db.list_active_sites() {
            Ok(sites) => sites,
            Err(err) => {
                log::error!("auto-deploy: failed to list active sites: {err}");
                return;
            }
        };

        for mut site in sites {
            match self.deploy_shield(&site.id).await {
                Ok(port) => log::info!("auto-deployed shield for {} on port {port}", site.id),
                Err(err) => {
                    log::warn!("auto-deploy skipped for {}: {err}", site.id);
                    site.shield_active = false;
                    if let Err(db_err) = self.db.update_site(&site) {
                        log::error!("failed to clear shield_active for {}: {db_err}", site.id);
                    }
                }
            }
        }
    }
}

#[allow(dead_code)]
fn unused_site_ref(_s: &Site) {}
