//! Per-site HTTP app composition: the WAF middleware, the static responder,
//! and the POST/CSP-report/stats routes that together form one deployed
//! shield listener (spec.md §4.8, §4.13).

use std::future::{ready, Ready};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use actix_web::body::EitherBody;
use actix_web::dev::{self, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::{header, Method, StatusCode};
use actix_web::{web, App, Error, HttpRequest, HttpResponse};
use futures_util::future::LocalBoxFuture;

use crate::asset_learner::AssetLearner;
use crate::cache_index::CacheIndex;
use crate::db::Database;
use crate::events::SecurityEventCollector;
use crate::geo::GeoResolver;
use crate::hot_cache::{HotEntry, HotResponseCache};
use crate::post_handler::{resolve_client_ip, PostHandler};
use crate::rate_limiter::RateLimiter;
use crate::waf::{Waf, WafContext};

const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";
const STATIC_CACHE_CONTROL: &str = "public, max-age=3600, must-revalidate";

const BLOCKED_EXTENSIONS: &[&str] = &[
    "php", "php3", "php4", "php5", "phtml", "env", "htaccess", "htpasswd", "git", "asp", "aspx",
    "jsp", "cgi", "pl", "py", "rb", "sh", "conf", "ini", "bak", "sql", "log",
];

/// All per-site state a deployed shield's handlers and middleware share.
pub struct ShieldAppState {
    pub site_id: String,
    pub target_url: String,
    pub cache_dir: PathBuf,
    pub waf: Waf,
    pub rate_limiter: RateLimiter,
    pub geo: GeoResolver,
    pub cache_index: CacheIndex,
    pub hot_cache: HotResponseCache,
    pub asset_learner: AssetLearner,
    pub post_handler: PostHandler,
    pub events: SecurityEventCollector,
    pub csp: String,
    pub learn_mode_post: bool,
    pub learn_mode_csp: bool,
}

/// WAF middleware: evaluated before any static/POST handler runs.
#[derive(Default)]
pub struct WafGuard;

impl<S: 'static, B> Transform<S, ServiceRequest> for WafGuard
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = WafGuardMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(WafGuardMiddleware { service: Rc::new(service) }))
    }
}

pub struct WafGuardMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for WafGuardMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    dev::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let srv = self.service.clone();

        Box::pin(async move {
            let Some(state) = req.app_data::<web::Data<Arc<ShieldAppState>>>().cloned() else {
                let res = srv.call(req).await?;
                return Ok(res.map_into_left_body());
            };

            let client_ip = resolve_client_ip(req.request());
            let path = req.path().to_string();
            let query = req.query_string().to_string();
            let method = req.method().as_str().to_string();
            let user_agent = req
                .headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let content_length = match req.headers().get(header::CONTENT_LENGTH) {
                Some(v) => match v.to_str().ok().and_then(|s| s.parse::<u64>().ok()) {
                    Some(n) => Some(n),
                    None => {
                        let resp = canonical_blocked(400, "malformed_content_length");
                        return Ok(req.into_response(resp).map_into_right_body());
                    }
                },
                None => None,
            };

            let cf_country = req.headers().get("cf-ipcountry").and_then(|v| v.to_str().ok());
            let x_country = req.headers().get("x-country-code").and_then(|v| v.to_str().ok());
            let country = state.geo.resolve(cf_country, x_country, &client_ip);

            let ctx = WafContext {
                path: &path,
                query: &query,
                method: &method,
                user_agent: &user_agent,
                client_ip: &client_ip,
                country: country.as_deref(),
                content_length,
                post_has_matching_rule: method == "POST" && state.post_handler.has_matching_rule(&path),
                learn_mode_post: state.learn_mode_post,
            };

            let verdict = state.waf.evaluate(&ctx, Some(&state.rate_limiter));
            if verdict.is_blocked() {
                if !verdict.event_type().is_empty() {
                    state.events.emit(
                        Some(state.site_id.clone()),
                        verdict.event_type(),
                        verdict.severity(),
                        client_ip,
                        path,
                        method,
                        user_agent,
                        serde_json::json!({}),
                        country,
                        true,
                    );
                }
                let resp = canonical_blocked(verdict.status_code(), verdict.event_type());
                return Ok(req.into_response(resp).map_into_right_body());
            }

            let res = srv.call(req).await?;
            Ok(res.map_into_left_body())
        })
    }
}

fn canonical_blocked(status: u16, reason: &str) -> HttpResponse {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
    HttpResponse::build(code).json(serde_json::json!({"status": "blocked", "reason": reason}))
}

fn has_blocked_extension(path: &str) -> bool {
    path.rsplit('.').next().map(|ext| BLOCKED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())).unwrap_or(false)
        && path.contains('.')
}

fn path_is_unsafe(path: &str) -> bool {
    if path.contains('\0') || path.contains('\\') {
        return true;
    }
    path.split('/').any(|seg| seg == ".." || (!seg.is_empty() && seg.starts_with('.')))
}

fn security_headers(builder: &mut actix_web::HttpResponseBuilder) {
    builder
        .insert_header(("X-Content-Type-Options", "nosniff"))
        .insert_header(("X-Frame-Options", "DENY"))
        .insert_header(("X-XSS-Protection", "1; mode=block"))
        .insert_header(("Referrer-Policy", "strict-origin-when-cross-origin"))
        .insert_header(("Permissions-Policy", "camera=(), microphone=(), geolocation=(), payment=()"))
        .insert_header(("Strict-Transport-Security", "max-age=63072000; includeSubDomains; preload"))
        .insert_header(("Cross-Origin-Opener-Policy", "same-origin"))
        .insert_header(("X-Served-By", "FrontWall"));
}

fn respond_with_body(status: StatusCode, content_type: &str, cache_control: &str, csp: &str, method: &Method, body: Vec<u8>, learned: bool) -> HttpResponse {
    let mut builder = HttpResponse::build(status);
    security_headers(&mut builder);
    builder.insert_header((header::CACHE_CONTROL, cache_control));
    builder.insert_header(("Content-Security-Policy", csp));
    if learned {
        builder.insert_header(("X-Learned", "true"));
    }
    builder.content_type(content_type);
    if *method == Method::HEAD {
        builder.insert_header((header::CONTENT_LENGTH, body.len().to_string()));
        builder.body(())
    } else {
        builder.body(body)
    }
}

pub async fn static_handler(req: HttpRequest, state: web::Data<Arc<ShieldAppState>>) -> HttpResponse {
    let method = req.method().clone();
    if method != Method::GET && method != Method::HEAD {
        return canonical_blocked(400, "method_not_allowed");
    }

    let path = req.path().trim_start_matches('/').to_string();
    let query = req.query_string().to_string();

    if path_is_unsafe(&path) {
        return canonical_blocked(403, "path_unsafe");
    }
    if has_blocked_extension(&path) {
        return canonical_blocked(403, "extension_blocked");
    }

    let cache_key = if query.is_empty() { path.clone() } else { format!("{path}?{query}") };

    if let Some(entry) = state.hot_cache.get(&cache_key) {
        let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
        return respond_with_body(status, &entry.content_type, &entry.cache_control, &state.csp, &method, entry.body, false);
    }

    if let Some(cached) = state.cache_index.lookup(&path, &query) {
        let cache_control = if cached.is_immutable { IMMUTABLE_CACHE_CONTROL } else { STATIC_CACHE_CONTROL };
        if let Some(body) = &cached.body {
            state.hot_cache.put(
                cache_key,
                HotEntry { status: 200, content_type: cached.content_type.clone(), body: body.clone(), cache_control: cache_control.to_string() },
            );
            return respond_with_body(StatusCode::OK, &cached.content_type, cache_control, &state.csp, &method, body.clone(), false);
        }
        return match std::fs::read(&cached.disk_path) {
            Ok(bytes) => respond_with_body(StatusCode::OK, &cached.content_type, cache_control, &state.csp, &method, bytes, false),
            Err(_) => canonical_blocked(404, "not_found"),
        };
    }

    if state.asset_learner.is_enabled() {
        if let Some(full_path) = state.asset_learner.try_fetch_and_cache(&path, &query).await {
            if let Ok(rel) = full_path.strip_prefix(&state.cache_dir) {
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                if let Some(cached) = state.cache_index.add_learned_file(&state.cache_dir, &rel_str) {
                    let cache_control = if cached.is_immutable { IMMUTABLE_CACHE_CONTROL } else { STATIC_CACHE_CONTROL };
                    let body = cached.body.clone().or_else(|| std::fs::read(&cached.disk_path).ok()).unwrap_or_default();
                    return respond_with_body(StatusCode::OK, &cached.content_type, cache_control, &state.csp, &method, body, true);
                }
            }
        }
    }

    canonical_blocked(404, "not_found")
}

pub async fn post_route(req: HttpRequest, body: web::Bytes, state: web::Data<Arc<ShieldAppState>>) -> HttpResponse {
    state.post_handler.handle(&req, body).await
}

pub async fn csp_report_route(state: web::Data<Arc<ShieldAppState>>) -> HttpResponse {
    if state.learn_mode_csp {
        HttpResponse::NoContent().finish()
    } else {
        canonical_blocked(404, "not_found")
    }
}

pub async fn learn_log_route(state: web::Data<Arc<ShieldAppState>>) -> HttpResponse {
    if !state.learn_mode_post {
        return canonical_blocked(404, "not_found");
    }
    HttpResponse::Ok().json(state.post_handler.learn_log())
}

pub async fn cache_stats_route(state: web::Data<Arc<ShieldAppState>>) -> HttpResponse {
    let index = state.cache_index.stats();
    let hot = state.hot_cache.stats();
    HttpResponse::Ok().json(serde_json::json!({
        "index": {
            "files": index.files,
            "in_memory": index.in_memory,
            "memory_bytes": index.memory_bytes,
            "disk_only": index.disk_only,
        },
        "hot_cache": {
            "entries": hot.entries,
            "memory_bytes": hot.memory_bytes,
            "hits": hot.hits,
            "misses": hot.misses,
            "hit_rate": hot.hit_rate(),
        }
    }))
}

/// Builds the actix `App` factory closure used to bind a site's listener.
/// Kept generic over the app-wiring step so the supervisor can `.run()` it.
pub fn configure(cfg: &mut web::ServiceConfig, state: Arc<ShieldAppState>, waf_enabled: bool) {
    cfg.app_data(web::Data::new(state));
    if waf_enabled {
        cfg.service(
            web::scope("")
                .wrap(WafGuard)
                .route("/__csp_report", web::post().to(csp_report_route))
                .route("/__cache_stats", web::get().to(cache_stats_route))
                .route("/__learn_log", web::get().to(learn_log_route))
                .route("/{tail:.*}", web::post().to(post_route))
                .route("/{tail:.*}", web::get().to(static_handler))
                .route("/{tail:.*}", web::head().to(static_handler)),
        );
    } else {
        cfg.service(
            web::scope("")
                .route("/__csp_report", web::post().to(csp_report_route))
                .route("/__cache_stats", web::get().to(cache_stats_route))
                .route("/__learn_log", web::get().to(learn_log_route))
                .route("/{tail:.*}", web::post().to(post_route))
                .route("/{tail:.*}", web::get().to(static_handler))
                .route("/{tail:.*}", web::head().to(static_handler)),
        );
    }
}

#[allow(dead_code)]
fn app_factory(state: Arc<ShieldAppState>, waf_enabled: bool) -> App<impl actix_web::dev::ServiceFactory<actix_web::dev::ServiceRequest, Config = (), Response = ServiceResponse<actix_web::body::BoxBody>, Error = Error, InitError = ()>> {
    App::new().configure(move |cfg| configure(cfg, state.clone(), waf_enabled))
}

#[allow(dead_code)]
fn unused_database_ref(_db: &Database) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_extension_detects_php() {
        assert!(has_blocked_extension("index.php"));
        assert!(!has_blocked_extension("style.css"));
    }

    #[test]
    fn path_unsafe_detects_traversal_and_dotfiles() {
        assert!(path_is_unsafe("../etc/passwd"));
        assert!(path_is_unsafe(".env"));
        assert!(path_is_unsafe("a\\b"));
        assert!(!path_is_unsafe("about/index.html"));
    }
}
