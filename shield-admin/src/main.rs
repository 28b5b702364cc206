//! Thin HTTP driver for the Shield's admin/collaborator surface (spec.md §6).
//!
//! Owns no business logic: every route delegates straight into `shield-core`
//! (the crawler, the supervisor, the security event collector).

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::http::header;
use actix_web::{delete, get, middleware, post, web, App, HttpResponse, HttpServer, Responder};
use shield_core::config::Config;
use shield_core::crawler::CrawlerEngine;
use shield_core::events::SecurityEventCollector;
use shield_core::models::{CrawlJob, CrawlJobStatus};
use shield_core::supervisor::ShieldSupervisor;
use shield_core::Database;

struct AppState {
    db: Database,
    config: Config,
    supervisor: ShieldSupervisor,
}

#[post("/sites/{id}/deploy")]
async fn deploy_site(path: web::Path<String>, state: web::Data<Arc<AppState>>) -> impl Responder {
    let site_id = path.into_inner();
    match state.supervisor.deploy_shield(&site_id).await {
        Ok(port) => HttpResponse::Ok().json(serde_json::json!({"site_id": site_id, "port": port, "deployed": true})),
        Err(err) => HttpResponse::BadRequest().json(serde_json::json!({"error": err.to_string()})),
    }
}

#[post("/sites/{id}/undeploy")]
async fn undeploy_site(path: web::Path<String>, state: web::Data<Arc<AppState>>) -> impl Responder {
    let site_id = path.into_inner();
    match state.supervisor.undeploy_shield(&site_id).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({"site_id": site_id, "deployed": false})),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({"error": err.to_string()})),
    }
}

#[get("/status")]
async fn status(state: web::Data<Arc<AppState>>) -> impl Responder {
    let sites = match state.db.list_sites() {
        Ok(sites) => sites,
        Err(err) => return HttpResponse::InternalServerError().json(serde_json::json!({"error": err.to_string()})),
    };
    let deployed: Vec<serde_json::Value> = sites
        .into_iter()
        .map(|site| {
            serde_json::json!({
                "id": site.id,
                "name": site.name,
                "shield_active": site.shield_active,
                "is_deployed": state.supervisor.is_deployed(&site.id),
                "shield_port": site.shield_port,
            })
        })
        .collect();
    HttpResponse::Ok().json(serde_json::json!({"sites": deployed}))
}

#[post("/sites/{id}/crawl")]
async fn start_crawl(path: web::Path<String>, state: web::Data<Arc<AppState>>) -> impl Responder {
    let site_id = path.into_inner();

    let site = match state.db.get_site(&site_id) {
        Ok(Some(site)) => site,
        Ok(None) => return HttpResponse::NotFound().json(serde_json::json!({"error": "site not found"})),
        Err(err) => return HttpResponse::InternalServerError().json(serde_json::json!({"error": err.to_string()})),
    };

    match state.db.running_crawl_job_for_site(&site_id) {
        Ok(Some(job)) => return HttpResponse::Conflict().json(serde_json::json!({"error": "crawl already running", "job_id": job.id})),
        Ok(None) => {}
        Err(err) => return HttpResponse::InternalServerError().json(serde_json::json!({"error": err.to_string()})),
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let mut job = CrawlJob::new(job_id.clone(), site_id.clone());
    job.status = CrawlJobStatus::Running;
    if let Err(err) = state.db.insert_crawl_job(&job) {
        return HttpResponse::InternalServerError().json(serde_json::json!({"error": err.to_string()}));
    }

    let engine = CrawlerEngine::new(
        site_id.clone(),
        site.target_url.clone(),
        state.config.cache_dir(&site_id),
        site.crawl_max_concurrency,
        site.crawl_delay_ms,
        site.crawl_max_pages,
        site.crawl_respect_robots,
        site.internal_url.clone(),
        site.override_host.clone(),
        state.db.clone(),
    );

    let db = state.db.clone();
    tokio::spawn(async move {
        if let Err(err) = engine.run(&job_id).await {
            log::error!("crawl job {job_id} failed: {err}");
            if let Ok(Some(mut job)) = db.get_crawl_job(&job_id) {
                job.status = CrawlJobStatus::Failed;
                job.error_log.push(err.to_string());
                let _ = db.update_crawl_job(&job);
            }
        }
    });

    HttpResponse::Accepted().json(serde_json::json!({"job_id": job.id, "site_id": site_id, "status": "running"}))
}

#[post("/sites/{id}/crawl/stop")]
async fn stop_crawl(path: web::Path<String>, state: web::Data<Arc<AppState>>) -> impl Responder {
    let site_id = path.into_inner();
    match state.db.running_crawl_job_for_site(&site_id) {
        Ok(Some(mut job)) => {
            job.status = CrawlJobStatus::Stopped;
            match state.db.update_crawl_job(&job) {
                Ok(()) => HttpResponse::Ok().json(serde_json::json!({"job_id": job.id, "status": "stopped"})),
                Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({"error": err.to_string()})),
            }
        }
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({"error": "no running crawl for site"})),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({"error": err.to_string()})),
    }
}

#[get("/sites/{id}/crawl/status")]
async fn crawl_status(path: web::Path<String>, state: web::Data<Arc<AppState>>) -> impl Responder {
    let site_id = path.into_inner();
    match state.db.latest_crawl_job_for_site(&site_id) {
        Ok(Some(job)) => HttpResponse::Ok().json(job),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({"error": "no crawl job for site"})),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({"error": err.to_string()})),
    }
}

#[get("/analytics/{id}/summary")]
async fn analytics_summary(path: web::Path<String>, state: web::Data<Arc<AppState>>) -> impl Responder {
    let site_id = path.into_inner();
    match state.db.security_event_summary(&site_id, 24) {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({"error": err.to_string()})),
    }
}

#[get("/analytics/summary")]
async fn global_analytics_summary(state: web::Data<Arc<AppState>>) -> impl Responder {
    match state.db.security_event_global_summary(24) {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({"error": err.to_string()})),
    }
}

#[delete("/sites/{id}")]
async fn delete_site(path: web::Path<String>, state: web::Data<Arc<AppState>>) -> impl Responder {
    let site_id = path.into_inner();
    let _ = state.supervisor.undeploy_shield(&site_id).await;
    match state.db.delete_site(&site_id) {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({"deleted": site_id})),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({"error": err.to_string()})),
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    std::env::set_var("RUST_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));
    env_logger::init();

    let config = Config::load();
    let db = Database::open(&config.db_path()).expect("failed to open database");

    let events = SecurityEventCollector::new(db.clone());
    events.start();

    let supervisor = ShieldSupervisor::new(db.clone(), config.clone(), events.clone());
    supervisor.auto_deploy_if_needed().await;

    let state = Arc::new(AppState { db, config: config.clone(), supervisor });

    let bind_address = format!("0.0.0.0:{}", config.admin_port);
    log::info!("starting shield-admin on {bind_address}");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST", "DELETE"])
            .allowed_headers(vec![header::AUTHORIZATION, header::ACCEPT, header::CONTENT_TYPE])
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .service(deploy_site)
            .service(undeploy_site)
            .service(status)
            .service(start_crawl)
            .service(stop_crawl)
            .service(crawl_status)
            .service(analytics_summary)
            .service(global_analytics_summary)
            .service(delete_site)
    })
    .bind(&bind_address)?
    .workers(2)
    .run()
    .await
}
