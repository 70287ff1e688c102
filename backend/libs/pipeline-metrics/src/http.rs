//! Health and metrics endpoints shared by the pipeline services.

use actix_web::{dev::Server, middleware, web, App, HttpResponse, HttpServer};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{error, info};

use crate::PipelineContext;

/// `GET /healthz`: `200 OK` while healthy, `503 UNHEALTHY` afterwards
pub async fn healthz(ctx: web::Data<Arc<PipelineContext>>) -> HttpResponse {
    if ctx.health.is_healthy() {
        HttpResponse::Ok().content_type("text/plain").body("OK")
    } else {
        HttpResponse::ServiceUnavailable()
            .content_type("text/plain")
            .body("UNHEALTHY")
    }
}

/// `GET /metrics`: Prometheus text exposition of the pipeline counters
pub async fn serve_metrics(ctx: web::Data<Arc<PipelineContext>>) -> HttpResponse {
    match ctx.counters.render() {
        Ok(body) => HttpResponse::Ok()
            .content_type(TextEncoder::new().format_type())
            .body(body),
        Err(err) => {
            error!(error = %err, "Failed to render metrics");
            HttpResponse::InternalServerError().body(err.to_string())
        }
    }
}

/// `GET /stats`: current counter snapshot as JSON
pub async fn stats(ctx: web::Data<Arc<PipelineContext>>) -> HttpResponse {
    HttpResponse::Ok().json(ctx.counters.snapshot())
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(healthz))
        .route("/metrics", web::get().to(serve_metrics))
        .route("/stats", web::get().to(stats));
}

/// Bind the reporting server on `0.0.0.0:port`. The returned server must be
/// awaited or spawned to start serving.
pub fn serve(ctx: Arc<PipelineContext>, port: u16) -> std::io::Result<Server> {
    let addr = format!("0.0.0.0:{}", port);
    info!(service = %ctx.service, addr = %addr, "Starting HTTP server");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(ctx.clone()))
            .wrap(middleware::Logger::default())
            .configure(register_routes)
    })
    .workers(1)
    .disable_signals()
    .bind(&addr)?
    .run();

    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};

    #[actix_web::test]
    async fn test_healthz_reflects_health_flag() {
        let ctx = PipelineContext::new("http-test");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(ctx.clone()))
                .configure(register_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/healthz").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(test::read_body(resp).await, "OK");

        ctx.health.mark_unhealthy("test");
        let req = test::TestRequest::get().uri("/healthz").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(test::read_body(resp).await, "UNHEALTHY");
    }

    #[actix_web::test]
    async fn test_metrics_exposes_counters() {
        let ctx = PipelineContext::new("http-test");
        ctx.counters.inc_published();
        ctx.counters.add_duplicate(3);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(ctx.clone()))
                .configure(register_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("transactions_published_total{service=\"http-test\"} 1"));
        assert!(text.contains("transactions_duplicate_total{service=\"http-test\"} 3"));
    }

    #[actix_web::test]
    async fn test_stats_returns_snapshot_as_json() {
        let ctx = PipelineContext::new("http-test");
        ctx.counters.add_processed(2);
        ctx.counters.inc_error();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(ctx.clone()))
                .configure(register_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/stats").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body = test::read_body(resp).await;
        assert_eq!(
            body,
            r#"{"published":0,"failed":0,"processed":2,"duplicate":0,"error":1}"#
        );
    }
}
