//! API endpoints for the traffic analysis service.
//!
//! Read-side HTTP surface: service health, the latest network health
//! report (pull-style accessor) and the scorer inventory. Flow ingestion
//! happens over the message bus, not HTTP.

use actix_web::{web, HttpResponse, Responder};
use serde::Serialize;
use std::sync::Arc;

use crate::core::SharedAnalyzer;
use crate::models::Config;

pub struct ApiState {
    pub analyzer: SharedAnalyzer,
    pub config: Arc<Config>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/network-health").route(web::get().to(network_health)))
            .service(web::resource("/scorers").route(web::get().to(scorers))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Service liveness endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Latest network health report. The report is swapped atomically by the
/// analyzer, so this always returns a consistent snapshot.
async fn network_health(state: web::Data<ApiState>) -> impl Responder {
    let report = state.analyzer.read().await.latest_report();
    HttpResponse::Ok().json(&*report)
}

/// Registered and active threat scorers.
async fn scorers(state: web::Data<ApiState>) -> impl Responder {
    let info = state.analyzer.read().await.scorer_info();
    HttpResponse::Ok().json(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AnalyzerConfig, TrafficAnalyzer};
    use actix_web::{test, App};
    use chrono::Utc;
    use tokio::sync::RwLock;

    fn state() -> web::Data<ApiState> {
        let analyzer = Arc::new(RwLock::new(TrafficAnalyzer::new(
            AnalyzerConfig::default(),
            Utc::now(),
        )));
        web::Data::new(ApiState {
            analyzer,
            config: Arc::new(Config::default()),
        })
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_network_health_returns_latest_report() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::get()
            .uri("/api/v1/network-health")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["overall_health_score"], serde_json::json!(0.5));
        assert!(body["security"]["active_threats"]
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[actix_web::test]
    async fn test_scorers_inventory() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::get().uri("/api/v1/scorers").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["registered"], serde_json::json!(["flow_linear_v1"]));
        assert!(body["active"].as_array().unwrap().is_empty());
    }
}
