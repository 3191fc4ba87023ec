//! Traffic Analysis Service
//!
//! Entry point: loads configuration, wires the analyzer to the flow
//! ingestion pipeline and starts the web server exposing the latest
//! health assessment.

use actix_web::{web, App, HttpServer};
use chrono::Utc;
use dotenv::dotenv;
use log::{error, info};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::RwLock;

use traffic_analysis_service::api::{self, ApiState};
use traffic_analysis_service::config;
use traffic_analysis_service::core::{SharedAnalyzer, TrafficAnalyzer};
use traffic_analysis_service::ingest::FlowProcessor;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting traffic analysis service...");

    // Load and validate configuration
    let config = config::load_config().expect("Failed to load configuration");
    config.validate().expect("Invalid configuration");
    let config = Arc::new(config);

    // Expose Prometheus metrics
    PrometheusBuilder::new()
        .install()
        .expect("Failed to install metrics exporter");

    // Initialize Redis client
    let redis_client = redis::Client::open(config.redis.url.as_str())
        .expect("Failed to create Redis client");

    // The analyzer handle is owned here and passed explicitly to the API
    // and ingest tasks; there is no ambient global state.
    let analyzer: SharedAnalyzer = Arc::new(RwLock::new(TrafficAnalyzer::new(
        config.analysis.clone(),
        Utc::now(),
    )));

    // Start the flow subscriber and the idle-flush tick
    let processor = Arc::new(FlowProcessor::new(
        redis_client,
        analyzer.clone(),
        config.ingest.clone(),
    ));
    {
        let subscriber = processor.clone();
        tokio::spawn(async move {
            if let Err(e) = subscriber.run().await {
                error!("flow subscriber stopped: {e:#}");
            }
        });
        let flusher = processor.clone();
        let interval = config.analysis.detection.idle_flush_secs;
        tokio::spawn(async move {
            if let Err(e) = flusher.run_idle_flush(interval).await {
                error!("idle flush task stopped: {e:#}");
            }
        });
    }

    // Create API state
    let state = web::Data::new(ApiState {
        analyzer,
        config: config.clone(),
    });

    // Start HTTP server
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))?
        .run()
        .await
}
