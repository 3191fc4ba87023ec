//! Flow summary ingestion and result broadcast over Redis pub/sub.
//!
//! The upstream flow engine publishes JSON flow summaries to a channel;
//! this module subscribes, feeds the analyzer (serialising all writes, so
//! the single-writer discipline holds) and publishes per-window alerts and
//! the fresh health report back out. A periodic idle-flush task keeps
//! windows closing during silent periods.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{error, info, warn};
use redis::AsyncCommands;
use serde::Deserialize;
use std::time::Duration;

use crate::core::analyzer::CycleOutcome;
use crate::core::flow::{BandwidthSnapshot, FlowRecord};
use crate::core::SharedAnalyzer;
use crate::models::IngestConfig;

/// One message from the flow engine: a batch of flows plus the window's
/// bandwidth totals.
#[derive(Debug, Deserialize)]
pub struct FlowSummary {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub flows: Vec<serde_json::Value>,
    #[serde(default, alias = "bandwidth_usage")]
    pub bandwidth: BandwidthSnapshot,
}

/// Parse flow records one by one so a single malformed record never aborts
/// the rest of the batch.
pub fn parse_flows(raw: &[serde_json::Value]) -> Vec<FlowRecord> {
    raw.iter()
        .filter_map(|value| match serde_json::from_value::<FlowRecord>(value.clone()) {
            Ok(flow) => Some(flow),
            Err(e) => {
                warn!("skipping malformed flow record in batch: {e}");
                None
            }
        })
        .collect()
}

pub struct FlowProcessor {
    redis: redis::Client,
    analyzer: SharedAnalyzer,
    config: IngestConfig,
}

impl FlowProcessor {
    pub fn new(redis: redis::Client, analyzer: SharedAnalyzer, config: IngestConfig) -> Self {
        Self {
            redis,
            analyzer,
            config,
        }
    }

    /// Subscribe to the flow channel and process messages until the
    /// connection drops. Per-message failures are logged, never fatal.
    pub async fn run(&self) -> Result<()> {
        let conn = self
            .redis
            .get_async_connection()
            .await
            .context("connecting to redis for flow subscription")?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(&self.config.flows_channel)
            .await
            .context("subscribing to flow channel")?;
        info!("subscribed to flow channel '{}'", self.config.flows_channel);

        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    error!("could not read flow message payload: {e}");
                    continue;
                }
            };
            if let Err(e) = self.handle_payload(&payload).await {
                error!("failed to process flow summary: {e:#}");
            }
        }

        info!("flow subscription stream ended");
        Ok(())
    }

    /// Periodically poke the analyzer so windows close even when no flow
    /// batches arrive; without this, silent periods would never flush.
    pub async fn run_idle_flush(&self, interval_secs: u64) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            let outcome = {
                let mut analyzer = self.analyzer.write().await;
                analyzer.tick(Utc::now())
            };
            if let Some(outcome) = outcome {
                if let Err(e) = self.publish(&outcome).await {
                    error!("failed to publish idle-flush results: {e:#}");
                }
            }
        }
    }

    async fn handle_payload(&self, payload: &str) -> Result<()> {
        let summary: FlowSummary =
            serde_json::from_str(payload).context("decoding flow summary")?;
        let flows = parse_flows(&summary.flows);

        let outcome = {
            let mut analyzer = self.analyzer.write().await;
            analyzer.ingest(&flows, &summary.bandwidth, Utc::now())
        };

        if let Some(outcome) = outcome {
            self.publish(&outcome).await?;
        }
        Ok(())
    }

    /// Hand completed-window alerts and the health report to the broadcast
    /// channel for external persistence and live viewers.
    async fn publish(&self, outcome: &CycleOutcome) -> Result<()> {
        let mut conn = self
            .redis
            .get_async_connection()
            .await
            .context("connecting to redis for result publish")?;

        for alert in &outcome.alerts {
            let payload = serde_json::to_string(alert).context("serializing alert")?;
            let _: () = conn
                .publish(&self.config.results_channel, payload)
                .await
                .context("publishing alert")?;
        }

        let payload =
            serde_json::to_string(&*outcome.report).context("serializing health report")?;
        let _: () = conn
            .publish(&self.config.results_channel, payload)
            .await
            .context("publishing health report")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_summary_accepts_engine_field_names() {
        let summary: FlowSummary = serde_json::from_str(
            r#"{
                "timestamp": "2024-06-01T12:00:00Z",
                "flows": [{"src_ip": "10.0.0.1", "dst_ip": "10.0.0.2", "protocol": 6}],
                "bandwidth_usage": {"total_bytes_this_window": 4096, "total_packets_this_window": 32}
            }"#,
        )
        .unwrap();
        assert_eq!(summary.bandwidth.total_bytes, 4096);
        assert_eq!(summary.bandwidth.total_packets, 32);
        assert_eq!(summary.flows.len(), 1);
    }

    #[test]
    fn malformed_records_do_not_abort_the_batch() {
        let raw = vec![
            serde_json::json!({"src_ip": "10.0.0.1", "dst_ip": "10.0.0.2", "protocol": 6}),
            serde_json::json!({"dst_ip": "10.0.0.2"}),
            serde_json::json!({"src_ip": "10.0.0.3", "dst_ip": "10.0.0.4", "protocol": 17}),
        ];
        let flows = parse_flows(&raw);
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].src_ip, "10.0.0.1");
        assert_eq!(flows[1].protocol, 17);
    }
}
