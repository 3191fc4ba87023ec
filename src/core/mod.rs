//! Core traffic-analysis engine.
//!
//! This module contains the stateful analysis pipeline: window
//! accumulation, baseline tracking, DDoS and port-scan classification,
//! pluggable threat scoring and the correlation layer that fuses security
//! findings with performance metrics.

pub mod alert;
pub mod analyzer;
pub mod baseline;
pub mod correlation;
pub mod ddos;
pub mod flow;
pub mod ml;
pub mod portscan;
pub mod window;

use serde::{Deserialize, Serialize};

/// Detection-window and baseline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Detection window duration in seconds.
    pub window_secs: u64,
    /// Completed-window rate samples kept per metric.
    pub baseline_capacity: usize,
    /// How often the idle-flush tick runs; windows close on this tick even
    /// when no flow batches arrive.
    pub idle_flush_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            baseline_capacity: 30,
            idle_flush_secs: 15,
        }
    }
}

/// DDoS classification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DdosThresholds {
    /// Multiplier over baseline for volumetric and application detection.
    pub volumetric_multiplier: f64,
    /// Aggregate SYN packets per second.
    pub syn_flood_pps: f64,
    /// Amplification-port hits per source before the source is flagged.
    pub udp_amplification_attempts: u64,
    /// Aggregate ICMP packets per second.
    pub icmp_flood_pps: f64,
    /// Absolute request-rate floor for HTTP-flood alerts.
    pub http_flood_rps: f64,
}

impl Default for DdosThresholds {
    fn default() -> Self {
        Self {
            volumetric_multiplier: 10.0,
            syn_flood_pps: 500.0,
            udp_amplification_attempts: 5,
            icmp_flood_pps: 300.0,
            http_flood_rps: 200.0,
        }
    }
}

/// Port-scan and sweep detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortScanConfig {
    /// Minimum attempts against one target before a scan is considered.
    pub min_attempts: usize,
    /// Indicator/port count threshold for SYN scans.
    pub tcp_syn_threshold: usize,
    /// Indicator/port count threshold for UDP scans.
    pub udp_threshold: usize,
    /// Rolling attempt window in seconds.
    pub window_secs: u64,
    /// Grace period kept beyond the rolling window before purging.
    pub grace_secs: u64,
    /// Distinct targets on one port before a sweep is reported.
    pub sweep_threshold: usize,
}

impl Default for PortScanConfig {
    fn default() -> Self {
        Self {
            min_attempts: 5,
            tcp_syn_threshold: 20,
            udp_threshold: 25,
            window_secs: 300,
            grace_secs: 60,
            sweep_threshold: 10,
        }
    }
}

/// Model-scoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MlConfig {
    /// Identifier the default scorer registers under.
    pub scorer_id: String,
    /// Optional path to a JSON weight file; an absent or unreadable model
    /// leaves the scorer in its safe placeholder mode.
    pub model_path: Option<String>,
    /// Default anomaly-decision threshold for registered scorers.
    pub anomaly_decision_threshold: f64,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            scorer_id: "flow_linear_v1".to_string(),
            model_path: None,
            anomaly_decision_threshold: 0.6,
        }
    }
}

/// Complete configuration for one analyzer instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub detection: DetectionConfig,
    pub ddos: DdosThresholds,
    pub port_scan: PortScanConfig,
    pub ml: MlConfig,
}

pub use alert::{AttackCategory, Severity, ThreatAlert, ThreatLevel};
pub use analyzer::{CycleOutcome, SharedAnalyzer, TrafficAnalyzer};
pub use baseline::{BaselineTracker, RateMetric};
pub use correlation::{CorrelationEngine, HealthReport, PerformanceSnapshot, SecurityStatus};
pub use ddos::DdosClassifier;
pub use flow::{BandwidthSnapshot, ConnectionState, FlowRecord};
pub use ml::{LinearScorer, MlPrediction, ScorerManager, ScorerSettings, ThreatScorer};
pub use portscan::PortScanClassifier;
pub use window::{ClosedWindow, WindowAccumulator};
