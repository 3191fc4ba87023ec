use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::AnalyzerConfig;

/// Errors raised by startup configuration validation.
#[derive(Error, Debug)]
pub enum ConfigValidationError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Flow ingestion / result broadcast channels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Pub/sub channel flow summaries arrive on
    pub flows_channel: String,
    /// Pub/sub channel alerts and health reports are published to
    pub results_channel: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flows_channel: "network_flows".to_string(),
            results_channel: "network_health".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Ingestion configuration
    pub ingest: IngestConfig,
    /// Analysis engine configuration
    pub analysis: AnalyzerConfig,
}

impl Config {
    /// Reject misconfiguration at startup rather than at analysis time.
    /// Zero-valued thresholds would silently disable or destabilise
    /// detection, so they are configuration errors.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let invalid = |key: &str| Err(ConfigValidationError::Invalid(key.to_string()));

        let d = &self.analysis.detection;
        if d.window_secs == 0 {
            return invalid("analysis.detection.window_secs must be non-zero");
        }
        if d.baseline_capacity == 0 {
            return invalid("analysis.detection.baseline_capacity must be non-zero");
        }
        if d.idle_flush_secs == 0 {
            return invalid("analysis.detection.idle_flush_secs must be non-zero");
        }

        let t = &self.analysis.ddos;
        if t.volumetric_multiplier <= 0.0 {
            return invalid("analysis.ddos.volumetric_multiplier must be positive");
        }
        if t.syn_flood_pps <= 0.0 {
            return invalid("analysis.ddos.syn_flood_pps must be positive");
        }
        if t.udp_amplification_attempts == 0 {
            return invalid("analysis.ddos.udp_amplification_attempts must be non-zero");
        }
        if t.icmp_flood_pps <= 0.0 {
            return invalid("analysis.ddos.icmp_flood_pps must be positive");
        }
        if t.http_flood_rps <= 0.0 {
            return invalid("analysis.ddos.http_flood_rps must be positive");
        }

        let p = &self.analysis.port_scan;
        if p.min_attempts == 0
            || p.tcp_syn_threshold == 0
            || p.udp_threshold == 0
            || p.sweep_threshold == 0
        {
            return invalid("analysis.port_scan thresholds must be non-zero");
        }
        if p.window_secs == 0 {
            return invalid("analysis.port_scan.window_secs must be non-zero");
        }

        let ml = &self.analysis.ml;
        if ml.anomaly_decision_threshold <= 0.0 || ml.anomaly_decision_threshold > 1.0 {
            return invalid("analysis.ml.anomaly_decision_threshold must be in (0, 1]");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_thresholds_are_rejected() {
        let mut config = Config::default();
        config.analysis.detection.window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.analysis.ddos.syn_flood_pps = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.analysis.port_scan.sweep_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.analysis.ml.anomaly_decision_threshold = 0.0;
        assert!(config.validate().is_err());
    }
}
