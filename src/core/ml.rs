//! Pluggable threat-scoring capability.
//!
//! Scorers expose a small capability set (load, preprocess, predict,
//! feature names) behind a trait; the manager keeps a registry keyed by
//! scorer id plus an explicit activation list and per-scorer configuration.
//! Model training lives elsewhere entirely; the core only consumes the
//! "score a flow, return a prediction" contract.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::core::alert::{AttackCategory, Severity, ThreatAlert};
use crate::core::flow::{FlowRecord, ConnectionState, PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use crate::utils::clamp01;

/// Errors raised while loading scorer models.
#[derive(Error, Debug)]
pub enum ScorerError {
    #[error("model read error: {0}")]
    Read(#[from] std::io::Error),
    #[error("model parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model shape mismatch: expected {expected} weights, got {got}")]
    Shape { expected: usize, got: usize },
}

/// Outcome of scoring one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlPrediction {
    /// Anomaly probability-like score in [0, 1].
    pub score: f64,
    pub confidence: f64,
    /// Raw model output before squashing.
    pub anomaly_score: f64,
    pub threat_label: String,
    pub model_name: String,
}

/// Labels that mean "nothing to report".
const NORMAL_LABELS: [&str; 3] = ["normal", "normal_placeholder", "low_confidence_anomaly"];

fn is_normal_label(label: &str) -> bool {
    NORMAL_LABELS.contains(&label)
}

/// The scoring capability contract.
#[cfg_attr(test, mockall::automock)]
pub trait ThreatScorer: Send + Sync {
    fn id(&self) -> String;
    /// Load model weights from the given source. A scorer that fails to
    /// load must keep working as a safe always-normal fallback.
    fn load(&mut self, source: &str) -> Result<(), ScorerError>;
    /// Extract the feature vector for one flow. `None` means "cannot score
    /// this flow, skip it".
    fn preprocess(&self, flow: &FlowRecord) -> Option<Vec<f64>>;
    fn predict(&self, features: &[f64]) -> MlPrediction;
    fn feature_names(&self) -> Vec<String>;
}

/// Per-scorer runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerSettings {
    /// Predictions above this score raise an alert.
    pub anomaly_decision_threshold: f64,
}

impl Default for ScorerSettings {
    fn default() -> Self {
        Self {
            anomaly_decision_threshold: 0.6,
        }
    }
}

/// Registry of scorers with an explicit activation list.
pub struct ScorerManager {
    scorers: HashMap<String, Box<dyn ThreatScorer>>,
    active: Vec<String>,
    settings: HashMap<String, ScorerSettings>,
}

impl ScorerManager {
    pub fn new() -> Self {
        Self {
            scorers: HashMap::new(),
            active: Vec::new(),
            settings: HashMap::new(),
        }
    }

    pub fn register(&mut self, scorer: Box<dyn ThreatScorer>, settings: ScorerSettings) {
        let id = scorer.id();
        self.settings.insert(id.clone(), settings);
        self.scorers.insert(id, scorer);
    }

    pub fn activate(&mut self, id: &str) {
        if !self.scorers.contains_key(id) {
            warn!("cannot activate unregistered scorer {id}");
            return;
        }
        if !self.active.iter().any(|a| a == id) {
            self.active.push(id.to_string());
        }
    }

    pub fn deactivate(&mut self, id: &str) {
        self.active.retain(|a| a != id);
    }

    pub fn active_ids(&self) -> &[String] {
        &self.active
    }

    /// Registered/active inventory for the API.
    pub fn info(&self) -> serde_json::Value {
        let mut registered: Vec<&String> = self.scorers.keys().collect();
        registered.sort();
        json!({
            "registered": registered,
            "active": self.active,
            "settings": self.settings,
        })
    }

    /// Score a batch with every active scorer. Per-flow preprocessing
    /// failures skip that flow only; a missing scorer skips that scorer.
    pub fn analyze(
        &self,
        flows: &[FlowRecord],
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Vec<ThreatAlert> {
        let mut alerts = Vec::new();

        for id in &self.active {
            let Some(scorer) = self.scorers.get(id) else {
                warn!("active scorer {id} is not registered, skipping");
                continue;
            };
            let threshold = self
                .settings
                .get(id)
                .map(|s| s.anomaly_decision_threshold)
                .unwrap_or_else(|| ScorerSettings::default().anomaly_decision_threshold);

            for flow in flows {
                let Some(features) = scorer.preprocess(flow) else {
                    debug!("scorer {id} skipped flow from {}", flow.src_ip);
                    continue;
                };
                let prediction = scorer.predict(&features);
                if prediction.score > threshold || !is_normal_label(&prediction.threat_label) {
                    alerts.push(alert_from_prediction(flow, &prediction, threshold, timestamp));
                }
            }
        }
        alerts
    }
}

impl Default for ScorerManager {
    fn default() -> Self {
        Self::new()
    }
}

fn alert_from_prediction(
    flow: &FlowRecord,
    prediction: &MlPrediction,
    threshold: f64,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> ThreatAlert {
    let confidence = clamp01(prediction.confidence);
    ThreatAlert {
        id: Uuid::new_v4(),
        category: AttackCategory::Anomaly,
        attack_vectors: vec![prediction.threat_label.clone()],
        source_ips: vec![flow.src_ip.clone()],
        target_ip: Some(flow.dst_ip.clone()),
        observed_rate: prediction.score,
        baseline_rate: threshold,
        amplification_factor: 0.0,
        duration_seconds: flow.duration_secs,
        confidence,
        severity: Severity::from_confidence(confidence),
        timestamp,
        details: HashMap::from([
            ("model_name".to_string(), json!(prediction.model_name)),
            ("anomaly_score".to_string(), json!(prediction.anomaly_score)),
            ("dst_port".to_string(), json!(flow.dst_port)),
            ("protocol".to_string(), json!(flow.protocol)),
        ]),
    }
}

/// Feature layout shared by the linear scorer and its model files.
const FEATURE_NAMES: [&str; 22] = [
    "duration_secs",
    "bytes_sent",
    "bytes_received",
    "packets_sent",
    "packets_received",
    "avg_packet_size",
    "packets_per_second",
    "bytes_per_second",
    "total_bytes",
    "total_packets",
    "is_tcp",
    "is_udp",
    "is_icmp",
    "dst_port",
    "is_web_port",
    "is_system_port",
    "is_admin_port",
    "conn_established",
    "conn_syn",
    "conn_fin",
    "conn_reset",
    "conn_unknown",
];

const ADMIN_PORTS: [u16; 7] = [21, 22, 23, 25, 110, 143, 3389];

/// Linear model weights as stored on disk.
#[derive(Debug, Clone, Deserialize)]
struct LinearModel {
    weights: Vec<f64>,
    #[serde(default)]
    bias: f64,
}

/// A weighted-sum scorer over per-flow features. Until weights are loaded
/// it behaves as the always-normal placeholder so an unavailable model can
/// never fail a batch.
pub struct LinearScorer {
    id: String,
    model: Option<LinearModel>,
}

impl LinearScorer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }
}

impl ThreatScorer for LinearScorer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn load(&mut self, source: &str) -> Result<(), ScorerError> {
        let raw = std::fs::read_to_string(source)?;
        let model: LinearModel = serde_json::from_str(&raw)?;
        if model.weights.len() != FEATURE_NAMES.len() {
            return Err(ScorerError::Shape {
                expected: FEATURE_NAMES.len(),
                got: model.weights.len(),
            });
        }
        self.model = Some(model);
        Ok(())
    }

    fn preprocess(&self, flow: &FlowRecord) -> Option<Vec<f64>> {
        // A flow with no traffic at all carries nothing to score.
        if flow.total_bytes() == 0 && flow.total_packets() == 0 {
            return None;
        }

        let total_bytes = flow.total_bytes() as f64;
        let total_packets = flow.total_packets() as f64;
        let avg_packet_size = flow
            .avg_packet_size
            .unwrap_or_else(|| total_bytes / total_packets.max(1.0));
        let pps = flow
            .packets_per_second
            .unwrap_or_else(|| total_packets / flow.duration_secs.max(1e-6));
        let bps = flow
            .bytes_per_second
            .unwrap_or_else(|| total_bytes / flow.duration_secs.max(1e-6));

        Some(vec![
            flow.duration_secs,
            flow.bytes_sent as f64,
            flow.bytes_received as f64,
            flow.packets_sent as f64,
            flow.packets_received as f64,
            avg_packet_size,
            pps,
            bps,
            total_bytes,
            total_packets,
            f64::from(flow.protocol == PROTO_TCP),
            f64::from(flow.protocol == PROTO_UDP),
            f64::from(flow.protocol == PROTO_ICMP),
            flow.dst_port as f64,
            f64::from(flow.is_web_flow()),
            f64::from(flow.dst_port > 0 && flow.dst_port < 1024),
            f64::from(ADMIN_PORTS.contains(&flow.dst_port)),
            f64::from(flow.connection_state == ConnectionState::Established),
            f64::from(flow.connection_state.is_syn_like()),
            f64::from(matches!(
                flow.connection_state,
                ConnectionState::FinWait | ConnectionState::Closed
            )),
            f64::from(flow.connection_state == ConnectionState::Reset),
            f64::from(flow.connection_state == ConnectionState::Unknown),
        ])
    }

    fn predict(&self, features: &[f64]) -> MlPrediction {
        let Some(model) = &self.model else {
            return MlPrediction {
                score: 0.0,
                confidence: 0.1,
                anomaly_score: 0.0,
                threat_label: "normal_placeholder".to_string(),
                model_name: self.id.clone(),
            };
        };

        let raw: f64 = features
            .iter()
            .zip(&model.weights)
            .map(|(f, w)| f * w)
            .sum::<f64>()
            + model.bias;
        let score = 1.0 / (1.0 + (-raw).exp());
        let threat_label = if score >= 0.7 {
            "traffic_anomaly".to_string()
        } else if score > 0.5 {
            "low_confidence_anomaly".to_string()
        } else {
            "normal".to_string()
        };

        MlPrediction {
            score,
            confidence: clamp01((score - 0.5).abs() * 2.0),
            anomaly_score: raw,
            threat_label,
            model_name: self.id.clone(),
        }
    }

    fn feature_names(&self) -> Vec<String> {
        FEATURE_NAMES.iter().map(|n| n.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn flow(bytes: u64, packets: u64) -> FlowRecord {
        FlowRecord {
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            src_port: 40000,
            dst_port: 443,
            protocol: PROTO_TCP,
            bytes_sent: bytes,
            bytes_received: 0,
            packets_sent: packets,
            packets_received: 0,
            duration_secs: 1.0,
            connection_state: ConnectionState::Established,
            avg_packet_size: None,
            packets_per_second: None,
            bytes_per_second: None,
        }
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    fn anomalous_prediction(score: f64, confidence: f64) -> MlPrediction {
        MlPrediction {
            score,
            confidence,
            anomaly_score: score,
            threat_label: "traffic_anomaly".to_string(),
            model_name: "mock".to_string(),
        }
    }

    #[test]
    fn manager_alerts_when_score_crosses_threshold() {
        let mut scorer = MockThreatScorer::new();
        scorer.expect_id().return_const("mock".to_string());
        scorer.expect_preprocess().returning(|_| Some(vec![1.0]));
        scorer
            .expect_predict()
            .returning(|_| anomalous_prediction(0.9, 0.95));

        let mut manager = ScorerManager::new();
        manager.register(Box::new(scorer), ScorerSettings::default());
        manager.activate("mock");

        let alerts = manager.analyze(&[flow(1000, 10)], now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::High);
        assert_eq!(alerts[0].attack_vectors, vec!["traffic_anomaly".to_string()]);
    }

    #[test]
    fn preprocess_failure_skips_only_that_flow() {
        let mut scorer = MockThreatScorer::new();
        scorer.expect_id().return_const("mock".to_string());
        let mut calls = 0;
        scorer.expect_preprocess().returning_st(move |_| {
            calls += 1;
            if calls == 1 {
                None
            } else {
                Some(vec![1.0])
            }
        });
        scorer
            .expect_predict()
            .returning(|_| anomalous_prediction(0.9, 0.8));

        let mut manager = ScorerManager::new();
        manager.register(Box::new(scorer), ScorerSettings::default());
        manager.activate("mock");

        let alerts = manager.analyze(&[flow(1000, 10), flow(2000, 20)], now());
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn inactive_scorers_never_run() {
        let mut scorer = MockThreatScorer::new();
        scorer.expect_id().return_const("mock".to_string());
        scorer.expect_preprocess().never();

        let mut manager = ScorerManager::new();
        manager.register(Box::new(scorer), ScorerSettings::default());
        assert!(manager.analyze(&[flow(1000, 10)], now()).is_empty());

        manager.activate("mock");
        manager.deactivate("mock");
        assert!(manager.analyze(&[flow(1000, 10)], now()).is_empty());
    }

    #[test]
    fn unloaded_linear_scorer_is_a_safe_fallback() {
        let scorer = LinearScorer::new("flow_linear_v1");
        assert!(!scorer.is_loaded());
        assert_eq!(scorer.feature_names().len(), FEATURE_NAMES.len());

        let features = scorer.preprocess(&flow(1000, 10)).unwrap();
        assert_eq!(features.len(), FEATURE_NAMES.len());
        let prediction = scorer.predict(&features);
        assert_eq!(prediction.threat_label, "normal_placeholder");
        assert!((prediction.confidence - 0.1).abs() < 1e-9);

        // Via the manager: no alerts from the placeholder.
        let mut manager = ScorerManager::new();
        manager.register(Box::new(scorer), ScorerSettings::default());
        manager.activate("flow_linear_v1");
        assert!(manager.analyze(&[flow(1000, 10)], now()).is_empty());
    }

    #[test]
    fn linear_scorer_rejects_misshapen_models() {
        let dir = std::env::temp_dir().join("tas_ml_tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad_model.json");
        std::fs::write(&path, r#"{"weights":[1.0,2.0],"bias":0.0}"#).unwrap();

        let mut scorer = LinearScorer::new("flow_linear_v1");
        let err = scorer.load(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ScorerError::Shape { expected: 22, got: 2 }));
        assert!(!scorer.is_loaded());
    }

    #[test]
    fn loaded_linear_scorer_flags_heavy_flows() {
        let dir = std::env::temp_dir().join("tas_ml_tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pps_model.json");
        // Weight only packets_per_second (index 6): heavy flows score high.
        let mut weights = vec![0.0f64; 22];
        weights[6] = 0.01;
        std::fs::write(
            &path,
            serde_json::to_string(&serde_json::json!({"weights": weights, "bias": -5.0})).unwrap(),
        )
        .unwrap();

        let mut scorer = LinearScorer::new("flow_linear_v1");
        scorer.load(path.to_str().unwrap()).unwrap();
        assert!(scorer.is_loaded());

        let quiet = scorer.predict(&scorer.preprocess(&flow(1000, 10)).unwrap());
        assert_eq!(quiet.threat_label, "normal");

        let noisy = scorer.predict(&scorer.preprocess(&flow(100_000, 5000)).unwrap());
        assert_eq!(noisy.threat_label, "traffic_anomaly");
        assert!(noisy.score > 0.9);
    }
}
