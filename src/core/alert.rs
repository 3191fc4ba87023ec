//! Unified threat alert types shared by all classifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Alert severity, ordered by escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Escalate by exactly one level, saturating at critical.
    pub fn escalate(self) -> Self {
        match self {
            Severity::Informational => Severity::Low,
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }

    /// Severity from a scorer confidence value via fixed bands.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence > 0.9 {
            Severity::High
        } else if confidence > 0.75 {
            Severity::Medium
        } else if confidence > 0.5 {
            Severity::Low
        } else {
            Severity::Informational
        }
    }
}

/// Overall threat level carried by a health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    /// Fixed security-score lookup used by the composite health score.
    pub fn security_score(self) -> f64 {
        match self {
            ThreatLevel::None => 1.0,
            ThreatLevel::Low => 0.8,
            ThreatLevel::Medium => 0.5,
            ThreatLevel::High => 0.2,
            ThreatLevel::Critical => 0.0,
        }
    }
}

/// Broad attack category of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackCategory {
    Volumetric,
    Protocol,
    Application,
    Reconnaissance,
    Anomaly,
}

impl AttackCategory {
    pub fn is_ddos(self) -> bool {
        matches!(
            self,
            AttackCategory::Volumetric | AttackCategory::Protocol | AttackCategory::Application
        )
    }
}

/// A single detected threat. Immutable once emitted; handed to the
/// correlation layer and to external persistence/broadcast collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAlert {
    pub id: Uuid,
    pub category: AttackCategory,
    /// Specific vectors, e.g. `bandwidth_flood`, `syn_flood`, `tcp_syn`.
    pub attack_vectors: Vec<String>,
    pub source_ips: Vec<String>,
    /// None when the target is ambiguous (e.g. reflected amplification).
    pub target_ip: Option<String>,
    pub observed_rate: f64,
    pub baseline_rate: f64,
    pub amplification_factor: f64,
    pub duration_seconds: f64,
    pub confidence: f64,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl ThreatAlert {
    /// Human-readable label used for threat aggregation and broadcast.
    pub fn label(&self) -> String {
        let vector = self
            .attack_vectors
            .first()
            .map(String::as_str)
            .unwrap_or("unknown");
        match self.category {
            AttackCategory::Volumetric => format!("ddos: volumetric ({vector})"),
            AttackCategory::Protocol => format!("ddos: protocol ({vector})"),
            AttackCategory::Application => format!("ddos: application ({vector})"),
            AttackCategory::Reconnaissance => format!("port scan: {vector}"),
            AttackCategory::Anomaly => format!("anomaly: {vector}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_escalates_one_level_and_saturates() {
        assert_eq!(Severity::Low.escalate(), Severity::Medium);
        assert_eq!(Severity::Medium.escalate(), Severity::High);
        assert_eq!(Severity::High.escalate(), Severity::Critical);
        assert_eq!(Severity::Critical.escalate(), Severity::Critical);
    }

    #[test]
    fn severity_confidence_bands() {
        assert_eq!(Severity::from_confidence(0.95), Severity::High);
        assert_eq!(Severity::from_confidence(0.8), Severity::Medium);
        assert_eq!(Severity::from_confidence(0.6), Severity::Low);
        assert_eq!(Severity::from_confidence(0.3), Severity::Informational);
    }

    #[test]
    fn security_score_is_monotonic_in_threat_level() {
        let levels = [
            ThreatLevel::None,
            ThreatLevel::Low,
            ThreatLevel::Medium,
            ThreatLevel::High,
            ThreatLevel::Critical,
        ];
        for pair in levels.windows(2) {
            assert!(pair[0].security_score() > pair[1].security_score());
        }
    }
}
