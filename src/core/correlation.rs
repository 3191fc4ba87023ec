//! Correlation of security findings with measured network performance.
//!
//! Produces the single externally consumed artifact: a health report
//! blending a performance snapshot with the window's threat picture into a
//! composite score, narrative insights and recommended actions. Every rule
//! here is deterministic template logic over the computed values.

use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

use crate::core::alert::{AttackCategory, Severity, ThreatAlert, ThreatLevel};
use crate::core::flow::PROTO_TCP;
use crate::core::window::ClosedWindow;
use crate::utils::clamp01;

/// Errors that can occur while assembling a health report.
#[derive(Error, Debug)]
pub enum CorrelationError {
    #[error("report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Weighting of the performance sub-scores.
const LATENCY_WEIGHT: f64 = 0.25;
const JITTER_WEIGHT: f64 = 0.15;
const LOSS_WEIGHT: f64 = 0.25;
const THROUGHPUT_WEIGHT: f64 = 0.20;
const CONNECTION_WEIGHT: f64 = 0.15;

/// Blend of performance versus security in the composite score.
const PERFORMANCE_SHARE: f64 = 0.6;
const SECURITY_SHARE: f64 = 0.4;

/// Destinations receiving more than this many bytes in a window count as
/// affected assets.
const AFFECTED_ASSET_BYTES: u64 = 1_000_000;

/// Measured performance for one analysis cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub average_latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
    pub throughput_mbps: f64,
    pub connection_success_rate: f64,
    pub performance_score: f64,
}

impl PerformanceSnapshot {
    /// Neutral snapshot used when analysis is impossible.
    pub fn neutral() -> Self {
        Self {
            average_latency_ms: 0.0,
            jitter_ms: 0.0,
            packet_loss_pct: 0.0,
            throughput_mbps: 0.0,
            connection_success_rate: 1.0,
            performance_score: 0.5,
        }
    }
}

/// Aggregated security posture for one analysis cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub threat_level: ThreatLevel,
    pub active_threats: Vec<String>,
    pub confidence: f64,
    pub affected_assets: Vec<String>,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl SecurityStatus {
    pub fn quiet() -> Self {
        Self {
            threat_level: ThreatLevel::None,
            active_threats: Vec::new(),
            confidence: 0.0,
            affected_assets: Vec::new(),
            details: HashMap::new(),
        }
    }
}

/// The comprehensive per-cycle health assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub performance: PerformanceSnapshot,
    pub security: SecurityStatus,
    pub overall_health_score: f64,
    pub correlation_insights: Vec<String>,
    pub recommended_actions: Vec<String>,
    #[serde(default)]
    pub performance_impact: HashMap<String, f64>,
}

impl HealthReport {
    /// Safe fallback report: never propagate a broken cycle to callers.
    pub fn safe_default(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            performance: PerformanceSnapshot::neutral(),
            security: SecurityStatus::quiet(),
            overall_health_score: 0.5,
            correlation_insights: vec![
                "unable to analyze network health for this cycle".to_string()
            ],
            recommended_actions: vec!["verify the monitoring pipeline is healthy".to_string()],
            performance_impact: HashMap::new(),
        }
    }
}

/// Composite health score for a given performance score and threat level.
pub fn composite_score(performance_score: f64, threat_level: ThreatLevel) -> f64 {
    let raw = performance_score * PERFORMANCE_SHARE + threat_level.security_score() * SECURITY_SHARE;
    (raw * 1000.0).round() / 1000.0
}

/// Estimates performance metrics from window flows and keeps short
/// histories for jitter/trend computation.
pub struct PerformanceAnalyzer {
    latency_history: VecDeque<f64>,
    history_capacity: usize,
}

impl PerformanceAnalyzer {
    pub fn new() -> Self {
        Self {
            latency_history: VecDeque::new(),
            history_capacity: 100,
        }
    }

    pub fn analyze(&mut self, window: &ClosedWindow) -> PerformanceSnapshot {
        let latency = estimate_latency(window);
        // Jitter reflects variation across previously observed cycles.
        let jitter = self.jitter();
        let loss = estimate_packet_loss(window);
        let throughput_mbps = window.bandwidth_bps / (1024.0 * 1024.0);
        let success = connection_success_rate(window);

        let score = LATENCY_WEIGHT * (1.0 - latency / 100.0).max(0.0)
            + JITTER_WEIGHT * (1.0 - jitter / 20.0).max(0.0)
            + LOSS_WEIGHT * (1.0 - loss / 5.0).max(0.0)
            + THROUGHPUT_WEIGHT * (throughput_mbps / 100.0).min(1.0)
            + CONNECTION_WEIGHT * success;

        if self.latency_history.len() == self.history_capacity {
            self.latency_history.pop_front();
        }
        self.latency_history.push_back(latency);

        PerformanceSnapshot {
            average_latency_ms: latency,
            jitter_ms: jitter,
            packet_loss_pct: loss,
            throughput_mbps,
            connection_success_rate: success,
            performance_score: clamp01(score),
        }
    }

    /// Standard deviation of the last ten latency samples.
    fn jitter(&self) -> f64 {
        let n = self.latency_history.len();
        if n < 2 {
            return 0.0;
        }
        let recent: Vec<f64> = self
            .latency_history
            .iter()
            .skip(n.saturating_sub(10))
            .copied()
            .collect();
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let var = recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / (recent.len() - 1) as f64;
        var.sqrt()
    }
}

impl Default for PerformanceAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Rough latency estimate from TCP flow durations; a real deployment would
/// use RTT measurements from the capture layer.
fn estimate_latency(window: &ClosedWindow) -> f64 {
    if window.flows.is_empty() {
        return 0.0;
    }
    let tcp: Vec<f64> = window
        .flows
        .iter()
        .filter(|f| f.protocol == PROTO_TCP)
        .map(|f| f.duration_secs)
        .collect();
    if tcp.is_empty() {
        return 20.0;
    }
    let avg = tcp.iter().sum::<f64>() / tcp.len() as f64;
    (avg * 10.0).min(200.0)
}

/// Loss proxied by the incomplete-connection ratio, capped at 10%.
fn estimate_packet_loss(window: &ClosedWindow) -> f64 {
    let tcp: Vec<_> = window
        .flows
        .iter()
        .filter(|f| f.protocol == PROTO_TCP)
        .collect();
    if tcp.is_empty() {
        return 0.0;
    }
    let incomplete = tcp
        .iter()
        .filter(|f| f.connection_state.is_incomplete())
        .count();
    ((incomplete as f64 / tcp.len() as f64) * 100.0).min(10.0)
}

fn connection_success_rate(window: &ClosedWindow) -> f64 {
    let tcp: Vec<_> = window
        .flows
        .iter()
        .filter(|f| f.protocol == PROTO_TCP)
        .collect();
    if tcp.is_empty() {
        return 1.0;
    }
    let established = tcp
        .iter()
        .filter(|f| {
            f.connection_state == crate::core::flow::ConnectionState::Established
        })
        .count();
    established as f64 / tcp.len() as f64
}

/// Fuses threat alerts and performance into the per-cycle health report.
pub struct CorrelationEngine {
    performance: PerformanceAnalyzer,
}

impl CorrelationEngine {
    pub fn new() -> Self {
        Self {
            performance: PerformanceAnalyzer::new(),
        }
    }

    /// Produce the cycle's health report. Any internal failure yields the
    /// safe default report instead of surfacing to the caller.
    pub fn correlate(&mut self, window: &ClosedWindow, alerts: &[ThreatAlert]) -> HealthReport {
        match self.try_correlate(window, alerts) {
            Ok(report) => report,
            Err(e) => {
                error!("health correlation failed, using safe default report: {e}");
                HealthReport::safe_default(window.closed_at)
            }
        }
    }

    fn try_correlate(
        &mut self,
        window: &ClosedWindow,
        alerts: &[ThreatAlert],
    ) -> Result<HealthReport, CorrelationError> {
        let performance = self.performance.analyze(window);
        let security = security_status(window, alerts)?;
        let impact = performance_impact(&security, &performance);
        let overall = composite_score(performance.performance_score, security.threat_level);
        let insights = correlation_insights(&security, &performance, &impact);
        let actions = recommended_actions(&security, &performance, overall);

        Ok(HealthReport {
            timestamp: window.closed_at,
            performance,
            security,
            overall_health_score: overall,
            correlation_insights: insights,
            recommended_actions: actions,
            performance_impact: impact,
        })
    }
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn security_status(
    window: &ClosedWindow,
    alerts: &[ThreatAlert],
) -> Result<SecurityStatus, CorrelationError> {
    let mut labels: Vec<String> = Vec::new();
    for alert in alerts {
        let label = alert.label();
        if !labels.contains(&label) {
            labels.push(label);
        }
    }

    let mut level = ThreatLevel::None;
    if !alerts.is_empty() {
        level = level.max(ThreatLevel::Low);
    }
    if labels.len() >= 3 {
        level = level.max(ThreatLevel::Medium);
    }
    if alerts.iter().any(|a| a.category.is_ddos()) {
        level = level.max(ThreatLevel::High);
    }
    if alerts.iter().any(|a| a.severity == Severity::Critical) {
        level = ThreatLevel::Critical;
    }

    // Affected assets: explicit attack targets plus any destination that
    // absorbed significant volume this window.
    let mut assets: Vec<String> = Vec::new();
    for alert in alerts {
        if let Some(target) = &alert.target_ip {
            if target.parse::<std::net::IpAddr>().is_ok() && !assets.contains(target) {
                assets.push(target.clone());
            }
        }
    }
    let mut heavy: HashMap<&str, u64> = HashMap::new();
    for flow in &window.flows {
        *heavy.entry(flow.dst_ip.as_str()).or_default() += flow.total_bytes();
    }
    for (dst, bytes) in heavy {
        if bytes > AFFECTED_ASSET_BYTES && !assets.iter().any(|a| a == dst) {
            assets.push(dst.to_string());
        }
    }
    assets.sort();

    let details = HashMap::from([(
        "alert_counts".to_string(),
        serde_json::to_value(alert_counts(alerts))?,
    )]);

    Ok(SecurityStatus {
        threat_level: level,
        active_threats: labels,
        confidence: security_confidence(alerts),
        affected_assets: assets,
        details,
    })
}

fn alert_counts(alerts: &[ThreatAlert]) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for alert in alerts {
        let key = serde_json::to_value(alert.category)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        *counts.entry(key).or_default() += 1;
    }
    counts
}

/// Weighted blend of the mean confidence per detector family.
fn security_confidence(alerts: &[ThreatAlert]) -> f64 {
    let group = |pred: fn(&ThreatAlert) -> bool| -> Option<f64> {
        let members: Vec<f64> = alerts
            .iter()
            .filter(|a| pred(a))
            .map(|a| a.confidence)
            .collect();
        if members.is_empty() {
            None
        } else {
            Some(members.iter().sum::<f64>() / members.len() as f64)
        }
    };

    let mut total = 0.0;
    let mut weight = 0.0;
    if let Some(c) = group(|a| a.category.is_ddos()) {
        total += c * 0.4;
        weight += 0.4;
    }
    if let Some(c) = group(|a| a.category == AttackCategory::Reconnaissance) {
        total += c * 0.3;
        weight += 0.3;
    }
    if let Some(c) = group(|a| a.category == AttackCategory::Anomaly) {
        total += c * 0.3;
        weight += 0.3;
    }

    if weight > 0.0 {
        clamp01(total / weight)
    } else {
        0.8
    }
}

fn performance_impact(
    security: &SecurityStatus,
    performance: &PerformanceSnapshot,
) -> HashMap<String, f64> {
    let mut impact = HashMap::new();
    let has_ddos = security
        .active_threats
        .iter()
        .any(|t| t.starts_with("ddos"));
    if has_ddos {
        impact.insert(
            "bandwidth_impact".to_string(),
            1.0 - performance.performance_score,
        );
        impact.insert(
            "latency_impact".to_string(),
            (performance.average_latency_ms / 100.0).min(1.0),
        );
    }
    if security
        .active_threats
        .iter()
        .any(|t| t.starts_with("port scan"))
    {
        impact.insert(
            "connection_impact".to_string(),
            1.0 - performance.connection_success_rate,
        );
    }
    impact
}

fn correlation_insights(
    security: &SecurityStatus,
    performance: &PerformanceSnapshot,
    impact: &HashMap<String, f64>,
) -> Vec<String> {
    let mut insights = Vec::new();

    if impact.get("bandwidth_impact").copied().unwrap_or(0.0) > 0.3 {
        insights.push(format!(
            "bandwidth spike correlates with {:.1}% performance degradation",
            impact["bandwidth_impact"] * 100.0
        ));
    }
    if impact.get("latency_impact").copied().unwrap_or(0.0) > 0.3 {
        insights.push(format!(
            "elevated latency ({:.1} ms) correlates with active security threats",
            performance.average_latency_ms
        ));
    }
    if security.threat_level >= ThreatLevel::High && performance.performance_score < 0.5 {
        insights.push(
            "severe security threats are significantly impacting network performance".to_string(),
        );
    }
    if performance.packet_loss_pct > 2.0 && !security.active_threats.is_empty() {
        insights.push(format!(
            "packet loss ({:.1}%) may be caused by active security threats",
            performance.packet_loss_pct
        ));
    }
    insights
}

fn recommended_actions(
    security: &SecurityStatus,
    performance: &PerformanceSnapshot,
    overall: f64,
) -> Vec<String> {
    let mut actions = Vec::new();

    if overall < 0.3 {
        actions.push("URGENT: network health is critical, immediate intervention required".to_string());
    }
    if security.active_threats.iter().any(|t| t.starts_with("ddos")) {
        actions.push("apply DDoS mitigation: rate limiting and traffic filtering".to_string());
        actions.push("consider activating upstream DDoS protection".to_string());
    }
    if security
        .active_threats
        .iter()
        .any(|t| t.starts_with("port scan"))
    {
        actions.push("block scanning source IPs at the firewall".to_string());
        actions.push("review and harden exposed services".to_string());
    }
    if performance.packet_loss_pct > 3.0 {
        actions.push(format!(
            "investigate packet loss ({:.1}%): check network equipment",
            performance.packet_loss_pct
        ));
    }
    if performance.average_latency_ms > 100.0 {
        actions.push(format!(
            "high latency detected ({:.1} ms): review routing",
            performance.average_latency_ms
        ));
    }
    actions
}
