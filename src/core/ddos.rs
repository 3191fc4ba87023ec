//! DDoS classification over a completed detection window.
//!
//! Each sub-detector runs independently; one window may yield alerts from
//! several categories at once. Classification is a pure function of the
//! frozen window data and the current baselines, so re-running it over the
//! same inputs yields the same alerts.

use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::alert::{AttackCategory, Severity, ThreatAlert};
use crate::core::baseline::{BaselineTracker, RateMetric};
use crate::core::window::{ClosedWindow, SourceIpStats};
use crate::core::DdosThresholds;

/// Maximum source IPs listed on a single alert.
const MAX_LISTED_SOURCES: usize = 10;
/// How many top sources are consulted when picking a primary target.
const TARGET_VOTE_SOURCES: usize = 5;

pub struct DdosClassifier {
    thresholds: DdosThresholds,
}

impl DdosClassifier {
    pub fn new(thresholds: DdosThresholds) -> Self {
        Self { thresholds }
    }

    /// Classify one closed window into zero or more DDoS alerts.
    pub fn classify(&self, window: &ClosedWindow, baselines: &BaselineTracker) -> Vec<ThreatAlert> {
        let mut alerts = Vec::new();
        self.detect_volumetric(window, baselines, &mut alerts);
        self.detect_protocol(window, baselines, &mut alerts);
        self.detect_application(window, baselines, &mut alerts);
        alerts
    }

    fn detect_volumetric(
        &self,
        window: &ClosedWindow,
        baselines: &BaselineTracker,
        alerts: &mut Vec<ThreatAlert>,
    ) {
        let multiplier = self.thresholds.volumetric_multiplier;

        let baseline_bw = baselines.baseline(RateMetric::Bandwidth);
        if baseline_bw > 0.0 && window.bandwidth_bps > baseline_bw * multiplier {
            let top = top_sources(window, |s| s.bytes_sent);
            alerts.push(ThreatAlert {
                id: Uuid::new_v4(),
                category: AttackCategory::Volumetric,
                attack_vectors: vec!["bandwidth_flood".to_string()],
                source_ips: listed_ips(&top),
                target_ip: primary_target(&top),
                observed_rate: window.bandwidth_bps,
                baseline_rate: baseline_bw,
                amplification_factor: window.bandwidth_bps / baseline_bw,
                duration_seconds: window.elapsed_secs,
                confidence: 0.8,
                severity: Severity::High,
                timestamp: window.closed_at,
                details: HashMap::from([(
                    "description".to_string(),
                    json!(format!(
                        "bandwidth {:.2} Mbps exceeded baseline {:.2} Mbps",
                        window.bandwidth_bps / 1e6,
                        baseline_bw / 1e6
                    )),
                )]),
            });
        }

        let baseline_pps = baselines.baseline(RateMetric::PacketRate);
        if baseline_pps > 0.0 && window.packet_pps > baseline_pps * multiplier {
            let top = top_sources(window, |s| s.packets_sent);
            alerts.push(ThreatAlert {
                id: Uuid::new_v4(),
                category: AttackCategory::Volumetric,
                attack_vectors: vec!["packet_rate_flood".to_string()],
                source_ips: listed_ips(&top),
                target_ip: primary_target(&top),
                observed_rate: window.packet_pps,
                baseline_rate: baseline_pps,
                amplification_factor: window.packet_pps / baseline_pps,
                duration_seconds: window.elapsed_secs,
                confidence: 0.8,
                severity: Severity::High,
                timestamp: window.closed_at,
                details: HashMap::from([(
                    "description".to_string(),
                    json!(format!(
                        "packet rate {:.0} pps exceeded baseline {:.0} pps",
                        window.packet_pps, baseline_pps
                    )),
                )]),
            });
        }
    }

    fn detect_protocol(
        &self,
        window: &ClosedWindow,
        baselines: &BaselineTracker,
        alerts: &mut Vec<ThreatAlert>,
    ) {
        // SYN flood: aggregate SYN rate across all sources in the window.
        let syn_total: u64 = window.sources.values().map(|s| s.syn_packets).sum();
        let syn_pps = syn_total as f64 / window.elapsed_secs;
        if syn_pps > self.thresholds.syn_flood_pps {
            let top = top_sources_filtered(window, |s| s.syn_packets, |s| s.syn_packets > 0);
            let baseline_cps = baselines.baseline(RateMetric::ConnectionRate);
            alerts.push(ThreatAlert {
                id: Uuid::new_v4(),
                category: AttackCategory::Protocol,
                attack_vectors: vec!["syn_flood".to_string()],
                source_ips: listed_ips(&top),
                target_ip: top_syn_target(&window.target_syn_counts),
                observed_rate: syn_pps,
                baseline_rate: baseline_cps,
                amplification_factor: syn_pps / baseline_cps.max(1.0),
                duration_seconds: window.elapsed_secs,
                confidence: 0.9,
                severity: Severity::High,
                timestamp: window.closed_at,
                details: HashMap::from([(
                    "description".to_string(),
                    json!(format!(
                        "aggregate SYN rate {:.0} pps exceeded threshold {:.0}",
                        syn_pps, self.thresholds.syn_flood_pps
                    )),
                )]),
            });
        }

        // UDP amplification attempts: any source hammering known reflector
        // ports. Targets are typically reflected elsewhere, so none is set.
        let mut amp_sources: Vec<&String> = window
            .sources
            .iter()
            .filter(|(_, s)| s.amplification_attempts > self.thresholds.udp_amplification_attempts)
            .map(|(ip, _)| ip)
            .collect();
        amp_sources.sort();
        if !amp_sources.is_empty() {
            alerts.push(ThreatAlert {
                id: Uuid::new_v4(),
                category: AttackCategory::Protocol,
                attack_vectors: vec!["udp_amplification_attempt".to_string()],
                source_ips: amp_sources
                    .iter()
                    .take(MAX_LISTED_SOURCES)
                    .map(|ip| ip.to_string())
                    .collect(),
                target_ip: None,
                observed_rate: amp_sources.len() as f64,
                // Attempt counts have no meaningful baseline.
                baseline_rate: 0.0,
                amplification_factor: 0.0,
                duration_seconds: window.elapsed_secs,
                confidence: 0.7,
                severity: Severity::Medium,
                timestamp: window.closed_at,
                details: HashMap::from([(
                    "description".to_string(),
                    json!(format!(
                        "{} source(s) probing UDP amplification ports",
                        amp_sources.len()
                    )),
                )]),
            });
        }

        // ICMP flood: aggregate ICMP score against a fixed rate threshold.
        let icmp_total: u64 = window.sources.values().map(|s| s.icmp_score).sum();
        let icmp_pps = icmp_total as f64 / window.elapsed_secs;
        if icmp_pps > self.thresholds.icmp_flood_pps {
            let top = top_sources_filtered(window, |s| s.icmp_score, |s| s.icmp_score > 0);
            alerts.push(ThreatAlert {
                id: Uuid::new_v4(),
                category: AttackCategory::Protocol,
                attack_vectors: vec!["icmp_flood".to_string()],
                source_ips: listed_ips(&top),
                target_ip: primary_target(&top),
                observed_rate: icmp_pps,
                baseline_rate: 0.0,
                amplification_factor: 0.0,
                duration_seconds: window.elapsed_secs,
                confidence: 0.8,
                severity: Severity::High,
                timestamp: window.closed_at,
                details: HashMap::from([(
                    "description".to_string(),
                    json!(format!(
                        "ICMP rate {:.0} pps exceeded threshold {:.0}",
                        icmp_pps, self.thresholds.icmp_flood_pps
                    )),
                )]),
            });
        }
    }

    fn detect_application(
        &self,
        window: &ClosedWindow,
        baselines: &BaselineTracker,
        alerts: &mut Vec<ThreatAlert>,
    ) {
        let baseline_rps = baselines.baseline(RateMetric::RequestRate);
        let above_baseline = baseline_rps > 0.0
            && window.request_rps > baseline_rps * self.thresholds.volumetric_multiplier;
        // Absolute floor keeps a cold-start baseline of 1.0 from alerting
        // on trivial traffic.
        if above_baseline && window.request_rps > self.thresholds.http_flood_rps {
            let mut hits: HashMap<&str, u64> = HashMap::new();
            for flow in window.flows.iter().filter(|f| f.is_web_flow()) {
                *hits.entry(flow.dst_ip.as_str()).or_default() += 1;
            }
            let target = hits
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(ip, _)| ip.to_string());
            let top = top_sources(window, |s| s.packets_sent);

            alerts.push(ThreatAlert {
                id: Uuid::new_v4(),
                category: AttackCategory::Application,
                attack_vectors: vec!["http_flood".to_string()],
                source_ips: listed_ips(&top),
                target_ip: target,
                observed_rate: window.request_rps,
                baseline_rate: baseline_rps,
                amplification_factor: window.request_rps / baseline_rps,
                duration_seconds: window.elapsed_secs,
                confidence: 0.75,
                severity: Severity::Medium,
                timestamp: window.closed_at,
                details: HashMap::from([(
                    "description".to_string(),
                    json!(format!(
                        "request rate {:.0} rps exceeded baseline {:.0} rps",
                        window.request_rps, baseline_rps
                    )),
                )]),
            });
        }
    }
}

/// Sources ordered by a per-source metric, highest first. Ties break on the
/// IP string so iteration order never changes the outcome.
fn top_sources<F>(window: &ClosedWindow, key: F) -> Vec<(&String, &SourceIpStats)>
where
    F: Fn(&SourceIpStats) -> u64,
{
    top_sources_filtered(window, key, |_| true)
}

fn top_sources_filtered<F, P>(
    window: &ClosedWindow,
    key: F,
    keep: P,
) -> Vec<(&String, &SourceIpStats)>
where
    F: Fn(&SourceIpStats) -> u64,
    P: Fn(&SourceIpStats) -> bool,
{
    let mut sources: Vec<(&String, &SourceIpStats)> =
        window.sources.iter().filter(|(_, s)| keep(s)).collect();
    sources.sort_by(|a, b| key(b.1).cmp(&key(a.1)).then_with(|| a.0.cmp(b.0)));
    sources
}

fn listed_ips(top: &[(&String, &SourceIpStats)]) -> Vec<String> {
    top.iter()
        .take(MAX_LISTED_SOURCES)
        .map(|(ip, _)| ip.to_string())
        .collect()
}

/// The most frequently targeted IP among the top sources.
fn primary_target(top: &[(&String, &SourceIpStats)]) -> Option<String> {
    let mut votes: HashMap<&str, u64> = HashMap::new();
    for (_, stats) in top.iter().take(TARGET_VOTE_SOURCES) {
        for target in &stats.target_ips {
            *votes.entry(target.as_str()).or_default() += 1;
        }
    }
    votes
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(ip, _)| ip.to_string())
}

fn top_syn_target(target_syn_counts: &HashMap<String, u64>) -> Option<String> {
    target_syn_counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(ip, _)| ip.clone())
}
