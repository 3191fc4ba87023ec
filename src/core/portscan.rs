//! Reconnaissance detection: vertical port scans and horizontal sweeps.
//!
//! Scans are tracked independently of the volumetric thresholds because a
//! careful scanner hides well under aggregate bandwidth. Attempts are kept
//! per source over a rolling time window and purged after each analysis.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::core::alert::{AttackCategory, Severity, ThreatAlert};
use crate::core::flow::{ConnectionState, FlowRecord, PROTO_TCP, PROTO_UDP};
use crate::core::PortScanConfig;
use crate::utils::is_private_ip;

/// Ports routinely probed by scanners.
const COMMON_SCAN_PORTS: [u16; 26] = [
    21, 22, 23, 25, 53, 80, 110, 111, 135, 137, 138, 139, 143, 443, 445, 993, 995, 1723, 3306,
    3389, 5432, 5800, 5900, 8000, 8080, 8443,
];

/// First dynamic/private port.
const DYNAMIC_PORT_START: u16 = 49152;

/// Forced-critical cutoff for very broad SYN scans.
const CRITICAL_SYN_SCAN_PORTS: usize = 200;

#[derive(Debug, Clone, Copy, Default)]
struct ScanIndicators {
    tcp_syn: bool,
    rapid_tcp: bool,
    udp: bool,
    common_port: bool,
    high_port: bool,
}

impl ScanIndicators {
    fn any(&self) -> bool {
        self.tcp_syn || self.rapid_tcp || self.udp || self.common_port || self.high_port
    }
}

#[derive(Debug, Clone)]
struct ConnectionAttempt {
    at: DateTime<Utc>,
    dst_ip: String,
    dst_port: u16,
    indicators: ScanIndicators,
}

/// Stateful per-source attempt tracker plus scan/sweep detection.
pub struct PortScanClassifier {
    config: PortScanConfig,
    attempts: HashMap<String, Vec<ConnectionAttempt>>,
}

impl PortScanClassifier {
    pub fn new(config: PortScanConfig) -> Self {
        Self {
            config,
            attempts: HashMap::new(),
        }
    }

    /// Record, detect and purge in one analysis call.
    pub fn analyze(&mut self, flows: &[FlowRecord], now: DateTime<Utc>) -> Vec<ThreatAlert> {
        self.record_flows(flows, now);
        let alerts = self.detect(now);
        self.purge_expired(now);
        alerts
    }

    /// Record probe-like flows as connection attempts.
    pub fn record_flows(&mut self, flows: &[FlowRecord], now: DateTime<Utc>) {
        for flow in flows {
            if !flow.is_valid() {
                continue;
            }
            let indicators = identify_indicators(flow);
            if indicators.any() {
                self.attempts
                    .entry(flow.src_ip.clone())
                    .or_default()
                    .push(ConnectionAttempt {
                        at: now,
                        dst_ip: flow.dst_ip.clone(),
                        dst_port: flow.dst_port,
                        indicators,
                    });
            }
        }
    }

    /// Detection is a pure read of the recorded attempts: re-running it
    /// without further recording yields identical alerts.
    pub fn detect(&self, now: DateTime<Utc>) -> Vec<ThreatAlert> {
        let window = Duration::seconds(self.config.window_secs as i64);
        let mut alerts = Vec::new();

        let mut sources: Vec<&String> = self.attempts.keys().collect();
        sources.sort();

        for src_ip in sources {
            let recent: Vec<&ConnectionAttempt> = self.attempts[src_ip]
                .iter()
                .filter(|a| now - a.at <= window)
                .collect();
            if recent.is_empty() {
                continue;
            }
            self.detect_vertical_scans(src_ip, &recent, &mut alerts);
            self.detect_sweeps(src_ip, &recent, &mut alerts);
        }
        alerts
    }

    /// Drop attempts older than the rolling window plus a short grace
    /// period; sources left with nothing are removed wholesale.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) {
        let cutoff = now
            - Duration::seconds(self.config.window_secs as i64)
            - Duration::seconds(self.config.grace_secs as i64);
        self.attempts.retain(|_, attempts| {
            attempts.retain(|a| a.at > cutoff);
            !attempts.is_empty()
        });
    }

    /// One source probing many ports on one target.
    fn detect_vertical_scans(
        &self,
        src_ip: &str,
        recent: &[&ConnectionAttempt],
        alerts: &mut Vec<ThreatAlert>,
    ) {
        let mut by_target: HashMap<&str, Vec<&ConnectionAttempt>> = HashMap::new();
        for &attempt in recent {
            by_target.entry(attempt.dst_ip.as_str()).or_default().push(attempt);
        }

        let mut targets: Vec<&&str> = by_target.keys().collect();
        targets.sort();

        for target_ip in targets {
            let attempts = &by_target[*target_ip];
            if attempts.len() < self.config.min_attempts {
                continue;
            }
            if let Some(alert) = self.analyze_target(src_ip, target_ip, attempts) {
                alerts.push(alert);
            }
        }
    }

    fn analyze_target(
        &self,
        src_ip: &str,
        target_ip: &str,
        attempts: &[&ConnectionAttempt],
    ) -> Option<ThreatAlert> {
        let mut ports: BTreeSet<u16> = BTreeSet::new();
        let mut syn_count = 0usize;
        let mut udp_count = 0usize;
        let mut first = attempts[0].at;
        let mut last = attempts[0].at;

        for attempt in attempts {
            ports.insert(attempt.dst_port);
            if attempt.indicators.tcp_syn {
                syn_count += 1;
            }
            if attempt.indicators.udp {
                udp_count += 1;
            }
            first = first.min(attempt.at);
            last = last.max(attempt.at);
        }

        let num_ports = ports.len();
        let syn_threshold = self.config.tcp_syn_threshold;
        let udp_threshold = self.config.udp_threshold;
        let mixed_threshold = (syn_threshold + udp_threshold) as f64 / 2.0;

        let (scan_type, confidence) = if syn_count >= syn_threshold && num_ports >= syn_threshold {
            (
                "tcp_syn",
                blend_confidence(syn_count, num_ports, syn_threshold),
            )
        } else if udp_count >= udp_threshold && num_ports >= udp_threshold {
            ("udp", blend_confidence(udp_count, num_ports, udp_threshold))
        } else if num_ports as f64 >= mixed_threshold {
            (
                "mixed",
                (num_ports as f64 / (syn_threshold + udp_threshold) as f64).min(1.0) * 0.8,
            )
        } else {
            return None;
        };

        if confidence <= 0.5 {
            return None;
        }

        let severity = self.scan_severity(num_ports, scan_type, Some(target_ip));
        let duration = duration_secs(first, last);
        let threshold = match scan_type {
            "udp" => udp_threshold as f64,
            _ => syn_threshold as f64,
        };

        Some(ThreatAlert {
            id: Uuid::new_v4(),
            category: AttackCategory::Reconnaissance,
            attack_vectors: vec![scan_type.to_string()],
            source_ips: vec![src_ip.to_string()],
            target_ip: Some(target_ip.to_string()),
            observed_rate: num_ports as f64,
            baseline_rate: threshold,
            amplification_factor: num_ports as f64 / threshold,
            duration_seconds: duration,
            confidence,
            severity,
            timestamp: last,
            details: HashMap::from([
                ("scanned_ports".to_string(), json!(ports.iter().collect::<Vec<_>>())),
                ("distinct_ports".to_string(), json!(num_ports)),
            ]),
        })
    }

    /// One source probing one port across many targets.
    fn detect_sweeps(
        &self,
        src_ip: &str,
        recent: &[&ConnectionAttempt],
        alerts: &mut Vec<ThreatAlert>,
    ) {
        let mut by_port: HashMap<u16, (BTreeSet<&str>, DateTime<Utc>, DateTime<Utc>)> =
            HashMap::new();
        for attempt in recent {
            let entry = by_port
                .entry(attempt.dst_port)
                .or_insert_with(|| (BTreeSet::new(), attempt.at, attempt.at));
            entry.0.insert(attempt.dst_ip.as_str());
            entry.1 = entry.1.min(attempt.at);
            entry.2 = entry.2.max(attempt.at);
        }

        let mut ports: Vec<&u16> = by_port.keys().collect();
        ports.sort();

        for port in ports {
            let (targets, first, last) = &by_port[port];
            let num_targets = targets.len();
            if num_targets < self.config.sweep_threshold {
                continue;
            }

            let confidence =
                (num_targets as f64 / (self.config.sweep_threshold as f64 * 1.5)).min(1.0) * 0.85;
            let severity = self.scan_severity(num_targets, "port_sweep", None);

            alerts.push(ThreatAlert {
                id: Uuid::new_v4(),
                category: AttackCategory::Reconnaissance,
                attack_vectors: vec!["port_sweep".to_string()],
                source_ips: vec![src_ip.to_string()],
                target_ip: Some(format!("multiple ({num_targets} hosts)")),
                observed_rate: num_targets as f64,
                baseline_rate: self.config.sweep_threshold as f64,
                amplification_factor: num_targets as f64 / self.config.sweep_threshold as f64,
                duration_seconds: duration_secs(*first, *last),
                confidence,
                severity,
                timestamp: *last,
                details: HashMap::from([
                    ("swept_port".to_string(), json!(port)),
                    ("target_count".to_string(), json!(num_targets)),
                ]),
            });
        }
    }

    /// Base severity scales with how far the count exceeds its threshold,
    /// escalates one level for internal targets, and is forced to critical
    /// for very broad SYN scans.
    fn scan_severity(&self, count: usize, scan_type: &str, target_ip: Option<&str>) -> Severity {
        let mut severity = if scan_type == "port_sweep" {
            let sweep = self.config.sweep_threshold as f64;
            if count as f64 > sweep * 2.0 {
                Severity::High
            } else if count as f64 > sweep * 1.5 {
                Severity::Medium
            } else {
                Severity::Low
            }
        } else {
            let avg = (self.config.tcp_syn_threshold + self.config.udp_threshold) as f64 / 2.0;
            if count as f64 > avg * 2.0 {
                Severity::High
            } else if count as f64 > avg * 1.2 {
                Severity::Medium
            } else {
                Severity::Low
            }
        };

        if target_ip.is_some_and(is_private_ip) {
            severity = severity.escalate();
        }
        if scan_type == "tcp_syn" && count > CRITICAL_SYN_SCAN_PORTS {
            severity = Severity::Critical;
        }
        severity
    }
}

fn identify_indicators(flow: &FlowRecord) -> ScanIndicators {
    let mut ind = ScanIndicators::default();
    if flow.protocol == PROTO_TCP {
        ind.tcp_syn =
            flow.connection_state.is_syn_like() || flow.connection_state == ConnectionState::Reset;
        ind.rapid_tcp =
            flow.duration_secs < 2.0 && flow.connection_state != ConnectionState::Established;
    } else if flow.protocol == PROTO_UDP {
        ind.udp = true;
    }
    // Port tags qualify a probe-like flow; they never make an ordinary
    // established flow an attempt on their own.
    if ind.tcp_syn || ind.rapid_tcp || ind.udp {
        ind.common_port = COMMON_SCAN_PORTS.contains(&flow.dst_port);
        ind.high_port = flow.dst_port >= DYNAMIC_PORT_START;
    }
    ind
}

fn blend_confidence(indicator_count: usize, port_count: usize, threshold: usize) -> f64 {
    let scale = threshold as f64 * 1.5;
    ((indicator_count as f64 / scale) * 0.7 + (port_count as f64 / scale) * 0.3).min(1.0)
}

fn duration_secs(first: DateTime<Utc>, last: DateTime<Utc>) -> f64 {
    ((last - first).num_milliseconds() as f64 / 1000.0).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow::ConnectionState;
    use chrono::TimeZone;

    fn config() -> PortScanConfig {
        PortScanConfig::default()
    }

    fn probe(src: &str, dst: &str, port: u16, state: ConnectionState) -> FlowRecord {
        FlowRecord {
            src_ip: src.to_string(),
            dst_ip: dst.to_string(),
            src_port: 55000,
            dst_port: port,
            protocol: PROTO_TCP,
            bytes_sent: 60,
            bytes_received: 0,
            packets_sent: 1,
            packets_received: 0,
            duration_secs: 0.1,
            connection_state: state,
            avg_packet_size: None,
            packets_per_second: None,
            bytes_per_second: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn vertical_syn_scan_is_detected_with_confidence() {
        let mut classifier = PortScanClassifier::new(config());
        let flows: Vec<FlowRecord> = (0..25)
            .map(|i| probe("1.1.1.1", "203.0.113.7", 1000 + i, ConnectionState::SynSent))
            .collect();

        let alerts = classifier.analyze(&flows, t0());
        let scan = alerts
            .iter()
            .find(|a| a.attack_vectors == vec!["tcp_syn".to_string()])
            .expect("tcp_syn alert");
        assert_eq!(scan.source_ips, vec!["1.1.1.1".to_string()]);
        assert_eq!(scan.target_ip.as_deref(), Some("203.0.113.7"));
        assert!(scan.confidence > 0.5);
    }

    #[test]
    fn below_threshold_probing_stays_silent() {
        let mut classifier = PortScanClassifier::new(config());
        let flows: Vec<FlowRecord> = (0..4)
            .map(|i| probe("1.1.1.1", "203.0.113.7", 22 + i, ConnectionState::SynSent))
            .collect();
        assert!(classifier.analyze(&flows, t0()).is_empty());
    }

    #[test]
    fn horizontal_sweep_reports_port_and_victim_count() {
        let mut classifier = PortScanClassifier::new(config());
        let flows: Vec<FlowRecord> = (0..12)
            .map(|i| probe("3.3.3.3", &format!("198.51.100.{i}"), 445, ConnectionState::SynSent))
            .collect();

        let alerts = classifier.analyze(&flows, t0());
        let sweep = alerts
            .iter()
            .find(|a| a.attack_vectors == vec!["port_sweep".to_string()])
            .expect("sweep alert");
        assert_eq!(sweep.target_ip.as_deref(), Some("multiple (12 hosts)"));
        assert_eq!(sweep.details["swept_port"], json!(445));
        assert_eq!(sweep.details["target_count"], json!(12));
    }

    #[test]
    fn private_target_escalates_exactly_one_level() {
        let flows_public: Vec<FlowRecord> = (0..25)
            .map(|i| probe("1.1.1.1", "203.0.113.7", 1000 + i, ConnectionState::SynSent))
            .collect();
        let flows_private: Vec<FlowRecord> = (0..25)
            .map(|i| probe("1.1.1.1", "192.168.1.7", 1000 + i, ConnectionState::SynSent))
            .collect();

        let mut public = PortScanClassifier::new(config());
        let mut private = PortScanClassifier::new(config());
        let pub_alert = public.analyze(&flows_public, t0()).remove(0);
        let priv_alert = private.analyze(&flows_private, t0()).remove(0);

        assert_eq!(priv_alert.severity, pub_alert.severity.escalate());
    }

    #[test]
    fn very_broad_syn_scan_is_forced_critical() {
        let mut classifier = PortScanClassifier::new(config());
        let flows: Vec<FlowRecord> = (0..250)
            .map(|i| probe("1.1.1.1", "203.0.113.7", 1000 + i, ConnectionState::SynSent))
            .collect();
        let alert = classifier.analyze(&flows, t0()).remove(0);
        assert_eq!(alert.severity, Severity::Critical);
    }

    #[test]
    fn attempts_expire_out_of_the_rolling_window() {
        let mut classifier = PortScanClassifier::new(config());
        let flows: Vec<FlowRecord> = (0..25)
            .map(|i| probe("1.1.1.1", "203.0.113.7", 1000 + i, ConnectionState::SynSent))
            .collect();
        classifier.record_flows(&flows, t0());

        // Well past window + grace: nothing recent, nothing retained.
        let later = t0() + Duration::seconds(600);
        assert!(classifier.detect(later).is_empty());
        classifier.purge_expired(later);
        assert!(classifier.attempts.is_empty());
    }

    #[test]
    fn detection_is_idempotent_without_new_recordings() {
        let mut classifier = PortScanClassifier::new(config());
        let flows: Vec<FlowRecord> = (0..25)
            .map(|i| probe("1.1.1.1", "203.0.113.7", 1000 + i, ConnectionState::SynSent))
            .collect();
        classifier.record_flows(&flows, t0());

        let first = classifier.detect(t0());
        let second = classifier.detect(t0());
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.attack_vectors, b.attack_vectors);
            assert_eq!(a.severity, b.severity);
            assert!((a.confidence - b.confidence).abs() < 1e-12);
        }
    }
}
