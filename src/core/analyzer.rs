//! The per-instance analysis pipeline.
//!
//! One `TrafficAnalyzer` owns all mutable window/baseline state for a
//! monitored segment. It is single-writer: the ingestion path must
//! serialise calls into an instance, while independent instances may run
//! fully in parallel. Analysis is synchronous and CPU-bound; nothing here
//! performs I/O.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::core::alert::ThreatAlert;
use crate::core::baseline::{BaselineTracker, RateMetric};
use crate::core::correlation::{CorrelationEngine, HealthReport};
use crate::core::ddos::DdosClassifier;
use crate::core::flow::{BandwidthSnapshot, FlowRecord};
use crate::core::ml::{LinearScorer, ScorerManager, ScorerSettings, ThreatScorer};
use crate::core::portscan::PortScanClassifier;
use crate::core::window::{ClosedWindow, WindowAccumulator};
use crate::core::AnalyzerConfig;

/// Shared handle used by the API and ingest tasks. The handle is created
/// by the process startup sequence and passed explicitly; there is no
/// ambient global analyzer.
pub type SharedAnalyzer = Arc<tokio::sync::RwLock<TrafficAnalyzer>>;

/// Result of one completed analysis cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub window_started_at: DateTime<Utc>,
    pub alerts: Vec<ThreatAlert>,
    pub report: Arc<HealthReport>,
}

pub struct TrafficAnalyzer {
    window: WindowAccumulator,
    baselines: BaselineTracker,
    ddos: DdosClassifier,
    port_scans: PortScanClassifier,
    scorers: ScorerManager,
    correlation: CorrelationEngine,
    latest_report: Arc<HealthReport>,
}

impl TrafficAnalyzer {
    pub fn new(config: AnalyzerConfig, now: DateTime<Utc>) -> Self {
        let mut scorers = ScorerManager::new();
        let mut scorer = LinearScorer::new(config.ml.scorer_id.clone());
        if let Some(path) = &config.ml.model_path {
            match scorer.load(path) {
                Ok(()) => info!("loaded scorer model for {} from {path}", config.ml.scorer_id),
                Err(e) => warn!(
                    "could not load scorer model from {path}: {e}; using placeholder"
                ),
            }
        }
        let activate = scorer.is_loaded();
        let scorer_id = scorer.id();
        scorers.register(
            Box::new(scorer),
            ScorerSettings {
                anomaly_decision_threshold: config.ml.anomaly_decision_threshold,
            },
        );
        if activate {
            scorers.activate(&scorer_id);
        }

        Self {
            window: WindowAccumulator::new(config.detection.window_secs, now),
            baselines: BaselineTracker::new(config.detection.baseline_capacity),
            ddos: DdosClassifier::new(config.ddos),
            port_scans: PortScanClassifier::new(config.port_scan),
            scorers,
            correlation: CorrelationEngine::new(),
            latest_report: Arc::new(HealthReport::safe_default(now)),
        }
    }

    /// Absorb a flow batch, closing and analysing the window when its
    /// duration has elapsed. Returns the cycle outcome when a window closed.
    pub fn ingest(
        &mut self,
        flows: &[FlowRecord],
        snapshot: &BandwidthSnapshot,
        now: DateTime<Utc>,
    ) -> Option<CycleOutcome> {
        self.window.ingest(flows, snapshot);
        self.close_if_due(now)
    }

    /// Opportunistic close check for silent periods: called from a periodic
    /// task so windows flush even when no flow batches arrive.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<CycleOutcome> {
        self.close_if_due(now)
    }

    /// The latest health report. The `Arc` is swapped whole so readers
    /// always observe a complete, consistent report.
    pub fn latest_report(&self) -> Arc<HealthReport> {
        Arc::clone(&self.latest_report)
    }

    pub fn scorer_info(&self) -> serde_json::Value {
        self.scorers.info()
    }

    pub fn scorers_mut(&mut self) -> &mut ScorerManager {
        &mut self.scorers
    }

    fn close_if_due(&mut self, now: DateTime<Utc>) -> Option<CycleOutcome> {
        let closed = self.window.maybe_close(now)?;
        counter!("analysis_windows_total", 1);

        // Empty window: nothing to classify, the last good report stands.
        if closed.is_empty() {
            debug!("window starting {} closed empty", closed.started_at);
            return Some(CycleOutcome {
                window_started_at: closed.started_at,
                alerts: Vec::new(),
                report: Arc::clone(&self.latest_report),
            });
        }

        // One bad cycle must never crash the service or leave a torn
        // report; fall back to the safe default instead.
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_cycle(&closed)));
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(
                    "analysis cycle for window starting {} panicked; emitting safe default report",
                    closed.started_at
                );
                CycleOutcome {
                    window_started_at: closed.started_at,
                    alerts: Vec::new(),
                    report: Arc::new(HealthReport::safe_default(closed.closed_at)),
                }
            }
        };

        self.latest_report = Arc::clone(&outcome.report);
        counter!("threat_alerts_total", outcome.alerts.len() as u64);
        gauge!("network_health_score", outcome.report.overall_health_score);
        Some(outcome)
    }

    fn run_cycle(&mut self, closed: &ClosedWindow) -> CycleOutcome {
        let mut alerts = self.ddos.classify(closed, &self.baselines);
        alerts.extend(self.port_scans.analyze(&closed.flows, closed.closed_at));
        alerts.extend(self.scorers.analyze(&closed.flows, closed.closed_at));

        // Baselines absorb every completed window, attack windows included;
        // drift tolerance is a deliberate trade-off.
        self.baselines.record(RateMetric::Bandwidth, closed.bandwidth_bps);
        self.baselines.record(RateMetric::PacketRate, closed.packet_pps);
        self.baselines
            .record(RateMetric::ConnectionRate, closed.connection_cps);
        self.baselines.record(RateMetric::RequestRate, closed.request_rps);

        let report = self.correlation.correlate(closed, &alerts);
        if !alerts.is_empty() {
            info!(
                "window starting {}: {} alert(s), health {:.3}",
                closed.started_at,
                alerts.len(),
                report.overall_health_score
            );
        }

        CycleOutcome {
            window_started_at: closed.started_at,
            alerts,
            report: Arc::new(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alert::{AttackCategory, Severity};
    use crate::core::flow::ConnectionState;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn analyzer() -> TrafficAnalyzer {
        TrafficAnalyzer::new(AnalyzerConfig::default(), t0())
    }

    fn flow(src: &str, dst: &str, state: ConnectionState, packets: u64) -> FlowRecord {
        FlowRecord {
            src_ip: src.to_string(),
            dst_ip: dst.to_string(),
            src_port: 40000,
            dst_port: 80,
            protocol: 6,
            bytes_sent: packets * 100,
            bytes_received: 0,
            packets_sent: packets,
            packets_received: 0,
            duration_secs: 0.5,
            connection_state: state,
            avg_packet_size: None,
            packets_per_second: None,
            bytes_per_second: None,
        }
    }

    #[test]
    fn no_cycle_before_window_elapses() {
        let mut analyzer = analyzer();
        let out = analyzer.ingest(
            &[flow("10.0.0.1", "10.0.0.2", ConnectionState::Established, 10)],
            &BandwidthSnapshot { total_bytes: 1000, total_packets: 10 },
            t0() + Duration::seconds(30),
        );
        assert!(out.is_none());
    }

    #[test]
    fn empty_window_keeps_last_report_and_emits_no_alerts() {
        let mut analyzer = analyzer();
        let before = analyzer.latest_report();

        let outcome = analyzer.tick(t0() + Duration::seconds(60)).expect("window closes");
        assert!(outcome.alerts.is_empty());
        assert!(Arc::ptr_eq(&outcome.report, &before));
        assert!(Arc::ptr_eq(&analyzer.latest_report(), &before));
    }

    #[test]
    fn traffic_window_replaces_latest_report_atomically() {
        let mut analyzer = analyzer();
        let before = analyzer.latest_report();

        let outcome = analyzer
            .ingest(
                &[flow("10.0.0.1", "10.0.0.2", ConnectionState::Established, 10)],
                &BandwidthSnapshot { total_bytes: 1000, total_packets: 10 },
                t0() + Duration::seconds(60),
            )
            .expect("window closes");
        assert!(!Arc::ptr_eq(&outcome.report, &before));
        assert!(Arc::ptr_eq(&analyzer.latest_report(), &outcome.report));
    }

    #[test]
    fn sustained_baseline_then_spike_yields_volumetric_alert() {
        let mut analyzer = analyzer();
        let mut now = t0();

        // 35 quiet windows to establish the baseline.
        for _ in 0..35 {
            analyzer.ingest(
                &[flow("10.0.0.1", "10.0.0.2", ConnectionState::Established, 10)],
                &BandwidthSnapshot { total_bytes: 100_000, total_packets: 1000 },
                now,
            );
            now += Duration::seconds(60);
            analyzer.tick(now);
        }

        // One hot window at far more than 10x the baseline.
        analyzer.ingest(
            &[
                flow("6.6.6.1", "10.0.0.2", ConnectionState::Established, 50_000),
                flow("6.6.6.2", "10.0.0.2", ConnectionState::Established, 50_000),
            ],
            &BandwidthSnapshot { total_bytes: 100_000_000, total_packets: 1_000_000 },
            now,
        );
        now += Duration::seconds(60);
        let outcome = analyzer.tick(now).expect("hot window closes");

        let volumetric: Vec<_> = outcome
            .alerts
            .iter()
            .filter(|a| a.category == AttackCategory::Volumetric)
            .collect();
        assert!(!volumetric.is_empty());
        for alert in &volumetric {
            assert!(alert.amplification_factor >= 10.0);
            assert_eq!(alert.severity, Severity::High);
        }
        assert!(outcome.report.overall_health_score < 0.6);
    }

    #[test]
    fn shared_handle_reads_a_consistent_snapshot() {
        tokio_test::block_on(async {
            let shared: SharedAnalyzer = Arc::new(tokio::sync::RwLock::new(analyzer()));
            {
                let mut guard = shared.write().await;
                guard.tick(t0() + Duration::seconds(60));
            }
            let report = shared.read().await.latest_report();
            assert!((report.overall_health_score - 0.5).abs() < 1e-9);
        });
    }

    #[test]
    fn scan_inside_window_surfaces_in_report() {
        let mut analyzer = analyzer();
        let probes: Vec<FlowRecord> = (0..25)
            .map(|i| {
                let mut f = flow("1.1.1.1", "203.0.113.7", ConnectionState::SynSent, 1);
                f.dst_port = 1000 + i;
                f.duration_secs = 0.1;
                f
            })
            .collect();

        let outcome = analyzer
            .ingest(
                &probes,
                &BandwidthSnapshot { total_bytes: 2500, total_packets: 25 },
                t0() + Duration::seconds(60),
            )
            .expect("window closes");

        assert!(outcome
            .alerts
            .iter()
            .any(|a| a.category == AttackCategory::Reconnaissance));
        assert!(outcome
            .report
            .security
            .active_threats
            .iter()
            .any(|t| t.starts_with("port scan")));
    }
}
