//! Detection-window accumulation.
//!
//! The accumulator absorbs flow batches continuously and decides when the
//! current window is complete. It is the only component that mutates shared
//! window state; a window is closed and reset exactly once.

use chrono::{DateTime, Duration, Utc};
use log::warn;
use std::collections::{HashMap, HashSet};

use crate::core::flow::{BandwidthSnapshot, FlowRecord, PROTO_ICMP, PROTO_TCP, PROTO_UDP};

/// UDP destination ports commonly abused for reflection/amplification
/// (DNS, NTP, SNMP, SSDP, memcached, LDAP, NetBIOS).
const AMPLIFICATION_PORTS: [u16; 7] = [53, 123, 161, 1900, 11211, 389, 137];

/// Per-source mutable statistics for the current window only.
/// Created lazily on the first flow from a source; discarded wholesale when
/// the window closes.
#[derive(Debug, Clone, Default)]
pub struct SourceIpStats {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub connection_count: u64,
    pub target_ips: HashSet<String>,
    pub syn_packets: u64,
    pub amplification_attempts: u64,
    pub icmp_score: u64,
}

/// A completed window's frozen data, handed to the classifiers.
#[derive(Debug, Clone)]
pub struct ClosedWindow {
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub bandwidth_bps: f64,
    pub packet_pps: f64,
    pub connection_cps: f64,
    pub request_rps: f64,
    pub total_bytes: u64,
    pub total_packets: u64,
    pub flows: Vec<FlowRecord>,
    pub sources: HashMap<String, SourceIpStats>,
    pub target_syn_counts: HashMap<String, u64>,
}

impl ClosedWindow {
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty() && self.total_packets == 0
    }
}

/// Collects raw flow records and bandwidth snapshots into the current
/// detection window. Exactly one window is open at any time.
pub struct WindowAccumulator {
    duration: Duration,
    started_at: DateTime<Utc>,
    flows: Vec<FlowRecord>,
    total_bytes: u64,
    total_packets: u64,
    new_connections: u64,
    http_requests: u64,
    sources: HashMap<String, SourceIpStats>,
    target_syn_counts: HashMap<String, u64>,
}

impl WindowAccumulator {
    pub fn new(window_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            duration: Duration::seconds(window_secs as i64),
            started_at: now,
            flows: Vec::new(),
            total_bytes: 0,
            total_packets: 0,
            new_connections: 0,
            http_requests: 0,
            sources: HashMap::new(),
            target_syn_counts: HashMap::new(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Append a flow batch and its bandwidth snapshot to the open window.
    /// Malformed records are skipped with a warning and never abort the
    /// rest of the batch.
    pub fn ingest(&mut self, flows: &[FlowRecord], snapshot: &BandwidthSnapshot) {
        self.total_bytes += snapshot.total_bytes;
        self.total_packets += snapshot.total_packets;

        for flow in flows {
            if !flow.is_valid() {
                warn!(
                    "skipping malformed flow record (src={:?}, dst={:?})",
                    flow.src_ip, flow.dst_ip
                );
                continue;
            }
            self.absorb_flow(flow);
            self.flows.push(flow.clone());
        }
    }

    fn absorb_flow(&mut self, flow: &FlowRecord) {
        let stats = self.sources.entry(flow.src_ip.clone()).or_default();
        stats.bytes_sent += flow.bytes_sent;
        stats.packets_sent += flow.packets_sent;
        stats.connection_count += 1;
        stats.target_ips.insert(flow.dst_ip.clone());

        match flow.protocol {
            PROTO_TCP => {
                if flow.connection_state.is_syn_like() {
                    stats.syn_packets += flow.packets_sent;
                    *self
                        .target_syn_counts
                        .entry(flow.dst_ip.clone())
                        .or_default() += flow.packets_sent;
                    if stats.connection_count == 1 {
                        self.new_connections += 1;
                    }
                }
                if flow.is_web_flow() {
                    self.http_requests += 1;
                }
            }
            PROTO_UDP => {
                if AMPLIFICATION_PORTS.contains(&flow.dst_port) {
                    stats.amplification_attempts += 1;
                }
            }
            PROTO_ICMP => {
                stats.icmp_score += flow.packets_sent;
            }
            _ => {}
        }
    }

    /// Close the window if its duration has elapsed, returning the frozen
    /// data and starting a fresh window at `now`. Returns `None` while the
    /// window is still open.
    pub fn maybe_close(&mut self, now: DateTime<Utc>) -> Option<ClosedWindow> {
        if now - self.started_at < self.duration {
            return None;
        }

        // Guard against a degenerate elapsed time; a window is never
        // shorter than one second for rate purposes.
        let elapsed_secs = ((now - self.started_at).num_milliseconds() as f64 / 1000.0).max(1.0);

        let closed = ClosedWindow {
            started_at: self.started_at,
            closed_at: now,
            elapsed_secs,
            bandwidth_bps: (self.total_bytes as f64 * 8.0) / elapsed_secs,
            packet_pps: self.total_packets as f64 / elapsed_secs,
            connection_cps: self.new_connections as f64 / elapsed_secs,
            request_rps: self.http_requests as f64 / elapsed_secs,
            total_bytes: self.total_bytes,
            total_packets: self.total_packets,
            flows: std::mem::take(&mut self.flows),
            sources: std::mem::take(&mut self.sources),
            target_syn_counts: std::mem::take(&mut self.target_syn_counts),
        };

        self.started_at = now;
        self.total_bytes = 0;
        self.total_packets = 0;
        self.new_connections = 0;
        self.http_requests = 0;

        Some(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow::ConnectionState;
    use chrono::TimeZone;

    fn flow(src: &str, dst: &str, protocol: u8, dst_port: u16, state: ConnectionState) -> FlowRecord {
        FlowRecord {
            src_ip: src.to_string(),
            dst_ip: dst.to_string(),
            src_port: 40000,
            dst_port,
            protocol,
            bytes_sent: 1000,
            bytes_received: 200,
            packets_sent: 10,
            packets_received: 2,
            duration_secs: 0.5,
            connection_state: state,
            avg_packet_size: None,
            packets_per_second: None,
            bytes_per_second: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn window_does_not_close_early() {
        let mut acc = WindowAccumulator::new(60, t0());
        acc.ingest(
            &[flow("10.0.0.1", "10.0.0.2", PROTO_TCP, 80, ConnectionState::Established)],
            &BandwidthSnapshot { total_bytes: 1200, total_packets: 12 },
        );
        assert!(acc.maybe_close(t0() + Duration::seconds(59)).is_none());
        assert!(acc.maybe_close(t0() + Duration::seconds(60)).is_some());
    }

    #[test]
    fn close_computes_rates_and_resets() {
        let mut acc = WindowAccumulator::new(60, t0());
        acc.ingest(
            &[
                flow("10.0.0.1", "10.0.0.2", PROTO_TCP, 22, ConnectionState::SynSent),
                flow("10.0.0.1", "10.0.0.3", PROTO_TCP, 80, ConnectionState::Established),
            ],
            &BandwidthSnapshot { total_bytes: 6000, total_packets: 60 },
        );

        let closed = acc.maybe_close(t0() + Duration::seconds(60)).unwrap();
        assert!((closed.elapsed_secs - 60.0).abs() < 1e-9);
        assert!((closed.bandwidth_bps - 6000.0 * 8.0 / 60.0).abs() < 1e-6);
        assert!((closed.packet_pps - 1.0).abs() < 1e-9);
        assert!((closed.request_rps - 1.0 / 60.0).abs() < 1e-9);
        assert_eq!(closed.flows.len(), 2);

        let stats = &closed.sources["10.0.0.1"];
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.syn_packets, 10);
        assert_eq!(stats.target_ips.len(), 2);
        assert_eq!(closed.target_syn_counts["10.0.0.2"], 10);

        // The next window starts empty.
        let next = acc
            .maybe_close(t0() + Duration::seconds(120))
            .expect("second window closes");
        assert!(next.is_empty());
        assert_eq!(next.total_bytes, 0);
    }

    #[test]
    fn protocol_counters_accumulate() {
        let mut acc = WindowAccumulator::new(60, t0());
        acc.ingest(
            &[
                flow("10.0.0.9", "8.8.8.8", PROTO_UDP, 53, ConnectionState::Unknown),
                flow("10.0.0.9", "8.8.4.4", PROTO_UDP, 123, ConnectionState::Unknown),
                flow("10.0.0.9", "10.0.0.2", PROTO_ICMP, 0, ConnectionState::Unknown),
            ],
            &BandwidthSnapshot::default(),
        );
        let closed = acc.maybe_close(t0() + Duration::seconds(60)).unwrap();
        let stats = &closed.sources["10.0.0.9"];
        assert_eq!(stats.amplification_attempts, 2);
        assert_eq!(stats.icmp_score, 10);
    }

    #[test]
    fn malformed_flows_are_skipped_without_aborting_batch() {
        let mut acc = WindowAccumulator::new(60, t0());
        let mut bad = flow("10.0.0.1", "10.0.0.2", PROTO_TCP, 80, ConnectionState::Established);
        bad.src_ip = "garbage".to_string();
        acc.ingest(
            &[bad, flow("10.0.0.5", "10.0.0.2", PROTO_TCP, 80, ConnectionState::Established)],
            &BandwidthSnapshot::default(),
        );
        let closed = acc.maybe_close(t0() + Duration::seconds(60)).unwrap();
        assert_eq!(closed.flows.len(), 1);
        assert!(closed.sources.contains_key("10.0.0.5"));
        assert!(!closed.sources.contains_key("garbage"));
    }

    #[test]
    fn elapsed_is_floored_to_one_second() {
        // A zero-length window (forced close) must not divide by zero.
        let mut acc = WindowAccumulator::new(0, t0());
        acc.ingest(
            &[flow("10.0.0.1", "10.0.0.2", PROTO_TCP, 80, ConnectionState::Established)],
            &BandwidthSnapshot { total_bytes: 100, total_packets: 1 },
        );
        let closed = acc.maybe_close(t0()).unwrap();
        assert!((closed.elapsed_secs - 1.0).abs() < 1e-9);
        assert!((closed.bandwidth_bps - 800.0).abs() < 1e-9);
    }
}
