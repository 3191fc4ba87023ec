//! Flow-level data model for the traffic analysis service.
//!
//! Flow records arrive pre-aggregated from the upstream flow engine; the
//! analysis core consumes them read-only. A bandwidth snapshot accompanies
//! each batch and is treated as authoritative for volumetric baselining.

use serde::{Deserialize, Serialize};

/// TCP protocol number.
pub const PROTO_TCP: u8 = 6;
/// UDP protocol number.
pub const PROTO_UDP: u8 = 17;
/// ICMP protocol number.
pub const PROTO_ICMP: u8 = 1;

/// Destination ports treated as web/application traffic.
pub const WEB_PORTS: [u16; 4] = [80, 443, 8080, 8443];

/// Connection state reported by the upstream flow aggregator.
///
/// The aggregator serialises its own enum in CamelCase while older feeds
/// use snake_case labels; parsing is case-insensitive and unrecognised
/// labels collapse to `Unknown` rather than failing the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Established,
    SynSent,
    SynReceived,
    FinWait,
    Closed,
    Reset,
    Unknown,
}

impl<'de> Deserialize<'de> for ConnectionState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let label = String::deserialize(deserializer)?;
        Ok(ConnectionState::from_label(&label))
    }
}

impl ConnectionState {
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "established" => ConnectionState::Established,
            "syn_sent" | "synsent" => ConnectionState::SynSent,
            "syn_received" | "synreceived" => ConnectionState::SynReceived,
            "fin_wait" | "finwait" => ConnectionState::FinWait,
            "closed" => ConnectionState::Closed,
            "reset" => ConnectionState::Reset,
            _ => ConnectionState::Unknown,
        }
    }

    /// SYN-like states: the source initiated a handshake that has not
    /// completed from its point of view.
    pub fn is_syn_like(self) -> bool {
        matches!(self, ConnectionState::SynSent | ConnectionState::SynReceived)
    }

    /// States counted as incomplete connections for loss estimation.
    pub fn is_incomplete(self) -> bool {
        matches!(self, ConnectionState::SynSent | ConnectionState::FinWait)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Unknown
    }
}

/// A single aggregated traffic record between a source and destination.
///
/// Immutable once produced upstream; the core never mutates flow records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub src_ip: String,
    pub dst_ip: String,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_port: u16,
    pub protocol: u8,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub packets_sent: u64,
    #[serde(default)]
    pub packets_received: u64,
    /// Flow duration in seconds. The upstream engine serialises a
    /// `Duration` as `{secs, nanos}`; float seconds are accepted as well.
    #[serde(default, deserialize_with = "de_duration_secs", alias = "duration")]
    pub duration_secs: f64,
    #[serde(default)]
    pub connection_state: ConnectionState,
    // Derived rates, when the aggregator supplies them.
    #[serde(default)]
    pub avg_packet_size: Option<f64>,
    #[serde(default)]
    pub packets_per_second: Option<f64>,
    #[serde(default)]
    pub bytes_per_second: Option<f64>,
}

impl FlowRecord {
    /// Check the required fields. Records failing this are skipped with a
    /// warning and must never abort the rest of a batch.
    pub fn is_valid(&self) -> bool {
        !self.src_ip.is_empty()
            && !self.dst_ip.is_empty()
            && self.src_ip.parse::<std::net::IpAddr>().is_ok()
            && self.dst_ip.parse::<std::net::IpAddr>().is_ok()
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }

    pub fn total_packets(&self) -> u64 {
        self.packets_sent + self.packets_received
    }

    pub fn is_web_flow(&self) -> bool {
        self.protocol == PROTO_TCP && WEB_PORTS.contains(&self.dst_port)
    }
}

/// Aggregate bytes/packets observed in the current window, supplied
/// alongside each flow batch. May double-count versus summed flow records;
/// authoritative for volumetric baselining.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BandwidthSnapshot {
    #[serde(default, alias = "total_bytes_this_window")]
    pub total_bytes: u64,
    #[serde(default, alias = "total_packets_this_window")]
    pub total_packets: u64,
}

fn de_duration_secs<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationRepr {
        Seconds(f64),
        Parts {
            secs: u64,
            #[serde(default)]
            nanos: u32,
        },
    }

    Ok(match DurationRepr::deserialize(deserializer)? {
        DurationRepr::Seconds(s) => s,
        DurationRepr::Parts { secs, nanos } => secs as f64 + nanos as f64 / 1e9,
    })
}
