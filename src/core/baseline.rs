//! Adaptive per-metric baseline tracking.
//!
//! Baselines answer "what is normal?" for each tracked rate. Histories are
//! bounded ring buffers of per-window scalar rates; raw flows are never
//! retained here.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Rates tracked across completed windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateMetric {
    /// Bandwidth in bits per second.
    Bandwidth,
    /// Packets per second.
    PacketRate,
    /// New connections per second.
    ConnectionRate,
    /// Web requests per second.
    RequestRate,
}

pub const ALL_METRICS: [RateMetric; 4] = [
    RateMetric::Bandwidth,
    RateMetric::PacketRate,
    RateMetric::ConnectionRate,
    RateMetric::RequestRate,
];

/// Fixed-capacity history of completed-window rates per metric.
pub struct BaselineTracker {
    capacity: usize,
    histories: HashMap<RateMetric, VecDeque<f64>>,
}

impl BaselineTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            histories: ALL_METRICS
                .iter()
                .map(|m| (*m, VecDeque::with_capacity(capacity)))
                .collect(),
        }
    }

    /// Append a rate sample, evicting the oldest at capacity.
    pub fn record(&mut self, metric: RateMetric, rate: f64) {
        let history = self.histories.entry(metric).or_default();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(rate);
    }

    /// Robust baseline estimate: the median once the history is more than
    /// half full (stable against occasional spikes), the mean of whatever
    /// samples exist otherwise. An empty history reports 1.0 so downstream
    /// ratio math never divides by zero.
    pub fn baseline(&self, metric: RateMetric) -> f64 {
        let history = match self.histories.get(&metric) {
            Some(h) if !h.is_empty() => h,
            _ => return 1.0,
        };

        if history.len() > self.capacity / 2 {
            median(history)
        } else {
            history.iter().sum::<f64>() / history.len() as f64
        }
    }

    pub fn len(&self, metric: RateMetric) -> usize {
        self.histories.get(&metric).map_or(0, VecDeque::len)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn median(values: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
