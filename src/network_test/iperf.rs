//! iperf3 session output parsing -- JSON report to per-result metrics.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Parsed iperf3 JSON result (subset of fields we care about).
#[derive(Debug, Deserialize)]
pub struct Iperf3Result {
    #[serde(default)]
    pub intervals: Vec<Iperf3Interval>,
    pub end: Iperf3End,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3Interval {
    pub sum: Iperf3Sum,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3End {
    #[serde(default)]
    pub sum_sent: Option<Iperf3Sum>,
    #[serde(default)]
    pub sum_received: Option<Iperf3Sum>,
    /// UDP tests report jitter and loss here.
    #[serde(default)]
    pub sum: Option<Iperf3Sum>,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3Sum {
    pub bits_per_second: f64,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
    #[serde(default)]
    pub lost_percent: Option<f64>,
    #[serde(default)]
    pub retransmits: Option<u64>,
}

/// Metrics stored on a test result row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub throughput_min_mbps: Option<f64>,
    pub throughput_max_mbps: Option<f64>,
    pub throughput_avg_mbps: Option<f64>,
    pub lost_percent_avg: Option<f64>,
    pub jitter_ms_avg: Option<f64>,
    pub retransmits: Option<u64>,
}

/// Parse an iperf3 JSON output string into a structured result.
pub fn parse_output(json_str: &str) -> Result<Iperf3Result> {
    let result: Iperf3Result = serde_json::from_str(json_str)?;
    Ok(result)
}

impl Iperf3Result {
    pub fn metrics(&self) -> SessionMetrics {
        let per_interval: Vec<f64> = self
            .intervals
            .iter()
            .map(|i| i.sum.bits_per_second / 1_000_000.0)
            .collect();

        // Prefer received (goodput), fall back to the UDP or sender summary.
        let summary = self
            .end
            .sum_received
            .as_ref()
            .or(self.end.sum.as_ref())
            .or(self.end.sum_sent.as_ref());
        let loss_source = self.end.sum.as_ref().or(self.end.sum_received.as_ref());

        SessionMetrics {
            throughput_min_mbps: per_interval.iter().copied().reduce(f64::min),
            throughput_max_mbps: per_interval.iter().copied().reduce(f64::max),
            throughput_avg_mbps: summary.map(|s| s.bits_per_second / 1_000_000.0),
            lost_percent_avg: loss_source.and_then(|s| s.lost_percent),
            jitter_ms_avg: loss_source.and_then(|s| s.jitter_ms),
            retransmits: self.end.sum_sent.as_ref().and_then(|s| s.retransmits),
        }
    }
}
