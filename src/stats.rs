use crate::engine::RunStatistics;
use std::time::Duration;

/// Running counters for one ping run. RTTs are folded in as they arrive
/// (Welford's online mean/variance); individual samples are not kept.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    sent: u64,
    received: u64,
    duplicates: u64,
    min_rtt: Option<Duration>,
    max_rtt: Duration,
    mean_nanos: f64,
    m2_nanos: f64,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    pub fn record_reply(&mut self, rtt: Duration) {
        self.received += 1;
        self.min_rtt = Some(self.min_rtt.map_or(rtt, |min| min.min(rtt)));
        self.max_rtt = self.max_rtt.max(rtt);

        let nanos = rtt.as_nanos() as f64;
        let delta = nanos - self.mean_nanos;
        self.mean_nanos += delta / self.received as f64;
        self.m2_nanos += delta * (nanos - self.mean_nanos);
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates += 1;
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn snapshot(&self, address: &str) -> RunStatistics {
        let mut stats = RunStatistics::empty(address);
        stats.packets_sent = self.sent;
        stats.packets_received = self.received;
        stats.duplicates_received = self.duplicates;
        if self.sent > 0 {
            let lost = self.sent.saturating_sub(self.received);
            stats.packet_loss_percent = lost as f64 / self.sent as f64 * 100.0;
        }
        let Some(min_rtt) = self.min_rtt else {
            return stats;
        };

        let variance = self.m2_nanos / self.received as f64;
        stats.min_rtt = min_rtt;
        stats.max_rtt = self.max_rtt;
        stats.avg_rtt = Duration::from_nanos(self.mean_nanos.round() as u64);
        stats.std_dev_rtt = Duration::from_nanos(variance.max(0.0).sqrt().round() as u64);
        stats
    }
}
