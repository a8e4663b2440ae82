use crate::tree::TreeReport;
use prometheus::core::Collector;
use prometheus::{
    opts, Counter, CounterVec, Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub census_submissions_total: CounterVec,
    pub census_processes_ingested_total: IntCounter,
    pub census_last_ingest_timestamp_seconds: Gauge,
    pub census_hosts_active: IntGauge,
    pub census_snapshots_pruned_total: IntCounter,
    pub census_hosts_deactivated_total: IntCounter,
    pub census_tree_anomalies_total: CounterVec,
    pub census_scrape_count_total: Counter,
    pub census_uptime_seconds: Gauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted,
    Unauthorized,
    Invalid,
    Error,
}

impl SubmissionOutcome {
    fn label(self) -> &'static str {
        match self {
            SubmissionOutcome::Accepted => "accepted",
            SubmissionOutcome::Unauthorized => "unauthorized",
            SubmissionOutcome::Invalid => "invalid",
            SubmissionOutcome::Error => "error",
        }
    }
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let census_submissions_total = CounterVec::new(
            opts!(
                "census_submissions_total",
                "Snapshot submissions received, by outcome"
            ),
            &["outcome"],
        )?;
        let census_processes_ingested_total = IntCounter::with_opts(opts!(
            "census_processes_ingested_total",
            "Process rows stored across all accepted snapshots"
        ))?;
        let census_last_ingest_timestamp_seconds = Gauge::with_opts(opts!(
            "census_last_ingest_timestamp_seconds",
            "Unix time of the last accepted snapshot"
        ))?;
        let census_hosts_active = IntGauge::with_opts(opts!(
            "census_hosts_active",
            "Hosts currently marked active"
        ))?;
        let census_snapshots_pruned_total = IntCounter::with_opts(opts!(
            "census_snapshots_pruned_total",
            "Snapshots deleted by the retention sweep"
        ))?;
        let census_hosts_deactivated_total = IntCounter::with_opts(opts!(
            "census_hosts_deactivated_total",
            "Hosts marked inactive by the retention sweep"
        ))?;
        let census_tree_anomalies_total = CounterVec::new(
            opts!(
                "census_tree_anomalies_total",
                "Irregular parent links met while building process trees"
            ),
            &["kind"],
        )?;
        let census_scrape_count_total = Counter::with_opts(opts!(
            "census_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let census_uptime_seconds =
            Gauge::with_opts(opts!("census_uptime_seconds", "Server uptime in seconds"))?;

        register(&registry, &census_submissions_total)?;
        register(&registry, &census_processes_ingested_total)?;
        register(&registry, &census_last_ingest_timestamp_seconds)?;
        register(&registry, &census_hosts_active)?;
        register(&registry, &census_snapshots_pruned_total)?;
        register(&registry, &census_hosts_deactivated_total)?;
        register(&registry, &census_tree_anomalies_total)?;
        register(&registry, &census_scrape_count_total)?;
        register(&registry, &census_uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            census_submissions_total,
            census_processes_ingested_total,
            census_last_ingest_timestamp_seconds,
            census_hosts_active,
            census_snapshots_pruned_total,
            census_hosts_deactivated_total,
            census_tree_anomalies_total,
            census_scrape_count_total,
            census_uptime_seconds,
        }))
    }

    pub fn inc_submission(&self, outcome: SubmissionOutcome) {
        self.census_submissions_total
            .with_label_values(&[outcome.label()])
            .inc();
    }

    pub fn record_ingest(&self, processes: usize, active_hosts: i64) {
        self.inc_submission(SubmissionOutcome::Accepted);
        self.census_hosts_active.set(active_hosts);
        self.census_processes_ingested_total.inc_by(processes as u64);
        self.census_last_ingest_timestamp_seconds
            .set(now_unix() as f64);
    }

    pub fn record_tree_report(&self, report: &TreeReport) {
        if !report.duplicate_pids.is_empty() {
            self.census_tree_anomalies_total
                .with_label_values(&["duplicate_pid"])
                .inc_by(report.duplicate_pids.len() as f64);
        }
        if !report.cycle_breaks.is_empty() {
            self.census_tree_anomalies_total
                .with_label_values(&["cycle_break"])
                .inc_by(report.cycle_breaks.len() as f64);
        }
    }

    pub fn record_sweep(&self, deactivated: usize, pruned: usize, active_hosts: i64) {
        self.census_hosts_deactivated_total.inc_by(deactivated as u64);
        self.census_snapshots_pruned_total.inc_by(pruned as u64);
        self.census_hosts_active.set(active_hosts);
    }

    pub fn set_active_hosts(&self, active_hosts: i64) {
        self.census_hosts_active.set(active_hosts);
    }

    pub fn inc_scrape_count(&self) {
        self.census_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.census_uptime_seconds.set(uptime);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_lists_census_families() {
        let metrics = Metrics::new().expect("инициализация метрик");
        metrics.record_ingest(3, 2);
        metrics.inc_submission(SubmissionOutcome::Unauthorized);
        metrics.record_tree_report(&TreeReport {
            duplicate_pids: vec![4],
            cycle_breaks: vec![1, 2],
        });
        let text = String::from_utf8(metrics.encode_metrics().expect("кодирование"))
            .expect("utf-8");
        assert!(text.contains("census_submissions_total{outcome=\"accepted\"} 1"));
        assert!(text.contains("census_submissions_total{outcome=\"unauthorized\"} 1"));
        assert!(text.contains("census_processes_ingested_total 3"));
        assert!(text.contains("census_hosts_active 2"));
        assert!(text.contains("census_tree_anomalies_total{kind=\"cycle_break\"} 2"));
        assert!(text.contains("census_uptime_seconds"));
    }
}
