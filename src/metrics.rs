use crate::index::RefreshReport;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub hostsnap_snapshots_total: CounterVec,
    pub hostsnap_downstream_errors_total: CounterVec,
    pub hostsnap_snapshot_cache_errors_total: Counter,
    pub hostsnap_index_hosts: Gauge,
    pub hostsnap_index_refresh_timestamp_seconds: Gauge,
    pub hostsnap_index_refresh_duration_seconds: Gauge,
    pub hostsnap_index_refresh_errors_total: Counter,
    pub hostsnap_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let hostsnap_snapshots_total = CounterVec::new(
            opts!(
                "hostsnap_snapshots_total",
                "Processed snapshots by pipeline outcome"
            ),
            &["outcome"],
        )?;
        let hostsnap_downstream_errors_total = CounterVec::new(
            opts!(
                "hostsnap_downstream_errors_total",
                "Failed calls to the core service by operation"
            ),
            &["op"],
        )?;
        let hostsnap_snapshot_cache_errors_total = Counter::with_opts(opts!(
            "hostsnap_snapshot_cache_errors_total",
            "Failed writes of raw snapshots to the cache"
        ))?;
        let hostsnap_index_hosts =
            Gauge::with_opts(opts!("hostsnap_index_hosts", "Hosts in the active index"))?;
        let hostsnap_index_refresh_timestamp_seconds = Gauge::with_opts(opts!(
            "hostsnap_index_refresh_timestamp_seconds",
            "Unix time of the last index refresh"
        ))?;
        let hostsnap_index_refresh_duration_seconds = Gauge::with_opts(opts!(
            "hostsnap_index_refresh_duration_seconds",
            "Duration of the last index refresh"
        ))?;
        let hostsnap_index_refresh_errors_total = Counter::with_opts(opts!(
            "hostsnap_index_refresh_errors_total",
            "Index refreshes that stopped on a store error"
        ))?;
        let hostsnap_scrape_count_total = Counter::with_opts(opts!(
            "hostsnap_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &hostsnap_snapshots_total)?;
        register(&registry, &hostsnap_downstream_errors_total)?;
        register(&registry, &hostsnap_snapshot_cache_errors_total)?;
        register(&registry, &hostsnap_index_hosts)?;
        register(&registry, &hostsnap_index_refresh_timestamp_seconds)?;
        register(&registry, &hostsnap_index_refresh_duration_seconds)?;
        register(&registry, &hostsnap_index_refresh_errors_total)?;
        register(&registry, &hostsnap_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            hostsnap_snapshots_total,
            hostsnap_downstream_errors_total,
            hostsnap_snapshot_cache_errors_total,
            hostsnap_index_hosts,
            hostsnap_index_refresh_timestamp_seconds,
            hostsnap_index_refresh_duration_seconds,
            hostsnap_index_refresh_errors_total,
            hostsnap_scrape_count_total,
        }))
    }

    pub fn inc_outcome(&self, outcome: &str) {
        self.hostsnap_snapshots_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_downstream_error(&self, op: &str) {
        self.hostsnap_downstream_errors_total
            .with_label_values(&[op])
            .inc();
    }

    pub fn inc_cache_error(&self) {
        self.hostsnap_snapshot_cache_errors_total.inc();
    }

    pub fn record_refresh(&self, report: &RefreshReport) {
        self.hostsnap_index_hosts.set(report.hosts as f64);
        self.hostsnap_index_refresh_timestamp_seconds
            .set(now_unix() as f64);
        self.hostsnap_index_refresh_duration_seconds
            .set(report.elapsed.as_secs_f64());
        if !report.complete {
            self.hostsnap_index_refresh_errors_total.inc();
        }
    }

    pub fn inc_scrape_count(&self) {
        self.hostsnap_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
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
