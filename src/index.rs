//! In-memory index of host records keyed by cloud id and inner IP.
//!
//! The active [`Generation`] is published through an [`ArcSwap`]. A refresh
//! builds the next generation from a full table scan without holding any lock
//! and installs it with a single pointer swap; readers that loaded the previous
//! generation keep using it until they drop their `Arc`.
//!
//! Records fetched from the store on a cache miss are point-inserted into the
//! overlay of the generation that is active once the lookup returns. If that
//! generation already holds the key, its record wins and the fetched row is
//! dropped. The base map of a generation is never mutated after construction,
//! and record fields are only changed through the record's own lock.

use crate::record::{Fields, HostKey, HostRecord};
use crate::services::HostStore;
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
pub struct Generation {
    base: HashMap<HostKey, Arc<HostRecord>>,
    overlay: RwLock<HashMap<HostKey, Arc<HostRecord>>>,
    built_at_unix: i64,
}

impl Generation {
    fn from_rows(rows: Vec<Fields>, built_at_unix: i64) -> Self {
        let mut base = HashMap::with_capacity(rows.len());
        for row in rows {
            if let Some(key) = HostKey::from_row(&row) {
                base.insert(key, Arc::new(HostRecord::new(row)));
            }
        }
        Self {
            base,
            overlay: RwLock::new(HashMap::new()),
            built_at_unix,
        }
    }

    pub fn get(&self, key: &HostKey) -> Option<Arc<HostRecord>> {
        if let Some(record) = self.base.get(key) {
            return Some(record.clone());
        }
        self.overlay.read().get(key).cloned()
    }

    /// Stores `record` under `key` unless this generation already holds one,
    /// and returns whichever record it ends up holding.
    fn adopt(&self, key: HostKey, record: HostRecord) -> Arc<HostRecord> {
        if let Some(existing) = self.base.get(&key) {
            return existing.clone();
        }
        self.overlay
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(record))
            .clone()
    }

    pub fn len(&self) -> usize {
        let overlay = self.overlay.read();
        self.base.len() + overlay.keys().filter(|k| !self.base.contains_key(*k)).count()
    }

    pub fn built_at_unix(&self) -> i64 {
        self.built_at_unix
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshReport {
    pub hosts: usize,
    pub pages: u64,
    pub complete: bool,
    pub elapsed: Duration,
}

pub struct HostIndex {
    store: Arc<dyn HostStore>,
    page_size: u64,
    active: ArcSwap<Generation>,
}

impl HostIndex {
    pub fn new(store: Arc<dyn HostStore>, page_size: u64) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            active: ArcSwap::from_pointee(Generation::default()),
        }
    }

    /// The generation readers currently see.
    pub fn generation(&self) -> Arc<Generation> {
        self.active.load_full()
    }

    /// Finds the host owning one of `ips` in `cloud_id`, falling back to the
    /// store when no candidate is indexed.
    pub async fn resolve(
        &self,
        cloud_id: &str,
        owner_id: &str,
        ips: &[String],
    ) -> Option<Arc<HostRecord>> {
        if ips.is_empty() {
            warn!(cloud_id, "snapshot has no ip, host cannot be resolved");
            return None;
        }

        let generation = self.generation();
        for ip in ips {
            if let Some(record) = generation.get(&HostKey::new(cloud_id, ip.as_str())) {
                return Some(record);
            }
        }
        drop(generation);

        info!(cloud_id, ?ips, "ips not in host index, querying store");
        let Ok(cloud) = cloud_id.trim().parse::<i64>() else {
            info!(cloud_id, "cloud id is not an integer");
            return None;
        };
        let rows = match self.store.find_by_ips(cloud, ips, owner_id).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, cloud_id, "host lookup in store failed");
                return None;
            }
        };

        for row in rows {
            let Some(key) = HostKey::from_row(&row) else {
                continue;
            };
            // A refresh may have swapped generations during the lookup.
            return Some(self.active.load().adopt(key, HostRecord::new(row)));
        }

        info!(cloud_id, ?ips, "ips not in host index nor store");
        None
    }

    /// Rebuilds the whole index from a paginated scan of the store.
    pub async fn refresh(&self) -> RefreshReport {
        let started = Instant::now();
        let mut rows = Vec::new();
        let mut start = 0_u64;
        let mut pages = 0_u64;
        let mut complete = true;

        loop {
            let page = match self.store.find_page(start, self.page_size).await {
                Ok(page) => page,
                Err(err) => {
                    error!(error = %err, start, "host table scan failed, keeping partial result");
                    complete = false;
                    break;
                }
            };
            pages += 1;
            let fetched = page.len() as u64;
            rows.extend(page);
            if fetched < self.page_size {
                break;
            }
            start += self.page_size;
        }

        let generation = Generation::from_rows(rows, now_unix());
        let hosts = generation.len();
        self.active.store(Arc::new(generation));

        let report = RefreshReport {
            hosts,
            pages,
            complete,
            elapsed: started.elapsed(),
        };
        info!(
            hosts = report.hosts,
            pages = report.pages,
            complete = report.complete,
            elapsed = ?report.elapsed,
            "host index refreshed"
        );
        report
    }
}

/// Owns the periodic index refresh: once at start, then on every tick until stopped.
pub struct Refresher {
    index: Arc<HostIndex>,
    interval: Duration,
    on_refresh: Option<Box<dyn Fn(&RefreshReport) + Send + Sync>>,
}

impl Refresher {
    pub fn new(index: Arc<HostIndex>, interval: Duration) -> Self {
        Self {
            index,
            interval,
            on_refresh: None,
        }
    }

    pub fn on_refresh(mut self, hook: impl Fn(&RefreshReport) + Send + Sync + 'static) -> Self {
        self.on_refresh = Some(Box::new(hook));
        self
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("host index refresher stopped");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.index.refresh().await;
                    if let Some(hook) = &self.on_refresh {
                        hook(&report);
                    }
                }
            }
        }
    }
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
    use crate::error::SnapError;
    use crate::services::fakes::{host_row, MemoryHostStore};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    fn index_over(store: &Arc<MemoryHostStore>, page_size: u64) -> HostIndex {
        HostIndex::new(store.clone(), page_size)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn refresh_loads_every_row_across_pages() {
        for count in [0, 1, 999, 1000, 1001, 2000, 2501] {
            let store = Arc::new(MemoryHostStore::with_hosts(count));
            let index = index_over(&store, 1000);
            let report = index.refresh().await;
            assert_eq!(report.hosts, count, "host count for {count}");
            assert_eq!(index.generation().len(), count);
            assert!(report.complete);
            assert_eq!(report.pages as usize, count / 1000 + 1, "pages for {count}");
        }
    }

    #[tokio::test]
    async fn refresh_keeps_rows_read_before_a_scan_error() {
        let store = Arc::new(MemoryHostStore::with_hosts(25));
        store.fail_from(10);
        let index = index_over(&store, 10);

        let report = index.refresh().await;
        assert!(!report.complete);
        assert_eq!(report.hosts, 10);
        assert_eq!(store.page_calls(), 2);
        assert!(index
            .generation()
            .get(&HostKey::new("0", "10.0.0.9"))
            .is_some());
    }

    #[tokio::test]
    async fn rows_without_identity_are_skipped() {
        let store = Arc::new(MemoryHostStore::with_rows(vec![
            host_row(1, 0, "10.0.0.1"),
            json!({"bk_host_id": 2}).as_object().cloned().expect("object"),
        ]));
        let index = index_over(&store, 1000);
        assert_eq!(index.refresh().await.hosts, 1);
    }

    #[tokio::test]
    async fn resolve_tries_candidates_in_order() {
        let store = Arc::new(MemoryHostStore::with_rows(vec![
            host_row(1, 0, "10.0.0.1"),
            host_row(2, 0, "10.0.0.2"),
        ]));
        let index = index_over(&store, 1000);
        index.refresh().await;

        let ips = vec!["10.0.0.2".to_string(), "10.0.0.1".to_string()];
        let record = index.resolve("0", "0", &ips).await.expect("resolved");
        assert_eq!(record.host_id().expect("id"), 2);

        let ips = vec!["192.168.0.1".to_string(), "10.0.0.1".to_string()];
        let record = index.resolve("0", "0", &ips).await.expect("resolved");
        assert_eq!(record.host_id().expect("id"), 1);
        assert!(store.lookups().is_empty());
    }

    #[tokio::test]
    async fn resolve_is_scoped_to_the_cloud_id() {
        let store = Arc::new(MemoryHostStore::with_rows(vec![host_row(1, 0, "10.0.0.1")]));
        let index = index_over(&store, 1000);
        index.refresh().await;

        let ips = vec!["10.0.0.1".to_string()];
        assert!(index.resolve("5", "0", &ips).await.is_none());
        assert_eq!(store.lookups(), vec![(5, ips.clone(), "0".to_string())]);
    }

    #[tokio::test]
    async fn miss_falls_back_to_store_and_is_cached() {
        let store = Arc::new(MemoryHostStore::default());
        let index = index_over(&store, 1000);
        index.refresh().await;
        store.push(host_row(9, 0, "10.0.0.9"));

        let ips = vec!["10.0.0.9".to_string()];
        let first = index.resolve("0", "0", &ips).await.expect("from store");
        assert_eq!(store.lookups().len(), 1);
        assert_eq!(index.generation().len(), 1);

        let second = index.resolve("0", "0", &ips).await.expect("from index");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.lookups().len(), 1);
    }

    /// Holds every IP lookup until `open` is notified.
    struct GatedStore {
        inner: Arc<MemoryHostStore>,
        open: Notify,
    }

    #[async_trait]
    impl HostStore for GatedStore {
        async fn find_page(&self, start: u64, limit: u64) -> Result<Vec<Fields>, SnapError> {
            self.inner.find_page(start, limit).await
        }

        async fn find_by_ips(
            &self,
            cloud_id: i64,
            ips: &[String],
            owner_id: &str,
        ) -> Result<Vec<Fields>, SnapError> {
            self.open.notified().await;
            self.inner.find_by_ips(cloud_id, ips, owner_id).await
        }
    }

    #[tokio::test]
    async fn lookup_racing_a_refresh_returns_the_indexed_record() {
        let inner = Arc::new(MemoryHostStore::default());
        let store = Arc::new(GatedStore {
            inner: inner.clone(),
            open: Notify::new(),
        });
        let index = Arc::new(HostIndex::new(store.clone(), 1000));

        let lookup = {
            let index = index.clone();
            tokio::spawn(async move {
                index
                    .resolve("0", "0", &["10.0.0.9".to_string()])
                    .await
            })
        };
        settle().await;

        inner.push(host_row(9, 0, "10.0.0.9"));
        assert_eq!(index.refresh().await.hosts, 1);
        store.open.notify_one();

        let resolved = lookup.await.expect("join").expect("resolved");
        let indexed = index
            .generation()
            .get(&HostKey::new("0", "10.0.0.9"))
            .expect("indexed");
        assert!(Arc::ptr_eq(&resolved, &indexed));
        assert_eq!(index.generation().len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_inputs_do_not_reach_the_store() {
        let store = Arc::new(MemoryHostStore::default());
        let index = index_over(&store, 1000);

        assert!(index.resolve("0", "0", &[]).await.is_none());
        assert!(index
            .resolve("not-a-number", "0", &["10.0.0.1".to_string()])
            .await
            .is_none());
        assert!(store.lookups().is_empty());
    }

    #[tokio::test]
    async fn readers_keep_their_generation_across_a_swap() {
        let store = Arc::new(MemoryHostStore::with_rows(vec![host_row(1, 0, "10.0.0.1")]));
        let index = index_over(&store, 1000);
        index.refresh().await;

        let held = index.generation();
        store.push(host_row(2, 0, "10.0.0.2"));
        index.refresh().await;

        let new_key = HostKey::new("0", "10.0.0.2");
        assert!(held.get(&new_key).is_none());
        assert_eq!(held.len(), 1);

        let current = index.generation();
        assert!(current.get(&new_key).is_some());
        assert!(!Arc::ptr_eq(&held, &current));
        assert!(!Arc::ptr_eq(
            &held.get(&HostKey::new("0", "10.0.0.1")).expect("old"),
            &current.get(&HostKey::new("0", "10.0.0.1")).expect("new"),
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_runs_at_start_and_on_every_tick() {
        let store = Arc::new(MemoryHostStore::with_hosts(3));
        let index = Arc::new(index_over(&store, 1000));
        let (stop_tx, stop_rx) = watch::channel(false);
        let refreshed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = refreshed.clone();

        let refresher = Refresher::new(index.clone(), Duration::from_secs(600)).on_refresh(
            move |report| {
                assert_eq!(report.hosts, 3);
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            },
        );
        let task = tokio::spawn(refresher.run(stop_rx));

        settle().await;
        assert_eq!(store.scans(), 1);
        assert_eq!(index.generation().len(), 3);

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(store.scans(), 2);
        assert_eq!(refreshed.load(std::sync::atomic::Ordering::SeqCst), 2);

        stop_tx.send(true).expect("refresher alive");
        task.await.expect("refresher exits cleanly");
    }
}
