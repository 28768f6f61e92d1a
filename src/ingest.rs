//! Redis pub/sub ingestion of host snapshots.

use crate::error::SnapError;
use crate::pipeline::HostSnap;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use redis::{ErrorKind, RedisError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Bounded pool of pipeline workers, one task per message.
pub struct Workers {
    snap: Arc<HostSnap>,
    permits: Arc<Semaphore>,
    size: u32,
}

impl Workers {
    pub fn new(snap: Arc<HostSnap>, size: usize) -> Self {
        let size = u32::try_from(size.max(1)).unwrap_or(u32::MAX);
        Self {
            snap,
            permits: Arc::new(Semaphore::new(size as usize)),
            size,
        }
    }

    /// Waits for a free worker and hands it `payload`.
    ///
    /// Returns `false` and drops the payload if `stop` fires while every
    /// worker is busy.
    pub async fn submit(&self, payload: String, stop: &mut watch::Receiver<bool>) -> bool {
        let permit = tokio::select! {
            biased;
            permit = self.permits.clone().acquire_owned() => permit,
            _ = stopped(stop) => return false,
        };
        let Ok(permit) = permit else {
            return false;
        };
        let snap = self.snap.clone();
        tokio::spawn(async move {
            let _permit = permit;
            process(&snap, &payload).await;
        });
        true
    }

    /// Resolves once every in-flight worker has finished.
    pub async fn drain(&self) {
        if let Ok(all) = self.permits.acquire_many(self.size).await {
            drop(all);
        }
    }
}

pub async fn process(snap: &HostSnap, payload: &str) {
    match snap.handle_snapshot(payload).await {
        Ok(outcome) => debug!(outcome = outcome.label(), "snapshot handled"),
        Err(err) if err.is_input_anomaly() => warn!(error = %err, "snapshot skipped"),
        Err(err) => error!(error = %err, "snapshot handling failed"),
    }
}

/// Resolves once `stop` holds `true` or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        let flagged = *stop.borrow_and_update();
        if flagged || stop.changed().await.is_err() {
            return;
        }
    }
}

/// Consumes `channels` until `stop` flips, reconnecting after errors.
pub async fn run_subscriber(
    client: redis::Client,
    channels: Vec<String>,
    workers: Workers,
    stop: watch::Receiver<bool>,
) {
    let client = &client;
    let channels = channels.as_slice();
    run_source(move || subscribe(client, channels), workers, stop).await;
}

async fn subscribe(
    client: &redis::Client,
    channels: &[String],
) -> Result<BoxStream<'static, String>, SnapError> {
    let mut pubsub = client.get_async_pubsub().await?;
    for channel in channels.iter().filter(|c| !c.trim().is_empty()) {
        pubsub.subscribe(channel).await?;
    }
    info!(?channels, "subscribed to snapshot channels");

    let payloads = pubsub.into_on_message().filter_map(|message| async move {
        match message.get_payload::<String>() {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(error = %err, channel = message.get_channel_name(), "non-text snapshot dropped");
                None
            }
        }
    });
    Ok(payloads.boxed())
}

/// Drives the payload streams opened by `connect` through `workers`.
///
/// A stream that fails to open or ends is reopened after [`RECONNECT_DELAY`].
/// In-flight workers are drained before this returns.
async fn run_source<C, F, S>(mut connect: C, workers: Workers, mut stop: watch::Receiver<bool>)
where
    C: FnMut() -> F,
    F: Future<Output = Result<S, SnapError>>,
    S: Stream<Item = String> + Unpin,
{
    loop {
        if *stop.borrow() {
            break;
        }
        let result = match connect().await {
            Ok(payloads) => consume(payloads, &workers, &mut stop).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => break,
            Err(err) => {
                error!(error = %err, retry_in = ?RECONNECT_DELAY, "snapshot subscription failed");
                tokio::select! {
                    _ = stopped(&mut stop) => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    workers.drain().await;
    info!("snapshot subscriber stopped");
}

async fn consume<S>(
    mut payloads: S,
    workers: &Workers,
    stop: &mut watch::Receiver<bool>,
) -> Result<(), SnapError>
where
    S: Stream<Item = String> + Unpin,
{
    loop {
        tokio::select! {
            _ = stopped(stop) => return Ok(()),
            payload = payloads.next() => {
                let Some(payload) = payload else {
                    return Err(RedisError::from((ErrorKind::IoError, "pub/sub stream closed")).into());
                };
                if !workers.submit(payload, stop).await {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ChangeDetector;
    use crate::index::HostIndex;
    use crate::limiter::RateLimiter;
    use crate::metrics::Metrics;
    use crate::record::Fields;
    use crate::services::fakes::{MemoryHostStore, MemorySnapshotCache, RecordingCoreService};
    use crate::services::HostStore;
    use async_trait::async_trait;
    use futures::stream;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Host store whose IP lookups take `delay` and find nothing.
    struct SlowStore {
        delay: Duration,
    }

    #[async_trait]
    impl HostStore for SlowStore {
        async fn find_page(&self, _start: u64, _limit: u64) -> Result<Vec<Fields>, SnapError> {
            Ok(Vec::new())
        }

        async fn find_by_ips(
            &self,
            _cloud_id: i64,
            _ips: &[String],
            _owner_id: &str,
        ) -> Result<Vec<Fields>, SnapError> {
            tokio::time::sleep(self.delay).await;
            Ok(Vec::new())
        }
    }

    fn pipeline_with(store: Arc<dyn HostStore>, metrics: Arc<Metrics>) -> Arc<HostSnap> {
        Arc::new(HostSnap::new(
            Arc::new(HostIndex::new(store, 1000)),
            ChangeDetector::new(10),
            RateLimiter::new(40, 100),
            Arc::new(RecordingCoreService::default()),
            Arc::new(MemorySnapshotCache::default()),
            metrics,
            "cc:v3:snapshot:",
        ))
    }

    fn pipeline(metrics: Arc<Metrics>) -> Arc<HostSnap> {
        pipeline_with(Arc::new(MemoryHostStore::default()), metrics)
    }

    fn snapshot(i: usize) -> String {
        format!(r#"{{"cloudid": 0, "ip": "10.0.0.{i}"}}"#)
    }

    fn not_found(metrics: &Metrics) -> f64 {
        metrics
            .hostsnap_snapshots_total
            .with_label_values(&["not_found"])
            .get()
    }

    fn assert_about(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(10),
            "expected about {expected:?}, got {actual:?}"
        );
    }

    #[tokio::test]
    async fn drain_waits_for_every_submitted_message() {
        let metrics = Metrics::new().expect("metrics");
        let workers = Workers::new(pipeline(metrics.clone()), 2);
        let (_tx, mut stop) = watch::channel(false);

        for i in 0..5 {
            assert!(workers.submit(snapshot(i), &mut stop).await);
        }
        workers.drain().await;

        assert_eq!(not_found(&metrics), 5.0);
    }

    #[tokio::test]
    async fn zero_workers_still_processes() {
        let metrics = Metrics::new().expect("metrics");
        let workers = Workers::new(pipeline(metrics.clone()), 0);
        let (_tx, mut stop) = watch::channel(false);
        assert!(workers.submit("garbage".to_string(), &mut stop).await);
        workers.drain().await;
        assert_eq!(not_found(&metrics), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn ended_stream_is_reopened_after_the_delay() {
        let metrics = Metrics::new().expect("metrics");
        let workers = Workers::new(pipeline(metrics.clone()), 2);
        let (tx, stop) = watch::channel(false);
        let opened_at = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let opened_at = opened_at.clone();
            tokio::spawn(async move {
                let connect = move || {
                    let attempt = {
                        let mut opened = opened_at.lock();
                        opened.push(Instant::now());
                        opened.len()
                    };
                    async move { Ok::<_, SnapError>(stream::iter(vec![snapshot(attempt)])) }
                };
                run_source(connect, workers, stop).await;
            })
        };

        tokio::time::sleep(Duration::from_secs(12)).await;
        tx.send(true).expect("subscriber alive");
        task.await.expect("subscriber exits");

        let opened = opened_at.lock().clone();
        assert_eq!(opened.len(), 3);
        for pair in opened.windows(2) {
            assert_about(pair[1] - pair[0], RECONNECT_DELAY);
        }
        assert_eq!(not_found(&metrics), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_is_retried_until_stopped() {
        let metrics = Metrics::new().expect("metrics");
        let workers = Workers::new(pipeline(metrics.clone()), 1);
        let (tx, stop) = watch::channel(false);
        let attempts = Arc::new(Mutex::new(0usize));

        let task = {
            let attempts = attempts.clone();
            tokio::spawn(run_source(
                move || {
                    *attempts.lock() += 1;
                    async {
                        Err::<stream::Empty<String>, SnapError>(
                            RedisError::from((ErrorKind::IoError, "connection refused")).into(),
                        )
                    }
                },
                workers,
                stop,
            ))
        };

        tokio::time::sleep(Duration::from_secs(7)).await;
        tx.send(true).expect("subscriber alive");
        let started = Instant::now();
        task.await.expect("subscriber exits");

        assert_eq!(*attempts.lock(), 2);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_in_flight_workers() {
        let metrics = Metrics::new().expect("metrics");
        let store = Arc::new(SlowStore {
            delay: Duration::from_secs(30),
        });
        let workers = Workers::new(pipeline_with(store, metrics.clone()), 2);
        let (tx, stop) = watch::channel(false);

        let task = tokio::spawn(run_source(
            || async { Ok::<_, SnapError>(stream::iter(vec![snapshot(1)]).chain(stream::pending())) },
            workers,
            stop,
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(not_found(&metrics), 0.0);

        let stopped_at = Instant::now();
        tx.send(true).expect("subscriber alive");
        task.await.expect("subscriber exits");

        assert_eq!(not_found(&metrics), 1.0);
        assert_about(stopped_at.elapsed(), Duration::from_secs(29));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_observed_while_every_worker_is_busy() {
        let metrics = Metrics::new().expect("metrics");
        let store = Arc::new(SlowStore {
            delay: Duration::from_secs(60),
        });
        let workers = Workers::new(pipeline_with(store, metrics.clone()), 1);
        let (tx, stop) = watch::channel(false);

        let task = tokio::spawn(run_source(
            || async {
                Ok::<_, SnapError>(
                    stream::iter(vec![snapshot(1), snapshot(2)]).chain(stream::pending()),
                )
            },
            workers,
            stop,
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let stopped_at = Instant::now();
        tx.send(true).expect("subscriber alive");
        task.await.expect("subscriber exits");

        // The second snapshot never got a worker.
        assert_eq!(not_found(&metrics), 1.0);
        assert_about(stopped_at.elapsed(), Duration::from_secs(59));
    }
}
