//! Bounded fire-and-forget delivery queue.
//!
//! `publish` never blocks and never fails: when the queue is full the newest
//! envelope is dropped and counted. A single background worker drains the
//! queue into every sink; sink failures are logged and counted, never
//! propagated.

use crate::protocol::TelemetryEnvelope;
use crate::sink::TelemetrySink;
use brinst_common::events::{EventSink, InstallEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Minimum channel capacity.
const MIN_CAPACITY: usize = 8;

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub enqueued: u64,
    /// Rejected because the queue was full or closed.
    pub dropped: u64,
    /// Envelopes accepted by at least one sink.
    pub delivered: u64,
    /// Individual sink sends that failed.
    pub failed: u64,
}

impl Counters {
    fn snapshot(&self) -> TelemetryStats {
        TelemetryStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Producer side; implements [`EventSink`].
#[derive(Clone)]
pub struct TelemetryQueue {
    tx: mpsc::Sender<TelemetryEnvelope>,
    host: Arc<str>,
    counters: Arc<Counters>,
}

/// Consumer side. Call [`TelemetryWorker::shutdown`] before exit to flush.
pub struct TelemetryWorker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    counters: Arc<Counters>,
}

impl TelemetryQueue {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(
        capacity: usize,
        host: impl Into<String>,
        sinks: Vec<Arc<dyn TelemetrySink>>,
    ) -> (Self, TelemetryWorker) {
        let host: String = host.into();
        let (tx, rx) = mpsc::channel(capacity.max(MIN_CAPACITY));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let handle = tokio::spawn(run_worker(rx, shutdown_rx, sinks, counters.clone()));

        (
            Self {
                tx,
                host: Arc::from(host),
                counters: counters.clone(),
            },
            TelemetryWorker {
                handle,
                shutdown: shutdown_tx,
                counters,
            },
        )
    }

    /// Enqueue an envelope. Returns false if it was dropped.
    pub fn enqueue(&self, envelope: TelemetryEnvelope) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(kind = envelope.kind(), "Telemetry queue full, dropping newest event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(kind = envelope.kind(), "Telemetry worker stopped, dropping event");
                false
            }
        }
    }

    pub fn stats(&self) -> TelemetryStats {
        self.counters.snapshot()
    }
}

impl EventSink for TelemetryQueue {
    fn publish(&self, event: InstallEvent) {
        self.enqueue(TelemetryEnvelope::new(self.host.as_ref(), event));
    }
}

impl TelemetryWorker {
    pub fn stats(&self) -> TelemetryStats {
        self.counters.snapshot()
    }

    /// Deliver what is already queued, waiting at most `grace`, then stop.
    pub async fn shutdown(self, grace: Duration) -> TelemetryStats {
        let _ = self.shutdown.send(true);
        let mut handle = self.handle;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Telemetry worker ended abnormally"),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Telemetry flush timed out, abandoning queue");
                handle.abort();
            }
        }
        self.counters.snapshot()
    }
}

async fn deliver(sinks: &[Arc<dyn TelemetrySink>], envelope: &TelemetryEnvelope, counters: &Counters) {
    let mut accepted = false;
    for sink in sinks {
        match sink.send(envelope).await {
            Ok(()) => accepted = true,
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!(sink = sink.name(), kind = envelope.kind(), error = %e, "Telemetry send failed");
            }
        }
    }
    if accepted {
        counters.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<TelemetryEnvelope>,
    mut shutdown: watch::Receiver<bool>,
    sinks: Vec<Arc<dyn TelemetrySink>>,
    counters: Arc<Counters>,
) {
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(envelope) => deliver(&sinks, &envelope, &counters).await,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Drain whatever was queued before shutdown.
    rx.close();
    while let Some(envelope) = rx.recv().await {
        deliver(&sinks, &envelope, &counters).await;
    }
    debug!(stats = ?counters.snapshot(), "Telemetry worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use uuid::Uuid;

    fn progress(percent: u8) -> InstallEvent {
        InstallEvent::Progress {
            installation_id: Uuid::nil(),
            step: "step".into(),
            index: 0,
            total: 1,
            percent,
        }
    }

    #[tokio::test]
    async fn test_delivers_to_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let (queue, worker) = TelemetryQueue::spawn(16, "host", vec![a.clone(), b.clone()]);

        queue.publish(progress(10));
        queue.publish(progress(20));
        let stats = worker.shutdown(Duration::from_secs(5)).await;

        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.delivered, 2);
        assert_eq!(a.received().len(), 2);
        assert_eq!(b.received().len(), 2);
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted_not_raised() {
        let good = Arc::new(MemorySink::new());
        let (queue, worker) = TelemetryQueue::spawn(
            16,
            "host",
            vec![Arc::new(MemorySink::failing()), good.clone()],
        );
        queue.publish(progress(50));
        let stats = worker.shutdown(Duration::from_secs(5)).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(good.received().len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops_newest() {
        let sink = Arc::new(MemorySink::new());
        let (queue, worker) = TelemetryQueue::spawn(MIN_CAPACITY, "host", vec![sink.clone()]);

        // The worker cannot run until this task yields.
        for i in 0..(MIN_CAPACITY as u8 + 5) {
            queue.publish(progress(i));
        }
        assert_eq!(queue.stats().dropped, 5);

        worker.shutdown(Duration::from_secs(5)).await;
        let received: Vec<u8> = sink
            .received()
            .iter()
            .filter_map(|e| match &e.event {
                InstallEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(received, (0..MIN_CAPACITY as u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_dropped() {
        let (queue, worker) = TelemetryQueue::spawn(8, "host", vec![]);
        worker.shutdown(Duration::from_secs(1)).await;
        assert!(!queue.enqueue(TelemetryEnvelope::new("host", progress(1))));
        assert_eq!(queue.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_slow_sink_abandoned_after_grace() {
        let (queue, worker) = TelemetryQueue::spawn(
            8,
            "host",
            vec![Arc::new(MemorySink::slow(Duration::from_secs(30)))],
        );
        queue.publish(progress(1));
        let started = std::time::Instant::now();
        let stats = worker.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stats.delivered, 0);
    }
}
