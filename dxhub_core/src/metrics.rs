//! Per-process diagnostics (§5 "Background maintenance threads"): cache-
//! aligned atomic counters updated inline on the hot path, with periodic
//! snapshot persistence offloaded to a background thread so the hot path
//! never blocks on I/O.

use crossbeam::utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;

/// Counters maintained by Producer, Consumer, and Messenger. Each field is
/// cache-line padded so hot-path increments from different services never
/// false-share a line.
#[derive(Default)]
pub struct MetricsCounters {
    messages_sent: CachePadded<AtomicU64>,
    messages_received: CachePadded<AtomicU64>,
    checksum_failures: CachePadded<AtomicU64>,
    discovery_retries: CachePadded<AtomicU64>,
}

/// A point-in-time copy of a [`MetricsCounters`], handed to the background
/// sink for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub checksum_failures: u64,
    pub discovery_retries: u64,
}

impl MetricsCounters {
    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovery_retry(&self) {
        self.discovery_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            discovery_retries: self.discovery_retries.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable handle used by hot-path threads to hand a labeled snapshot to
/// the background persister. Cheap to clone (one `SyncSender` clone) so each
/// service thread that needs to publish can hold its own copy.
#[derive(Clone)]
pub struct MetricsPublisher {
    tx: SyncSender<(&'static str, MetricsSnapshot)>,
}

impl MetricsPublisher {
    /// Enqueue `snapshot` for persistence. Never blocks; drops the snapshot
    /// if the queue is full or the worker has already exited.
    pub fn publish(&self, label: &'static str, snapshot: MetricsSnapshot) {
        match self.tx.try_send((label, snapshot)) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Background persister for metrics snapshots. Owned by the service (one per
/// `Producer`/`Consumer`/`Messenger`); joins its worker thread on drop.
pub struct MetricsSink {
    tx: Option<SyncSender<(&'static str, MetricsSnapshot)>>,
    worker: Option<JoinHandle<()>>,
}

impl MetricsSink {
    /// Spawns the background worker and returns the sink (hold it for the
    /// worker's lifetime) plus a publisher handle to clone into hot-path
    /// threads.
    pub fn spawn() -> (Self, MetricsPublisher) {
        let (tx, rx) = sync_channel(64);
        let worker = std::thread::Builder::new()
            .name("dxhub-metrics".into())
            .spawn(move || Self::run(rx))
            .ok();
        let publisher = MetricsPublisher { tx: tx.clone() };
        (MetricsSink { tx: Some(tx), worker }, publisher)
    }

    fn run(rx: Receiver<(&'static str, MetricsSnapshot)>) {
        while let Ok((label, snapshot)) = rx.recv() {
            log::debug!(
                "dxhub: {label} metrics sent={} received={} checksum_failures={} discovery_retries={}",
                snapshot.messages_sent,
                snapshot.messages_received,
                snapshot.checksum_failures,
                snapshot.discovery_retries
            );
        }
    }
}

impl Drop for MetricsSink {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let counters = MetricsCounters::default();
        counters.record_message_sent();
        counters.record_message_sent();
        counters.record_message_received();
        counters.record_checksum_failure();
        counters.record_discovery_retry();
        counters.record_discovery_retry();
        counters.record_discovery_retry();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.checksum_failures, 1);
        assert_eq!(snapshot.discovery_retries, 3);
    }

    #[test]
    fn sink_never_blocks_the_publishing_thread() {
        let (sink, publisher) = MetricsSink::spawn();
        for _ in 0..200 {
            publisher.publish("test", MetricsSnapshot::default());
        }
        drop(sink);
    }
}
