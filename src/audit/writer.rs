//! Bounded-queue background audit writer (§4.8, §5).
//!
//! Directly adapts `weavegraph`'s `EventBus::SinkEntry::spawn_worker`
//! graceful-shutdown pattern: a `oneshot` shutdown signal raced via
//! `tokio::select!` against the channel receiver, so a pending shutdown
//! always wins over a newly-arrived item once requested, while items
//! already in flight are drained first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::entry::AuditEntry;
use super::store::AuditStore;
use crate::errors::DecisionError;

#[derive(Debug, Clone, Copy)]
pub enum OverflowPolicy {
    SyncFallback,
    DropWithCounter,
}

#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub queue_capacity: usize,
    pub submit_timeout: Duration,
    pub overflow_policy: OverflowPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            submit_timeout: Duration::from_millis(50),
            overflow_policy: OverflowPolicy::SyncFallback,
        }
    }
}

#[derive(Debug, Default)]
pub struct WriterMetrics {
    pub sync_fallback_count: AtomicU64,
    pub dropped_count: AtomicU64,
}

enum Submission {
    Entry(AuditEntry),
}

/// Owns the bounded queue and the single background worker. Dropping or
/// calling `shutdown` drains remaining items synchronously before the
/// worker task exits; after shutdown, `submit` writes inline.
pub struct AuditLedger {
    store: Arc<dyn AuditStore>,
    sender: Option<flume::Sender<Submission>>,
    shutdown: tokio::sync::Mutex<Option<oneshot::Sender<()>>>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    config: WriterConfig,
    metrics: Arc<WriterMetrics>,
    shut_down: std::sync::atomic::AtomicBool,
}

impl AuditLedger {
    pub fn start(store: Arc<dyn AuditStore>, config: WriterConfig) -> Arc<Self> {
        let (tx, rx) = flume::bounded::<Submission>(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let metrics = Arc::new(WriterMetrics::default());

        let worker_store = store.clone();
        let handle = tokio::spawn(Self::run_worker(worker_store, rx, shutdown_rx));

        Arc::new(Self {
            store,
            sender: Some(tx),
            shutdown: tokio::sync::Mutex::new(Some(shutdown_tx)),
            handle: tokio::sync::Mutex::new(Some(handle)),
            config,
            metrics,
            shut_down: std::sync::atomic::AtomicBool::new(false),
        })
    }

    async fn run_worker(store: Arc<dyn AuditStore>, rx: flume::Receiver<Submission>, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    while let Ok(Submission::Entry(entry)) = rx.try_recv() {
                        if let Err(err) = store.append(entry).await {
                            tracing::error!(error = %err, "audit drain write failed during shutdown");
                        }
                    }
                    return;
                }
                received = rx.recv_async() => {
                    match received {
                        Ok(Submission::Entry(entry)) => {
                            if let Err(err) = store.append(entry).await {
                                tracing::error!(error = %err, "audit write failed");
                            }
                        }
                        Err(_) => return,
                    }
                }
            }
        }
    }

    pub fn metrics(&self) -> &WriterMetrics {
        &self.metrics
    }

    /// Submits an entry for durable append and returns its `entry_id`. On
    /// queue-full, blocks up to `submit_timeout` before falling back per
    /// `overflow_policy`. When the entry is only queued (the common case),
    /// the returned id is the caller-assigned one; `entry_hash`/
    /// `previous_hash` are filled in later by the background worker and are
    /// not available synchronously.
    pub async fn submit(&self, entry: AuditEntry) -> Result<String, DecisionError> {
        let Some(sender) = &self.sender else {
            return self.store.append(entry).await.map(|appended| appended.entry_id);
        };

        let entry_id = entry.entry_id.clone();
        match sender.try_send(Submission::Entry(entry.clone())) {
            Ok(()) => Ok(entry_id),
            Err(flume::TrySendError::Full(_)) => {
                let timed_out = tokio::time::timeout(self.config.submit_timeout, sender.send_async(Submission::Entry(entry.clone())))
                    .await
                    .is_err();
                if !timed_out {
                    return Ok(entry_id);
                }
                match self.config.overflow_policy {
                    OverflowPolicy::SyncFallback => {
                        self.metrics.sync_fallback_count.fetch_add(1, Ordering::Relaxed);
                        self.store.append(entry).await.map(|appended| appended.entry_id)
                    }
                    OverflowPolicy::DropWithCounter => {
                        self.metrics.dropped_count.fetch_add(1, Ordering::Relaxed);
                        Err(DecisionError::Audit("audit queue full, entry dropped".to_string()))
                    }
                }
            }
            Err(flume::TrySendError::Disconnected(_)) => self.store.append(entry).await.map(|appended| appended.entry_id),
        }
    }

    /// Drains the queue within a bounded deadline, then marks the ledger
    /// shut down; subsequent `submit` calls write synchronously inline.
    pub async fn shutdown(&self, deadline: Duration) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = tokio::time::timeout(deadline, handle).await;
        }
    }
}
