//! Bounded record channel between a dumper and its importer.
//!
//! ```text
//!   dumper ──push──► [ mpsc (capacity N) ] ──fetch──► importer
//!                                                        │
//!   progress ◄──────────── AckCallback ◄────── ack ──────┘
//! ```
//!
//! `push` awaits when the channel is full, which is the only backpressure
//! point between producer and consumer. The channel never inspects
//! records; data records and the phase sentinel share one FIFO.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::IngestError;
use crate::record::Record;

/// Called with each batch of records the consumer acknowledges.
pub type AckCallback = Arc<dyn Fn(&[Record]) + Send + Sync>;

/// Creates a bounded channel holding at most `capacity` records.
///
/// A capacity of zero is treated as one.
#[must_use]
pub fn create_channel(
    capacity: usize,
    on_ack: Option<AckCallback>,
) -> (RecordSender, RecordReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let metrics = Arc::new(ChannelMetrics::default());
    (
        RecordSender {
            tx,
            metrics: Arc::clone(&metrics),
        },
        RecordReceiver {
            rx,
            on_ack,
            metrics,
        },
    )
}

/// Producer half. Cheap to clone.
#[derive(Clone)]
pub struct RecordSender {
    tx: mpsc::Sender<Record>,
    metrics: Arc<ChannelMetrics>,
}

impl RecordSender {
    /// Pushes one record, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::ChannelClosed` if the receiver was dropped.
    pub async fn push(&self, record: Record) -> Result<(), IngestError> {
        self.tx
            .send(record)
            .await
            .map_err(|_| IngestError::ChannelClosed)?;
        self.metrics.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pushes records in order.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::ChannelClosed` if the receiver was dropped.
    pub async fn push_batch(&self, records: Vec<Record>) -> Result<(), IngestError> {
        for record in records {
            self.push(record).await?;
        }
        Ok(())
    }

    /// Free slots right now.
    #[must_use]
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    /// Returns `true` once the receiver is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Shared channel metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<ChannelMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl fmt::Debug for RecordSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSender")
            .field("available", &self.tx.capacity())
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

/// Consumer half.
pub struct RecordReceiver {
    rx: mpsc::Receiver<Record>,
    on_ack: Option<AckCallback>,
    metrics: Arc<ChannelMetrics>,
}

impl RecordReceiver {
    /// Receives the next record, or `None` once every sender is gone and
    /// the channel is drained.
    pub async fn recv(&mut self) -> Option<Record> {
        let record = self.rx.recv().await;
        if record.is_some() {
            self.metrics.fetched.fetch_add(1, Ordering::Relaxed);
        }
        record
    }

    /// Receives up to `max` records, waiting at most `timeout` in total.
    ///
    /// Returns early when `max` records arrived or the channel closed.
    /// An empty result means nothing arrived in time.
    pub async fn fetch(&mut self, max: usize, timeout: Duration) -> Vec<Record> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut records = Vec::with_capacity(max.min(1024));
        while records.len() < max {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) | Err(_) => break,
            }
        }
        self.metrics
            .fetched
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        records
    }

    /// Acknowledges records the consumer has durably applied.
    pub fn ack(&self, records: &[Record]) {
        if records.is_empty() {
            return;
        }
        self.metrics
            .acked
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        if let Some(callback) = &self.on_ack {
            callback(records);
        }
    }

    /// Shared channel metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<ChannelMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl fmt::Debug for RecordReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordReceiver")
            .field("has_ack_callback", &self.on_ack.is_some())
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

/// Lock-free channel counters.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    /// Records pushed by the producer.
    pub pushed: AtomicU64,
    /// Records handed to the consumer.
    pub fetched: AtomicU64,
    /// Records acknowledged by the consumer.
    pub acked: AtomicU64,
}

impl ChannelMetrics {
    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> ChannelMetricsSnapshot {
        ChannelMetricsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of channel counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMetricsSnapshot {
    /// Records pushed.
    pub pushed: u64,
    /// Records fetched.
    pub fetched: u64,
    /// Records acknowledged.
    pub acked: u64,
}
