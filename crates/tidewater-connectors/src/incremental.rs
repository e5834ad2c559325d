//! Incremental (change-log) dumper.
//!
//! Runs after the inventory phase of a job item and forwards change
//! events from a [`LogEventSource`] into the same channel shape:
//!
//! ```text
//!   LogEventSource::poll(max) ──► Some(events) ──► channel
//!            │                    Some([])     ──► sleep(idle)
//!            └──────────────────► None         ──► Record::Finished
//! ```
//!
//! Events carry their own [`IngestPosition::Log`] positions; events that
//! arrive without one are stamped with the last known position so the
//! committed position never regresses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use tidewater_core::channel::RecordSender;
use tidewater_core::error::{IngestError, SourceError};
use tidewater_core::position::IngestPosition;
use tidewater_core::record::{DataRecord, Record};

use crate::lifecycle::Lifecycle;

/// Default maximum events per poll.
pub const DEFAULT_POLL_MAX_RECORDS: usize = 500;

/// Default sleep when the log has nothing new.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// A source of change events (binlog, WAL, ...).
#[async_trait]
pub trait LogEventSource: Send {
    /// Returns up to `max` events.
    ///
    /// An empty batch means the log is idle; `None` means it has ended.
    ///
    /// # Errors
    ///
    /// Returns a `SourceError` if the log cannot be read.
    async fn poll(&mut self, max: usize) -> Result<Option<Vec<DataRecord>>, SourceError>;
}

/// Incremental dumper configuration for one job item.
#[derive(Debug, Clone)]
pub struct IncrementalDumperConfig {
    /// Log position to start from.
    pub position: IngestPosition,
    /// Maximum events per poll.
    pub poll_max_records: usize,
    /// Sleep between polls while the log is idle.
    pub idle_interval: Duration,
}

impl IncrementalDumperConfig {
    /// Creates a configuration starting at `position` with defaults.
    #[must_use]
    pub fn new(position: IngestPosition) -> Self {
        Self {
            position,
            poll_max_records: DEFAULT_POLL_MAX_RECORDS,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }
}

/// Forwards change events for one job item.
pub struct IncrementalDumper {
    config: IncrementalDumperConfig,
    source: Box<dyn LogEventSource>,
    channel: RecordSender,
    lifecycle: Arc<Lifecycle>,
    position_tx: watch::Sender<IngestPosition>,
}

impl IncrementalDumper {
    /// Creates a dumper.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::UnsupportedConfiguration` unless the position
    /// is a log position.
    pub fn new(
        config: IncrementalDumperConfig,
        source: Box<dyn LogEventSource>,
        channel: RecordSender,
    ) -> Result<Self, IngestError> {
        if !matches!(config.position, IngestPosition::Log(_)) {
            return Err(IngestError::UnsupportedConfiguration(format!(
                "incremental dump needs a log position, got {}",
                config.position
            )));
        }
        let (position_tx, _) = watch::channel(config.position.clone());
        Ok(Self {
            config,
            source,
            channel,
            lifecycle: Arc::new(Lifecycle::new()),
            position_tx,
        })
    }

    /// Shares an externally owned lifecycle.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Arc<Lifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// The lifecycle controlling this dumper.
    #[must_use]
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Watches the position of the last pushed event.
    #[must_use]
    pub fn subscribe_position(&self) -> watch::Receiver<IngestPosition> {
        self.position_tx.subscribe()
    }

    /// Forwards events until the log ends, a stop is requested, or the
    /// source fails. Returns the last pushed position.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Incremental` if the source fails; the
    /// sentinel is pushed first.
    pub async fn run(mut self) -> Result<IngestPosition, IngestError> {
        let mut position = self.config.position.clone();
        if !self.lifecycle.start() {
            self.lifecycle.mark_stopped();
            return Ok(position);
        }
        tracing::info!(position = %position, "Incremental dump started");
        let mut forwarded: u64 = 0;
        loop {
            if !self.lifecycle.is_running() {
                tracing::info!(position = %position, events = forwarded, "Incremental dump stopped");
                self.lifecycle.mark_stopped();
                return Ok(position);
            }
            match self.source.poll(self.config.poll_max_records).await {
                Ok(None) => {
                    self.channel.push(Record::Finished).await?;
                    self.lifecycle.mark_finished();
                    tracing::info!(position = %position, events = forwarded, "Change log ended");
                    return Ok(position);
                }
                Ok(Some(events)) if events.is_empty() => {
                    tokio::time::sleep(self.config.idle_interval).await;
                }
                Ok(Some(events)) => {
                    let mut records = Vec::with_capacity(events.len());
                    for mut event in events {
                        if matches!(event.position, IngestPosition::Log(_)) {
                            position = event.position.clone();
                        } else {
                            event.position = position.clone();
                        }
                        records.push(Record::Data(event));
                    }
                    forwarded += records.len() as u64;
                    self.channel.push_batch(records).await?;
                    self.position_tx.send_replace(position.clone());
                }
                Err(e) => {
                    tracing::error!(position = %position, error = %e, "Incremental dump failed");
                    if let Err(push_err) = self.channel.push(Record::Finished).await {
                        tracing::debug!(error = %push_err, "Could not push sentinel after failure");
                    }
                    self.lifecycle.mark_stopped();
                    return Err(IngestError::Incremental {
                        position: position.to_string(),
                        source: e,
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for IncrementalDumper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalDumper")
            .field("config", &self.config)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewater_core::channel::create_channel;
    use tidewater_core::position::LogPosition;
    use tidewater_core::record::RecordKind;

    use crate::lifecycle::LifecycleState;
    use crate::testing::MemoryLogSource;

    fn log(marker: &str) -> IngestPosition {
        IngestPosition::Log(LogPosition::new(marker))
    }

    fn event(kind: RecordKind, marker: Option<&str>) -> DataRecord {
        DataRecord::new(kind, "orders", marker.map_or(IngestPosition::Placeholder, log))
    }

    #[tokio::test]
    async fn test_forwards_until_log_ends() {
        let (source, writer) = MemoryLogSource::channel();
        writer.append(event(RecordKind::Insert, Some("0/10")));
        writer.append(event(RecordKind::Update, None));
        writer.append(event(RecordKind::Delete, Some("0/30")));
        drop(writer);
        let (tx, mut rx) = create_channel(16, None);
        let dumper = IncrementalDumper::new(IncrementalDumperConfig::new(log("0/0")), Box::new(source), tx).unwrap();
        let lifecycle = dumper.lifecycle();
        assert_eq!(dumper.run().await.unwrap(), log("0/30"));
        assert_eq!(lifecycle.state(), LifecycleState::Finished);

        let records = rx.fetch(10, Duration::from_millis(10)).await;
        assert_eq!(records.len(), 4);
        assert_eq!(records[1].position(), &log("0/10"));
        assert!(records[3].is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_then_stop() {
        let (source, writer) = MemoryLogSource::channel();
        let (tx, _rx) = create_channel(16, None);
        let mut config = IncrementalDumperConfig::new(log("binlog.000001:4"));
        config.idle_interval = Duration::from_millis(50);
        let dumper = IncrementalDumper::new(config, Box::new(source), tx).unwrap();
        let lifecycle = dumper.lifecycle();
        let task = tokio::spawn(dumper.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        lifecycle.stop();
        assert_eq!(task.await.unwrap().unwrap(), log("binlog.000001:4"));
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        drop(writer);
    }

    #[tokio::test]
    async fn test_failure_pushes_sentinel() {
        let (source, writer) = MemoryLogSource::channel();
        writer.append(event(RecordKind::Insert, Some("0/10")));
        writer.fail("connection reset");
        let (tx, mut rx) = create_channel(16, None);
        let dumper = IncrementalDumper::new(IncrementalDumperConfig::new(log("0/0")), Box::new(source), tx).unwrap();
        let err = dumper.run().await.unwrap_err();
        assert!(matches!(err, IngestError::Incremental { ref position, .. } if position == "log,0/10"));
        let records = rx.fetch(10, Duration::from_millis(10)).await;
        assert_eq!(records.len(), 2);
        assert!(records[1].is_finished());
        drop(writer);
    }

    #[test]
    fn test_rejects_non_log_position() {
        let (source, _writer) = MemoryLogSource::channel();
        let (tx, _rx) = create_channel(1, None);
        let err = IncrementalDumper::new(
            IncrementalDumperConfig::new(IngestPosition::Finished),
            Box::new(source),
            tx,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedConfiguration(_)));
    }
}
