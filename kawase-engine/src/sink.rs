//! Event journal and the sink boundary towards external persistence.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use kawase_core::{EventPayload, EventRecord};

/// Failures surfaced by a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink buffer is full; the record was not accepted.
    #[error("sink buffer exhausted")]
    Overflow,
    /// The sink consumer is gone.
    #[error("sink closed")]
    Closed,
}

/// Receives ordered event records for external persistence.
///
/// `emit` must not block the engine loop; sinks that need slow I/O should
/// buffer internally and drain on their own task.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: &EventRecord) -> Result<(), SinkError>;
}

/// Unbounded in-memory sink used by tests and backtests.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<EventRecord>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().expect("memory sink poisoned").clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, record: &EventRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .expect("memory sink poisoned")
            .push(record.clone());
        Ok(())
    }
}

/// Bounded-channel sink handing records to a drain task.
pub struct ChannelSink {
    tx: mpsc::Sender<EventRecord>,
}

impl ChannelSink {
    /// Create the sink plus the receiving end for the drain task.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EventRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, record: &EventRecord) -> Result<(), SinkError> {
        self.tx.try_send(record.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SinkError::Overflow,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Assigns global sequence numbers and guarantees records are never dropped:
/// on backpressure they queue in an internal backlog while the engine runs
/// degraded.
pub struct EventJournal {
    sink: Box<dyn EventSink>,
    next_seq: u64,
    backlog: VecDeque<EventRecord>,
}

impl EventJournal {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            sink,
            next_seq: 0,
            backlog: VecDeque::new(),
        }
    }

    /// Sequence number the next record will carry.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    #[must_use]
    pub fn is_backlogged(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Record an event. Returns `Err(Overflow)` when the sink refused it and
    /// the record went to the backlog instead; ordering is preserved because
    /// new records queue behind the backlog.
    pub fn record(&mut self, at: DateTime<Utc>, payload: EventPayload) -> Result<u64, SinkError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let record = EventRecord { seq, at, payload };
        self.flush_backlog();
        if self.backlog.is_empty() {
            match self.sink.emit(&record) {
                Ok(()) => return Ok(seq),
                Err(SinkError::Closed) => return Err(SinkError::Closed),
                Err(SinkError::Overflow) => {}
            }
        }
        warn!(seq, "sink backpressure; queuing event record");
        self.backlog.push_back(record);
        Err(SinkError::Overflow)
    }

    /// Try to re-emit queued records; returns true when the backlog cleared.
    pub fn flush_backlog(&mut self) -> bool {
        while let Some(record) = self.backlog.front() {
            match self.sink.emit(record) {
                Ok(()) => {
                    self.backlog.pop_front();
                }
                Err(_) => return false,
            }
        }
        true
    }
}
