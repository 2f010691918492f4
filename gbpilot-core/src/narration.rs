//! Commentary side channel.
//!
//! The control loop pushes [`NarrationEvent`]s into a bounded queue with a
//! non-blocking put; a dedicated task drains it into a [`Narrator`]. When
//! the queue is full the event is dropped and counted. The control loop
//! never waits on commentary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NARRATION_QUEUE_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrationKind {
    Status,
    Decision,
    Failure,
    Fallback,
    MapChange,
}

#[derive(Debug, Clone, Serialize)]
pub struct NarrationEvent {
    pub kind: NarrationKind,
    pub text: String,
    pub timestamp: SystemTime,
}

impl NarrationEvent {
    pub fn new(kind: NarrationKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            timestamp: SystemTime::now(),
        }
    }
}

/// Consumer of narration events.
#[async_trait]
pub trait Narrator: Send {
    async fn narrate(&mut self, event: NarrationEvent);
}

/// Writes events to the `narration` tracing target.
#[derive(Debug, Default)]
pub struct LogNarrator;

#[async_trait]
impl Narrator for LogNarrator {
    async fn narrate(&mut self, event: NarrationEvent) {
        info!(target: "narration", kind = ?event.kind, "{}", event.text);
    }
}

// ── Queue ────────────────────────────────────────────────────────

/// Producer side of the narration queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct NarrationQueue {
    tx: mpsc::Sender<NarrationEvent>,
    dropped: Arc<AtomicU64>,
}

impl NarrationQueue {
    /// A queue and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<NarrationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue without waiting. Returns whether the event was accepted.
    pub fn push(&self, event: NarrationEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(kind = ?event.kind, dropped, "narration queue full; event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("narration queue closed");
                false
            }
        }
    }

    pub fn say(&self, kind: NarrationKind, text: impl Into<String>) -> bool {
        self.push(NarrationEvent::new(kind, text))
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawn the narrator task. It runs until `cancel` fires or every
/// producer is gone.
pub fn spawn_narrator<N>(mut narrator: N, capacity: usize, cancel: CancellationToken) -> (NarrationQueue, JoinHandle<()>)
where
    N: Narrator + 'static,
{
    let (queue, mut rx) = NarrationQueue::channel(capacity);
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => narrator.narrate(event).await,
                    None => break,
                },
            }
        }
        debug!("narrator stopped");
    });
    (queue, handle)
}

/// Wait for the narrator task, giving up after `timeout`.
pub async fn join_narrator(handle: JoinHandle<()>, timeout: Duration) {
    let abort = handle.abort_handle();
    if tokio::time::timeout(timeout, handle).await.is_err() {
        warn!(?timeout, "narrator did not stop in time; aborting");
        abort.abort();
    }
}

// ── Tests ────────────────────────────────────────────────────────
