//! Handle bookkeeping shared by engine implementations.
//!
//! Each generation gets a bounded channel: the producer side pushes deltas,
//! the consumer side is handed out exactly once through `take_stream`. The
//! channel bound is where backpressure from a slow HTTP client reaches the
//! engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{DeltaStream, GenerationHandle, TokenDelta};
use crate::error::{Error, Result};

/// Table ids start at 1; 0 marks handles made outside any table.
static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

struct Entry {
    receiver: Option<mpsc::Receiver<TokenDelta>>,
    cancel: CancellationToken,
    producer_done: bool,
}

/// In-flight generations keyed by handle.
pub struct InflightTable {
    id: u64,
    next_seq: AtomicU64,
    entries: Mutex<HashMap<GenerationHandle, Entry>>,
    capacity: usize,
}

impl InflightTable {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            next_seq: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        })
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<GenerationHandle, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new generation and return its producer side.
    pub fn open(self: &Arc<Self>) -> Producer {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let handle = GenerationHandle::issued(self.id, seq);
        let (tx, rx) = mpsc::channel(self.capacity);
        let cancel = CancellationToken::new();

        self.entries().insert(
            handle.clone(),
            Entry {
                receiver: Some(rx),
                cancel: cancel.clone(),
                producer_done: false,
            },
        );

        Producer {
            handle,
            tx,
            cancel,
            table: Arc::clone(self),
        }
    }

    /// Whether `handle` was opened by this table, finished or not.
    fn issued(&self, handle: &GenerationHandle) -> bool {
        handle.origin() == self.id && handle.seq() < self.next_seq.load(Ordering::SeqCst)
    }

    /// Hand out the delta stream for `handle`. Works once per handle.
    ///
    /// Entries only leave the table after their stream was taken, so an
    /// issued handle without an entry has been consumed already.
    pub fn take_stream(&self, handle: &GenerationHandle) -> Result<DeltaStream> {
        let mut entries = self.entries();
        let entry = match entries.get_mut(handle) {
            Some(entry) => entry,
            None if self.issued(handle) => {
                return Err(Error::StreamAlreadyConsumed(handle.to_string()))
            }
            None => {
                return Err(Error::Internal(format!("unknown generation handle {}", handle)))
            }
        };

        let receiver = entry
            .receiver
            .take()
            .ok_or_else(|| Error::StreamAlreadyConsumed(handle.to_string()))?;

        if entry.producer_done {
            entries.remove(handle);
        }

        Ok(ReceiverStream::new(receiver).boxed())
    }

    /// Signal the producer for `handle` to stop. Unknown or finished handles
    /// are ignored.
    pub fn cancel(&self, handle: &GenerationHandle) {
        if let Some(entry) = self.entries().get(handle) {
            entry.cancel.cancel();
        }
    }

    fn finish(&self, handle: &GenerationHandle) {
        let mut entries = self.entries();
        let consumed = match entries.get_mut(handle) {
            Some(entry) => {
                entry.producer_done = true;
                entry.receiver.is_none()
            }
            None => return,
        };
        if consumed {
            entries.remove(handle);
        }
    }

    /// Number of tracked generations.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Producer side of one generation. Dropping it closes the stream.
pub struct Producer {
    handle: GenerationHandle,
    tx: mpsc::Sender<TokenDelta>,
    cancel: CancellationToken,
    table: Arc<InflightTable>,
}

impl Producer {
    pub fn handle(&self) -> &GenerationHandle {
        &self.handle
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Push a delta, waiting for channel space. Returns `false` once the
    /// generation was cancelled or the consumer went away.
    pub async fn send(&self, delta: TokenDelta) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(delta) => sent.is_ok(),
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.table.finish(&self.handle);
    }
}
