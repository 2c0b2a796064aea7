//! Pending-Request Table
//!
//! Maps correlation ids to the callers waiting on them.
//!
//! ## Entry Lifecycle
//! ```text
//!   register ──► pending ──► dispatch(intermediate)* ──► dispatch(terminal) ──► removed
//!                   │
//!                   ├──► timeout_sweep  (RequestTimeout)  ──► removed
//!                   ├──► abandon        (Abandoned)       ──► removed
//!                   └──► drain          (reason)          ──► removed
//! ```
//! Every entry is resolved exactly once; nothing is delivered for an id
//! after its terminal event.

use std::collections::HashMap;
use std::time::Instant;

use crossbeam::channel::Sender;

use crate::error::{AtlasError, Result};
use crate::protocol::{Envelope, MessageId, OpCode};

/// Where responses for one request go
#[derive(Debug)]
pub enum ResultSink {
    /// Resolves exactly once with the first matching envelope
    Single(Sender<Result<Envelope>>),

    /// Receives intermediate envelopes in arrival order, then one terminal item
    Streaming(Sender<Result<Envelope>>),
}

impl ResultSink {
    /// Resolve with an error without ever having been registered
    pub fn fail(self, error: AtlasError) {
        self.send(Err(error));
    }

    fn send(&self, item: Result<Envelope>) {
        let sender = match self {
            ResultSink::Single(sender) | ResultSink::Streaming(sender) => sender,
        };
        // The caller may have stopped listening; its loss.
        let _ = sender.send(item);
    }
}

/// Bookkeeping for one outstanding request
#[derive(Debug)]
pub struct PendingEntry {
    pub id: MessageId,
    pub op: OpCode,
    pub created_at: Instant,
    pub deadline: Option<Instant>,
    sink: ResultSink,
}

/// What happened to a dispatched envelope
#[derive(Debug)]
pub enum Dispatch {
    /// Forwarded; the entry stays pending
    Delivered,

    /// Forwarded as the terminal event; the entry is gone
    Completed,

    /// No entry for this id
    Unsolicited(Envelope),
}

/// Outstanding requests of one connection
#[derive(Debug)]
pub struct PendingTable {
    entries: HashMap<MessageId, PendingEntry>,
    next_id: u32,
    max_id: u32,
    closed: bool,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::with_id_space(u32::MAX)
    }

    /// Limit ids to `1..=max_id`
    pub fn with_id_space(max_id: u32) -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
            max_id: max_id.max(1),
            closed: false,
        }
    }

    /// Allocate an unused id and start tracking a request
    pub fn register(
        &mut self,
        op: OpCode,
        sink: ResultSink,
        deadline: Option<Instant>,
    ) -> Result<MessageId> {
        if self.closed {
            return Err(AtlasError::ConnectionClosed);
        }
        let id = self.allocate_id()?;
        self.entries.insert(
            id,
            PendingEntry {
                id,
                op,
                created_at: Instant::now(),
                deadline,
                sink,
            },
        );
        Ok(id)
    }

    /// Allocate an id for a message that expects no response
    pub fn allocate_oneway(&mut self) -> Result<MessageId> {
        if self.closed {
            return Err(AtlasError::ConnectionClosed);
        }
        self.allocate_id()
    }

    /// Drop an entry without resolving it (the caller reports the failure)
    pub fn forget(&mut self, id: MessageId) -> bool {
        self.take(id).is_some()
    }

    /// Remove an entry unresolved and hand its sink back
    pub fn take(&mut self, id: MessageId) -> Option<ResultSink> {
        self.entries.remove(&id).map(|entry| entry.sink)
    }

    fn allocate_id(&mut self) -> Result<MessageId> {
        if self.entries.len() >= self.max_id as usize {
            return Err(AtlasError::ExhaustedIdSpace);
        }
        loop {
            let id = MessageId(self.next_id);
            self.next_id = if self.next_id >= self.max_id {
                1
            } else {
                self.next_id + 1
            };
            if !self.entries.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Route an inbound envelope to its waiting caller
    pub fn dispatch(&mut self, envelope: Envelope) -> Dispatch {
        let Some(entry) = self.entries.get(&envelope.id) else {
            return Dispatch::Unsolicited(envelope);
        };

        let intermediate = matches!(entry.sink, ResultSink::Streaming(_))
            && envelope.op.is_intermediate();
        if intermediate {
            entry.sink.send(Ok(envelope));
            return Dispatch::Delivered;
        }

        match self.entries.remove(&envelope.id) {
            Some(entry) => {
                entry.sink.send(Ok(envelope));
                Dispatch::Completed
            }
            None => Dispatch::Unsolicited(envelope),
        }
    }

    /// Fail every entry whose deadline has passed; returns the expired ids
    pub fn timeout_sweep(&mut self, now: Instant) -> Vec<MessageId> {
        let expired: Vec<MessageId> = self
            .entries
            .values()
            .filter(|entry| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|entry| entry.id)
            .collect();

        for id in &expired {
            if let Some(entry) = self.entries.remove(id) {
                entry.sink.send(Err(AtlasError::RequestTimeout { id: *id }));
            }
        }
        expired
    }

    /// Resolve an entry locally without waiting for the peer
    ///
    /// Returns false if nothing was pending under `id`.
    pub fn abandon(&mut self, id: MessageId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                entry.sink.send(Err(AtlasError::Abandoned { id }));
                true
            }
            None => false,
        }
    }

    /// Fail every entry and refuse new ones; returns how many were failed
    pub fn drain<F>(&mut self, reason: F) -> usize
    where
        F: Fn(MessageId) -> AtlasError,
    {
        self.closed = true;
        let count = self.entries.len();
        for (id, entry) in self.entries.drain() {
            entry.sink.send(Err(reason(id)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}
