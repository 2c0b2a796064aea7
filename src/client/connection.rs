//! Live connection
//!
//! One transport stream plus everything it owns: the serialized writer,
//! the pending-request table, activity tracking and the reader thread.
//! A reconnect builds a new `Connection` with a higher generation; the
//! supervisor uses the generation to ignore events from retired ones.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use parking_lot::Mutex;

use super::pending::{Dispatch, PendingTable, ResultSink};
use super::transport::Stream;
use crate::error::{AtlasError, Result};
use crate::protocol::{write_envelope, Envelope, FrameDecoder, MessageId, Request};

/// Read buffer size for the reader thread
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Out-of-band events from a connection's reader thread
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The stream ended (`error: None`) or failed
    Closed {
        generation: u64,
        error: Option<Arc<AtlasError>>,
    },

    /// An envelope arrived for an id nobody is waiting on
    Unsolicited { generation: u64, envelope: Envelope },
}

#[derive(Debug)]
struct Activity {
    last: Instant,
    idle_notified: bool,
}

/// A live transport connection
pub struct Connection {
    generation: u64,
    peer: String,
    writer: Mutex<Box<dyn Stream>>,
    /// Second handle used to shut the socket down while a write is blocked
    control: Mutex<Box<dyn Stream>>,
    pending: Mutex<PendingTable>,
    activity: Mutex<Activity>,
    timeout: Option<Duration>,
    lost: AtomicBool,
    closing: AtomicBool,
}

impl Connection {
    /// Wrap a connected stream and start its reader thread
    pub fn open(
        generation: u64,
        stream: Box<dyn Stream>,
        timeout: Option<Duration>,
        events: Sender<ConnectionEvent>,
    ) -> Result<Arc<Self>> {
        let reader = stream.try_clone_stream()?;
        let control = stream.try_clone_stream()?;
        let peer = stream.peer();

        let connection = Arc::new(Self {
            generation,
            peer,
            writer: Mutex::new(stream),
            control: Mutex::new(control),
            pending: Mutex::new(PendingTable::new()),
            activity: Mutex::new(Activity {
                last: Instant::now(),
                idle_notified: false,
            }),
            timeout,
            lost: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        let worker = Arc::clone(&connection);
        thread::Builder::new()
            .name(format!("atlasdir-reader-{}", generation))
            .spawn(move || worker.read_loop(reader, events))?;

        tracing::debug!(generation, peer = %connection.peer, "connection opened");
        Ok(connection)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Register a request and write it
    ///
    /// The entry exists before the bytes leave, so a fast reply always
    /// finds it.
    pub fn submit(&self, request: &Request, sink: ResultSink) -> Result<MessageId> {
        self.try_submit(request, sink).map_err(|(_, e)| e)
    }

    /// Like [`submit`](Self::submit), but a request that never reached the
    /// stream gets its unresolved sink back for another connection
    pub fn try_submit(
        &self,
        request: &Request,
        sink: ResultSink,
    ) -> std::result::Result<MessageId, (Option<ResultSink>, AtlasError)> {
        let op = request.op();
        let payload = match request.encode() {
            Ok(payload) => payload,
            Err(e) => return Err((Some(sink), e)),
        };
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        let id = {
            let mut pending = self.pending.lock();
            // Checked under the lock the reader drains with
            if pending.is_closed() {
                return Err((Some(sink), AtlasError::ConnectionClosed));
            }
            pending
                .register(op, sink, deadline)
                .map_err(|e| (None, e))?
        };
        let envelope = Envelope::new(id, op, payload);

        if let Err(e) = self.write(&envelope) {
            // `None` when the reader already failed it
            return Err((self.pending.lock().take(id), e));
        }
        tracing::trace!(%id, ?op, "request sent");
        Ok(id)
    }

    /// Write a request that gets no response (unbind, abandon)
    pub fn send_oneway(&self, request: &Request) -> Result<MessageId> {
        let id = self.pending.lock().allocate_oneway()?;
        self.write(&Envelope::new(id, request.op(), request.encode()?))?;
        tracing::trace!(%id, op = ?request.op(), "one-way message sent");
        Ok(id)
    }

    /// Stop waiting for `target` and tell the peer
    ///
    /// Returns false, sending nothing, when `target` is not pending.
    pub fn abandon(&self, target: MessageId) -> Result<bool> {
        if !self.pending.lock().abandon(target) {
            return Ok(false);
        }
        self.send_oneway(&Request::Abandon(target))?;
        Ok(true)
    }

    fn write(&self, envelope: &Envelope) -> Result<()> {
        let mut writer = self.writer.lock();
        write_envelope(&mut *writer, envelope).map_err(|e| match e {
            AtlasError::Io(e) => AtlasError::Transport(format!("write to {}: {}", self.peer, e)),
            other => other,
        })?;
        drop(writer);
        self.touch();
        Ok(())
    }

    /// Fail requests whose deadline has passed
    pub fn sweep(&self, now: Instant) -> Vec<MessageId> {
        let expired = self.pending.lock().timeout_sweep(now);
        for id in &expired {
            tracing::debug!(%id, "request timed out");
        }
        expired
    }

    /// True once per quiet period of `idle` with nothing pending
    pub fn idle_check(&self, idle: Duration, now: Instant) -> bool {
        if !self.pending.lock().is_empty() {
            return false;
        }
        let mut activity = self.activity.lock();
        if activity.idle_notified || now.saturating_duration_since(activity.last) < idle {
            return false;
        }
        activity.idle_notified = true;
        true
    }

    /// Record traffic, restarting the idle clock
    pub fn touch(&self) {
        let mut activity = self.activity.lock();
        activity.last = Instant::now();
        activity.idle_notified = false;
    }

    /// Fail everything pending and release the socket
    pub fn teardown(&self) -> usize {
        self.closing.store(true, Ordering::SeqCst);
        let failed = self.pending.lock().drain(|_| AtlasError::ConnectionClosed);
        if let Err(e) = self.control.lock().shutdown_stream() {
            tracing::trace!(error = %e, "shutdown of a dead stream");
        }
        tracing::debug!(generation = self.generation, failed, "connection torn down");
        failed
    }

    /// Expect the stream to end; its loss is then a requested close
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// The reader saw the stream end or fail
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn read_loop(self: Arc<Self>, mut reader: Box<dyn Stream>, events: Sender<ConnectionEvent>) {
        let span = tracing::debug_span!("reader", generation = self.generation, peer = %self.peer);
        let _enter = span.enter();

        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let error = 'read: loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break None,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Some(AtlasError::Transport(format!("read: {}", e))),
            };
            decoder.extend(&buf[..n]);

            loop {
                match decoder.next_frame() {
                    Ok(Some(envelope)) => self.deliver(envelope, &events),
                    Ok(None) => break,
                    Err(e) => break 'read Some(e),
                }
            }
        };

        self.lost.store(true, Ordering::SeqCst);
        // Waiters must not hang on a dead stream, even mid-setup
        self.pending.lock().drain(|_| AtlasError::ConnectionClosed);

        if self.is_closing() {
            tracing::trace!("reader stopped on close");
        } else {
            match &error {
                None => tracing::debug!("peer closed the stream"),
                Some(e) => tracing::warn!(error = %e, "connection failed"),
            }
        }

        let _ = events.send(ConnectionEvent::Closed {
            generation: self.generation,
            error: error.map(Arc::new),
        });
    }

    fn deliver(&self, envelope: Envelope, events: &Sender<ConnectionEvent>) {
        self.touch();
        tracing::trace!(id = %envelope.id, op = ?envelope.op, "frame received");

        let dispatch = self.pending.lock().dispatch(envelope);
        if let Dispatch::Unsolicited(envelope) = dispatch {
            tracing::debug!(id = %envelope.id, op = ?envelope.op, "unsolicited message");
            let _ = events.send(ConnectionEvent::Unsolicited {
                generation: self.generation,
                envelope,
            });
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.generation)
            .field("peer", &self.peer)
            .field("lost", &self.is_lost())
            .finish()
    }
}
