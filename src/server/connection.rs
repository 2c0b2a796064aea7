//! Server connection
//!
//! Reads envelopes from one client and runs each request on its own
//! thread, so a slow search does not hold up a bind behind it. Responses
//! share the connection's writer.

use std::collections::HashMap;
use std::io::{BufReader, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use super::response::{Outbound, ResponseWriter};
use super::router::{RequestContext, Router};
use crate::client::Stream;
use crate::error::{AtlasError, Result};
use crate::name::DirName;
use crate::protocol::{
    read_envelope, Envelope, ExtendedResponse, LdapResult, MessageId, OpCode, Reply, Request,
    ResultCode,
};

/// Requests still running, by id, with their abandon flags
type InFlight = Arc<Mutex<HashMap<MessageId, Arc<AtomicBool>>>>;

/// Handles a single client connection
pub struct ServerConnection {
    reader: BufReader<Box<dyn Stream>>,
    outbound: Arc<Outbound>,
    router: Arc<Router>,
    in_flight: InFlight,
    bound_dn: Arc<Mutex<String>>,
}

impl ServerConnection {
    pub fn new(stream: Box<dyn Stream>, router: Arc<Router>) -> Result<Self> {
        let reader = stream.try_clone_stream()?;
        Ok(Self {
            reader: BufReader::new(reader),
            outbound: Arc::new(Outbound::new(stream)?),
            router,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            bound_dn: Arc::new(Mutex::new(String::new())),
        })
    }

    pub fn outbound(&self) -> Arc<Outbound> {
        Arc::clone(&self.outbound)
    }

    /// Serve requests until the client leaves (blocking)
    pub fn handle(&mut self) -> Result<()> {
        let peer = self.outbound.peer().to_string();
        tracing::debug!("Connection established from {}", peer);

        loop {
            let envelope = match read_envelope(&mut self.reader) {
                Ok(envelope) => envelope,
                Err(AtlasError::Io(ref e))
                    if matches!(
                        e.kind(),
                        ErrorKind::UnexpectedEof
                            | ErrorKind::ConnectionReset
                            | ErrorKind::ConnectionAborted
                    ) =>
                {
                    tracing::debug!("Client {} disconnected", peer);
                    break;
                }
                Err(AtlasError::Io(ref e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    tracing::debug!("Read timeout for client {}", peer);
                    break;
                }
                Err(e) => {
                    // The stream cannot be resynchronized after a bad frame
                    tracing::warn!("Error reading from {}: {}", peer, e);
                    self.outbound.shutdown();
                    return Err(e);
                }
            };

            tracing::trace!(id = %envelope.id, op = ?envelope.op, "request frame from {}", peer);
            if !self.on_envelope(envelope) {
                break;
            }
        }

        self.outbound.shutdown();
        Ok(())
    }

    /// Returns false when the connection should close
    fn on_envelope(&self, envelope: Envelope) -> bool {
        if !envelope.op.is_request() {
            tracing::warn!(id = %envelope.id, op = ?envelope.op, "response op-code from a client, ignored");
            return true;
        }
        let request = match Request::decode(envelope.op, &envelope.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(id = %envelope.id, op = ?envelope.op, error = %e, "undecodable request");
                self.reject(&envelope, ResultCode::ProtocolError, &e.to_string());
                return true;
            }
        };

        match request {
            Request::Abandon(target) => {
                if let Some(flag) = self.in_flight.lock().get(&target) {
                    flag.store(true, Ordering::SeqCst);
                    tracing::debug!(%target, "request abandoned by client");
                }
                true
            }
            Request::Unbind => {
                tracing::debug!(peer = %self.outbound.peer(), "unbind");
                self.run(envelope, request);
                false
            }
            request => {
                // Tracked before the thread starts so an abandon cannot miss it
                let abandoned = self.track(envelope.id);
                let this = self.worker();
                let spawned = thread::Builder::new()
                    .name(format!("atlasdir-request-{}", envelope.id.get()))
                    .spawn(move || this.run(envelope, request, abandoned));
                if let Err(e) = spawned {
                    tracing::error!(error = %e, "could not start request thread");
                }
                true
            }
        }
    }

    fn worker(&self) -> Worker {
        Worker {
            outbound: Arc::clone(&self.outbound),
            router: Arc::clone(&self.router),
            in_flight: Arc::clone(&self.in_flight),
            bound_dn: Arc::clone(&self.bound_dn),
        }
    }

    fn track(&self, id: MessageId) -> Arc<AtomicBool> {
        let abandoned = Arc::new(AtomicBool::new(false));
        self.in_flight.lock().insert(id, Arc::clone(&abandoned));
        abandoned
    }

    fn run(&self, envelope: Envelope, request: Request) {
        let abandoned = self.track(envelope.id);
        self.worker().run(envelope, request, abandoned);
    }

    /// Answer a request that never reached a handler
    fn reject(&self, envelope: &Envelope, code: ResultCode, message: &str) {
        let Some(op) = envelope.op.response() else {
            return;
        };
        let reply = match op {
            OpCode::ExtendedResponse => Reply::Extended(ExtendedResponse {
                result: LdapResult::new(code, message),
                name: None,
                value: None,
            }),
            _ => Reply::Done(LdapResult::new(code, message)),
        };
        let sent = reply
            .encode()
            .and_then(|payload| self.outbound.send(&Envelope::new(envelope.id, op, payload)));
        if let Err(e) = sent {
            tracing::debug!(id = %envelope.id, error = %e, "rejection not delivered");
        }
    }
}

/// What a request thread needs from its connection
struct Worker {
    outbound: Arc<Outbound>,
    router: Arc<Router>,
    in_flight: InFlight,
    bound_dn: Arc<Mutex<String>>,
}

impl Worker {
    fn run(self, envelope: Envelope, request: Request, abandoned: Arc<AtomicBool>) {
        let span = tracing::debug_span!("request", id = %envelope.id, op = ?envelope.op, peer = %self.outbound.peer());
        let _enter = span.enter();

        let mut response =
            ResponseWriter::new(envelope.id, &request, Arc::clone(&self.outbound), abandoned)
                .with_identity(Arc::clone(&self.bound_dn));

        let target = DirName::parse(request.target());
        match target {
            Ok(target) => {
                let ctx = RequestContext {
                    id: envelope.id,
                    request,
                    target,
                    controls: envelope.controls,
                    peer: self.outbound.peer().to_string(),
                    bound_dn: self.bound_dn.lock().clone(),
                };
                self.router.dispatch(&ctx, &mut response);
            }
            Err(e) => {
                if let Err(e) = response.fail(&e) {
                    tracing::debug!(error = %e, "rejection not delivered");
                }
            }
        }

        self.in_flight.lock().remove(&envelope.id);
    }
}
