//! Response writer
//!
//! Handlers answer through a `ResponseWriter`. A search may stream any
//! number of entries and references; every request gets at most one final
//! response. Sends after the final one are refused and logged, never
//! written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::Stream;
use crate::error::{AtlasError, Result};
use crate::protocol::{
    write_envelope, Envelope, ExtendedResponse, LdapResult, MessageId, OpCode, Reply, Request,
    ResultCode, SearchEntry, SearchReference, SearchRequest,
};

/// The write half of one server connection, shared by its request threads
pub struct Outbound {
    peer: String,
    writer: Mutex<Box<dyn Stream>>,
    control: Mutex<Box<dyn Stream>>,
}

impl Outbound {
    pub fn new(stream: Box<dyn Stream>) -> Result<Self> {
        let control = stream.try_clone_stream()?;
        Ok(Self {
            peer: stream.peer(),
            writer: Mutex::new(stream),
            control: Mutex::new(control),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one envelope; concurrent senders never interleave bytes
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let mut writer = self.writer.lock();
        write_envelope(&mut *writer, envelope)
    }

    /// Close the connection, waking its reader
    pub fn shutdown(&self) {
        if let Err(e) = self.control.lock().shutdown_stream() {
            tracing::trace!(peer = %self.peer, error = %e, "shutdown of a dead stream");
        }
    }
}

/// Trim an entry to what the search asked for
fn select(search: &SearchRequest, mut entry: SearchEntry) -> SearchEntry {
    entry.attributes.retain(|attr| search.selects(&attr.name));
    if search.types_only {
        for attr in &mut entry.attributes {
            attr.values.clear();
        }
    }
    entry
}

/// Sends the response(s) for one request
pub struct ResponseWriter {
    id: MessageId,
    request_op: OpCode,
    search: Option<SearchRequest>,
    outbound: Arc<Outbound>,
    abandoned: Arc<AtomicBool>,
    finalized: bool,
    final_code: Option<ResultCode>,
    entries_sent: usize,
    /// Name a bind request asks for
    bind_name: Option<String>,
    /// Connection identity, updated when a bind succeeds
    identity: Option<Arc<Mutex<String>>>,
}

impl ResponseWriter {
    pub fn new(
        id: MessageId,
        request: &Request,
        outbound: Arc<Outbound>,
        abandoned: Arc<AtomicBool>,
    ) -> Self {
        let search = match request {
            Request::Search(search) => Some(search.clone()),
            _ => None,
        };
        let bind_name = match request {
            Request::Bind(bind) => Some(bind.name.clone()),
            _ => None,
        };
        Self {
            id,
            request_op: request.op(),
            search,
            outbound,
            abandoned,
            finalized: false,
            final_code: None,
            entries_sent: 0,
            bind_name,
            identity: None,
        }
    }

    /// Record a successful bind's name in `bound_dn` before its response is sent
    pub fn with_identity(mut self, bound_dn: Arc<Mutex<String>>) -> Self {
        self.identity = Some(bound_dn);
        self
    }

    pub fn message_id(&self) -> MessageId {
        self.id
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The client abandoned this request; sends are dropped
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Status of the final response, once sent
    pub fn final_code(&self) -> Option<ResultCode> {
        self.final_code
    }

    pub fn entries_sent(&self) -> usize {
        self.entries_sent
    }

    /// Stream one search entry, trimmed to the requested attributes
    pub fn send_entry(&mut self, entry: SearchEntry) -> Result<()> {
        let Some(search) = &self.search else {
            return Err(self.not_a_search("entry"));
        };
        let entry = select(search, entry);
        self.send_intermediate(OpCode::SearchResultEntry, Reply::Entry(entry))?;
        self.entries_sent += 1;
        Ok(())
    }

    /// Stream a continuation reference
    pub fn send_reference(&mut self, uris: Vec<String>) -> Result<()> {
        if self.search.is_none() {
            return Err(self.not_a_search("reference"));
        }
        self.send_intermediate(
            OpCode::SearchResultReference,
            Reply::Reference(SearchReference { uris }),
        )
    }

    /// Finalize with `result`
    pub fn end(&mut self, result: LdapResult) -> Result<()> {
        let reply = match self.request_op {
            OpCode::ExtendedRequest => Reply::Extended(ExtendedResponse {
                result,
                name: None,
                value: None,
            }),
            _ => Reply::Done(result),
        };
        self.finalize(reply)
    }

    /// Finalize a compare with its verdict
    pub fn end_compare(&mut self, matched: bool) -> Result<()> {
        let code = if matched {
            ResultCode::CompareTrue
        } else {
            ResultCode::CompareFalse
        };
        self.end(LdapResult::new(code, ""))
    }

    /// Finalize an extended operation with its response name and value
    pub fn end_extended(&mut self, name: Option<String>, value: Option<Vec<u8>>) -> Result<()> {
        if self.request_op != OpCode::ExtendedRequest {
            return Err(AtlasError::InvalidResponse(format!(
                "extended response to {:?}",
                self.request_op
            )));
        }
        self.finalize(Reply::Extended(ExtendedResponse {
            result: LdapResult::success(),
            name,
            value,
        }))
    }

    /// Finalize with the status `error` maps to
    pub fn fail(&mut self, error: &AtlasError) -> Result<()> {
        let mut result = LdapResult::new(error.result_code(), error.to_string());
        if let AtlasError::Operation {
            matched_dn,
            message,
            ..
        } = error
        {
            result.matched_dn = matched_dn.clone();
            result.message = message.clone();
        }
        self.end(result)
    }

    fn send_intermediate(&mut self, op: OpCode, reply: Reply) -> Result<()> {
        if self.finalized {
            return Err(self.already_finalized(op));
        }
        if self.is_abandoned() {
            tracing::trace!(id = %self.id, ?op, "dropped send on abandoned request");
            return Ok(());
        }
        self.write(op, &reply)
    }

    fn finalize(&mut self, reply: Reply) -> Result<()> {
        if self.finalized {
            return Err(self.already_finalized(self.request_op));
        }
        self.finalized = true;
        self.final_code = reply.result().map(|result| result.code);

        // The next request may arrive as soon as the client sees this response
        if let (Some(name), Some(identity), Some(ResultCode::Success)) =
            (&self.bind_name, &self.identity, self.final_code)
        {
            *identity.lock() = name.clone();
            tracing::debug!(dn = %name, "bound");
        }

        // Unbind and abandon are never answered
        let Some(op) = self.request_op.response() else {
            return Ok(());
        };
        if self.is_abandoned() {
            tracing::trace!(id = %self.id, "final response dropped, request abandoned");
            return Ok(());
        }
        self.write(op, &reply)
    }

    fn write(&self, op: OpCode, reply: &Reply) -> Result<()> {
        let envelope = Envelope::new(self.id, op, reply.encode()?);
        self.outbound.send(&envelope).map_err(|e| {
            tracing::debug!(id = %self.id, peer = %self.outbound.peer(), error = %e, "response not delivered");
            e
        })
    }

    fn already_finalized(&self, op: OpCode) -> AtlasError {
        tracing::error!(id = %self.id, ?op, "send after the response was finalized");
        AtlasError::AlreadyFinalized { id: self.id }
    }

    fn not_a_search(&self, what: &str) -> AtlasError {
        tracing::error!(id = %self.id, op = ?self.request_op, "search {} on a non-search response", what);
        AtlasError::InvalidResponse(format!("{} sent for {:?}", what, self.request_op))
    }
}
