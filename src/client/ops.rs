//! Directory operations
//!
//! Every operation is built on one primitive, [`Operations::submit`], so the
//! client façade and the setup-hook session share the same surface.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError};

use super::pending::ResultSink;
use super::search::SearchStream;
use crate::error::{AtlasError, Result};
use crate::name::{split_leaf, DirName};
use crate::protocol::{
    AddRequest, Attribute, BindRequest, Change, CompareRequest, DeleteRequest, Envelope,
    ExtendedRequest, ExtendedResponse, LdapResult, MessageId, ModifyDnRequest, ModifyRequest,
    Reply, Request, ResultCode, SearchRequest,
};

/// How many responses a request produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Single,
    Streaming,
}

/// The correlation id of a request, filled in once it is written
///
/// Queued requests get their id only when a connection takes them.
#[derive(Debug, Clone, Default)]
pub struct Ticket(Arc<AtomicU32>);

impl Ticket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: MessageId) {
        self.0.store(id.get(), Ordering::SeqCst);
    }

    pub fn get(&self) -> Option<MessageId> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            id => Some(MessageId(id)),
        }
    }
}

/// A result sink for `kind` and the receiving end its caller waits on
pub fn sink_for(kind: RequestKind) -> (ResultSink, Receiver<Result<Envelope>>) {
    let (tx, rx) = unbounded();
    let sink = match kind {
        RequestKind::Single => ResultSink::Single(tx),
        RequestKind::Streaming => ResultSink::Streaming(tx),
    };
    (sink, rx)
}

/// A submitted request awaiting its response(s)
#[derive(Debug)]
pub struct PendingReply {
    rx: Receiver<Result<Envelope>>,
    ticket: Ticket,
    deadline: Option<Instant>,
}

impl PendingReply {
    pub fn new(rx: Receiver<Result<Envelope>>, ticket: Ticket) -> Self {
        Self {
            rx,
            ticket,
            deadline: None,
        }
    }

    /// Give up waiting after `timeout`, for callers nothing else sweeps
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|timeout| Instant::now() + timeout);
        self
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.ticket.get()
    }

    /// Block until the single response arrives
    pub fn wait(self) -> Result<Reply> {
        let received = match self.deadline {
            Some(deadline) => self.rx.recv_deadline(deadline).map_err(|e| match e {
                RecvTimeoutError::Timeout => AtlasError::RequestTimeout {
                    id: self.ticket.get().unwrap_or(MessageId::UNSOLICITED),
                },
                RecvTimeoutError::Disconnected => AtlasError::ConnectionClosed,
            }),
            None => self.rx.recv().map_err(|_| AtlasError::ConnectionClosed),
        };
        let envelope = received??;
        Reply::decode(envelope.op, &envelope.payload)
    }

    pub fn into_stream(self) -> SearchStream {
        SearchStream::new(self.rx, self.ticket)
    }
}

fn expect_done(reply: Reply) -> Result<LdapResult> {
    match reply {
        Reply::Done(result) => result.into_result(),
        other => Err(AtlasError::InvalidResponse(format!(
            "expected a final status, got {:?}",
            other
        ))),
    }
}

fn validate(name: &str) -> Result<()> {
    DirName::parse(name).map(|_| ())
}

/// Operations available on a directory connection
pub trait Operations {
    /// Send a request and return a handle to its response(s)
    fn submit(&self, request: Request, kind: RequestKind) -> Result<PendingReply>;

    /// Simple bind; an empty name binds anonymously
    fn bind(&self, name: &str, password: &[u8]) -> Result<()> {
        validate(name)?;
        let request = Request::Bind(BindRequest {
            version: 3,
            name: name.to_string(),
            credentials: password.to_vec(),
        });
        expect_done(self.submit(request, RequestKind::Single)?.wait()?).map(|_| ())
    }

    fn add(&self, entry: &str, attributes: Vec<Attribute>) -> Result<()> {
        validate(entry)?;
        let request = Request::Add(AddRequest {
            entry: entry.to_string(),
            attributes,
        });
        expect_done(self.submit(request, RequestKind::Single)?.wait()?).map(|_| ())
    }

    /// Whether `entry` holds `value` for `attribute`
    fn compare(&self, entry: &str, attribute: &str, value: &[u8]) -> Result<bool> {
        validate(entry)?;
        let request = Request::Compare(CompareRequest {
            entry: entry.to_string(),
            attribute: attribute.to_string(),
            value: value.to_vec(),
        });
        match self.submit(request, RequestKind::Single)?.wait()? {
            Reply::Done(result) => match result.code {
                ResultCode::CompareTrue => Ok(true),
                ResultCode::CompareFalse => Ok(false),
                ResultCode::Success => Err(AtlasError::InvalidResponse(
                    "compare answered without a verdict".to_string(),
                )),
                _ => Err(result.into_error()),
            },
            other => Err(AtlasError::InvalidResponse(format!(
                "expected a compare result, got {:?}",
                other
            ))),
        }
    }

    fn delete(&self, entry: &str) -> Result<()> {
        validate(entry)?;
        let request = Request::Delete(DeleteRequest {
            entry: entry.to_string(),
        });
        expect_done(self.submit(request, RequestKind::Single)?.wait()?).map(|_| ())
    }

    fn modify(&self, object: &str, changes: Vec<Change>) -> Result<()> {
        validate(object)?;
        let request = Request::Modify(ModifyRequest {
            object: object.to_string(),
            changes,
        });
        expect_done(self.submit(request, RequestKind::Single)?.wait()?).map(|_| ())
    }

    /// Rename `entry` to `new_name`; a multi-component name also moves it
    fn modify_dn(&self, entry: &str, new_name: &str, delete_old_rdn: bool) -> Result<()> {
        validate(entry)?;
        validate(new_name)?;
        let (new_rdn, new_superior) = split_leaf(new_name)?;
        let request = Request::ModifyDn(ModifyDnRequest {
            entry: entry.to_string(),
            new_rdn,
            delete_old_rdn,
            new_superior,
        });
        expect_done(self.submit(request, RequestKind::Single)?.wait()?).map(|_| ())
    }

    /// Run the extended operation `oid`
    fn extended(&self, oid: &str, value: Option<Vec<u8>>) -> Result<ExtendedResponse> {
        let request = Request::Extended(ExtendedRequest {
            name: oid.to_string(),
            value,
        });
        match self.submit(request, RequestKind::Single)?.wait()? {
            Reply::Extended(response) if response.result.code.is_success() => Ok(response),
            Reply::Extended(response) => Err(response.result.into_error()),
            other => expect_done(other).map(|result| ExtendedResponse {
                result,
                name: None,
                value: None,
            }),
        }
    }

    /// Start a search; results arrive on the returned stream
    fn search(&self, request: SearchRequest) -> Result<SearchStream> {
        validate(&request.base)?;
        Ok(self
            .submit(Request::Search(request), RequestKind::Streaming)?
            .into_stream())
    }
}
