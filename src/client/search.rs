//! Search result streams

use crossbeam::channel::Receiver;

use super::ops::Ticket;
use crate::error::{AtlasError, Result};
use crate::protocol::{Envelope, LdapResult, MessageId, Reply, SearchEntry};

/// One event of a running search
#[derive(Debug)]
pub enum SearchEvent {
    Entry(SearchEntry),
    /// Continuation references (URIs)
    Reference(Vec<String>),
    /// Successful completion
    End(LdapResult),
    /// Non-success status, protocol failure or lost connection
    Error(AtlasError),
}

impl SearchEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SearchEvent::End(_) | SearchEvent::Error(_))
    }
}

/// Live stream of a search's results
///
/// Yields entries and references in arrival order, then exactly one `End`
/// or `Error`, then nothing.
#[derive(Debug)]
pub struct SearchStream {
    rx: Receiver<Result<Envelope>>,
    ticket: Ticket,
    finished: bool,
}

impl SearchStream {
    pub(crate) fn new(rx: Receiver<Result<Envelope>>, ticket: Ticket) -> Self {
        Self {
            rx,
            ticket,
            finished: false,
        }
    }

    /// Correlation id, once the request has left the client
    pub fn message_id(&self) -> Option<MessageId> {
        self.ticket.get()
    }

    /// Drain the stream into its entries, failing on any error
    pub fn collect_entries(self) -> Result<(Vec<SearchEntry>, LdapResult)> {
        let mut entries = Vec::new();
        for event in self {
            match event {
                SearchEvent::Entry(entry) => entries.push(entry),
                SearchEvent::Reference(_) => {}
                SearchEvent::End(result) => return Ok((entries, result)),
                SearchEvent::Error(e) => return Err(e),
            }
        }
        Err(AtlasError::ConnectionClosed)
    }

    fn convert(item: Result<Envelope>) -> SearchEvent {
        let envelope = match item {
            Ok(envelope) => envelope,
            Err(e) => return SearchEvent::Error(e),
        };
        match Reply::decode(envelope.op, &envelope.payload) {
            Ok(Reply::Entry(entry)) => SearchEvent::Entry(entry),
            Ok(Reply::Reference(reference)) => SearchEvent::Reference(reference.uris),
            Ok(Reply::Done(result)) if result.code.is_success() => SearchEvent::End(result),
            Ok(Reply::Done(result)) => SearchEvent::Error(result.into_error()),
            Ok(Reply::Extended(_)) => SearchEvent::Error(AtlasError::InvalidResponse(format!(
                "{:?} in a search",
                envelope.op
            ))),
            Err(e) => SearchEvent::Error(e),
        }
    }
}

impl Iterator for SearchStream {
    type Item = SearchEvent;

    fn next(&mut self) -> Option<SearchEvent> {
        if self.finished {
            return None;
        }
        let event = match self.rx.recv() {
            Ok(item) => Self::convert(item),
            Err(_) => SearchEvent::Error(AtlasError::ConnectionClosed),
        };
        self.finished = event.is_terminal();
        Some(event)
    }
}
