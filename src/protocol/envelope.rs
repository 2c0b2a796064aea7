//! Envelope definitions
//!
//! The decoded unit of one protocol message: correlation id, op-code,
//! opaque payload and an ordered list of controls.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Correlation id linking a request to its response(s) on one connection.
///
/// Zero is reserved for unsolicited notifications and is never allocated to
/// a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u32);

impl MessageId {
    /// Reserved id used by the peer for unsolicited notifications
    pub const UNSOLICITED: MessageId = MessageId(0);

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_unsolicited(self) -> bool {
        self == Self::UNSOLICITED
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Protocol operation tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    BindRequest = 0,
    BindResponse = 1,
    UnbindRequest = 2,
    SearchRequest = 3,
    SearchResultEntry = 4,
    SearchResultDone = 5,
    ModifyRequest = 6,
    ModifyResponse = 7,
    AddRequest = 8,
    AddResponse = 9,
    DelRequest = 10,
    DelResponse = 11,
    ModifyDnRequest = 12,
    ModifyDnResponse = 13,
    CompareRequest = 14,
    CompareResponse = 15,
    AbandonRequest = 16,
    SearchResultReference = 19,
    ExtendedRequest = 23,
    ExtendedResponse = 24,
}

impl OpCode {
    pub fn from_u8(tag: u8) -> Option<OpCode> {
        let op = match tag {
            0 => OpCode::BindRequest,
            1 => OpCode::BindResponse,
            2 => OpCode::UnbindRequest,
            3 => OpCode::SearchRequest,
            4 => OpCode::SearchResultEntry,
            5 => OpCode::SearchResultDone,
            6 => OpCode::ModifyRequest,
            7 => OpCode::ModifyResponse,
            8 => OpCode::AddRequest,
            9 => OpCode::AddResponse,
            10 => OpCode::DelRequest,
            11 => OpCode::DelResponse,
            12 => OpCode::ModifyDnRequest,
            13 => OpCode::ModifyDnResponse,
            14 => OpCode::CompareRequest,
            15 => OpCode::CompareResponse,
            16 => OpCode::AbandonRequest,
            19 => OpCode::SearchResultReference,
            23 => OpCode::ExtendedRequest,
            24 => OpCode::ExtendedResponse,
            _ => return None,
        };
        Some(op)
    }

    /// The response op-code that terminates a request of this kind.
    ///
    /// Unbind and abandon have no response.
    pub fn response(self) -> Option<OpCode> {
        match self {
            OpCode::BindRequest => Some(OpCode::BindResponse),
            OpCode::SearchRequest => Some(OpCode::SearchResultDone),
            OpCode::ModifyRequest => Some(OpCode::ModifyResponse),
            OpCode::AddRequest => Some(OpCode::AddResponse),
            OpCode::DelRequest => Some(OpCode::DelResponse),
            OpCode::ModifyDnRequest => Some(OpCode::ModifyDnResponse),
            OpCode::CompareRequest => Some(OpCode::CompareResponse),
            OpCode::ExtendedRequest => Some(OpCode::ExtendedResponse),
            _ => None,
        }
    }

    /// Intermediate results of a streaming operation (entries and references)
    pub fn is_intermediate(self) -> bool {
        matches!(self, OpCode::SearchResultEntry | OpCode::SearchResultReference)
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            OpCode::BindRequest
                | OpCode::UnbindRequest
                | OpCode::SearchRequest
                | OpCode::ModifyRequest
                | OpCode::AddRequest
                | OpCode::DelRequest
                | OpCode::ModifyDnRequest
                | OpCode::CompareRequest
                | OpCode::AbandonRequest
                | OpCode::ExtendedRequest
        )
    }
}

/// A request or response control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    /// Control type OID
    pub oid: String,

    /// Whether the peer must reject the operation if it does not support the control
    pub critical: bool,

    /// Optional opaque control value
    pub value: Option<Bytes>,
}

impl Control {
    pub fn new(oid: impl Into<String>, critical: bool, value: Option<Bytes>) -> Self {
        Self {
            oid: oid.into(),
            critical,
            value,
        }
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: MessageId,
    pub op: OpCode,
    pub payload: Bytes,
    pub controls: Vec<Control>,
}

impl Envelope {
    pub fn new(id: MessageId, op: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            op,
            payload: payload.into(),
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }
}
