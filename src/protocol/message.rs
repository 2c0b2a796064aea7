//! Operation payloads
//!
//! Schemas for the bodies carried inside envelopes. The engine treats
//! payloads as opaque bytes; this module is the boundary that turns them
//! into typed requests and replies, using bincode over serde.

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{MessageId, OpCode};
use crate::error::{AtlasError, Result};

// =============================================================================
// Result codes
// =============================================================================

/// Protocol status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    NoSuchObject,
    InvalidDnSyntax,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    EntryAlreadyExists,
    Other,
    /// Any code this engine does not name
    Unknown(u32),
}

impl ResultCode {
    pub fn code(self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::CompareFalse => 5,
            ResultCode::CompareTrue => 6,
            ResultCode::NoSuchObject => 32,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::Other => 80,
            ResultCode::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl From<u32> for ResultCode {
    fn from(code: u32) -> Self {
        match code {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            2 => ResultCode::ProtocolError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            5 => ResultCode::CompareFalse,
            6 => ResultCode::CompareTrue,
            32 => ResultCode::NoSuchObject,
            34 => ResultCode::InvalidDnSyntax,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            52 => ResultCode::Unavailable,
            53 => ResultCode::UnwillingToPerform,
            68 => ResultCode::EntryAlreadyExists,
            80 => ResultCode::Other,
            other => ResultCode::Unknown(other),
        }
    }
}

impl From<ResultCode> for u32 {
    fn from(code: ResultCode) -> Self {
        code.code()
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operationsError",
            ResultCode::ProtocolError => "protocolError",
            ResultCode::TimeLimitExceeded => "timeLimitExceeded",
            ResultCode::SizeLimitExceeded => "sizeLimitExceeded",
            ResultCode::CompareFalse => "compareFalse",
            ResultCode::CompareTrue => "compareTrue",
            ResultCode::NoSuchObject => "noSuchObject",
            ResultCode::InvalidDnSyntax => "invalidDNSyntax",
            ResultCode::InvalidCredentials => "invalidCredentials",
            ResultCode::InsufficientAccessRights => "insufficientAccessRights",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::UnwillingToPerform => "unwillingToPerform",
            ResultCode::EntryAlreadyExists => "entryAlreadyExists",
            ResultCode::Other => "other",
            ResultCode::Unknown(code) => return write!(f, "resultCode({})", code),
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// Final status of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            message: message.into(),
            referrals: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success, "")
    }

    /// Turn a non-success status into an operation error
    pub fn into_result(self) -> Result<LdapResult> {
        if self.code.is_success() {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    pub fn into_error(self) -> AtlasError {
        AtlasError::Operation {
            code: self.code,
            matched_dn: self.matched_dn,
            message: self.message,
        }
    }
}

// =============================================================================
// Shared value types
// =============================================================================

/// An attribute with binary-safe values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new<V: Into<Vec<u8>>>(name: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Values as text, replacing invalid UTF-8
    pub fn text_values(&self) -> Vec<Cow<'_, str>> {
        self.values
            .iter()
            .map(|value| String::from_utf8_lossy(value))
            .collect()
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    Add,
    Delete,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub op: ChangeOp,
    pub attribute: Attribute,
}

impl Change {
    pub fn new(op: ChangeOp, attribute: Attribute) -> Self {
        Self { op, attribute }
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRequest {
    pub version: u8,
    pub name: String,
    pub credentials: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub base: String,
    pub scope: Scope,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    /// Filter in string form; interpreted by server handlers
    pub filter: String,
    /// Requested attributes; empty or `*` selects all
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope: Scope::Subtree,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: filter.into(),
            attributes: Vec::new(),
        }
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn attributes<S: Into<String>>(mut self, attributes: impl IntoIterator<Item = S>) -> Self {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Whether an attribute is part of the requested selection
    pub fn selects(&self, attribute: &str) -> bool {
        self.attributes.is_empty()
            || self
                .attributes
                .iter()
                .any(|wanted| wanted == "*" || wanted.eq_ignore_ascii_case(attribute))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareRequest {
    pub entry: String,
    pub attribute: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedRequest {
    /// Request OID
    pub name: String,
    pub value: Option<Vec<u8>>,
}

/// A decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Bind(BindRequest),
    Unbind,
    Search(SearchRequest),
    Modify(ModifyRequest),
    Add(AddRequest),
    Delete(DeleteRequest),
    ModifyDn(ModifyDnRequest),
    Compare(CompareRequest),
    Abandon(MessageId),
    Extended(ExtendedRequest),
}

impl Request {
    pub fn op(&self) -> OpCode {
        match self {
            Request::Bind(_) => OpCode::BindRequest,
            Request::Unbind => OpCode::UnbindRequest,
            Request::Search(_) => OpCode::SearchRequest,
            Request::Modify(_) => OpCode::ModifyRequest,
            Request::Add(_) => OpCode::AddRequest,
            Request::Delete(_) => OpCode::DelRequest,
            Request::ModifyDn(_) => OpCode::ModifyDnRequest,
            Request::Compare(_) => OpCode::CompareRequest,
            Request::Abandon(_) => OpCode::AbandonRequest,
            Request::Extended(_) => OpCode::ExtendedRequest,
        }
    }

    /// The name a server routes this request by
    ///
    /// Extended requests route by OID; unbind and abandon have no target.
    pub fn target(&self) -> &str {
        match self {
            Request::Bind(req) => &req.name,
            Request::Search(req) => &req.base,
            Request::Modify(req) => &req.object,
            Request::Add(req) => &req.entry,
            Request::Delete(req) => &req.entry,
            Request::ModifyDn(req) => &req.entry,
            Request::Compare(req) => &req.entry,
            Request::Extended(req) => &req.name,
            Request::Unbind | Request::Abandon(_) => "",
        }
    }

    /// Encode the payload carried in the envelope
    pub fn encode(&self) -> Result<Bytes> {
        let payload = match self {
            Request::Bind(req) => bincode::serialize(req)?,
            Request::Unbind => Vec::new(),
            Request::Search(req) => bincode::serialize(req)?,
            Request::Modify(req) => bincode::serialize(req)?,
            Request::Add(req) => bincode::serialize(req)?,
            Request::Delete(req) => bincode::serialize(req)?,
            Request::ModifyDn(req) => bincode::serialize(req)?,
            Request::Compare(req) => bincode::serialize(req)?,
            Request::Abandon(id) => bincode::serialize(id)?,
            Request::Extended(req) => bincode::serialize(req)?,
        };
        Ok(Bytes::from(payload))
    }

    /// Decode a request payload for the given op-code
    pub fn decode(op: OpCode, payload: &[u8]) -> Result<Request> {
        let request = match op {
            OpCode::BindRequest => Request::Bind(bincode::deserialize(payload)?),
            OpCode::UnbindRequest => Request::Unbind,
            OpCode::SearchRequest => Request::Search(bincode::deserialize(payload)?),
            OpCode::ModifyRequest => Request::Modify(bincode::deserialize(payload)?),
            OpCode::AddRequest => Request::Add(bincode::deserialize(payload)?),
            OpCode::DelRequest => Request::Delete(bincode::deserialize(payload)?),
            OpCode::ModifyDnRequest => Request::ModifyDn(bincode::deserialize(payload)?),
            OpCode::CompareRequest => Request::Compare(bincode::deserialize(payload)?),
            OpCode::AbandonRequest => Request::Abandon(bincode::deserialize(payload)?),
            OpCode::ExtendedRequest => Request::Extended(bincode::deserialize(payload)?),
            other => {
                return Err(AtlasError::ProtocolDecode(format!(
                    "{:?} is not a request",
                    other
                )))
            }
        };
        Ok(request)
    }
}

// =============================================================================
// Replies
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

impl SearchEntry {
    pub fn new(object_name: impl Into<String>) -> Self {
        Self {
            object_name: object_name.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attribute<V: Into<Vec<u8>>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.attributes.push(Attribute::new(name, values));
        self
    }

    /// Look up an attribute by name, case-insensitively
    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|attr| attr.is_named(name))
    }

    /// First value of an attribute as text
    pub fn first(&self, name: &str) -> Option<Cow<'_, str>> {
        self.get(name)
            .and_then(|attr| attr.values.first())
            .map(|value| String::from_utf8_lossy(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchReference {
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

/// A decoded reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Entry(SearchEntry),
    Reference(SearchReference),
    Extended(ExtendedResponse),
    /// Final status of every other operation
    Done(LdapResult),
}

impl Reply {
    pub fn encode(&self) -> Result<Bytes> {
        let payload = match self {
            Reply::Entry(entry) => bincode::serialize(entry)?,
            Reply::Reference(reference) => bincode::serialize(reference)?,
            Reply::Extended(response) => bincode::serialize(response)?,
            Reply::Done(result) => bincode::serialize(result)?,
        };
        Ok(Bytes::from(payload))
    }

    pub fn decode(op: OpCode, payload: &[u8]) -> Result<Reply> {
        let reply = match op {
            OpCode::SearchResultEntry => Reply::Entry(bincode::deserialize(payload)?),
            OpCode::SearchResultReference => Reply::Reference(bincode::deserialize(payload)?),
            OpCode::ExtendedResponse => Reply::Extended(bincode::deserialize(payload)?),
            OpCode::BindResponse
            | OpCode::SearchResultDone
            | OpCode::ModifyResponse
            | OpCode::AddResponse
            | OpCode::DelResponse
            | OpCode::ModifyDnResponse
            | OpCode::CompareResponse => Reply::Done(bincode::deserialize(payload)?),
            other => {
                return Err(AtlasError::ProtocolDecode(format!(
                    "{:?} is not a reply",
                    other
                )))
            }
        };
        Ok(reply)
    }

    /// The final status carried by this reply, if it is terminal
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            Reply::Done(result) => Some(result),
            Reply::Extended(response) => Some(&response.result),
            Reply::Entry(_) | Reply::Reference(_) => None,
        }
    }
}
