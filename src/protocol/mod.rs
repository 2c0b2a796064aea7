//! Protocol Module
//!
//! Defines the wire protocol shared by client and server.
//!
//! ## Message Envelope
//! ```text
//! ┌──────────┬──────────┬────────┬──────────┬──────────────┬─────────────┐
//! │ Len (4)  │  Id (4)  │ Op (1) │ NCtl (2) │  Controls    │   Payload   │
//! └──────────┴──────────┴────────┴──────────┴──────────────┴─────────────┘
//! ```
//!
//! ### Op-codes
//! - 0x00 / 0x01: BIND request / response
//! - 0x02: UNBIND (no response)
//! - 0x03: SEARCH request, answered by any number of
//!   0x04 ENTRY / 0x13 REFERENCE, then one 0x05 DONE
//! - 0x06 / 0x07: MODIFY
//! - 0x08 / 0x09: ADD
//! - 0x0A / 0x0B: DELETE
//! - 0x0C / 0x0D: MODIFY DN
//! - 0x0E / 0x0F: COMPARE
//! - 0x10: ABANDON (no response)
//! - 0x17 / 0x18: EXTENDED
//!
//! Payloads are opaque to the envelope layer; [`message`] defines their
//! schemas.

mod codec;
mod envelope;
pub mod message;

pub use codec::{
    decode_envelope, encode_envelope, read_envelope, write_envelope, Decoded, FrameDecoder,
    MAX_FRAME_SIZE,
};
pub use envelope::{Control, Envelope, MessageId, OpCode};
pub use message::{
    AddRequest, Attribute, BindRequest, Change, ChangeOp, CompareRequest, DeleteRequest,
    ExtendedRequest, ExtendedResponse, LdapResult, ModifyDnRequest, ModifyRequest, Reply,
    Request, ResultCode, Scope, SearchEntry, SearchReference, SearchRequest,
};
