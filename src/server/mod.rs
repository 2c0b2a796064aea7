//! Server Module
//!
//! Listener, per-connection request loop and the router that matches
//! requests to handler chains.

mod connection;
mod listener;
mod response;
mod router;

pub use connection::ServerConnection;
pub use listener::{Server, ServerHandle, NOTICE_OF_DISCONNECTION};
pub use response::{Outbound, ResponseWriter};
pub use router::{Handler, MatchRule, Next, RequestContext, Router};
