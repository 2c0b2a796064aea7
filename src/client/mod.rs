//! Client engine
//!
//! ## Threads
//! ```text
//!   caller threads ──submit──► Connection (writer lock) ──► socket
//!        ▲                          ▲                          │
//!        │ channel                  │ teardown / sweep         │
//!        │                          │                          ▼
//!   PendingTable ◄──dispatch── reader thread ◄──────────── socket
//!                                   │ lost / unsolicited
//!                                   ▼
//!                              supervisor (state machine, retry timer, sweep tick)
//! ```
//!
//! Callers block only on their own reply channel; the reader and the
//! supervisor never wait on a caller.

mod connection;
mod facade;
mod notification;
mod ops;
mod pending;
mod search;
mod state;
mod supervisor;
mod transport;

pub use connection::{Connection, ConnectionEvent};
pub use facade::{Client, ClientBuilder, Session, SetupHook};
pub use notification::{Notification, Notifier};
pub use ops::{sink_for, Operations, PendingReply, RequestKind, Ticket};
pub use pending::{Dispatch, PendingEntry, PendingTable, ResultSink};
pub use search::{SearchEvent, SearchStream};
pub use state::{Action, ConnectionState, Event, StateMachine};
pub use transport::{SocketTransport, Stream, Transport};
