//! # AtlasDir
//!
//! Connection engine for a directory-access protocol:
//! - Length-prefixed envelope framing with correlation ids
//! - Pending-request table matching responses to callers
//! - Supervised client connections with backoff reconnect, setup hooks and idle tracking
//! - Server-side router running handler chains by op-code and target name
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────┐                 ┌───────────────────────────┐
//! │          Client           │                 │          Server           │
//! │  (façade, queue, search)  │                 │  (listener, connections)  │
//! └─────────────┬─────────────┘                 └─────────────┬─────────────┘
//!               │                                             │
//! ┌─────────────▼─────────────┐                 ┌─────────────▼─────────────┐
//! │        Supervisor         │                 │          Router           │
//! │ (state machine, backoff)  │                 │ (match rules, chains)     │
//! └─────────────┬─────────────┘                 └─────────────┬─────────────┘
//!               │                                             │
//! ┌─────────────▼─────────────┐                 ┌─────────────▼─────────────┐
//! │ Connection + PendingTable │                 │      ResponseWriter       │
//! └─────────────┬─────────────┘                 └─────────────┬─────────────┘
//!               │                                             │
//!               └──────────────► Envelope codec ◄─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod name;

pub mod protocol;
pub mod client;
pub mod server;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, Result};
pub use config::{ClientConfig, ReconnectPolicy, ServerConfig, SetupFailurePolicy};
pub use client::{Client, Notification, Operations, SearchEvent};
pub use server::{Router, Server};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasDir
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
