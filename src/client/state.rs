//! Connection state machine
//!
//! A pure transition table: events go in, actions come out. The supervisor
//! performs the actions (connecting, tearing down, notifying) and feeds the
//! outcomes back as events, so every transition can be driven in tests
//! without a network.
//!
//! ## Transitions
//! ```text
//!  Idle ──Open──► Connecting ──ok──► [Binding ──setup ok──►] Connected
//!                   │   ▲                 │ setup failed          │ close / lost
//!            failed │   │ retry           ▼                       ▼
//!                   ▼   │               Closing ◄─────────────── Closing
//!             (budget left?)              │ torn down
//!                   │ no                  ▼
//!                   ▼                   Closed ──(reconnect?)──► Connecting
//!                 Closed (terminal)
//! ```

use std::sync::Arc;
use std::time::Duration;

use super::notification::Notification;
use crate::config::{ReconnectPolicy, SetupFailurePolicy};
use crate::error::AtlasError;

/// Lifecycle state of the client's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Binding,
    Closing,
    Closed,
}

/// Inputs to the state machine
#[derive(Debug, Clone)]
pub enum Event {
    /// Someone wants a connection
    Open,
    ConnectSucceeded,
    ConnectFailed(Arc<AtlasError>),
    SetupSucceeded,
    SetupFailed(Arc<AtlasError>),
    /// Explicit close or unbind; never followed by an automatic reconnect
    CloseRequested,
    /// Peer closed the stream (`None`) or the stream failed
    ConnectionLost(Option<Arc<AtlasError>>),
    /// Pending requests drained and socket released
    TornDown,
    RetryElapsed,
    Destroy,
}

/// Work for the supervisor
#[derive(Debug, Clone)]
pub enum Action {
    Connect,
    ScheduleRetry(Duration),
    CancelRetry,
    RunSetup,
    /// Expose the connection and flush queued requests
    Ready,
    /// Drain the pending table and release the socket
    Teardown,
    /// Fail requests queued while disconnected
    FailQueued,
    Notify(Notification),
    /// The supervisor should exit
    Stop,
}

/// What follows once a closing connection is torn down
#[derive(Debug, Clone)]
enum AfterClose {
    Reconnect,
    Dormant,
    Fatal(Arc<AtlasError>),
}

/// The connection lifecycle
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    reconnect: ReconnectPolicy,
    setup_failure: SetupFailurePolicy,
    has_setup: bool,
    attempts: u32,
    after_close: AfterClose,
    had_error: bool,
    retry_pending: bool,
    terminal: bool,
}

impl StateMachine {
    pub fn new(
        reconnect: ReconnectPolicy,
        setup_failure: SetupFailurePolicy,
        has_setup: bool,
    ) -> Self {
        Self {
            state: ConnectionState::Idle,
            reconnect,
            setup_failure,
            has_setup,
            attempts: 0,
            after_close: AfterClose::Dormant,
            had_error: false,
            retry_pending: false,
            terminal: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Closed for good: new requests fail with `NotConnected`
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Consecutive failed attempts since the last usable connection
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        use ConnectionState::*;

        if let Event::Destroy = event {
            return self.destroy();
        }
        if self.terminal {
            return Vec::new();
        }

        match (self.state, event) {
            (Idle, Event::Open) | (Closed, Event::Open) => {
                self.state = Connecting;
                vec![Action::Connect]
            }

            (Connecting, Event::RetryElapsed) if self.retry_pending => {
                self.retry_pending = false;
                vec![Action::Connect]
            }

            (Connecting, Event::ConnectSucceeded) => {
                if self.has_setup {
                    self.state = Binding;
                    vec![Action::Notify(Notification::Setup), Action::RunSetup]
                } else {
                    self.become_ready()
                }
            }

            (Connecting, Event::ConnectFailed(error)) => self.connect_failed(error),

            (Binding, Event::SetupSucceeded) => self.become_ready(),

            (Binding, Event::SetupFailed(error)) => self.setup_failed(error),

            (Connected, Event::CloseRequested) | (Binding, Event::CloseRequested) => {
                self.state = Closing;
                self.had_error = false;
                self.after_close = AfterClose::Dormant;
                vec![Action::Teardown]
            }

            (Connecting, Event::CloseRequested) => {
                self.retry_pending = false;
                self.state = Closed;
                self.terminal = !self.reconnect.is_enabled();
                vec![
                    Action::CancelRetry,
                    Action::FailQueued,
                    Action::Notify(Notification::Close { had_error: false }),
                ]
            }

            (Connected, Event::ConnectionLost(error)) | (Binding, Event::ConnectionLost(error)) => {
                self.connection_lost(error)
            }

            (Closing, Event::TornDown) => self.torn_down(),

            (state, event) => {
                tracing::trace!(?state, ?event, "event ignored");
                Vec::new()
            }
        }
    }

    fn become_ready(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        vec![Action::Ready, Action::Notify(Notification::Connect)]
    }

    fn connect_failed(&mut self, error: Arc<AtlasError>) -> Vec<Action> {
        self.attempts = self.attempts.saturating_add(1);
        let mut actions = vec![Action::Notify(Notification::ConnectError(error.clone()))];

        if self.reconnect.allows_retry(self.attempts) {
            self.retry_pending = true;
            actions.push(Action::ScheduleRetry(self.reconnect.delay(self.attempts - 1)));
            return actions;
        }

        let fatal = if self.reconnect.is_enabled() {
            Arc::new(AtlasError::ReconnectExhausted {
                attempts: self.attempts,
            })
        } else {
            error
        };
        self.state = ConnectionState::Closed;
        self.terminal = true;
        actions.push(Action::FailQueued);
        actions.push(Action::Notify(Notification::Error {
            error: fatal,
            fatal: true,
        }));
        actions
    }

    fn setup_failed(&mut self, error: Arc<AtlasError>) -> Vec<Action> {
        self.state = ConnectionState::Closing;
        self.had_error = true;
        self.after_close = match self.setup_failure {
            SetupFailurePolicy::Fatal => AfterClose::Fatal(error.clone()),
            SetupFailurePolicy::Retry {
                counts_toward_budget,
            } => {
                if counts_toward_budget {
                    self.attempts = self.attempts.saturating_add(1);
                }
                if self.reconnect.allows_retry(self.attempts) {
                    AfterClose::Reconnect
                } else if self.reconnect.is_enabled() {
                    AfterClose::Fatal(Arc::new(AtlasError::ReconnectExhausted {
                        attempts: self.attempts,
                    }))
                } else {
                    AfterClose::Fatal(error.clone())
                }
            }
        };
        vec![
            Action::Notify(Notification::SetupError(error)),
            Action::Teardown,
        ]
    }

    fn connection_lost(&mut self, error: Option<Arc<AtlasError>>) -> Vec<Action> {
        self.state = ConnectionState::Closing;
        self.had_error = error.is_some();

        let mut actions = Vec::new();
        if self.reconnect.is_enabled() {
            self.after_close = AfterClose::Reconnect;
            if let Some(error) = error {
                actions.push(Action::Notify(Notification::Error {
                    error,
                    fatal: false,
                }));
            }
        } else {
            let error = error.unwrap_or_else(|| Arc::new(AtlasError::ConnectionClosed));
            self.after_close = AfterClose::Fatal(error);
        }
        actions.push(Action::Teardown);
        actions
    }

    fn torn_down(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Closed;
        let mut actions = vec![Action::Notify(Notification::Close {
            had_error: self.had_error,
        })];

        match std::mem::replace(&mut self.after_close, AfterClose::Dormant) {
            AfterClose::Reconnect => {
                self.state = ConnectionState::Connecting;
                self.retry_pending = true;
                actions.push(Action::ScheduleRetry(self.reconnect.delay(self.attempts)));
            }
            AfterClose::Dormant => {
                // Without a reconnect policy nothing can reopen the client
                self.terminal = !self.reconnect.is_enabled();
                if self.terminal {
                    actions.push(Action::FailQueued);
                }
            }
            AfterClose::Fatal(error) => {
                self.terminal = true;
                actions.push(Action::FailQueued);
                actions.push(Action::Notify(Notification::Error { error, fatal: true }));
            }
        }
        actions
    }

    fn destroy(&mut self) -> Vec<Action> {
        let was_open = matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Binding | ConnectionState::Closing
        );
        self.state = ConnectionState::Closed;
        self.retry_pending = false;
        self.terminal = true;

        let mut actions = vec![Action::CancelRetry];
        if was_open {
            actions.push(Action::Teardown);
            actions.push(Action::Notify(Notification::Close { had_error: false }));
        }
        actions.push(Action::FailQueued);
        actions.push(Action::Notify(Notification::Destroy));
        actions.push(Action::Stop);
        actions
    }
}
