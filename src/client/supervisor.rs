//! Supervisor
//!
//! The single scheduler thread of a client. It owns the state machine and
//! the live connection, and waits on four inputs at once:
//!
//! ```text
//!   control (open / close / destroy) ─┐
//!   connection events (lost, unsolicited) ─┤
//!   retry timer ─┼──► select! ──► StateMachine::handle ──► actions
//!   sweep tick (timeouts, idle) ─┘
//! ```
//!
//! Actions that have an outcome (connect, setup, teardown) feed it back as
//! the next event, so one input is processed to quiescence before the next
//! is taken.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{after, never, select, tick, Receiver, Sender};
use parking_lot::Mutex;

use super::connection::{Connection, ConnectionEvent};
use super::facade::{Session, SetupHook};
use super::notification::{Notification, Notifier};
use super::ops::Ticket;
use super::pending::ResultSink;
use super::state::{Action, ConnectionState, Event, StateMachine};
use super::transport::Transport;
use crate::config::ClientConfig;
use crate::error::AtlasError;
use crate::protocol::Request;

/// Requests from the client handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Open,
    Close,
    Destroy,
}

/// A request waiting for a usable connection
pub(crate) struct Queued {
    pub request: Request,
    pub sink: ResultSink,
    pub ticket: Ticket,
}

/// State visible to client handles
pub(crate) struct Shared {
    pub state: ConnectionState,
    pub terminal: bool,
    /// Set only while the connection is usable
    pub connection: Option<Arc<Connection>>,
    pub queue: VecDeque<Queued>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            terminal: false,
            connection: None,
            queue: VecDeque::new(),
        }
    }
}

pub(crate) struct Supervisor {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    setup: Option<SetupHook>,
    machine: StateMachine,
    shared: Arc<Mutex<Shared>>,
    notifier: Arc<Notifier>,
    control: Receiver<Control>,
    events_tx: Sender<ConnectionEvent>,
    events_rx: Receiver<ConnectionEvent>,
    /// The current connection, including while setup runs
    connection: Option<Arc<Connection>>,
    generation: u64,
    retry: Option<Receiver<Instant>>,
    running: bool,
}

impl Supervisor {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        setup: Option<SetupHook>,
        shared: Arc<Mutex<Shared>>,
        notifier: Arc<Notifier>,
        control: Receiver<Control>,
    ) -> Self {
        let machine = StateMachine::new(config.reconnect, config.setup_failure, setup.is_some());
        let (events_tx, events_rx) = crossbeam::channel::unbounded();
        Self {
            config,
            transport,
            setup,
            machine,
            shared,
            notifier,
            control,
            events_tx,
            events_rx,
            connection: None,
            generation: 0,
            retry: None,
            running: true,
        }
    }

    pub fn run(mut self) {
        let span = tracing::debug_span!("supervisor", peer = %self.transport.describe());
        let _enter = span.enter();

        let ticker = tick(self.config.sweep_interval);
        let control = self.control.clone();
        let events = self.events_rx.clone();

        while self.running {
            let retry = self.retry.clone().unwrap_or_else(never);
            select! {
                recv(control) -> msg => match msg {
                    Ok(Control::Open) => self.process(Event::Open),
                    Ok(Control::Close) => self.process(Event::CloseRequested),
                    // Every handle is gone
                    Ok(Control::Destroy) | Err(_) => self.process(Event::Destroy),
                },
                recv(events) -> msg => {
                    if let Ok(event) = msg {
                        self.on_connection_event(event);
                    }
                }
                recv(retry) -> _ => {
                    self.retry = None;
                    self.process(Event::RetryElapsed);
                }
                recv(ticker) -> _ => self.on_tick(),
            }
        }
        tracing::debug!("supervisor stopped");
    }

    /// Run an event and everything it triggers
    fn process(&mut self, event: Event) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let before = self.machine.state();
            let actions = self.machine.handle(event);
            self.publish();
            if before != self.machine.state() {
                tracing::debug!(from = ?before, to = ?self.machine.state(), "state change");
            }
            for action in actions {
                if let Some(next) = self.execute(action) {
                    events.push_back(next);
                }
            }
        }

        // Requests queued while the connection was going down
        let reopen = self.machine.state() == ConnectionState::Closed
            && !self.machine.is_terminal()
            && !self.shared.lock().queue.is_empty();
        if reopen {
            self.process(Event::Open);
        }
    }

    fn publish(&self) {
        let mut shared = self.shared.lock();
        shared.state = self.machine.state();
        shared.terminal = self.machine.is_terminal();
    }

    fn execute(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::Connect => Some(self.connect()),
            Action::ScheduleRetry(delay) => {
                tracing::debug!(?delay, attempts = self.machine.attempts(), "reconnect scheduled");
                self.retry = Some(after(delay));
                None
            }
            Action::CancelRetry => {
                self.retry = None;
                None
            }
            Action::RunSetup => Some(self.run_setup()),
            Action::Ready => {
                self.ready();
                None
            }
            Action::Teardown => {
                self.shared.lock().connection = None;
                if let Some(connection) = self.connection.take() {
                    connection.teardown();
                }
                Some(Event::TornDown)
            }
            Action::FailQueued => {
                let queued: Vec<Queued> = self.shared.lock().queue.drain(..).collect();
                if !queued.is_empty() {
                    tracing::debug!(count = queued.len(), "failing queued requests");
                }
                for item in queued {
                    item.sink.fail(AtlasError::NotConnected);
                }
                None
            }
            Action::Notify(notification) => {
                self.notifier.emit(notification);
                None
            }
            Action::Stop => {
                self.running = false;
                None
            }
        }
    }

    fn connect(&mut self) -> Event {
        self.generation += 1;
        let opened = self
            .transport
            .connect(self.config.connect_timeout)
            .and_then(|stream| {
                Connection::open(
                    self.generation,
                    stream,
                    self.config.timeout,
                    self.events_tx.clone(),
                )
            });

        match opened {
            Ok(connection) => {
                tracing::info!(peer = %connection.peer(), generation = self.generation, "connected");
                self.connection = Some(connection);
                Event::ConnectSucceeded
            }
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                Event::ConnectFailed(Arc::new(e))
            }
        }
    }

    fn run_setup(&mut self) -> Event {
        let (Some(connection), Some(hook)) = (self.connection.clone(), self.setup.clone()) else {
            return Event::SetupSucceeded;
        };

        let session = Session::new(Arc::clone(&connection), self.config.timeout);
        match hook(&session) {
            Ok(()) => Event::SetupSucceeded,
            Err(e) if connection.is_lost() => {
                tracing::debug!(error = %e, "connection lost during setup");
                Event::ConnectionLost(Some(Arc::new(e)))
            }
            Err(e) => {
                tracing::warn!(error = %e, "setup rejected");
                Event::SetupFailed(Arc::new(AtlasError::SetupFailure(Box::new(e))))
            }
        }
    }

    /// Expose the connection and flush queued requests in order
    fn ready(&mut self) {
        let Some(connection) = self.connection.clone() else {
            return;
        };

        let mut shared = self.shared.lock();
        shared.connection = Some(Arc::clone(&connection));
        let mut flushed = 0;
        while let Some(item) = shared.queue.pop_front() {
            match connection.try_submit(&item.request, item.sink) {
                Ok(id) => {
                    item.ticket.set(id);
                    flushed += 1;
                }
                Err((Some(sink), e))
                    if e.is_transport() || matches!(e, AtlasError::ConnectionClosed) =>
                {
                    // Kept for the next connection; the loss event reopens
                    let remaining = shared.queue.len() + 1;
                    tracing::debug!(error = %e, remaining, "connection lost during flush");
                    shared.queue.push_front(Queued {
                        request: item.request,
                        sink,
                        ticket: item.ticket,
                    });
                    break;
                }
                Err((Some(sink), e)) => {
                    tracing::warn!(error = %e, "queued request not sent");
                    sink.fail(e);
                }
                Err((None, e)) => tracing::warn!(error = %e, "queued request not sent"),
            }
        }
        if flushed > 0 {
            tracing::debug!(flushed, "queued requests sent");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.generation() == generation)
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Closed { generation, error } => {
                if self.is_current(generation) {
                    let requested = self
                        .connection
                        .as_ref()
                        .is_some_and(|connection| connection.is_closing());
                    if requested {
                        self.process(Event::CloseRequested);
                    } else {
                        self.process(Event::ConnectionLost(error));
                    }
                } else {
                    tracing::trace!(generation, "close of a retired connection");
                }
            }
            ConnectionEvent::Unsolicited {
                generation,
                envelope,
            } => {
                if self.is_current(generation) {
                    self.notifier.emit(Notification::Unsolicited {
                        id: envelope.id,
                        op: envelope.op,
                    });
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let Some(connection) = self.connection.clone() else {
            return;
        };
        let now = Instant::now();
        connection.sweep(now);

        if let Some(idle) = self.config.idle_timeout {
            if self.machine.state() == ConnectionState::Connected && connection.idle_check(idle, now)
            {
                tracing::debug!(?idle, "connection idle");
                self.notifier.emit(Notification::Idle);
            }
        }
    }
}
