//! Client façade
//!
//! A `Client` is a cheap handle to one supervised connection. It stays the
//! same object across reconnects; requests issued while no connection is
//! usable are queued until one is.
//!
//! ```no_run
//! use atlasdir::client::{Client, Operations};
//! use atlasdir::config::ClientConfig;
//! use atlasdir::protocol::SearchRequest;
//!
//! let config = ClientConfig::builder()
//!     .tcp("127.0.0.1:1389")
//!     .bind_credentials("cn=root", "secret")
//!     .reconnect(true)
//!     .build();
//! let client = Client::connect(config)?;
//!
//! for event in client.search(SearchRequest::new("dc=example", "(objectclass=*)"))? {
//!     println!("{:?}", event);
//! }
//! # Ok::<(), atlasdir::AtlasError>(())
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use super::connection::Connection;
use super::notification::{Notification, Notifier};
use super::ops::{sink_for, Operations, PendingReply, RequestKind, Ticket};
use super::state::ConnectionState;
use super::supervisor::{Control, Queued, Shared, Supervisor};
use super::transport::{SocketTransport, Transport};
use crate::config::ClientConfig;
use crate::error::{AtlasError, Result};
use crate::protocol::{MessageId, Request};

/// Post-connect handshake, run before a connection is used
///
/// An error rejects the connection; what follows depends on the
/// configured [`SetupFailurePolicy`](crate::config::SetupFailurePolicy).
pub type SetupHook = Arc<dyn Fn(&Session) -> Result<()> + Send + Sync>;

/// A connection that is still being set up
///
/// Handed to setup hooks; requests go straight to the wire.
pub struct Session {
    connection: Arc<Connection>,
    timeout: Option<Duration>,
}

impl Session {
    pub(crate) fn new(connection: Arc<Connection>, timeout: Option<Duration>) -> Self {
        Self {
            connection,
            timeout,
        }
    }

    pub fn peer(&self) -> &str {
        self.connection.peer()
    }
}

impl Operations for Session {
    fn submit(&self, request: Request, kind: RequestKind) -> Result<PendingReply> {
        let (sink, rx) = sink_for(kind);
        let ticket = Ticket::new();
        ticket.set(self.connection.submit(&request, sink)?);
        Ok(PendingReply::new(rx, ticket).with_timeout(self.timeout))
    }
}

/// Builder for a [`Client`]
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    setup: Option<SetupHook>,
    notifier: Arc<Notifier>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            setup: None,
            notifier: Arc::new(Notifier::new()),
        }
    }

    /// Use a custom transport instead of the configured address
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Run `hook` on every fresh connection before it is used
    ///
    /// With bind credentials configured, the bind runs first.
    pub fn setup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Session) -> Result<()> + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(hook));
        self
    }

    /// Receive notifications from the very first connect attempt
    pub fn subscribe(&self) -> Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Start the supervisor and begin connecting
    pub fn start(self) -> Result<Client> {
        if self.config.sweep_interval.is_zero() {
            return Err(AtlasError::Config("sweep interval must be positive".to_string()));
        }

        let setup = match (self.config.bind_dn.clone(), self.setup) {
            (Some(dn), custom) => {
                let password = self.config.bind_credentials.clone().unwrap_or_default();
                let hook: SetupHook = Arc::new(move |session: &Session| {
                    session.bind(&dn, &password)?;
                    match &custom {
                        Some(custom) => custom(session),
                        None => Ok(()),
                    }
                });
                Some(hook)
            }
            (None, custom) => custom,
        };

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(SocketTransport::new(self.config.address.clone())));
        let shared = Arc::new(Mutex::new(Shared::new()));
        let (control_tx, control_rx) = unbounded();

        let supervisor = Supervisor::new(
            self.config,
            transport,
            setup,
            Arc::clone(&shared),
            Arc::clone(&self.notifier),
            control_rx,
        );
        let handle = thread::Builder::new()
            .name("atlasdir-supervisor".to_string())
            .spawn(move || supervisor.run())?;

        // Sending cannot fail: the supervisor holds the receiver until Stop
        let _ = control_tx.send(Control::Open);

        Ok(Client {
            inner: Arc::new(ClientInner {
                shared,
                notifier: self.notifier,
                control: control_tx,
                supervisor: Mutex::new(Some(handle)),
            }),
        })
    }
}

struct ClientInner {
    shared: Arc<Mutex<Shared>>,
    notifier: Arc<Notifier>,
    control: Sender<Control>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Destroy);
    }
}

/// Handle to a supervised directory connection
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect with the default socket transport and no custom setup
    pub fn connect(config: ClientConfig) -> Result<Client> {
        ClientBuilder::new(config).start()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// True while requests go straight to a live connection
    pub fn is_connected(&self) -> bool {
        let shared = self.inner.shared.lock();
        shared.state == ConnectionState::Connected && shared.connection.is_some()
    }

    pub fn subscribe(&self) -> Receiver<Notification> {
        self.inner.notifier.subscribe()
    }

    /// Requests sent and not yet answered
    pub fn pending_count(&self) -> usize {
        self.connection().map_or(0, |connection| connection.pending_count())
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.shared.lock().connection.clone()
    }

    /// Stop waiting for `id` and ask the server to drop it
    ///
    /// Succeeds whether or not `id` was still pending.
    pub fn abandon(&self, id: MessageId) -> Result<()> {
        let Some(connection) = self.connection() else {
            return Ok(());
        };
        if connection.abandon(id)? {
            tracing::debug!(%id, "request abandoned");
        }
        Ok(())
    }

    /// End the session and close the connection without reconnecting
    ///
    /// With a reconnect policy, a later request connects again.
    pub fn unbind(&self) -> Result<()> {
        if let Some(connection) = self.connection() {
            // The server hangs up after an unbind
            connection.begin_close();
            if let Err(e) = connection.send_oneway(&Request::Unbind) {
                tracing::debug!(error = %e, "unbind not delivered");
            }
        }
        self.close();
        Ok(())
    }

    /// Close the connection; pending requests fail with `ConnectionClosed`
    pub fn close(&self) {
        let _ = self.inner.control.send(Control::Close);
    }

    /// Close for good and wait for the supervisor to exit
    pub fn destroy(&self) {
        let _ = self.inner.control.send(Control::Destroy);
        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("supervisor thread panicked");
            }
        }
    }
}

impl Operations for Client {
    fn submit(&self, request: Request, kind: RequestKind) -> Result<PendingReply> {
        let (mut sink, rx) = sink_for(kind);
        let ticket = Ticket::new();
        let mut tried = None;

        loop {
            let mut shared = self.inner.shared.lock();
            // A connection the reader already gave up on cannot take new work
            let live = shared
                .connection
                .clone()
                .filter(|c| !c.is_lost() && Some(c.generation()) != tried);

            if let Some(connection) = live {
                drop(shared);
                match connection.try_submit(&request, sink) {
                    Ok(id) => {
                        ticket.set(id);
                        return Ok(PendingReply::new(rx, ticket));
                    }
                    Err((Some(unsent), e))
                        if e.is_transport() || matches!(e, AtlasError::ConnectionClosed) =>
                    {
                        tracing::debug!(error = %e, "connection lost before send, request queued");
                        tried = Some(connection.generation());
                        sink = unsent;
                        continue;
                    }
                    Err((_, e)) => return Err(e),
                }
            }
            if shared.terminal {
                return Err(AtlasError::NotConnected);
            }

            tracing::trace!(op = ?request.op(), state = ?shared.state, "request queued");
            shared.queue.push_back(Queued {
                request,
                sink,
                ticket: ticket.clone(),
            });
            drop(shared);

            let _ = self.inner.control.send(Control::Open);
            return Ok(PendingReply::new(rx, ticket));
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("state", &self.state()).finish()
    }
}
