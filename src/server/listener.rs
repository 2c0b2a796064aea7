//! Directory server
//!
//! Accepts connections on a TCP address or a Unix socket and hands each
//! to its own thread.
//!
//! ## Architecture
//! - Single acceptor thread
//! - One reader thread per connection
//! - One thread per in-flight request, routed through the shared [`Router`]

use std::collections::HashMap;
use std::io;
use std::net::{TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::connection::ServerConnection;
use super::response::Outbound;
use super::router::Router;
use crate::client::Stream;
use crate::config::{Address, ServerConfig};
use crate::error::{AtlasError, Result};
use crate::protocol::{Envelope, ExtendedResponse, LdapResult, MessageId, OpCode, Reply, ResultCode};

/// OID of the unsolicited notice sent before the server hangs up
pub const NOTICE_OF_DISCONNECTION: &str = "1.3.6.1.4.1.1466.20036";

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    fn bind(address: &Address) -> Result<Self> {
        match address {
            Address::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr.as_str())?)),
            #[cfg(unix)]
            Address::Unix(path) => {
                // A socket file left behind by a previous run
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(Listener::Unix(UnixListener::bind(path)?, path.clone()))
            }
            #[cfg(not(unix))]
            Address::Unix(path) => Err(AtlasError::Config(format!(
                "unix sockets are not supported here: {}",
                path.display()
            ))),
        }
    }

    fn local_address(&self) -> Result<Address> {
        match self {
            Listener::Tcp(listener) => Ok(Address::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Listener::Unix(_, path) => Ok(Address::Unix(path.clone())),
        }
    }

    fn accept(&self) -> io::Result<Box<dyn Stream>> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                // Disable Nagle's algorithm for low latency
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Listener::Unix(listener, _) => {
                let (stream, _) = listener.accept()?;
                Ok(Box::new(stream))
            }
        }
    }

    fn cleanup(&self) {
        match self {
            Listener::Tcp(_) => {}
            #[cfg(unix)]
            Listener::Unix(_, path) => {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::debug!(path = %path.display(), error = %e, "socket file not removed");
                }
            }
        }
    }

    /// Unblock a pending accept by connecting to ourselves
    fn wake(address: &Address) {
        let woken = match address {
            Address::Tcp(addr) => TcpStream::connect(addr.as_str()).map(|_| ()),
            #[cfg(unix)]
            Address::Unix(path) => UnixStream::connect(path).map(|_| ()),
            #[cfg(not(unix))]
            Address::Unix(_) => Ok(()),
        };
        if let Err(e) = woken {
            tracing::trace!(error = %e, "accept wake-up failed");
        }
    }
}

/// Live connections, by sequence number
type Connections = Arc<Mutex<HashMap<u64, Arc<Outbound>>>>;

/// Directory server
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
}

impl Server {
    pub fn new(config: ServerConfig, router: Router) -> Self {
        Self {
            config,
            router: Arc::new(router),
        }
    }

    /// Bind and start accepting in the background
    pub fn start(self) -> Result<ServerHandle> {
        let listener = Listener::bind(&self.config.listen)?;
        let local = listener.local_address()?;
        tracing::info!("Listening on {}", local);

        let shutdown = Arc::new(AtomicBool::new(false));
        let connections: Connections = Arc::new(Mutex::new(HashMap::new()));

        let acceptor = Acceptor {
            listener,
            config: self.config,
            router: self.router,
            shutdown: Arc::clone(&shutdown),
            connections: Arc::clone(&connections),
            active: Arc::new(AtomicUsize::new(0)),
            sequence: AtomicU64::new(0),
        };
        let thread = thread::Builder::new()
            .name("atlasdir-acceptor".to_string())
            .spawn(move || acceptor.run())?;

        Ok(ServerHandle {
            local,
            shutdown,
            connections,
            thread: Some(thread),
        })
    }

    /// Serve until the acceptor stops (blocking)
    pub fn run(self) -> Result<()> {
        let mut handle = self.start()?;
        handle.join();
        Ok(())
    }
}

struct Acceptor {
    listener: Listener,
    config: ServerConfig,
    router: Arc<Router>,
    shutdown: Arc<AtomicBool>,
    connections: Connections,
    active: Arc<AtomicUsize>,
    sequence: AtomicU64,
}

impl Acceptor {
    fn run(self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let stream = match self.listener.accept() {
                Ok(stream) => stream,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            };
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if self.active.load(Ordering::SeqCst) >= self.config.max_connections {
                tracing::warn!(
                    "Connection limit of {} reached, refusing {}",
                    self.config.max_connections,
                    stream.peer()
                );
                continue;
            }

            if let Err(e) = self.spawn_connection(stream) {
                tracing::warn!("Could not start connection: {}", e);
            }
        }

        self.listener.cleanup();
        tracing::debug!("Acceptor stopped");
    }

    fn spawn_connection(&self, stream: Box<dyn Stream>) -> Result<()> {
        stream.set_stream_read_timeout(self.config.read_timeout)?;
        let mut connection = ServerConnection::new(stream, Arc::clone(&self.router))?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.connections.lock().insert(seq, connection.outbound());
        self.active.fetch_add(1, Ordering::SeqCst);

        let connections = Arc::clone(&self.connections);
        let active = Arc::clone(&self.active);
        let spawned = thread::Builder::new()
            .name(format!("atlasdir-conn-{}", seq))
            .spawn(move || {
                if let Err(e) = connection.handle() {
                    tracing::debug!("Connection {} ended with error: {}", seq, e);
                }
                connections.lock().remove(&seq);
                active.fetch_sub(1, Ordering::SeqCst);
            });

        if let Err(e) = spawned {
            if let Some(outbound) = self.connections.lock().remove(&seq) {
                outbound.shutdown();
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(AtlasError::Io(e));
        }
        Ok(())
    }
}

/// Handle to a running server
pub struct ServerHandle {
    local: Address,
    shutdown: Arc<AtomicBool>,
    connections: Connections,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The bound address (with the real port when 0 was requested)
    pub fn local_address(&self) -> &Address {
        &self.local
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Send a notice of disconnection to every client and hang up
    pub fn disconnect_all(&self) {
        let live: Vec<Arc<Outbound>> = self.connections.lock().values().cloned().collect();
        for outbound in live {
            if let Err(e) = send_disconnect_notice(&outbound) {
                tracing::debug!(peer = %outbound.peer(), error = %e, "notice not delivered");
            }
            outbound.shutdown();
        }
    }

    /// Stop accepting, disconnect every client and wait for the acceptor
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down server on {}", self.local);
        Listener::wake(&self.local);
        self.disconnect_all();
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("acceptor thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_disconnect_notice(outbound: &Outbound) -> Result<()> {
    let reply = Reply::Extended(ExtendedResponse {
        result: LdapResult::new(ResultCode::Unavailable, "server is shutting down"),
        name: Some(NOTICE_OF_DISCONNECTION.to_string()),
        value: None,
    });
    outbound.send(&Envelope::new(
        MessageId::UNSOLICITED,
        OpCode::ExtendedResponse,
        reply.encode()?,
    ))
}
