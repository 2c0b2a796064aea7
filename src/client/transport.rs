//! Transports
//!
//! A transport produces connected byte streams. The socket transport
//! speaks TCP or Unix domain sockets; tests substitute their own to inject
//! failures without a network.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::config::Address;
use crate::error::{AtlasError, Result};

/// A reliable, ordered, bidirectional byte stream
pub trait Stream: Read + Write + Send + 'static {
    /// Another handle to the same stream (used for the reader thread)
    fn try_clone_stream(&self) -> io::Result<Box<dyn Stream>>;

    /// Close both directions, waking any blocked reader
    fn shutdown_stream(&self) -> io::Result<()>;

    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Peer description for logging
    fn peer(&self) -> String;
}

impl Stream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Box<dyn Stream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_stream(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

#[cfg(unix)]
impl Stream for UnixStream {
    fn try_clone_stream(&self) -> io::Result<Box<dyn Stream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_stream(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "unix".to_string())
    }
}

/// Something that can open connections to one peer
pub trait Transport: Send + Sync {
    /// Open a fresh stream, giving up after `timeout` if set
    fn connect(&self, timeout: Option<Duration>) -> Result<Box<dyn Stream>>;

    /// Peer description for logging
    fn describe(&self) -> String;
}

/// TCP / Unix socket transport
#[derive(Debug, Clone)]
pub struct SocketTransport {
    address: Address,
}

impl SocketTransport {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    fn connect_tcp(addr: &str, timeout: Option<Duration>) -> Result<Box<dyn Stream>> {
        let candidates = addr
            .to_socket_addrs()
            .map_err(|e| AtlasError::Transport(format!("resolve {}: {}", addr, e)))?;

        let mut last_error = None;
        for candidate in candidates {
            let attempt = match timeout {
                Some(timeout) if !timeout.is_zero() => {
                    TcpStream::connect_timeout(&candidate, timeout)
                }
                _ => TcpStream::connect(candidate),
            };
            match attempt {
                Ok(stream) => {
                    // Disable Nagle's algorithm for low latency
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(stream));
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(AtlasError::Transport(match last_error {
            Some(e) => format!("connect {}: {}", addr, e),
            None => format!("connect {}: no addresses", addr),
        }))
    }
}

impl Transport for SocketTransport {
    fn connect(&self, timeout: Option<Duration>) -> Result<Box<dyn Stream>> {
        match &self.address {
            Address::Tcp(addr) => Self::connect_tcp(addr, timeout),
            #[cfg(unix)]
            Address::Unix(path) => {
                let stream = UnixStream::connect(path).map_err(|e| {
                    AtlasError::Transport(format!("connect {}: {}", path.display(), e))
                })?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Address::Unix(path) => Err(AtlasError::Config(format!(
                "unix sockets are not supported here: {}",
                path.display()
            ))),
        }
    }

    fn describe(&self) -> String {
        self.address.to_string()
    }
}
