//! The seam between the core and a concrete wire transport.
//!
//! The core never frames bytes or negotiates TLS. It asks a [`Connector`]
//! to establish a [`Connection`] to one address, watches the connection's
//! [`ConnectionEvent`]s, and opens bidirectional streams on it. Everything
//! below that line belongs to the transport implementation.

use crate::Result;
use std::future::Future;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Names the target of a stream: one method of one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    service: String,
    method: String,
}

impl MethodDescriptor {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request path, e.g. `/echo.Echo/Collect`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// Per-stream options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Whether the executor may replay this stream's request parts to
    /// additional attempts (retries, hedging).
    pub safe_to_retry: bool,
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection sat idle past the transport's idle timeout.
    IdleTimeout,
    /// The peer stopped answering keepalive pings.
    KeepaliveTimeout,
    /// An error tore the connection down. `was_idle` records whether any
    /// stream was in flight, which decides how the subchannel reports it.
    Error { was_idle: bool },
    /// This side closed the connection deliberately.
    InitiatedLocally,
    /// The peer closed the connection.
    Remote,
}

/// Events a connection reports to the subchannel owning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The handshake completed; streams can be opened.
    ConnectSucceeded,
    /// The handshake failed.
    ConnectFailed,
    /// The peer announced it will stop serving new streams (e.g. a GOAWAY
    /// frame); in-flight streams keep running.
    GoingAway,
    /// The connection is gone.
    Closed(CloseReason),
}

/// Establishes connections to individual addresses.
///
/// Implementations typically spawn whatever task drives the connection's
/// I/O before returning; the returned receiver is how that task reports
/// handshake completion, GOAWAY and closure back to the subchannel.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    /// Attempts a connection to `address`.
    ///
    /// An `Err` counts as an immediate connect failure; handshakes that
    /// fail asynchronously report [`ConnectionEvent::ConnectFailed`] on the
    /// returned channel instead.
    fn establish(
        &self,
        address: SocketAddr,
    ) -> impl Future<Output = Result<(Self::Conn, mpsc::UnboundedReceiver<ConnectionEvent>)>> + Send;
}

/// One live connection to one address.
pub trait Connection: Send + 'static {
    type Stream: Send + 'static;

    /// Opens a bidirectional stream.
    ///
    /// # Errors
    ///
    /// [`Error::FailedPrecondition`] if the connection no longer accepts
    /// streams.
    fn make_stream(
        &mut self,
        descriptor: &MethodDescriptor,
        options: &StreamOptions,
    ) -> Result<Self::Stream>;

    /// Starts closing the connection. Closure is confirmed by a
    /// [`ConnectionEvent::Closed`] event, not by this call returning.
    fn close(&mut self);
}
