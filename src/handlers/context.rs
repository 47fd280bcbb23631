//! Per-Message Context

use crate::connection::ConnectionHandle;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

/// Execution context handed to a handler alongside its request.
///
/// A fresh context is created for every message. Its cancellation token is
/// a child of the server's shutdown token, so it fires when the server shuts
/// down or when the message's handler timeout (if any) expires. Nothing
/// cancels it otherwise.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    conn: ConnectionHandle,
}

impl Context {
    pub fn new(token: CancellationToken, conn: ConnectionHandle) -> Self {
        Self { token, conn }
    }

    /// The connection the message arrived on.
    pub fn conn(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// The remote peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once this message's work should stop.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
