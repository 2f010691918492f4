//! TCP plumbing: the listening socket and per-connection sessions.

pub mod session;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tracing::{info, warn};

use crate::error::PilotError;

pub use session::{ReadEvent, Session, SessionInfo, SessionSender};

fn try_bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(16)
}

/// Bind with `SO_REUSEADDR`. On failure wait `retry_after` for the port to
/// free up and try exactly once more.
pub async fn bind_listener(addr: SocketAddr, retry_after: Duration) -> Result<TcpListener, PilotError> {
    match try_bind(addr) {
        Ok(listener) => Ok(listener),
        Err(first) => {
            warn!(%addr, "bind failed ({first}); retrying in {retry_after:?}");
            tokio::time::sleep(retry_after).await;
            let listener = try_bind(addr)?;
            info!(%addr, "bound on second attempt");
            Ok(listener)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), Duration::from_millis(1))
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn occupied_port_fails_after_retry() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = held.local_addr().unwrap();
        let result = bind_listener(addr, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(PilotError::Connection(_))));
    }
}
