/// SIP UDP Transport Layer
///
/// Owns one socket connected to the registrar. Inbound datagrams are
/// handed to a callback on a reader task; sending is on demand. Kernel
/// errors (port unreachable, connection refused surfaced via ICMP) are
/// logged and the socket stays usable; it is the registration
/// controller's job to re-cycle a transport that has gone bad.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Overall budget for bind + connect
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SipTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    reader: JoinHandle<()>,
}

impl SipTransport {
    /// Open a transport to `server`, delivering every inbound datagram
    /// to `on_datagram` until the transport is closed.
    pub async fn open<F>(server: &str, mut on_datagram: F) -> Result<Self>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let socket = timeout(OPEN_TIMEOUT, async {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .context("failed to bind SIP socket")?;
            socket
                .connect(server)
                .await
                .with_context(|| format!("failed to connect SIP socket to {}", server))?;
            Ok::<_, anyhow::Error>(socket)
        })
        .await
        .with_context(|| format!("timed out opening SIP socket to {}", server))??;

        let socket = Arc::new(socket);
        let local_addr = socket.local_addr().context("failed to get local address")?;
        debug!("SIP transport bound to {}", local_addr);

        let reader_socket = socket.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match reader_socket.recv(&mut buf).await {
                    Ok(len) => on_datagram(&buf[..len]),
                    // ICMP errors surface here on a connected socket
                    Err(e) => warn!("socket receive error: {}", e),
                }
            }
        });

        Ok(Self {
            socket,
            local_addr,
            reader,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram to the connected registrar.
    pub async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        trace!("sending {} bytes", data.len());
        self.socket.send(data).await?;
        Ok(())
    }

    /// Stop the reader task. Pending response slots held by the caller
    /// are dropped by the caller, not here.
    pub fn close(&self) {
        self.reader.abort();
    }
}

impl Drop for SipTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
