/// Stateful UDP relay between SIP endpoints and the upstream server
///
/// Pure byte forwarding: each observed client source address gets its
/// own upstream socket, and traffic flows both ways unmodified. Inbound
/// datagrams are additionally parsed so INVITEs show up as call
/// observations, which makes the relay a useful diagnostic tap in front
/// of a PBX. Recording is optional; without a sink the relay only logs.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sink::CallSink;
use crate::sip::codec::{self, SipMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

pub struct UdpRelay {
    proxy: Arc<UdpSocket>,
    upstream: String,
    sink: Option<Arc<dyn CallSink>>,
}

impl UdpRelay {
    pub async fn bind(
        listen: SocketAddr,
        upstream: String,
        sink: Option<Arc<dyn CallSink>>,
    ) -> Result<Self> {
        let proxy = Arc::new(
            UdpSocket::bind(listen)
                .await
                .with_context(|| format!("failed to bind relay socket on {}", listen))?,
        );
        info!(
            "UDP relay listening on {}, upstream {}",
            proxy.local_addr().context("failed to get relay address")?,
            upstream
        );
        Ok(Self {
            proxy,
            upstream,
            sink,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.proxy.local_addr().context("failed to get relay address")
    }

    /// Relay until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let proxy = self.proxy.clone();
        let mut remotes: HashMap<SocketAddr, Arc<UdpSocket>> = HashMap::new();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let mut buf = vec![0u8; 65_535];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(addr) = closed_rx.recv() => {
                    remotes.remove(&addr);
                    debug!("dropped upstream mapping for {}", addr);
                }
                result = proxy.recv_from(&mut buf) => {
                    let (len, addr) = match result {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("relay socket receive error: {}", e);
                            continue;
                        }
                    };
                    let data = &buf[..len];
                    log_direction(Direction::Outbound, data);

                    let remote = match remotes.get(&addr) {
                        Some(remote) => remote.clone(),
                        None => {
                            match self
                                .open_remote(addr, proxy.clone(), closed_tx.clone(), cancel.child_token())
                                .await
                            {
                                Ok(remote) => {
                                    remotes.insert(addr, remote.clone());
                                    remote
                                }
                                Err(e) => {
                                    warn!("failed to open upstream socket for {}: {:#}", addr, e);
                                    continue;
                                }
                            }
                        }
                    };
                    if let Err(e) = remote.send(data).await {
                        warn!("forward to upstream for {} failed: {}", addr, e);
                        remotes.remove(&addr);
                    }
                }
            }
        }
        info!("UDP relay stopped");
        Ok(())
    }

    async fn open_remote(
        &self,
        client_addr: SocketAddr,
        proxy: Arc<UdpSocket>,
        closed_tx: mpsc::UnboundedSender<SocketAddr>,
        cancel: CancellationToken,
    ) -> Result<Arc<UdpSocket>> {
        let remote = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind upstream socket")?;
        remote
            .connect(&self.upstream)
            .await
            .with_context(|| format!("failed to connect upstream socket to {}", self.upstream))?;
        let remote = Arc::new(remote);
        debug!(
            "new client {}, upstream endpoint {}",
            client_addr,
            remote.local_addr().context("failed to get upstream address")?
        );

        let sink = self.sink.clone();
        tokio::spawn(remote_loop(
            remote.clone(),
            proxy,
            client_addr,
            sink,
            closed_tx,
            cancel,
        ));
        Ok(remote)
    }
}

/// Pump one upstream socket back to its client until it dies.
async fn remote_loop(
    remote: Arc<UdpSocket>,
    proxy: Arc<UdpSocket>,
    client_addr: SocketAddr,
    sink: Option<Arc<dyn CallSink>>,
    closed_tx: mpsc::UnboundedSender<SocketAddr>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 65_535];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = remote.recv(&mut buf) => {
                let len = match result {
                    Ok(len) => len,
                    Err(e) => {
                        warn!("upstream receive error for {}: {}", client_addr, e);
                        break;
                    }
                };
                let data = &buf[..len];
                log_direction(Direction::Inbound, data);
                observe_invite(data, sink.as_deref());
                if let Err(e) = proxy.send_to(data, client_addr).await {
                    warn!("forward to client {} failed: {}", client_addr, e);
                    break;
                }
            }
        }
    }
    let _ = closed_tx.send(client_addr);
}

/// Surface INVITEs passing through the relay as call observations.
/// No dedup here: every retransmit is forwarded anyway, and the
/// recording side owns duplicate suppression.
fn observe_invite(data: &[u8], sink: Option<&dyn CallSink>) {
    if codec::is_keepalive(data) {
        return;
    }
    let Ok(SipMessage::Request { method, headers, .. }) = SipMessage::parse(data) else {
        return;
    };
    if method != "INVITE" {
        return;
    }

    let from = headers.get("From").unwrap_or_default();
    let number = codec::caller_number(&from).unwrap_or_else(|| {
        warn!("unable to find number in {:?}", from);
        "unknown".to_string()
    });
    let brand = headers.get("X-Brand");
    match &brand {
        Some(brand) => info!("relayed call from {} ({})", number, brand),
        None => info!("relayed call from {}", number),
    }
    if let Some(sink) = sink {
        sink.record_call(&number, brand.as_deref());
    }
}

fn log_direction(direction: Direction, data: &[u8]) {
    let arrow = match direction {
        Direction::Inbound => '▼',
        Direction::Outbound => '▲',
    };
    debug!("{} {}", arrow, codec::first_line(data));
}
