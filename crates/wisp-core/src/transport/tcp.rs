//! TCP transport.
//!
//! Every registered endpoint gets its own listener. The listener address is
//! published through a [`Resolver`] and re-published periodically while the
//! endpoint lives. The dialing side writes an `Open` frame naming itself
//! before anything else.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{BoxedStream, Endpoint, InboundStream, Transport};
use crate::code::EndpointId;
use crate::error::{Error, Result};
use crate::protocol::{self, Frame};

/// Inbound streams queued per endpoint.
const ACCEPT_BACKLOG: usize = 64;

/// Time a dialer gets to send its `Open` frame.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maps endpoint ids to socket addresses.
pub trait Resolver: Send + Sync + 'static {
    /// Announce that `id` is reachable at `addr`.
    ///
    /// Re-publishing the same pair refreshes it. Fails with
    /// [`Error::EndpointTaken`] when another live endpoint holds `id`.
    fn publish<'a>(&'a self, id: &'a EndpointId, addr: SocketAddr) -> BoxFuture<'a, Result<()>>;

    /// Stop announcing `id`.
    fn withdraw<'a>(&'a self, id: &'a EndpointId) -> BoxFuture<'a, Result<()>>;

    /// Look up the address of `id`.
    fn resolve<'a>(&'a self, id: &'a EndpointId) -> BoxFuture<'a, Result<Option<SocketAddr>>>;
}

/// Resolver backed by a shared in-process map.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: Arc<Mutex<HashMap<EndpointId, SocketAddr>>>,
}

impl StaticResolver {
    /// Create an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed an entry, e.g. from a command-line flag.
    pub fn insert(&self, id: EndpointId, addr: SocketAddr) {
        if let Ok(mut map) = self.entries.lock() {
            map.insert(id, addr);
        }
    }

    fn with_map<T>(
        &self,
        f: impl FnOnce(&mut HashMap<EndpointId, SocketAddr>) -> Result<T>,
    ) -> Result<T> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| Error::Internal("resolver table poisoned".to_string()))?;
        f(&mut map)
    }
}

impl Resolver for StaticResolver {
    fn publish<'a>(&'a self, id: &'a EndpointId, addr: SocketAddr) -> BoxFuture<'a, Result<()>> {
        let result = self.with_map(|map| match map.get(id).copied() {
            Some(existing) if existing != addr => Err(Error::EndpointTaken(id.to_string())),
            _ => {
                map.insert(id.clone(), addr);
                Ok(())
            }
        });
        futures::future::ready(result).boxed()
    }

    fn withdraw<'a>(&'a self, id: &'a EndpointId) -> BoxFuture<'a, Result<()>> {
        let result = self.with_map(|map| {
            map.remove(id);
            Ok(())
        });
        futures::future::ready(result).boxed()
    }

    fn resolve<'a>(&'a self, id: &'a EndpointId) -> BoxFuture<'a, Result<Option<SocketAddr>>> {
        let result = self.with_map(|map| Ok(map.get(id).copied()));
        futures::future::ready(result).boxed()
    }
}

/// Transport over plain TCP streams.
#[derive(Clone)]
pub struct TcpTransport {
    bind: SocketAddr,
    advertise: Option<IpAddr>,
    resolver: Arc<dyn Resolver>,
    refresh: Duration,
    open_timeout: Duration,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("bind", &self.bind)
            .field("advertise", &self.advertise)
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// Create a transport binding listeners to `bind` (port 0 picks a free port).
    #[must_use]
    pub fn new(bind: SocketAddr, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            bind,
            advertise: None,
            resolver,
            refresh: Duration::from_secs(10),
            open_timeout: crate::CHANNEL_OPEN_TIMEOUT,
        }
    }

    /// Advertise this IP instead of the detected one.
    #[must_use]
    pub const fn with_advertise(mut self, ip: IpAddr) -> Self {
        self.advertise = Some(ip);
        self
    }

    /// Re-publish interval while an endpoint lives.
    #[must_use]
    pub const fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    /// Deadline for a single TCP connect.
    #[must_use]
    pub const fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    fn advertised_addr(&self, local: SocketAddr) -> SocketAddr {
        let ip = self.advertise.unwrap_or_else(|| {
            if local.ip().is_unspecified() {
                detect_local_ip()
            } else {
                local.ip()
            }
        });
        SocketAddr::new(ip, local.port())
    }
}

impl Transport for TcpTransport {
    fn register<'a>(&'a self, id: &'a EndpointId) -> BoxFuture<'a, Result<Endpoint>> {
        async move {
            let listener = TcpListener::bind(self.bind).await?;
            let addr = self.advertised_addr(listener.local_addr()?);

            self.resolver.publish(id, addr).await?;
            tracing::info!(endpoint = %id, %addr, "Listening for channels");

            let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
            let cancel = CancellationToken::new();

            tokio::spawn(accept_loop(listener, tx, cancel.clone(), id.clone()));
            tokio::spawn(refresh_loop(
                Arc::clone(&self.resolver),
                id.clone(),
                addr,
                self.refresh,
                cancel.clone(),
            ));

            Ok(Endpoint::new(id.clone(), rx, cancel))
        }
        .boxed()
    }

    fn dial<'a>(
        &'a self,
        local: &'a EndpointId,
        remote: &'a EndpointId,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        async move {
            let addr = self
                .resolver
                .resolve(remote)
                .await?
                .ok_or_else(|| Error::PeerUnavailable(remote.to_string()))?;

            let mut stream = tokio::time::timeout(self.open_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::PeerUnavailable(remote.to_string()))?
                .map_err(|e| {
                    tracing::debug!(%addr, "Connect failed: {e}");
                    Error::PeerUnavailable(remote.to_string())
                })?;

            configure_stream(&stream);
            protocol::write_frame(&mut stream, &Frame::Open(local.to_string())).await?;

            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<InboundStream>,
    cancel: CancellationToken,
    id: EndpointId,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        tokio::spawn(read_preamble(stream, peer_addr, tx.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = %id, "Accept failed: {e}");
                    }
                }
            }
        }
    }
    tracing::debug!(endpoint = %id, "Listener closed");
}

async fn read_preamble(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    tx: mpsc::Sender<InboundStream>,
) {
    configure_stream(&stream);

    match protocol::read_frame_with_timeout(&mut stream, PREAMBLE_TIMEOUT).await {
        Ok(Frame::Open(remote)) => {
            let _ = tx
                .send(InboundStream {
                    remote: EndpointId::from_raw(remote),
                    stream: Box::new(stream),
                })
                .await;
        }
        Ok(other) => {
            tracing::warn!(%peer_addr, frame = other.kind(), "Stream did not start with an open frame");
        }
        Err(e) => {
            tracing::debug!(%peer_addr, "Dropped stream before preamble: {e}");
        }
    }
}

async fn refresh_loop(
    resolver: Arc<dyn Resolver>,
    id: EndpointId,
    addr: SocketAddr,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = resolver.publish(&id, addr).await {
                    tracing::debug!(endpoint = %id, "Refresh failed: {e}");
                }
            }
        }
    }

    if let Err(e) = resolver.withdraw(&id).await {
        tracing::debug!(endpoint = %id, "Withdraw failed: {e}");
    }
}

/// Disable Nagle and enable OS keep-alive so idle channels survive
/// NAT and firewall idle timeouts.
fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {e}");
    }

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!("TCP keep-alive not enabled: {e}");
    }
}

/// Best guess at the LAN address of this machine.
///
/// Connecting a UDP socket sends no packets but selects the outbound interface.
pub fn detect_local_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |addr| addr.ip())
}
