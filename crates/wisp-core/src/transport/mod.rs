//! Raw stream transports.
//!
//! A [`Transport`] publishes endpoints and opens reliable, ordered byte
//! streams between them. Framing, verification and pooling live above this
//! layer; a transport only moves bytes and reports who dialed.
//!
//! Two implementations ship:
//! - [`MemoryTransport`]: in-process hub of duplex pipes
//! - [`TcpTransport`]: one TCP listener per endpoint, located via a [`Resolver`]

mod memory;
mod tcp;

pub use memory::MemoryTransport;
pub use tcp::{Resolver, StaticResolver, TcpTransport};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::code::EndpointId;
use crate::error::Result;

/// Anything that can serve as a raw channel stream.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased raw stream.
pub type BoxedStream = Box<dyn RawStream>;

/// A stream opened by a remote endpoint.
pub struct InboundStream {
    /// Endpoint that dialed us
    pub remote: EndpointId,
    /// The raw stream
    pub stream: BoxedStream,
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// A published endpoint.
///
/// Dropping it destroys the endpoint: the transport stops accepting streams
/// for its id and the id becomes available again.
#[derive(Debug)]
pub struct Endpoint {
    id: EndpointId,
    inbound: mpsc::Receiver<InboundStream>,
    cancel: CancellationToken,
}

impl Endpoint {
    /// Assemble an endpoint from the transport's inbound queue.
    ///
    /// `cancel` is cancelled when the endpoint is dropped.
    #[must_use]
    pub fn new(
        id: EndpointId,
        inbound: mpsc::Receiver<InboundStream>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            inbound,
            cancel,
        }
    }

    /// The published id.
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Wait for the next inbound stream.
    ///
    /// Returns `None` once the transport has stopped serving this endpoint.
    pub async fn accept(&mut self) -> Option<InboundStream> {
        self.inbound.recv().await
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
        tracing::debug!(endpoint = %self.id, "Endpoint destroyed");
    }
}

/// Connection brokering between endpoints.
pub trait Transport: Send + Sync + 'static {
    /// Publish `id` and start accepting streams for it.
    ///
    /// Fails with [`Error::EndpointTaken`](crate::Error::EndpointTaken) when
    /// the id is already in use.
    fn register<'a>(&'a self, id: &'a EndpointId) -> BoxFuture<'a, Result<Endpoint>>;

    /// Open one raw stream from `local` to `remote`.
    ///
    /// Fails with [`Error::PeerUnavailable`](crate::Error::PeerUnavailable)
    /// when the remote is not published or cannot be reached.
    fn dial<'a>(
        &'a self,
        local: &'a EndpointId,
        remote: &'a EndpointId,
    ) -> BoxFuture<'a, Result<BoxedStream>>;
}
