//! In-process transport built on duplex pipes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{BoxedStream, Endpoint, InboundStream, Transport};
use crate::code::EndpointId;
use crate::error::{Error, Result};

/// Pipe capacity per direction.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Inbound streams queued per endpoint before dialers block.
const ACCEPT_BACKLOG: usize = 64;

/// Hub connecting endpoints registered in the same process.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    endpoints: Arc<Mutex<HashMap<EndpointId, mpsc::Sender<InboundStream>>>>,
}

impl MemoryTransport {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is currently published.
    pub fn is_registered(&self, id: &EndpointId) -> bool {
        self.endpoints
            .lock()
            .map(|map| map.get(id).is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    fn lookup(&self, id: &EndpointId) -> Result<mpsc::Sender<InboundStream>> {
        let mut map = self
            .endpoints
            .lock()
            .map_err(|_| Error::Internal("endpoint table poisoned".to_string()))?;

        match map.get(id) {
            Some(tx) if !tx.is_closed() => Ok(tx.clone()),
            Some(_) => {
                map.remove(id);
                Err(Error::PeerUnavailable(id.to_string()))
            }
            None => Err(Error::PeerUnavailable(id.to_string())),
        }
    }
}

impl Transport for MemoryTransport {
    fn register<'a>(&'a self, id: &'a EndpointId) -> BoxFuture<'a, Result<Endpoint>> {
        async move {
            let mut map = self
                .endpoints
                .lock()
                .map_err(|_| Error::Internal("endpoint table poisoned".to_string()))?;

            if map.get(id).is_some_and(|tx| !tx.is_closed()) {
                return Err(Error::EndpointTaken(id.to_string()));
            }

            let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
            map.insert(id.clone(), tx);
            tracing::debug!(endpoint = %id, "Registered in-memory endpoint");

            Ok(Endpoint::new(id.clone(), rx, CancellationToken::new()))
        }
        .boxed()
    }

    fn dial<'a>(
        &'a self,
        local: &'a EndpointId,
        remote: &'a EndpointId,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        async move {
            let tx = self.lookup(remote)?;
            let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);

            tx.send(InboundStream {
                remote: local.clone(),
                stream: Box::new(theirs),
            })
            .await
            .map_err(|_| Error::PeerUnavailable(remote.to_string()))?;

            Ok(Box::new(ours) as BoxedStream)
        }
        .boxed()
    }
}
