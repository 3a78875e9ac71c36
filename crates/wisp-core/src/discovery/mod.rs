//! Peer discovery and endpoint lookup.
//!
//! The registry is a small in-memory map keyed by the caller's IP address.
//! Peers announce themselves periodically; two peers behind the same public
//! IP see each other as neighbors, which is how nearby devices are
//! suggested. Senders on the TCP transport also publish their listener
//! address here so receivers can resolve an endpoint id to a socket.
//!
//! - [`PeerRegistry`]: the map itself, with liveness and pruning
//! - `server`: HTTP front end (`web` feature)
//! - `client`: HTTP client and [`Resolver`](crate::transport::Resolver)
//!   (`registry-client` feature)
//!
//! ## API
//!
//! | Method | Endpoint | Description |
//! |--------|----------|-------------|
//! | POST | /api/discovery | Announce, returns `{neighbors}` |
//! | GET | /api/peers/{peer_id} | Resolve a live peer's address |
//! | DELETE | /api/peers/{peer_id}?key= | Withdraw an announcement |

#[cfg(feature = "registry-client")]
pub mod client;
#[cfg(feature = "web")]
pub mod server;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::code::EndpointId;
use crate::error::{Error, Result};

/// Announcements older than this are invisible.
pub const PEER_TTL: Duration = Duration::from_secs(30);

/// How often stale announcements are removed.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// What an announcing peer is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Hosting files
    Sender,
    /// Looking for a sender
    Receiver,
}

/// A peer's announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Endpoint id the peer is reachable under
    pub peer_id: EndpointId,
    /// Per-process secret; only its holder may replace or withdraw the entry
    pub key: String,
    /// Display name
    pub device: String,
    /// Sender or receiver
    pub role: PeerRole,
    /// Socket address for the TCP transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<SocketAddr>,
}

/// Another peer, as shown to neighbors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Endpoint id
    pub peer_id: EndpointId,
    /// Display name
    pub device: String,
    /// Sender or receiver
    pub role: PeerRole,
    /// Seconds since the last announcement
    pub seen_secs_ago: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    announcement: Announcement,
    last_seen: Instant,
}

/// In-memory registry of recently seen peers, keyed by caller IP.
#[derive(Debug)]
pub struct PeerRegistry {
    ttl: Duration,
    entries: HashMap<IpAddr, Vec<Entry>>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(PEER_TTL)
    }
}

impl PeerRegistry {
    /// Create an empty registry with the given liveness timeout.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Record an announcement from `ip` and return the other live peers on
    /// the same IP.
    ///
    /// The caller's previous entry (same key) is replaced wherever it was.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointTaken`] if another live peer already holds
    /// the announced endpoint id.
    pub fn announce(
        &mut self,
        ip: IpAddr,
        announcement: Announcement,
        now: Instant,
    ) -> Result<Vec<Neighbor>> {
        let taken = self.entries.values().flatten().any(|entry| {
            entry.announcement.peer_id == announcement.peer_id
                && entry.announcement.key != announcement.key
                && self.is_live(entry, now)
        });
        if taken {
            return Err(Error::EndpointTaken(announcement.peer_id.to_string()));
        }

        for bucket in self.entries.values_mut() {
            bucket.retain(|entry| entry.announcement.key != announcement.key);
        }

        tracing::debug!(
            peer = %announcement.peer_id,
            %ip,
            role = ?announcement.role,
            "Peer announced"
        );

        let key = announcement.key.clone();
        let bucket = self.entries.entry(ip).or_default();
        bucket.push(Entry {
            announcement,
            last_seen: now,
        });

        let ttl = self.ttl;
        Ok(bucket
            .iter()
            .filter(|entry| entry.announcement.key != key)
            .filter(|entry| now.duration_since(entry.last_seen) < ttl)
            .map(|entry| Neighbor {
                peer_id: entry.announcement.peer_id.clone(),
                device: entry.announcement.device.clone(),
                role: entry.announcement.role,
                seen_secs_ago: now.duration_since(entry.last_seen).as_secs(),
            })
            .collect())
    }

    /// Remove the entry for `peer_id` if `key` owns it. Returns whether
    /// anything was removed.
    pub fn withdraw(&mut self, peer_id: &EndpointId, key: &str) -> bool {
        let mut removed = false;
        for bucket in self.entries.values_mut() {
            let before = bucket.len();
            bucket.retain(|entry| {
                !(entry.announcement.peer_id == *peer_id && entry.announcement.key == key)
            });
            removed |= bucket.len() < before;
        }
        self.entries.retain(|_, bucket| !bucket.is_empty());
        removed
    }

    /// Announced address of a live peer.
    pub fn resolve(&self, peer_id: &EndpointId, now: Instant) -> Option<SocketAddr> {
        self.entries
            .values()
            .flatten()
            .filter(|entry| self.is_live(entry, now))
            .find(|entry| entry.announcement.peer_id == *peer_id)
            .and_then(|entry| entry.announcement.addr)
    }

    /// Drop stale entries. Returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut removed = 0;
        for bucket in self.entries.values_mut() {
            let before = bucket.len();
            bucket.retain(|entry| now.duration_since(entry.last_seen) < ttl);
            removed += before - bucket.len();
        }
        self.entries.retain(|_, bucket| !bucket.is_empty());
        removed
    }

    /// Number of stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_live(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.last_seen) < self.ttl
    }
}

/// Registry shared between request handlers and the pruner.
pub type SharedRegistry = Arc<Mutex<PeerRegistry>>;

/// Prune `registry` every `interval` until `cancel` fires.
pub fn spawn_pruner(
    registry: SharedRegistry,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.lock().await.prune(Instant::now());
                    if removed > 0 {
                        tracing::debug!(removed, "Pruned stale peers");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(peer: &str, key: &str, role: PeerRole) -> Announcement {
        Announcement {
            peer_id: EndpointId::from_raw(peer),
            key: key.to_string(),
            device: format!("{peer}-device"),
            role,
            addr: Some("192.168.1.20:4000".parse().expect("addr")),
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([203, 0, 113, last])
    }

    #[test]
    fn test_neighbors_share_an_ip() {
        let mut registry = PeerRegistry::default();
        let now = Instant::now();

        let alone = registry
            .announce(ip(1), announcement("a", "ka", PeerRole::Sender), now)
            .expect("announce");
        assert!(alone.is_empty());

        registry
            .announce(ip(2), announcement("elsewhere", "ke", PeerRole::Sender), now)
            .expect("announce");

        let seen = registry
            .announce(ip(1), announcement("b", "kb", PeerRole::Receiver), now)
            .expect("announce");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].peer_id.as_str(), "a");
        assert_eq!(seen[0].role, PeerRole::Sender);
    }

    #[test]
    fn test_reannounce_replaces_entry() {
        let mut registry = PeerRegistry::default();
        let now = Instant::now();

        registry
            .announce(ip(1), announcement("a", "ka", PeerRole::Sender), now)
            .expect("announce");
        registry
            .announce(ip(3), announcement("a2", "ka", PeerRole::Sender), now)
            .expect("announce");

        assert_eq!(registry.len(), 1);
        assert!(registry.resolve(&EndpointId::from_raw("a"), now).is_none());
        assert!(registry.resolve(&EndpointId::from_raw("a2"), now).is_some());
    }

    #[test]
    fn test_live_id_cannot_be_taken() {
        let mut registry = PeerRegistry::default();
        let now = Instant::now();

        registry
            .announce(ip(1), announcement("a", "ka", PeerRole::Sender), now)
            .expect("announce");
        let err = registry
            .announce(ip(2), announcement("a", "other", PeerRole::Sender), now)
            .expect_err("taken");
        assert!(matches!(err, Error::EndpointTaken(_)));

        let later = now + PEER_TTL;
        registry
            .announce(ip(2), announcement("a", "other", PeerRole::Sender), later)
            .expect("stale entry no longer blocks");
    }

    #[test]
    fn test_liveness_and_prune() {
        let mut registry = PeerRegistry::default();
        let now = Instant::now();
        let id = EndpointId::from_raw("a");

        registry
            .announce(ip(1), announcement("a", "ka", PeerRole::Sender), now)
            .expect("announce");
        assert!(registry.resolve(&id, now + Duration::from_secs(29)).is_some());
        assert!(registry.resolve(&id, now + PEER_TTL).is_none());

        assert_eq!(registry.prune(now + Duration::from_secs(10)), 0);
        assert_eq!(registry.prune(now + PEER_TTL), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_withdraw_requires_key() {
        let mut registry = PeerRegistry::default();
        let now = Instant::now();
        let id = EndpointId::from_raw("a");

        registry
            .announce(ip(1), announcement("a", "ka", PeerRole::Sender), now)
            .expect("announce");
        assert!(!registry.withdraw(&id, "wrong"));
        assert!(registry.withdraw(&id, "ka"));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_runs_periodically() {
        let registry: SharedRegistry = Arc::new(Mutex::new(PeerRegistry::default()));
        registry
            .lock()
            .await
            .announce(ip(1), announcement("a", "ka", PeerRole::Sender), Instant::now())
            .expect("announce");

        let cancel = CancellationToken::new();
        let task = spawn_pruner(registry.clone(), PRUNE_INTERVAL, cancel.clone());

        tokio::time::sleep(PRUNE_INTERVAL + Duration::from_secs(1)).await;
        assert!(registry.lock().await.is_empty());

        cancel.cancel();
        task.await.expect("pruner");
    }
}
