//! pf-discovery: heartbeat announce + on-demand peer peripheral listing (C4).
//!
//! Grounded in the hello/heartbeat handshake of
//! `services/forwarder/src/uplink.rs`, generalized from a client-to-server
//! handshake into a peer-to-peer announce/discover exchange.

use async_trait::async_trait;
use pf_proto::{AnnounceEither, ActivitySummary, ListPayload, Message};
use pf_registry::Registry;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::RwLock;

pub const ANNOUNCE_INTERVAL_MS: u64 = 10_000;
pub const DISCOVER_TIMEOUT_MS: u64 = 3_000;

#[async_trait]
pub trait DiscoverySender: Send + Sync {
    async fn send_to(&self, peer_id: &str, message: &Message, now_ms: u64) -> Result<(), String>;
    async fn broadcast(&self, message: &Message, now_ms: u64) -> Result<(), String>;
}

struct PendingDiscover {
    host_id: String,
    deadline_ms: u64,
}

/// Client-side discovery state machine: consumes peer announces, issues
/// discover broadcasts, and folds list responses into the shared [`Registry`].
pub struct Discovery<S: DiscoverySender> {
    registry: Arc<RwLock<Registry>>,
    sender: S,
    // requestId -> in-flight discover, for the timeout sweep.
    pending_discovers: Mutex<HashMap<String, PendingDiscover>>,
}

impl<S: DiscoverySender> Discovery<S> {
    pub fn new(registry: Arc<RwLock<Registry>>, sender: S) -> Self {
        Self {
            registry,
            sender,
            pending_discovers: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<RwLock<Registry>> {
        &self.registry
    }

    /// Build and broadcast this node's `PERIPH_ANNOUNCE` heartbeat. The
    /// heartbeat never carries the inventory (§4.4).
    pub async fn announce(
        &self,
        host_id: &str,
        host_name: &str,
        state_hash: &str,
        peripheral_count: u64,
        activity: Option<Vec<ActivitySummary>>,
        now_ms: u64,
    ) -> Result<(), String> {
        let payload = pf_proto::AnnouncePayload {
            host_id: host_id.to_owned(),
            host_name: host_name.to_owned(),
            state_hash: state_hash.to_owned(),
            peripheral_count,
            activity,
        };
        let message = Message::new_announce(payload, now_ms);
        self.sender.broadcast(&message, now_ms).await
    }

    /// Process a received `PERIPH_ANNOUNCE`. Legacy full-inventory announces
    /// update the registry directly; current-shape announces update the
    /// host's state hash and, if warranted, issue a discover.
    pub async fn handle_announce(&self, payload: AnnounceEither, now_ms: u64) {
        match payload {
            AnnounceEither::Legacy(legacy) => {
                let mut registry = self.registry.write().await;
                registry.handle_periph_list(&legacy.host_id, Some(&legacy.host_name), &legacy.peripherals);
            }
            AnnounceEither::Current(current) => {
                let (should_discover, already_pending) = {
                    let mut registry = self.registry.write().await;
                    let outcome =
                        registry.handle_announce(&current.host_id, Some(&current.host_name), &current.state_hash);
                    (outcome.should_discover, registry.has_pending_discover(&current.host_id))
                };

                if should_discover && !already_pending {
                    self.issue_discover(&current.host_id, now_ms).await;
                }
            }
        }
    }

    /// Broadcast a `PERIPH_DISCOVER` for `host_id`, suppressing duplicates
    /// via the host's pending-discover slot (§4.4: "Each outstanding
    /// per-host discover is tracked by requestId so duplicates are
    /// suppressed").
    pub async fn issue_discover(&self, host_id: &str, now_ms: u64) {
        {
            let registry = self.registry.read().await;
            if registry.has_pending_discover(host_id) {
                return;
            }
        }

        let request_id = uuid_like_id();
        {
            let mut registry = self.registry.write().await;
            registry.set_pending_discover(host_id, request_id.clone());
        }
        self.pending_discovers.lock().expect("pending discover lock poisoned").insert(
            request_id.clone(),
            PendingDiscover {
                host_id: host_id.to_owned(),
                deadline_ms: now_ms + DISCOVER_TIMEOUT_MS,
            },
        );

        let message = Message::new_discover(request_id, now_ms);
        if let Err(err) = self.sender.broadcast(&message, now_ms).await {
            tracing::warn!(host_id, error = %err, "failed to broadcast discover request");
        }
    }

    /// Process a received `PERIPH_LIST`, replacing the host's ownership set
    /// atomically and freeing its pending-discover slot.
    pub async fn handle_list(&self, request_id: Option<&str>, payload: ListPayload, _now_ms: u64) {
        {
            let mut registry = self.registry.write().await;
            registry.handle_periph_list(&payload.host_id, Some(&payload.host_name), &payload.peripherals);
            registry.clear_pending_discover(&payload.host_id);
        }
        if let Some(request_id) = request_id {
            self.pending_discovers
                .lock()
                .expect("pending discover lock poisoned")
                .remove(request_id);
        }
    }

    /// Free any discover slots whose deadline has passed, so a future
    /// announce can retrigger discovery for that host.
    pub async fn sweep_timeouts(&self, now_ms: u64) {
        let expired: Vec<(String, String)> = {
            let pending = self.pending_discovers.lock().expect("pending discover lock poisoned");
            pending
                .iter()
                .filter(|(_, p)| p.deadline_ms <= now_ms)
                .map(|(request_id, p)| (request_id.clone(), p.host_id.clone()))
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        let mut registry = self.registry.write().await;
        let mut pending = self.pending_discovers.lock().expect("pending discover lock poisoned");
        for (request_id, host_id) in expired {
            registry.clear_pending_discover(&host_id);
            pending.remove(&request_id);
        }
    }
}

/// A cheap, dependency-free unique id for discover requests. Not a UUID —
/// discover requests are node-local correlation tokens, not wire-shared
/// identity, so a counter-backed token is sufficient.
fn uuid_like_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("discover-{n:x}")
}
