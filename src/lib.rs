//! peripheral-fabric: client-facing facade over discovery, the remote
//! peripheral registry, and the RPC engine.
//!
//! A node that wants to call a remote peripheral only needs one of these: it
//! owns the signed [`pf_transport::Channel`], drives [`PeripheralClient::tick`]
//! on a timer, feeds inbound messages to [`PeripheralClient::handle_inbound`],
//! and calls [`PeripheralClient::call`] to reach a peripheral by name.

use async_trait::async_trait;
use pf_discovery::{Discovery, DiscoverySender};
use pf_proto::{AnnounceEither, Message, MessageType};
use pf_registry::{RemotePeripheral, Registry};
use pf_rpc::{CallOutcome, OutboundSender, RpcEngine};
use pf_telemetry::TelemetryHook;
use pf_transport::Channel;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Adapts the signed [`Channel`] to the two narrow sender traits
/// [`Discovery`] and [`RpcEngine`] depend on, so both collaborators can share
/// one outbound path without knowing about each other.
#[derive(Clone)]
pub struct ChannelSender(Arc<Channel>);

#[async_trait]
impl DiscoverySender for ChannelSender {
    async fn send_to(&self, peer_id: &str, message: &Message, now_ms: u64) -> Result<(), String> {
        self.0.send(peer_id, message, now_ms).await.map_err(|e| e.to_string())
    }

    async fn broadcast(&self, message: &Message, now_ms: u64) -> Result<(), String> {
        self.0.broadcast(message, now_ms).await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl OutboundSender for ChannelSender {
    async fn send_call(&self, peer_id: &str, message: &Message, now_ms: u64) -> Result<(), String> {
        self.0.send(peer_id, message, now_ms).await.map_err(|e| e.to_string())
    }
}

/// The sum of a node's client-side collaborators: discovery (which owns the
/// registry), the RPC engine, and the telemetry hook they both report
/// through.
pub struct PeripheralClient {
    node_id: String,
    channel: Arc<Channel>,
    discovery: Discovery<ChannelSender>,
    rpc: Arc<RpcEngine<ChannelSender>>,
    telemetry: TelemetryHook,
}

impl PeripheralClient {
    pub fn new(node_id: impl Into<String>, channel: Arc<Channel>, telemetry: TelemetryHook) -> Self {
        let sender = ChannelSender(channel.clone());
        Self {
            node_id: node_id.into(),
            channel,
            discovery: Discovery::new(Arc::new(RwLock::new(Registry::new())), sender.clone()),
            rpc: Arc::new(RpcEngine::new(sender)),
            telemetry,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &Arc<RwLock<Registry>> {
        self.discovery.registry()
    }

    pub fn telemetry(&self) -> &TelemetryHook {
        &self.telemetry
    }

    pub fn rpc(&self) -> &Arc<RpcEngine<ChannelSender>> {
        &self.rpc
    }

    /// Broadcast a `PERIPH_DISCOVER` for `host_id`, suppressing duplicates via
    /// the registry's per-host pending-discover slot. Exposed so a cache
    /// layer sitting above this client (e.g. a proxy reconnect path) can
    /// trigger rediscovery without reaching into `Discovery` directly.
    pub async fn issue_discover(&self, host_id: &str, now_ms: u64) {
        self.discovery.issue_discover(host_id, now_ms).await;
    }

    /// Broadcast this node's own heartbeat. `state_hash`/`peripheral_count`
    /// describe this node's *local* peripherals, not the remote ones tracked
    /// in the registry.
    pub async fn announce(&self, host_name: &str, state_hash: &str, peripheral_count: u64, now_ms: u64) {
        if let Err(err) = self.discovery.announce(&self.node_id, host_name, state_hash, peripheral_count, None, now_ms).await {
            tracing::warn!(error = %err, "failed to broadcast announce");
        }
    }

    /// Call a remote peripheral, resolving `name_or_key` against the
    /// registry first (bare name when unambiguous, composite key otherwise).
    pub async fn call(
        &self,
        name_or_key: &str,
        method: &str,
        args: serde_json::Value,
        now_ms: u64,
        timeout_ms: u64,
    ) -> CallOutcome {
        let peripheral = {
            let registry = self.registry().read().await;
            registry.wrap(name_or_key).cloned()
        };
        let Some(peripheral) = peripheral else {
            return Err(pf_rpc::RpcErrorKind::PeripheralNotFound);
        };
        self.telemetry.record_call_dispatched();
        let outcome = self
            .rpc
            .call(&peripheral.host_id, &peripheral.name, method, args, None, now_ms, timeout_ms)
            .await;
        if outcome.is_err() {
            self.telemetry.record_call_failed();
        }
        outcome
    }

    pub async fn find(&self, type_str: &str) -> Option<RemotePeripheral> {
        self.registry().read().await.find(type_str).cloned()
    }

    pub async fn find_all(&self, type_str: &str) -> Vec<RemotePeripheral> {
        self.registry().read().await.find_all(type_str).into_iter().cloned().collect()
    }

    pub async fn get_names(&self) -> Vec<String> {
        self.registry().read().await.get_names()
    }

    /// Dispatch one received message to whichever collaborator owns it.
    /// Message types this node has no business receiving (`PERIPH_CALL`,
    /// `PERIPH_DISCOVER` — those are a host's job) are logged and dropped.
    pub async fn handle_inbound(&self, peer_id: &str, message: Message, now_ms: u64) {
        match message.message_type {
            MessageType::PeriphAnnounce => match message.decode_announce_any() {
                Ok(AnnounceEither::Current(payload)) => {
                    self.discovery.handle_announce(AnnounceEither::Current(payload), now_ms).await;
                }
                Ok(AnnounceEither::Legacy(payload)) => {
                    self.discovery.handle_announce(AnnounceEither::Legacy(payload), now_ms).await;
                }
                Err(err) => tracing::debug!(peer_id, error = %err, "dropped malformed announce"),
            },
            MessageType::PeriphList => match message.decode_list() {
                Ok(payload) => self.discovery.handle_list(message.request_id.as_deref(), payload, now_ms).await,
                Err(err) => tracing::debug!(peer_id, error = %err, "dropped malformed list"),
            },
            MessageType::PeriphResult => {
                let Some(request_id) = message.request_id.clone() else {
                    return;
                };
                match message.decode_result() {
                    Ok(payload) => self.rpc.on_result(&request_id, payload, now_ms).await,
                    Err(err) => tracing::debug!(peer_id, error = %err, "dropped malformed result"),
                }
            }
            MessageType::PeriphError => {
                let Some(request_id) = message.request_id.clone() else {
                    return;
                };
                match message.decode_error() {
                    Ok(payload) => self.rpc.on_error(&request_id, &payload.error),
                    Err(err) => tracing::debug!(peer_id, error = %err, "dropped malformed error"),
                }
            }
            MessageType::PeriphStatePush => match message.decode_state_push() {
                Ok(payload) => self.telemetry.record(
                    format!("state push from {}: {}::{}", peer_id, payload.host_id, payload.peripheral),
                    now_ms,
                ),
                Err(err) => tracing::debug!(peer_id, error = %err, "dropped malformed state push"),
            },
            other => tracing::debug!(peer_id, message_type = ?other, "no client-side handling for this message type"),
        }
    }

    /// Run one tick of housekeeping: free timed-out discover slots and
    /// timed-out pending calls. Must run at a bounded interval alongside
    /// whatever drives `receive`/`handle_inbound`.
    pub async fn tick(&self, now_ms: u64) {
        self.discovery.sweep_timeouts(now_ms).await;
        self.rpc.sweep_timeouts(now_ms);
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}
