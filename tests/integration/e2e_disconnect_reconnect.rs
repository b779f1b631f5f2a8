//! Scenario 4 (disconnect/reconnect): three consecutive blocking-call
//! timeouts trip the proxy into `Disconnected`; further calls are rejected
//! immediately (no network round trip) until the cooldown passes; once it
//! does, a rediscover brings the peripheral back, clears its cache, and the
//! very next call is a real RPC again.

use async_trait::async_trait;
use pf_crypto::SecurityContext;
use pf_proto::Message;
use pf_proxy::{ProxyCache, ProxyState, Rediscoverer, DEFAULT_RPC_TIMEOUT_MS, RECONNECT_COOLDOWN_MS};
use pf_rpc::{OutboundSender, RpcEngine, RpcErrorKind};
use pf_telemetry::TelemetryHook;
use pf_test_support::{MockNetwork, MockPeripheralAdapter};
use pf_transport::Channel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "a-sixteen-char-secret!!";

#[derive(Clone)]
struct ChannelSender(Arc<Channel>);

#[async_trait]
impl OutboundSender for ChannelSender {
    async fn send_call(&self, peer_id: &str, message: &Message, now_ms: u64) -> Result<(), String> {
        self.0.send(peer_id, message, now_ms).await.map_err(|e| e.to_string())
    }
}

fn channel(network: &MockNetwork, peer_id: &str) -> Arc<Channel> {
    Arc::new(Channel::new(network.endpoint(peer_id), Arc::new(SecurityContext::with_secret(SECRET).unwrap())))
}

async fn run_host_responder(host: Arc<pf_host::HostServer<MockPeripheralAdapter>>, host_channel: Arc<Channel>) {
    loop {
        let Some((peer, message)) = host_channel.receive(Duration::from_secs(2), 1_000).await else {
            return;
        };
        let Some(request_id) = message.request_id.clone() else { continue };
        let Ok(call) = message.decode_call() else { continue };
        let reply = host.dispatch_call(request_id, call, 1_000).await;
        if host_channel.send(&peer, &reply, 1_000).await.is_err() {
            return;
        }
    }
}

/// Feeds every `PERIPH_RESULT`/`PERIPH_ERROR` arriving on `client_channel`
/// into the engine; without this, a resolved (non-timeout) call would hang
/// forever waiting on a reply nothing ever delivers to it.
fn spawn_client_responder(engine: Arc<RpcEngine<ChannelSender>>, client_channel: Arc<Channel>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some((_peer, message)) = client_channel.receive(Duration::from_secs(2), 1_000).await else {
                return;
            };
            let Some(request_id) = message.request_id.clone() else { continue };
            match message.message_type {
                pf_proto::MessageType::PeriphResult => {
                    if let Ok(payload) = message.decode_result() {
                        engine.on_result(&request_id, payload, 1_000).await;
                    }
                }
                pf_proto::MessageType::PeriphError => {
                    if let Ok(payload) = message.decode_error() {
                        engine.on_error(&request_id, &payload.error);
                    }
                }
                _ => {}
            }
        }
    })
}

/// Brings the host's responder online on first successful rediscover, as a
/// stand-in for the real `PeripheralClient::issue_discover` round trip —
/// this test is about the cache/connection state machine, not discovery.
struct StartHostOnReconnect {
    host: Arc<pf_host::HostServer<MockPeripheralAdapter>>,
    host_channel: Arc<Channel>,
    started: AtomicBool,
}

#[async_trait]
impl Rediscoverer for StartHostOnReconnect {
    async fn rediscover(&self, _host_id: &str, _now_ms: u64) -> bool {
        if self.started.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            tokio::spawn(run_host_responder(self.host.clone(), self.host_channel.clone()));
        }
        true
    }
}

#[tokio::test]
async fn three_timeouts_disconnect_then_cooldown_then_reconnect_and_real_call() {
    let network = MockNetwork::new();
    let adapter = Arc::new(MockPeripheralAdapter::new());
    adapter.add_peripheral("inv0", "minecraft:chest", vec!["list".to_owned()], |_m, _a| {
        Ok(serde_json::json!([{"slot": 1, "count": 1, "name": "minecraft:stone"}]))
    });
    let host = Arc::new(pf_host::HostServer::new("A", "Host A", adapter, TelemetryHook::new()));
    host.scan().await;
    let host_channel = channel(&network, "A");

    let client_channel = channel(&network, "B");
    let sender = ChannelSender(client_channel.clone());
    let engine = Arc::new(RpcEngine::new(sender));
    let client_responder = spawn_client_responder(engine.clone(), client_channel);
    let rediscoverer = StartHostOnReconnect {
        host: host.clone(),
        host_channel,
        started: AtomicBool::new(false),
    };
    let cache = ProxyCache::new(engine.clone(), rediscoverer, TelemetryHook::new());

    // Nobody answers A's channel yet, so each of these three calls can only
    // resolve via the timeout sweep — fast-forward it by hand instead of
    // sleeping out three real 3s timeouts.
    let mut last_now = 0;
    for i in 0..3u64 {
        let now_ms = 1_000 + i * (RECONNECT_COOLDOWN_MS + 1);
        last_now = now_ms;
        let cache2 = cache.clone();
        let call = tokio::spawn(async move { cache2.call_read("A", "inv0", "list", serde_json::json!({}), now_ms).await });
        tokio::task::yield_now().await;
        engine.sweep_timeouts(now_ms + DEFAULT_RPC_TIMEOUT_MS);
        let outcome = call.await.unwrap();
        assert_eq!(outcome.unwrap_err(), RpcErrorKind::Timeout);
    }
    assert_eq!(cache.status("A", "inv0"), ProxyState::Disconnected);

    // Still inside the cooldown: rejected immediately, no call issued.
    let still_cooling = cache.call_read("A", "inv0", "list", serde_json::json!({}), last_now + 1).await;
    assert!(matches!(still_cooling, Err(RpcErrorKind::Other(ref code)) if code == pf_proto::error_codes::DISCONNECTED));

    // Cooldown elapsed: this call reconnects, clears the cache, and goes out
    // as a real PERIPH_CALL the (now running) host answers.
    let after_cooldown = last_now + RECONNECT_COOLDOWN_MS + 1;
    let result = cache.call_read("A", "inv0", "list", serde_json::json!({}), after_cooldown).await.unwrap();
    assert_eq!(result, serde_json::json!([{"slot": 1, "count": 1, "name": "minecraft:stone"}]));
    assert_eq!(cache.status("A", "inv0"), ProxyState::Connected);

    client_responder.abort();
}
