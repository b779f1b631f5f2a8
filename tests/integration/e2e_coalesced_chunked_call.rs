//! Scenario 2 (coalesced + chunked call) and scenario 3 (unchanged
//! short-circuit): two callers share one in-flight request; a 900-row heavy
//! result is paginated transparently and concatenated back into one answer;
//! a caller that already holds the current hash gets told "unchanged"
//! instead of the body.

use async_trait::async_trait;
use pf_crypto::SecurityContext;
use pf_proto::Message;
use pf_rpc::{OutboundSender, RpcEngine};
use pf_telemetry::TelemetryHook;
use pf_test_support::{MockNetwork, MockPeripheralAdapter};
use pf_transport::Channel;
use std::sync::atomic::{AtomicUsize, Ordering};
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

/// Answers PERIPH_CALL messages on `host_channel` until the channel closes,
/// counting how many it handled.
fn spawn_host_responder(
    host: Arc<pf_host::HostServer<MockPeripheralAdapter>>,
    host_channel: Arc<Channel>,
    handled: Arc<AtomicUsize>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some((peer, message)) = host_channel.receive(Duration::from_secs(2), 1_000).await else {
                return;
            };
            let Some(request_id) = message.request_id.clone() else { continue };
            let Ok(call) = message.decode_call() else { continue };
            handled.fetch_add(1, Ordering::SeqCst);
            let reply = host.dispatch_call(request_id, call, 1_000).await;
            if host_channel.send(&peer, &reply, 1_000).await.is_err() {
                return;
            }
        }
    })
}

/// Feeds every `PERIPH_RESULT`/`PERIPH_ERROR` arriving on `client_channel`
/// into the engine, standing in for `PeripheralClient::handle_inbound`'s
/// dispatch of those two message types.
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

fn bridge_adapter(rows: usize) -> Arc<MockPeripheralAdapter> {
    let adapter = Arc::new(MockPeripheralAdapter::new());
    adapter.add_peripheral("bridge", "me:bridge", vec!["getItems".to_owned()], move |method, _args| {
        assert_eq!(method, "getItems");
        let items: Vec<_> = (0..rows)
            .map(|i| serde_json::json!({"name": format!("item-{i}"), "count": i, "isCraftable": false}))
            .collect();
        Ok(serde_json::Value::Array(items))
    });
    adapter
}

#[tokio::test]
async fn two_coalesced_callers_get_one_concatenated_900_row_result() {
    let network = MockNetwork::new();
    let host = Arc::new(pf_host::HostServer::new("A", "Host A", bridge_adapter(900), TelemetryHook::new()));
    host.scan().await;
    let handled = Arc::new(AtomicUsize::new(0));
    let responder = spawn_host_responder(host.clone(), channel(&network, "A"), handled.clone());

    let client_channel = channel(&network, "B");
    let sender = ChannelSender(client_channel.clone());
    let engine = Arc::new(RpcEngine::new(sender));
    let client_responder = spawn_client_responder(engine.clone(), client_channel);

    let e1 = engine.clone();
    let e2 = engine.clone();
    let call1 = tokio::spawn(async move { e1.call("A", "bridge", "getItems", serde_json::json!({}), None, 1_000, 3_000).await });
    let call2 = tokio::spawn(async move { e2.call("A", "bridge", "getItems", serde_json::json!({}), None, 1_000, 3_000).await });

    let (r1, r2) = tokio::join!(call1, call2);
    let r1 = r1.unwrap().unwrap();
    let r2 = r2.unwrap().unwrap();

    assert_eq!(r1.results.as_array().unwrap().len(), 900);
    assert_eq!(r1.results, r2.results);

    // 900 rows at the default chunk limit of 200 is 5 pages (200*4 + 100).
    // Had the two callers not been coalesced, the host would have seen twice
    // as many PERIPH_CALLs.
    assert_eq!(handled.load(Ordering::SeqCst), 5);

    responder.abort();
    client_responder.abort();
}

#[tokio::test]
async fn matching_result_hash_short_circuits_to_unchanged() {
    let network = MockNetwork::new();
    let host = Arc::new(pf_host::HostServer::new("A", "Host A", bridge_adapter(3), TelemetryHook::new()));
    host.scan().await;
    let handled = Arc::new(AtomicUsize::new(0));
    let responder = spawn_host_responder(host.clone(), channel(&network, "A"), handled.clone());

    let client_channel = channel(&network, "B");
    let sender = ChannelSender(client_channel.clone());
    let engine = Arc::new(RpcEngine::new(sender));
    let client_responder = spawn_client_responder(engine.clone(), client_channel);

    let first = engine.call("A", "bridge", "getItems", serde_json::json!({}), None, 1_000, 3_000).await.unwrap();
    assert!(!first.unchanged);
    assert_eq!(first.results.as_array().unwrap().len(), 3);

    // The engine hands back the concatenation of the host's reduced, sorted
    // rows untouched, so re-hashing what we just received reproduces the
    // same resultHash the host computed — exactly what a caching layer on
    // top of this engine does before its next call.
    let reduced_hash = pf_crypto::weak_hash(&serde_json::to_string(&first.results).unwrap());
    let options = pf_proto::CallOptions {
        result_hash: Some(reduced_hash),
        ..Default::default()
    };
    let second = engine
        .call("A", "bridge", "getItems", serde_json::json!({}), Some(options), 2_000, 3_000)
        .await
        .unwrap();
    assert!(second.unchanged);

    responder.abort();
    client_responder.abort();
}
