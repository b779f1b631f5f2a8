//! Scenario 6 (state-hash churn): host A drops a peripheral, its state hash
//! changes, the next heartbeat makes client B notice and rediscover, and
//! B's registry atomically drops the removed peripheral — a stale proxy for
//! it fails locally, with no round trip to A.

use pf_crypto::SecurityContext;
use pf_proto::Message;
use pf_telemetry::TelemetryHook;
use pf_test_support::{MockNetwork, MockPeripheralAdapter};
use pf_transport::Channel;
use peripheral_fabric::PeripheralClient;
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "a-sixteen-char-secret!!";

fn channel(network: &MockNetwork, peer_id: &str) -> Arc<Channel> {
    Arc::new(Channel::new(network.endpoint(peer_id), Arc::new(SecurityContext::with_secret(SECRET).unwrap())))
}

#[tokio::test]
async fn removed_peripheral_drops_out_of_the_registry_after_rediscovery() {
    let network = MockNetwork::new();
    let adapter = Arc::new(MockPeripheralAdapter::new());
    adapter.add_peripheral("inv0", "minecraft:chest", vec!["list".to_owned()], |_m, _a| Ok(serde_json::json!([])));
    adapter.add_peripheral("bridge", "me:bridge", vec!["getItems".to_owned()], |_m, _a| Ok(serde_json::json!([])));
    let host = Arc::new(pf_host::HostServer::new("A", "Host A", adapter.clone(), TelemetryHook::new()));
    let host_channel = channel(&network, "A");
    let first_scan = host.scan().await;
    assert_eq!(first_scan.count, 2);

    let client = Arc::new(PeripheralClient::new("B", channel(&network, "B"), TelemetryHook::new()));

    // Boot: announce, discover, list — both peripherals land in the registry.
    let announce = host.announce_payload(None).await;
    host_channel.broadcast(&Message::new_announce(announce, 1_000), 1_000).await.unwrap();
    let (peer, message) = client.channel().receive(Duration::from_secs(1), 1_010).await.unwrap();
    client.handle_inbound(&peer, message, 1_010).await;

    let (peer, message) = host_channel.receive(Duration::from_secs(1), 1_020).await.unwrap();
    let request_id = message.request_id.clone().unwrap();
    let reply = host.dispatch_discover(request_id, 1_020).await;
    host_channel.send(&peer, &reply, 1_020).await.unwrap();
    let (peer, message) = client.channel().receive(Duration::from_secs(1), 1_030).await.unwrap();
    client.handle_inbound(&peer, message, 1_030).await;

    assert!(client.find("me:bridge").await.is_some());
    assert_eq!(client.get_names().await.len(), 2);

    // A drops "bridge" and rescans: the state hash changes.
    adapter.remove_peripheral("bridge");
    let second_scan = host.scan().await;
    assert!(second_scan.changed);
    assert_eq!(second_scan.count, 1);

    // The next heartbeat carries the new hash, which B notices and reacts to
    // by issuing a fresh discover.
    let announce2 = host.announce_payload(None).await;
    host_channel.broadcast(&Message::new_announce(announce2, 2_000), 2_000).await.unwrap();
    let (peer, message) = client.channel().receive(Duration::from_secs(1), 2_010).await.expect("second announce delivered");
    client.handle_inbound(&peer, message, 2_010).await;

    let (peer, message) = host_channel.receive(Duration::from_secs(1), 2_020).await.expect("hash change re-triggers discover");
    assert_eq!(message.message_type, pf_proto::MessageType::PeriphDiscover);
    let request_id = message.request_id.clone().unwrap();
    let reply = host.dispatch_discover(request_id, 2_020).await;
    host_channel.send(&peer, &reply, 2_020).await.unwrap();
    let (peer, message) = client.channel().receive(Duration::from_secs(1), 2_030).await.unwrap();
    client.handle_inbound(&peer, message, 2_030).await;

    // The registry swap was atomic: bridge is gone, inv0 survived untouched.
    assert!(client.find("me:bridge").await.is_none());
    assert!(client.find("minecraft:chest").await.is_some());
    assert_eq!(client.get_names().await, vec!["inv0".to_owned()]);

    // A stale handle to the removed peripheral now fails locally — no round
    // trip to A is needed to know it is gone.
    let outcome = client.call("bridge", "getItems", serde_json::json!({}), 2_100, 3_000).await;
    assert_eq!(outcome.unwrap_err(), pf_rpc::RpcErrorKind::PeripheralNotFound);
    assert!(
        host_channel.receive(Duration::from_millis(20), 2_100).await.is_none(),
        "a call to a peripheral missing from the registry must never reach the host"
    );
}
