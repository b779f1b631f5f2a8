//! Scenario 1 (boot): host A has peripherals inv0(chest) and bridge(me);
//! it announces, client B discovers, and B's registry ends up with the
//! composite keys and a working `find`.

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
async fn boot_announce_discover_populates_registry_with_composite_keys() {
    let network = MockNetwork::new();

    let adapter = Arc::new(MockPeripheralAdapter::new());
    adapter.add_peripheral("inv0", "minecraft:chest", vec!["list".to_owned()], |_m, _a| Ok(serde_json::json!([])));
    adapter.add_peripheral("bridge", "me:bridge", vec!["getItems".to_owned()], |_m, _a| Ok(serde_json::json!([])));
    let host = Arc::new(pf_host::HostServer::new("A", "Host A", adapter, TelemetryHook::new()));
    let host_channel = channel(&network, "A");
    let scan = host.scan().await;
    assert_eq!(scan.count, 2);

    let client = Arc::new(PeripheralClient::new("B", channel(&network, "B"), TelemetryHook::new()));

    let announce = host.announce_payload(None).await;
    host_channel.broadcast(&Message::new_announce(announce, 1_000), 1_000).await.unwrap();

    let (peer, message) = client.channel().receive(Duration::from_secs(1), 1_010).await.expect("announce delivered");
    client.handle_inbound(&peer, message, 1_010).await;

    let (peer, message) = host_channel.receive(Duration::from_secs(1), 1_020).await.expect("discover delivered");
    assert_eq!(message.message_type, pf_proto::MessageType::PeriphDiscover);
    let request_id = message.request_id.clone().expect("discover carries a requestId");
    let reply = host.dispatch_discover(request_id, 1_020).await;
    host_channel.send(&peer, &reply, 1_020).await.unwrap();

    let (peer, message) = client.channel().receive(Duration::from_secs(1), 1_030).await.expect("list delivered");
    client.handle_inbound(&peer, message, 1_030).await;

    let registry = client.registry().read().await;
    assert!(registry.get("A::inv0").is_some());
    assert!(registry.get("A::bridge").is_some());
    assert_eq!(registry.find("chest").unwrap().key, "A::inv0");
}

#[tokio::test]
async fn duplicate_discover_while_one_in_flight_is_suppressed_across_the_real_transport() {
    let network = MockNetwork::new();
    let adapter = Arc::new(MockPeripheralAdapter::new());
    adapter.add_peripheral("inv0", "minecraft:chest", vec!["list".to_owned()], |_m, _a| Ok(serde_json::json!([])));
    let host = Arc::new(pf_host::HostServer::new("A", "Host A", adapter, TelemetryHook::new()));
    host.scan().await;
    let host_channel = channel(&network, "A");

    let client = Arc::new(PeripheralClient::new("B", channel(&network, "B"), TelemetryHook::new()));

    let announce = host.announce_payload(None).await;
    host_channel.broadcast(&Message::new_announce(announce.clone(), 1_000), 1_000).await.unwrap();
    let (peer, message) = client.channel().receive(Duration::from_secs(1), 1_010).await.unwrap();
    client.handle_inbound(&peer, message, 1_010).await;

    // A second identical announce before the first discover resolved must not
    // trigger a second PERIPH_DISCOVER.
    host_channel.broadcast(&Message::new_announce(announce, 1_015), 1_015).await.unwrap();
    client.tick(1_016).await;

    let (_peer, message) = host_channel.receive(Duration::from_secs(1), 1_020).await.unwrap();
    assert_eq!(message.message_type, pf_proto::MessageType::PeriphDiscover);
    assert!(host_channel.receive(Duration::from_millis(20), 1_020).await.is_none(), "only one discover should have been broadcast");
}
