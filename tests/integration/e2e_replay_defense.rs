//! Scenario 5 (replay defense): a signed `PERIPH_CALL` delivered once is
//! processed; the byte-identical envelope re-delivered later (well inside
//! the max-age window, so only the nonce makes it suspect) is silently
//! dropped and never reaches the adapter a second time.
//!
//! This goes around `Channel::send`, which mints a fresh nonce on every
//! call, to inject the exact previously-signed bytes via the raw
//! [`pf_transport::Endpoint`] — the only way a genuine nonce replay can
//! happen on this wire.

use pf_crypto::SecurityContext;
use pf_proto::{CallPayload, Message, MessageType};
use pf_telemetry::TelemetryHook;
use pf_test_support::{MockNetwork, MockPeripheralAdapter};
use pf_transport::{Channel, Endpoint};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "a-sixteen-char-secret!!";

#[tokio::test]
async fn replayed_envelope_is_silently_dropped_and_never_reinvokes_the_adapter() {
    let network = MockNetwork::new();
    let invocations = Arc::new(AtomicUsize::new(0));

    let adapter = Arc::new(MockPeripheralAdapter::new());
    let invocations_clone = invocations.clone();
    adapter.add_peripheral("inv0", "minecraft:chest", vec!["list".to_owned()], move |_method, _args| {
        invocations_clone.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!([]))
    });
    let host = Arc::new(pf_host::HostServer::new("A", "Host A", adapter, TelemetryHook::new()));
    host.scan().await;

    let host_channel = Channel::new(network.endpoint("A"), Arc::new(SecurityContext::with_secret(SECRET).unwrap()));

    // Craft the envelope by hand so we keep the raw bytes to replay later —
    // Channel::send would mint a fresh nonce on a second call and couldn't
    // reproduce a real replay.
    let client_endpoint = network.endpoint("B");
    let client_security = SecurityContext::with_secret(SECRET).unwrap();
    let call = Message::new_call(
        "req-1".to_owned(),
        CallPayload {
            peripheral: "inv0".to_owned(),
            method: "list".to_owned(),
            args: serde_json::Value::Null,
            options: None,
        },
        1_000,
    );
    let envelope = client_security.sign(&call.to_json().unwrap(), 1_000).unwrap();
    let bytes = serde_json::to_vec(&envelope).unwrap();

    client_endpoint.send_to("A", bytes.clone()).await.unwrap();
    let (peer, message) = host_channel.receive(Duration::from_millis(50), 1_000).await.expect("first delivery succeeds");
    assert_eq!(message.message_type, MessageType::PeriphCall);
    let request_id = message.request_id.clone().unwrap();
    let decoded = message.decode_call().unwrap();
    let _reply = host.dispatch_call(request_id, decoded, 1_000).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // Re-deliver the exact same bytes 30s later — well under MAX_MESSAGE_AGE_MS
    // (60s), so only the repeated nonce can reject it.
    client_endpoint.send_to("A", bytes).await.unwrap();
    let replay = host_channel.receive(Duration::from_millis(50), 1_000 + 30_000).await;
    assert!(replay.is_none(), "a byte-identical replay must never be delivered");
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "the adapter must not see the replayed call");
}
