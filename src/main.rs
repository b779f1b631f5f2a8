// pf-demo-node: boots one host and one querying client over the in-memory
// mock transport, walks them through announce, discover, a direct call, and
// a few cached reads through the proxy layer. There is no real radio to
// target — see pf-test-support for the mock network this binds to.

use async_trait::async_trait;
use pf_crypto::SecurityContext;
use pf_proto::Message;
use pf_telemetry::TelemetryHook;
use pf_test_support::{MockNetwork, MockPeripheralAdapter};
use pf_transport::Channel;
use peripheral_fabric::PeripheralClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEMO_CONFIG: &str = r#"
node_id = "demo-querier"
secret_source = "inline:a-sixteen-char-secret!"
"#;

struct DiscoverViaClient(Arc<PeripheralClient>);

#[async_trait]
impl pf_proxy::Rediscoverer for DiscoverViaClient {
    async fn rediscover(&self, host_id: &str, now_ms: u64) -> bool {
        self.0.issue_discover(host_id, now_ms).await;
        true
    }
}

/// Keeps `host_channel` answering `PERIPH_CALL`/`PERIPH_DISCOVER` until the
/// channel closes. Stands in for a host node's own receive loop, which in a
/// real deployment runs on its own task for the node's whole lifetime.
async fn run_host_responder(host: Arc<pf_host::HostServer<MockPeripheralAdapter>>, host_channel: Arc<Channel>) {
    loop {
        let Some((peer, message)) = host_channel.receive(Duration::from_secs(5), logical_now()).await else {
            continue;
        };
        let Some(request_id) = message.request_id.clone() else {
            continue;
        };
        let now_ms = logical_now();
        let reply = match message.message_type {
            pf_proto::MessageType::PeriphDiscover => Some(host.dispatch_discover(request_id, now_ms).await),
            pf_proto::MessageType::PeriphCall => match message.decode_call() {
                Ok(call) => Some(host.dispatch_call(request_id, call, now_ms).await),
                Err(_) => None,
            },
            _ => None,
        };
        if let Some(reply) = reply {
            if host_channel.send(&peer, &reply, now_ms).await.is_err() {
                return;
            }
        }
    }
}

fn logical_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as u64
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "pf-demo-node starting");

    let cfg = match pf_config::load_from_str(DEMO_CONFIG) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load demo config: {e}");
            std::process::exit(1);
        }
    };
    info!(node_id = %cfg.node_id, "config loaded");

    let network = MockNetwork::new();
    let secret = "a-sixteen-char-secret!!";

    let adapter = Arc::new(MockPeripheralAdapter::new());
    adapter.add_peripheral("inv0", "minecraft:chest", vec!["list".to_owned()], |method, _args| {
        assert_eq!(method, "list");
        Ok(serde_json::json!([{"slot": 1, "count": 42, "name": "minecraft:cobblestone"}]))
    });
    let host = Arc::new(pf_host::HostServer::new("host-a", "Host A", adapter, TelemetryHook::new()));
    let host_channel = Arc::new(Channel::new(
        network.endpoint("host-a"),
        Arc::new(SecurityContext::with_secret(secret).unwrap()),
    ));

    let scan = host.scan().await;
    info!(count = scan.count, changed = scan.changed, "host scan complete");

    let querier_channel = Arc::new(Channel::new(
        network.endpoint(cfg.node_id.clone()),
        Arc::new(SecurityContext::with_secret(secret).unwrap()),
    ));
    let querier = Arc::new(PeripheralClient::new(cfg.node_id.clone(), querier_channel, TelemetryHook::new()));

    tokio::spawn(run_host_responder(host.clone(), host_channel.clone()));

    let now_ms = logical_now();
    let announce = host.announce_payload(None).await;
    host_channel.broadcast(&Message::new_announce(announce, now_ms), now_ms).await.unwrap();

    let (peer, message) = querier.channel().receive(Duration::from_secs(1), logical_now()).await.expect("announce should arrive");
    querier.handle_inbound(&peer, message, logical_now()).await;
    querier.issue_discover("host-a", logical_now()).await;

    let (peer, message) = querier.channel().receive(Duration::from_secs(1), logical_now()).await.expect("list should arrive");
    querier.handle_inbound(&peer, message, logical_now()).await;

    info!(peripherals = ?querier.get_names().await, "discovery complete");

    let proxy = pf_proxy::ProxyCache::new(querier.rpc().clone(), DiscoverViaClient(querier.clone()), querier.telemetry().clone());

    for idx in 0..3 {
        let now_ms = logical_now();
        let outcome = proxy.call_read("host-a", "inv0", "list", serde_json::json!({}), now_ms).await;
        info!(iteration = idx, ?outcome, "cached read");
        if idx == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    info!("pf-demo-node finished");
}
