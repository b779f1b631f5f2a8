//! pf-test-support: in-memory mock transport and peripheral adapter (§1.1 S3).
//!
//! Grounded in `crates/rt-test-utils`'s `MockWsServer`/`MockWsClient` pair: a
//! shared in-process hub that multiple endpoints attach to, standing in for
//! real sockets or radios in tests.

use async_trait::async_trait;
use pf_transport::{AdapterError, Endpoint, EndpointKind, LocalPeripheralInfo, PeripheralAdapter, TransportError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Default)]
struct NetworkInner {
    inboxes: HashMap<String, VecDeque<(String, Vec<u8>)>>,
    closed: HashMap<String, bool>,
}

/// The shared in-memory network multiple [`MockEndpoint`]s attach to.
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint for `peer_id`, defaulting to the wireless kind
    /// (the kind real endpoints would have won the open-preference rule
    /// with).
    pub fn endpoint(&self, peer_id: impl Into<String>) -> Arc<MockEndpoint> {
        let peer_id = peer_id.into();
        self.inner.lock().expect("network lock poisoned").inboxes.entry(peer_id.clone()).or_default();
        Arc::new(MockEndpoint {
            peer_id,
            kind: EndpointKind::Wireless,
            network: self.inner.clone(),
        })
    }
}

pub struct MockEndpoint {
    peer_id: String,
    kind: EndpointKind,
    network: Arc<Mutex<NetworkInner>>,
}

impl MockEndpoint {
    fn is_closed(&self) -> bool {
        *self.network.lock().expect("network lock poisoned").closed.get(&self.peer_id).unwrap_or(&false)
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn kind(&self) -> EndpointKind {
        self.kind
    }

    async fn send_to(&self, peer_id: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut network = self.network.lock().expect("network lock poisoned");
        network
            .inboxes
            .entry(peer_id.to_owned())
            .or_default()
            .push_back((self.peer_id.clone(), bytes));
        Ok(())
    }

    async fn broadcast(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut network = self.network.lock().expect("network lock poisoned");
        let targets: Vec<String> = network.inboxes.keys().filter(|k| *k != &self.peer_id).cloned().collect();
        for target in targets {
            network.inboxes.entry(target).or_default().push_back((self.peer_id.clone(), bytes.clone()));
        }
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<(String, Vec<u8>)>, TransportError> {
        let step = Duration::from_millis(1).min(timeout.max(Duration::from_millis(1)));
        let mut waited = Duration::ZERO;
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            {
                let mut network = self.network.lock().expect("network lock poisoned");
                if let Some(inbox) = network.inboxes.get_mut(&self.peer_id) {
                    if let Some(message) = inbox.pop_front() {
                        return Ok(Some(message));
                    }
                }
            }
            if waited >= timeout {
                return Ok(None);
            }
            sleep(step).await;
            waited += step;
        }
    }

    async fn close(&self) {
        self.network
            .lock()
            .expect("network lock poisoned")
            .closed
            .insert(self.peer_id.clone(), true);
    }
}

// ---------------------------------------------------------------------------
// Mock peripheral adapter
// ---------------------------------------------------------------------------

type InvokeFn = dyn Fn(&str, serde_json::Value) -> Result<serde_json::Value, AdapterError> + Send + Sync;

struct MockPeripheral {
    info: LocalPeripheralInfo,
    methods: Vec<String>,
    invoke: Arc<InvokeFn>,
    activity: Option<(bool, serde_json::Value)>,
}

/// A configurable in-memory peripheral host, standing in for a real local
/// adapter (ComputerCraft-style block peripherals, in the source domain).
#[derive(Default)]
pub struct MockPeripheralAdapter {
    peripherals: Mutex<HashMap<String, MockPeripheral>>,
}

impl MockPeripheralAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peripheral<F>(&self, name: impl Into<String>, peripheral_type: impl Into<String>, methods: Vec<String>, invoke: F)
    where
        F: Fn(&str, serde_json::Value) -> Result<serde_json::Value, AdapterError> + Send + Sync + 'static,
    {
        let name = name.into();
        self.peripherals.lock().expect("adapter lock poisoned").insert(
            name.clone(),
            MockPeripheral {
                info: LocalPeripheralInfo {
                    name,
                    peripheral_type: peripheral_type.into(),
                },
                methods,
                invoke: Arc::new(invoke),
                activity: None,
            },
        );
    }

    pub fn set_activity(&self, name: &str, active: bool, data: serde_json::Value) {
        if let Some(peripheral) = self.peripherals.lock().expect("adapter lock poisoned").get_mut(name) {
            peripheral.activity = Some((active, data));
        }
    }

    pub fn remove_peripheral(&self, name: &str) {
        self.peripherals.lock().expect("adapter lock poisoned").remove(name);
    }
}

#[async_trait]
impl PeripheralAdapter for MockPeripheralAdapter {
    fn list_local_peripherals(&self) -> Vec<LocalPeripheralInfo> {
        self.peripherals.lock().expect("adapter lock poisoned").values().map(|p| p.info.clone()).collect()
    }

    fn list_methods(&self, name: &str) -> Vec<String> {
        self.peripherals
            .lock()
            .expect("adapter lock poisoned")
            .get(name)
            .map(|p| p.methods.clone())
            .unwrap_or_default()
    }

    async fn invoke(&self, name: &str, method: &str, args: serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        let invoke_fn = {
            let peripherals = self.peripherals.lock().expect("adapter lock poisoned");
            let peripheral = peripherals
                .get(name)
                .ok_or_else(|| AdapterError::new(format!("no such peripheral: {name}")))?;
            peripheral.invoke.clone()
        };
        invoke_fn(method, args)
    }

    async fn activity_probe(&self, name: &str) -> Option<(bool, serde_json::Value)> {
        self.peripherals.lock().expect("adapter lock poisoned").get(name)?.activity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_other_endpoints_but_not_self() {
        let network = MockNetwork::new();
        let a = network.endpoint("A");
        let b = network.endpoint("B");
        let c = network.endpoint("C");

        a.broadcast(b"hello".to_vec()).await.unwrap();

        assert_eq!(b.receive(Duration::from_millis(5)).await.unwrap(), Some(("A".to_owned(), b"hello".to_vec())));
        assert_eq!(c.receive(Duration::from_millis(5)).await.unwrap(), Some(("A".to_owned(), b"hello".to_vec())));
        assert_eq!(a.receive(Duration::from_millis(5)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_to_targets_one_peer() {
        let network = MockNetwork::new();
        let a = network.endpoint("A");
        let b = network.endpoint("B");
        let c = network.endpoint("C");

        a.send_to("B", b"hi".to_vec()).await.unwrap();
        assert_eq!(b.receive(Duration::from_millis(5)).await.unwrap(), Some(("A".to_owned(), b"hi".to_vec())));
        assert_eq!(c.receive(Duration::from_millis(5)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn closed_endpoint_rejects_sends_and_receives() {
        let network = MockNetwork::new();
        let a = network.endpoint("A");
        a.close().await;
        assert!(matches!(a.send_to("B", vec![]).await, Err(TransportError::Closed)));
        assert!(matches!(a.receive(Duration::from_millis(1)).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn mock_adapter_lists_and_invokes() {
        let adapter = MockPeripheralAdapter::new();
        adapter.add_peripheral("inv0", "minecraft:chest", vec!["list".to_owned()], |method, _args| {
            assert_eq!(method, "list");
            Ok(serde_json::json!([{"slot": 1, "count": 10}]))
        });

        assert_eq!(adapter.list_local_peripherals().len(), 1);
        let result = adapter.invoke("inv0", "list", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!([{"slot": 1, "count": 10}]));
    }

    #[tokio::test]
    async fn invoking_unknown_peripheral_is_an_error() {
        let adapter = MockPeripheralAdapter::new();
        let err = adapter.invoke("missing", "list", serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
