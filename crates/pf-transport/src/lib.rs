//! pf-transport: transport channel (C2) plus the external interface traits
//! (§6) that swap in real or mock implementations of "a radio" and "a local
//! peripheral host."

use async_trait::async_trait;
use pf_crypto::SecurityContext;
use pf_proto::{Envelope, Message, MessageType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no secret configured; refusing to send or broadcast")]
    NoSecret,
    #[error("endpoint is closed")]
    Closed,
    #[error("endpoint I/O error: {0}")]
    Io(String),
}

/// Whether an endpoint is the long-range/wireless kind preferred by the
/// open-endpoint rule (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Wired,
    Wireless,
}

/// One raw, unsigned framing endpoint (§6 "Transport contract (provided)").
/// Payload is opaque bytes; signing/verification happens one layer up in
/// [`Channel`].
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn kind(&self) -> EndpointKind;
    async fn send_to(&self, peer_id: &str, bytes: Vec<u8>) -> Result<(), TransportError>;
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
    async fn receive(&self, timeout: Duration) -> Result<Option<(String, Vec<u8>)>, TransportError>;
    async fn close(&self);
}

/// Apply the open-endpoint preference rule: if more than one endpoint exists,
/// keep the wireless/long-range one and close the rest (§4.2, §9 "duplicate
/// delivery on multi-radio nodes" — this must run before any `receive`).
pub async fn select_preferred_endpoint(endpoints: Vec<Arc<dyn Endpoint>>) -> Option<Arc<dyn Endpoint>> {
    if endpoints.is_empty() {
        return None;
    }
    let chosen_idx = endpoints
        .iter()
        .position(|e| e.kind() == EndpointKind::Wireless)
        .unwrap_or(0);

    for (idx, endpoint) in endpoints.iter().enumerate() {
        if idx != chosen_idx {
            endpoint.close().await;
        }
    }
    Some(endpoints.into_iter().nth(chosen_idx).expect("chosen_idx is in range"))
}

type Handler = Arc<dyn Fn(String, Message) + Send + Sync>;

/// The signed channel sitting on top of a single opened [`Endpoint`]. Wraps
/// every outbound message through the envelope codec and unwraps every
/// inbound one; dispatches by `message.type` to a registered handler.
/// Handlers run inline on whichever task calls [`Channel::poll`] — dispatch is
/// single-threaded per channel (§4.2).
pub struct Channel {
    endpoint: Arc<dyn Endpoint>,
    security: Arc<SecurityContext>,
    handlers: std::sync::Mutex<HashMap<MessageType, Handler>>,
}

impl Channel {
    pub fn new(endpoint: Arc<dyn Endpoint>, security: Arc<SecurityContext>) -> Self {
        Self {
            endpoint,
            security,
            handlers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn register_handler<F>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(String, Message) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .expect("handler registry lock poisoned")
            .insert(message_type, Arc::new(handler));
    }

    fn sign(&self, message: &Message, now_ms: u64) -> Result<Vec<u8>, TransportError> {
        let payload = message.to_json().map_err(|e| TransportError::Io(e.to_string()))?;
        let envelope = self.security.sign(&payload, now_ms).map_err(|_| TransportError::NoSecret)?;
        serde_json::to_vec(&envelope).map_err(|e| TransportError::Io(e.to_string()))
    }

    pub async fn send(&self, peer_id: &str, message: &Message, now_ms: u64) -> Result<(), TransportError> {
        let bytes = self.sign(message, now_ms)?;
        self.endpoint.send_to(peer_id, bytes).await
    }

    pub async fn broadcast(&self, message: &Message, now_ms: u64) -> Result<(), TransportError> {
        let bytes = self.sign(message, now_ms)?;
        self.endpoint.broadcast(bytes).await
    }

    /// Receive and verify one envelope. Unverifiable envelopes (bad
    /// signature, stale, replayed, no secret, malformed) are silently
    /// dropped — they never surface as an `Err` (§7: a noisy peer must not
    /// DoS the application).
    pub async fn receive(&self, timeout: Duration, now_ms: u64) -> Option<(String, Message)> {
        let (peer_id, bytes) = self.endpoint.receive(timeout).await.ok().flatten()?;
        let envelope: Envelope = serde_json::from_slice(&bytes).ok()?;
        let payload = self.security.verify(&envelope, now_ms).ok()?;
        let message = Message::parse(&payload).ok()?;
        Some((peer_id, message))
    }

    /// Receive one message and dispatch it to its registered handler, if any.
    /// Returns whether a message was handled.
    pub async fn poll(&self, timeout: Duration, now_ms: u64) -> bool {
        let Some((peer_id, message)) = self.receive(timeout, now_ms).await else {
            return false;
        };
        let handler = self
            .handlers
            .lock()
            .expect("handler registry lock poisoned")
            .get(&message.message_type)
            .cloned();
        match handler {
            Some(handler) => {
                handler(peer_id, message);
                true
            }
            None => {
                tracing::debug!(message_type = ?message.message_type, "no handler registered for message type");
                false
            }
        }
    }

    pub async fn close(&self) {
        self.endpoint.close().await;
    }

    pub fn has_secret(&self) -> bool {
        self.security.has_secret()
    }
}

// ---------------------------------------------------------------------------
// Peripheral adapter contract (provided on host)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeripheralInfo {
    pub name: String,
    pub peripheral_type: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct AdapterError {
    pub message: String,
}

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// The host-side contract over local peripherals (§6).
#[async_trait]
pub trait PeripheralAdapter: Send + Sync {
    fn list_local_peripherals(&self) -> Vec<LocalPeripheralInfo>;
    fn list_methods(&self, name: &str) -> Vec<String>;
    async fn invoke(&self, name: &str, method: &str, args: serde_json::Value) -> Result<serde_json::Value, AdapterError>;
    /// Cheap activity probe, if the peripheral supports one.
    async fn activity_probe(&self, name: &str) -> Option<(bool, serde_json::Value)>;
}
