//! pf-proto: wire message types for the peripheral-proxy fabric.
//!
//! Every message on the wire is a `Message { type, data, requestId?, timestamp }`.
//! `type` is drawn from a closed set (`MessageType`); `data` is an opaque JSON
//! object whose shape depends on `type`. Typed payload structs below describe
//! each shape; `Message::new_*` factories build a `Message` with `data` already
//! encoded, and `Message::decode_*` accessors decode it back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// Message envelope (type + data + requestId? + timestamp)
// ---------------------------------------------------------------------------

/// The closed set of message kinds. Unrecognized kinds decode to `Unknown`
/// rather than failing, so callers can reject them explicitly (§4.3: "unknown
/// type" is a rejection reason, not a parse panic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    PeriphAnnounce,
    PeriphDiscover,
    PeriphList,
    PeriphCall,
    PeriphResult,
    PeriphError,
    PeriphSubscribe,
    PeriphUnsubscribe,
    PeriphStatePush,
    Ok,
    Error,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// True for message types that carry an implicit request/response
    /// correlation (§3: "a message is a request iff requestId is set and its
    /// type is a known request type").
    pub fn is_request_type(self) -> bool {
        matches!(
            self,
            MessageType::PeriphDiscover
                | MessageType::PeriphCall
                | MessageType::PeriphSubscribe
                | MessageType::PeriphUnsubscribe
        )
    }
}

/// A single protocol message, the payload carried inside a signed [`Envelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub data: serde_json::Value,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("message has no recognized type")]
    UnknownType,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Message {
    fn build(
        message_type: MessageType,
        data: impl Serialize,
        request_id: Option<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            message_type,
            data: serde_json::to_value(data).expect("payload structs always serialize"),
            request_id,
            timestamp,
        }
    }

    /// Parse a message from JSON, rejecting unknown `type` per §4.3.
    pub fn parse(json: &str) -> Result<Self, ProtoError> {
        let msg: Message = serde_json::from_str(json)?;
        if matches!(msg.message_type, MessageType::Unknown) {
            return Err(ProtoError::UnknownType);
        }
        Ok(msg)
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtoError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    // -- Factories -----------------------------------------------------------

    pub fn new_announce(payload: AnnouncePayload, timestamp: u64) -> Self {
        Self::build(MessageType::PeriphAnnounce, payload, None, timestamp)
    }

    pub fn new_legacy_announce(payload: LegacyAnnouncePayload, timestamp: u64) -> Self {
        Self::build(MessageType::PeriphAnnounce, payload, None, timestamp)
    }

    pub fn new_discover(request_id: String, timestamp: u64) -> Self {
        Self::build(MessageType::PeriphDiscover, serde_json::json!({}), Some(request_id), timestamp)
    }

    pub fn new_list(request_id: String, payload: ListPayload, timestamp: u64) -> Self {
        Self::build(MessageType::PeriphList, payload, Some(request_id), timestamp)
    }

    pub fn new_call(request_id: String, payload: CallPayload, timestamp: u64) -> Self {
        Self::build(MessageType::PeriphCall, payload, Some(request_id), timestamp)
    }

    pub fn new_result(request_id: String, payload: ResultPayload, timestamp: u64) -> Self {
        Self::build(MessageType::PeriphResult, payload, Some(request_id), timestamp)
    }

    pub fn new_error(request_id: Option<String>, payload: ErrorPayload, timestamp: u64) -> Self {
        Self::build(MessageType::PeriphError, payload, request_id, timestamp)
    }

    pub fn new_subscribe(request_id: String, payload: SubscribePayload, timestamp: u64) -> Self {
        Self::build(MessageType::PeriphSubscribe, payload, Some(request_id), timestamp)
    }

    pub fn new_unsubscribe(request_id: String, payload: SubscribePayload, timestamp: u64) -> Self {
        Self::build(MessageType::PeriphUnsubscribe, payload, Some(request_id), timestamp)
    }

    pub fn new_state_push(payload: StatePushPayload, timestamp: u64) -> Self {
        Self::build(MessageType::PeriphStatePush, payload, None, timestamp)
    }

    // -- Decoders --------------------------------------------------------------

    pub fn decode_announce(&self) -> Result<AnnouncePayload, ProtoError> {
        self.decode()
    }

    pub fn decode_legacy_announce(&self) -> Result<LegacyAnnouncePayload, ProtoError> {
        self.decode()
    }

    /// Try the current announce shape first, falling back to the legacy
    /// full-inventory shape (§4.4: "legacy full-inventory announces are
    /// accepted for backward compatibility").
    pub fn decode_announce_any(&self) -> Result<AnnounceEither, ProtoError> {
        if let Ok(current) = self.decode_announce() {
            return Ok(AnnounceEither::Current(current));
        }
        Ok(AnnounceEither::Legacy(self.decode_legacy_announce()?))
    }

    pub fn decode_list(&self) -> Result<ListPayload, ProtoError> {
        self.decode()
    }

    pub fn decode_call(&self) -> Result<CallPayload, ProtoError> {
        self.decode()
    }

    pub fn decode_result(&self) -> Result<ResultPayload, ProtoError> {
        self.decode()
    }

    pub fn decode_error(&self) -> Result<ErrorPayload, ProtoError> {
        self.decode()
    }

    pub fn decode_subscribe(&self) -> Result<SubscribePayload, ProtoError> {
        self.decode()
    }

    pub fn decode_state_push(&self) -> Result<StatePushPayload, ProtoError> {
        self.decode()
    }
}

pub enum AnnounceEither {
    Current(AnnouncePayload),
    Legacy(LegacyAnnouncePayload),
}

// ---------------------------------------------------------------------------
// Envelope (signed wrapper)
// ---------------------------------------------------------------------------

/// The signed, timestamped, nonced wrapper around a serialized [`Message`].
///
/// Field names match the frozen wire format (§6): `v`, `p`, `t`, `n`, `s`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    pub p: String,
    pub t: u64,
    pub n: String,
    pub s: String,
}

pub const ENVELOPE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// One peripheral's public surface, as carried in discovery lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub peripheral_type: String,
    pub methods: Vec<String>,
}

/// Cheap is-active probe summary, carried in announces and activity pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub name: String,
    pub active: bool,
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// PERIPH_ANNOUNCE
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    pub host_id: String,
    pub host_name: String,
    pub state_hash: String,
    pub peripheral_count: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub activity: Option<Vec<ActivitySummary>>,
}

/// Legacy full-inventory announce shape, accepted for backward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAnnouncePayload {
    pub host_id: String,
    pub host_name: String,
    pub peripherals: Vec<PeripheralSummary>,
}

// ---------------------------------------------------------------------------
// PERIPH_DISCOVER / PERIPH_LIST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPayload {
    pub host_id: String,
    pub host_name: String,
    pub peripherals: Vec<PeripheralSummary>,
}

// ---------------------------------------------------------------------------
// PERIPH_CALL / PERIPH_RESULT / PERIPH_ERROR
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOptions {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<u64>,
    #[serde(rename = "resultHash", skip_serializing_if = "Option::is_none", default)]
    pub result_hash: Option<String>,
    #[serde(rename = "queryId", skip_serializing_if = "Option::is_none", default)]
    pub query_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub page: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallPayload {
    pub peripheral: String,
    pub method: String,
    #[serde(default = "default_args")]
    pub args: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub options: Option<CallOptions>,
}

fn default_args() -> serde_json::Value {
    serde_json::Value::Null
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMeta {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chunked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub done: Option<bool>,
    #[serde(rename = "queryId", skip_serializing_if = "Option::is_none", default)]
    pub query_id: Option<String>,
    #[serde(rename = "resultHash", skip_serializing_if = "Option::is_none", default)]
    pub result_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unchanged: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub results: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<ResultMeta>,
}

/// Frozen error taxonomy (§7). Carried verbatim as the `code` on the wire.
pub mod error_codes {
    pub const NOT_CONNECTED: &str = "not_connected";
    pub const TIMEOUT: &str = "timeout";
    pub const PERIPHERAL_NOT_FOUND: &str = "peripheral_not_found";
    pub const METHOD_NOT_FOUND: &str = "method_not_found";
    pub const METHOD_UNAVAILABLE: &str = "method_unavailable";
    pub const INVOKE_FAILED: &str = "invoke_failed";
    pub const SNAPSHOT_REQUIRED: &str = "snapshot_required";
    pub const SNAPSHOT_EXPIRED: &str = "snapshot_expired";
    pub const BAD_SIGNATURE: &str = "bad_signature";
    pub const EXPIRED: &str = "expired";
    pub const FUTURE: &str = "future";
    pub const REPLAY: &str = "replay";
    pub const MALFORMED: &str = "malformed";
    pub const NO_SECRET: &str = "no_secret";
    pub const DISCONNECTED: &str = "disconnected";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// PERIPH_SUBSCRIBE / PERIPH_UNSUBSCRIBE / PERIPH_STATE_PUSH
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub peripheral: String,
    pub method: String,
    #[serde(default = "default_args")]
    pub args: serde_json::Value,
    #[serde(rename = "intervalMs", skip_serializing_if = "Option::is_none", default)]
    pub interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub event: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePushPayload {
    pub peripheral: String,
    pub method: String,
    pub args: serde_json::Value,
    pub results: serde_json::Value,
    pub meta: ResultMeta,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub event: Option<String>,
    pub host_id: String,
}

// ---------------------------------------------------------------------------
// Helpers shared by registry/RPC crates
// ---------------------------------------------------------------------------

/// `hostId::name`, the globally unique identifier of a remote peripheral.
pub fn composite_key(host_id: &str, name: &str) -> String {
    format!("{host_id}::{name}")
}

/// Sorted, de-duplicated method list used wherever method order must be
/// deterministic for hashing (`RemotePeripheral.methods` is an ordered set).
pub fn ordered_methods(methods: impl IntoIterator<Item = String>) -> Vec<String> {
    let set: BTreeSet<String> = methods.into_iter().collect();
    set.into_iter().collect()
}
