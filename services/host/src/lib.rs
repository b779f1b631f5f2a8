//! pf-host: the host server (C8), answering `PERIPH_DISCOVER`/`PERIPH_CALL`
//! for a node's local peripherals.
//!
//! Grounded on `services/server`'s `state.rs` registries and
//! `ws_forwarder.rs` dispatch loop, adapted from a central WS hub serving
//! many clients to a peer node that both broadcasts heartbeats and answers
//! calls directly over a [`pf_transport::Channel`].

use pf_proto::{
    error_codes, ActivitySummary, AnnouncePayload, CallOptions, CallPayload, ErrorInfo, ListPayload, Message,
    PeripheralSummary, ResultMeta, ResultPayload, StatePushPayload,
};
use pf_telemetry::TelemetryHook;
use pf_transport::PeripheralAdapter;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const ANNOUNCE_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_CHUNK_LIMIT: u64 = 200;
pub const MAX_CHUNK_LIMIT: u64 = 1_000;
pub const SNAPSHOT_TTL_MS: u64 = 5_000;
pub const ACTIVITY_POLL_INTERVAL_MS: u64 = 1_500;
pub const DEFAULT_SUBSCRIBE_INTERVAL_MS: u64 = 1_000;

const EXCLUDED_TYPES: &[&str] = &["monitor", "modem", "computer", "turtle", "pocket"];

fn is_excluded_type(type_str: &str) -> bool {
    EXCLUDED_TYPES.iter().any(|excluded| pf_registry::type_matches(type_str, excluded))
}

fn is_heavy_method(method: &str) -> bool {
    matches!(method, "getItems" | "getFluids" | "getChemicals") || method.starts_with("getCraftable")
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("peripheral not found: {0}")]
    PeripheralNotFound(String),
    #[error("method not found: {peripheral}.{method}")]
    MethodNotFound { peripheral: String, method: String },
    #[error("offset requires a queryId from the first page")]
    SnapshotRequired,
    #[error("no live snapshot for that queryId")]
    SnapshotExpired,
    #[error("adapter invocation failed: {0}")]
    InvokeFailed(String),
}

impl From<HostError> for ErrorInfo {
    fn from(err: HostError) -> Self {
        let code = match &err {
            HostError::PeripheralNotFound(_) => error_codes::PERIPHERAL_NOT_FOUND,
            HostError::MethodNotFound { .. } => error_codes::METHOD_NOT_FOUND,
            HostError::SnapshotRequired => error_codes::SNAPSHOT_REQUIRED,
            HostError::SnapshotExpired => error_codes::SNAPSHOT_EXPIRED,
            HostError::InvokeFailed(_) => error_codes::INVOKE_FAILED,
        };
        ErrorInfo::new(code, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InventoryEntry {
    name: String,
    peripheral_type: String,
    methods: Vec<String>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    items: Vec<Value>,
    total: u64,
    result_hash: String,
    expires_at_ms: u64,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct SubscriptionKey {
    client_id: String,
    peripheral: String,
    method: String,
    args_key: String,
}

#[derive(Debug, Clone)]
struct Subscription {
    interval_ms: u64,
    next_due_ms: u64,
    last_result_hash: Option<String>,
    event: Option<String>,
    args: Value,
}

struct HostState {
    inventory: Vec<InventoryEntry>,
    state_hash: String,
    snapshots: HashMap<String, Snapshot>,
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    last_activity: HashMap<String, (bool, Value)>,
    next_query_id: u64,
}

impl HostState {
    fn empty() -> Self {
        Self {
            inventory: Vec::new(),
            state_hash: String::new(),
            snapshots: HashMap::new(),
            subscriptions: HashMap::new(),
            last_activity: HashMap::new(),
            next_query_id: 0,
        }
    }
}

/// Outcome of a scan: whether the inventory changed since the prior scan, and
/// the values a heartbeat needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub changed: bool,
    pub count: u64,
}

/// A node's local peripheral host. Generic over the adapter so tests run
/// against [`pf_test_support::MockPeripheralAdapter`] with no hardware.
pub struct HostServer<A: PeripheralAdapter + 'static> {
    host_id: String,
    host_name: String,
    adapter: Arc<A>,
    telemetry: TelemetryHook,
    state: RwLock<HostState>,
}

impl<A: PeripheralAdapter + 'static> HostServer<A> {
    pub fn new(host_id: impl Into<String>, host_name: impl Into<String>, adapter: Arc<A>, telemetry: TelemetryHook) -> Self {
        Self {
            host_id: host_id.into(),
            host_name: host_name.into(),
            adapter,
            telemetry,
            state: RwLock::new(HostState::empty()),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Scan local peripherals, filter the exclusion set, and recompute the
    /// deterministic state hash. Used both at boot and on rescan.
    pub async fn scan(&self) -> ScanOutcome {
        let mut entries = Vec::new();
        for info in self.adapter.list_local_peripherals() {
            if is_excluded_type(&info.peripheral_type) {
                continue;
            }
            let methods = pf_proto::ordered_methods(self.adapter.list_methods(&info.name));
            entries.push(InventoryEntry {
                name: info.name,
                peripheral_type: info.peripheral_type,
                methods,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let hash = compute_state_hash(&entries);
        let count = entries.len() as u64;

        let mut state = self.state.write().await;
        let changed = state.state_hash != hash;
        state.inventory = entries;
        state.state_hash = hash;
        ScanOutcome { changed, count }
    }

    pub async fn state_hash(&self) -> String {
        self.state.read().await.state_hash.clone()
    }

    pub async fn announce_payload(&self, activity: Option<Vec<ActivitySummary>>) -> AnnouncePayload {
        let state = self.state.read().await;
        AnnouncePayload {
            host_id: self.host_id.clone(),
            host_name: self.host_name.clone(),
            state_hash: state.state_hash.clone(),
            peripheral_count: state.inventory.len() as u64,
            activity,
        }
    }

    async fn handle_discover(&self) -> ListPayload {
        let state = self.state.read().await;
        ListPayload {
            host_id: self.host_id.clone(),
            host_name: self.host_name.clone(),
            peripherals: state
                .inventory
                .iter()
                .map(|e| PeripheralSummary {
                    name: e.name.clone(),
                    peripheral_type: e.peripheral_type.clone(),
                    methods: e.methods.clone(),
                })
                .collect(),
        }
    }

    /// Build the `PERIPH_LIST` reply to a `PERIPH_DISCOVER`.
    pub async fn dispatch_discover(&self, request_id: String, now_ms: u64) -> Message {
        let payload = self.handle_discover().await;
        Message::new_list(request_id, payload, now_ms)
    }

    /// Handle a `PERIPH_CALL`: validate, invoke inside a crash-isolated task,
    /// and shape the response for heavy list methods.
    pub async fn handle_call(&self, call: &CallPayload, now_ms: u64) -> Result<ResultPayload, HostError> {
        {
            let state = self.state.read().await;
            let entry = state
                .inventory
                .iter()
                .find(|e| e.name == call.peripheral)
                .ok_or_else(|| HostError::PeripheralNotFound(call.peripheral.clone()))?;
            if !entry.methods.iter().any(|m| m == &call.method) {
                return Err(HostError::MethodNotFound {
                    peripheral: call.peripheral.clone(),
                    method: call.method.clone(),
                });
            }
        }

        let adapter = self.adapter.clone();
        let peripheral = call.peripheral.clone();
        let method = call.method.clone();
        let args = call.args.clone();
        let invoked = tokio::spawn(async move { adapter.invoke(&peripheral, &method, args).await }).await;

        let value = match invoked {
            Ok(Ok(value)) => value,
            Ok(Err(adapter_err)) => {
                self.telemetry.record_call_failed();
                return Err(HostError::InvokeFailed(adapter_err.to_string()));
            }
            Err(join_err) => {
                self.telemetry.record_call_failed();
                return Err(HostError::InvokeFailed(format!("adapter task panicked: {join_err}")));
            }
        };
        self.telemetry.record_call_dispatched();

        if is_heavy_method(&call.method) {
            self.shape_heavy_result(value, call.options.clone(), now_ms).await
        } else {
            Ok(ResultPayload { results: Some(value), meta: None })
        }
    }

    /// Build the `PERIPH_RESULT`/`PERIPH_ERROR` reply to a `PERIPH_CALL`.
    pub async fn dispatch_call(&self, request_id: String, call: CallPayload, now_ms: u64) -> Message {
        match self.handle_call(&call, now_ms).await {
            Ok(payload) => Message::new_result(request_id, payload, now_ms),
            Err(err) => Message::new_error(Some(request_id), pf_proto::ErrorPayload { error: err.into() }, now_ms),
        }
    }

    async fn shape_heavy_result(&self, value: Value, options: Option<CallOptions>, now_ms: u64) -> Result<ResultPayload, HostError> {
        let (reduced, result_hash) = reduce_if_heavy_value(&value);
        let reduced = match reduced {
            Value::Array(rows) => rows,
            _ => Vec::new(),
        };
        let options = options.unwrap_or_default();

        if options.result_hash.as_deref() == Some(result_hash.as_str()) {
            return Ok(ResultPayload {
                results: None,
                meta: Some(ResultMeta {
                    unchanged: Some(true),
                    result_hash: Some(result_hash),
                    ..Default::default()
                }),
            });
        }

        let total = reduced.len() as u64;
        let offset = options.offset.unwrap_or(0);
        let limit = options.limit.unwrap_or(DEFAULT_CHUNK_LIMIT).min(MAX_CHUNK_LIMIT);

        let mut state = self.state.write().await;
        state.snapshots.retain(|_, snap| snap.expires_at_ms > now_ms);

        if offset == 0 {
            let end = (limit.min(total)) as usize;
            let page = reduced[..end].to_vec();
            let done = end as u64 >= total;
            let query_id = if done {
                None
            } else {
                let id = format!("snap-{}", state.next_query_id);
                state.next_query_id += 1;
                state.snapshots.insert(
                    id.clone(),
                    Snapshot {
                        items: reduced,
                        total,
                        result_hash: result_hash.clone(),
                        expires_at_ms: now_ms + SNAPSHOT_TTL_MS,
                    },
                );
                Some(id)
            };
            Ok(ResultPayload {
                results: Some(Value::Array(page)),
                meta: Some(ResultMeta {
                    chunked: Some(true),
                    total: Some(total),
                    offset: Some(0),
                    limit: Some(limit),
                    done: Some(done),
                    query_id,
                    result_hash: Some(result_hash),
                    unchanged: None,
                }),
            })
        } else {
            let query_id = options.query_id.ok_or(HostError::SnapshotRequired)?;
            let (page, total, result_hash, done) = {
                let snapshot = state.snapshots.get_mut(&query_id).ok_or(HostError::SnapshotExpired)?;
                snapshot.expires_at_ms = now_ms + SNAPSHOT_TTL_MS;
                let total = snapshot.total;
                let start = offset.min(total) as usize;
                let end = (offset + limit).min(total) as usize;
                let page = snapshot.items[start..end].to_vec();
                let done = end as u64 >= total;
                (page, total, snapshot.result_hash.clone(), done)
            };
            if done {
                state.snapshots.remove(&query_id);
            }
            Ok(ResultPayload {
                results: Some(Value::Array(page)),
                meta: Some(ResultMeta {
                    chunked: Some(true),
                    total: Some(total),
                    offset: Some(offset),
                    limit: Some(limit),
                    done: Some(done),
                    query_id: Some(query_id),
                    result_hash: Some(result_hash),
                    unchanged: None,
                }),
            })
        }
    }

    // -- Subscriptions --------------------------------------------------

    pub async fn subscribe(&self, client_id: &str, peripheral: &str, method: &str, args: Value, interval_ms: Option<u64>, event: Option<String>, now_ms: u64) {
        let key = SubscriptionKey {
            client_id: client_id.to_owned(),
            peripheral: peripheral.to_owned(),
            method: method.to_owned(),
            args_key: canonical_args_key(&args),
        };
        let mut state = self.state.write().await;
        state.subscriptions.insert(
            key,
            Subscription {
                interval_ms: interval_ms.unwrap_or(DEFAULT_SUBSCRIBE_INTERVAL_MS).max(1),
                next_due_ms: now_ms,
                last_result_hash: None,
                event,
                args,
            },
        );
    }

    pub async fn unsubscribe(&self, client_id: &str, peripheral: &str, method: &str, args: &Value) {
        let key = SubscriptionKey {
            client_id: client_id.to_owned(),
            peripheral: peripheral.to_owned(),
            method: method.to_owned(),
            args_key: canonical_args_key(args),
        };
        self.state.write().await.subscriptions.remove(&key);
    }

    /// Invoke every subscription due at `now_ms`; returns `(clientId, push)`
    /// pairs for the caller to deliver. Unchanged results reschedule silently.
    pub async fn tick_subscriptions(&self, now_ms: u64) -> Vec<(String, StatePushPayload)> {
        let due: Vec<SubscriptionKey> = {
            let state = self.state.read().await;
            state
                .subscriptions
                .iter()
                .filter(|(_, sub)| sub.next_due_ms <= now_ms)
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut pushes = Vec::new();
        for key in due {
            let Some((args, interval_ms, last_hash, event)) = ({
                let state = self.state.read().await;
                state.subscriptions.get(&key).map(|sub| (sub.args.clone(), sub.interval_ms, sub.last_result_hash.clone(), sub.event.clone()))
            }) else {
                continue;
            };

            let adapter = self.adapter.clone();
            let peripheral = key.peripheral.clone();
            let method = key.method.clone();
            let invoke_args = args.clone();
            let invoked = tokio::spawn(async move { adapter.invoke(&peripheral, &method, invoke_args).await }).await;

            let mut state = self.state.write().await;
            let Some(sub) = state.subscriptions.get_mut(&key) else { continue };
            sub.next_due_ms = now_ms + interval_ms;

            match invoked {
                Ok(Ok(value)) => {
                    let (shaped, hash) = reduce_if_heavy_value_for_method(&key.method, &value);
                    if Some(&hash) != last_hash.as_ref() {
                        sub.last_result_hash = Some(hash.clone());
                        pushes.push((
                            key.client_id.clone(),
                            StatePushPayload {
                                peripheral: key.peripheral.clone(),
                                method: key.method.clone(),
                                args,
                                results: shaped,
                                meta: ResultMeta {
                                    result_hash: Some(hash),
                                    ..Default::default()
                                },
                                event,
                                host_id: self.host_id.clone(),
                            },
                        ));
                    }
                }
                _ => self.telemetry.record_call_failed(),
            }
        }
        pushes
    }

    /// Poll every peripheral's cheap activity probe; returns change-detected
    /// pushes for the caller to broadcast to every known client.
    pub async fn tick_activity(&self) -> Vec<StatePushPayload> {
        let names: Vec<String> = {
            let state = self.state.read().await;
            state.inventory.iter().map(|e| e.name.clone()).collect()
        };

        let mut pushes = Vec::new();
        for name in names {
            let Some((active, data)) = self.adapter.activity_probe(&name).await else {
                continue;
            };
            let mut state = self.state.write().await;
            let changed = state.last_activity.get(&name) != Some(&(active, data.clone()));
            if !changed {
                continue;
            }
            state.last_activity.insert(name.clone(), (active, data.clone()));
            drop(state);

            let hash = pf_crypto::weak_hash(&format!("{active}:{data}"));
            pushes.push(StatePushPayload {
                peripheral: name,
                method: "activityProbe".to_owned(),
                args: Value::Null,
                results: serde_json::json!({ "active": active, "data": data }),
                meta: ResultMeta {
                    result_hash: Some(hash),
                    ..Default::default()
                },
                event: Some("activity".to_owned()),
                host_id: self.host_id.clone(),
            });
        }
        pushes
    }
}

fn canonical_args_key(args: &Value) -> String {
    serde_json::to_string(args).unwrap_or_default()
}

fn compute_state_hash(entries: &[InventoryEntry]) -> String {
    let canonical: Vec<Value> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "name": e.name,
                "type": e.peripheral_type,
                "methods": e.methods,
            })
        })
        .collect();
    pf_crypto::weak_hash(&serde_json::to_string(&canonical).unwrap_or_default())
}

fn reduce_record(row: &Value) -> Value {
    const FIELDS: [&str; 5] = ["name", "displayName", "count", "amount", "isCraftable"];
    let mut reduced = serde_json::Map::new();
    if let Some(obj) = row.as_object() {
        for field in FIELDS {
            if let Some(value) = obj.get(field) {
                reduced.insert(field.to_owned(), value.clone());
            }
        }
    }
    Value::Object(reduced)
}

fn record_sort_key(row: &Value) -> (String, String, i64, i64, u8) {
    let str_field = |key: &str| row.get(key).and_then(|v| v.as_str()).unwrap_or("").to_owned();
    let num_field = |key: &str| row.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
    let craftable = row.get("isCraftable").and_then(|v| v.as_bool()).unwrap_or(false) as u8;
    (str_field("name"), str_field("displayName"), num_field("count"), num_field("amount"), craftable)
}

/// Reduce+hash a heavy-method array result (field whitelist, deterministic
/// sort, `resultHash` over the sorted reduced rows).
fn reduce_if_heavy_value(value: &Value) -> (Value, String) {
    let mut rows: Vec<Value> = value.as_array().map(|rows| rows.iter().map(reduce_record).collect()).unwrap_or_default();
    rows.sort_by_key(record_sort_key);
    let hash = pf_crypto::weak_hash(&serde_json::to_string(&rows).unwrap_or_default());
    (Value::Array(rows), hash)
}

/// Same as [`reduce_if_heavy_value`] but for a method that may or may not be
/// heavy — a subscription target can be either. Non-heavy results hash the
/// raw canonical value and pass it through unshaped.
fn reduce_if_heavy_value_for_method(method: &str, value: &Value) -> (Value, String) {
    if is_heavy_method(method) {
        reduce_if_heavy_value(value)
    } else {
        let hash = pf_crypto::weak_hash(&serde_json::to_string(value).unwrap_or_default());
        (value.clone(), hash)
    }
}
