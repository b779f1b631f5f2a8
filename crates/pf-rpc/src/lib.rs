//! pf-rpc: request correlation, call coalescing, chunked snapshot pagination,
//! timeout sweeping, and async callback fan-out (C6).

use async_trait::async_trait;
use pf_crypto::weak_hash;
use pf_proto::{error_codes, CallOptions, CallPayload, Message};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

pub const DEFAULT_CHUNK_LIMIT: u64 = 200;
pub const MAX_CHUNK_LIMIT: u64 = 1_000;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 3_000;

/// What the engine sends a `PERIPH_CALL` through. Kept as a narrow trait
/// (rather than a direct dependency on a concrete channel type) so the
/// correlation/coalescing/chunking logic here can be exercised with a plain
/// in-memory recorder.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send_call(&self, peer_id: &str, message: &Message, now_ms: u64) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcErrorKind {
    Timeout,
    NotConnected,
    PeripheralNotFound,
    MethodNotFound,
    MethodUnavailable,
    InvokeFailed(String),
    SnapshotRequired,
    SnapshotExpired,
    Other(String),
}

impl std::fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcErrorKind::Timeout => write!(f, "timeout"),
            RpcErrorKind::NotConnected => write!(f, "not_connected"),
            RpcErrorKind::PeripheralNotFound => write!(f, "peripheral_not_found"),
            RpcErrorKind::MethodNotFound => write!(f, "method_not_found"),
            RpcErrorKind::MethodUnavailable => write!(f, "method_unavailable"),
            RpcErrorKind::InvokeFailed(msg) => write!(f, "invoke_failed: {msg}"),
            RpcErrorKind::SnapshotRequired => write!(f, "snapshot_required"),
            RpcErrorKind::SnapshotExpired => write!(f, "snapshot_expired"),
            RpcErrorKind::Other(code) => write!(f, "{code}"),
        }
    }
}

impl std::error::Error for RpcErrorKind {}

impl From<&pf_proto::ErrorInfo> for RpcErrorKind {
    fn from(info: &pf_proto::ErrorInfo) -> Self {
        match info.code.as_str() {
            error_codes::PERIPHERAL_NOT_FOUND => RpcErrorKind::PeripheralNotFound,
            error_codes::METHOD_NOT_FOUND => RpcErrorKind::MethodNotFound,
            error_codes::METHOD_UNAVAILABLE => RpcErrorKind::MethodUnavailable,
            error_codes::INVOKE_FAILED => RpcErrorKind::InvokeFailed(info.message.clone()),
            error_codes::SNAPSHOT_REQUIRED => RpcErrorKind::SnapshotRequired,
            error_codes::SNAPSHOT_EXPIRED => RpcErrorKind::SnapshotExpired,
            error_codes::NOT_CONNECTED => RpcErrorKind::NotConnected,
            other => RpcErrorKind::Other(other.to_owned()),
        }
    }
}

/// A settled call: the concatenation of every chunk page's `results` array
/// (or the single page's body for a non-chunked call), plus whether the host
/// short-circuited with `meta.unchanged=true`.
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    pub results: serde_json::Value,
    pub unchanged: bool,
}

pub type CallOutcome = Result<ResolvedCall, RpcErrorKind>;

struct PendingRequest {
    callbacks: Vec<oneshot::Sender<CallOutcome>>,
    deadline_ms: u64,
    coalesce_key: Option<String>,
    accumulator: Vec<serde_json::Value>,
    host_id: String,
    peripheral: String,
    method: String,
    args: serde_json::Value,
}

/// The C6 RPC engine. One instance per node; shared behind an `Arc` with
/// whatever drives inbound dispatch and the timeout sweep.
pub struct RpcEngine<S: OutboundSender> {
    sender: S,
    pending: Mutex<HashMap<String, PendingRequest>>,
    coalesce_index: Mutex<HashMap<String, String>>,
}

impl<S: OutboundSender> RpcEngine<S> {
    pub fn new(sender: S) -> Self {
        Self {
            sender,
            pending: Mutex::new(HashMap::new()),
            coalesce_index: Mutex::new(HashMap::new()),
        }
    }

    /// `coalesceKey = hash(hostId, name, method, args, options)` (§3).
    pub fn coalesce_key(
        host_id: &str,
        peripheral: &str,
        method: &str,
        args: &serde_json::Value,
        options: Option<&CallOptions>,
    ) -> String {
        let canonical = serde_json::json!({
            "hostId": host_id,
            "peripheral": peripheral,
            "method": method,
            "args": args,
            "options": options,
        });
        weak_hash(&canonical.to_string())
    }

    /// Issue (or attach to an in-flight) call and wait for it to settle.
    /// `timeout_ms` is an absolute deadline relative to `now_ms`, supplied by
    /// the caller (the per-method timeout table lives one layer up, in the
    /// proxy).
    pub async fn call(
        &self,
        host_id: &str,
        peripheral: &str,
        method: &str,
        args: serde_json::Value,
        options: Option<CallOptions>,
        now_ms: u64,
        timeout_ms: u64,
    ) -> CallOutcome {
        let key = Self::coalesce_key(host_id, peripheral, method, &args, options.as_ref());
        let deadline = now_ms + timeout_ms;
        let (tx, rx) = oneshot::channel();

        let existing_request_id = {
            let mut coalesce = self.coalesce_index.lock().expect("coalesce lock poisoned");
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            match coalesce.get(&key).cloned() {
                Some(request_id) if pending.contains_key(&request_id) => {
                    let entry = pending.get_mut(&request_id).expect("checked contains_key above");
                    entry.callbacks.push(tx);
                    entry.deadline_ms = entry.deadline_ms.max(deadline);
                    Some(request_id)
                }
                _ => {
                    coalesce.remove(&key);
                    None
                }
            }
        };

        if existing_request_id.is_some() {
            return self.await_local_deadline(rx, timeout_ms).await;
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.insert(
                request_id.clone(),
                PendingRequest {
                    callbacks: vec![tx],
                    deadline_ms: deadline,
                    coalesce_key: Some(key.clone()),
                    accumulator: Vec::new(),
                    host_id: host_id.to_owned(),
                    peripheral: peripheral.to_owned(),
                    method: method.to_owned(),
                    args: args.clone(),
                },
            );
            self.coalesce_index
                .lock()
                .expect("coalesce lock poisoned")
                .insert(key, request_id.clone());
        }

        let payload = CallPayload {
            peripheral: peripheral.to_owned(),
            method: method.to_owned(),
            args,
            options,
        };
        let message = Message::new_call(request_id.clone(), payload, now_ms);
        if let Err(err) = self.sender.send_call(host_id, &message, now_ms).await {
            self.resolve(&request_id, Err(RpcErrorKind::Other(err)));
            return rx_already_resolved(rx).await;
        }

        self.await_local_deadline(rx, timeout_ms).await
    }

    /// Wait for `rx` to settle, but give up at this caller's own
    /// `timeout_ms` regardless of how long the shared pending entry's
    /// deadline has been stretched by other coalesced callers (§4.6/§5: a
    /// timeout is reported only to the local waiter). Timing out here does
    /// not touch the shared entry — it stays pending for whoever else is
    /// still attached, and for `sweep_timeouts` to eventually reap.
    async fn await_local_deadline(&self, rx: oneshot::Receiver<CallOutcome>, timeout_ms: u64) -> CallOutcome {
        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), rx).await {
            Ok(resolved) => resolved.unwrap_or(Err(RpcErrorKind::Timeout)),
            Err(_) => Err(RpcErrorKind::Timeout),
        }
    }

    /// Handle a `PERIPH_RESULT` for `request_id`. Drives chunked pagination
    /// transparently: a `chunked && !done` page extends the accumulator and
    /// issues a follow-up call under the *same* `request_id`; a final page
    /// resolves every attached callback.
    pub async fn on_result(&self, request_id: &str, payload: pf_proto::ResultPayload, now_ms: u64) {
        let meta = payload.meta.clone().unwrap_or_default();

        if meta.unchanged == Some(true) {
            self.resolve(
                request_id,
                Ok(ResolvedCall {
                    results: serde_json::Value::Null,
                    unchanged: true,
                }),
            );
            return;
        }

        let is_chunked = meta.chunked == Some(true);
        let done = meta.done.unwrap_or(true);

        if is_chunked && !done {
            let page_items = payload
                .results
                .as_ref()
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();

            let continuation = {
                let mut pending = self.pending.lock().expect("pending lock poisoned");
                let Some(entry) = pending.get_mut(request_id) else {
                    return;
                };
                entry.accumulator.extend(page_items);
                entry.deadline_ms = now_ms + DEFAULT_RPC_TIMEOUT_MS;

                let limit = meta.limit.unwrap_or(DEFAULT_CHUNK_LIMIT).min(MAX_CHUNK_LIMIT);
                let next_offset = meta.offset.unwrap_or(0) + limit;
                let payload = CallPayload {
                    peripheral: entry.peripheral.clone(),
                    method: entry.method.clone(),
                    args: entry.args.clone(),
                    options: Some(CallOptions {
                        offset: Some(next_offset),
                        limit: Some(limit),
                        result_hash: meta.result_hash.clone(),
                        query_id: meta.query_id.clone(),
                        page: Some(true),
                    }),
                };
                (entry.host_id.clone(), payload)
            };

            let message = Message::new_call(request_id.to_owned(), continuation.1, now_ms);
            if let Err(err) = self.sender.send_call(&continuation.0, &message, now_ms).await {
                self.resolve(request_id, Err(RpcErrorKind::Other(err)));
            }
            return;
        }

        let final_results = {
            let pending = self.pending.lock().expect("pending lock poisoned");
            let accumulated = pending.get(request_id).map(|p| p.accumulator.clone()).unwrap_or_default();
            if accumulated.is_empty() {
                payload.results.clone().unwrap_or(serde_json::Value::Null)
            } else {
                let mut items = accumulated;
                if let Some(page_items) = payload.results.as_ref().and_then(|v| v.as_array()) {
                    items.extend(page_items.clone());
                }
                serde_json::Value::Array(items)
            }
        };

        self.resolve(
            request_id,
            Ok(ResolvedCall {
                results: final_results,
                unchanged: false,
            }),
        );
    }

    /// Handle a `PERIPH_ERROR` for `request_id`. A snapshot error mid-chain
    /// fails the entire multi-page call (§4.6).
    pub fn on_error(&self, request_id: &str, error: &pf_proto::ErrorInfo) {
        self.resolve(request_id, Err(RpcErrorKind::from(error)));
    }

    /// Remove every pending request whose deadline has passed, resolving
    /// their callbacks with `timeout`. Must run at a bounded interval
    /// (§5 "Pending-request timeout sweep is mandatory").
    pub fn sweep_timeouts(&self, now_ms: u64) {
        let expired: Vec<String> = {
            let pending = self.pending.lock().expect("pending lock poisoned");
            pending
                .iter()
                .filter(|(_, req)| req.deadline_ms <= now_ms)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for request_id in expired {
            self.resolve(&request_id, Err(RpcErrorKind::Timeout));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// Remove the pending entry (if still present), free its coalesce slot
    /// iff it still points to this id, and fan the outcome out to every
    /// attached callback — one failing callback must not block the rest.
    fn resolve(&self, request_id: &str, outcome: CallOutcome) {
        let entry = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.remove(request_id)
        };
        let Some(entry) = entry else {
            return;
        };

        if let Some(key) = &entry.coalesce_key {
            let mut coalesce = self.coalesce_index.lock().expect("coalesce lock poisoned");
            if coalesce.get(key).map(String::as_str) == Some(request_id) {
                coalesce.remove(key);
            }
        }

        for callback in entry.callbacks {
            let cloned = clone_outcome(&outcome);
            if callback.send(cloned).is_err() {
                tracing::debug!("rpc callback receiver dropped before resolution delivered");
            }
        }
    }
}

fn clone_outcome(outcome: &CallOutcome) -> CallOutcome {
    match outcome {
        Ok(resolved) => Ok(ResolvedCall {
            results: resolved.results.clone(),
            unchanged: resolved.unchanged,
        }),
        Err(err) => Err(err.clone()),
    }
}

async fn rx_already_resolved(rx: oneshot::Receiver<CallOutcome>) -> CallOutcome {
    rx.await.unwrap_or(Err(RpcErrorKind::Timeout))
}
