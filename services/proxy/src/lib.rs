//! pf-proxy: per-peripheral method cache and disconnect/reconnect state
//! machine (C7), sitting on top of [`pf_rpc::RpcEngine`].
//!
//! Grounded on `services/receiver/src/cache.rs` (three-tier freshness
//! bookkeeping behind `Arc<RwLock<HashMap>>`) and `session.rs`'s
//! async-refresh debounce. In-flight-call deduplication for *identical*
//! concurrent requests is not reimplemented here: `pf_rpc::RpcEngine::call`
//! already coalesces on `(hostId,peripheral,method,args,options)` and fans
//! the one outbound call's result out to every waiter, which is the same
//! guarantee the cache would otherwise provide via a polling loop.

use async_trait::async_trait;
use pf_proto::{error_codes, CallOptions};
use pf_rpc::{OutboundSender, RpcEngine, RpcErrorKind};
use pf_telemetry::TelemetryHook;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const CACHE_TTL_MS: u64 = 2_000;
pub const CACHE_STALE_MS: u64 = 5_000;
pub const CACHE_EXPIRE_MS: u64 = 30_000;
pub const ASYNC_RETRY_MS: u64 = 1_000;
pub const MAX_CONSECUTIVE_BLOCKING_FAILURES: u32 = 3;
pub const RECONNECT_COOLDOWN_MS: u64 = 10_000;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 3_000;
pub const HEAVY_METHOD_TIMEOUT_MS: u64 = 5_000;
pub const CONTROL_METHOD_TIMEOUT_MS: u64 = 3_000;

const ACTION_METHODS: &[&str] = &["craftItem", "exportItem", "importItem"];

fn is_action_method(method: &str) -> bool {
    ACTION_METHODS.contains(&method)
}

/// Mirrors `services/host`'s heavy-method set; duplicated rather than shared
/// because the two crates never otherwise depend on each other.
fn is_heavy_method(method: &str) -> bool {
    matches!(method, "getItems" | "getFluids" | "getChemicals") || method.starts_with("getCraftable")
}

fn timeout_for_method(method: &str) -> u64 {
    if is_heavy_method(method) {
        HEAVY_METHOD_TIMEOUT_MS
    } else if is_action_method(method) {
        CONTROL_METHOD_TIMEOUT_MS
    } else {
        DEFAULT_RPC_TIMEOUT_MS
    }
}

/// Issues a fresh `PERIPH_DISCOVER` for a host and reports whether it
/// resolved — kept as a narrow trait so the cache's disconnect/reconnect
/// logic can be unit-tested without a real [`pf_discovery::Discovery`].
#[async_trait]
pub trait Rediscoverer: Send + Sync {
    async fn rediscover(&self, host_id: &str, now_ms: u64) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    Stale,
    Expired,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    host_id: String,
    peripheral: String,
    method: String,
    args_key: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    fetched_at_ms: u64,
    last_async_attempt_ms: u64,
}

#[derive(Debug, Clone, Default)]
struct ConnectionState {
    consecutive_failures: u32,
    disconnected_at_ms: Option<u64>,
}

/// Point-in-time connectivity summary for a remote peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Connected,
    Disconnected,
}

fn args_key(args: &Value) -> String {
    serde_json::to_string(args).unwrap_or_default()
}

fn peripheral_key(host_id: &str, peripheral: &str) -> String {
    pf_proto::composite_key(host_id, peripheral)
}

/// One cache + connection-state table shared by every proxy on a node.
/// Keyed internally by `(hostId, peripheral, method, args)`; callers address
/// peripherals by `hostId`/`peripheral` pair, matching how `pf_registry`
/// resolves a [`pf_registry::RemotePeripheral`].
pub struct ProxyCache<S: OutboundSender + 'static, R: Rediscoverer + 'static> {
    rpc: Arc<RpcEngine<S>>,
    rediscoverer: R,
    telemetry: TelemetryHook,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    connections: Mutex<HashMap<String, ConnectionState>>,
}

impl<S: OutboundSender + 'static, R: Rediscoverer + 'static> ProxyCache<S, R> {
    pub fn new(rpc: Arc<RpcEngine<S>>, rediscoverer: R, telemetry: TelemetryHook) -> Arc<Self> {
        Arc::new(Self {
            rpc,
            rediscoverer,
            telemetry,
            entries: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn status(&self, host_id: &str, peripheral: &str) -> ProxyState {
        let key = peripheral_key(host_id, peripheral);
        let connections = self.connections.lock().expect("connection lock poisoned");
        match connections.get(&key) {
            Some(state) if state.disconnected_at_ms.is_some() => ProxyState::Disconnected,
            _ => ProxyState::Connected,
        }
    }

    /// Invoke a read method through the three-tier cache policy. Action
    /// methods are routed to [`Self::call_action`] and never cached.
    pub async fn call_read(self: &Arc<Self>, host_id: &str, peripheral: &str, method: &str, args: Value, now_ms: u64) -> Result<Value, RpcErrorKind> {
        if is_action_method(method) {
            return self.call_action(host_id, peripheral, method, args, now_ms).await;
        }

        if !self.ensure_connected(host_id, peripheral, now_ms).await {
            return Err(RpcErrorKind::Other(error_codes::DISCONNECTED.to_owned()));
        }

        let key = CacheKey {
            host_id: host_id.to_owned(),
            peripheral: peripheral.to_owned(),
            method: method.to_owned(),
            args_key: args_key(&args),
        };

        let freshness = {
            let entries = self.entries.lock().expect("cache lock poisoned");
            entries.get(&key).map(|entry| classify(entry.fetched_at_ms, now_ms))
        };

        match freshness {
            Some(Freshness::Fresh) => Ok(self.cached_value(&key).expect("fresh entry present under its own key")),
            Some(Freshness::Stale) => {
                let cached = self.cached_value(&key).expect("stale entry present under its own key");
                self.maybe_fire_async_refresh(host_id, peripheral, method, args, now_ms);
                Ok(cached)
            }
            Some(Freshness::Expired) | None => self.blocking_fetch(&key, args, now_ms, true).await,
        }
    }

    /// Action methods (`craftItem`, `exportItem`, `importItem`, ...) are
    /// always blocking and never touch the cache.
    pub async fn call_action(self: &Arc<Self>, host_id: &str, peripheral: &str, method: &str, args: Value, now_ms: u64) -> Result<Value, RpcErrorKind> {
        if !self.ensure_connected(host_id, peripheral, now_ms).await {
            return Err(RpcErrorKind::Other(error_codes::DISCONNECTED.to_owned()));
        }
        let key_str = peripheral_key(host_id, peripheral);
        let timeout_ms = timeout_for_method(method);
        let outcome = self.rpc.call(host_id, peripheral, method, args, None, now_ms, timeout_ms).await;
        match outcome {
            Ok(resolved) => {
                self.reset_failures(&key_str);
                Ok(resolved.results)
            }
            Err(err) => {
                self.record_failure(&key_str, now_ms);
                Err(err)
            }
        }
    }

    /// Bypass `RECONNECT_COOLDOWN` and attempt a rediscover immediately.
    pub async fn reconnect(self: &Arc<Self>, host_id: &str, peripheral: &str, now_ms: u64) -> bool {
        self.attempt_reconnect(host_id, peripheral, now_ms).await
    }

    async fn ensure_connected(self: &Arc<Self>, host_id: &str, peripheral: &str, now_ms: u64) -> bool {
        let key_str = peripheral_key(host_id, peripheral);
        let disconnected_at = {
            let connections = self.connections.lock().expect("connection lock poisoned");
            connections.get(&key_str).and_then(|s| s.disconnected_at_ms)
        };
        let Some(since) = disconnected_at else {
            return true;
        };
        if now_ms < since + RECONNECT_COOLDOWN_MS {
            return false;
        }
        self.attempt_reconnect(host_id, peripheral, now_ms).await
    }

    async fn attempt_reconnect(self: &Arc<Self>, host_id: &str, peripheral: &str, now_ms: u64) -> bool {
        let key_str = peripheral_key(host_id, peripheral);
        let ok = self.rediscoverer.rediscover(host_id, now_ms).await;
        if ok {
            self.connections.lock().expect("connection lock poisoned").remove(&key_str);
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            entries.retain(|k, _| peripheral_key(&k.host_id, &k.peripheral) != key_str);
        } else {
            let mut connections = self.connections.lock().expect("connection lock poisoned");
            connections.entry(key_str).or_default().disconnected_at_ms = Some(now_ms);
        }
        ok
    }

    fn maybe_fire_async_refresh(self: &Arc<Self>, host_id: &str, peripheral: &str, method: &str, args: Value, now_ms: u64) {
        let key = CacheKey {
            host_id: host_id.to_owned(),
            peripheral: peripheral.to_owned(),
            method: method.to_owned(),
            args_key: args_key(&args),
        };
        {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            let Some(entry) = entries.get_mut(&key) else { return };
            if now_ms.saturating_sub(entry.last_async_attempt_ms) < ASYNC_RETRY_MS {
                return;
            }
            entry.last_async_attempt_ms = now_ms;
        }

        let this = self.clone();
        tokio::spawn(async move {
            // Async failures never count toward consecutiveFailures/disconnect.
            let _ = this.blocking_fetch(&key, args, now_ms, false).await;
        });
    }

    async fn blocking_fetch(self: &Arc<Self>, key: &CacheKey, args: Value, now_ms: u64, count_failures: bool) -> Result<Value, RpcErrorKind> {
        let key_str = peripheral_key(&key.host_id, &key.peripheral);
        let timeout_ms = timeout_for_method(&key.method);
        {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            entries.retain(|_, entry| now_ms.saturating_sub(entry.fetched_at_ms) < CACHE_EXPIRE_MS);
        }
        let options = if is_heavy_method(&key.method) {
            self.cached_value(key).map(|v| CallOptions {
                result_hash: Some(pf_crypto::weak_hash(&serde_json::to_string(&v).unwrap_or_default())),
                ..Default::default()
            })
        } else {
            None
        };

        let outcome = self.rpc.call(&key.host_id, &key.peripheral, &key.method, args, options, now_ms, timeout_ms).await;
        match outcome {
            Ok(resolved) => {
                self.reset_failures(&key_str);
                if resolved.unchanged {
                    let mut entries = self.entries.lock().expect("cache lock poisoned");
                    if let Some(entry) = entries.get_mut(key) {
                        entry.fetched_at_ms = now_ms;
                        return Ok(entry.value.clone());
                    }
                    Ok(Value::Null)
                } else {
                    let mut entries = self.entries.lock().expect("cache lock poisoned");
                    entries.insert(
                        key.clone(),
                        CacheEntry {
                            value: resolved.results.clone(),
                            fetched_at_ms: now_ms,
                            last_async_attempt_ms: now_ms,
                        },
                    );
                    Ok(resolved.results)
                }
            }
            Err(err) => {
                if count_failures {
                    self.record_failure(&key_str, now_ms);
                } else {
                    self.telemetry.record_call_failed();
                }
                Err(err)
            }
        }
    }

    fn cached_value(&self, key: &CacheKey) -> Option<Value> {
        self.entries.lock().expect("cache lock poisoned").get(key).map(|e| e.value.clone())
    }

    fn record_failure(&self, key_str: &str, now_ms: u64) {
        self.telemetry.record_call_failed();
        let mut connections = self.connections.lock().expect("connection lock poisoned");
        let state = connections.entry(key_str.to_owned()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= MAX_CONSECUTIVE_BLOCKING_FAILURES && state.disconnected_at_ms.is_none() {
            state.disconnected_at_ms = Some(now_ms);
        }
    }

    fn reset_failures(&self, key_str: &str) {
        let mut connections = self.connections.lock().expect("connection lock poisoned");
        connections.remove(key_str);
    }
}

fn classify(fetched_at_ms: u64, now_ms: u64) -> Freshness {
    let age = now_ms.saturating_sub(fetched_at_ms);
    if age < CACHE_TTL_MS {
        Freshness::Fresh
    } else if age < CACHE_STALE_MS {
        Freshness::Stale
    } else {
        Freshness::Expired
    }
}
