//! pf-telemetry: the node-wide activity hook (§1.1 S2, §4.10).
//!
//! Grounded nearly verbatim on `crates/rt-ui-log/src/lib.rs`: a bounded ring
//! buffer of formatted strings behind a `std::sync::RwLock`, with every push
//! also emitted as a `tracing` event. Extended here with named atomic
//! counters for the fabric's telemetry contract.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub const DEFAULT_MAX_ENTRIES: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    pub timestamp: u64,
    pub message: String,
}

struct Inner {
    buffer: RwLock<VecDeque<ActivityEntry>>,
    max_entries: usize,
    calls_dispatched: AtomicU64,
    calls_failed: AtomicU64,
    envelopes_dropped: AtomicU64,
}

/// `Clone + Send + Sync` so one hook can be shared into the host server, the
/// RPC engine, and the proxy cache alike.
#[derive(Clone)]
pub struct TelemetryHook(Arc<Inner>);

impl TelemetryHook {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self(Arc::new(Inner {
            buffer: RwLock::new(VecDeque::with_capacity(max_entries)),
            max_entries,
            calls_dispatched: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            envelopes_dropped: AtomicU64::new(0),
        }))
    }

    /// Append a line to the ring buffer and emit a matching `tracing` event.
    pub fn record(&self, message: impl Into<String>, timestamp_ms: u64) {
        let message = message.into();
        tracing::info!(timestamp = timestamp_ms, "{message}");

        let mut buffer = self.0.buffer.write().expect("telemetry buffer lock poisoned");
        if buffer.len() >= self.0.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(ActivityEntry {
            timestamp: timestamp_ms,
            message,
        });
    }

    pub fn recent(&self) -> Vec<ActivityEntry> {
        self.0.buffer.read().expect("telemetry buffer lock poisoned").iter().cloned().collect()
    }

    pub fn record_call_dispatched(&self) {
        self.0.calls_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_failed(&self) {
        self.0.calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_envelope_dropped(&self) {
        self.0.envelopes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls_dispatched(&self) -> u64 {
        self.0.calls_dispatched.load(Ordering::Relaxed)
    }

    pub fn calls_failed(&self) -> u64 {
        self.0.calls_failed.load(Ordering::Relaxed)
    }

    pub fn envelopes_dropped(&self) -> u64 {
        self.0.envelopes_dropped.load(Ordering::Relaxed)
    }
}

impl Default for TelemetryHook {
    fn default() -> Self {
        Self::new()
    }
}
