//! pf-registry: remote peripheral inventory (C5).
//!
//! Holds one [`HostRecord`] per known remote host and one [`RemotePeripheral`]
//! per `(hostId, name)` composite key, plus a `name -> [keys]` secondary index
//! for ambiguity resolution. `Registry` itself is plain and synchronous; the
//! owning component (discovery loop, client facade) wraps it in a shared lock.

use pf_proto::{composite_key, PeripheralSummary};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Per-remote-host bookkeeping, keyed by host node id.
#[derive(Debug, Clone, Default)]
pub struct HostRecord {
    pub computer_name: Option<String>,
    pub state_hash: Option<String>,
    pub owned_peripheral_keys: BTreeSet<String>,
    pub pending_discover_request_id: Option<String>,
}

/// A peripheral owned by a remote host, keyed by `hostId::name`.
///
/// The callable proxy object itself is not stored here — it is built by the
/// layer above from this record, to avoid the registry owning a back
/// reference to its own client (§9: "implement with non-owning back
/// references... or index into a registry map").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeripheral {
    pub key: String,
    pub name: String,
    pub host_id: String,
    pub host_computer_name: Option<String>,
    pub display_name: String,
    pub peripheral_type: String,
    pub methods: Vec<String>,
}

/// Outcome of processing an announce: whether the client should now issue a
/// `PERIPH_DISCOVER` (§4.4: "iff (a) it has no peripherals owned by that host
/// OR (b) the received stateHash differs from its stored one").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceOutcome {
    pub should_discover: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    hosts: HashMap<String, HostRecord>,
    peripherals: BTreeMap<String, RemotePeripheral>,
    name_index: HashMap<String, Vec<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a `PERIPH_ANNOUNCE` heartbeat, updating the host's record and
    /// reporting whether a discover should follow.
    pub fn handle_announce(
        &mut self,
        host_id: &str,
        host_name: Option<&str>,
        state_hash: &str,
    ) -> AnnounceOutcome {
        let record = self.hosts.entry(host_id.to_owned()).or_default();
        if let Some(name) = host_name {
            record.computer_name = Some(name.to_owned());
        }
        let had_no_owned = record.owned_peripheral_keys.is_empty();
        let hash_changed = record.state_hash.as_deref() != Some(state_hash);
        record.state_hash = Some(state_hash.to_owned());

        AnnounceOutcome {
            should_discover: had_no_owned || hash_changed,
        }
    }

    pub fn host(&self, host_id: &str) -> Option<&HostRecord> {
        self.hosts.get(host_id)
    }

    pub fn has_pending_discover(&self, host_id: &str) -> bool {
        self.hosts
            .get(host_id)
            .is_some_and(|h| h.pending_discover_request_id.is_some())
    }

    pub fn set_pending_discover(&mut self, host_id: &str, request_id: impl Into<String>) {
        self.hosts
            .entry(host_id.to_owned())
            .or_default()
            .pending_discover_request_id = Some(request_id.into());
    }

    /// Free the per-host pending-discover slot, whether it resolved or timed
    /// out. No-op if the host is unknown or nothing is pending.
    pub fn clear_pending_discover(&mut self, host_id: &str) {
        if let Some(record) = self.hosts.get_mut(host_id) {
            record.pending_discover_request_id = None;
        }
    }

    /// Atomically replace a host's owned peripherals with a fresh `PERIPH_LIST`
    /// (§4.5 `removeHostRemotes` + §4.4 "atomically replaces that host's
    /// ownership set and rebuilds the name→keys index"). An explicit empty
    /// list still clears prior ownership — this is a real discover response,
    /// not the zero-length *heartbeat* boundary case, which never reaches
    /// this method.
    pub fn handle_periph_list(
        &mut self,
        host_id: &str,
        host_name: Option<&str>,
        peripherals: &[PeripheralSummary],
    ) {
        self.remove_host_remotes(host_id);

        let record = self.hosts.entry(host_id.to_owned()).or_default();
        if let Some(name) = host_name {
            record.computer_name = Some(name.to_owned());
        }

        for summary in peripherals {
            let key = composite_key(host_id, &summary.name);
            record.owned_peripheral_keys.insert(key.clone());
            self.peripherals.insert(
                key.clone(),
                RemotePeripheral {
                    key,
                    name: summary.name.clone(),
                    host_id: host_id.to_owned(),
                    host_computer_name: record.computer_name.clone(),
                    display_name: summary.name.clone(),
                    peripheral_type: summary.peripheral_type.clone(),
                    methods: summary.methods.clone(),
                },
            );
        }

        self.rebuild_name_index();
    }

    /// Delete all entries owned by `host_id` and rebuild the name index. The
    /// atomic swap primitive used by [`Self::handle_periph_list`].
    pub fn remove_host_remotes(&mut self, host_id: &str) {
        if let Some(record) = self.hosts.get_mut(host_id) {
            for key in std::mem::take(&mut record.owned_peripheral_keys) {
                self.peripherals.remove(&key);
            }
        }
        self.rebuild_name_index();
    }

    fn rebuild_name_index(&mut self) {
        self.name_index.clear();
        for (key, peripheral) in &self.peripherals {
            self.name_index
                .entry(peripheral.name.clone())
                .or_default()
                .push(key.clone());
        }
        for keys in self.name_index.values_mut() {
            keys.sort();
        }
    }

    /// Resolve a bare name or composite key to its entry: composite key if
    /// present, else the unambiguous alias for a bare name, else `None`.
    pub fn wrap(&self, name_or_key: &str) -> Option<&RemotePeripheral> {
        if let Some(entry) = self.peripherals.get(name_or_key) {
            return Some(entry);
        }
        let keys = self.name_index.get(name_or_key)?;
        match keys.as_slice() {
            [single] => self.peripherals.get(single),
            _ => None,
        }
    }

    /// First peripheral whose type matches `type_str`, in deterministic
    /// host-id-then-key order (composite-key string order already satisfies
    /// this since keys are `hostId::name`).
    pub fn find(&self, type_str: &str) -> Option<&RemotePeripheral> {
        self.peripherals
            .values()
            .find(|p| type_matches(&p.peripheral_type, type_str))
    }

    pub fn find_all(&self, type_str: &str) -> Vec<&RemotePeripheral> {
        self.peripherals
            .values()
            .filter(|p| type_matches(&p.peripheral_type, type_str))
            .collect()
    }

    /// One identifier per registered peripheral: the bare name when it is
    /// unambiguous, the composite key otherwise.
    pub fn get_names(&self) -> Vec<String> {
        self.peripherals
            .values()
            .map(|p| {
                let keys = self.name_index.get(&p.name);
                if keys.is_some_and(|k| k.len() == 1) {
                    p.name.clone()
                } else {
                    p.key.clone()
                }
            })
            .collect()
    }

    pub fn peripheral_count(&self) -> usize {
        self.peripherals.len()
    }

    pub fn get(&self, key: &str) -> Option<&RemotePeripheral> {
        self.peripherals.get(key)
    }
}

/// Lowercase, strip non-alphanumerics.
fn normalize_type(type_str: &str) -> String {
    type_str
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Candidate normalized tokens for a type string: the full token, plus the
/// leaf token when the form is `ns:leaf`.
fn type_candidates(type_str: &str) -> Vec<String> {
    let full = normalize_type(type_str);
    let mut candidates = vec![full.clone()];
    if let Some(idx) = type_str.find(':') {
        let leaf = normalize_type(&type_str[idx + 1..]);
        if leaf != full {
            candidates.push(leaf);
        }
    }
    candidates
}

/// Two types match iff any candidate pair matches. Symmetric and reflexive.
pub fn type_matches(actual: &str, expected: &str) -> bool {
    let a = type_candidates(actual);
    let b = type_candidates(expected);
    a.iter().any(|x| b.contains(x))
}
