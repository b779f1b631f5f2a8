//! pf-crypto: envelope signing and verification (C1).
//!
//! Integrity + freshness + replay defense over a cooperative channel — not
//! confidentiality, and not a cryptographically secure MAC. Wire-compatible
//! with the construction the fabric freezes: `s = H(p ‖ t ‖ n ‖ secret)` using
//! a deliberately weak multi-pass string hash (§9 open question: "a
//! production port should substitute a keyed MAC, but wire-compatibility with
//! existing peers requires the original construction").

use pf_proto::{Envelope, ENVELOPE_VERSION};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;

pub const MAX_MESSAGE_AGE_MS: u64 = 60_000;
pub const MAX_FUTURE_SKEW_MS: u64 = 5_000;
pub const NONCE_EXPIRY_MS: u64 = 120_000;
pub const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// No secret is configured. Fatal on send (callers must abort the send
    /// path, never wrap without one); on receive this means the message
    /// cannot be trusted and must be silently dropped by the caller.
    #[error("no secret configured")]
    NoSecret,
    #[error("secret shorter than {MIN_SECRET_LEN} characters")]
    SecretTooShort,
    #[error("signature does not match")]
    BadSignature,
    #[error("message older than the allowed window")]
    Expired,
    #[error("message timestamped too far in the future")]
    Future,
    #[error("nonce already seen within the replay window")]
    Replay,
    #[error("envelope is structurally invalid")]
    Malformed,
}

/// Process-wide, boot-initialized, immutable-after-boot security state for one
/// node (§9: "each node holds exactly one `SecurityContext` initialized at
/// boot and immutable thereafter; receivers consult it through a typed
/// accessor"). Threaded explicitly into the transport channel rather than
/// stored as a global.
pub struct SecurityContext {
    secret: Option<String>,
    // nonce -> time-of-first-sight (ms); swept lazily on each verify.
    nonce_cache: Mutex<HashMap<String, u64>>,
}

impl SecurityContext {
    /// Build a context that can both sign and verify. Rejects secrets shorter
    /// than [`MIN_SECRET_LEN`] per §4.1's send precondition.
    pub fn with_secret(secret: impl Into<String>) -> Result<Self, EnvelopeError> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            return Err(EnvelopeError::SecretTooShort);
        }
        Ok(Self {
            secret: Some(secret),
            nonce_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Build a context with no secret installed. `sign` always fails with
    /// [`EnvelopeError::NoSecret`] (a hard precondition violation the caller
    /// must treat as fatal); `verify` always fails with the same variant,
    /// which callers must treat as a silent drop, not a user-visible error.
    pub fn without_secret() -> Self {
        Self {
            secret: None,
            nonce_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Sign `payload`, stamped with `now_ms` and a freshly generated nonce.
    pub fn sign(&self, payload: &str, now_ms: u64) -> Result<Envelope, EnvelopeError> {
        let secret = self.secret.as_deref().ok_or(EnvelopeError::NoSecret)?;
        let nonce = generate_nonce();
        let signature = compute_signature(payload, now_ms, &nonce, secret);
        Ok(Envelope {
            v: ENVELOPE_VERSION,
            p: payload.to_owned(),
            t: now_ms,
            n: nonce,
            s: signature,
        })
    }

    /// Verify `envelope` against the current time `now_ms`, returning the
    /// inner payload string on success. Sweeps expired nonces as a side
    /// effect (§4.1: "swept lazily on each verify").
    pub fn verify(&self, envelope: &Envelope, now_ms: u64) -> Result<String, EnvelopeError> {
        let secret = self.secret.as_deref().ok_or(EnvelopeError::NoSecret)?;

        if envelope.v != ENVELOPE_VERSION || envelope.n.is_empty() {
            return Err(EnvelopeError::Malformed);
        }

        if now_ms.saturating_sub(envelope.t) > MAX_MESSAGE_AGE_MS {
            return Err(EnvelopeError::Expired);
        }
        if envelope.t.saturating_sub(now_ms) > MAX_FUTURE_SKEW_MS {
            return Err(EnvelopeError::Future);
        }

        let expected = compute_signature(&envelope.p, envelope.t, &envelope.n, secret);
        if expected != envelope.s {
            return Err(EnvelopeError::BadSignature);
        }

        let mut cache = self.nonce_cache.lock().expect("nonce cache lock poisoned");
        sweep_expired(&mut cache, now_ms);
        if cache.contains_key(&envelope.n) {
            return Err(EnvelopeError::Replay);
        }
        cache.insert(envelope.n.clone(), now_ms);

        Ok(envelope.p.clone())
    }

    /// Number of nonces currently tracked (for telemetry/tests).
    pub fn nonce_cache_len(&self) -> usize {
        self.nonce_cache.lock().expect("nonce cache lock poisoned").len()
    }
}

fn sweep_expired(cache: &mut HashMap<String, u64>, now_ms: u64) {
    cache.retain(|_, seen_at| now_ms.saturating_sub(*seen_at) <= NONCE_EXPIRY_MS);
}

fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

const SEP: char = '\u{1}';

fn compute_signature(payload: &str, timestamp: u64, nonce: &str, secret: &str) -> String {
    let joined = format!("{payload}{SEP}{timestamp}{SEP}{nonce}{SEP}{secret}");
    weak_hash(&joined)
}

/// Deliberately weak, non-cryptographic multi-pass string hash. Integrity
/// against cooperative peers, not an adversarial forgery bound.
pub fn weak_hash(input: &str) -> String {
    let bytes = input.as_bytes();

    let mut djb2: u64 = 5381;
    for &b in bytes {
        djb2 = djb2.wrapping_mul(33).wrapping_add(u64::from(b));
    }

    let mut fnv: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        fnv ^= u64::from(b);
        fnv = fnv.wrapping_mul(0x0000_0100_0000_01b3);
    }

    let mut rolling: u64 = djb2;
    for &b in bytes.iter().rev() {
        rolling = rolling.wrapping_mul(31).wrapping_add(u64::from(b));
    }

    format!("{djb2:016x}{fnv:016x}{rolling:016x}")
}
