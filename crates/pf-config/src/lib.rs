//! pf-config: node configuration loading (§1.1 S1, §4.9).
//!
//! Mirrors `services/forwarder/src/config.rs`: a raw, all-`Option` struct
//! deserialized straight from TOML, then a validation pass that fills
//! defaults and rejects structurally invalid input.

use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_CACHE_TTL_MS: u64 = 2_000;
pub const DEFAULT_CACHE_EXPIRE_MS: u64 = 30_000;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 3_000;
pub const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLocalPeripheral {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub peripheral_type: Option<String>,
    pub methods: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNodeConfig {
    pub node_id: Option<String>,
    pub display_name: Option<String>,
    pub secret_source: Option<String>,
    pub announce_interval_ms: Option<u64>,
    pub cache_ttl_ms: Option<u64>,
    pub cache_expire_ms: Option<u64>,
    pub default_rpc_timeout_ms: Option<u64>,
    #[serde(default)]
    pub local_peripherals: Vec<RawLocalPeripheral>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeripheralConfig {
    pub name: String,
    pub peripheral_type: String,
    pub methods: Vec<String>,
}

/// Where to read the shared secret from. `Inline` carries the secret
/// straight in the config text, for demos and tests that have no secret
/// file to point at; real deployments should prefer `File`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    File(String),
    Inline(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub node_id: String,
    pub display_name: Option<String>,
    pub secret_source: SecretSource,
    pub announce_interval_ms: u64,
    pub cache_ttl_ms: u64,
    pub cache_expire_ms: u64,
    pub default_rpc_timeout_ms: u64,
    pub local_peripherals: Vec<LocalPeripheralConfig>,
}

impl NodeConfig {
    /// Read the configured secret. Never logs its value.
    pub fn read_secret(&self) -> Result<String, ConfigError> {
        match &self.secret_source {
            SecretSource::File(path) => fs::read_to_string(path)
                .map(|s| s.trim().to_owned())
                .map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                }),
            SecretSource::Inline(secret) => Ok(secret.clone()),
        }
    }
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<NodeConfig, ConfigError> {
    let path_ref = path.as_ref();
    let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
        path: path_ref.display().to_string(),
        source,
    })?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<NodeConfig, ConfigError> {
    let raw: RawNodeConfig = toml::from_str(text)?;
    validate(raw)
}

fn validate(raw: RawNodeConfig) -> Result<NodeConfig, ConfigError> {
    let node_id = raw.node_id.ok_or(ConfigError::MissingField("node_id"))?;
    if node_id.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "node_id",
            reason: "must not be empty".to_owned(),
        });
    }

    let secret_source_raw = raw.secret_source.ok_or(ConfigError::MissingField("secret_source"))?;
    let secret_source = parse_secret_source(&secret_source_raw)?;

    let announce_interval_ms = raw.announce_interval_ms.unwrap_or(DEFAULT_ANNOUNCE_INTERVAL_MS);
    if announce_interval_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "announce_interval_ms",
            reason: "must be greater than zero".to_owned(),
        });
    }

    let cache_ttl_ms = raw.cache_ttl_ms.unwrap_or(DEFAULT_CACHE_TTL_MS);
    let cache_expire_ms = raw.cache_expire_ms.unwrap_or(DEFAULT_CACHE_EXPIRE_MS);
    if cache_expire_ms < cache_ttl_ms {
        return Err(ConfigError::InvalidValue {
            field: "cache_expire_ms",
            reason: "must be >= cache_ttl_ms".to_owned(),
        });
    }

    let default_rpc_timeout_ms = raw.default_rpc_timeout_ms.unwrap_or(DEFAULT_RPC_TIMEOUT_MS);
    if default_rpc_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "default_rpc_timeout_ms",
            reason: "must be greater than zero".to_owned(),
        });
    }

    let mut local_peripherals = Vec::with_capacity(raw.local_peripherals.len());
    for (idx, p) in raw.local_peripherals.into_iter().enumerate() {
        let name = p.name.ok_or(ConfigError::MissingField("local_peripherals[].name"))?;
        let peripheral_type = p
            .peripheral_type
            .ok_or(ConfigError::MissingField("local_peripherals[].type"))?;
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "local_peripherals[].name",
                reason: format!("entry {idx} must not have an empty name"),
            });
        }
        local_peripherals.push(LocalPeripheralConfig {
            name,
            peripheral_type,
            methods: p.methods.unwrap_or_default(),
        });
    }

    Ok(NodeConfig {
        node_id,
        display_name: raw.display_name,
        secret_source,
        announce_interval_ms,
        cache_ttl_ms,
        cache_expire_ms,
        default_rpc_timeout_ms,
        local_peripherals,
    })
}

fn parse_secret_source(raw: &str) -> Result<SecretSource, ConfigError> {
    if let Some(inline) = raw.strip_prefix("inline:") {
        if inline.len() < MIN_SECRET_LEN {
            return Err(ConfigError::InvalidValue {
                field: "secret_source",
                reason: format!("inline secret shorter than {MIN_SECRET_LEN} characters"),
            });
        }
        return Ok(SecretSource::Inline(inline.to_owned()));
    }

    if raw.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "secret_source",
            reason: "must not be empty".to_owned(),
        });
    }
    Ok(SecretSource::File(raw.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = load_from_str(
            r#"
            node_id = "node-a"
            secret_source = "inline:a-sixteen-char-secret!"
            "#,
        )
        .unwrap();
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.announce_interval_ms, DEFAULT_ANNOUNCE_INTERVAL_MS);
        assert_eq!(config.cache_ttl_ms, DEFAULT_CACHE_TTL_MS);
        assert_eq!(config.cache_expire_ms, DEFAULT_CACHE_EXPIRE_MS);
        assert_eq!(config.default_rpc_timeout_ms, DEFAULT_RPC_TIMEOUT_MS);
        assert!(config.local_peripherals.is_empty());
    }

    #[test]
    fn missing_node_id_is_rejected() {
        let err = load_from_str(r#"secret_source = "inline:a-sixteen-char-secret!""#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("node_id")));
    }

    #[test]
    fn empty_node_id_is_rejected() {
        let err = load_from_str(
            r#"
            node_id = ""
            secret_source = "inline:a-sixteen-char-secret!"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "node_id", .. }));
    }

    #[test]
    fn short_inline_secret_is_rejected() {
        let err = load_from_str(
            r#"
            node_id = "node-a"
            secret_source = "inline:too-short"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "secret_source", .. }));
    }

    #[test]
    fn zero_announce_interval_is_rejected() {
        let err = load_from_str(
            r#"
            node_id = "node-a"
            secret_source = "inline:a-sixteen-char-secret!"
            announce_interval_ms = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "announce_interval_ms", .. }));
    }

    #[test]
    fn local_peripherals_are_parsed() {
        let config = load_from_str(
            r#"
            node_id = "node-a"
            secret_source = "inline:a-sixteen-char-secret!"

            [[local_peripherals]]
            name = "inv0"
            type = "minecraft:chest"
            methods = ["list", "pushItems"]
            "#,
        )
        .unwrap();
        assert_eq!(config.local_peripherals.len(), 1);
        assert_eq!(config.local_peripherals[0].name, "inv0");
        assert_eq!(config.local_peripherals[0].methods, vec!["list".to_owned(), "pushItems".to_owned()]);
    }

    #[test]
    fn file_secret_source_is_used_when_not_inline() {
        let config = load_from_str(
            r#"
            node_id = "node-a"
            secret_source = "/etc/peripheral-fabric/secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.secret_source, SecretSource::File("/etc/peripheral-fabric/secret".to_owned()));
    }
}
