//! Connector catalog: delivery endpoints for messaging channels.
//!
//! The sidecar only validates and publishes these descriptors; the HTTP
//! delivery transport lives outside the core.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{CatalogError, CatalogRules, SigningMaterial};

/// Default dispatch timeout when a connector does not set one.
pub const DEFAULT_DISPATCH_TIMEOUT_MS: u64 = 10_000;

/// One channel connector descriptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorEntry {
    /// Delivery endpoint URL.
    pub endpoint: String,

    /// Dispatch timeout in milliseconds; expiry surfaces as a recoverable
    /// deny in the delivery layer.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_DISPATCH_TIMEOUT_MS
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectorDocument {
    channels: BTreeMap<String, ConnectorEntry>,
}

/// Normalized connector catalog, keyed by lowercase channel name.
#[derive(Debug, Clone)]
pub struct ConnectorCatalog {
    channels: BTreeMap<String, ConnectorEntry>,
}

impl ConnectorCatalog {
    /// Returns the connector for a channel, if configured.
    #[must_use]
    pub fn connector_for(&self, channel: &str) -> Option<&ConnectorEntry> {
        self.channels.get(&channel.to_lowercase())
    }

    /// Returns the configured channel names, sorted.
    #[must_use]
    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.keys().map(String::as_str).collect()
    }
}

impl CatalogRules for ConnectorCatalog {
    const KIND: &'static str = "connectors";

    fn from_payload(
        payload: &Map<String, Value>,
        _material: &SigningMaterial,
    ) -> Result<Self, CatalogError> {
        let doc: ConnectorDocument = serde_json::from_value(Value::Object(payload.clone()))?;
        for (channel, entry) in &doc.channels {
            if entry.endpoint.is_empty() {
                return Err(CatalogError::Rule {
                    detail: format!("connector '{channel}' has an empty endpoint"),
                });
            }
            if entry.timeout_ms == 0 {
                return Err(CatalogError::Rule {
                    detail: format!("connector '{channel}' has a zero timeout"),
                });
            }
        }
        Ok(Self {
            channels: doc
                .channels
                .into_iter()
                .map(|(channel, entry)| (channel.to_lowercase(), entry))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_lookup_case_insensitive() {
        let doc = serde_json::json!({
            "channels": {"Slack": {"endpoint": "https://hooks.example/slack"}}
        });
        let Value::Object(map) = doc else {
            unreachable!()
        };
        let catalog = ConnectorCatalog::from_payload(&map, &SigningMaterial::None).unwrap();
        let entry = catalog.connector_for("SLACK").unwrap();
        assert_eq!(entry.timeout_ms, DEFAULT_DISPATCH_TIMEOUT_MS);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let doc = serde_json::json!({
            "channels": {"slack": {"endpoint": "https://x", "timeout_ms": 0}}
        });
        let Value::Object(map) = doc else {
            unreachable!()
        };
        assert!(ConnectorCatalog::from_payload(&map, &SigningMaterial::None).is_err());
    }
}
