//! Model registry catalog: per-entry signed model approvals.
//!
//! Unlike the other catalogs, every registry entry carries its own signature
//! over its canonical payload. A single missing or invalid entry signature
//! fails the entire load; the registry is all-or-nothing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{CatalogError, CatalogRules, SigningMaterial};
use crate::canonical;
use crate::crypto;

/// Input modality of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelModality {
    /// Plain text generation.
    Text,
    /// Image understanding.
    Vision,
    /// Audio understanding.
    Audio,
    /// Safety classifier.
    Safety,
    /// Embedding model.
    Embedding,
}

impl ModelModality {
    /// Returns the lowercase name of the modality.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Vision => "vision",
            Self::Audio => "audio",
            Self::Safety => "safety",
            Self::Embedding => "embedding",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EntryDocument {
    model_id: String,
    modality: ModelModality,
    artifact_digest: String,
    approved: bool,
    #[serde(default)]
    valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    valid_to: Option<DateTime<Utc>>,
    signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryDocument {
    models: Vec<Value>,
}

/// One verified registry entry.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    /// Model identifier, or `"*"` for the fallback entry.
    pub model_id: String,
    /// Modality this entry approves.
    pub modality: ModelModality,
    /// Digest of the approved model artifact.
    pub artifact_digest: String,
    /// Whether the entry approves use at all.
    pub approved: bool,
    /// Start of the validity window, if bounded.
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the validity window, if bounded.
    pub valid_to: Option<DateTime<Utc>>,
}

impl ModelEntry {
    /// Returns `true` if the entry approves use at the given instant.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if !self.approved {
            return false;
        }
        if let Some(from) = self.valid_from {
            if now < from {
                return false;
            }
        }
        if let Some(to) = self.valid_to {
            if now > to {
                return false;
            }
        }
        true
    }
}

/// Normalized model registry, keyed by `(model_id, modality)`.
///
/// Multiple entries per key are allowed when they differ in validity window;
/// a lookup passes if any entry is valid now.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: BTreeMap<(String, ModelModality), Vec<ModelEntry>>,
}

impl ModelRegistry {
    /// Returns the entries for `(model_id, modality)`, if any.
    #[must_use]
    pub fn entries_for(&self, model_id: &str, modality: ModelModality) -> Option<&[ModelEntry]> {
        self.entries
            .get(&(model_id.to_string(), modality))
            .map(Vec::as_slice)
    }

    /// Returns the total number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Returns `true` if the registry holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn verify_entry_signature(
    entry: &Map<String, Value>,
    sig_hex: &str,
    material: &SigningMaterial,
) -> Result<(), CatalogError> {
    let mut unsigned = entry.clone();
    unsigned.remove("signature");
    let canonical = canonical::to_canonical_json(&unsigned)?;
    let valid = match material {
        SigningMaterial::None => true,
        SigningMaterial::Static(secret) => crypto::verify_static(&canonical, sig_hex, secret),
        SigningMaterial::Keyring(ring) => crypto::verify_any(&canonical, sig_hex, ring).is_some(),
    };
    if valid {
        Ok(())
    } else {
        let model = entry
            .get("model_id")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>");
        Err(CatalogError::Rule {
            detail: format!("registry entry for model '{model}' has an invalid signature"),
        })
    }
}

impl CatalogRules for ModelRegistry {
    const KIND: &'static str = "model_registry";

    fn from_payload(
        payload: &Map<String, Value>,
        material: &SigningMaterial,
    ) -> Result<Self, CatalogError> {
        let doc: RegistryDocument = serde_json::from_value(Value::Object(payload.clone()))?;
        let mut entries: BTreeMap<(String, ModelModality), Vec<ModelEntry>> = BTreeMap::new();

        for raw_entry in doc.models {
            let Value::Object(entry_map) = &raw_entry else {
                return Err(CatalogError::Rule {
                    detail: "registry entries must be objects".to_string(),
                });
            };
            let entry: EntryDocument = serde_json::from_value(raw_entry.clone())?;
            verify_entry_signature(entry_map, &entry.signature, material)?;

            if let (Some(from), Some(to)) = (entry.valid_from, entry.valid_to) {
                if to <= from {
                    return Err(CatalogError::Rule {
                        detail: format!(
                            "registry entry for model '{}' has an empty validity window",
                            entry.model_id
                        ),
                    });
                }
            }

            entries
                .entry((entry.model_id.clone(), entry.modality))
                .or_default()
                .push(ModelEntry {
                    model_id: entry.model_id,
                    modality: entry.modality,
                    artifact_digest: entry.artifact_digest,
                    approved: entry.approved,
                    valid_from: entry.valid_from,
                    valid_to: entry.valid_to,
                });
        }

        Ok(Self { entries })
    }
}

/// Signs a registry entry payload in place, for catalog authoring and tests.
///
/// # Errors
///
/// Returns a [`CatalogError`] when canonicalization or signing fails.
pub fn sign_entry(
    mut entry: Map<String, Value>,
    material: &SigningMaterial,
) -> Result<Value, CatalogError> {
    entry.remove("signature");
    let canonical = canonical::to_canonical_json(&entry)?;
    let sig = match material {
        SigningMaterial::None => String::new(),
        SigningMaterial::Static(secret) => crypto::sign_static(&canonical, secret)?,
        SigningMaterial::Keyring(ring) => crypto::sign(&canonical, ring)?.sig,
    };
    entry.insert("signature".to_string(), Value::String(sig));
    Ok(Value::Object(entry))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use secrecy::SecretString;

    use super::*;
    use crate::crypto::Keyring;

    fn material() -> SigningMaterial {
        SigningMaterial::Keyring(Arc::new(
            Keyring::single("k1", SecretString::from("registry-secret")).unwrap(),
        ))
    }

    fn entry_value(model_id: &str, approved: bool, material: &SigningMaterial) -> Value {
        let entry = serde_json::json!({
            "model_id": model_id,
            "modality": "text",
            "artifact_digest": "sha256:abc123",
            "approved": approved,
        });
        let Value::Object(map) = entry else {
            unreachable!()
        };
        sign_entry(map, material).unwrap()
    }

    #[test]
    fn test_registry_loads_signed_entries() {
        let material = material();
        let doc = serde_json::json!({
            "models": [entry_value("claude-sonnet", true, &material)]
        });
        let Value::Object(map) = doc else {
            unreachable!()
        };
        let registry = ModelRegistry::from_payload(&map, &material).unwrap();
        assert_eq!(registry.len(), 1);
        let entries = registry
            .entries_for("claude-sonnet", ModelModality::Text)
            .unwrap();
        assert!(entries[0].is_valid_at(Utc::now()));
    }

    #[test]
    fn test_single_bad_entry_fails_whole_load() {
        let material = material();
        let good = entry_value("claude-sonnet", true, &material);
        let mut bad = entry_value("other", true, &material);
        if let Value::Object(map) = &mut bad {
            map.insert("approved".to_string(), Value::Bool(false));
        }
        let doc = serde_json::json!({"models": [good, bad]});
        let Value::Object(map) = doc else {
            unreachable!()
        };
        let err = ModelRegistry::from_payload(&map, &material).unwrap_err();
        assert!(matches!(err, CatalogError::Rule { .. }));
    }

    #[test]
    fn test_validity_window_bounds() {
        let entry = ModelEntry {
            model_id: "m".to_string(),
            modality: ModelModality::Text,
            artifact_digest: "sha256:x".to_string(),
            approved: true,
            valid_from: Some(Utc::now() + chrono::Duration::hours(1)),
            valid_to: None,
        };
        assert!(!entry.is_valid_at(Utc::now()));
        assert!(entry.is_valid_at(Utc::now() + chrono::Duration::hours(2)));
    }

    #[test]
    fn test_unapproved_entry_never_valid() {
        let material = material();
        let doc = serde_json::json!({
            "models": [entry_value("claude-sonnet", false, &material)]
        });
        let Value::Object(map) = doc else {
            unreachable!()
        };
        let registry = ModelRegistry::from_payload(&map, &material).unwrap();
        let entries = registry
            .entries_for("claude-sonnet", ModelModality::Text)
            .unwrap();
        assert!(!entries[0].is_valid_at(Utc::now()));
    }
}
