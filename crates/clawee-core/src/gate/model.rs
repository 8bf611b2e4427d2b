//! Model registry gate: only registered, approved, in-window models pass.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::catalog::{ModelModality, ModelRegistry, WILDCARD_MODEL};

/// A model registry denial.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModelDeny {
    /// No entry exists for the model and modality, nor a wildcard.
    #[error("model '{model_id}' is not registered for modality '{}'", .modality.as_str())]
    NotRegistered {
        /// The requested model.
        model_id: String,
        /// The requested modality.
        modality: ModelModality,
    },

    /// Entries exist but none is approved and within its validity window.
    #[error("model '{model_id}' has no valid approval for modality '{}' at this time", .modality.as_str())]
    NotValid {
        /// The requested model.
        model_id: String,
        /// The requested modality.
        modality: ModelModality,
    },
}

/// Checks a model call against the registry.
///
/// An exact `(model_id, modality)` entry is consulted first, then the
/// wildcard `"*"` entry for the modality. The gate passes if any consulted
/// entry is approved and `now` falls inside its validity window.
///
/// # Errors
///
/// Returns a [`ModelDeny`] when no valid entry admits the call.
pub fn evaluate_model(
    registry: &ModelRegistry,
    model_id: &str,
    modality: ModelModality,
    now: DateTime<Utc>,
) -> Result<(), ModelDeny> {
    let exact = registry.entries_for(model_id, modality);
    let wildcard = registry.entries_for(WILDCARD_MODEL, modality);

    let mut any_entry = false;
    for entries in [exact, wildcard].into_iter().flatten() {
        any_entry = any_entry || !entries.is_empty();
        if entries.iter().any(|e| e.is_valid_at(now)) {
            return Ok(());
        }
    }

    if any_entry {
        Err(ModelDeny::NotValid {
            model_id: model_id.to_string(),
            modality,
        })
    } else {
        Err(ModelDeny::NotRegistered {
            model_id: model_id.to_string(),
            modality,
        })
    }
}
