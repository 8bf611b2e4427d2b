//! Pricing catalog: per-model USD token prices.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::{CatalogError, CatalogRules, SigningMaterial, WILDCARD_MODEL};

/// USD prices per thousand tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPrice {
    /// USD per 1000 input tokens.
    pub input_per_1k: f64,
    /// USD per 1000 output tokens.
    pub output_per_1k: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PricingDocument {
    models: BTreeMap<String, ModelPrice>,
}

/// The model has no price and the catalog has no wildcard fallback.
///
/// Cost evaluation fails closed on this error.
#[derive(Debug, Error)]
#[error("no price for model '{model}' and no wildcard fallback")]
pub struct UnpricedModel {
    /// The model that could not be priced.
    pub model: String,
}

/// Normalized pricing table.
#[derive(Debug, Clone)]
pub struct PricingTable {
    models: BTreeMap<String, ModelPrice>,
}

impl PricingTable {
    /// Returns the price for a model: exact entry first, wildcard fallback
    /// second.
    #[must_use]
    pub fn price_for(&self, model: &str) -> Option<&ModelPrice> {
        self.models
            .get(model)
            .or_else(|| self.models.get(WILDCARD_MODEL))
    }

    /// Estimates the USD cost of a request.
    ///
    /// `cost = input/1000 x input_price + output/1000 x output_price`.
    ///
    /// # Errors
    ///
    /// Returns [`UnpricedModel`] when the model has no price and there is no
    /// wildcard fallback.
    #[allow(clippy::cast_precision_loss)] // Token counts are far below 2^52.
    pub fn estimate(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<f64, UnpricedModel> {
        let price = self.price_for(model).ok_or_else(|| UnpricedModel {
            model: model.to_string(),
        })?;
        Ok(input_tokens as f64 / 1000.0 * price.input_per_1k
            + output_tokens as f64 / 1000.0 * price.output_per_1k)
    }
}

impl CatalogRules for PricingTable {
    const KIND: &'static str = "pricing";

    fn from_payload(
        payload: &Map<String, Value>,
        _material: &SigningMaterial,
    ) -> Result<Self, CatalogError> {
        let doc: PricingDocument = serde_json::from_value(Value::Object(payload.clone()))?;
        if doc.models.is_empty() {
            return Err(CatalogError::Rule {
                detail: "pricing catalog must list at least one model".to_string(),
            });
        }
        for (model, price) in &doc.models {
            if price.input_per_1k < 0.0 || price.output_per_1k < 0.0 {
                return Err(CatalogError::Rule {
                    detail: format!("model '{model}' has a negative price"),
                });
            }
        }
        Ok(Self { models: doc.models })
    }
}
