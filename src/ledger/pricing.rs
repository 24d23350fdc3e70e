//! Usage-based cost estimates for model calls.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Price charged per token when a model has no configured pricing.
pub const DEFAULT_PRICE_PER_TOKEN: f64 = 0.000001;

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }
}

/// Per-token USD prices for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default = "default_price")]
    pub prompt_per_token: f64,
    #[serde(default = "default_price")]
    pub completion_per_token: f64,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            prompt_per_token: DEFAULT_PRICE_PER_TOKEN,
            completion_per_token: DEFAULT_PRICE_PER_TOKEN,
        }
    }
}

fn default_price() -> f64 {
    DEFAULT_PRICE_PER_TOKEN
}

/// Model name to pricing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: &str, pricing: ModelPricing) -> Self {
        self.models.insert(model.to_string(), pricing);
        self
    }

    /// Pricing for `model`, or the default per-token price.
    pub fn pricing(&self, model: &str) -> ModelPricing {
        self.models.get(model).copied().unwrap_or_default()
    }

    /// Parse a table from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: PricingTable = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse pricing table: {}", e)))?;
        for (model, pricing) in &table.models {
            let valid = [pricing.prompt_per_token, pricing.completion_per_token]
                .iter()
                .all(|price| price.is_finite() && *price >= 0.0);
            if !valid {
                return Err(TurnstileError::Config(format!(
                    "pricing for model {} must be finite and non-negative",
                    model
                )));
            }
        }
        Ok(table)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}

/// Estimated USD cost of a call to `model` with the given usage.
pub fn compute_cost(model: &str, usage: &Usage, pricing: &PricingTable) -> f64 {
    let prices = pricing.pricing(model);
    usage.prompt_tokens as f64 * prices.prompt_per_token
        + usage.completion_tokens as f64 * prices.completion_per_token
}

/// Total tokens in a usage report.
pub fn token_count(usage: &Usage) -> u64 {
    usage.prompt_tokens.saturating_add(usage.completion_tokens)
}
