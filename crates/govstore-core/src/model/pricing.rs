use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Per-token cost of a model, used for budget accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub provider: String,
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,

    /// e.g. `chat`, `embedding`
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "chat".to_string()
}

impl ModelPricing {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() || self.provider.trim().is_empty() {
            return Err(Error::Validation(
                "Model pricing requires a model and a provider".to_string(),
            ));
        }
        let costs = [self.input_cost_per_token, self.output_cost_per_token];
        if costs.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(Error::Validation(format!(
                "Model pricing for {}: costs must be non-negative",
                self.model
            )));
        }
        Ok(())
    }
}
