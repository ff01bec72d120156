use crate::{
    aggregator::BatchPolicy,
    error::{PipelineError, PipelineResult},
    label::{check_window_days, DEFAULT_WINDOW_DAYS},
    logistic::LogisticEstimator,
    pricing::PricingParams,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Share of groups held out for evaluation.
    pub holdout_fraction: f64,
    pub seed:             u64,
    #[serde(default)]
    pub logistic:         LogisticEstimator,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.25,
            seed:             42,
            logistic:         LogisticEstimator::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub pricing:           PricingParams,
    #[serde(default = "default_window_days")]
    pub label_window_days: i64,
    #[serde(default)]
    pub training:          TrainingConfig,
    #[serde(default)]
    pub batch_policy:      BatchPolicy,
}

fn default_window_days() -> i64 {
    DEFAULT_WINDOW_DAYS
}

impl PipelineConfig {
    /// Load from a JSON file. Missing sections take their defaults.
    /// In tests, use PipelineConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        Ok(config)
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        Self {
            pricing:           PricingParams::default(),
            label_window_days: DEFAULT_WINDOW_DAYS,
            training: TrainingConfig {
                holdout_fraction: 0.25,
                seed:             42,
                logistic: LogisticEstimator {
                    epochs: 500,
                    ..LogisticEstimator::default()
                },
            },
            batch_policy: BatchPolicy::RejectBatch,
        }
    }

    /// Pricing overrides from BASELINE_PREV, PRICING_SLOPE, FACTOR_MIN
    /// and FACTOR_MAX. An unparseable value is a config error.
    pub fn apply_env_overrides(&mut self) -> PipelineResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> PipelineResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let slots: [(&str, &mut f64); 4] = [
            ("BASELINE_PREV", &mut self.pricing.baseline_prev),
            ("PRICING_SLOPE", &mut self.pricing.slope),
            ("FACTOR_MIN",    &mut self.pricing.factor_min),
            ("FACTOR_MAX",    &mut self.pricing.factor_max),
        ];
        for (key, slot) in slots {
            if let Some(raw) = lookup(key) {
                *slot = raw.trim().parse().map_err(|_| {
                    PipelineError::config(format!("{key}={raw:?} is not a number"))
                })?;
                log::debug!("config: {key} overridden to {slot}");
            }
        }
        Ok(())
    }

    /// Fatal-at-startup checks.
    pub fn validate(&self) -> PipelineResult<()> {
        self.pricing.validate()?;
        check_window_days(self.label_window_days)?;
        let f = self.training.holdout_fraction;
        if !(f > 0.0 && f < 1.0) {
            return Err(PipelineError::config(format!(
                "holdout_fraction must lie in (0, 1), got {f}"
            )));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pricing:           PricingParams::default(),
            label_window_days: DEFAULT_WINDOW_DAYS,
            training:          TrainingConfig::default(),
            batch_policy:      BatchPolicy::default(),
        }
    }
}
