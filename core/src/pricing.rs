//! Pricing mapper: risk probability to a capped premium factor.
//!
//! factor = clamp(1 + slope * (p - baseline_prev), factor_min, factor_max)
//!
//! Pure and stateless. Invalid parameters are a ConfigError; the mapper
//! never repairs them by clamping.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingParams {
    /// Portfolio claim prevalence that maps to factor 1.0.
    pub baseline_prev: f64,
    pub slope:         f64,
    pub factor_min:    f64,
    pub factor_max:    f64,
}

impl Default for PricingParams {
    fn default() -> Self {
        Self {
            baseline_prev: 0.30,
            slope:         0.5,
            factor_min:    0.90,
            factor_max:    1.10,
        }
    }
}

impl PricingParams {
    pub fn validate(&self) -> PipelineResult<()> {
        let all_finite = [self.baseline_prev, self.slope, self.factor_min, self.factor_max]
            .iter()
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(PipelineError::config(format!(
                "pricing parameters must be finite: {self:?}"
            )));
        }
        if self.factor_min > self.factor_max {
            return Err(PipelineError::config(format!(
                "factor_min {} > factor_max {}",
                self.factor_min, self.factor_max
            )));
        }
        Ok(())
    }

    pub fn factor(&self, p: f64) -> PipelineResult<PriceFactor> {
        let factor = price(p, self.baseline_prev, self.slope, self.factor_min, self.factor_max)?;
        Ok(PriceFactor { p, factor, params: *self })
    }
}

/// A factor together with the inputs that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceFactor {
    pub p:      f64,
    pub factor: f64,
    pub params: PricingParams,
}

pub fn price(
    p: f64,
    baseline_prev: f64,
    slope: f64,
    factor_min: f64,
    factor_max: f64,
) -> PipelineResult<f64> {
    PricingParams { baseline_prev, slope, factor_min, factor_max }.validate()?;
    if !p.is_finite() || !(0.0..=1.0).contains(&p) {
        return Err(PipelineError::validation("p", format!("{p} must lie in [0, 1]")));
    }
    Ok((1.0 + slope * (p - baseline_prev)).clamp(factor_min, factor_max))
}
