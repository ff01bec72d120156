//! The canonical feature schema.
//!
//! RULE: FEATURE_NAMES is the single source of truth for feature order.
//! Training vectors, serving vectors and persisted model artifacts all
//! go through to_vector() / from_request(), never hand-built arrays.

use crate::{
    error::{PipelineError, PipelineResult},
    types::{Period, PolicyId},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered feature names. Models pin this list at fit time.
pub const FEATURE_NAMES: [&str; 10] = [
    "exposure_miles",
    "trip_ct",
    "harsh_brake_per_100mi",
    "duration_s",
    "avg_overspeed_ratio",
    "night_miles_ratio",
    "phone_usage_per_hr",
    "mean_speed_mps",
    "miles_per_trip",
    "speed_var_across_trips",
];

pub fn feature_names_owned() -> Vec<String> {
    FEATURE_NAMES.iter().map(|s| s.to_string()).collect()
}

/// The numeric part of a feature row. Every field defaults to 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureValues {
    pub exposure_miles:         f64,
    pub trip_ct:                f64,
    pub harsh_brake_per_100mi:  f64,
    pub duration_s:             f64,
    pub avg_overspeed_ratio:    f64,
    pub night_miles_ratio:      f64,
    pub phone_usage_per_hr:     f64,
    pub mean_speed_mps:         f64,
    pub miles_per_trip:         f64,
    pub speed_var_across_trips: f64,
}

impl FeatureValues {
    /// Values in FEATURE_NAMES order.
    pub fn to_vector(&self) -> Vec<f64> {
        vec![
            self.exposure_miles,
            self.trip_ct,
            self.harsh_brake_per_100mi,
            self.duration_s,
            self.avg_overspeed_ratio,
            self.night_miles_ratio,
            self.phone_usage_per_hr,
            self.mean_speed_mps,
            self.miles_per_trip,
            self.speed_var_across_trips,
        ]
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.to_vector()[i])
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut f64> {
        match name {
            "exposure_miles"         => Some(&mut self.exposure_miles),
            "trip_ct"                => Some(&mut self.trip_ct),
            "harsh_brake_per_100mi"  => Some(&mut self.harsh_brake_per_100mi),
            "duration_s"             => Some(&mut self.duration_s),
            "avg_overspeed_ratio"    => Some(&mut self.avg_overspeed_ratio),
            "night_miles_ratio"      => Some(&mut self.night_miles_ratio),
            "phone_usage_per_hr"     => Some(&mut self.phone_usage_per_hr),
            "mean_speed_mps"         => Some(&mut self.mean_speed_mps),
            "miles_per_trip"         => Some(&mut self.miles_per_trip),
            "speed_var_across_trips" => Some(&mut self.speed_var_across_trips),
            _                        => None,
        }
    }

    /// Build values from a serving request. Absent names are 0, the same
    /// default the aggregator uses for undefined features.
    pub fn from_request(request: &BTreeMap<String, f64>) -> PipelineResult<Self> {
        let mut values = Self::default();
        for (name, v) in request {
            if !v.is_finite() {
                return Err(PipelineError::validation(name.as_str(), format!("{v} is not finite")));
            }
            match values.slot_mut(name) {
                Some(slot) => *slot = *v,
                None => {
                    return Err(PipelineError::validation(
                        name.as_str(),
                        "not a feature in the scoring schema",
                    ))
                }
            }
        }
        values.validate()?;
        Ok(values)
    }

    /// Range check: every feature finite and >= 0, the two ratios at most 1.
    pub fn validate(&self) -> PipelineResult<()> {
        for (name, v) in FEATURE_NAMES.iter().zip(self.to_vector()) {
            if !v.is_finite() || v < 0.0 {
                return Err(PipelineError::validation(*name, format!("{v} must be a finite value >= 0")));
            }
        }
        for (name, v) in [
            ("avg_overspeed_ratio", self.avg_overspeed_ratio),
            ("night_miles_ratio", self.night_miles_ratio),
        ] {
            if v > 1.0 {
                return Err(PipelineError::validation(name, format!("{v} must lie in [0, 1]")));
            }
        }
        Ok(())
    }

    /// Inverse of to_vector(). The slice must match FEATURE_NAMES in length.
    pub fn from_vector(vector: &[f64]) -> PipelineResult<Self> {
        if vector.len() != FEATURE_NAMES.len() {
            return Err(PipelineError::SchemaMismatch {
                expected: feature_names_owned(),
                actual:   (0..vector.len()).map(|i| format!("#{i}")).collect(),
            });
        }
        let mut values = Self::default();
        for (name, v) in FEATURE_NAMES.iter().zip(vector) {
            if let Some(slot) = values.slot_mut(name) {
                *slot = *v;
            }
        }
        Ok(values)
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        FEATURE_NAMES
            .iter()
            .map(|n| n.to_string())
            .zip(self.to_vector())
            .collect()
    }
}

/// One (policy, period) aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub policy_id: PolicyId,
    pub period:    Period,
    #[serde(flatten)]
    pub values:    FeatureValues,
}

/// A feature row extended with its forward-looking outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledRow {
    #[serde(flatten)]
    pub row:      FeatureRow,
    pub label:    u8,
    pub group_id: Option<String>,
}

impl LabeledRow {
    /// Holdout grouping key: the explicit group, else the policy.
    pub fn group_key(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.row.policy_id)
    }
}
