//! Trip records: one completed trip's summary metrics.
//!
//! A TripRecord is immutable once produced. Validation is strict:
//! out-of-range values are rejected, never coerced.

use crate::{
    error::{PipelineError, PipelineResult},
    types::{Period, PolicyId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub miles:           f64,
    pub duration_s:      f64,
    pub harsh_brake_ct:  u32,
    pub overspeed_ratio: f64,
    pub night_ratio:     f64,
    pub phone_usage_ct:  u32,
    pub avg_speed_mps:   f64,
}

impl TripRecord {
    /// Check every field against its stated range.
    pub fn validate(&self) -> PipelineResult<()> {
        non_negative("miles", self.miles)?;
        non_negative("duration_s", self.duration_s)?;
        non_negative("avg_speed_mps", self.avg_speed_mps)?;
        unit_ratio("overspeed_ratio", self.overspeed_ratio)?;
        unit_ratio("night_ratio", self.night_ratio)?;
        Ok(())
    }
}

fn non_negative(field: &str, v: f64) -> PipelineResult<()> {
    if !v.is_finite() || v < 0.0 {
        return Err(PipelineError::validation(field, format!("{v} must be a finite value >= 0")));
    }
    Ok(())
}

fn unit_ratio(field: &str, v: f64) -> PipelineResult<()> {
    if !v.is_finite() || !(0.0..=1.0).contains(&v) {
        return Err(PipelineError::validation(field, format!("{v} must lie in [0, 1]")));
    }
    Ok(())
}

/// A trip as held by the trip store: identity plus metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTrip {
    pub policy_id: PolicyId,
    pub trip_id:   String,
    pub start_ts:  DateTime<Utc>,
    #[serde(flatten)]
    pub record:    TripRecord,
}

impl StoredTrip {
    /// The monthly period this trip is aggregated into.
    pub fn period(&self) -> Period {
        Period::containing(self.start_ts.date_naive())
    }
}
