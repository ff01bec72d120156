//! Feature aggregation: trips for one (policy, period) into a feature row.
//!
//! RULES:
//!   - aggregate() is the only place features are computed. The batch
//!     job and the online scoring path both call it, so the two can
//!     never drift apart.
//!   - Every undefined ratio or mean (zero denominator) is 0, never NaN.
//!   - Validation is strict. Dropping bad trips is a caller policy
//!     (BatchPolicy), not something aggregate() decides.

use crate::{
    error::PipelineResult,
    features::{FeatureRow, FeatureValues},
    trip::{StoredTrip, TripRecord},
    types::{Period, PolicyId},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Floor on exposure miles when it is used as a denominator.
pub const EXPOSURE_EPSILON: f64 = 1e-6;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Reduce a trip sequence to the canonical feature values.
///
/// An empty sequence yields all zeros. Fails on the first trip that
/// violates its field ranges, or when a total overflows.
pub fn aggregate(trips: &[TripRecord]) -> PipelineResult<FeatureValues> {
    for trip in trips {
        trip.validate()?;
    }

    let n = trips.len();
    let mut miles = 0.0;
    let mut duration_s = 0.0;
    let mut harsh_brakes = 0.0;
    let mut phone_uses = 0.0;
    let mut overspeed_by_duration = 0.0;
    let mut night_by_miles = 0.0;
    let mut speed_by_miles = 0.0;
    let mut speed_sum = 0.0;

    for t in trips {
        miles                 += t.miles;
        duration_s            += t.duration_s;
        harsh_brakes          += f64::from(t.harsh_brake_ct);
        phone_uses            += f64::from(t.phone_usage_ct);
        overspeed_by_duration += t.overspeed_ratio * t.duration_s;
        night_by_miles        += t.night_ratio * t.miles;
        speed_by_miles        += t.avg_speed_mps * t.miles;
        speed_sum             += t.avg_speed_mps;
    }

    let hours = duration_s / SECONDS_PER_HOUR;
    let exposure_floor = miles.max(EXPOSURE_EPSILON);

    let avg_overspeed_ratio = if duration_s > 0.0 {
        (overspeed_by_duration / duration_s).clamp(0.0, 1.0)
    } else {
        0.0
    };

    // A subnormal duration can still overflow the rate; treat it as no time.
    let phone_rate = phone_uses / hours;
    let phone_usage_per_hr = if hours > 0.0 && phone_rate.is_finite() { phone_rate } else { 0.0 };
    let mean_speed_mps = if miles > 0.0 { speed_by_miles / miles } else { 0.0 };

    // Population variance (denominator n).
    let speed_var_across_trips = if n >= 2 {
        let mean = speed_sum / n as f64;
        trips
            .iter()
            .map(|t| {
                let d = t.avg_speed_mps - mean;
                d * d
            })
            .sum::<f64>()
            / n as f64
    } else {
        0.0
    };

    let values = FeatureValues {
        exposure_miles:        miles,
        trip_ct:               n as f64,
        harsh_brake_per_100mi: harsh_brakes / exposure_floor * 100.0,
        duration_s,
        avg_overspeed_ratio,
        night_miles_ratio:     (night_by_miles / exposure_floor).clamp(0.0, 1.0),
        phone_usage_per_hr,
        mean_speed_mps,
        miles_per_trip:        miles / n.max(1) as f64,
        speed_var_across_trips,
    };
    // Sums of finite trips can still overflow.
    values.validate()?;
    Ok(values)
}

/// Build a full feature row for one (policy, period).
pub fn aggregate_row(
    policy_id: &str,
    period: Period,
    trips: &[TripRecord],
) -> PipelineResult<FeatureRow> {
    Ok(FeatureRow {
        policy_id: policy_id.to_string(),
        period,
        values: aggregate(trips)?,
    })
}

/// What a batch job does with a trip that fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Fail the whole batch on the first invalid trip.
    #[default]
    RejectBatch,
    /// Log and skip invalid trips.
    DropInvalid,
}

/// Aggregate a trip table into one row per (policy, period).
///
/// Partitions are independent; output is sorted by (policy_id, period).
pub fn aggregate_partitions(
    trips: &[StoredTrip],
    policy: BatchPolicy,
) -> PipelineResult<Vec<FeatureRow>> {
    let mut partitions: BTreeMap<(PolicyId, Period), Vec<TripRecord>> = BTreeMap::new();
    let mut dropped = 0usize;

    for trip in trips {
        if let Err(e) = trip.record.validate() {
            match policy {
                BatchPolicy::RejectBatch => {
                    log::warn!(
                        "aggregate: rejecting batch, trip {}/{} invalid: {e}",
                        trip.policy_id, trip.trip_id
                    );
                    return Err(e);
                }
                BatchPolicy::DropInvalid => {
                    log::warn!(
                        "aggregate: dropping trip {}/{}: {e}",
                        trip.policy_id, trip.trip_id
                    );
                    dropped += 1;
                    continue;
                }
            }
        }
        partitions
            .entry((trip.policy_id.clone(), trip.period()))
            .or_default()
            .push(trip.record);
    }

    let mut rows = Vec::with_capacity(partitions.len());
    for ((policy_id, period), records) in partitions {
        log::debug!("aggregate: {policy_id} {period}: {} trips", records.len());
        rows.push(aggregate_row(&policy_id, period, &records)?);
    }

    log::info!(
        "aggregate: built {} feature rows from {} trips ({dropped} dropped)",
        rows.len(),
        trips.len()
    );
    Ok(rows)
}
