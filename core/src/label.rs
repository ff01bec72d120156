//! Label join: attach a forward-looking claim outcome to feature rows.
//!
//! A row is labelled 1 when any at-fault claim for its policy has a loss
//! date in (period_end, period_end + window_days]. Input rows are never
//! mutated; each LabeledRow is a new record.

use crate::{
    error::{PipelineError, PipelineResult},
    features::{FeatureRow, LabeledRow},
    types::PolicyId,
};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_WINDOW_DAYS: i64 = 90;

/// Longest accepted label window (ten years).
pub const MAX_WINDOW_DAYS: i64 = 3_650;

/// Window length check shared by `join` and config validation.
pub fn check_window_days(window_days: i64) -> PipelineResult<()> {
    if !(0..=MAX_WINDOW_DAYS).contains(&window_days) {
        return Err(PipelineError::config(format!(
            "label window must lie in [0, {MAX_WINDOW_DAYS}] days, got {window_days}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id:          String,
    pub policy_id:         PolicyId,
    pub loss_date:         NaiveDate,
    pub at_fault:          bool,
    pub paid_severity_usd: f64,
}

impl Claim {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.claim_id.trim().is_empty() {
            return Err(PipelineError::validation("claim_id", "must not be empty"));
        }
        if self.policy_id.trim().is_empty() {
            return Err(PipelineError::validation(
                "policy_id",
                format!("claim {} has no policy", self.claim_id),
            ));
        }
        if !self.paid_severity_usd.is_finite() || self.paid_severity_usd < 0.0 {
            return Err(PipelineError::validation(
                "paid_severity_usd",
                format!("claim {}: {} must be >= 0", self.claim_id, self.paid_severity_usd),
            ));
        }
        Ok(())
    }
}

/// Label every feature row against the claims table.
///
/// Rows whose policy has no claims at all get label 0. Output order
/// follows `rows`; the result does not depend on the order of `claims`.
pub fn join(
    rows: &[FeatureRow],
    claims: &[Claim],
    window_days: i64,
) -> PipelineResult<Vec<LabeledRow>> {
    check_window_days(window_days)?;
    let window = Duration::try_days(window_days)
        .ok_or_else(|| PipelineError::config(format!("label window of {window_days} days overflows")))?;

    let mut loss_dates: HashMap<&str, Vec<NaiveDate>> = HashMap::new();
    for claim in claims {
        claim.validate()?;
        if claim.at_fault {
            loss_dates
                .entry(claim.policy_id.as_str())
                .or_default()
                .push(claim.loss_date);
        }
    }

    let labeled: Vec<LabeledRow> = rows
        .iter()
        .map(|row| {
            let period_end = row.period.end();
            let window_end = period_end.checked_add_signed(window).ok_or_else(|| {
                PipelineError::config(format!(
                    "label window end past the calendar for {} {}",
                    row.policy_id, row.period
                ))
            })?;
            let hit = loss_dates
                .get(row.policy_id.as_str())
                .is_some_and(|dates| dates.iter().any(|d| *d > period_end && *d <= window_end));
            Ok(LabeledRow {
                row:      row.clone(),
                label:    u8::from(hit),
                group_id: Some(row.policy_id.clone()),
            })
        })
        .collect::<PipelineResult<_>>()?;

    let positives = labeled.iter().filter(|r| r.label == 1).count();
    log::info!(
        "label: {} rows labelled, {positives} positive (window={window_days}d)",
        labeled.len()
    );
    Ok(labeled)
}
