//! Training pipeline: group holdout split, fit, holdout metrics.
//!
//! The split is on LabeledRow::group_key(), so one policy's periods
//! never land in both folds.

use crate::{
    config::TrainingConfig,
    error::{PipelineError, PipelineResult},
    estimator::{ModelArtifact, RiskEstimator},
    features::{feature_names_owned, LabeledRow},
    rng::{RngStream, SeededRng},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

const PROB_CLIP: f64 = 1e-15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldoutMetrics {
    pub auroc:             Option<f64>,
    pub average_precision: Option<f64>,
    pub brier:             f64,
    pub log_loss:          f64,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub artifact:   ModelArtifact,
    pub degenerate: bool,
    pub train_rows: usize,
    pub test_rows:  usize,
    /// None when the holdout fold is empty.
    pub holdout:    Option<HoldoutMetrics>,
}

/// Deterministically split rows into (train, test) by group.
///
/// Roughly `test_fraction` of the distinct groups go to test. With
/// fewer than two groups everything stays in train.
pub fn group_holdout_split(
    rows: &[LabeledRow],
    test_fraction: f64,
    seed: u64,
) -> PipelineResult<(Vec<LabeledRow>, Vec<LabeledRow>)> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(PipelineError::config(format!(
            "holdout fraction must lie in (0, 1), got {test_fraction}"
        )));
    }

    // Sorted first so the shuffle is independent of input order.
    let mut groups: Vec<&str> = rows
        .iter()
        .map(LabeledRow::group_key)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if groups.len() < 2 {
        return Ok((rows.to_vec(), Vec::new()));
    }

    let mut rng = SeededRng::new(seed, RngStream::Holdout);
    rng.shuffle(&mut groups);
    let n_test = ((groups.len() as f64 * test_fraction).round() as usize).clamp(1, groups.len() - 1);
    let test_groups: HashSet<&str> = groups[..n_test].iter().copied().collect();

    let (test, train): (Vec<LabeledRow>, Vec<LabeledRow>) = rows
        .iter()
        .cloned()
        .partition(|r| test_groups.contains(r.group_key()));
    Ok((train, test))
}

/// Fit on the train fold, score the holdout fold.
pub fn train(
    rows: &[LabeledRow],
    estimator: &dyn RiskEstimator,
    config: &TrainingConfig,
) -> PipelineResult<TrainingReport> {
    let (train_rows, test_rows) = group_holdout_split(rows, config.holdout_fraction, config.seed)?;
    log::info!(
        "train: {} rows -> {} train / {} holdout ({})",
        rows.len(),
        train_rows.len(),
        test_rows.len(),
        estimator.name()
    );

    let fitted = estimator.fit(&train_rows, &feature_names_owned())?;
    let model = fitted.artifact.clone().into_model()?;

    let holdout = if test_rows.is_empty() {
        None
    } else {
        let mut probs = Vec::with_capacity(test_rows.len());
        for r in &test_rows {
            probs.push(model.predict_probability(&r.row.values.to_vector())?);
        }
        let labels: Vec<u8> = test_rows.iter().map(|r| r.label).collect();
        let metrics = holdout_metrics(&labels, &probs);
        log::info!(
            "train: holdout auroc={:?} ap={:?} brier={:.4} logloss={:.4}",
            metrics.auroc,
            metrics.average_precision,
            metrics.brier,
            metrics.log_loss
        );
        Some(metrics)
    };

    Ok(TrainingReport {
        artifact:   fitted.artifact,
        degenerate: fitted.degenerate,
        train_rows: train_rows.len(),
        test_rows:  test_rows.len(),
        holdout,
    })
}

pub fn holdout_metrics(labels: &[u8], probs: &[f64]) -> HoldoutMetrics {
    HoldoutMetrics {
        auroc:             auroc(labels, probs),
        average_precision: average_precision(labels, probs),
        brier:             brier(labels, probs),
        log_loss:          log_loss(labels, probs),
    }
}

/// Rank-based AUROC with midranks for ties. None for a single class.
pub fn auroc(labels: &[u8], probs: &[f64]) -> Option<f64> {
    let n_pos = labels.iter().filter(|&&l| l == 1).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[a].total_cmp(&probs[b]));

    let mut ranks = vec![0.0; probs.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && probs[order[j + 1]] == probs[order[i]] {
            j += 1;
        }
        let midrank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = midrank;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = labels
        .iter()
        .zip(&ranks)
        .filter(|&(&l, _)| l == 1)
        .map(|(_, r)| r)
        .sum();
    let n_pos = n_pos as f64;
    Some((pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64))
}

/// Average precision: mean of precision at each positive, ranked by score.
pub fn average_precision(labels: &[u8], probs: &[f64]) -> Option<f64> {
    let n_pos = labels.iter().filter(|&&l| l == 1).count();
    if n_pos == 0 || n_pos == labels.len() {
        return None;
    }
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut hits = 0usize;
    let mut precision_sum = 0.0;
    for (rank, &idx) in order.iter().enumerate() {
        if labels[idx] == 1 {
            hits += 1;
            precision_sum += hits as f64 / (rank + 1) as f64;
        }
    }
    Some(precision_sum / n_pos as f64)
}

pub fn brier(labels: &[u8], probs: &[f64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    labels
        .iter()
        .zip(probs)
        .map(|(&l, p)| (p - f64::from(l)).powi(2))
        .sum::<f64>()
        / labels.len() as f64
}

pub fn log_loss(labels: &[u8], probs: &[f64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    labels
        .iter()
        .zip(probs)
        .map(|(&l, &p)| {
            let p = p.clamp(PROB_CLIP, 1.0 - PROB_CLIP);
            if l == 1 { -p.ln() } else { -(1.0 - p).ln() }
        })
        .sum::<f64>()
        / labels.len() as f64
}
