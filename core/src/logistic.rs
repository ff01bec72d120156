//! Standardised logistic regression with Platt calibration.
//!
//! Fit order: z-score every feature, fit (optionally class-balanced)
//! L2 logistic regression by full-batch gradient descent, then fit a
//! one-dimensional sigmoid a*z + c on the raw logits so the output
//! probabilities track observed frequencies again.

use crate::{
    error::{PipelineError, PipelineResult},
    estimator::{degenerate_fallback, verify_schema, Fitted, ModelArtifact, ModelParams, RiskEstimator},
    features::LabeledRow,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticParams {
    pub means:     Vec<f64>,
    pub scales:    Vec<f64>,
    pub weights:   Vec<f64>,
    pub intercept: f64,
    pub calib_a:   f64,
    pub calib_c:   f64,
}

impl LogisticParams {
    /// Raw (uncalibrated) logit.
    pub fn logit(&self, x: &[f64]) -> f64 {
        self.intercept
            + x.iter()
                .zip(&self.means)
                .zip(&self.scales)
                .zip(&self.weights)
                .map(|(((v, m), s), w)| w * (v - m) / s)
                .sum::<f64>()
    }

    pub fn predict(&self, x: &[f64]) -> f64 {
        sigmoid(self.calib_a * self.logit(x) + self.calib_c)
    }

    pub(crate) fn check(&self, n_features: usize) -> PipelineResult<()> {
        let lens = [self.means.len(), self.scales.len(), self.weights.len()];
        if lens.iter().any(|&l| l != n_features) {
            return Err(PipelineError::validation(
                "model_artifact",
                format!("logistic parameter lengths {lens:?} do not match {n_features} features"),
            ));
        }
        let all_finite = self
            .means
            .iter()
            .chain(&self.weights)
            .chain([&self.intercept, &self.calib_a, &self.calib_c])
            .all(|v| v.is_finite());
        if !all_finite || self.scales.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(PipelineError::validation(
                "model_artifact",
                "logistic parameters must be finite with positive scales",
            ));
        }
        Ok(())
    }
}

pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticEstimator {
    pub learning_rate:  f64,
    pub epochs:         usize,
    pub l2:             f64,
    pub class_balanced: bool,
    pub calibrate:      bool,
}

impl Default for LogisticEstimator {
    fn default() -> Self {
        Self {
            learning_rate:  0.1,
            epochs:         2_000,
            l2:             1e-3,
            class_balanced: true,
            calibrate:      true,
        }
    }
}

impl RiskEstimator for LogisticEstimator {
    fn name(&self) -> &'static str { "logistic" }

    fn fit(&self, rows: &[LabeledRow], feature_names: &[String]) -> PipelineResult<Fitted> {
        verify_schema(feature_names)?;
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) || self.l2 < 0.0 {
            return Err(PipelineError::config(format!(
                "logistic: learning_rate must be > 0 and l2 >= 0 (got {}, {})",
                self.learning_rate, self.l2
            )));
        }
        if let Some(fitted) = degenerate_fallback(self.name(), rows, feature_names) {
            return Ok(fitted);
        }

        let x: Vec<Vec<f64>> = rows.iter().map(|r| r.row.values.to_vector()).collect();
        let y: Vec<f64> = rows.iter().map(|r| f64::from(r.label)).collect();
        let (means, scales) = standardisation(&x, feature_names.len());
        let z: Vec<Vec<f64>> = x
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&means)
                    .zip(&scales)
                    .map(|((v, m), s)| (v - m) / s)
                    .collect()
            })
            .collect();

        let n = rows.len() as f64;
        let n_pos = y.iter().sum::<f64>();
        let sample_weights: Vec<f64> = y
            .iter()
            .map(|&label| match (self.class_balanced, label > 0.5) {
                (false, _)    => 1.0,
                (true, true)  => n / (2.0 * n_pos),
                (true, false) => n / (2.0 * (n - n_pos)),
            })
            .collect();

        let (weights, intercept) = self.gradient_descent(&z, &y, &sample_weights);

        let mut params = LogisticParams {
            means,
            scales,
            weights,
            intercept,
            calib_a: 1.0,
            calib_c: 0.0,
        };
        if self.calibrate {
            let logits: Vec<f64> = x.iter().map(|row| params.logit(row)).collect();
            let (a, c) = self.platt(&logits, &y);
            params.calib_a = a;
            params.calib_c = c;
        }

        log::info!(
            "train: logistic fit on {} rows ({} positive), intercept={:.4}, calib=({:.4}, {:.4})",
            rows.len(),
            n_pos,
            params.intercept,
            params.calib_a,
            params.calib_c
        );
        Ok(Fitted {
            artifact: ModelArtifact::new(
                self.name(),
                feature_names.to_vec(),
                ModelParams::Logistic(params),
            ),
            degenerate: false,
        })
    }
}

impl LogisticEstimator {
    fn gradient_descent(&self, z: &[Vec<f64>], y: &[f64], sw: &[f64]) -> (Vec<f64>, f64) {
        let d = z.first().map_or(0, Vec::len);
        let total_weight: f64 = sw.iter().sum();
        let mut beta = vec![0.0; d];
        let mut b0 = 0.0;

        for _ in 0..self.epochs {
            let mut grad = vec![0.0; d];
            let mut g0 = 0.0;
            for ((row, &label), &w) in z.iter().zip(y).zip(sw) {
                let logit = b0 + row.iter().zip(&beta).map(|(v, b)| v * b).sum::<f64>();
                let err = w * (sigmoid(logit) - label);
                g0 += err;
                for (g, v) in grad.iter_mut().zip(row) {
                    *g += err * v;
                }
            }
            b0 -= self.learning_rate * g0 / total_weight;
            for (b, g) in beta.iter_mut().zip(&grad) {
                *b -= self.learning_rate * (g / total_weight + self.l2 * *b);
            }
        }
        (beta, b0)
    }

    /// Platt scaling with the usual smoothed targets.
    fn platt(&self, logits: &[f64], y: &[f64]) -> (f64, f64) {
        let n_pos = y.iter().sum::<f64>();
        let n_neg = y.len() as f64 - n_pos;
        let t_pos = (n_pos + 1.0) / (n_pos + 2.0);
        let t_neg = 1.0 / (n_neg + 2.0);
        let n = y.len() as f64;

        let mut a = 1.0;
        let mut c = 0.0;
        for _ in 0..self.epochs {
            let mut ga = 0.0;
            let mut gc = 0.0;
            for (&s, &label) in logits.iter().zip(y) {
                let target = if label > 0.5 { t_pos } else { t_neg };
                let err = sigmoid(a * s + c) - target;
                ga += err * s;
                gc += err;
            }
            a -= self.learning_rate * ga / n;
            c -= self.learning_rate * gc / n;
        }
        (a, c)
    }
}

/// Per-feature mean and population std; a constant column gets scale 1.
fn standardisation(x: &[Vec<f64>], d: usize) -> (Vec<f64>, Vec<f64>) {
    let n = x.len().max(1) as f64;
    let mut means = vec![0.0; d];
    for row in x {
        for (m, v) in means.iter_mut().zip(row) {
            *m += v;
        }
    }
    means.iter_mut().for_each(|m| *m /= n);

    let mut scales = vec![0.0; d];
    for row in x {
        for ((s, v), m) in scales.iter_mut().zip(row).zip(&means) {
            *s += (v - m) * (v - m);
        }
    }
    for s in scales.iter_mut() {
        let std = (*s / n).sqrt();
        *s = if std > 1e-12 { std } else { 1.0 };
    }
    (means, scales)
}
