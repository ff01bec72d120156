//! Risk estimator contract and persisted model artifacts.
//!
//! RULES:
//!   - A model is only ever built from a ModelArtifact through
//!     into_model(), which pins the artifact's feature list against
//!     FEATURE_NAMES. Any difference is a SchemaMismatch, never a
//!     silent pad or truncate.
//!   - A degenerate training set (no rows, or a single label) does not
//!     fail fit(). The estimator falls back to a constant model and
//!     logs DegenerateTrainingSet.

use crate::{
    error::{PipelineError, PipelineResult},
    features::{feature_names_owned, LabeledRow, FEATURE_NAMES},
    logistic::LogisticParams,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, sync::Arc};
use uuid::Uuid;

/// Fallback probability for a constant model trained on zero positives.
pub const DEGENERATE_FLOOR_P: f64 = 0.001;

/// A trained, schema-pinned probability model.
pub trait RiskModel: Send + Sync + fmt::Debug {
    fn model_id(&self) -> &str;

    /// The ordered feature list this model was fitted on.
    fn feature_names(&self) -> &[String];

    /// P(claim) for one vector in feature_names() order.
    fn predict_probability(&self, features: &[f64]) -> PipelineResult<f64>;
}

/// A learning algorithm that turns labelled rows into an artifact.
pub trait RiskEstimator {
    fn name(&self) -> &'static str;

    fn fit(&self, rows: &[LabeledRow], feature_names: &[String]) -> PipelineResult<Fitted>;
}

#[derive(Debug, Clone)]
pub struct Fitted {
    pub artifact:   ModelArtifact,
    pub degenerate: bool,
}

/// Estimator-specific fitted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelParams {
    Logistic(LogisticParams),
    Constant { p: f64 },
}

/// Trained state plus the schema it expects. This is what gets persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_id:      String,
    pub trained_at:    DateTime<Utc>,
    pub estimator:     String,
    pub feature_names: Vec<String>,
    pub params:        ModelParams,
}

impl ModelArtifact {
    pub fn new(estimator: &str, feature_names: Vec<String>, params: ModelParams) -> Self {
        Self {
            model_id: Uuid::new_v4().to_string(),
            trained_at: Utc::now(),
            estimator: estimator.to_string(),
            feature_names,
            params,
        }
    }

    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        log::info!("estimator: saved model {} -> {}", self.model_id, path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Validate the pinned schema and parameters, then build a model.
    pub fn into_model(self) -> PipelineResult<Arc<dyn RiskModel>> {
        verify_schema(&self.feature_names)?;
        match &self.params {
            ModelParams::Logistic(params) => params.check(self.feature_names.len())?,
            ModelParams::Constant { p } => {
                if !p.is_finite() || !(0.0..=1.0).contains(p) {
                    return Err(PipelineError::validation(
                        "model_artifact",
                        format!("constant probability {p} outside [0, 1]"),
                    ));
                }
            }
        }
        Ok(Arc::new(TrainedModel { artifact: self }))
    }
}

/// Fail unless `names` is exactly FEATURE_NAMES, in order.
pub fn verify_schema(names: &[String]) -> PipelineResult<()> {
    let matches = names.len() == FEATURE_NAMES.len()
        && names.iter().zip(FEATURE_NAMES.iter()).all(|(a, b)| a == b);
    if matches {
        Ok(())
    } else {
        Err(PipelineError::SchemaMismatch {
            expected: names.to_vec(),
            actual:   feature_names_owned(),
        })
    }
}

/// Reject vectors that do not line up with a model's schema.
pub fn check_vector(expected: &[String], features: &[f64]) -> PipelineResult<()> {
    if features.len() != expected.len() {
        return Err(PipelineError::SchemaMismatch {
            expected: expected.to_vec(),
            actual:   (0..features.len()).map(|i| format!("#{i}")).collect(),
        });
    }
    if let Some((name, v)) = expected.iter().zip(features).find(|(_, v)| !v.is_finite()) {
        return Err(PipelineError::validation(name.as_str(), format!("{v} is not finite")));
    }
    Ok(())
}

/// A model loaded from a validated artifact.
#[derive(Debug)]
pub struct TrainedModel {
    artifact: ModelArtifact,
}

impl RiskModel for TrainedModel {
    fn model_id(&self) -> &str {
        &self.artifact.model_id
    }

    fn feature_names(&self) -> &[String] {
        &self.artifact.feature_names
    }

    fn predict_probability(&self, features: &[f64]) -> PipelineResult<f64> {
        check_vector(&self.artifact.feature_names, features)?;
        let p = match &self.artifact.params {
            ModelParams::Logistic(params) => params.predict(features),
            ModelParams::Constant { p } => *p,
        };
        Ok(p.clamp(0.0, 1.0))
    }
}

/// Constant-model fallback when the rows cannot support a real fit.
///
/// Returns None when both labels are present.
pub fn degenerate_fallback(
    estimator: &str,
    rows: &[LabeledRow],
    feature_names: &[String],
) -> Option<Fitted> {
    let positives = rows.iter().filter(|r| r.label == 1).count();
    if !rows.is_empty() && positives > 0 && positives < rows.len() {
        return None;
    }

    let p = if positives > 0 {
        positives as f64 / rows.len() as f64
    } else {
        DEGENERATE_FLOOR_P
    };
    log::warn!(
        "train: DegenerateTrainingSet ({} rows, {positives} positive); using constant model p={p}",
        rows.len()
    );
    Some(Fitted {
        artifact: ModelArtifact::new(estimator, feature_names.to_vec(), ModelParams::Constant { p }),
        degenerate: true,
    })
}

/// Trivial estimator: always the observed positive rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantEstimator;

impl RiskEstimator for ConstantEstimator {
    fn name(&self) -> &'static str { "constant" }

    fn fit(&self, rows: &[LabeledRow], feature_names: &[String]) -> PipelineResult<Fitted> {
        verify_schema(feature_names)?;
        if let Some(fitted) = degenerate_fallback(self.name(), rows, feature_names) {
            return Ok(fitted);
        }
        let p = rows.iter().filter(|r| r.label == 1).count() as f64 / rows.len() as f64;
        Ok(Fitted {
            artifact: ModelArtifact::new(self.name(), feature_names.to_vec(), ModelParams::Constant { p }),
            degenerate: false,
        })
    }
}
