//! Serving adapter: features in, risk and price factor out.
//!
//! The loaded model lives behind ModelHandle: a lock around an
//! Option<Arc<dyn RiskModel>>. Requests clone the Arc and release the
//! lock before predicting, so a reload swaps the whole model at once
//! and in-flight requests finish on the snapshot they started with.

use crate::{
    aggregator::aggregate,
    error::{PipelineError, PipelineResult},
    estimator::{verify_schema, ModelArtifact, RiskModel},
    features::{FeatureRow, FeatureValues},
    pricing::{PriceFactor, PricingParams},
    store::TelematicsStore,
    trip::TripRecord,
    types::{Period, PolicyId},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, sync::Arc};

/// Per-request probability. Callers persist it if they need to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEstimate {
    pub policy_id: PolicyId,
    pub p:         f64,
    pub features:  FeatureValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub policy_id: PolicyId,
    pub period:    Option<Period>,
    pub model_id:  String,
    #[serde(flatten)]
    pub price:     PriceFactor,
    pub features:  FeatureValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub model_loaded:  bool,
    pub model_id:      Option<String>,
    pub feature_names: Option<Vec<String>>,
    pub pricing:       PricingParams,
}

#[derive(Default)]
pub struct ModelHandle {
    current: RwLock<Option<Arc<dyn RiskModel>>>,
}

impl ModelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current model. The schema is checked first; on
    /// mismatch the previous model stays in place.
    pub fn install(&self, model: Arc<dyn RiskModel>) -> PipelineResult<()> {
        verify_schema(model.feature_names())?;
        log::info!("serving: model {} installed", model.model_id());
        *self.current.write() = Some(model);
        Ok(())
    }

    pub fn install_artifact(&self, artifact: ModelArtifact) -> PipelineResult<()> {
        self.install(artifact.into_model()?)
    }

    /// Load and install an artifact file. Any failure leaves the previous
    /// model (or none) in place and is returned to the caller.
    pub fn load_from_file(&self, path: &Path) -> PipelineResult<()> {
        let result = ModelArtifact::load(path).and_then(|a| self.install_artifact(a));
        if let Err(e) = &result {
            log::warn!("serving: model load from {} failed: {e}", path.display());
        }
        result
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }

    /// The current model, or ModelUnavailable.
    pub fn snapshot(&self) -> PipelineResult<Arc<dyn RiskModel>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| PipelineError::ModelUnavailable {
                reason: "no trained model is loaded".into(),
            })
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }
}

pub struct ScoringService {
    pricing: PricingParams,
    model:   ModelHandle,
}

impl ScoringService {
    /// Invalid pricing parameters are fatal here, before any request.
    pub fn new(pricing: PricingParams) -> PipelineResult<Self> {
        pricing.validate()?;
        Ok(Self { pricing, model: ModelHandle::new() })
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn pricing(&self) -> PricingParams {
        self.pricing
    }

    pub fn health(&self) -> Health {
        let snapshot = self.model.snapshot().ok();
        Health {
            model_loaded:  snapshot.is_some(),
            model_id:      snapshot.as_ref().map(|m| m.model_id().to_string()),
            feature_names: snapshot.as_ref().map(|m| m.feature_names().to_vec()),
            pricing:       self.pricing,
        }
    }

    /// Score a name -> value request. Absent features are 0.
    pub fn score_request(
        &self,
        policy_id: &str,
        request: &BTreeMap<String, f64>,
    ) -> PipelineResult<RiskEstimate> {
        let model = self.model.snapshot()?;
        let features = FeatureValues::from_request(request)?;
        self.estimate(model.as_ref(), policy_id, features)
    }

    /// Score raw trips through the same aggregator the batch job uses.
    pub fn score_trips(&self, policy_id: &str, trips: &[TripRecord]) -> PipelineResult<RiskEstimate> {
        let model = self.model.snapshot()?;
        let features = aggregate(trips)?;
        self.estimate(model.as_ref(), policy_id, features)
    }

    pub fn price_row(&self, row: &FeatureRow) -> PipelineResult<PriceQuote> {
        let model = self.model.snapshot()?;
        let estimate = self.estimate(model.as_ref(), &row.policy_id, row.values)?;
        Ok(PriceQuote {
            policy_id: estimate.policy_id,
            period:    Some(row.period),
            model_id:  model.model_id().to_string(),
            price:     self.pricing.factor(estimate.p)?,
            features:  estimate.features,
        })
    }

    /// Price a policy from its latest precomputed feature row.
    pub fn price_policy(&self, store: &TelematicsStore, policy_id: &str) -> PipelineResult<PriceQuote> {
        // Check the model first so "no model" is never reported as a lookup miss.
        self.model.snapshot()?;
        let row = store
            .latest_feature_row(policy_id)?
            .ok_or_else(|| PipelineError::PolicyNotFound { policy_id: policy_id.to_string() })?;
        self.price_row(&row)
    }

    fn estimate(
        &self,
        model: &dyn RiskModel,
        policy_id: &str,
        features: FeatureValues,
    ) -> PipelineResult<RiskEstimate> {
        let p = model.predict_probability(&features.to_vector())?;
        log::debug!("serving: {policy_id} p={p:.4} (model {})", model.model_id());
        Ok(RiskEstimate { policy_id: policy_id.to_string(), p, features })
    }
}

/// Latest-period quote for every policy in the store.
pub fn pricing_preview(
    store: &TelematicsStore,
    service: &ScoringService,
) -> PipelineResult<Vec<PriceQuote>> {
    let quotes = store
        .latest_feature_rows()?
        .iter()
        .map(|row| service.price_row(row))
        .collect::<PipelineResult<Vec<_>>>()?;
    log::info!("serving: priced {} policies", quotes.len());
    Ok(quotes)
}
