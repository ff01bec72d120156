//! Serving adapter: model availability, request validation, snapshot
//! swaps and parity with the batch feature path.

use std::{collections::BTreeMap, sync::Arc, thread};

use chrono::{Duration, TimeZone, Utc};
use telematics_core::{
    aggregator::{aggregate, aggregate_partitions, BatchPolicy},
    error::{PipelineError, PipelineResult},
    estimator::{ModelArtifact, ModelParams, RiskModel},
    features::{feature_names_owned, FeatureValues, FEATURE_NAMES},
    pricing::PricingParams,
    serving::{pricing_preview, ModelHandle, ScoringService},
    store::TelematicsStore,
    trip::{StoredTrip, TripRecord},
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn service() -> ScoringService {
    ScoringService::new(PricingParams::default()).unwrap()
}

fn constant(p: f64) -> ModelArtifact {
    ModelArtifact::new("constant", feature_names_owned(), ModelParams::Constant { p })
}

fn store() -> TelematicsStore {
    let s = TelematicsStore::in_memory().unwrap();
    s.migrate().unwrap();
    s
}

fn trips_for(policy: &str, month: u32, n: usize) -> Vec<StoredTrip> {
    (0..n)
        .map(|i| StoredTrip {
            policy_id: policy.into(),
            trip_id:   format!("{policy}-{month}-{i}"),
            start_ts:  Utc.with_ymd_and_hms(2024, month, 1, 7, 0, 0).unwrap()
                + Duration::hours(i as i64 * 13),
            record:    TripRecord {
                miles:           3.1 + i as f64 * 1.7,
                duration_s:      420.0 + i as f64 * 95.0,
                harsh_brake_ct:  (i % 3) as u32,
                overspeed_ratio: 0.05 * (i % 5) as f64,
                night_ratio:     if i % 4 == 0 { 0.6 } else { 0.0 },
                phone_usage_ct:  (i % 2) as u32,
                avg_speed_mps:   9.5 + i as f64 * 0.35,
            },
        })
        .collect()
}

/// A model that answers with the first feature, for parity checks.
#[derive(Debug)]
struct ExposureEcho {
    names: Vec<String>,
}

impl RiskModel for ExposureEcho {
    fn model_id(&self) -> &str { "echo" }

    fn feature_names(&self) -> &[String] { &self.names }

    fn predict_probability(&self, features: &[f64]) -> PipelineResult<f64> {
        Ok((features[0] / 1_000.0).clamp(0.0, 1.0))
    }
}

// ── Availability ─────────────────────────────────────────────────────────────

#[test]
fn no_model_is_model_unavailable_not_validation() {
    let svc = service();
    assert!(!svc.health().model_loaded);

    let err = svc.score_request("P1", &BTreeMap::new()).unwrap_err();
    assert!(matches!(err, PipelineError::ModelUnavailable { .. }));
    assert_eq!(err.kind(), "model_unavailable");

    // Even a malformed request reports the missing model first.
    let bad: BTreeMap<String, f64> = [("no_such_feature".to_string(), 1.0)].into();
    assert_eq!(svc.score_request("P1", &bad).unwrap_err().kind(), "model_unavailable");
}

#[test]
fn malformed_request_is_validation_once_a_model_is_loaded() {
    let svc = service();
    svc.model().install_artifact(constant(0.25)).unwrap();

    let unknown: BTreeMap<String, f64> = [("hard_accel_per_100mi".to_string(), 2.0)].into();
    assert_eq!(svc.score_request("P1", &unknown).unwrap_err().kind(), "validation");

    let nan: BTreeMap<String, f64> = [("trip_ct".to_string(), f64::NAN)].into();
    assert_eq!(svc.score_request("P1", &nan).unwrap_err().kind(), "validation");
}

#[test]
fn out_of_range_request_values_are_not_scored() {
    let svc = service();
    svc.model().install_artifact(constant(0.25)).unwrap();

    let request: BTreeMap<String, f64> = [
        ("exposure_miles".to_string(), -50.0),
        ("avg_overspeed_ratio".to_string(), 7.5),
        ("trip_ct".to_string(), -3.0),
    ]
    .into();
    let err = svc.score_request("P1", &request).unwrap_err();
    assert!(matches!(err, PipelineError::Validation { .. }), "got {err:?}");

    let ratio_only: BTreeMap<String, f64> = [("night_miles_ratio".to_string(), 1.5)].into();
    assert_eq!(svc.score_request("P1", &ratio_only).unwrap_err().kind(), "validation");
}

#[test]
fn absent_features_default_to_zero() {
    let svc = service();
    svc.model()
        .install(Arc::new(ExposureEcho { names: feature_names_owned() }))
        .unwrap();

    let est = svc.score_request("P1", &BTreeMap::new()).unwrap();
    assert_eq!(est.features, FeatureValues::default());
    assert_eq!(est.p, 0.0);

    let partial: BTreeMap<String, f64> = [("exposure_miles".to_string(), 250.0)].into();
    let est = svc.score_request("P1", &partial).unwrap();
    assert_eq!(est.p, 0.25);
    assert_eq!(est.features.trip_ct, 0.0);
}

#[test]
fn health_reports_the_loaded_schema() {
    let svc = service();
    let artifact = constant(0.3);
    let id = artifact.model_id.clone();
    svc.model().install_artifact(artifact).unwrap();

    let health = svc.health();
    assert!(health.model_loaded);
    assert_eq!(health.model_id.as_deref(), Some(id.as_str()));
    assert_eq!(health.feature_names, Some(feature_names_owned()));
    assert_eq!(health.pricing, PricingParams::default());
}

#[test]
fn invalid_pricing_params_refuse_to_start() {
    let params = PricingParams { factor_min: 1.2, factor_max: 1.0, ..Default::default() };
    assert!(matches!(ScoringService::new(params), Err(PipelineError::Config { .. })));
}

// ── Swaps ────────────────────────────────────────────────────────────────────

#[test]
fn stale_model_is_refused_and_previous_kept() {
    let handle = ModelHandle::new();
    handle.install_artifact(constant(0.2)).unwrap();

    let mut names = feature_names_owned();
    names.truncate(6);
    let stale = ModelArtifact::new("constant", names, ModelParams::Constant { p: 0.9 });
    assert_eq!(handle.install_artifact(stale).unwrap_err().kind(), "schema_mismatch");

    let model = handle.snapshot().unwrap();
    assert_eq!(model.predict_probability(&[0.0; FEATURE_NAMES.len()]).unwrap(), 0.2);
}

#[test]
fn failed_reload_from_file_keeps_previous_model() {
    let handle = ModelHandle::new();
    handle.install_artifact(constant(0.4)).unwrap();
    let missing = std::env::temp_dir().join(format!("telematics-missing-{}.json", std::process::id()));

    assert!(handle.load_from_file(&missing).is_err());
    assert!(handle.is_loaded());

    handle.clear();
    assert!(!handle.is_loaded());
    assert_eq!(handle.snapshot().unwrap_err().kind(), "model_unavailable");
}

#[test]
fn readers_see_a_whole_model_during_swaps() {
    let svc = Arc::new(service());
    svc.model().install_artifact(constant(0.2)).unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            let svc = Arc::clone(&svc);
            s.spawn(move || {
                for _ in 0..500 {
                    let p = svc.score_request("P1", &BTreeMap::new()).unwrap().p;
                    assert!(p == 0.2 || p == 0.7, "torn read: {p}");
                }
            });
        }
        for i in 0..200 {
            let p = if i % 2 == 0 { 0.7 } else { 0.2 };
            svc.model().install_artifact(constant(p)).unwrap();
        }
    });
}

// ── Batch parity ─────────────────────────────────────────────────────────────

#[test]
fn online_trips_match_stored_batch_row() {
    let mut st = store();
    let trips = trips_for("P1", 3, 9);
    st.insert_trips(&trips).unwrap();

    let rows = aggregate_partitions(&st.all_trips().unwrap(), BatchPolicy::RejectBatch).unwrap();
    st.upsert_feature_rows(&rows).unwrap();
    let stored = st.latest_feature_row("P1").unwrap().unwrap();

    let svc = service();
    svc.model()
        .install(Arc::new(ExposureEcho { names: feature_names_owned() }))
        .unwrap();
    let records: Vec<TripRecord> = trips.iter().map(|t| t.record).collect();
    let online = svc.score_trips("P1", &records).unwrap();

    assert_eq!(online.features, stored.values);
    assert_eq!(online.features, aggregate(&records).unwrap());
    assert_eq!(online.p, svc.price_row(&stored).unwrap().price.p);
}

#[test]
fn price_policy_uses_the_latest_period() {
    let mut st = store();
    let mut trips = trips_for("P1", 2, 4);
    trips.extend(trips_for("P1", 4, 6));
    trips.extend(trips_for("P2", 3, 2));
    st.insert_trips(&trips).unwrap();
    let rows = aggregate_partitions(&st.all_trips().unwrap(), BatchPolicy::RejectBatch).unwrap();
    st.upsert_feature_rows(&rows).unwrap();

    let svc = service();
    svc.model().install_artifact(constant(0.30)).unwrap();

    let quote = svc.price_policy(&st, "P1").unwrap();
    assert_eq!(quote.period.map(|p| p.to_string()).as_deref(), Some("2024-04"));
    assert_eq!(quote.features.trip_ct, 6.0);
    assert_eq!(quote.price.factor, 1.0);

    let err = svc.price_policy(&st, "P9").unwrap_err();
    assert!(matches!(err, PipelineError::PolicyNotFound { ref policy_id } if policy_id == "P9"));

    let preview = pricing_preview(&st, &svc).unwrap();
    let ids: Vec<&str> = preview.iter().map(|q| q.policy_id.as_str()).collect();
    assert_eq!(ids, vec!["P1", "P2"]);
}

#[test]
fn price_policy_without_model_is_model_unavailable() {
    let st = store();
    let err = service().price_policy(&st, "P9").unwrap_err();
    assert_eq!(err.kind(), "model_unavailable");
}
