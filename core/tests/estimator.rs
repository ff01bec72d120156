//! Risk estimator contract: fitting, degenerate fallback, schema pinning
//! and artifact persistence.

use std::path::PathBuf;

use telematics_core::{
    config::PipelineConfig,
    error::PipelineError,
    estimator::{
        verify_schema, ConstantEstimator, ModelArtifact, ModelParams, RiskEstimator,
        DEGENERATE_FLOOR_P,
    },
    features::{feature_names_owned, FeatureRow, FeatureValues, LabeledRow, FEATURE_NAMES},
    logistic::LogisticEstimator,
    types::Period,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn labeled(policy: &str, harsh: f64, phone: f64, label: u8) -> LabeledRow {
    LabeledRow {
        row: FeatureRow {
            policy_id: policy.into(),
            period:    Period::new(2024, 1).unwrap(),
            values:    FeatureValues {
                exposure_miles:        300.0,
                trip_ct:               20.0,
                harsh_brake_per_100mi: harsh,
                duration_s:            36_000.0,
                avg_overspeed_ratio:   0.1,
                night_miles_ratio:     0.1,
                phone_usage_per_hr:    phone,
                mean_speed_mps:        14.0,
                miles_per_trip:        15.0,
                speed_var_across_trips: 4.0,
            },
        },
        label,
        group_id: Some(policy.into()),
    }
}

/// Risky drivers brake hard and use the phone; a few labels are flipped
/// so the classes overlap.
fn risk_rows() -> Vec<LabeledRow> {
    (0..60)
        .map(|i| {
            let risky = i % 2 == 0;
            let jitter = f64::from(i % 7) * 0.3;
            let (harsh, phone) = if risky { (9.0 + jitter, 3.0) } else { (1.0 + jitter, 0.5) };
            let label = u8::from(risky ^ (i % 10 == 3 || i % 10 == 4));
            labeled(&format!("P{i:03}"), harsh, phone, label)
        })
        .collect()
}

fn estimator() -> LogisticEstimator {
    PipelineConfig::default_test().training.logistic
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("telematics-core-{}-{name}", std::process::id()))
}

fn stale_names() -> Vec<String> {
    let mut names = feature_names_owned();
    names.swap(2, 3);
    names
}

// ── Fitting ──────────────────────────────────────────────────────────────────

#[test]
fn logistic_ranks_risky_drivers_higher() {
    let fitted = estimator().fit(&risk_rows(), &feature_names_owned()).unwrap();
    assert!(!fitted.degenerate);
    assert_eq!(fitted.artifact.estimator, "logistic");
    assert_eq!(fitted.artifact.feature_names, feature_names_owned());

    let model = fitted.artifact.into_model().unwrap();
    let risky = model.predict_probability(&labeled("x", 10.0, 3.0, 0).row.values.to_vector()).unwrap();
    let safe = model.predict_probability(&labeled("y", 1.0, 0.5, 0).row.values.to_vector()).unwrap();
    assert!(risky > safe, "risky={risky} safe={safe}");
    assert!((0.0..=1.0).contains(&risky) && (0.0..=1.0).contains(&safe));
}

#[test]
fn fit_is_deterministic() {
    let a = estimator().fit(&risk_rows(), &feature_names_owned()).unwrap();
    let b = estimator().fit(&risk_rows(), &feature_names_owned()).unwrap();
    assert_eq!(a.artifact.params, b.artifact.params);
}

#[test]
fn constant_estimator_predicts_the_positive_rate() {
    let rows = risk_rows();
    let rate = rows.iter().filter(|r| r.label == 1).count() as f64 / rows.len() as f64;
    let fitted = ConstantEstimator.fit(&rows, &feature_names_owned()).unwrap();
    assert_eq!(fitted.artifact.params, ModelParams::Constant { p: rate });
    assert!(!fitted.degenerate);
}

#[test]
fn single_class_training_set_falls_back_to_a_constant() {
    let rows: Vec<LabeledRow> = (0..10).map(|i| labeled(&format!("P{i}"), 2.0, 1.0, 0)).collect();
    let fitted = estimator().fit(&rows, &feature_names_owned()).unwrap();
    assert!(fitted.degenerate);
    assert_eq!(fitted.artifact.params, ModelParams::Constant { p: DEGENERATE_FLOOR_P });

    let model = fitted.artifact.into_model().unwrap();
    let p = model.predict_probability(&FeatureValues::default().to_vector()).unwrap();
    assert_eq!(p, DEGENERATE_FLOOR_P);
}

#[test]
fn all_positive_training_set_falls_back_to_one() {
    let rows: Vec<LabeledRow> = (0..4).map(|i| labeled(&format!("P{i}"), 2.0, 1.0, 1)).collect();
    let fitted = estimator().fit(&rows, &feature_names_owned()).unwrap();
    assert!(fitted.degenerate);
    assert_eq!(fitted.artifact.params, ModelParams::Constant { p: 1.0 });
}

#[test]
fn empty_training_set_does_not_panic() {
    let fitted = estimator().fit(&[], &feature_names_owned()).unwrap();
    assert!(fitted.degenerate);
}

#[test]
fn bad_hyperparameters_are_a_config_error() {
    let mut est = estimator();
    est.learning_rate = 0.0;
    let err = est.fit(&risk_rows(), &feature_names_owned()).unwrap_err();
    assert_eq!(err.kind(), "config");
}

// ── Schema pinning ───────────────────────────────────────────────────────────

#[test]
fn fit_refuses_a_foreign_schema() {
    let err = estimator().fit(&risk_rows(), &stale_names()).unwrap_err();
    assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
}

#[test]
fn reordered_schema_is_a_mismatch() {
    let err = verify_schema(&stale_names()).unwrap_err();
    match err {
        PipelineError::SchemaMismatch { expected, actual } => {
            assert_eq!(expected, stale_names());
            assert_eq!(actual, feature_names_owned());
        }
        other => panic!("expected SchemaMismatch, got {other:?}"),
    }
}

#[test]
fn older_six_feature_artifact_cannot_be_loaded() {
    let names: Vec<String> = FEATURE_NAMES[..6].iter().map(|s| s.to_string()).collect();
    let artifact = ModelArtifact::new("constant", names, ModelParams::Constant { p: 0.2 });
    let err = artifact.into_model().unwrap_err();
    assert_eq!(err.kind(), "schema_mismatch");
}

#[test]
fn eleven_feature_artifact_cannot_be_loaded() {
    let mut names = feature_names_owned();
    names.push("hard_accel_per_100mi".into());
    let artifact = ModelArtifact::new("constant", names, ModelParams::Constant { p: 0.2 });
    assert!(matches!(artifact.into_model(), Err(PipelineError::SchemaMismatch { .. })));
}

#[test]
fn wrong_length_vector_is_a_schema_mismatch() {
    let model = ModelArtifact::new("constant", feature_names_owned(), ModelParams::Constant { p: 0.2 })
        .into_model()
        .unwrap();
    let too_long = vec![0.0; FEATURE_NAMES.len() + 1];
    assert!(matches!(model.predict_probability(&too_long), Err(PipelineError::SchemaMismatch { .. })));

    let mut nan = vec![0.0; FEATURE_NAMES.len()];
    nan[4] = f64::NAN;
    assert!(matches!(model.predict_probability(&nan), Err(PipelineError::Validation { .. })));
}

#[test]
fn constant_outside_unit_interval_is_rejected() {
    let artifact = ModelArtifact::new("constant", feature_names_owned(), ModelParams::Constant { p: 1.5 });
    assert_eq!(artifact.into_model().unwrap_err().kind(), "validation");
}

// ── Persistence ──────────────────────────────────────────────────────────────

#[test]
fn artifact_survives_save_and_load() {
    let fitted = estimator().fit(&risk_rows(), &feature_names_owned()).unwrap();
    let path = temp_path("roundtrip/model.json");
    fitted.artifact.save(&path).unwrap();
    let loaded = ModelArtifact::load(&path).unwrap();
    let _ = std::fs::remove_dir_all(path.parent().unwrap());

    assert_eq!(loaded, fitted.artifact);

    // Same predictions, bit for bit.
    let x = labeled("z", 4.2, 1.7, 0).row.values.to_vector();
    let before = fitted.artifact.into_model().unwrap().predict_probability(&x).unwrap();
    let after = loaded.into_model().unwrap().predict_probability(&x).unwrap();
    assert_eq!(before, after);
}

#[test]
fn loading_a_missing_file_is_an_io_error() {
    let err = ModelArtifact::load(&temp_path("does-not-exist.json")).unwrap_err();
    assert_eq!(err.kind(), "io");
}
