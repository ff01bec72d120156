//! Store round trips: what goes in comes back out unchanged.

use chrono::{NaiveDate, TimeZone, Utc};
use telematics_core::{
    aggregator::aggregate_row,
    estimator::{ModelArtifact, ModelParams},
    features::{feature_names_owned, FeatureRow, FeatureValues},
    label::{join, Claim},
    store::TelematicsStore,
    trip::{StoredTrip, TripRecord},
    types::Period,
};

fn store() -> TelematicsStore {
    let s = TelematicsStore::in_memory().unwrap();
    s.migrate().unwrap();
    s
}

fn trip(policy: &str, id: &str, day: u32, miles: f64) -> StoredTrip {
    StoredTrip {
        policy_id: policy.into(),
        trip_id:   id.into(),
        start_ts:  Utc.with_ymd_and_hms(2024, 5, day, 17, 45, 12).unwrap(),
        record:    TripRecord {
            miles,
            duration_s:      miles * 97.3,
            harsh_brake_ct:  2,
            overspeed_ratio: 0.137,
            night_ratio:     0.1 / 3.0,
            phone_usage_ct:  1,
            avg_speed_mps:   16.0 / 3.0,
        },
    }
}

fn row(policy: &str, m: u32, miles: f64) -> FeatureRow {
    FeatureRow {
        policy_id: policy.into(),
        period:    Period::new(2024, m).unwrap(),
        values:    FeatureValues { exposure_miles: miles, trip_ct: 1.0, ..Default::default() },
    }
}

#[test]
fn trips_round_trip_in_policy_then_time_order() {
    let mut st = store();
    let trips = vec![trip("B", "b1", 3, 4.0), trip("A", "a2", 9, 0.1 + 0.2), trip("A", "a1", 2, 11.0)];
    st.insert_trips(&trips).unwrap();

    let back = st.all_trips().unwrap();
    let ids: Vec<&str> = back.iter().map(|t| t.trip_id.as_str()).collect();
    assert_eq!(ids, vec!["a1", "a2", "b1"]);
    assert_eq!(back[1], trips[1]);
}

#[test]
fn duplicate_trip_is_a_database_error_and_rolls_back() {
    let mut st = store();
    let batch = vec![trip("A", "a1", 2, 1.0), trip("A", "a1", 3, 2.0)];
    let err = st.insert_trips(&batch).unwrap_err();
    assert_eq!(err.kind(), "database");
    assert!(st.all_trips().unwrap().is_empty());
}

#[test]
fn feature_row_reread_is_bit_identical() {
    let st = store();
    let records: Vec<TripRecord> = (1..=5).map(|d| trip("A", &format!("a{d}"), d, 1.1 * d as f64).record).collect();
    let computed = aggregate_row("A", Period::new(2024, 5).unwrap(), &records).unwrap();
    st.upsert_feature_row(&computed).unwrap();

    let back = st.latest_feature_row("A").unwrap().unwrap();
    for (a, b) in computed.values.to_vector().iter().zip(back.values.to_vector()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
    assert_eq!(back, computed);
}

#[test]
fn upsert_replaces_and_latest_picks_max_period() {
    let mut st = store();
    st.upsert_feature_rows(&[row("A", 1, 10.0), row("A", 11, 20.0), row("A", 3, 30.0), row("B", 2, 5.0)])
        .unwrap();
    st.upsert_feature_row(&row("A", 11, 99.0)).unwrap();

    assert_eq!(st.feature_rows().unwrap().len(), 4);
    let latest = st.latest_feature_row("A").unwrap().unwrap();
    assert_eq!(latest.period.to_string(), "2024-11");
    assert_eq!(latest.values.exposure_miles, 99.0);

    let all_latest = st.latest_feature_rows().unwrap();
    assert_eq!(all_latest.len(), 2);
    assert_eq!(all_latest[1].policy_id, "B");
    assert!(st.latest_feature_row("Z").unwrap().is_none());
}

#[test]
fn claims_round_trip() {
    let st = store();
    let claim = Claim {
        claim_id:          "c1".into(),
        policy_id:         "A".into(),
        loss_date:         NaiveDate::from_ymd_opt(2024, 6, 14).unwrap(),
        at_fault:          false,
        paid_severity_usd: 2_345.67,
    };
    st.insert_claim(&claim).unwrap();
    assert_eq!(st.all_claims().unwrap(), vec![claim]);
}

#[test]
fn latest_model_artifact_is_the_last_saved() {
    let st = store();
    assert!(st.latest_model_artifact().unwrap().is_none());

    let first = ModelArtifact::new("constant", feature_names_owned(), ModelParams::Constant { p: 0.1 });
    let second = ModelArtifact::new("constant", feature_names_owned(), ModelParams::Constant { p: 0.2 });
    st.save_model_artifact(&first).unwrap();
    st.save_model_artifact(&second).unwrap();

    assert_eq!(st.latest_model_artifact().unwrap(), Some(second));
}

#[test]
fn labels_are_stored_and_replaced_per_run() {
    let mut st = store();
    st.upsert_feature_rows(&[row("A", 1, 10.0), row("A", 2, 12.0), row("B", 1, 8.0)]).unwrap();
    assert!(st.labeled_rows().unwrap().is_empty());

    let claim = Claim {
        claim_id:          "c1".into(),
        policy_id:         "A".into(),
        loss_date:         NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
        at_fault:          true,
        paid_severity_usd: 900.0,
    };
    let labeled = join(&st.feature_rows().unwrap(), &[claim], 90).unwrap();
    st.replace_labels(&labeled, 90).unwrap();
    assert_eq!(st.labeled_rows().unwrap(), labeled);

    // A later run with no claims overwrites the earlier labels.
    let relabeled = join(&st.feature_rows().unwrap(), &[], 90).unwrap();
    st.replace_labels(&relabeled, 90).unwrap();
    let back = st.labeled_rows().unwrap();
    assert_eq!(back.len(), 3);
    assert!(back.iter().all(|r| r.label == 0));
}
