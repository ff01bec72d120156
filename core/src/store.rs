//! SQLite persistence layer: trip, claim, feature-row and model tables.
//!
//! RULE: Only store.rs talks to the database.
//! Pipeline stages take plain slices; they never execute SQL directly.
//! Reads re-validate ranges, so a bad row in the database surfaces as a
//! ValidationError instead of a quietly wrong feature.

use crate::{
    error::{PipelineError, PipelineResult},
    estimator::ModelArtifact,
    features::{FeatureRow, FeatureValues, LabeledRow},
    label::Claim,
    trip::{StoredTrip, TripRecord},
    types::Period,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

pub struct TelematicsStore {
    conn: Connection,
}

impl TelematicsStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(path)?;
        // WAL mode only matters for real files; a refusal is not fatal.
        if let Err(e) = conn.execute_batch("PRAGMA journal_mode=WAL;") {
            log::warn!("store: WAL mode unavailable for {path}: {e}");
        }
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> PipelineResult<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> PipelineResult<()> {
        self.conn
            .execute_batch(include_str!("../../migrations/001_foundation.sql"))?;
        Ok(())
    }

    // ── Trips ──────────────────────────────────────────────────

    pub fn insert_trip(&self, trip: &StoredTrip) -> PipelineResult<()> {
        insert_trip_on(&self.conn, trip)
    }

    pub fn insert_trips(&mut self, trips: &[StoredTrip]) -> PipelineResult<()> {
        let tx = self.conn.transaction()?;
        for trip in trips {
            insert_trip_on(&tx, trip)?;
        }
        tx.commit()?;
        log::info!("store: inserted {} trips", trips.len());
        Ok(())
    }

    /// Every stored trip, in (policy_id, start_ts) order.
    pub fn all_trips(&self) -> PipelineResult<Vec<StoredTrip>> {
        let mut stmt = self.conn.prepare(
            "SELECT policy_id, trip_id, start_ts, miles, duration_s, harsh_brake_ct,
                    overspeed_ratio, night_ratio, phone_usage_ct, avg_speed_mps
             FROM trip ORDER BY policy_id ASC, start_ts ASC, trip_id ASC",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, DateTime<Utc>>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, f64>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(policy_id, trip_id, start_ts, miles, duration_s, hb, os, night, phone, speed)| {
                let record = TripRecord {
                    miles,
                    duration_s,
                    harsh_brake_ct:  count_field("harsh_brake_ct", hb)?,
                    overspeed_ratio: os,
                    night_ratio:     night,
                    phone_usage_ct:  count_field("phone_usage_ct", phone)?,
                    avg_speed_mps:   speed,
                };
                record.validate()?;
                Ok(StoredTrip { policy_id, trip_id, start_ts, record })
            })
            .collect()
    }

    // ── Claims ─────────────────────────────────────────────────

    pub fn insert_claim(&self, claim: &Claim) -> PipelineResult<()> {
        claim.validate()?;
        self.conn.execute(
            "INSERT INTO claim (claim_id, policy_id, loss_date, at_fault, paid_severity_usd)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                claim.claim_id,
                claim.policy_id,
                claim.loss_date,
                claim.at_fault,
                claim.paid_severity_usd,
            ],
        )?;
        Ok(())
    }

    pub fn all_claims(&self) -> PipelineResult<Vec<Claim>> {
        let mut stmt = self.conn.prepare(
            "SELECT claim_id, policy_id, loss_date, at_fault, paid_severity_usd
             FROM claim ORDER BY policy_id ASC, loss_date ASC, claim_id ASC",
        )?;
        let claims = stmt
            .query_map([], |row| {
                Ok(Claim {
                    claim_id:          row.get(0)?,
                    policy_id:         row.get(1)?,
                    loss_date:         row.get::<_, NaiveDate>(2)?,
                    at_fault:          row.get(3)?,
                    paid_severity_usd: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for claim in &claims {
            claim.validate()?;
        }
        Ok(claims)
    }

    // ── Feature rows ───────────────────────────────────────────

    pub fn upsert_feature_row(&self, row: &FeatureRow) -> PipelineResult<()> {
        upsert_feature_row_on(&self.conn, row)
    }

    pub fn upsert_feature_rows(&mut self, rows: &[FeatureRow]) -> PipelineResult<()> {
        let tx = self.conn.transaction()?;
        for row in rows {
            upsert_feature_row_on(&tx, row)?;
        }
        tx.commit()?;
        log::info!("store: upserted {} feature rows", rows.len());
        Ok(())
    }

    /// Every feature row, in (policy_id, period) order.
    pub fn feature_rows(&self) -> PipelineResult<Vec<FeatureRow>> {
        self.query_feature_rows(
            &format!("{FEATURE_SELECT} ORDER BY policy_id ASC, period ASC"),
            params![],
        )
    }

    /// The most recent period's row for one policy.
    pub fn latest_feature_row(&self, policy_id: &str) -> PipelineResult<Option<FeatureRow>> {
        let rows = self.query_feature_rows(
            &format!("{FEATURE_SELECT} WHERE policy_id = ?1 ORDER BY period DESC LIMIT 1"),
            params![policy_id],
        )?;
        Ok(rows.into_iter().next())
    }

    /// The most recent period's row for every policy.
    pub fn latest_feature_rows(&self) -> PipelineResult<Vec<FeatureRow>> {
        self.query_feature_rows(
            &format!(
                "{FEATURE_SELECT} f WHERE period = (
                    SELECT MAX(period) FROM feature_row g WHERE g.policy_id = f.policy_id
                 ) ORDER BY policy_id ASC"
            ),
            params![],
        )
    }

    fn query_feature_rows<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> PipelineResult<Vec<FeatureRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, values_from_row(row)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(policy_id, period, values)| {
                let period: Period = period
                    .parse()
                    .map_err(|e: String| PipelineError::validation("period", e))?;
                values.validate()?;
                Ok(FeatureRow { policy_id, period, values })
            })
            .collect()
    }

    // ── Labels ─────────────────────────────────────────────────

    /// Replace the stored labels with the output of one label run.
    pub fn replace_labels(&mut self, rows: &[LabeledRow], window_days: i64) -> PipelineResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM label_row", params![])?;
        for r in rows {
            tx.execute(
                "INSERT INTO label_row (policy_id, period, label, window_days)
                 VALUES (?1, ?2, ?3, ?4)",
                params![r.row.policy_id, r.row.period.to_string(), r.label, window_days],
            )?;
        }
        tx.commit()?;
        log::info!("store: stored {} labels (window={window_days}d)", rows.len());
        Ok(())
    }

    /// Stored labels joined back onto their feature rows, in
    /// (policy_id, period) order.
    pub fn labeled_rows(&self) -> PipelineResult<Vec<LabeledRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.policy_id, f.period, f.exposure_miles, f.trip_ct,
                    f.harsh_brake_per_100mi, f.duration_s, f.avg_overspeed_ratio,
                    f.night_miles_ratio, f.phone_usage_per_hr, f.mean_speed_mps,
                    f.miles_per_trip, f.speed_var_across_trips, l.label
             FROM feature_row f
             JOIN label_row l ON l.policy_id = f.policy_id AND l.period = f.period
             ORDER BY f.policy_id ASC, f.period ASC",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    values_from_row(row)?,
                    row.get::<_, u8>(12)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(policy_id, period, values, label)| {
                let period: Period = period
                    .parse()
                    .map_err(|e: String| PipelineError::validation("period", e))?;
                values.validate()?;
                Ok(LabeledRow {
                    group_id: Some(policy_id.clone()),
                    row:      FeatureRow { policy_id, period, values },
                    label,
                })
            })
            .collect()
    }

    // ── Model artifacts ────────────────────────────────────────

    pub fn save_model_artifact(&self, artifact: &ModelArtifact) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO model_artifact (model_id, trained_at, estimator, artifact_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                artifact.model_id,
                artifact.trained_at,
                artifact.estimator,
                serde_json::to_string(artifact)?,
            ],
        )?;
        Ok(())
    }

    pub fn latest_model_artifact(&self) -> PipelineResult<Option<ModelArtifact>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT artifact_json FROM model_artifact ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str::<ModelArtifact>(&j).map_err(PipelineError::from))
            .transpose()
    }
}

fn insert_trip_on(conn: &Connection, trip: &StoredTrip) -> PipelineResult<()> {
    trip.record.validate()?;
    let r = &trip.record;
    conn.execute(
        "INSERT INTO trip (
            policy_id, trip_id, start_ts, miles, duration_s, harsh_brake_ct,
            overspeed_ratio, night_ratio, phone_usage_ct, avg_speed_mps
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            trip.policy_id,
            trip.trip_id,
            trip.start_ts,
            r.miles,
            r.duration_s,
            r.harsh_brake_ct,
            r.overspeed_ratio,
            r.night_ratio,
            r.phone_usage_ct,
            r.avg_speed_mps,
        ],
    )?;
    Ok(())
}

fn upsert_feature_row_on(conn: &Connection, row: &FeatureRow) -> PipelineResult<()> {
    row.values.validate()?;
    let v = &row.values;
    conn.execute(
        "INSERT INTO feature_row (
            policy_id, period, exposure_miles, trip_ct, harsh_brake_per_100mi,
            duration_s, avg_overspeed_ratio, night_miles_ratio, phone_usage_per_hr,
            mean_speed_mps, miles_per_trip, speed_var_across_trips
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(policy_id, period) DO UPDATE SET
            exposure_miles         = excluded.exposure_miles,
            trip_ct                = excluded.trip_ct,
            harsh_brake_per_100mi  = excluded.harsh_brake_per_100mi,
            duration_s             = excluded.duration_s,
            avg_overspeed_ratio    = excluded.avg_overspeed_ratio,
            night_miles_ratio      = excluded.night_miles_ratio,
            phone_usage_per_hr     = excluded.phone_usage_per_hr,
            mean_speed_mps         = excluded.mean_speed_mps,
            miles_per_trip         = excluded.miles_per_trip,
            speed_var_across_trips = excluded.speed_var_across_trips",
        params![
            row.policy_id,
            row.period.to_string(),
            v.exposure_miles,
            v.trip_ct,
            v.harsh_brake_per_100mi,
            v.duration_s,
            v.avg_overspeed_ratio,
            v.night_miles_ratio,
            v.phone_usage_per_hr,
            v.mean_speed_mps,
            v.miles_per_trip,
            v.speed_var_across_trips,
        ],
    )?;
    Ok(())
}

const FEATURE_SELECT: &str = "SELECT policy_id, period, exposure_miles, trip_ct,
    harsh_brake_per_100mi, duration_s, avg_overspeed_ratio, night_miles_ratio,
    phone_usage_per_hr, mean_speed_mps, miles_per_trip, speed_var_across_trips
    FROM feature_row";

fn values_from_row(row: &Row<'_>) -> rusqlite::Result<FeatureValues> {
    Ok(FeatureValues {
        exposure_miles:         row.get(2)?,
        trip_ct:                row.get(3)?,
        harsh_brake_per_100mi:  row.get(4)?,
        duration_s:             row.get(5)?,
        avg_overspeed_ratio:    row.get(6)?,
        night_miles_ratio:      row.get(7)?,
        phone_usage_per_hr:     row.get(8)?,
        mean_speed_mps:         row.get(9)?,
        miles_per_trip:         row.get(10)?,
        speed_var_across_trips: row.get(11)?,
    })
}

fn count_field(field: &str, v: i64) -> PipelineResult<u32> {
    u32::try_from(v)
        .map_err(|_| PipelineError::validation(field, format!("{v} must be a non-negative count")))
}
