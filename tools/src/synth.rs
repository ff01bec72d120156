//! Synthetic demo data: trips per (policy, month) and claims linked to
//! the aggregated risk features. Deterministic for a given seed.

use chrono::{Duration, NaiveTime, TimeZone, Utc};
use telematics_core::{
    features::FeatureRow,
    label::Claim,
    logistic::sigmoid,
    rng::{RngStream, SeededRng},
    trip::{StoredTrip, TripRecord},
    types::Period,
};

const METERS_PER_MILE: f64 = 1609.34;

// Claim link weights on harsh braking, overspeed and night exposure.
const W_HARSH_BRAKE: f64 = 0.025;
const W_OVERSPEED: f64 = 4.0;
const W_NIGHT: f64 = 2.5;

#[derive(Debug, Clone)]
pub struct SynthOptions {
    pub seed:            u64,
    pub policies:        usize,
    pub months:          usize,
    pub first_period:    Period,
    pub trips_per_month: f64,
    pub target_prev:     f64,
    pub claim_cap:       f64,
    pub min_claims:      usize,
}

impl Default for SynthOptions {
    fn default() -> Self {
        Self {
            seed:            42,
            policies:        50,
            months:          6,
            first_period:    Period::new(2024, 1).unwrap_or_else(|| Period::containing(Utc::now().date_naive())),
            trips_per_month: 20.0,
            target_prev:     0.30,
            claim_cap:       0.95,
            min_claims:      30,
        }
    }
}

struct DriverProfile {
    base_speed:   f64,
    aggression:   f64,
    night_pref:   f64,
    phone_per_hr: f64,
}

pub fn generate_trips(opts: &SynthOptions) -> Vec<StoredTrip> {
    let mut rng = SeededRng::new(opts.seed, RngStream::Trips);
    let mut trips = Vec::new();

    for p in 0..opts.policies {
        let policy_id = format!("P{p:05}");
        let profile = DriverProfile {
            base_speed:   rng.uniform(9.0, 26.0),
            aggression:   rng.next_f64(),
            night_pref:   rng.uniform(0.0, 0.4),
            phone_per_hr: rng.uniform(0.0, 2.5),
        };

        let mut period = opts.first_period;
        for _ in 0..opts.months {
            let days_in_month = (period.end() - period.start()).num_days() + 1;
            let n_trips = rng.poisson(opts.trips_per_month);
            for t in 0..n_trips {
                let day = rng.next_u64_below(days_in_month as u64) as i64;
                let second = rng.next_u64_below(86_400) as i64;
                let start = period.start().and_time(NaiveTime::MIN) + Duration::days(day) + Duration::seconds(second);

                let duration_s = rng.uniform(5.0, 60.0).round() * 60.0;
                let speed = rng.normal(profile.base_speed, 2.0).max(1.0);
                let miles = speed * duration_s / METERS_PER_MILE;
                let night_ratio = if rng.chance(profile.night_pref) { rng.uniform(0.3, 1.0) } else { 0.0 };

                trips.push(StoredTrip {
                    policy_id: policy_id.clone(),
                    trip_id:   format!("{policy_id}-{period}-{t:03}"),
                    start_ts:  Utc.from_utc_datetime(&start),
                    record: TripRecord {
                        miles,
                        duration_s,
                        harsh_brake_ct:  rng.poisson(profile.aggression * miles / 10.0),
                        overspeed_ratio: (profile.aggression * 0.3 + rng.normal(0.0, 0.05)).clamp(0.0, 1.0),
                        night_ratio,
                        phone_usage_ct:  rng.poisson(profile.phone_per_hr * duration_s / 3600.0),
                        avg_speed_mps:   speed,
                    },
                });
            }
            period = period.next();
        }
    }
    trips
}

/// Claims whose probability rises with harsh braking, overspeed and
/// night exposure; intercept set so the mean probability is the target
/// prevalence. Loss dates fall in the 90 days after each period.
pub fn generate_claims(rows: &[FeatureRow], opts: &SynthOptions) -> Vec<Claim> {
    if rows.is_empty() {
        return Vec::new();
    }
    let mut rng = SeededRng::new(opts.seed, RngStream::Claims);

    let risk: Vec<f64> = rows
        .iter()
        .map(|r| {
            W_HARSH_BRAKE * r.values.harsh_brake_per_100mi
                + W_OVERSPEED * r.values.avg_overspeed_ratio
                + W_NIGHT * r.values.night_miles_ratio
        })
        .collect();
    let target = opts.target_prev.clamp(0.05, 0.9);
    let mean_risk = risk.iter().sum::<f64>() / risk.len() as f64;
    let intercept = (target / (1.0 - target)).ln() - mean_risk;

    let mut claims = Vec::new();
    let mut claimed = vec![false; rows.len()];
    for (i, (row, r)) in rows.iter().zip(&risk).enumerate() {
        let p = sigmoid(intercept + r).clamp(0.001, opts.claim_cap);
        if rng.chance(p) {
            claims.push(make_claim(row, claims.len(), &mut rng));
            claimed[i] = true;
        }
    }

    // Guarantee a learnable number of positives: top-risk rows first.
    if claims.len() < opts.min_claims {
        let mut order: Vec<usize> = (0..rows.len()).filter(|&i| !claimed[i]).collect();
        order.sort_by(|&a, &b| risk[b].total_cmp(&risk[a]));
        for i in order.into_iter().take(opts.min_claims - claims.len()) {
            claims.push(make_claim(&rows[i], claims.len(), &mut rng));
        }
    }
    claims
}

fn make_claim(row: &FeatureRow, n: usize, rng: &mut SeededRng) -> Claim {
    let offset = 1 + rng.next_u64_below(90) as i64;
    Claim {
        claim_id:          format!("C{n:06}"),
        policy_id:         row.policy_id.clone(),
        loss_date:         row.period.end() + Duration::days(offset),
        at_fault:          true,
        paid_severity_usd: rng.normal(8.3, 0.75).exp(),
    }
}
