//! pricing-runner: headless driver for the telematics pricing pipeline.
//!
//! Usage:
//!   pricing-runner synth          --db run.db --seed 42 --policies 50 --months 6
//!   pricing-runner build-features --db run.db
//!   pricing-runner label          --db run.db
//!   pricing-runner train          --db run.db --model models/behavior_model.json
//!   pricing-runner price          --db run.db --model models/behavior_model.json --policy P00001
//!   pricing-runner preview        --db run.db --model models/behavior_model.json
//!   pricing-runner serve          --db run.db --model models/behavior_model.json
//!
//! Every command accepts --config <file.json>; pricing parameters can
//! also come from BASELINE_PREV, PRICING_SLOPE, FACTOR_MIN, FACTOR_MAX.

mod synth;

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::env;
use std::io::{self, BufRead, Write};
use std::path::Path;
use telematics_core::{
    aggregator::aggregate_partitions,
    config::PipelineConfig,
    error::PipelineError,
    features::LabeledRow,
    label,
    serving::{pricing_preview, ScoringService},
    store::TelematicsStore,
    training,
    trip::TripRecord,
};

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcRequest {
    Health,
    Score {
        policy_id: String,
        #[serde(default)]
        features:  BTreeMap<String, f64>,
    },
    ScoreTrips {
        policy_id: String,
        trips:     Vec<TripRecord>,
    },
    Price {
        policy_id: String,
    },
    Reload,
    Quit,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");
    let db = string_arg(&args, "--db", "telematics.db");
    let model_path = string_arg(&args, "--model", "models/behavior_model.json");

    let mut config = match args.windows(2).find(|w| w[0] == "--config") {
        Some(w) => PipelineConfig::load(&w[1])?,
        None => PipelineConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;

    let mut store = TelematicsStore::open(&db)?;
    store.migrate()?;

    match command {
        "synth" => run_synth(&mut store, &args),
        "build-features" => {
            let trips = store.all_trips()?;
            let rows = aggregate_partitions(&trips, config.batch_policy)?;
            store.upsert_feature_rows(&rows)?;
            println!("Wrote {} feature rows from {} trips -> {db}", rows.len(), trips.len());
            Ok(())
        }
        "label" => {
            let labeled = run_label(&mut store, &config)?;
            let positives = labeled.iter().filter(|r| r.label == 1).count();
            println!("Labelled {} rows, {positives} positive -> {db}", labeled.len());
            Ok(())
        }
        "train" => run_train(&mut store, &config, &model_path),
        "price" => {
            let policy_id = string_arg(&args, "--policy", "");
            if policy_id.is_empty() {
                bail!("price requires --policy <id>");
            }
            let service = build_service(&config, &model_path)?;
            let quote = service.price_policy(&store, &policy_id)?;
            println!("{}", serde_json::to_string_pretty(&quote)?);
            Ok(())
        }
        "preview" => {
            let service = build_service(&config, &model_path)?;
            for q in pricing_preview(&store, &service)? {
                println!(
                    "  {} | {} | risk_p: {:.4} | factor: {:.4}",
                    q.policy_id,
                    q.period.map(|p| p.to_string()).unwrap_or_default(),
                    q.price.p,
                    q.price.factor
                );
            }
            Ok(())
        }
        "serve" => {
            let service = ScoringService::new(config.pricing)?;
            // A missing or stale model is not fatal: requests answer model_unavailable.
            if let Err(e) = service.model().load_from_file(Path::new(&model_path)) {
                log::warn!("serve: starting without a model: {e}");
            }
            run_ipc_loop(&service, &store, &model_path)
        }
        _ => {
            println!("usage: pricing-runner <synth|build-features|label|train|price|preview|serve> [--db file] [--model file] [--config file]");
            Ok(())
        }
    }
}

fn run_synth(store: &mut TelematicsStore, args: &[String]) -> Result<()> {
    let defaults = synth::SynthOptions::default();
    let opts = synth::SynthOptions {
        seed:     parse_arg(args, "--seed", defaults.seed),
        policies: parse_arg(args, "--policies", defaults.policies),
        months:   parse_arg(args, "--months", defaults.months),
        ..defaults
    };

    let trips = synth::generate_trips(&opts);
    store.insert_trips(&trips)?;

    let rows = aggregate_partitions(&trips, Default::default())?;
    let claims = synth::generate_claims(&rows, &opts);
    for claim in &claims {
        store.insert_claim(claim)?;
    }

    println!("Synthetic data (seed {})", opts.seed);
    println!("  policies: {}", opts.policies);
    println!("  trips:    {}", trips.len());
    println!("  claims:   {}", claims.len());
    Ok(())
}

/// Join current feature rows with claims and store the labels.
fn run_label(store: &mut TelematicsStore, config: &PipelineConfig) -> Result<Vec<LabeledRow>> {
    let labeled = label::join(&store.feature_rows()?, &store.all_claims()?, config.label_window_days)?;
    store.replace_labels(&labeled, config.label_window_days)?;
    Ok(labeled)
}

fn run_train(store: &mut TelematicsStore, config: &PipelineConfig, model_path: &str) -> Result<()> {
    // Relabel so training never sees labels older than the feature rows.
    let labeled = run_label(store, config)?;
    let report = training::train(&labeled, &config.training.logistic, &config.training)?;

    report.artifact.save(Path::new(model_path))?;
    store.save_model_artifact(&report.artifact)?;

    println!("=== TRAINING SUMMARY ===");
    println!("  model_id:   {}", report.artifact.model_id);
    println!("  estimator:  {}", report.artifact.estimator);
    println!("  train rows: {}", report.train_rows);
    println!("  test rows:  {}", report.test_rows);
    if report.degenerate {
        println!("  WARNING: degenerate training set, constant model saved");
    }
    match &report.holdout {
        Some(m) => {
            println!("  AUROC:      {}", fmt_opt(m.auroc));
            println!("  AUPRC:      {}", fmt_opt(m.average_precision));
            println!("  Brier:      {:.4}", m.brier);
            println!("  LogLoss:    {:.4}", m.log_loss);
        }
        None => println!("  (no holdout fold)"),
    }
    println!("  saved:      {model_path}");
    Ok(())
}

fn build_service(config: &PipelineConfig, model_path: &str) -> Result<ScoringService> {
    let service = ScoringService::new(config.pricing)?;
    service.model().load_from_file(Path::new(model_path))?;
    Ok(service)
}

fn run_ipc_loop(service: &ScoringService, store: &TelematicsStore, model_path: &str) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let request: IpcRequest = match serde_json::from_str(&buffer) {
            Ok(r) => r,
            Err(e) => {
                let err_json = serde_json::json!({ "error": "bad_request", "message": e.to_string() });
                writeln!(stdout, "{err_json}")?;
                stdout.flush()?;
                continue;
            }
        };

        let response = match request {
            IpcRequest::Quit => break,
            IpcRequest::Health => to_value(Ok(service.health())),
            IpcRequest::Score { policy_id, features } => {
                to_value(service.score_request(&policy_id, &features))
            }
            IpcRequest::ScoreTrips { policy_id, trips } => {
                to_value(service.score_trips(&policy_id, &trips))
            }
            IpcRequest::Price { policy_id } => to_value(service.price_policy(store, &policy_id)),
            IpcRequest::Reload => to_value(
                service
                    .model()
                    .load_from_file(Path::new(model_path))
                    .map(|_| service.health()),
            ),
        };
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn to_value<T: serde::Serialize>(result: Result<T, PipelineError>) -> serde_json::Value {
    match result.map(serde_json::to_value) {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => serde_json::json!({ "error": "serialization", "message": e.to_string() }),
        Err(e) => serde_json::json!({ "error": e.kind(), "message": e.to_string() }),
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.4}")).unwrap_or_else(|| "n/a".into())
}

fn string_arg(args: &[String], flag: &str, default: &str) -> String {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
        .unwrap_or_else(|| default.to_string())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
