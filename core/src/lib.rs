//! Telematics risk pricing core.
//!
//! Raw trips -> aggregator -> feature rows
//!   training: + label join -> estimator fit -> model artifact
//!   serving:  -> model snapshot predict -> pricing mapper -> factor

pub mod aggregator;
pub mod config;
pub mod error;
pub mod estimator;
pub mod features;
pub mod label;
pub mod logistic;
pub mod pricing;
pub mod rng;
pub mod serving;
pub mod store;
pub mod training;
pub mod trip;
pub mod types;
