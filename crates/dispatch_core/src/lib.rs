pub mod clock;
pub mod config;
pub mod error;
pub mod geo;
pub mod hub;
pub mod idempotency;
pub mod journal;
pub mod matching;
pub mod persistence;
pub mod service;
pub mod spatial;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod watchdog;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
