//! # Rust Logwatch Core Library
//!
//! A small streaming pipeline that watches many independent log sources and flags
//! the ones that look stuck. Sources emit `name:value` lines; the pipeline parses
//! them, keeps the last [`core::WINDOW_CAPACITY`] values per source, and reports a
//! source whose whole window holds one repeated value.
//!
//! ## Crate Structure
//!
//! - **`core`**: Records, window snapshots, anomaly reports and stage counters.
//! - **`parser`**: Validates raw lines against the `name:value` grammar.
//! - **`aggregator`**: Per-key bounded history; emits a snapshot for every full window.
//! - **`resolver`**: Flags snapshots whose values are all equal.
//! - **`emitter`**: Seeded synthetic log sources.
//! - **`pipeline`**: Tokio tasks and channels wiring the stages together, timed and
//!   sentinel-driven runs.
//! - **`shutdown`**: Cooperative cancellation shared by every task.
//! - **`config`**: Figment-based configuration (TOML file + environment).
//! - **`tracing_setup`**: Subscriber initialisation.
//! - **`error`**: `ParseError` and `PipelineError`.

pub mod aggregator;
pub mod config;
pub mod core;
pub mod emitter;
pub mod error;
pub mod parser;
pub mod pipeline;
pub mod resolver;
pub mod shutdown;
pub mod tracing_setup;
