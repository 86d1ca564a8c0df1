//! Bench configuration
//!
//! Configuration management using Figment. The loaded [`BenchConfig`] is the
//! single process-wide value object: it is built once at startup, validated,
//! and then passed by reference (or `Arc`) into the orchestrator.
//!
//! # Configuration Sources
//!
//! In order of precedence:
//! 1. Environment variables prefixed with `DPD_BENCH_`
//! 2. TOML configuration file (default: `config/bench.toml`)
//! 3. Built-in defaults
//!
//! # Example
//!
//! ```no_run
//! use dpd_bench::config::BenchConfig;
//!
//! let config = BenchConfig::load_from("config/bench.toml")?;
//! println!("External servo by default: {}", config.servo.use_external);
//! # Ok::<(), dpd_bench::error::BenchError>(())
//! ```

pub mod bench_config;

pub use bench_config::{
    ApplicationConfig, BenchConfig, DpdConfig, EndpointConfig, RegulatorConfig, ServoSettings,
    SetupConfig, SetupMode, SyncConfig, DEFAULT_CONFIG_PATH, ENV_PREFIX,
};
