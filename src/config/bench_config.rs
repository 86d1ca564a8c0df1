//! Bench configuration using Figment
//!
//! Configuration is loaded from:
//! 1. Built-in defaults (`BenchConfig::default()`)
//! 2. A TOML file (default: `config/bench.toml`), if it exists
//! 3. Environment variables prefixed with `DPD_BENCH_`
//!
//! A missing file is not an error: the bench then runs on the built-in defaults
//! (external servo on, internal servo off, full-frame setup).
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DPD_BENCH_SERVO__USE_INTERNAL=true
//! DPD_BENCH_ANALYZER__HOST=192.168.200.21
//! DPD_BENCH_SYNC__POLL_INTERVAL_MS=100
//! ```

use crate::error::{AppResult, BenchError};
use crate::measurement::servo::ServoDefaults;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the bench configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/bench.toml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "DPD_BENCH_";

/// Top-level bench configuration.
///
/// Constructed once at process start and shared read-only (usually behind an
/// `Arc`) with everything that needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Process-wide servo defaults and internal servo parameters
    pub servo: ServoSettings,
    /// Analyzer setup files and generator waveform
    pub setup: SetupConfig,
    /// Signal analyzer connection
    pub analyzer: EndpointConfig,
    /// Signal generator connection
    pub generator: EndpointConfig,
    /// External power sensor connection
    pub power_sensor: EndpointConfig,
    /// Operation-complete polling
    pub sync: SyncConfig,
    /// DPD tuning parameters
    pub dpd: DpdConfig,
    /// Sensor-driven external regulator
    pub regulator: RegulatorConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            servo: ServoSettings::default(),
            setup: SetupConfig::default(),
            analyzer: EndpointConfig::at("192.168.200.20"),
            generator: EndpointConfig::at("192.168.200.10"),
            power_sensor: EndpointConfig::at("192.168.200.30"),
            sync: SyncConfig::default(),
            dpd: DpdConfig::default(),
            regulator: RegulatorConfig::default(),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Servo defaults and analyzer servo parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoSettings {
    /// Run the external (sensor) servo unless a call overrides it
    pub use_external: bool,
    /// Run the analyzer's internal servo unless a call overrides it
    pub use_internal: bool,
    /// Iteration limit handed to the servo
    pub max_iterations: u32,
    /// Target tolerance in dB; `None` leaves the instrument default
    pub tolerance_db: Option<f64>,
    /// Query returning the iteration count the analyzer servo actually used
    pub iteration_query: Option<String>,
}

impl Default for ServoSettings {
    fn default() -> Self {
        Self {
            use_external: true,
            use_internal: false,
            max_iterations: 10,
            tolerance_db: Some(0.1),
            iteration_query: None,
        }
    }
}

/// Which analyzer setup file to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SetupMode {
    /// Measure over the whole NR frame
    #[default]
    FullFrame,
    /// Measure over the first slot only
    FirstSlot,
}

/// Setup files recalled on the instruments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// Measurement-frame preset
    pub mode: SetupMode,
    /// Analyzer state file for `SetupMode::FullFrame`
    pub full_frame_file: String,
    /// Analyzer state file for `SetupMode::FirstSlot`
    pub first_slot_file: String,
    /// Generator waveform setup recalled at generator setup
    pub generator_waveform: String,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            mode: SetupMode::FullFrame,
            full_frame_file: r"C:\R_S\instr\user\5GNR_UL_10MHz_256QAM_30kHz_24RB_0RBO_fullframe"
                .to_string(),
            first_slot_file: r"C:\R_S\instr\user\5GNR_UL_10MHz_256QAM_30kHz_24RB_0RBO_1slot"
                .to_string(),
            generator_waveform: "/var/user/NR5G_10MHz_UL_30kHzSCS_24QAM_24rb_0rbo.savrcltxt"
                .to_string(),
        }
    }
}

impl SetupConfig {
    /// The analyzer state file for the configured mode.
    pub fn analyzer_file(&self) -> &str {
        match self.mode {
            SetupMode::FullFrame => &self.full_frame_file,
            SetupMode::FirstSlot => &self.first_slot_file,
        }
    }
}

/// Raw SCPI socket endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Host name or IP address
    pub host: String,
    /// SCPI raw socket port
    pub port: u16,
    /// Socket read/write timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "192.168.200.20".to_string(),
            port: 5025,
            timeout_ms: 5000,
        }
    }
}

impl EndpointConfig {
    /// Default port and timeout at the given host.
    pub fn at(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Self::default()
        }
    }

    /// Socket timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Operation-complete polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sleep between `*ESR?` polls
    pub poll_interval_ms: u64,
    /// Upper bound on a single synchronized command
    pub max_wait_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            max_wait_ms: 600_000,
        }
    }
}

impl SyncConfig {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Maximum wait as a `Duration`.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// DPD tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DpdConfig {
    /// Trade-off for single polynomial DPD
    pub single_trade_off: u32,
    /// Trade-off for direct (iterative) DPD
    pub iterative_trade_off: u32,
    /// GMP lag cross-term order
    pub gmp_lag_order: u32,
    /// GMP lead cross-term order
    pub gmp_lead_order: u32,
    /// GMP model iterations
    pub gmp_model_iterations: u32,
}

impl Default for DpdConfig {
    fn default() -> Self {
        Self {
            single_trade_off: 10,
            iterative_trade_off: 100,
            gmp_lag_order: 1,
            gmp_lead_order: 1,
            gmp_model_iterations: 5,
        }
    }
}

/// Sensor-driven external regulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulatorConfig {
    /// Lowest generator level the loop may command
    pub min_level_dbm: f64,
    /// Highest generator level the loop may command
    pub max_level_dbm: f64,
    /// Convergence tolerance in dB
    pub tolerance_db: f64,
    /// Iteration limit
    pub max_iterations: u32,
    /// Wait after each level change before reading the sensor
    pub settle_ms: u64,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            min_level_dbm: -60.0,
            max_level_dbm: 10.0,
            tolerance_db: 0.05,
            max_iterations: 10,
            settle_ms: 50,
        }
    }
}

impl BenchConfig {
    /// Load configuration from `config/bench.toml` and environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file cannot be parsed or validation fails.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// Precedence (highest first): environment, file, built-in defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack used by [`BenchConfig::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    ///
    /// # Errors
    ///
    /// Returns `BenchError::Configuration` with a descriptive message for the
    /// first violation found.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(BenchError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (name, endpoint) in [
            ("analyzer", &self.analyzer),
            ("generator", &self.generator),
            ("power_sensor", &self.power_sensor),
        ] {
            if endpoint.host.trim().is_empty() {
                return Err(BenchError::Configuration(format!(
                    "{name}: 'host' cannot be empty"
                )));
            }
            if endpoint.port == 0 {
                return Err(BenchError::Configuration(format!(
                    "{name}: 'port' must be > 0"
                )));
            }
        }

        if self.sync.poll_interval_ms == 0 {
            return Err(BenchError::Configuration(
                "sync: 'poll_interval_ms' must be > 0".to_string(),
            ));
        }
        if self.sync.max_wait_ms < self.sync.poll_interval_ms {
            return Err(BenchError::Configuration(format!(
                "sync: 'max_wait_ms' ({}) must be >= 'poll_interval_ms' ({})",
                self.sync.max_wait_ms, self.sync.poll_interval_ms
            )));
        }

        if self.servo.max_iterations == 0 {
            return Err(BenchError::Configuration(
                "servo: 'max_iterations' must be >= 1".to_string(),
            ));
        }
        if self.servo.tolerance_db.is_some_and(|tol| tol < 0.0) {
            return Err(BenchError::Configuration(
                "servo: 'tolerance_db' cannot be negative".to_string(),
            ));
        }

        if self.regulator.min_level_dbm >= self.regulator.max_level_dbm {
            return Err(BenchError::Configuration(format!(
                "regulator: 'min_level_dbm' ({}) must be below 'max_level_dbm' ({})",
                self.regulator.min_level_dbm, self.regulator.max_level_dbm
            )));
        }
        if self.regulator.tolerance_db < 0.0 {
            return Err(BenchError::Configuration(
                "regulator: 'tolerance_db' cannot be negative".to_string(),
            ));
        }
        if self.regulator.max_iterations == 0 {
            return Err(BenchError::Configuration(
                "regulator: 'max_iterations' must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Process-wide servo defaults.
    pub fn servo_defaults(&self) -> ServoDefaults {
        ServoDefaults {
            use_external: self.servo.use_external,
            use_internal: self.servo.use_internal,
        }
    }
}
