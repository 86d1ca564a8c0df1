//! # DPD Bench
//!
//! Orchestration for power-amplifier characterization on a SCPI bench: a vector
//! signal generator drives the amplifier, a vector signal analyzer captures EVM
//! and ACLR, and an optional power sensor closes an external output-power loop.
//!
//! ## Architecture
//!
//! - **`adapters`**: Byte-level instrument sessions (`InstrumentSession`) over TCP,
//!   plus an in-memory mock for tests.
//! - **`instrument`**: The OPC-synchronized [`instrument::ScpiExecutor`] and the
//!   generator and power-sensor drivers built on it.
//! - **`measurement`**: Servo procedures and the four measurement phases (baseline,
//!   single-shot DPD, iterative direct DPD, GMP model DPD).
//! - **`bench`**: The [`bench::Bench`] orchestrator owning the analyzer session and
//!   the optional external regulator.
//! - **`config`**: Figment-based configuration loading.
//! - **`error`**: The crate-wide [`error::BenchError`] type.
//!
//! All instrument I/O is blocking. A bench session is driven by a single thread
//! and every phase runs to completion before the next one starts.

pub mod adapters;
pub mod bench;
pub mod config;
pub mod error;
pub mod instrument;
pub mod measurement;

pub use bench::Bench;
pub use error::{AppResult, BenchError};
