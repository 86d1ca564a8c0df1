//! Instrument drivers.
//!
//! Everything that talks SCPI goes through a [`ScpiExecutor`], which turns a
//! raw [`crate::adapters::InstrumentSession`] into blocking, OPC-synchronized
//! command execution. The generator and power-sensor drivers are thin layers
//! over it.

pub mod executor;
pub mod generator;
pub mod power_sensor;

pub use executor::{parse_reading, ScpiExecutor};
pub use generator::Generator;
pub use power_sensor::{PowerSensor, ScpiPowerSensor};
