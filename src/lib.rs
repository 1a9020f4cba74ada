#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod control;
pub mod coordination;
pub mod pid;
pub mod registers;
pub mod sensor;
pub mod supervisor;
pub mod telemetry;
pub mod tick;
pub mod zone;

#[cfg(feature = "defmt")]
pub(crate) use defmt as log;

#[cfg(not(feature = "defmt"))]
pub(crate) use ::log;

pub use config::FurnaceConfig;
pub use control::{Furnace, PowerOutputs, TemperatureInputs};
pub use registers::{RegisterBank, RegisterError, RegisterStore};
pub use tick::TickFlag;
pub use zone::Zone;

pub const VERSION: &str = "v0.1.0";

pub const SETPOINT_DEFAULT: f32 = 25.5; // Both zones start here until the supervisor writes a setpoint
pub const TERM_KP_DEFAULT: f32 = 25.5; // Proportional term
pub const TERM_KI_DEFAULT: f32 = 5.0; // Integral term, per second
pub const TERM_KD_DEFAULT: f32 = 0.1; // Derivative term, seconds

pub const PID_OUTPUT_LIMIT: f32 = 100.0; // PID output is a percentage of full power
pub const POWER_OUTPUT_BITS: u16 = 4095; // 12-bit output stage (0-10V)
pub const POWER_OUTPUT_SCALE: f32 = 0.8; // Cap the heaters at 80% of the output stage
pub const INVERT_OUTPUT_SIGNAL: bool = false; // Active-low output circuitry

pub const TICK_FREQUENCY_HZ: f32 = 50.0; // Control ticks per second
pub const CONNECTION_TIMEOUT_MS: u64 = 30_000; // Heaters are disabled after this long without a client
pub const SUPERVISOR_POLL_MS: u64 = 5; // Supervisory loop period

pub const SETPOINT_UPPER_LIMIT: f32 = 1500.0; // Ramp stops here when heating
pub const SETPOINT_LOWER_LIMIT: f32 = 0.0; // Ramp stops here when cooling

pub const ACQUISITION_CAPACITY: usize = 256; // Telemetry samples held for the stream client
pub const THERMOCOUPLE_COUNT: usize = 4; // Two heater thermocouples plus two extra
