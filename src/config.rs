//! Runtime configuration of the furnace controller.
//!
//! Everything here has a compile-time default in the crate root. The values
//! that the supervisor may change at runtime live in registers instead.

use crate::{
    CONNECTION_TIMEOUT_MS, INVERT_OUTPUT_SIGNAL, POWER_OUTPUT_BITS, POWER_OUTPUT_SCALE,
    SETPOINT_DEFAULT, SETPOINT_LOWER_LIMIT, SETPOINT_UPPER_LIMIT, TERM_KD_DEFAULT,
    TERM_KI_DEFAULT, TERM_KP_DEFAULT, TICK_FREQUENCY_HZ,
};

/// Gains of one PID controller, in per-second units.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tunings {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Tunings {
    pub const fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self { kp, ki, kd }
    }
}

impl Default for Tunings {
    fn default() -> Self {
        Self::new(TERM_KP_DEFAULT, TERM_KI_DEFAULT, TERM_KD_DEFAULT)
    }
}

/// Output stage description shared by both heaters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OutputStage {
    /// Full-scale value accepted by the output hardware
    pub bits: u16,
    /// Fraction of full scale the PID may reach (0.0 - 1.0)
    pub scale: f32,
    /// Output circuit is active-low
    pub invert: bool,
}

impl OutputStage {
    /// Map a PID output (0 - `limit`) onto the hardware range.
    pub fn scale_pid_output(&self, output: f32, limit: f32) -> u16 {
        let out = self.bits as f32 * (output / limit) * self.scale;
        self.polarity(out)
    }

    /// Map an override percentage onto the hardware range. The power scale is not applied.
    pub fn scale_override(&self, percent: f32) -> u16 {
        let out = self.bits as f32 * (percent / 100.0);
        self.polarity(out)
    }

    /// PWM counter wrap for this stage. Duty is `compare / (top + 1)`, so a
    /// full-scale command holds the pin high for the whole period.
    pub fn pwm_top(&self) -> u16 {
        self.bits.saturating_sub(1)
    }

    /// Value that leaves the heater unpowered.
    pub fn disabled_value(&self) -> u16 {
        self.polarity(0.0)
    }

    fn polarity(&self, out: f32) -> u16 {
        let out = out.clamp(0.0, self.bits as f32);
        let out = if self.invert { self.bits as f32 - out } else { out };
        out as u16
    }
}

impl Default for OutputStage {
    fn default() -> Self {
        Self {
            bits: POWER_OUTPUT_BITS,
            scale: POWER_OUTPUT_SCALE,
            invert: INVERT_OUTPUT_SIGNAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FurnaceConfig {
    pub output: OutputStage,
    pub tunings: Tunings,
    pub setpoint: f32,
    /// Tick frequency written to the frequency register at startup
    pub tick_frequency_hz: f32,
    pub setpoint_upper_limit: f32,
    pub setpoint_lower_limit: f32,
    pub connection_timeout_ms: u64,
}

impl Default for FurnaceConfig {
    fn default() -> Self {
        Self {
            output: OutputStage::default(),
            tunings: Tunings::default(),
            setpoint: SETPOINT_DEFAULT,
            tick_frequency_hz: TICK_FREQUENCY_HZ,
            setpoint_upper_limit: SETPOINT_UPPER_LIMIT,
            setpoint_lower_limit: SETPOINT_LOWER_LIMIT,
            connection_timeout_ms: CONNECTION_TIMEOUT_MS,
        }
    }
}
