//! Per-zone control loop: one PID engine plus the setpoint state layered on it.

use crate::config::{FurnaceConfig, Tunings};
use crate::log::info;
use crate::pid::{Pid, PidTerms};
use crate::registers::*;
use crate::PID_OUTPUT_LIMIT;

/// One of the two heater zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Zone {
    /// Upper heater
    A,
    /// Lower heater
    B,
}

/// Register and pin locations for one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneAddresses {
    pub output_pin: u8,
    pub set_point_hold: u16,
    pub kp_hold: u16,
    pub ki_hold: u16,
    pub kd_hold: u16,
    pub enable_coil: u16,
    pub override_coil: u16,
    pub override_hold: u16,
    pub sensor_index_hold: u16,
    pub temperature_inp: u16,
    pub output_inp: u16,
    pub output_sum_inp: u16,
    pub set_point_inp: u16,
}

const ZONE_A: ZoneAddresses = ZoneAddresses {
    output_pin: 0,
    set_point_hold: SETPOINT_A_HOLD,
    kp_hold: KP_A_HOLD,
    ki_hold: KI_A_HOLD,
    kd_hold: KD_A_HOLD,
    enable_coil: PID_ENABLE_A_COIL,
    override_coil: OUTPUT_OVERRIDE_A_COIL,
    override_hold: OUTPUT_OVERRIDE_A_HOLD,
    sensor_index_hold: HEATERTC_A_IDX_HOLD,
    temperature_inp: THERMOCOUPLE_A_INP,
    output_inp: PID_OUTPUT_A_INP,
    output_sum_inp: PID_OUTPUTSUM_A_INP,
    set_point_inp: SETPOINT_A_INP,
};

const ZONE_B: ZoneAddresses = ZoneAddresses {
    output_pin: 1,
    set_point_hold: SETPOINT_B_HOLD,
    kp_hold: KP_B_HOLD,
    ki_hold: KI_B_HOLD,
    kd_hold: KD_B_HOLD,
    enable_coil: PID_ENABLE_B_COIL,
    override_coil: OUTPUT_OVERRIDE_B_COIL,
    override_hold: OUTPUT_OVERRIDE_B_HOLD,
    sensor_index_hold: HEATERTC_B_IDX_HOLD,
    temperature_inp: THERMOCOUPLE_B_INP,
    output_inp: PID_OUTPUT_B_INP,
    output_sum_inp: PID_OUTPUTSUM_B_INP,
    set_point_inp: SETPOINT_B_INP,
};

impl Zone {
    pub const ALL: [Zone; 2] = [Zone::A, Zone::B];

    pub fn addresses(self) -> &'static ZoneAddresses {
        match self {
            Zone::A => &ZONE_A,
            Zone::B => &ZONE_B,
        }
    }
}

/// Control state of one zone.
///
/// `set_point` is only ever derived from `base_set_point` and the gradient
/// modifier inside [`ZoneController::compute_tick`], so the two cannot drift.
#[derive(Debug, Clone)]
pub struct ZoneController {
    zone: Zone,
    pid: Pid,
    base_set_point: f32,
    set_point: f32,
    input: f32,
    gradient_modifier: f32,
    autosp_rate: f32,
    enabled: bool,
}

impl ZoneController {
    /// New controller, disabled, with the configured default tunings and setpoint.
    pub fn new(zone: Zone, config: &FurnaceConfig) -> Self {
        let mut pid = Pid::new(
            config.tunings,
            1.0 / config.tick_frequency_hz,
            0.0,
            PID_OUTPUT_LIMIT,
        );
        pid.set_automatic(false, 0.0);
        pid.set_manual_output(0.0);

        Self {
            zone,
            pid,
            base_set_point: config.setpoint,
            set_point: config.setpoint,
            input: 0.0,
            gradient_modifier: 0.0,
            autosp_rate: 0.0,
            enabled: false,
        }
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    /// Switch the engine on or off. Repeating the current state changes nothing.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled == self.enabled {
            return;
        }
        self.enabled = enabled;
        self.pid.set_automatic(enabled, self.input);
        if !enabled {
            self.pid.set_manual_output(0.0);
        }
        info!("zone {:?} enabled = {}", self.zone, enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Apply new gains; returns whether anything changed.
    pub fn set_tunings(&mut self, tunings: Tunings) -> bool {
        let changed = self.pid.set_tunings(tunings);
        if changed {
            info!(
                "zone {:?} tunings kp = {} ki = {} kd = {}",
                self.zone, tunings.kp, tunings.ki, tunings.kd
            );
        }
        changed
    }

    pub fn tunings(&self) -> Tunings {
        self.pid.tunings()
    }

    pub fn set_sample_time(&mut self, sample_time_s: f32) {
        self.pid.set_sample_time(sample_time_s);
    }

    /// Run one control iteration on `temperature`.
    ///
    /// While disabled the PID state is left untouched and the disabled output (0) is returned.
    pub fn compute_tick(&mut self, temperature: f32, gradient_enabled: bool) -> f32 {
        self.input = temperature;
        self.set_point = self.effective_set_point(gradient_enabled);

        // First computed tick after an override: resume from this measurement
        if self.enabled && !self.pid.is_automatic() {
            self.pid.set_automatic(true, temperature);
        }

        self.pid
            .compute(self.input, self.set_point)
            .unwrap_or_else(|| self.pid.output())
    }

    /// Record a measurement without running the engine.
    pub fn observe(&mut self, temperature: f32) {
        self.input = temperature;
    }

    /// Track the measurement and setpoint while the output is overridden.
    ///
    /// The engine drops to manual with its output and integral sum frozen. The
    /// next [`ZoneController::compute_tick`] brings it back to automatic,
    /// seeded with that tick's measurement.
    pub fn hold(&mut self, temperature: f32, gradient_enabled: bool) {
        self.input = temperature;
        self.set_point = self.effective_set_point(gradient_enabled);
        self.pid.set_automatic(false, temperature);
    }

    fn effective_set_point(&self, gradient_enabled: bool) -> f32 {
        if gradient_enabled {
            self.base_set_point + self.gradient_modifier
        } else {
            self.base_set_point
        }
    }

    pub fn base_set_point(&self) -> f32 {
        self.base_set_point
    }

    pub fn set_base_set_point(&mut self, value: f32) {
        self.base_set_point = value;
    }

    /// Effective setpoint of the last computation.
    pub fn set_point(&self) -> f32 {
        self.set_point
    }

    pub fn input(&self) -> f32 {
        self.input
    }

    pub fn output(&self) -> f32 {
        self.pid.output()
    }

    pub fn output_sum(&self) -> f32 {
        self.pid.output_sum()
    }

    pub fn last_input(&self) -> f32 {
        self.pid.last_input()
    }

    pub fn terms(&self) -> PidTerms {
        self.pid.terms()
    }

    pub fn gradient_modifier(&self) -> f32 {
        self.gradient_modifier
    }

    pub fn set_gradient_modifier(&mut self, value: f32) {
        self.gradient_modifier = value;
    }

    pub fn autosp_rate(&self) -> f32 {
        self.autosp_rate
    }

    pub fn set_autosp_rate(&mut self, value: f32) {
        self.autosp_rate = value;
    }
}
