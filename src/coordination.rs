//! Cross-zone setpoint adjustments: thermal gradient and auto-setpoint ramp.
//!
//! All of this state sits behind one lock shared by the control and
//! supervisory tasks. Every function taking `&mut ZonePair` is meant to run
//! with that lock held for its whole read-compute-write span.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

use crate::config::FurnaceConfig;
use crate::log::{info, warn};
use crate::registers::*;
use crate::sensor::ThermocoupleType;
use crate::zone::{Zone, ZoneController};

/// The coordination lock.
pub type ZoneLock = Mutex<CriticalSectionRawMutex, ZonePair>;

/// Setpoint offsets for zones A and B that put their effective setpoints
/// `theoretical` apart around their current midpoint, `high` on top.
pub fn gradient_modifiers(base_a: f32, base_b: f32, theoretical: f32, high: Zone) -> (f32, f32) {
    let mid = (base_a + base_b) / 2.0;
    let half = theoretical / 2.0;
    let (target_a, target_b) = match high {
        Zone::A => (mid + half, mid - half),
        Zone::B => (mid - half, mid + half),
    };
    (target_a - base_a, target_b - base_b)
}

/// Signed setpoint change per tick for a ramp of `rate_per_s` degrees per second.
pub fn ramp_increment(rate_per_s: f32, frequency_hz: f32, heating: bool) -> f32 {
    let per_tick = rate_per_s / frequency_hz;
    if heating {
        per_tick
    } else {
        -per_tick
    }
}

/// Result of advancing a setpoint by one ramp increment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampStep {
    pub set_point: f32,
    pub limit_reached: bool,
}

/// Advance `base` by `increment`, stopping at `upper` when heating or `lower` when cooling.
pub fn ramp_step(base: f32, increment: f32, lower: f32, upper: f32) -> RampStep {
    let next = base + increment;
    if increment > 0.0 && next >= upper {
        RampStep { set_point: upper, limit_reached: true }
    } else if increment < 0.0 && next <= lower {
        RampStep { set_point: lower, limit_reached: true }
    } else {
        RampStep { set_point: next, limit_reached: false }
    }
}

/// Both zone controllers and the state the coordination layer shares with them.
pub struct ZonePair {
    pub a: ZoneController,
    pub b: ZoneController,
    /// Control tick rate currently in force
    pub tick_frequency_hz: f32,
    /// Thermocouple type waiting to be applied by the control task
    pub pending_thermocouple: Option<ThermocoupleType>,
}

impl ZonePair {
    pub fn new(config: &FurnaceConfig) -> Self {
        Self {
            a: ZoneController::new(Zone::A, config),
            b: ZoneController::new(Zone::B, config),
            tick_frequency_hz: config.tick_frequency_hz,
            pending_thermocouple: None,
        }
    }

    pub fn zone(&self, zone: Zone) -> &ZoneController {
        match zone {
            Zone::A => &self.a,
            Zone::B => &self.b,
        }
    }

    pub fn zone_mut(&mut self, zone: Zone) -> &mut ZoneController {
        match zone {
            Zone::A => &mut self.a,
            Zone::B => &mut self.b,
        }
    }

    /// Absolute midpoint of the two measured temperatures.
    pub fn midpoint(&self) -> f32 {
        libm::fabsf((self.a.input() + self.b.input()) / 2.0)
    }

    /// Absolute difference of the two measured temperatures.
    pub fn gradient_actual(&self) -> f32 {
        libm::fabsf(self.a.input() - self.b.input())
    }

    /// Reload both base setpoints from their holding registers, then refresh the gradient.
    pub fn reload_set_points<R: RegisterStore>(&mut self, store: &R) -> Result<(), RegisterError> {
        for zone in Zone::ALL {
            let value = store.read_float(zone.addresses().set_point_hold)?;
            self.zone_mut(zone).set_base_set_point(value);
        }
        info!(
            "setpoints A = {} B = {}",
            self.a.base_set_point(),
            self.b.base_set_point()
        );
        self.recompute_gradient(store)
    }

    /// Recompute the gradient modifiers from the gradient registers and publish the
    /// theoretical difference.
    pub fn recompute_gradient<R: RegisterStore>(&mut self, store: &R) -> Result<(), RegisterError> {
        let wanted = store.read_float(GRADIENT_WANTED_HOLD)?;
        let distance = store.read_float(GRADIENT_DISTANCE_HOLD)?;
        let high = if store.read_bool(GRADIENT_HIGH_COIL)? { Zone::B } else { Zone::A };

        let theoretical = wanted * distance;
        let (mod_a, mod_b) = gradient_modifiers(
            self.a.base_set_point(),
            self.b.base_set_point(),
            theoretical,
            high,
        );
        self.a.set_gradient_modifier(mod_a);
        self.b.set_gradient_modifier(mod_b);

        store.write_float(GRADIENT_THEORY_INP, theoretical)?;
        info!(
            "gradient {} high zone {:?}, modifiers A = {} B = {}",
            theoretical, high, mod_a, mod_b
        );
        Ok(())
    }

    /// Recompute the ramp increment and the PID sample time from the frequency and
    /// ramp registers. A non-positive frequency is rejected and nothing changes.
    pub fn recompute_ramp<R: RegisterStore>(&mut self, store: &R) -> Result<(), RegisterError> {
        let frequency = store.read_float(FURNACE_FREQ_HOLD)?;
        if !(frequency > 0.0) {
            warn!("rejected tick frequency {} Hz", frequency);
            return Ok(());
        }

        let rate = store.read_float(AUTOSP_RATE_HOLD)?;
        let heating = store.read_bool(AUTOSP_HEATING_COIL)?;
        let increment = ramp_increment(rate, frequency, heating);

        self.tick_frequency_hz = frequency;
        for zone in [&mut self.a, &mut self.b] {
            zone.set_autosp_rate(increment);
            zone.set_sample_time(1.0 / frequency);
        }

        store.write_float(AUTOSP_MIDPT_INP, self.midpoint())?;
        info!("tick {} Hz, ramp {} per tick", frequency, increment);
        Ok(())
    }

    /// Advance the base setpoint of every enabled zone by its ramp increment.
    ///
    /// A changed base setpoint is written back to its holding register. When
    /// any zone hits its limit the ramp coil is cleared after both have moved.
    pub fn advance_ramp<R: RegisterStore>(
        &mut self,
        store: &R,
        config: &FurnaceConfig,
    ) -> Result<(), RegisterError> {
        if !store.read_bool(AUTOSP_ENABLE_COIL)? {
            return Ok(());
        }

        let mut limit_reached = false;
        for zone in [&mut self.a, &mut self.b] {
            if !zone.is_enabled() || zone.autosp_rate() == 0.0 {
                continue;
            }
            let step = ramp_step(
                zone.base_set_point(),
                zone.autosp_rate(),
                config.setpoint_lower_limit,
                config.setpoint_upper_limit,
            );
            if step.set_point != zone.base_set_point() {
                zone.set_base_set_point(step.set_point);
                store.write_float(zone.zone().addresses().set_point_hold, step.set_point)?;
            }
            limit_reached |= step.limit_reached;
        }

        if limit_reached {
            store.write_bool(AUTOSP_ENABLE_COIL, false)?;
            info!("ramp reached its setpoint limit, disabled");
        }
        Ok(())
    }
}
