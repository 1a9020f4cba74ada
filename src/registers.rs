//! Shared register table served to the supervisory software.
//!
//! Addresses follow the Modbus convention the supervisor already uses: coils
//! from 1, input registers from 30001, holding registers from 40001. Floats
//! span two 16-bit registers, low word first.

use portable_atomic::{AtomicBool, AtomicU16, Ordering};

use crate::config::FurnaceConfig;
use crate::sensor::ThermocoupleType;
use crate::zone::Zone;

pub const COIL_BASE: u16 = 1;
pub const COIL_COUNT: usize = 16;
pub const INPUT_BASE: u16 = 30001;
pub const INPUT_COUNT: usize = 32;
pub const HOLDING_BASE: u16 = 40001;
pub const HOLDING_COUNT: usize = 42;

// Coils
pub const PID_ENABLE_A_COIL: u16 = 1;
pub const PID_ENABLE_B_COIL: u16 = 2;
pub const GRADIENT_ENABLE_COIL: u16 = 3;
pub const AUTOSP_ENABLE_COIL: u16 = 4;
pub const AUTOSP_HEATING_COIL: u16 = 5; // true = heating, false = cooling
pub const MOTOR_ENABLE_COIL: u16 = 6;
pub const MOTOR_DIRECTION_COIL: u16 = 7;
pub const GRADIENT_HIGH_COIL: u16 = 8; // false = A is the high end, true = B
pub const ACQUISITION_COIL: u16 = 9;
pub const GRADIENT_UPDATE_COIL: u16 = 10;
pub const FREQ_ASPC_UPDATE_COIL: u16 = 11;
pub const SETPOINT_UPDATE_COIL: u16 = 12;
pub const OUTPUT_OVERRIDE_A_COIL: u16 = 13;
pub const OUTPUT_OVERRIDE_B_COIL: u16 = 14;
pub const THERMOCOUPLE_TYPE_UPDATE_COIL: u16 = 15;

// Input registers
pub const COUNTER_INP: u16 = 30001;
pub const PID_OUTPUT_A_INP: u16 = 30003;
pub const PID_OUTPUT_B_INP: u16 = 30005;
pub const PID_OUTPUTSUM_A_INP: u16 = 30007;
pub const PID_OUTPUTSUM_B_INP: u16 = 30009;
pub const THERMOCOUPLE_A_INP: u16 = 30011;
pub const THERMOCOUPLE_B_INP: u16 = 30013;
pub const THERMOCOUPLE_C_INP: u16 = 30015;
pub const THERMOCOUPLE_D_INP: u16 = 30017;
pub const GRADIENT_ACTUAL_INP: u16 = 30019;
pub const GRADIENT_THEORY_INP: u16 = 30021;
pub const AUTOSP_MIDPT_INP: u16 = 30023;
pub const SETPOINT_A_INP: u16 = 30025;
pub const SETPOINT_B_INP: u16 = 30027;

// Holding registers
pub const SETPOINT_A_HOLD: u16 = 40001;
pub const KP_A_HOLD: u16 = 40003;
pub const KI_A_HOLD: u16 = 40005;
pub const KD_A_HOLD: u16 = 40007;
pub const SETPOINT_B_HOLD: u16 = 40009;
pub const KP_B_HOLD: u16 = 40011;
pub const KI_B_HOLD: u16 = 40013;
pub const KD_B_HOLD: u16 = 40015;
pub const FURNACE_FREQ_HOLD: u16 = 40017;
pub const GRADIENT_WANTED_HOLD: u16 = 40019;
pub const GRADIENT_DISTANCE_HOLD: u16 = 40021;
pub const AUTOSP_RATE_HOLD: u16 = 40023;
pub const AUTOSP_IMGDEGREE_HOLD: u16 = 40025;
pub const MOTOR_SPEED_HOLD: u16 = 40027;
pub const OUTPUT_OVERRIDE_A_HOLD: u16 = 40029;
pub const OUTPUT_OVERRIDE_B_HOLD: u16 = 40031;
pub const HEATERTC_A_IDX_HOLD: u16 = 40033;
pub const HEATERTC_B_IDX_HOLD: u16 = 40035;
pub const EXTRATC_C_IDX_HOLD: u16 = 40037;
pub const EXTRATC_D_IDX_HOLD: u16 = 40039;
pub const THERMOCOUPLE_TYPE_HOLD: u16 = 40041;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterError {
    #[error("address {0} is not a configured coil")]
    NotACoil(u16),
    #[error("address {0} is not a configured input or holding register")]
    NotARegister(u16),
}

/// Split a float into its (low, high) register words.
#[inline]
pub fn split_words(value: f32) -> (u16, u16) {
    let bits = value.to_bits();
    (bits as u16, (bits >> 16) as u16)
}

/// Stitch two register words back into a float.
#[inline]
pub fn join_words(low: u16, high: u16) -> f32 {
    f32::from_bits((high as u32) << 16 | low as u32)
}

/// Typed access to the shared register table.
///
/// Every single access is atomic. Sequences spanning several addresses are
/// not, which is why the coordination lock exists.
pub trait RegisterStore {
    fn read_bool(&self, address: u16) -> Result<bool, RegisterError>;
    fn write_bool(&self, address: u16, value: bool) -> Result<(), RegisterError>;
    fn read_u16(&self, address: u16) -> Result<u16, RegisterError>;
    fn write_u16(&self, address: u16, value: u16) -> Result<(), RegisterError>;

    /// Read the float held at `address` (low word) and `address + 1` (high word).
    fn read_float(&self, address: u16) -> Result<f32, RegisterError> {
        let high_address = address
            .checked_add(1)
            .ok_or(RegisterError::NotARegister(address))?;
        let low = self.read_u16(address)?;
        let high = self.read_u16(high_address)?;
        Ok(join_words(low, high))
    }

    /// Write a float over `address` (low word) and `address + 1` (high word).
    fn write_float(&self, address: u16, value: f32) -> Result<(), RegisterError> {
        let high_address = address
            .checked_add(1)
            .ok_or(RegisterError::NotARegister(address))?;
        // Both words must exist before either is touched
        self.read_u16(high_address)?;
        let (low, high) = split_words(value);
        self.write_u16(address, low)?;
        self.write_u16(high_address, high)
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Input(usize),
    Holding(usize),
}

/// In-memory register table, lock-free per register.
pub struct RegisterBank {
    coils: [AtomicBool; COIL_COUNT],
    input: [AtomicU16; INPUT_COUNT],
    holding: [AtomicU16; HOLDING_COUNT],
}

#[allow(clippy::declare_interior_mutable_const)]
const COIL_INIT: AtomicBool = AtomicBool::new(false);
#[allow(clippy::declare_interior_mutable_const)]
const WORD_INIT: AtomicU16 = AtomicU16::new(0);

impl RegisterBank {
    pub const fn new() -> Self {
        Self {
            coils: [COIL_INIT; COIL_COUNT],
            input: [WORD_INIT; INPUT_COUNT],
            holding: [WORD_INIT; HOLDING_COUNT],
        }
    }

    fn coil(&self, address: u16) -> Result<&AtomicBool, RegisterError> {
        address
            .checked_sub(COIL_BASE)
            .and_then(|offset| self.coils.get(offset as usize))
            .ok_or(RegisterError::NotACoil(address))
    }

    fn slot(address: u16) -> Result<Slot, RegisterError> {
        if let Some(offset) = address.checked_sub(HOLDING_BASE) {
            if (offset as usize) < HOLDING_COUNT {
                return Ok(Slot::Holding(offset as usize));
            }
        } else if let Some(offset) = address.checked_sub(INPUT_BASE) {
            if (offset as usize) < INPUT_COUNT {
                return Ok(Slot::Input(offset as usize));
            }
        }
        Err(RegisterError::NotARegister(address))
    }

    fn word(&self, address: u16) -> Result<&AtomicU16, RegisterError> {
        Ok(match Self::slot(address)? {
            Slot::Input(offset) => &self.input[offset],
            Slot::Holding(offset) => &self.holding[offset],
        })
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterStore for RegisterBank {
    fn read_bool(&self, address: u16) -> Result<bool, RegisterError> {
        Ok(self.coil(address)?.load(Ordering::Acquire))
    }

    fn write_bool(&self, address: u16, value: bool) -> Result<(), RegisterError> {
        self.coil(address)?.store(value, Ordering::Release);
        Ok(())
    }

    fn read_u16(&self, address: u16) -> Result<u16, RegisterError> {
        Ok(self.word(address)?.load(Ordering::Acquire))
    }

    fn write_u16(&self, address: u16, value: u16) -> Result<(), RegisterError> {
        self.word(address)?.store(value, Ordering::Release);
        Ok(())
    }
}

/// Write the power-on state of every register the controller uses.
pub fn write_defaults<R: RegisterStore>(store: &R, config: &FurnaceConfig) -> Result<(), RegisterError> {
    // Heaters stay off until a supervisor enables them
    store.write_bool(PID_ENABLE_A_COIL, false)?;
    store.write_bool(PID_ENABLE_B_COIL, false)?;

    store.write_bool(GRADIENT_ENABLE_COIL, false)?;
    store.write_bool(GRADIENT_HIGH_COIL, false)?;

    store.write_bool(AUTOSP_ENABLE_COIL, false)?;
    store.write_bool(AUTOSP_HEATING_COIL, true)?;

    store.write_bool(MOTOR_ENABLE_COIL, false)?;
    store.write_bool(MOTOR_DIRECTION_COIL, true)?;

    store.write_bool(ACQUISITION_COIL, false)?;
    store.write_bool(OUTPUT_OVERRIDE_A_COIL, false)?;
    store.write_bool(OUTPUT_OVERRIDE_B_COIL, false)?;

    for zone in Zone::ALL {
        let addr = zone.addresses();
        store.write_float(addr.set_point_hold, config.setpoint)?;
        store.write_float(addr.kp_hold, config.tunings.kp)?;
        store.write_float(addr.ki_hold, config.tunings.ki)?;
        store.write_float(addr.kd_hold, config.tunings.kd)?;
        store.write_float(addr.override_hold, 0.0)?;
    }

    // The ramp increment depends on the tick frequency
    store.write_float(FURNACE_FREQ_HOLD, config.tick_frequency_hz)?;

    store.write_float(HEATERTC_A_IDX_HOLD, 0.0)?;
    store.write_float(HEATERTC_B_IDX_HOLD, 1.0)?;
    store.write_float(EXTRATC_C_IDX_HOLD, 2.0)?;
    store.write_float(EXTRATC_D_IDX_HOLD, 3.0)?;
    store.write_float(THERMOCOUPLE_TYPE_HOLD, ThermocoupleType::K.index() as f32)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_survives_the_register_pair_bit_exact() {
        let bank = RegisterBank::new();
        for value in [25.1_f32, -13.333, 0.0, -0.0, 1.0e-7, f32::MAX, 104.7] {
            bank.write_float(SETPOINT_A_HOLD, value).unwrap();
            let back = bank.read_float(SETPOINT_A_HOLD).unwrap();
            assert_eq!(back.to_bits(), value.to_bits());
        }
    }

    #[test]
    fn low_word_is_stored_first() {
        let bank = RegisterBank::new();
        let value = -13.333_f32;
        bank.write_float(GRADIENT_THEORY_INP, value).unwrap();

        let bits = value.to_bits();
        assert_eq!(bank.read_u16(GRADIENT_THEORY_INP).unwrap(), bits as u16);
        assert_eq!(bank.read_u16(GRADIENT_THEORY_INP + 1).unwrap(), (bits >> 16) as u16);
    }

    #[test]
    fn addresses_outside_the_regions_are_rejected() {
        let bank = RegisterBank::new();
        assert_eq!(bank.read_bool(0), Err(RegisterError::NotACoil(0)));
        assert_eq!(bank.read_bool(17), Err(RegisterError::NotACoil(17)));
        assert_eq!(bank.read_u16(30033), Err(RegisterError::NotARegister(30033)));
        assert_eq!(bank.read_u16(12), Err(RegisterError::NotARegister(12)));

        // The high word of the last holding slot would fall off the end
        let last = HOLDING_BASE + HOLDING_COUNT as u16 - 1;
        assert_eq!(
            bank.write_float(last, 1.0),
            Err(RegisterError::NotARegister(last + 1))
        );
    }

    #[test]
    fn rejected_float_write_leaves_the_low_word_alone() {
        let bank = RegisterBank::new();
        let last = HOLDING_BASE + HOLDING_COUNT as u16 - 1;
        bank.write_u16(last, 0x1234).unwrap();

        assert!(bank.write_float(last, -1.0).is_err());
        assert_eq!(bank.read_u16(last).unwrap(), 0x1234);
    }

    #[test]
    fn defaults_leave_heaters_disabled() {
        let bank = RegisterBank::new();
        bank.write_bool(PID_ENABLE_A_COIL, true).unwrap();
        write_defaults(&bank, &FurnaceConfig::default()).unwrap();

        assert!(!bank.read_bool(PID_ENABLE_A_COIL).unwrap());
        assert!(!bank.read_bool(PID_ENABLE_B_COIL).unwrap());
        assert!(bank.read_bool(AUTOSP_HEATING_COIL).unwrap());
        assert_eq!(bank.read_float(SETPOINT_B_HOLD).unwrap(), crate::SETPOINT_DEFAULT);
        assert_eq!(bank.read_float(FURNACE_FREQ_HOLD).unwrap(), crate::TICK_FREQUENCY_HZ);
        assert_eq!(bank.read_float(HEATERTC_B_IDX_HOLD).unwrap(), 1.0);
    }
}
