//! MCP9600 thermocouple amplifier driver and the thermocouple set the controller reads from.

use embedded_hal_async::i2c::I2c;

use crate::control::TemperatureInputs;
use crate::log::{info, warn};

// Register pointers
const REG_HOT_JUNCTION: u8 = 0x00;
const REG_SENSOR_CONFIG: u8 = 0x05;
const REG_DEVICE_CONFIG: u8 = 0x06;
const REG_DEVICE_ID: u8 = 0x20;

const DEVICE_ID: u8 = 0x40;
const FILTER_COEFFICIENT: u8 = 3;
// 0.0625°C cold junction, 18-bit ADC, normal mode
const DEVICE_CONFIG: u8 = 0b0000_0000;
/// Conversion rate between the raw hot junction value and degrees celsius.
const TEMP_CONV_C: f32 = 0.0625;

/// Thermocouple types supported by the amplifier, in register order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThermocoupleType {
    K = 0,
    J = 1,
    T = 2,
    N = 3,
    S = 4,
    E = 5,
    B = 6,
    R = 7,
}

impl ThermocoupleType {
    pub const fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        use ThermocoupleType::*;
        [K, J, T, N, S, E, B, R].get(index as usize).copied()
    }

    /// Decode the float held in the thermocouple type register.
    pub fn from_register(value: f32) -> Option<Self> {
        if !(0.0..8.0).contains(&value) {
            return None;
        }
        Self::from_index(value as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    #[error("i2c bus error")]
    Bus,
    #[error("no MCP9600 answering at address {0:#x}")]
    NotFound(u8),
    #[error("no thermocouple with index {0}")]
    UnknownSensor(usize),
}

impl SensorError {
    fn bus<E: embedded_hal::i2c::Error>(_: E) -> Self {
        warn!("MCP9600 transfer failed");
        SensorError::Bus
    }
}

/// Driver for one MCP9600 on a shared I2C bus.
#[derive(Debug, Clone, Copy)]
pub struct Mcp9600 {
    address: u8,
}

impl Mcp9600 {
    pub const fn new(address: u8) -> Self {
        Self { address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Check the device id register.
    pub async fn probe<I: I2c>(&self, i2c: &mut I) -> Result<(), SensorError> {
        let mut id = [0u8; 2];
        i2c.write_read(self.address, &[REG_DEVICE_ID], &mut id)
            .await
            .map_err(|_| SensorError::NotFound(self.address))?;
        if id[0] != DEVICE_ID {
            return Err(SensorError::NotFound(self.address));
        }
        Ok(())
    }

    /// Select the thermocouple type, keeping the filter setting.
    pub async fn set_thermocouple_type<I: I2c>(
        &self,
        i2c: &mut I,
        kind: ThermocoupleType,
    ) -> Result<(), SensorError> {
        let config = (kind.index() << 4) | FILTER_COEFFICIENT;
        self.write_u8(i2c, REG_SENSOR_CONFIG, config).await
    }

    /// Full setup: type, filter, resolution and mode.
    pub async fn configure<I: I2c>(&self, i2c: &mut I, kind: ThermocoupleType) -> Result<(), SensorError> {
        self.write_u8(i2c, REG_DEVICE_CONFIG, DEVICE_CONFIG).await?;
        self.set_thermocouple_type(i2c, kind).await
    }

    /// Hot junction temperature in degrees celsius.
    pub async fn hot_junction<I: I2c>(&self, i2c: &mut I) -> Result<f32, SensorError> {
        let raw = self.read_i16(i2c, REG_HOT_JUNCTION).await?;
        Ok(raw as f32 * TEMP_CONV_C)
    }

    async fn write_u8<I: I2c>(&self, i2c: &mut I, register: u8, value: u8) -> Result<(), SensorError> {
        i2c.write(self.address, &[register, value])
            .await
            .map_err(SensorError::bus)
    }

    async fn read_i16<I: I2c>(&self, i2c: &mut I, register: u8) -> Result<i16, SensorError> {
        let mut buffer = [0u8; 2];
        i2c.write_read(self.address, &[register], &mut buffer)
            .await
            .map_err(SensorError::bus)?;
        Ok(i16::from_be_bytes(buffer))
    }
}

/// Every thermocouple amplifier on one bus, addressed by position.
pub struct Thermocouples<I, const N: usize> {
    i2c: I,
    devices: [Mcp9600; N],
}

impl<I: I2c, const N: usize> Thermocouples<I, N> {
    pub fn new(i2c: I, addresses: [u8; N]) -> Self {
        Self {
            i2c,
            devices: addresses.map(Mcp9600::new),
        }
    }

    /// Probe and configure every amplifier. Stops at the first one missing.
    pub async fn init(&mut self, kind: ThermocoupleType) -> Result<(), SensorError> {
        for device in &self.devices {
            device.probe(&mut self.i2c).await?;
            device.configure(&mut self.i2c, kind).await?;
            info!("found MCP9600 at {:#x}, type {:?}", device.address(), kind);
        }
        Ok(())
    }

    fn device(&self, index: usize) -> Result<Mcp9600, SensorError> {
        self.devices
            .get(index)
            .copied()
            .ok_or(SensorError::UnknownSensor(index))
    }
}

impl<I: I2c, const N: usize> TemperatureInputs for Thermocouples<I, N> {
    fn sensor_count(&self) -> usize {
        N
    }

    async fn read_temperature(&mut self, index: usize) -> Result<f32, SensorError> {
        let device = self.device(index)?;
        device.hot_junction(&mut self.i2c).await
    }

    async fn set_thermocouple_type(&mut self, kind: ThermocoupleType) -> Result<(), SensorError> {
        for device in &self.devices {
            device.set_thermocouple_type(&mut self.i2c, kind).await?;
        }
        info!("thermocouple type set to {:?}", kind);
        Ok(())
    }
}
