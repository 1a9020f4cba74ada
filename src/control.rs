//! The control task: one pass over both zones per tick.

use crate::config::{FurnaceConfig, Tunings};
use crate::coordination::{ZoneLock, ZonePair};
use crate::log::{info, warn};
use crate::registers::*;
use crate::sensor::{SensorError, ThermocoupleType};
use crate::telemetry::{AcquisitionLatch, TelemetryProducer, TelemetrySample, ZoneSample};
use crate::tick::{TickFlag, TickRate};
use crate::zone::Zone;
use crate::PID_OUTPUT_LIMIT;

/// Temperature sensors the control tick reads from, addressed by index.
#[allow(async_fn_in_trait)]
pub trait TemperatureInputs {
    fn sensor_count(&self) -> usize;
    async fn read_temperature(&mut self, index: usize) -> Result<f32, SensorError>;
    async fn set_thermocouple_type(&mut self, kind: ThermocoupleType) -> Result<(), SensorError>;
}

/// Heater power outputs.
pub trait PowerOutputs {
    /// Drive `pin` at `value` on the output stage's scale.
    fn write_output(&mut self, pin: u8, value: u16);
}

/// State shared by the control and supervisory tasks.
pub struct Furnace<'r, R: RegisterStore> {
    config: FurnaceConfig,
    registers: &'r R,
    zones: ZoneLock,
    tick_rate: TickRate,
}

impl<'r, R: RegisterStore> Furnace<'r, R> {
    pub fn new(config: FurnaceConfig, registers: &'r R) -> Self {
        Self {
            zones: ZoneLock::new(ZonePair::new(&config)),
            tick_rate: TickRate::from_hz(config.tick_frequency_hz),
            config,
            registers,
        }
    }

    pub fn config(&self) -> &FurnaceConfig {
        &self.config
    }

    pub fn registers(&self) -> &'r R {
        self.registers
    }

    /// The coordination lock guarding both zones.
    pub fn zones(&self) -> &ZoneLock {
        &self.zones
    }

    /// Period the timer tick source runs at.
    pub fn tick_rate(&self) -> &TickRate {
        &self.tick_rate
    }

    /// Pull setpoints, tunings and ramp settings from the registers. Run once before the first tick.
    pub async fn load_from_registers(&self) -> Result<(), RegisterError> {
        let mut zones = self.zones.lock().await;
        for zone in Zone::ALL {
            let tunings = read_tunings(self.registers, zone)?;
            zones.zone_mut(zone).set_tunings(tunings);
        }
        zones.recompute_ramp(self.registers)?;
        self.tick_rate.set_hz(zones.tick_frequency_hz);
        zones.reload_set_points(self.registers)?;
        info!("zones loaded from registers");
        Ok(())
    }
}

fn read_tunings<R: RegisterStore>(registers: &R, zone: Zone) -> Result<Tunings, RegisterError> {
    let addr = zone.addresses();
    Ok(Tunings::new(
        registers.read_float(addr.kp_hold)?,
        registers.read_float(addr.ki_hold)?,
        registers.read_float(addr.kd_hold)?,
    ))
}

/// Extra thermocouples: index register and publishing input register.
const EXTRA_THERMOCOUPLES: [(u16, u16); 2] = [
    (EXTRATC_C_IDX_HOLD, THERMOCOUPLE_C_INP),
    (EXTRATC_D_IDX_HOLD, THERMOCOUPLE_D_INP),
];

/// Owns the hardware and the producer half of the telemetry buffer.
pub struct ControlLoop<'a, R: RegisterStore, T, P> {
    furnace: &'a Furnace<'a, R>,
    inputs: T,
    outputs: P,
    telemetry: TelemetryProducer<'a>,
    counter: u32,
    latch: AcquisitionLatch,
    gradient_enabled: bool,
}

impl<'a, R, T, P> ControlLoop<'a, R, T, P>
where
    R: RegisterStore,
    T: TemperatureInputs,
    P: PowerOutputs,
{
    pub fn new(furnace: &'a Furnace<'a, R>, inputs: T, outputs: P, telemetry: TelemetryProducer<'a>) -> Self {
        Self {
            furnace,
            inputs,
            outputs,
            telemetry,
            counter: 0,
            latch: AcquisitionLatch::new(),
            gradient_enabled: false,
        }
    }

    /// Wait for each tick and run it. A failed tick is logged and the next one runs as usual.
    pub async fn run(&mut self, tick: &TickFlag) -> ! {
        loop {
            tick.wait().await;
            if let Err(e) = self.tick().await {
                warn!("control tick failed: {}", e);
            }
        }
    }

    /// Map a sensor index register onto a valid sensor, if it names one.
    fn sensor_index(&self, hold: u16) -> Result<Option<usize>, RegisterError> {
        let value = self.furnace.registers.read_float(hold)?;
        let count = self.inputs.sensor_count();
        if value >= 0.0 && (value as usize) < count {
            Ok(Some(value as usize))
        } else {
            Ok(None)
        }
    }

    /// Read the sensor behind `hold` and publish it to `inp`.
    async fn read_sensor(&mut self, hold: u16, inp: u16) -> Result<Option<f32>, RegisterError> {
        let Some(index) = self.sensor_index(hold)? else {
            return Ok(None);
        };
        match self.inputs.read_temperature(index).await {
            Ok(temperature) => {
                self.furnace.registers.write_float(inp, temperature)?;
                Ok(Some(temperature))
            }
            Err(e) => {
                warn!("thermocouple {} read failed: {}", index, e);
                Ok(None)
            }
        }
    }

    /// One control iteration over both zones, run entirely under the coordination lock.
    pub async fn tick(&mut self) -> Result<(), RegisterError> {
        let furnace = self.furnace;
        let registers = furnace.registers;
        let config = &furnace.config;
        let mut zones = furnace.zones.lock().await;

        if let Some(kind) = zones.pending_thermocouple.take() {
            if let Err(e) = self.inputs.set_thermocouple_type(kind).await {
                warn!("thermocouple type change failed: {}", e);
            }
        }

        // Heater thermocouples; a skipped read keeps the previous measurement
        let mut temperatures = [zones.a.input(), zones.b.input()];
        for (slot, zone) in temperatures.iter_mut().zip(Zone::ALL) {
            let addr = zone.addresses();
            if let Some(t) = self.read_sensor(addr.sensor_index_hold, addr.temperature_inp).await? {
                *slot = t;
            }
        }

        // Extra thermocouples once per second
        let ticks_per_second = (libm::roundf(zones.tick_frequency_hz) as u32).max(1);
        if self.counter % ticks_per_second == 0 {
            for (hold, inp) in EXTRA_THERMOCOUPLES {
                self.read_sensor(hold, inp).await?;
            }
        }

        registers.write_float(COUNTER_INP, self.counter as f32)?;
        self.counter = self.counter.wrapping_add(1);
        let acquiring = registers.read_bool(ACQUISITION_COIL)?;
        if self.latch.update(acquiring) {
            self.counter = 1;
        }

        let gradient_enabled = registers.read_bool(GRADIENT_ENABLE_COIL)?;
        if gradient_enabled && !self.gradient_enabled {
            zones.recompute_gradient(registers)?;
        }
        self.gradient_enabled = gradient_enabled;

        for (zone, temperature) in Zone::ALL.into_iter().zip(temperatures) {
            let addr = zone.addresses();
            let controller = zones.zone_mut(zone);

            // An enable edge seeds the derivative from this tick's measurement
            controller.observe(temperature);
            controller.set_enabled(registers.read_bool(addr.enable_coil)?);
            controller.set_tunings(read_tunings(registers, zone)?);

            // Override only drives an enabled zone
            let value = if controller.is_enabled() && registers.read_bool(addr.override_coil)? {
                controller.hold(temperature, gradient_enabled);
                config.output.scale_override(registers.read_float(addr.override_hold)?)
            } else {
                let output = controller.compute_tick(temperature, gradient_enabled);
                config.output.scale_pid_output(output, PID_OUTPUT_LIMIT)
            };
            self.outputs.write_output(addr.output_pin, value);

            registers.write_float(addr.output_inp, controller.output())?;
            registers.write_float(addr.output_sum_inp, controller.output_sum())?;
            registers.write_float(addr.set_point_inp, controller.set_point())?;
        }

        zones.advance_ramp(registers, config)?;

        registers.write_float(GRADIENT_ACTUAL_INP, zones.gradient_actual())?;
        registers.write_float(AUTOSP_MIDPT_INP, zones.midpoint())?;

        if acquiring {
            let sample = TelemetrySample {
                frame: self.counter,
                upper: ZoneSample::capture(&zones.a),
                lower: ZoneSample::capture(&zones.b),
            };
            // A full buffer drops the sample
            let _ = self.telemetry.enqueue(sample);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ConnectionWatchdog;
    use crate::telemetry::TelemetryBuffer;
    use embassy_futures::block_on;

    struct FixedInputs([f32; 4]);

    impl TemperatureInputs for FixedInputs {
        fn sensor_count(&self) -> usize {
            self.0.len()
        }

        async fn read_temperature(&mut self, index: usize) -> Result<f32, SensorError> {
            self.0.get(index).copied().ok_or(SensorError::UnknownSensor(index))
        }

        async fn set_thermocouple_type(&mut self, _: ThermocoupleType) -> Result<(), SensorError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Outputs([u16; 2]);

    impl PowerOutputs for Outputs {
        fn write_output(&mut self, pin: u8, value: u16) {
            self.0[pin as usize] = value;
        }
    }

    fn bank() -> RegisterBank {
        let bank = RegisterBank::new();
        write_defaults(&bank, &FurnaceConfig::default()).unwrap();
        bank
    }

    #[test]
    fn disabled_zones_stay_unpowered() {
        let bank = bank();
        let furnace = Furnace::new(FurnaceConfig::default(), &bank);
        let mut buffer = TelemetryBuffer::new();
        let (producer, _) = buffer.split();
        let mut control = ControlLoop::new(&furnace, FixedInputs([20.0, 21.0, 22.0, 23.0]), Outputs::default(), producer);

        block_on(furnace.load_from_registers()).unwrap();
        block_on(control.tick()).unwrap();

        assert_eq!(control.outputs.0, [0, 0]);
        assert_eq!(bank.read_float(THERMOCOUPLE_A_INP).unwrap(), 20.0);
        assert_eq!(bank.read_float(THERMOCOUPLE_B_INP).unwrap(), 21.0);
        // Counter 0 is a multiple of the tick rate, so the extras are read too
        assert_eq!(bank.read_float(THERMOCOUPLE_D_INP).unwrap(), 23.0);
    }

    #[test]
    fn enabling_mid_run_has_no_derivative_kick() {
        let bank = bank();
        let furnace = Furnace::new(FurnaceConfig::default(), &bank);
        let mut buffer = TelemetryBuffer::new();
        let (producer, _) = buffer.split();
        let mut control = ControlLoop::new(&furnace, FixedInputs([80.0; 4]), Outputs::default(), producer);

        bank.write_bool(PID_ENABLE_A_COIL, true).unwrap();
        block_on(control.tick()).unwrap();

        let zones = block_on(furnace.zones().lock());
        assert_eq!(zones.a.terms().d, 0.0);
        assert_eq!(zones.a.last_input(), 80.0);
    }

    #[test]
    fn override_drives_percent_of_full_scale() {
        let bank = bank();
        bank.write_bool(PID_ENABLE_B_COIL, true).unwrap();
        bank.write_bool(OUTPUT_OVERRIDE_B_COIL, true).unwrap();
        bank.write_float(OUTPUT_OVERRIDE_B_HOLD, 50.0).unwrap();
        let furnace = Furnace::new(FurnaceConfig::default(), &bank);
        let mut buffer = TelemetryBuffer::new();
        let (producer, _) = buffer.split();
        let mut control = ControlLoop::new(&furnace, FixedInputs([20.0; 4]), Outputs::default(), producer);

        block_on(control.tick()).unwrap();
        assert_eq!(control.outputs.0, [0, 2047]);
    }

    #[test]
    fn override_is_ignored_on_a_disabled_zone() {
        let bank = bank();
        bank.write_bool(OUTPUT_OVERRIDE_A_COIL, true).unwrap();
        bank.write_float(OUTPUT_OVERRIDE_A_HOLD, 100.0).unwrap();
        let furnace = Furnace::new(FurnaceConfig::default(), &bank);
        let mut buffer = TelemetryBuffer::new();
        let (producer, _) = buffer.split();
        let mut control = ControlLoop::new(&furnace, FixedInputs([20.0; 4]), Outputs::default(), producer);

        block_on(control.tick()).unwrap();
        let off = furnace.config().output.disabled_value();
        assert_eq!(control.outputs.0, [off, off]);
    }

    #[test]
    fn connection_timeout_cuts_overridden_heaters() {
        let bank = bank();
        for (enable, coil, hold) in [
            (PID_ENABLE_A_COIL, OUTPUT_OVERRIDE_A_COIL, OUTPUT_OVERRIDE_A_HOLD),
            (PID_ENABLE_B_COIL, OUTPUT_OVERRIDE_B_COIL, OUTPUT_OVERRIDE_B_HOLD),
        ] {
            bank.write_bool(enable, true).unwrap();
            bank.write_bool(coil, true).unwrap();
            bank.write_float(hold, 100.0).unwrap();
        }
        let furnace = Furnace::new(FurnaceConfig::default(), &bank);
        let mut buffer = TelemetryBuffer::new();
        let (producer, _) = buffer.split();
        let mut control = ControlLoop::new(&furnace, FixedInputs([20.0; 4]), Outputs::default(), producer);

        block_on(control.tick()).unwrap();
        assert_eq!(control.outputs.0, [4095, 4095]);

        let mut watchdog = ConnectionWatchdog::new(furnace.config().connection_timeout_ms, 0);
        assert!(watchdog.poll(false, 30_001, &bank).unwrap());
        block_on(control.tick()).unwrap();

        let off = furnace.config().output.disabled_value();
        assert_eq!(control.outputs.0, [off, off]);
    }

    #[test]
    fn releasing_override_resumes_without_derivative_kick() {
        let bank = bank();
        bank.write_float(SETPOINT_A_HOLD, 100.0).unwrap();
        bank.write_bool(PID_ENABLE_A_COIL, true).unwrap();
        bank.write_bool(OUTPUT_OVERRIDE_A_COIL, true).unwrap();
        let furnace = Furnace::new(FurnaceConfig::default(), &bank);
        let mut buffer = TelemetryBuffer::new();
        let (producer, _) = buffer.split();
        let mut control = ControlLoop::new(&furnace, FixedInputs([20.0; 4]), Outputs::default(), producer);
        block_on(furnace.load_from_registers()).unwrap();

        block_on(control.tick()).unwrap();
        for t in [30.0, 40.0, 50.0, 60.0, 60.0] {
            control.inputs.0[0] = t;
            block_on(control.tick()).unwrap();
        }

        bank.write_bool(OUTPUT_OVERRIDE_A_COIL, false).unwrap();
        block_on(control.tick()).unwrap();

        let zones = block_on(furnace.zones().lock());
        assert_eq!(zones.a.terms().d, 0.0);
        assert_eq!(zones.a.last_input(), 60.0);
    }

    #[test]
    fn overridden_zone_still_publishes_its_setpoint() {
        let bank = bank();
        bank.write_bool(PID_ENABLE_A_COIL, true).unwrap();
        bank.write_bool(OUTPUT_OVERRIDE_A_COIL, true).unwrap();
        let furnace = Furnace::new(FurnaceConfig::default(), &bank);
        let mut buffer = TelemetryBuffer::new();
        let (producer, _) = buffer.split();
        let mut control = ControlLoop::new(&furnace, FixedInputs([20.0; 4]), Outputs::default(), producer);

        block_on(control.tick()).unwrap();
        bank.write_float(SETPOINT_A_HOLD, 150.0).unwrap();
        block_on(furnace.zones().lock()).reload_set_points(&bank).unwrap();
        block_on(control.tick()).unwrap();

        assert_eq!(bank.read_float(SETPOINT_A_INP).unwrap(), 150.0);
    }

    #[test]
    fn acquisition_restarts_frame_counter() {
        let bank = bank();
        let furnace = Furnace::new(FurnaceConfig::default(), &bank);
        let mut buffer = TelemetryBuffer::new();
        let (producer, mut consumer) = buffer.split();
        let mut control = ControlLoop::new(&furnace, FixedInputs([20.0; 4]), Outputs::default(), producer);

        for _ in 0..5 {
            block_on(control.tick()).unwrap();
        }
        assert!(consumer.is_empty());

        bank.write_bool(ACQUISITION_COIL, true).unwrap();
        for _ in 0..3 {
            block_on(control.tick()).unwrap();
        }
        let frames: Vec<u32> = core::iter::from_fn(|| consumer.dequeue()).map(|s| s.frame).collect();
        assert_eq!(frames, [1, 2, 3]);
    }

    #[test]
    fn out_of_range_sensor_index_keeps_previous_input() {
        let bank = bank();
        bank.write_float(HEATERTC_A_IDX_HOLD, 9.0).unwrap();
        let furnace = Furnace::new(FurnaceConfig::default(), &bank);
        let mut buffer = TelemetryBuffer::new();
        let (producer, _) = buffer.split();
        let mut control = ControlLoop::new(&furnace, FixedInputs([50.0; 4]), Outputs::default(), producer);

        block_on(control.tick()).unwrap();
        assert_eq!(bank.read_float(THERMOCOUPLE_A_INP).unwrap(), 0.0);
        assert_eq!(block_on(furnace.zones().lock()).a.input(), 0.0);
    }
}
