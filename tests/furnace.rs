use std::cell::{Cell, RefCell};

use embassy_futures::block_on;

use livex_furnace::control::{ControlLoop, Furnace, PowerOutputs, TemperatureInputs};
use livex_furnace::registers::*;
use livex_furnace::sensor::{SensorError, ThermocoupleType};
use livex_furnace::supervisor::{FieldbusLink, LinkState, Supervisor, TelemetrySink};
use livex_furnace::telemetry::{TelemetryBuffer, TelemetrySample, SAMPLE_BYTES};
use livex_furnace::FurnaceConfig;

/// Thermocouples whose readings the test sets directly.
struct Probes<'a> {
    readings: &'a RefCell<[f32; 4]>,
    kind: &'a Cell<Option<ThermocoupleType>>,
}

impl TemperatureInputs for Probes<'_> {
    fn sensor_count(&self) -> usize {
        4
    }

    async fn read_temperature(&mut self, index: usize) -> Result<f32, SensorError> {
        self.readings
            .borrow()
            .get(index)
            .copied()
            .ok_or(SensorError::UnknownSensor(index))
    }

    async fn set_thermocouple_type(&mut self, kind: ThermocoupleType) -> Result<(), SensorError> {
        self.kind.set(Some(kind));
        Ok(())
    }
}

struct Heaters<'a>(&'a RefCell<[u16; 2]>);

impl PowerOutputs for Heaters<'_> {
    fn write_output(&mut self, pin: u8, value: u16) {
        self.0.borrow_mut()[pin as usize] = value;
    }
}

struct Client<'a>(&'a Cell<bool>);

impl FieldbusLink for Client<'_> {
    async fn poll<R: RegisterStore>(&mut self, _: &R) -> bool {
        self.0.get()
    }
}

struct Stream<'a>(&'a RefCell<Vec<[u8; SAMPLE_BYTES]>>);

impl TelemetrySink for Stream<'_> {
    fn is_connected(&self) -> bool {
        true
    }

    async fn send(&mut self, sample: &TelemetrySample) {
        self.0.borrow_mut().push(sample.to_le_bytes());
    }
}

fn frame_of(bytes: &[u8; SAMPLE_BYTES]) -> f32 {
    f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[test]
fn supervised_session() {
    let config = FurnaceConfig::default();
    let bank = RegisterBank::new();
    write_defaults(&bank, &config).unwrap();
    let furnace = Furnace::new(config, &bank);

    let readings = RefCell::new([20.0, 22.0, 30.0, 31.0]);
    let kind = Cell::new(None);
    let power = RefCell::new([0u16; 2]);
    let connected = Cell::new(true);
    let streamed = RefCell::new(Vec::new());

    let mut buffer = TelemetryBuffer::new();
    let (producer, consumer) = buffer.split();
    let mut control = ControlLoop::new(
        &furnace,
        Probes { readings: &readings, kind: &kind },
        Heaters(&power),
        producer,
    );
    let mut supervisor = Supervisor::new(&furnace, Client(&connected), Stream(&streamed), consumer, 0);

    block_on(furnace.load_from_registers()).unwrap();

    // Client enables both zones at 100 degrees with a 20 degree gradient, A on top
    bank.write_float(SETPOINT_A_HOLD, 100.0).unwrap();
    bank.write_float(SETPOINT_B_HOLD, 100.0).unwrap();
    bank.write_float(GRADIENT_WANTED_HOLD, 2.0).unwrap();
    bank.write_float(GRADIENT_DISTANCE_HOLD, 10.0).unwrap();
    bank.write_bool(GRADIENT_ENABLE_COIL, true).unwrap();
    bank.write_bool(SETPOINT_UPDATE_COIL, true).unwrap();
    bank.write_bool(PID_ENABLE_A_COIL, true).unwrap();
    bank.write_bool(PID_ENABLE_B_COIL, true).unwrap();
    block_on(supervisor.poll(5)).unwrap();
    assert!(!bank.read_bool(SETPOINT_UPDATE_COIL).unwrap());
    assert_eq!(supervisor.link_state(), LinkState::Connected);

    block_on(control.tick()).unwrap();
    assert_eq!(bank.read_float(SETPOINT_A_INP).unwrap(), 110.0);
    assert_eq!(bank.read_float(SETPOINT_B_INP).unwrap(), 90.0);
    assert_eq!(bank.read_float(GRADIENT_ACTUAL_INP).unwrap(), 2.0);
    assert_eq!(bank.read_float(AUTOSP_MIDPT_INP).unwrap(), 21.0);
    {
        let power = power.borrow();
        assert!(power[0] > 0 && power[1] > 0);
        // Power scale caps the output stage at 80%
        assert!(power[0] <= 3276 && power[1] <= 3276);
    }

    // Acquisition streams one sample per supervisor poll, frames counted from 1
    bank.write_bool(ACQUISITION_COIL, true).unwrap();
    for _ in 0..3 {
        block_on(control.tick()).unwrap();
    }
    for now in [10, 15, 20, 25] {
        block_on(supervisor.poll(now)).unwrap();
    }
    let frames: Vec<f32> = streamed.borrow().iter().map(frame_of).collect();
    assert_eq!(frames, [1.0f32, 2.0, 3.0]);

    // Thermocouple type change reaches the amplifiers on the next tick
    bank.write_float(THERMOCOUPLE_TYPE_HOLD, 3.0).unwrap();
    bank.write_bool(THERMOCOUPLE_TYPE_UPDATE_COIL, true).unwrap();
    block_on(supervisor.poll(30)).unwrap();
    assert_eq!(kind.get(), None);
    block_on(control.tick()).unwrap();
    assert_eq!(kind.get(), Some(ThermocoupleType::N));

    // Client goes away: heaters are switched off after the timeout
    connected.set(false);
    block_on(supervisor.poll(1_000)).unwrap();
    assert!(bank.read_bool(PID_ENABLE_A_COIL).unwrap());
    block_on(supervisor.poll(31_000)).unwrap();
    assert!(!bank.read_bool(PID_ENABLE_A_COIL).unwrap());
    assert!(!bank.read_bool(PID_ENABLE_B_COIL).unwrap());

    block_on(control.tick()).unwrap();
    assert_eq!(*power.borrow(), [0, 0]);
}

#[test]
fn ramp_walks_setpoint_to_the_limit() {
    let config = FurnaceConfig {
        setpoint_upper_limit: 30.0,
        ..FurnaceConfig::default()
    };
    let bank = RegisterBank::new();
    write_defaults(&bank, &config).unwrap();
    let furnace = Furnace::new(config, &bank);

    let readings = RefCell::new([25.0; 4]);
    let kind = Cell::new(None);
    let power = RefCell::new([0u16; 2]);
    let mut buffer = TelemetryBuffer::new();
    let (producer, _) = buffer.split();
    let mut control = ControlLoop::new(
        &furnace,
        Probes { readings: &readings, kind: &kind },
        Heaters(&power),
        producer,
    );

    // 10 degrees per second at 10 Hz is one degree per tick
    bank.write_float(FURNACE_FREQ_HOLD, 10.0).unwrap();
    bank.write_float(AUTOSP_RATE_HOLD, 10.0).unwrap();
    bank.write_float(SETPOINT_A_HOLD, 26.0).unwrap();
    bank.write_bool(PID_ENABLE_A_COIL, true).unwrap();
    bank.write_bool(AUTOSP_ENABLE_COIL, true).unwrap();
    block_on(furnace.load_from_registers()).unwrap();
    assert_eq!(furnace.tick_rate().period_us(), 100_000);

    for expected in [27.0, 28.0, 29.0] {
        block_on(control.tick()).unwrap();
        assert_eq!(bank.read_float(SETPOINT_A_HOLD).unwrap(), expected);
        assert!(bank.read_bool(AUTOSP_ENABLE_COIL).unwrap());
    }

    block_on(control.tick()).unwrap();
    assert_eq!(bank.read_float(SETPOINT_A_HOLD).unwrap(), 30.0);
    assert!(!bank.read_bool(AUTOSP_ENABLE_COIL).unwrap());

    // Zone B was never enabled and kept its setpoint
    assert_eq!(bank.read_float(SETPOINT_B_HOLD).unwrap(), livex_furnace::SETPOINT_DEFAULT);
}
