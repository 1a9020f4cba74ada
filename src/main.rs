#![no_std]
#![no_main]

use core::ptr::addr_of_mut;

use defmt::*;

use embassy_executor::{Executor, InterruptExecutor};
use embassy_rp::bind_interrupts;
use embassy_rp::i2c::{self, I2c, InterruptHandler as I2cInterruptHandler};
use embassy_rp::interrupt;
use embassy_rp::interrupt::{InterruptExt, Priority};
use embassy_rp::multicore::{spawn_core1, Stack};
use embassy_rp::peripherals::I2C0;
use embassy_rp::pwm::{self, Pwm};
use embassy_time::{Duration, Instant, Timer};
use static_cell::StaticCell;

use {defmt_rtt as _, panic_probe as _};

use livex_furnace::control::{ControlLoop, Furnace, PowerOutputs};
use livex_furnace::registers::{self, RegisterBank};
use livex_furnace::sensor::{ThermocoupleType, Thermocouples};
use livex_furnace::supervisor::{Detached, Supervisor};
use livex_furnace::telemetry::{TelemetryBuffer, TelemetryConsumer, TelemetryProducer};
use livex_furnace::tick::TickFlag;
use livex_furnace::{FurnaceConfig, THERMOCOUPLE_COUNT, VERSION};

bind_interrupts!(struct Irqs {
    I2C0_IRQ => I2cInterruptHandler<I2C0>;
});

// MCP9600 addresses, in thermocouple index order
const THERMOCOUPLE_ADDRESSES: [u8; THERMOCOUPLE_COUNT] = [0x60, 0x65, 0x66, 0x67];

static REGISTERS: RegisterBank = RegisterBank::new();
static TICK: TickFlag = TickFlag::new();

static FURNACE: StaticCell<Furnace<'static, RegisterBank>> = StaticCell::new();
static TELEMETRY: StaticCell<TelemetryBuffer> = StaticCell::new();

static mut CORE1_STACK: Stack<4096> = Stack::new();
static EXECUTOR0: StaticCell<Executor> = StaticCell::new();
static EXECUTOR1: StaticCell<Executor> = StaticCell::new();
static EXECUTOR_TICK: InterruptExecutor = InterruptExecutor::new();

type Inputs = Thermocouples<I2c<'static, I2C0, i2c::Async>, THERMOCOUPLE_COUNT>;

/// Both heaters on channel A of their own PWM slice.
struct PwmOutputs {
    heaters: [Pwm<'static>; 2],
    config: pwm::Config,
}

impl PowerOutputs for PwmOutputs {
    fn write_output(&mut self, pin: u8, value: u16) {
        if let Some(heater) = self.heaters.get_mut(pin as usize) {
            self.config.compare_a = value;
            heater.set_config(&self.config);
        }
    }
}

#[interrupt]
unsafe fn SWI_IRQ_1() {
    EXECUTOR_TICK.on_interrupt()
}

#[cortex_m_rt::entry]
fn main() -> ! {
    info!("LiveX furnace {}", VERSION);
    let p = embassy_rp::init(Default::default());

    let config = FurnaceConfig::default();
    if let Err(e) = registers::write_defaults(&REGISTERS, &config) {
        error!("register defaults failed: {}", e);
    }

    let furnace: &'static Furnace<'static, RegisterBank> = FURNACE.init(Furnace::new(config, &REGISTERS));
    let (producer, consumer) = TELEMETRY.init_with(TelemetryBuffer::new).split();

    // Tick source preempts both task loops
    interrupt::SWI_IRQ_1.set_priority(Priority::P2);
    let tick_spawner = EXECUTOR_TICK.start(interrupt::SWI_IRQ_1);

    #[cfg(not(feature = "external-trigger"))]
    unwrap!(tick_spawner.spawn(timer_tick(furnace)));

    #[cfg(feature = "external-trigger")]
    {
        use embassy_rp::gpio::{Input, Pull};
        let trigger = Input::new(p.PIN_15, Pull::Down);
        unwrap!(tick_spawner.spawn(external_tick(trigger, 1)));
    }

    let (i2c0, scl, sda) = (p.I2C0, p.PIN_5, p.PIN_4);
    let (slice_a, pin_a, slice_b, pin_b) = (p.PWM_SLICE0, p.PIN_0, p.PWM_SLICE1, p.PIN_2);

    spawn_core1(
        p.CORE1,
        unsafe { &mut *addr_of_mut!(CORE1_STACK) },
        move || {
            let i2c = I2c::new_async(i2c0, scl, sda, Irqs, i2c::Config::default());
            let inputs = Thermocouples::new(i2c, THERMOCOUPLE_ADDRESSES);

            let mut pwm_config = pwm::Config::default();
            pwm_config.top = config.output.pwm_top();
            pwm_config.compare_a = config.output.disabled_value();
            let outputs = PwmOutputs {
                heaters: [
                    Pwm::new_output_a(slice_a, pin_a, pwm_config.clone()),
                    Pwm::new_output_a(slice_b, pin_b, pwm_config.clone()),
                ],
                config: pwm_config,
            };

            let executor1 = EXECUTOR1.init(Executor::new());
            executor1.run(|spawner| unwrap!(spawner.spawn(control_task(furnace, inputs, outputs, producer))));
        },
    );

    let executor0 = EXECUTOR0.init(Executor::new());
    executor0.run(|spawner| unwrap!(spawner.spawn(supervisor_task(furnace, consumer))));
}

#[embassy_executor::task]
async fn control_task(
    furnace: &'static Furnace<'static, RegisterBank>,
    mut inputs: Inputs,
    outputs: PwmOutputs,
    telemetry: TelemetryProducer<'static>,
) {
    info!("control task on core 1");

    if let Err(e) = inputs.init(ThermocoupleType::K).await {
        // Wiring fault: nothing to control without the amplifiers
        loop {
            error!("thermocouple amplifier missing: {}", e);
            Timer::after_secs(5).await;
        }
    }

    if let Err(e) = furnace.load_from_registers().await {
        warn!("loading zones from registers failed: {}", e);
    }

    let mut control = ControlLoop::new(furnace, inputs, outputs, telemetry);
    control.run(&TICK).await
}

#[embassy_executor::task]
async fn supervisor_task(furnace: &'static Furnace<'static, RegisterBank>, telemetry: TelemetryConsumer<'static>) {
    info!("supervisor task on core 0");
    // Fieldbus server and stream socket are supplied by the network stack; none is attached here
    let mut supervisor = Supervisor::new(furnace, Detached, Detached, telemetry, Instant::now().as_millis());
    supervisor.run().await
}

#[cfg(not(feature = "external-trigger"))]
#[embassy_executor::task]
async fn timer_tick(furnace: &'static Furnace<'static, RegisterBank>) {
    let mut next = Instant::now();
    loop {
        next += Duration::from_micros(furnace.tick_rate().period_us() as u64);
        Timer::at(next).await;
        TICK.raise();
    }
}

#[cfg(feature = "external-trigger")]
#[embassy_executor::task]
async fn external_tick(mut trigger: embassy_rp::gpio::Input<'static>, divider: u32) {
    let mut pulses = livex_furnace::tick::PulseDivider::new(divider);
    loop {
        trigger.wait_for_rising_edge().await;
        if pulses.on_edge() {
            TICK.raise();
        }
    }
}
