//! Supervisory task: fieldbus link, telemetry stream, update coils and the
//! connection fail-safe.

use embassy_time::{Instant, Timer};

use crate::control::Furnace;
use crate::log::{info, warn};
use crate::registers::*;
use crate::sensor::ThermocoupleType;
use crate::telemetry::{TelemetryConsumer, TelemetrySample};
use crate::SUPERVISOR_POLL_MS;

/// Network side of the register store.
#[allow(async_fn_in_trait)]
pub trait FieldbusLink {
    /// Serve pending client requests against `registers`. Returns whether a client is connected.
    async fn poll<R: RegisterStore>(&mut self, registers: &R) -> bool;
}

/// Stream client for acquisition samples.
#[allow(async_fn_in_trait)]
pub trait TelemetrySink {
    fn is_connected(&self) -> bool;
    async fn send(&mut self, sample: &TelemetrySample);
}

/// Link with nothing attached. No client ever connects.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl FieldbusLink for Detached {
    async fn poll<R: RegisterStore>(&mut self, _: &R) -> bool {
        false
    }
}

impl TelemetrySink for Detached {
    fn is_connected(&self) -> bool {
        false
    }

    async fn send(&mut self, _: &TelemetrySample) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Disables both heaters and releases any output override when no client
/// has been seen for the timeout.
#[derive(Debug, Clone)]
pub struct ConnectionWatchdog {
    timeout_ms: u64,
    last_seen_ms: u64,
    state: LinkState,
}

impl ConnectionWatchdog {
    pub fn new(timeout_ms: u64, now_ms: u64) -> Self {
        Self {
            timeout_ms,
            last_seen_ms: now_ms,
            state: LinkState::Disconnected,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Update with the link status at `now_ms`. Returns `true` when the fail-safe fired.
    pub fn poll<R: RegisterStore>(
        &mut self,
        connected: bool,
        now_ms: u64,
        registers: &R,
    ) -> Result<bool, RegisterError> {
        if connected {
            if self.state == LinkState::Disconnected {
                info!("supervisor connected");
            }
            self.state = LinkState::Connected;
            self.last_seen_ms = now_ms;
            return Ok(false);
        }

        if self.state == LinkState::Connected {
            info!("supervisor disconnected");
            self.state = LinkState::Disconnected;
        }

        if now_ms.saturating_sub(self.last_seen_ms) > self.timeout_ms {
            warn!("no supervisor for {} ms, disabling heaters", self.timeout_ms);
            for coil in [
                PID_ENABLE_A_COIL,
                PID_ENABLE_B_COIL,
                OUTPUT_OVERRIDE_A_COIL,
                OUTPUT_OVERRIDE_B_COIL,
            ] {
                registers.write_bool(coil, false)?;
            }
            // Fire once per timeout period, not on every poll
            self.last_seen_ms = now_ms;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Run the recompute behind every raised update coil, then clear the coil.
pub async fn service_update_coils<R: RegisterStore>(furnace: &Furnace<'_, R>) -> Result<(), RegisterError> {
    let registers = furnace.registers();

    if registers.read_bool(SETPOINT_UPDATE_COIL)? {
        furnace.zones().lock().await.reload_set_points(registers)?;
        registers.write_bool(SETPOINT_UPDATE_COIL, false)?;
    }

    if registers.read_bool(GRADIENT_UPDATE_COIL)? {
        furnace.zones().lock().await.recompute_gradient(registers)?;
        registers.write_bool(GRADIENT_UPDATE_COIL, false)?;
    }

    if registers.read_bool(FREQ_ASPC_UPDATE_COIL)? {
        let mut zones = furnace.zones().lock().await;
        zones.recompute_ramp(registers)?;
        furnace.tick_rate().set_hz(zones.tick_frequency_hz);
        drop(zones);
        registers.write_bool(FREQ_ASPC_UPDATE_COIL, false)?;
    }

    if registers.read_bool(THERMOCOUPLE_TYPE_UPDATE_COIL)? {
        let value = registers.read_float(THERMOCOUPLE_TYPE_HOLD)?;
        match ThermocoupleType::from_register(value) {
            Some(kind) => furnace.zones().lock().await.pending_thermocouple = Some(kind),
            None => warn!("unknown thermocouple type {}", value),
        }
        registers.write_bool(THERMOCOUPLE_TYPE_UPDATE_COIL, false)?;
    }

    Ok(())
}

/// Owns the link, the stream sink and the consumer half of the telemetry buffer.
pub struct Supervisor<'a, R: RegisterStore, L, S> {
    furnace: &'a Furnace<'a, R>,
    link: L,
    sink: S,
    telemetry: TelemetryConsumer<'a>,
    watchdog: ConnectionWatchdog,
}

impl<'a, R, L, S> Supervisor<'a, R, L, S>
where
    R: RegisterStore,
    L: FieldbusLink,
    S: TelemetrySink,
{
    pub fn new(furnace: &'a Furnace<'a, R>, link: L, sink: S, telemetry: TelemetryConsumer<'a>, now_ms: u64) -> Self {
        Self {
            watchdog: ConnectionWatchdog::new(furnace.config().connection_timeout_ms, now_ms),
            furnace,
            link,
            sink,
            telemetry,
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.watchdog.state()
    }

    /// One supervisory pass at `now_ms`.
    pub async fn poll(&mut self, now_ms: u64) -> Result<(), RegisterError> {
        let registers = self.furnace.registers();
        let connected = self.link.poll(registers).await;

        if self.sink.is_connected() {
            if let Some(sample) = self.telemetry.dequeue() {
                self.sink.send(&sample).await;
            }
        }

        service_update_coils(self.furnace).await?;
        self.watchdog.poll(connected, now_ms, registers)?;
        Ok(())
    }

    pub async fn run(&mut self) -> ! {
        loop {
            if let Err(e) = self.poll(Instant::now().as_millis()).await {
                warn!("supervisor poll failed: {}", e);
            }
            Timer::after_millis(SUPERVISOR_POLL_MS).await;
        }
    }
}
