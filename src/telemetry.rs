//! Acquisition buffer between the control tick and the stream client.
//!
//! Single producer (control task), single consumer (supervisory task). The
//! queue never blocks either side: a full queue drops the new sample and an
//! empty one yields `None`.

use heapless::spsc::{Consumer, Producer, Queue};

use crate::log::info;
use crate::zone::ZoneController;
use crate::ACQUISITION_CAPACITY;

// heapless keeps one slot free to tell full from empty
const QUEUE_SLOTS: usize = ACQUISITION_CAPACITY + 1;

/// Number of `f32` fields in a streamed sample.
pub const SAMPLE_FIELDS: usize = 17;
/// Size of a streamed sample in bytes.
pub const SAMPLE_BYTES: usize = SAMPLE_FIELDS * 4;

/// Diagnostic snapshot of one zone.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ZoneSample {
    pub temperature: f32,
    pub output: f32,
    pub kp_term: f32,
    pub ki_term: f32,
    pub kd_term: f32,
    pub last_input: f32,
    pub output_sum: f32,
    pub set_point: f32,
}

impl ZoneSample {
    pub fn capture(zone: &ZoneController) -> Self {
        let terms = zone.terms();
        Self {
            temperature: zone.input(),
            output: zone.output(),
            kp_term: terms.p,
            ki_term: terms.i,
            kd_term: terms.d,
            last_input: zone.last_input(),
            output_sum: zone.output_sum(),
            set_point: zone.set_point(),
        }
    }

    fn fields(&self) -> [f32; 8] {
        [
            self.temperature,
            self.output,
            self.kp_term,
            self.ki_term,
            self.kd_term,
            self.last_input,
            self.output_sum,
            self.set_point,
        ]
    }
}

/// One control tick as seen by the stream client.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TelemetrySample {
    pub frame: u32,
    pub upper: ZoneSample,
    pub lower: ZoneSample,
}

impl TelemetrySample {
    /// Wire layout: frame, then the upper and lower zone fields, each as a little-endian `f32`.
    pub fn to_le_bytes(&self) -> [u8; SAMPLE_BYTES] {
        let mut out = [0u8; SAMPLE_BYTES];
        let fields = core::iter::once(self.frame as f32)
            .chain(self.upper.fields())
            .chain(self.lower.fields());
        for (chunk, value) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}

/// Fixed-capacity FIFO of telemetry samples.
pub struct TelemetryBuffer {
    queue: Queue<TelemetrySample, QUEUE_SLOTS>,
}

impl TelemetryBuffer {
    pub const fn new() -> Self {
        Self { queue: Queue::new() }
    }

    /// Queue a sample. Returns `false` and drops it when the buffer is full.
    pub fn enqueue(&mut self, sample: TelemetrySample) -> bool {
        self.queue.enqueue(sample).is_ok()
    }

    pub fn dequeue(&mut self) -> Option<TelemetrySample> {
        self.queue.dequeue()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn size(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Split into the halves owned by the control and supervisory tasks.
    pub fn split(&mut self) -> (TelemetryProducer<'_>, TelemetryConsumer<'_>) {
        let (producer, consumer) = self.queue.split();
        (TelemetryProducer { inner: producer }, TelemetryConsumer { inner: consumer })
    }
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Control task end of the buffer.
pub struct TelemetryProducer<'a> {
    inner: Producer<'a, TelemetrySample, QUEUE_SLOTS>,
}

impl TelemetryProducer<'_> {
    pub fn enqueue(&mut self, sample: TelemetrySample) -> bool {
        self.inner.enqueue(sample).is_ok()
    }

    pub fn is_full(&self) -> bool {
        !self.inner.ready()
    }

    pub fn size(&self) -> usize {
        self.inner.len()
    }
}

/// Stream end of the buffer.
pub struct TelemetryConsumer<'a> {
    inner: Consumer<'a, TelemetrySample, QUEUE_SLOTS>,
}

impl TelemetryConsumer<'_> {
    pub fn dequeue(&mut self) -> Option<TelemetrySample> {
        self.inner.dequeue()
    }

    pub fn is_empty(&self) -> bool {
        !self.inner.ready()
    }

    pub fn size(&self) -> usize {
        self.inner.len()
    }
}

/// Tracks the acquisition coil so the frame counter restarts once per session.
#[derive(Debug, Default)]
pub struct AcquisitionLatch {
    acquiring: bool,
}

impl AcquisitionLatch {
    pub const fn new() -> Self {
        Self { acquiring: false }
    }

    /// Feed the current coil state. Returns `true` only on the inactive to active edge.
    pub fn update(&mut self, active: bool) -> bool {
        let started = active && !self.acquiring;
        if active != self.acquiring {
            info!("acquisition {}", if active { "started" } else { "stopped" });
        }
        self.acquiring = active;
        started
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }
}
