//! Control tick handoff from interrupt context to the control task.

use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::waitqueue::AtomicWaker;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

/// One-shot flag raised by the tick source and consumed by the control task.
///
/// Raising an already raised flag coalesces: the task sees one tick. The
/// raise count is kept only for diagnostics.
pub struct TickFlag {
    pending: AtomicBool,
    raised: AtomicU32,
    waker: AtomicWaker,
}

impl TickFlag {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            raised: AtomicU32::new(0),
            waker: AtomicWaker::new(),
        }
    }

    /// Mark a tick as due. Safe to call from an interrupt handler.
    pub fn raise(&self) {
        self.raised.fetch_add(1, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Consume the flag, returning whether a tick was due.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Wait until the flag is raised, then consume it.
    pub async fn wait(&self) {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            if self.take() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Total raises since boot, including coalesced ones.
    pub fn raised_count(&self) -> u32 {
        self.raised.load(Ordering::Relaxed)
    }
}

impl Default for TickFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Period of the timer tick source, shared with the task that retunes it.
pub struct TickRate {
    period_us: AtomicU32,
}

impl TickRate {
    pub const fn from_period_us(period_us: u32) -> Self {
        Self { period_us: AtomicU32::new(period_us) }
    }

    pub fn from_hz(hz: f32) -> Self {
        let rate = Self::from_period_us(0);
        rate.set_hz(hz);
        rate
    }

    /// Retune to `hz`. Non-positive rates are ignored.
    pub fn set_hz(&self, hz: f32) {
        if hz > 0.0 {
            let period = libm::roundf(1_000_000.0 / hz) as u32;
            self.period_us.store(period.max(1), Ordering::Relaxed);
        }
    }

    pub fn period_us(&self) -> u32 {
        self.period_us.load(Ordering::Relaxed)
    }
}

/// Turns every `divider`-th rising edge of an external trigger into a tick.
#[derive(Debug, Clone)]
pub struct PulseDivider {
    divider: u32,
    edges: u32,
}

impl PulseDivider {
    pub const fn new(divider: u32) -> Self {
        Self {
            divider: if divider == 0 { 1 } else { divider },
            edges: 0,
        }
    }

    /// Count one edge; `true` when it completes a period.
    pub fn on_edge(&mut self) -> bool {
        self.edges += 1;
        if self.edges >= self.divider {
            self.edges = 0;
            true
        } else {
            false
        }
    }
}
