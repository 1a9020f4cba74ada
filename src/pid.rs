//! Discrete PID controller driven at a fixed tick rate.
//!
//! Proportional on error, derivative on measurement, integral accumulated
//! into `output_sum` and clamped to the output limits. The caller must run
//! `compute` once per sample period; no timing is enforced here.

use crate::config::Tunings;

/// Contribution of each term in the last computation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PidTerms {
    pub p: f32,
    pub i: f32,
    pub d: f32,
}

#[derive(Debug, Clone)]
pub struct Pid {
    tunings: Tunings,
    // Gains scaled to the sample period
    kp: f32,
    ki: f32,
    kd: f32,
    sample_time_s: f32,
    out_min: f32,
    out_max: f32,
    output: f32,
    output_sum: f32,
    last_input: f32,
    terms: PidTerms,
    automatic: bool,
}

impl Pid {
    /// Create a controller in automatic mode.
    pub fn new(tunings: Tunings, sample_time_s: f32, out_min: f32, out_max: f32) -> Self {
        let mut pid = Self {
            tunings,
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            sample_time_s,
            out_min,
            out_max,
            output: 0.0,
            output_sum: 0.0,
            last_input: 0.0,
            terms: PidTerms::default(),
            automatic: true,
        };
        pid.apply_tunings(tunings);
        pid
    }

    /// Run one iteration. Returns `None` without touching any state while in manual mode.
    pub fn compute(&mut self, input: f32, set_point: f32) -> Option<f32> {
        if !self.automatic {
            return None;
        }

        let error = set_point - input;
        let d_input = input - self.last_input;

        let i = self.ki * error;
        self.output_sum = (self.output_sum + i).clamp(self.out_min, self.out_max);

        let p = self.kp * error;
        let d = -self.kd * d_input;

        self.output = (p + self.output_sum + d).clamp(self.out_min, self.out_max);
        self.last_input = input;
        self.terms = PidTerms { p, i, d };

        Some(self.output)
    }

    /// Apply new gains. Equal gains are a no-op so the controller is never disturbed needlessly.
    pub fn set_tunings(&mut self, tunings: Tunings) -> bool {
        if tunings == self.tunings {
            return false;
        }
        self.apply_tunings(tunings);
        true
    }

    fn apply_tunings(&mut self, tunings: Tunings) {
        self.tunings = tunings;
        self.kp = tunings.kp;
        self.ki = tunings.ki * self.sample_time_s;
        self.kd = tunings.kd / self.sample_time_s;
    }

    /// Change the sample period, rescaling the integral and derivative gains.
    pub fn set_sample_time(&mut self, sample_time_s: f32) {
        if sample_time_s <= 0.0 || sample_time_s == self.sample_time_s {
            return;
        }
        let ratio = sample_time_s / self.sample_time_s;
        self.ki *= ratio;
        self.kd /= ratio;
        self.sample_time_s = sample_time_s;
    }

    /// Switch between automatic (computing) and manual (held output) mode.
    ///
    /// Entering automatic re-seeds the derivative with `input` and keeps the
    /// integral sum, clamped to the limits.
    pub fn set_automatic(&mut self, automatic: bool, input: f32) {
        if automatic && !self.automatic {
            self.last_input = input;
            self.output_sum = self.output_sum.clamp(self.out_min, self.out_max);
        }
        self.automatic = automatic;
    }

    /// Hold the output at `value` while in manual mode.
    pub fn set_manual_output(&mut self, value: f32) {
        if !self.automatic {
            self.output = value.clamp(self.out_min, self.out_max);
        }
    }

    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    pub fn tunings(&self) -> Tunings {
        self.tunings
    }

    pub fn output(&self) -> f32 {
        self.output
    }

    pub fn output_sum(&self) -> f32 {
        self.output_sum
    }

    pub fn last_input(&self) -> f32 {
        self.last_input
    }

    pub fn terms(&self) -> PidTerms {
        self.terms
    }

    pub fn sample_time_s(&self) -> f32 {
        self.sample_time_s
    }
}
