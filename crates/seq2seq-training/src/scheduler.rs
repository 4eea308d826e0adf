use crate::error::{TrainingError, TrainingResult};
use std::f64::consts::PI;

/// Fraction of the cycle spent ramping up.
const PCT_START: f64 = 0.3;
/// `min_lr = initial_lr / FINAL_DIV_FACTOR`.
const FINAL_DIV_FACTOR: f64 = 1e4;

/// One-cycle learning-rate policy with cosine annealing and no momentum cycling.
///
/// Starts at `max_lr / div_factor`, rises to `max_lr` over the first 30% of
/// steps, then anneals to `initial_lr / 1e4`.
#[derive(Debug, Clone, PartialEq)]
pub struct OneCycleLr {
    max_lr: f64,
    initial_lr: f64,
    min_lr: f64,
    total_steps: usize,
    warmup_end: f64,
    step: usize,
    current_lr: f64,
}

impl OneCycleLr {
    pub fn new(max_lr: f64, epochs: usize, steps_per_epoch: usize, div_factor: f64) -> TrainingResult<Self> {
        if !max_lr.is_finite() || max_lr <= 0.0 {
            return Err(TrainingError::InvalidConfig("one-cycle max_lr must be > 0".to_string()));
        }
        if div_factor <= 0.0 {
            return Err(TrainingError::InvalidConfig("one-cycle div_factor must be > 0".to_string()));
        }
        let total_steps = epochs * steps_per_epoch;
        if total_steps == 0 {
            return Err(TrainingError::InvalidConfig(
                "one-cycle schedule needs at least one step".to_string(),
            ));
        }

        let initial_lr = max_lr / div_factor;
        let mut schedule = Self {
            max_lr,
            initial_lr,
            min_lr: initial_lr / FINAL_DIV_FACTOR,
            total_steps,
            warmup_end: PCT_START * total_steps as f64 - 1.0,
            step: 0,
            current_lr: initial_lr,
        };
        schedule.current_lr = schedule.lr_at(0);
        Ok(schedule)
    }

    /// Steps per epoch when every optimizer update consumes
    /// `batch_size * accumulation_steps` samples.
    #[must_use]
    pub fn steps_per_epoch(dataset_len: usize, batch_size: usize, accumulation_steps: usize) -> usize {
        dataset_len.div_ceil(batch_size.max(1) * accumulation_steps.max(1))
    }

    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    /// Advance one optimizer step and return the new learning rate.
    pub fn step(&mut self) -> f64 {
        if self.step >= self.total_steps {
            tracing::warn!(total_steps = self.total_steps, "one-cycle schedule exhausted, holding final lr");
        } else {
            self.step += 1;
        }
        self.current_lr = self.lr_at(self.step);
        self.current_lr
    }

    fn lr_at(&self, step: usize) -> f64 {
        let step = step as f64;
        let end = (self.total_steps - 1) as f64;
        if step <= self.warmup_end {
            anneal(self.initial_lr, self.max_lr, fraction(step, 0.0, self.warmup_end))
        } else {
            let start = self.warmup_end.max(0.0);
            anneal(self.max_lr, self.min_lr, fraction(step, start, end))
        }
    }
}

fn fraction(step: f64, start: f64, end: f64) -> f64 {
    if end <= start { 1.0 } else { ((step - start) / (end - start)).clamp(0.0, 1.0) }
}

fn anneal(start: f64, end: f64, pct: f64) -> f64 {
    let cos_out = (PI * pct).cos() + 1.0;
    end + (start - end) / 2.0 * cos_out
}
