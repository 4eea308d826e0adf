use crate::backend::{Optimizer, ParameterState, Seq2SeqModel};
use crate::error::{TrainingError, TrainingResult};

/// Adafactor with an externally scheduled learning rate.
///
/// Parameters are stored flat, so the second moment is kept unfactored (the
/// form Adafactor uses for vectors). Updates are RMS-clipped to
/// `clip_threshold`; the learning rate is applied as given, without
/// parameter-scale or relative-step adjustment.
#[derive(Debug, Clone)]
pub struct Adafactor {
    lr: f64,
    eps: f64,
    clip_threshold: f64,
    decay_rate: f64,
    step: u64,
    second_moment: ParameterState,
}

impl Adafactor {
    #[must_use]
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            eps: 1e-30,
            clip_threshold: 1.0,
            decay_rate: -0.8,
            step: 0,
            second_moment: ParameterState::new(),
        }
    }

    #[must_use]
    pub fn steps_taken(&self) -> u64 {
        self.step
    }
}

fn rms(values: &[f32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values.iter().map(|&v| f64::from(v) * f64::from(v)).sum();
    (sum / values.len() as f64).sqrt()
}

impl Optimizer for Adafactor {
    fn step(&mut self, model: &mut dyn Seq2SeqModel) -> TrainingResult<()> {
        self.step += 1;
        let beta2t = 1.0 - (self.step as f64).powf(self.decay_rate);
        let (params, grads) = model.params_and_grads();

        for (name, param) in params.iter_mut() {
            let Some(grad) = grads.get(name) else { continue };
            if grad.len() != param.len() {
                return Err(TrainingError::Model(format!(
                    "gradient for `{name}` has {} elements, parameter has {}",
                    grad.len(),
                    param.len()
                )));
            }

            let v = self.second_moment.entry(name.clone()).or_insert_with(|| vec![0.0; param.len()]);
            let mut update: Vec<f32> = Vec::with_capacity(param.len());
            for (vi, &g) in v.iter_mut().zip(grad) {
                let g = f64::from(g);
                let next = beta2t * f64::from(*vi) + (1.0 - beta2t) * (g * g + self.eps);
                *vi = next as f32;
                update.push((g / next.sqrt()) as f32);
            }

            let clip = (rms(&update) / self.clip_threshold).max(1.0);
            for (p, u) in param.iter_mut().zip(&update) {
                *p -= (self.lr * f64::from(*u) / clip) as f32;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}
