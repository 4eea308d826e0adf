//! Nested epoch / step / eval progress indicators.
//!
//! Only the main process draws. Other ranks get a [`NoopProgressSink`] so the
//! orchestrator can report unconditionally.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    EpochStarted { epoch: usize },
    Step { step: usize, steps_per_epoch: usize, loss: f64 },
    EvalStarted { total: usize },
    EvalStep,
    EvalFinished { bleu4: f64 },
    EpochFinished { epoch: usize, epochs: usize, avg_loss: f64, best_epoch: usize, best_bleu4: f64 },
    Finished,
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Terminal bars for one training run, redrawn at most once per second.
pub struct BarProgressSink {
    multi: MultiProgress,
    epochs: ProgressBar,
    steps: ProgressBar,
    eval: Mutex<Option<ProgressBar>>,
}

impl std::fmt::Debug for BarProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarProgressSink")
            .field("epoch", &self.epochs.position())
            .field("step", &self.steps.position())
            .finish_non_exhaustive()
    }
}

impl BarProgressSink {
    /// `step_ticks` is the number of logged steps per epoch, not the raw batch count.
    #[must_use]
    pub fn new(epochs: usize, step_ticks: usize) -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr_with_hz(1), epochs, step_ticks)
    }

    #[must_use]
    pub fn with_draw_target(target: ProgressDrawTarget, epochs: usize, step_ticks: usize) -> Self {
        let multi = MultiProgress::with_draw_target(target);

        let epoch_bar = multi.add(ProgressBar::new(epochs as u64));
        epoch_bar.set_style(bar_style("epoch [{bar:30.cyan/blue}] {pos}/{len} {msg}"));

        let step_bar = multi.add(ProgressBar::new(step_ticks as u64));
        step_bar.set_style(bar_style("steps [{bar:30.green}] {pos}/{len} {msg}"));

        Self { multi, epochs: epoch_bar, steps: step_bar, eval: Mutex::new(None) }
    }

    /// Only the evaluation bar is drawn.
    #[must_use]
    pub fn for_evaluation() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(1)),
            epochs: ProgressBar::hidden(),
            steps: ProgressBar::hidden(),
            eval: Mutex::new(None),
        }
    }

    fn with_eval(&self, f: impl FnOnce(&mut Option<ProgressBar>)) {
        if let Ok(mut eval) = self.eval.lock() {
            f(&mut eval);
        }
    }
}

impl ProgressSink for BarProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::EpochStarted { .. } => self.steps.reset(),
            ProgressEvent::Step { step, steps_per_epoch, loss } => {
                self.steps.inc(1);
                self.steps.set_message(format!("step: {step}/{steps_per_epoch}, loss: {loss:.6}"));
            }
            ProgressEvent::EvalStarted { total } => self.with_eval(|eval| {
                let bar = self.multi.add(ProgressBar::new(total as u64));
                bar.set_style(bar_style("eval  [{bar:30.yellow}] {pos}/{len} {msg}"));
                *eval = Some(bar);
            }),
            ProgressEvent::EvalStep => self.with_eval(|eval| {
                if let Some(bar) = eval {
                    bar.inc(1);
                }
            }),
            ProgressEvent::EvalFinished { bleu4 } => self.with_eval(|eval| {
                if let Some(bar) = eval.take() {
                    bar.set_message(format!("bleu4 score: {bleu4}"));
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
            }),
            ProgressEvent::EpochFinished { epoch, epochs, avg_loss, best_epoch, best_bleu4 } => {
                self.epochs.inc(1);
                self.epochs.set_message(format!(
                    "epoch: {epoch}/{epochs}, avg_loss: {avg_loss:.6}, best_epoch: {best_epoch}, best_bleu: {best_bleu4}"
                ));
            }
            ProgressEvent::Finished => {
                self.steps.finish();
                self.epochs.finish();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hidden(epochs: usize, ticks: usize) -> BarProgressSink {
        BarProgressSink::with_draw_target(ProgressDrawTarget::hidden(), epochs, ticks)
    }

    #[test]
    fn test_step_bar_resets_each_epoch() {
        let sink = hidden(2, 4);
        sink.on_event(ProgressEvent::EpochStarted { epoch: 0 });
        sink.on_event(ProgressEvent::Step { step: 0, steps_per_epoch: 8, loss: 1.0 });
        sink.on_event(ProgressEvent::Step { step: 7, steps_per_epoch: 8, loss: 0.5 });
        assert_eq!(sink.steps.position(), 2);
        assert_eq!(sink.steps.message(), "step: 7/8, loss: 0.500000");

        sink.on_event(ProgressEvent::EpochStarted { epoch: 1 });
        assert_eq!(sink.steps.position(), 0);
    }

    #[test]
    fn test_epoch_status_text() {
        let sink = hidden(3, 1);
        sink.on_event(ProgressEvent::EpochFinished {
            epoch: 0,
            epochs: 3,
            avg_loss: 0.25,
            best_epoch: 0,
            best_bleu4: 0.5,
        });
        assert_eq!(sink.epochs.position(), 1);
        assert_eq!(sink.epochs.message(), "epoch: 0/3, avg_loss: 0.250000, best_epoch: 0, best_bleu: 0.5");
    }

    #[test]
    fn test_eval_bar_is_removed_when_finished() {
        let sink = hidden(1, 1);
        sink.on_event(ProgressEvent::EvalStarted { total: 3 });
        sink.on_event(ProgressEvent::EvalStep);
        assert_eq!(sink.eval.lock().unwrap().as_ref().map(ProgressBar::position), Some(1));

        sink.on_event(ProgressEvent::EvalFinished { bleu4: 0.1 });
        assert!(sink.eval.lock().unwrap().is_none());
    }

    #[test]
    fn test_events_serialize_tagged() {
        let json = serde_json::to_value(ProgressEvent::EvalFinished { bleu4: 0.5 }).unwrap();
        assert_eq!(json["type"], "eval_finished");
    }
}
