use crate::backend::{BleuScorer, Dataset, Seq2SeqModel, Tokenizer};
use crate::bleu::average;
use crate::dataset::DataLoader;
use crate::distributed::{Accelerator, DistributedModel};
use crate::error::TrainingResult;
use crate::progress::{ProgressEvent, ProgressSink};

/// Generation-only BLEU-4 pass over a prepared loader.
pub struct Evaluator<'a> {
    accelerator: &'a Accelerator,
    scorer: &'a dyn BleuScorer,
    progress: &'a dyn ProgressSink,
    max_seq_len: usize,
}

impl<'a> Evaluator<'a> {
    #[must_use]
    pub fn new(
        accelerator: &'a Accelerator,
        scorer: &'a dyn BleuScorer,
        progress: &'a dyn ProgressSink,
        max_seq_len: usize,
    ) -> Self {
        Self { accelerator, scorer, progress, max_seq_len }
    }

    /// Average sentence BLEU-4 over every real sample the loader yields
    /// across all ranks. Returns `0.0` when nothing was scored.
    pub fn evaluate<M: Seq2SeqModel, D: Dataset + 'static>(
        &self,
        model: &DistributedModel<M>,
        tokenizer: &D::Tokenizer,
        loader: &DataLoader<D>,
        expected_steps: usize,
    ) -> TrainingResult<f64> {
        let raw = self.accelerator.unwrap_model(model);
        let mut scores = Vec::new();

        self.progress.on_event(ProgressEvent::EvalStarted { total: expected_steps });

        for (step, batch) in loader.iter(0).enumerate() {
            let batch = batch?;
            self.progress.on_event(ProgressEvent::EvalStep);

            let mut outputs = raw.generate(&batch.input_ids, &batch.input_mask, self.max_seq_len)?;
            outputs.padded_rows = batch.input_ids.padded_rows;

            let outputs = self.accelerator.gather_for_metrics(&outputs)?;
            let targets = self.accelerator.gather_for_metrics(&batch.target_ids)?;

            let candidates = collapse_spaces(tokenizer.decode_batch(&outputs.rows, true));
            let references = collapse_spaces(tokenizer.decode_batch(&targets.rows, true));

            scores.extend(references.iter().zip(&candidates).map(|(r, c)| self.scorer.score(r, c)));
            tracing::trace!(step, expected_steps, scored = scores.len(), "eval step");
        }

        let avg = average(&scores);
        self.progress.on_event(ProgressEvent::EvalFinished { bleu4: avg });
        Ok(avg)
    }
}

/// Decoded text is space-separated per token; scoring compares it unsegmented.
fn collapse_spaces(texts: Vec<String>) -> Vec<String> {
    texts.into_iter().map(|t| t.replace(' ', "")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchRecord, TokenBatch};
    use crate::bleu::SentenceBleu4;
    use crate::backend::{Loss, ParameterState};
    use crate::config::MixedPrecision;
    use crate::dataset::LoaderOptions;
    use crate::progress::NoopProgressSink;
    use std::sync::Arc;

    struct Letters;

    impl Tokenizer for Letters {
        fn token_to_id(&self, _token: &str) -> Option<u32> {
            Some(0)
        }

        fn vocab_size(&self) -> usize {
            27
        }

        fn decode_batch(&self, ids: &[Vec<i64>], _skip: bool) -> Vec<String> {
            ids.iter()
                .map(|row| {
                    row.iter()
                        .filter(|&&id| id > 0)
                        .map(|&id| char::from(b'a' + (id - 1) as u8).to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect()
        }
    }

    /// Every sample is the word "abcd" mapped to itself.
    struct Words {
        len: usize,
    }

    impl Dataset for Words {
        type Tokenizer = Letters;

        fn len(&self) -> usize {
            self.len
        }

        fn collate(&self, indices: &[usize]) -> TrainingResult<BatchRecord> {
            let rows = vec![vec![1, 2, 3, 4]; indices.len()];
            Ok(BatchRecord {
                input_ids: TokenBatch::new(rows.clone()),
                input_mask: TokenBatch::new(vec![vec![1; 4]; indices.len()]),
                target_ids: TokenBatch::new(rows),
            })
        }

        fn tokenizer(&self) -> &Letters {
            &Letters
        }
    }

    /// Echoes its input, or emits nothing when `silent`.
    struct Echo {
        silent: bool,
        params: ParameterState,
    }

    impl Seq2SeqModel for Echo {
        fn forward(&mut self, _b: &BatchRecord, _l: &TokenBatch) -> TrainingResult<Loss> {
            Ok(Loss::new(0.0))
        }

        fn backward(&mut self, _loss: &Loss) -> TrainingResult<()> {
            Ok(())
        }

        fn generate(&self, ids: &TokenBatch, _mask: &TokenBatch, _max: usize) -> TrainingResult<TokenBatch> {
            if self.silent {
                return Ok(TokenBatch::new(vec![Vec::new(); ids.len()]));
            }
            Ok(ids.clone())
        }

        fn parameters(&self) -> &ParameterState {
            &self.params
        }

        fn load_parameters(&mut self, _state: ParameterState) -> TrainingResult<()> {
            Ok(())
        }

        fn params_and_grads(&mut self) -> (&mut ParameterState, &mut ParameterState) {
            unimplemented!("not trained")
        }

        fn zero_grad(&mut self) {}

        fn set_training(&mut self, _training: bool) {}
    }

    fn run(len: usize, silent: bool) -> f64 {
        let accel = Accelerator::single_process(MixedPrecision::No);
        let loader = DataLoader::new(Arc::new(Words { len }), LoaderOptions { batch_size: 2, ..Default::default() })
            .unwrap();
        let loader = accel.prepare_loader(loader).unwrap();
        let model = accel.prepare_model(Echo { silent, params: ParameterState::new() });
        let evaluator = Evaluator::new(&accel, &SentenceBleu4, &NoopProgressSink, 16);
        evaluator.evaluate(&model, &Letters, &loader, loader.num_batches()).unwrap()
    }

    #[test]
    fn test_perfect_outputs_score_one() {
        assert!((run(5, false) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_outputs_score_zero() {
        assert_eq!(run(4, true), 0.0);
    }

    #[test]
    fn test_empty_validation_set_averages_to_zero() {
        assert_eq!(run(0, false), 0.0);
    }

    #[test]
    fn test_collapse_spaces() {
        assert_eq!(collapse_spaces(vec!["a b  c".to_string()]), vec!["abc".to_string()]);
    }
}
