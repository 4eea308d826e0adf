use crate::backend::{Loss, ParameterState, Seq2SeqModel};
use crate::batch::{BatchRecord, TokenBatch};
use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const LEXICON: &str = "lexicon";
const BIAS: &str = "bias";

/// Softmax-output gradients of the last forward pass, one per scored position.
#[derive(Debug)]
struct Pending {
    positions: Vec<(usize, Vec<f32>)>,
    count: usize,
}

/// Position-aligned lexical translation model.
///
/// Target position `t` is predicted from the source token at `t` (the
/// decoder-start token past the end of the source) through a `vocab x vocab`
/// logit table plus a bias. Small enough to train exactly on a CPU.
#[derive(Debug)]
pub struct LexiconModel {
    vocab: usize,
    decoder_start_token_id: u32,
    eos_token_id: u32,
    params: ParameterState,
    grads: ParameterState,
    pending: Option<Pending>,
    training: bool,
}

impl LexiconModel {
    pub fn new(vocab: usize, decoder_start_token_id: u32, eos_token_id: u32, seed: u64) -> TrainingResult<Self> {
        if vocab == 0 {
            return Err(TrainingError::Model("vocabulary is empty".to_string()));
        }
        for id in [decoder_start_token_id, eos_token_id] {
            if id as usize >= vocab {
                return Err(TrainingError::Model(format!("special token id {id} outside vocab of {vocab}")));
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let lexicon = (0..vocab * vocab).map(|_| rng.gen_range(-0.01..0.01)).collect();

        let params = ParameterState::from([(LEXICON.to_string(), lexicon), (BIAS.to_string(), vec![0.0; vocab])]);
        let grads = params.iter().map(|(k, v)| (k.clone(), vec![0.0; v.len()])).collect();

        Ok(Self {
            vocab,
            decoder_start_token_id,
            eos_token_id,
            params,
            grads,
            pending: None,
            training: true,
        })
    }

    #[must_use]
    pub fn is_training(&self) -> bool {
        self.training
    }

    fn token(&self, id: i64) -> TrainingResult<usize> {
        usize::try_from(id)
            .ok()
            .filter(|&id| id < self.vocab)
            .ok_or_else(|| TrainingError::Model(format!("token id {id} outside vocab of {}", self.vocab)))
    }

    fn source_at(&self, batch_ids: &TokenBatch, mask: &TokenBatch, row: usize, pos: usize) -> TrainingResult<usize> {
        let attended = mask.rows.get(row).and_then(|r| r.get(pos)).is_some_and(|&m| m != 0);
        match batch_ids.rows.get(row).and_then(|r| r.get(pos)) {
            Some(&id) if attended => self.token(id),
            _ => Ok(self.decoder_start_token_id as usize),
        }
    }

    fn probabilities(&self, source: usize) -> Vec<f32> {
        let row = &self.params[LEXICON][source * self.vocab..(source + 1) * self.vocab];
        let logits: Vec<f32> = row.iter().zip(&self.params[BIAS]).map(|(w, b)| w + b).collect();
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|z| (z - max).exp()).collect();
        let sum: f32 = exp.iter().sum();
        exp.into_iter().map(|e| e / sum).collect()
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

impl Seq2SeqModel for LexiconModel {
    fn forward(&mut self, batch: &BatchRecord, labels: &TokenBatch) -> TrainingResult<Loss> {
        let mut total = 0.0_f64;
        let mut positions = Vec::new();

        for (row, label_row) in labels.rows.iter().enumerate() {
            for (pos, &label) in label_row.iter().enumerate() {
                if label < 0 {
                    continue;
                }
                let label = self.token(label)?;
                let source = self.source_at(&batch.input_ids, &batch.input_mask, row, pos)?;

                let mut probs = self.probabilities(source);
                total -= f64::from(probs[label].max(1e-12)).ln();
                probs[label] -= 1.0;
                positions.push((source, probs));
            }
        }

        let count = positions.len();
        self.pending = Some(Pending { positions, count });
        Ok(Loss::new(if count == 0 { 0.0 } else { total / count as f64 }))
    }

    fn backward(&mut self, loss: &Loss) -> TrainingResult<()> {
        let pending =
            self.pending.take().ok_or_else(|| TrainingError::Model("backward called without forward".to_string()))?;
        if pending.count == 0 {
            return Ok(());
        }

        let factor = (loss.scale() / pending.count as f64) as f32;
        let vocab = self.vocab;
        for (source, dlogits) in pending.positions {
            if let Some(lexicon) = self.grads.get_mut(LEXICON) {
                for (g, d) in lexicon[source * vocab..(source + 1) * vocab].iter_mut().zip(&dlogits) {
                    *g += factor * d;
                }
            }
            if let Some(bias) = self.grads.get_mut(BIAS) {
                for (g, d) in bias.iter_mut().zip(&dlogits) {
                    *g += factor * d;
                }
            }
        }
        Ok(())
    }

    fn generate(
        &self,
        input_ids: &TokenBatch,
        attention_mask: &TokenBatch,
        max_seq_len: usize,
    ) -> TrainingResult<TokenBatch> {
        let pad = i64::from(self.decoder_start_token_id);
        let mut rows = Vec::with_capacity(input_ids.len());

        for row in 0..input_ids.len() {
            let mut out = Vec::new();
            for pos in 0..max_seq_len {
                let source = self.source_at(input_ids, attention_mask, row, pos)?;
                let next = argmax(&self.probabilities(source)) as u32;
                if next == self.decoder_start_token_id {
                    break;
                }
                out.push(i64::from(next));
                if next == self.eos_token_id {
                    break;
                }
            }
            rows.push(out);
        }

        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        for row in &mut rows {
            row.resize(width, pad);
        }
        Ok(TokenBatch { rows, padded_rows: input_ids.padded_rows })
    }

    fn parameters(&self) -> &ParameterState {
        &self.params
    }

    fn load_parameters(&mut self, state: ParameterState) -> TrainingResult<()> {
        for (name, current) in &self.params {
            match state.get(name) {
                Some(loaded) if loaded.len() == current.len() => {}
                Some(loaded) => {
                    return Err(TrainingError::Model(format!(
                        "parameter `{name}` has {} elements, expected {}",
                        loaded.len(),
                        current.len()
                    )));
                }
                None => return Err(TrainingError::Model(format!("parameter `{name}` missing from state"))),
            }
        }
        if state.len() != self.params.len() {
            return Err(TrainingError::Model("state holds unexpected parameters".to_string()));
        }
        self.params = state;
        Ok(())
    }

    fn params_and_grads(&mut self) -> (&mut ParameterState, &mut ParameterState) {
        (&mut self.params, &mut self.grads)
    }

    fn zero_grad(&mut self) {
        for g in self.grads.values_mut() {
            g.fill(0.0);
        }
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
