//! A complete, CPU-only backend: character tokenizer, JSONL dataset and a
//! lexical translation model. Enough to drive the orchestrator end to end.

pub mod dataset;
pub mod model;
pub mod tokenizer;

pub use dataset::{JsonlDataset, PromptResponse};
pub use model::LexiconModel;
pub use tokenizer::{CharTokenizer, EOS_ID, EOS_TOKEN, PAD_TOKEN, UNK_TOKEN};

use crate::backend::{Backend, BleuScorer, DatasetOptions, Optimizer};
use crate::bleu::SentenceBleu4;
use crate::config::ModelConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::optimizer::Adafactor;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceBackend;

impl Backend for ReferenceBackend {
    type Tokenizer = CharTokenizer;
    type Dataset = JsonlDataset;
    type Model = LexiconModel;

    fn load_dataset(&self, options: &DatasetOptions) -> TrainingResult<JsonlDataset> {
        JsonlDataset::open(options)
    }

    fn build_model(&self, config: &ModelConfig, decoder_start_token_id: u32, seed: u64) -> TrainingResult<LexiconModel> {
        let vocab = config
            .vocab_size
            .ok_or_else(|| TrainingError::InvalidConfig("vocab_size must be set before building the model".to_string()))?;
        tracing::debug!(vocab, d_model = config.d_model, "building lexicon model, architecture dims unused");
        LexiconModel::new(vocab, decoder_start_token_id, EOS_ID, seed)
    }

    fn build_optimizer(&self, learn_rate: f64) -> Box<dyn Optimizer> {
        Box::new(Adafactor::new(learn_rate))
    }

    fn bleu_scorer(&self) -> Box<dyn BleuScorer> {
        Box::new(SentenceBleu4)
    }
}
