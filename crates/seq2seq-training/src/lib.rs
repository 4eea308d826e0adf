//! Seq2Seq Training
//!
//! Supervised training driver for encoder-decoder text models:
//! - Resource-aware data loading (`ResourceProbe`, `DataLoader`)
//! - Single- and multi-rank execution (`Accelerator`, `Collective`)
//! - Checkpoint save/load/prune (`CheckpointManager`)
//! - BLEU-4 evaluation (`Evaluator`)
//! - The epoch/step loop with gradient accumulation, one-cycle LR and
//!   interactive interrupt handling (`TrainingOrchestrator`)
//!
//! The model, tokenizer and dataset are collaborators behind the traits in
//! [`backend`]; [`reference`] provides a small CPU implementation of each.

pub mod backend;
pub mod batch;
pub mod bleu;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod distributed;
pub mod error;
pub mod evaluator;
pub mod interrupt;
pub mod logging;
pub mod optimizer;
pub mod progress;
pub mod reference;
pub mod resources;
pub mod scheduler;
pub mod trainer;

pub use backend::{Backend, BleuScorer, Dataset, DatasetOptions, Loss, Optimizer, ParameterState, Seq2SeqModel, Tokenizer};
pub use batch::{BatchRecord, TokenBatch, IGNORE_INDEX};
pub use bleu::{average, SentenceBleu4};
pub use checkpoint::{CheckpointManager, CheckpointTag};
pub use config::{MixedPrecision, ModelConfig, RunConfig, TrainConfig};
pub use dataset::{DataLoader, LoaderOptions};
pub use distributed::{Accelerator, Collective, Device, DeviceKind, DistributedModel, ProcessGroup, SingleProcess};
pub use error::{TrainingError, TrainingResult};
pub use evaluator::Evaluator;
pub use interrupt::{install_ctrl_c, ConfirmPrompt, InquirePrompt, InterruptState, ScriptedPrompt};
pub use logging::{init_logging, RunLogger};
pub use optimizer::Adafactor;
pub use progress::{BarProgressSink, NoopProgressSink, ProgressEvent, ProgressSink};
pub use reference::ReferenceBackend;
pub use resources::{LoaderPolicy, Platform, ResourceProbe, ResourceSnapshot, SystemProbe};
pub use scheduler::OneCycleLr;
pub use trainer::{RunPhase, TestReport, TrainOutcome, TrainReport, TrainingOrchestrator, TrainingState};
