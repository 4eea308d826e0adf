//! The training orchestrator: epoch/step loop, gradient accumulation,
//! checkpointing, evaluation scheduling and interrupt handling.

use crate::backend::{Backend, Dataset, DatasetOptions, Optimizer, Seq2SeqModel, Tokenizer};
use crate::bleu::average;
use crate::checkpoint::{CheckpointManager, CheckpointTag};
use crate::config::{ModelConfig, TrainConfig};
use crate::dataset::{DataLoader, LoaderOptions};
use crate::distributed::{Accelerator, DistributedModel};
use crate::error::{TrainingError, TrainingResult};
use crate::evaluator::Evaluator;
use crate::interrupt::{ConfirmPrompt, InquirePrompt, InterruptState};
use crate::logging::RunLogger;
use crate::progress::{BarProgressSink, NoopProgressSink, ProgressEvent, ProgressSink};
use crate::resources::{LoaderPolicy, Platform, ResourceProbe, SystemProbe};
use crate::scheduler::OneCycleLr;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Token whose id doubles as padding and decoder start.
pub const DECODER_START_TOKEN: &str = "[PAD]";

const EXIT_PROMPT: &str = "are you sure to exit this process?";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Initializing,
    TrainingEpoch { epoch: usize },
    Evaluating { epoch: usize },
    Checkpointing { epoch: usize },
    InterruptRequested,
    Interrupted,
    Done,
    Failed(String),
}

/// Mutable bookkeeping for one `train()` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    pub best_bleu4: f64,
    pub best_epoch: Option<usize>,
    /// Loss samples taken at the logging cadence during the current epoch.
    pub loss_history: Vec<f64>,
    pub optimizer_steps: u64,
}

impl TrainingState {
    /// Record an epoch's score. The best score follows `>=`; the best epoch
    /// moves only on a strict improvement, so the first epoch to reach a
    /// score keeps it. Returns whether the epoch qualifies for a best save.
    pub fn record_bleu4(&mut self, epoch: usize, bleu4: f64) -> bool {
        if bleu4 < self.best_bleu4 {
            return false;
        }
        if self.best_epoch.is_none() || bleu4 > self.best_bleu4 {
            self.best_epoch = Some(epoch);
        }
        self.best_bleu4 = bleu4;
        true
    }
}

/// Optimizer updates happen on these step indices only.
#[must_use]
pub fn is_accumulation_boundary(step: usize, accumulation_steps: usize) -> bool {
    step % accumulation_steps.max(1) == 0
}

/// Ticks the step bar receives per epoch: every `log_interval`-th step plus
/// the last step when it falls between intervals.
#[must_use]
pub fn logged_steps_per_epoch(steps_per_epoch: usize, log_interval: usize) -> usize {
    if steps_per_epoch == 0 {
        return 0;
    }
    let interval = log_interval.max(1);
    let last_step = steps_per_epoch - 1;
    last_step / interval + 1 + usize::from(last_step % interval != 0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub avg_loss: f64,
    pub bleu4: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrainOutcome {
    Completed,
    /// Stopped by a confirmed interrupt. `path` is set on the main process.
    Interrupted { tag: String, path: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub outcome: TrainOutcome,
    pub best_epoch: usize,
    pub best_bleu4: f64,
    pub optimizer_steps: u64,
    pub epochs: Vec<EpochSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub dataset_size: usize,
    pub avg_bleu4: f64,
}

/// Everything a training step needs, built once per run.
struct Prepared<B: Backend> {
    model: DistributedModel<B::Model>,
    optimizer: Box<dyn Optimizer>,
    scheduler: OneCycleLr,
    train_loader: DataLoader<B::Dataset>,
    valid_loader: DataLoader<B::Dataset>,
    decoder_start_token_id: u32,
}

pub struct TrainingOrchestrator<B: Backend> {
    backend: B,
    train_config: TrainConfig,
    model_config: ModelConfig,
    accelerator: Accelerator,
    interrupt: Arc<InterruptState>,
    prompt: Box<dyn ConfirmPrompt>,
    progress: Option<Arc<dyn ProgressSink>>,
    probe: Box<dyn ResourceProbe + Send>,
    platform: Platform,
    logger: RunLogger,
    phase: RunPhase,
}

impl<B: Backend> std::fmt::Debug for TrainingOrchestrator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingOrchestrator")
            .field("accelerator", &self.accelerator)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> TrainingOrchestrator<B> {
    pub fn new(
        backend: B,
        train_config: TrainConfig,
        model_config: ModelConfig,
        accelerator: Accelerator,
    ) -> TrainingResult<Self> {
        train_config.validate()?;
        model_config.validate()?;
        let logger = RunLogger::for_process(&accelerator);
        Ok(Self {
            backend,
            train_config,
            model_config,
            accelerator,
            interrupt: InterruptState::new(),
            prompt: Box::new(InquirePrompt),
            progress: None,
            probe: Box::new(SystemProbe::default()),
            platform: Platform::current(),
            logger,
            phase: RunPhase::Idle,
        })
    }

    /// Share interrupt state with a signal watcher and choose how to confirm.
    #[must_use]
    pub fn with_interrupt(mut self, state: Arc<InterruptState>, prompt: Box<dyn ConfirmPrompt>) -> Self {
        self.interrupt = state;
        self.prompt = prompt;
        self
    }

    /// Replace the terminal bars drawn by the main process.
    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Box<dyn ResourceProbe + Send>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    #[must_use]
    pub fn accelerator(&self) -> &Accelerator {
        &self.accelerator
    }

    fn set_phase(&mut self, phase: RunPhase) {
        tracing::debug!(rank = self.accelerator.process_index(), ?phase, "phase change");
        self.phase = phase;
    }

    fn progress_sink(&self, epochs: usize, step_ticks: usize) -> Arc<dyn ProgressSink> {
        if !self.accelerator.is_main_process() {
            return Arc::new(NoopProgressSink);
        }
        match &self.progress {
            Some(sink) => Arc::clone(sink),
            None => Arc::new(BarProgressSink::new(epochs, step_ticks)),
        }
    }

    fn dataset_options(&self, path: PathBuf, keep_in_memory: bool) -> DatasetOptions {
        DatasetOptions {
            path,
            tokenizer_file: self.train_config.tokenizer_file.clone(),
            keep_in_memory,
            max_seq_len: self.train_config.max_seq_len,
        }
    }

    /// Run every configured epoch, or until a confirmed interrupt.
    ///
    /// On failure this rank aborts its process group so peers blocked in a
    /// collective fail too instead of hanging.
    pub fn train(&mut self) -> TrainingResult<TrainReport> {
        let _active = self.accelerator.is_main_process().then(|| self.interrupt.activate());

        let result = self.run_training();
        match &result {
            Ok(report) => {
                let phase = match report.outcome {
                    TrainOutcome::Completed => RunPhase::Done,
                    TrainOutcome::Interrupted { .. } => RunPhase::Interrupted,
                };
                self.set_phase(phase);
            }
            Err(err) => {
                tracing::error!(rank = self.accelerator.process_index(), error = %err, "training failed");
                self.accelerator.abort();
                self.set_phase(RunPhase::Failed(err.to_string()));
            }
        }
        result
    }

    fn prepare(&mut self) -> TrainingResult<Prepared<B>> {
        self.set_phase(RunPhase::Initializing);
        let cfg = self.train_config.clone();
        let log = self.logger;

        let snapshot = self.probe.probe()?;
        let policy = LoaderPolicy::from_snapshot(&snapshot, self.platform);
        log.info(
            &format!(
                "cpu memory available: {:.2} GB, disk space available: {:.2} GB, keep dataset in memory: {}.",
                snapshot.available_memory_gb, snapshot.available_disk_gb, policy.keep_in_memory
            ),
            true,
            true,
        );
        log.info("loading datasets ...", true, false);

        let train_dataset =
            Arc::new(self.backend.load_dataset(&self.dataset_options(cfg.train_file.clone(), policy.keep_in_memory))?);
        let valid_dataset = Arc::new(
            self.backend.load_dataset(&self.dataset_options(cfg.validation_file.clone(), policy.keep_in_memory))?,
        );
        let train_len = train_dataset.len();
        log.info(
            &format!(
                "train dataset size: {}, validation dataset size: {}, pin_memory: {}, num_workers: {}.",
                train_len,
                valid_dataset.len(),
                policy.pin_memory,
                policy.num_workers
            ),
            true,
            true,
        );

        let loader_options = LoaderOptions {
            batch_size: cfg.batch_size_per_gpu,
            shuffle: true,
            seed: cfg.seed,
            num_workers: policy.num_workers,
            pin_memory: policy.pin_memory,
        };
        let train_loader = DataLoader::new(Arc::clone(&train_dataset), loader_options.clone())?;
        let valid_loader = DataLoader::new(Arc::clone(&valid_dataset), LoaderOptions { shuffle: false, ..loader_options })?;

        log.info(
            &format!(
                "using device: {}, processes: {}, mixed precision: {}",
                self.accelerator.device(),
                self.accelerator.process_count(),
                self.accelerator.mixed_precision()
            ),
            true,
            true,
        );

        let tokenizer = train_dataset.tokenizer();
        let decoder_start_token_id = tokenizer.token_to_id(DECODER_START_TOKEN).ok_or_else(|| {
            TrainingError::Dataset(format!("tokenizer has no `{DECODER_START_TOKEN}` token"))
        })?;
        self.model_config = self.model_config.with_vocab_size(tokenizer.vocab_size())?;

        let model = self.backend.build_model(&self.model_config, decoder_start_token_id, cfg.seed)?;
        if self.accelerator.is_main_process() {
            self.model_config.save_diff(&cfg.model_config_file)?;
        }

        let mut optimizer = self.backend.build_optimizer(cfg.learn_rate);
        let scheduler = OneCycleLr::new(
            cfg.div_factor * cfg.learn_rate,
            cfg.epochs,
            OneCycleLr::steps_per_epoch(train_len, cfg.batch_size_per_gpu, cfg.gradient_accumulation_steps),
            cfg.div_factor,
        )?;
        optimizer.set_learning_rate(scheduler.learning_rate());

        Ok(Prepared {
            model: self.accelerator.prepare_model(model),
            optimizer,
            scheduler,
            train_loader: self.accelerator.prepare_loader(train_loader)?,
            valid_loader: self.accelerator.prepare_loader(valid_loader)?,
            decoder_start_token_id,
        })
    }

    /// Main process only: consume a pending interrupt and ask whether to stop.
    fn main_wants_exit(&mut self) -> bool {
        if !self.accelerator.is_main_process() || !self.interrupt.take_pending() {
            return false;
        }
        self.set_phase(RunPhase::InterruptRequested);
        match self.prompt.confirm(EXIT_PROMPT) {
            Ok(true) => true,
            Ok(false) => {
                self.accelerator.print("do nothing, training continues.");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "interrupt confirmation failed, training continues");
                false
            }
        }
    }

    fn run_training(&mut self) -> TrainingResult<TrainReport> {
        let Prepared { mut model, mut optimizer, mut scheduler, train_loader, valid_loader, decoder_start_token_id } =
            self.prepare()?;

        let cfg = self.train_config.clone();
        let log = self.logger;
        let accel = self.accelerator.clone();
        let checkpoints = CheckpointManager::new(cfg.model_file.clone())?;
        let scorer = self.backend.bleu_scorer();

        let effective_batch_size = if accel.process_count() > 1 {
            cfg.batch_size_per_gpu * accel.process_count()
        } else {
            cfg.batch_size_per_gpu
        };
        let steps_per_epoch = train_loader.num_batches();
        let eval_steps = valid_loader.num_batches();
        let last_step = steps_per_epoch.saturating_sub(1);
        tracing::info!(effective_batch_size, steps_per_epoch, eval_steps, "training loop configured");

        let progress = self.progress_sink(cfg.epochs, logged_steps_per_epoch(steps_per_epoch, cfg.log_interval));
        let tokenizer = valid_loader.dataset().tokenizer();
        let evaluator = Evaluator::new(&accel, scorer.as_ref(), progress.as_ref(), cfg.max_seq_len);

        let mut state = TrainingState::default();
        let mut summaries = Vec::with_capacity(cfg.epochs);

        for epoch in 0..cfg.epochs {
            state.epoch = epoch;
            state.loss_history.clear();
            self.set_phase(RunPhase::TrainingEpoch { epoch });
            progress.on_event(ProgressEvent::EpochStarted { epoch });
            model.train();

            for (step, batch) in train_loader.iter(epoch).enumerate() {
                let wants_exit = self.main_wants_exit();
                if accel.broadcast_flag(wants_exit)? {
                    return self.exit_save(&checkpoints, &model, &state, summaries);
                }
                self.set_phase(RunPhase::TrainingEpoch { epoch });

                let batch = batch?;
                let labels = batch.masked_labels(decoder_start_token_id);
                let loss = model.forward(&batch, &labels)?;
                accel.backward(&mut model, &loss.div(cfg.gradient_accumulation_steps))?;

                if is_accumulation_boundary(step, cfg.gradient_accumulation_steps) {
                    let grad_norm = accel.clip_grad_norm(&mut model, cfg.max_grad_norm);
                    optimizer.step(model.replica_mut())?;
                    let lr = scheduler.step();
                    optimizer.set_learning_rate(lr);
                    optimizer.zero_grad(model.replica_mut());
                    state.optimizer_steps += 1;
                    tracing::trace!(epoch, step, grad_norm, lr, "optimizer step");
                }

                if step % cfg.log_interval == 0 || step == last_step {
                    let value = loss.value();
                    state.loss_history.push(value);
                    log.info(
                        &format!("training loss: epoch:{epoch}, step:{step}, loss:{value}, device:{}", accel.device()),
                        false,
                        true,
                    );
                    progress.on_event(ProgressEvent::Step { step, steps_per_epoch, loss: value });
                }
            }

            self.set_phase(RunPhase::Checkpointing { epoch });
            checkpoints.save(&accel, &model, &CheckpointTag::Epoch(epoch))?;
            if accel.is_main_process() {
                let removed = checkpoints.prune(epoch, cfg.keep_latest_n_ckp)?;
                if !removed.is_empty() {
                    tracing::info!(removed = removed.len(), keep = cfg.keep_latest_n_ckp, "pruned old checkpoints");
                }
            }

            self.set_phase(RunPhase::Evaluating { epoch });
            model.eval();
            let bleu4 = evaluator.evaluate(&model, tokenizer, &valid_loader, eval_steps)?;

            if state.record_bleu4(epoch, bleu4) {
                self.set_phase(RunPhase::Checkpointing { epoch });
                checkpoints.save(&accel, &model, &CheckpointTag::Epoch(epoch))?;
            }

            let avg_loss = average(&state.loss_history);
            let best_epoch = state.best_epoch.unwrap_or(0);
            log.print_and_log(
                &accel,
                &format!(
                    "epoch log: epoch:{epoch}, avg_loss:{avg_loss}, cur_bleu4:{bleu4}, best_bleu4:{}, best_epoch:{best_epoch}",
                    state.best_bleu4
                ),
            );
            progress.on_event(ProgressEvent::EpochFinished {
                epoch,
                epochs: cfg.epochs,
                avg_loss,
                best_epoch,
                best_bleu4: state.best_bleu4,
            });
            summaries.push(EpochSummary { epoch, avg_loss, bleu4 });
            state.loss_history.clear();
        }

        // Catch an interrupt raised during the last checkpoint or evaluation.
        let wants_exit = self.main_wants_exit();
        if accel.broadcast_flag(wants_exit)? {
            return self.exit_save(&checkpoints, &model, &state, summaries);
        }

        progress.on_event(ProgressEvent::Finished);
        Ok(TrainReport {
            outcome: TrainOutcome::Completed,
            best_epoch: state.best_epoch.unwrap_or(0),
            best_bleu4: state.best_bleu4,
            optimizer_steps: state.optimizer_steps,
            epochs: summaries,
        })
    }

    fn exit_save(
        &mut self,
        checkpoints: &CheckpointManager,
        model: &DistributedModel<B::Model>,
        state: &TrainingState,
        summaries: Vec<EpochSummary>,
    ) -> TrainingResult<TrainReport> {
        let tag = CheckpointTag::exit_now();
        let path = checkpoints.save(&self.accelerator, model, &tag)?;
        self.accelerator.print("model checkpoint has been saved!");
        if let Some(path) = &path {
            self.logger.info(&format!("exit checkpoint saved to {}", path.display()), false, true);
        }

        Ok(TrainReport {
            outcome: TrainOutcome::Interrupted { tag: tag.to_string(), path },
            best_epoch: state.best_epoch.unwrap_or(0),
            best_bleu4: state.best_bleu4,
            optimizer_steps: state.optimizer_steps,
            epochs: summaries,
        })
    }

    /// Score the checkpoint saved for `best_epoch` against the test set.
    pub fn test(&mut self, best_epoch: usize) -> TrainingResult<TestReport> {
        let result = self.run_test(best_epoch);
        if let Err(err) = &result {
            tracing::error!(rank = self.accelerator.process_index(), error = %err, "test failed");
            self.accelerator.abort();
        }
        result
    }

    fn run_test(&mut self, best_epoch: usize) -> TrainingResult<TestReport> {
        let cfg = self.train_config.clone();
        let log = self.logger;
        let accel = self.accelerator.clone();

        let dataset = Arc::new(self.backend.load_dataset(&self.dataset_options(cfg.test_file.clone(), true))?);
        let dataset_size = dataset.len();
        log.info(&format!("test dataset size: {dataset_size}."), true, true);

        let restricted = self.platform.is_restricted();
        let loader = DataLoader::new(
            Arc::clone(&dataset),
            LoaderOptions {
                batch_size: cfg.batch_size_per_gpu,
                shuffle: false,
                seed: cfg.seed,
                num_workers: usize::from(!restricted),
                pin_memory: !restricted,
            },
        )?;
        log.info(&format!("using device: {}", accel.device()), true, true);

        let tokenizer = dataset.tokenizer();
        let decoder_start_token_id = tokenizer.token_to_id(DECODER_START_TOKEN).ok_or_else(|| {
            TrainingError::Dataset(format!("tokenizer has no `{DECODER_START_TOKEN}` token"))
        })?;
        self.model_config = self.model_config.with_vocab_size(tokenizer.vocab_size())?;

        let mut model = self.backend.build_model(&self.model_config, decoder_start_token_id, cfg.seed)?;
        let checkpoints = CheckpointManager::new(cfg.model_file.clone())?;
        model.load_parameters(checkpoints.load(&CheckpointTag::Epoch(best_epoch))?)?;

        let mut model = accel.prepare_model(model);
        let loader = accel.prepare_loader(loader)?;
        model.eval();

        let progress: Arc<dyn ProgressSink> = if !accel.is_main_process() {
            Arc::new(NoopProgressSink)
        } else if let Some(sink) = &self.progress {
            Arc::clone(sink)
        } else {
            Arc::new(BarProgressSink::for_evaluation())
        };
        let scorer = self.backend.bleu_scorer();
        let evaluator = Evaluator::new(&accel, scorer.as_ref(), progress.as_ref(), cfg.max_seq_len);
        let avg_bleu4 = evaluator.evaluate(&model, tokenizer, &loader, loader.num_batches())?;

        log.info(&format!("test_dataset_size: {dataset_size}, avg_bleu4_score:{avg_bleu4}."), true, true);
        Ok(TestReport { dataset_size, avg_bleu4 })
    }
}
