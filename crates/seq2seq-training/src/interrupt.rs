//! Cooperative interrupt handling.
//!
//! The signal task only flips a flag. The orchestrator checks it at the top
//! of every step, which is the only place the confirmation prompt runs.

use crate::error::{TrainingError, TrainingResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shared between the signal watcher and the training run.
#[derive(Debug, Default)]
pub struct InterruptState {
    active: AtomicBool,
    pending: AtomicBool,
}

impl InterruptState {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Record an interrupt. Returns `false` when no run is active, in which
    /// case the caller should terminate immediately.
    pub fn request(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.pending.store(true, Ordering::SeqCst);
        true
    }

    /// Consume a pending interrupt.
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Mark a run active until the returned guard drops.
    #[must_use]
    pub fn activate(self: &Arc<Self>) -> ActiveRun {
        self.pending.store(false, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        ActiveRun { state: Arc::clone(self) }
    }
}

#[derive(Debug)]
pub struct ActiveRun {
    state: Arc<InterruptState>,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.state.active.store(false, Ordering::SeqCst);
        self.state.pending.store(false, Ordering::SeqCst);
    }
}

/// Forward Ctrl-C into `state`. Exits the process with status 0 when no run
/// is active. Must be called from within a tokio runtime.
pub fn install_ctrl_c(state: Arc<InterruptState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("unable to listen for ctrl-c, interrupts disabled");
                return;
            }
            if !state.request() {
                std::process::exit(0);
            }
        }
    })
}

pub trait ConfirmPrompt: Send {
    fn confirm(&mut self, message: &str) -> TrainingResult<bool>;
}

/// Interactive yes/no on the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct InquirePrompt;

impl ConfirmPrompt for InquirePrompt {
    fn confirm(&mut self, message: &str) -> TrainingResult<bool> {
        inquire::Confirm::new(message)
            .with_default(false)
            .prompt()
            .map_err(|e| TrainingError::Interrupted(e.to_string()))
    }
}

/// Test double: replays fixed answers, then declines, recording each prompt.
#[derive(Debug, Default, Clone)]
pub struct ScriptedPrompt {
    answers: Arc<Mutex<VecDeque<bool>>>,
    asked: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPrompt {
    #[must_use]
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self { answers: Arc::new(Mutex::new(answers.into_iter().collect())), asked: Arc::default() }
    }

    /// Prompts shown so far, shared across clones.
    #[must_use]
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().map(|asked| asked.clone()).unwrap_or_default()
    }
}

impl ConfirmPrompt for ScriptedPrompt {
    fn confirm(&mut self, message: &str) -> TrainingResult<bool> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(message.to_string());
        }
        let mut answers =
            self.answers.lock().map_err(|_| TrainingError::Interrupted("prompt state poisoned".to_string()))?;
        Ok(answers.pop_front().unwrap_or(false))
    }
}
