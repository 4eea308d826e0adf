//! Single- and multi-rank execution behind one interface.
//!
//! `Collective` is the transport: barrier, gather, gradient all-reduce and a
//! rank-0 flag broadcast. `Accelerator` layers the training-facing
//! operations on top of it so the orchestrator never branches on world size.
//!
//! Every rank must issue the same collectives in the same order. A rank that
//! fails calls `abort`, which releases every waiting peer with an error
//! instead of leaving them blocked.

use crate::backend::{Dataset, Loss, ParameterState, Seq2SeqModel};
use crate::batch::{BatchRecord, TokenBatch};
use crate::config::MixedPrecision;
use crate::dataset::DataLoader;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
    Metal,
}

/// Device a rank computes on. Stable for the life of the rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub ordinal: usize,
}

impl Device {
    #[must_use]
    pub fn cpu() -> Self {
        Self { kind: DeviceKind::Cpu, ordinal: 0 }
    }

    /// One device slot per rank; CPU ranks share ordinal 0.
    #[must_use]
    pub fn for_rank(kind: DeviceKind, rank: usize) -> Self {
        match kind {
            DeviceKind::Cpu => Self::cpu(),
            _ => Self { kind, ordinal: rank },
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            DeviceKind::Cpu => f.write_str("cpu"),
            DeviceKind::Cuda => write!(f, "cuda:{}", self.ordinal),
            DeviceKind::Metal => write!(f, "mps:{}", self.ordinal),
        }
    }
}

pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn barrier(&self) -> TrainingResult<()>;

    /// Every rank's `local`, indexed by rank.
    fn all_gather(&self, local: &TokenBatch) -> TrainingResult<Vec<TokenBatch>>;

    /// Replace each tensor with its element-wise mean across ranks.
    fn all_reduce_mean(&self, tensors: &mut ParameterState) -> TrainingResult<()>;

    /// Rank 0's `value`, seen by every rank.
    fn broadcast_flag(&self, value: bool) -> TrainingResult<bool>;

    /// Fail all pending and future collectives on every rank.
    fn abort(&self);
}

/// The world of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> TrainingResult<()> {
        Ok(())
    }

    fn all_gather(&self, local: &TokenBatch) -> TrainingResult<Vec<TokenBatch>> {
        Ok(vec![local.clone()])
    }

    fn all_reduce_mean(&self, _tensors: &mut ParameterState) -> TrainingResult<()> {
        Ok(())
    }

    fn broadcast_flag(&self, value: bool) -> TrainingResult<bool> {
        Ok(value)
    }

    fn abort(&self) {}
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// A reusable barrier that can be torn down while ranks are waiting on it.
#[derive(Debug)]
pub struct CancellableBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl CancellableBarrier {
    #[must_use]
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(BarrierState { arrived: 0, generation: 0, aborted: false }),
            cvar: Condvar::new(),
        }
    }

    pub fn wait(&self) -> TrainingResult<()> {
        let mut state = self.lock()?;
        if state.aborted {
            return Err(aborted());
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cvar.notify_all();
            return Ok(());
        }

        while state.generation == generation && !state.aborted {
            state = self.cvar.wait(state).map_err(|_| poisoned())?;
        }

        if state.generation == generation { Err(aborted()) } else { Ok(()) }
    }

    pub fn abort(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.aborted = true;
        }
        self.cvar.notify_all();
    }

    fn lock(&self) -> TrainingResult<MutexGuard<'_, BarrierState>> {
        self.state.lock().map_err(|_| poisoned())
    }
}

fn aborted() -> TrainingError {
    TrainingError::Collective("process group aborted by a peer rank".to_string())
}

fn poisoned() -> TrainingError {
    TrainingError::Collective("process group state poisoned".to_string())
}

#[derive(Debug)]
struct GroupShared {
    world_size: usize,
    barrier: CancellableBarrier,
    gather_slots: Mutex<Vec<Option<TokenBatch>>>,
    reduce_slots: Mutex<Vec<Option<ParameterState>>>,
    flag: Mutex<bool>,
}

/// One rank of an in-process group: every rank runs on its own thread and
/// exchanges data through shared slots fenced by a [`CancellableBarrier`].
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    rank: usize,
    shared: Arc<GroupShared>,
}

impl ProcessGroup {
    /// Handles for ranks `0..world_size`, in rank order.
    #[must_use]
    pub fn new(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let shared = Arc::new(GroupShared {
            world_size,
            barrier: CancellableBarrier::new(world_size),
            gather_slots: Mutex::new(vec![None; world_size]),
            reduce_slots: Mutex::new(vec![None; world_size]),
            flag: Mutex::new(false),
        });
        (0..world_size).map(|rank| Self { rank, shared: Arc::clone(&shared) }).collect()
    }
}

impl Collective for ProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> TrainingResult<()> {
        self.shared.barrier.wait()
    }

    fn all_gather(&self, local: &TokenBatch) -> TrainingResult<Vec<TokenBatch>> {
        {
            let mut slots = self.shared.gather_slots.lock().map_err(|_| poisoned())?;
            slots[self.rank] = Some(local.clone());
        }
        self.barrier()?;

        let gathered = {
            let slots = self.shared.gather_slots.lock().map_err(|_| poisoned())?;
            slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.clone().ok_or_else(|| {
                        TrainingError::Collective(format!("rank {rank} did not contribute to gather"))
                    })
                })
                .collect::<TrainingResult<Vec<_>>>()
        };
        // Nobody may overwrite a slot until every rank has read them all.
        self.barrier()?;
        gathered
    }

    fn all_reduce_mean(&self, tensors: &mut ParameterState) -> TrainingResult<()> {
        {
            let mut slots = self.shared.reduce_slots.lock().map_err(|_| poisoned())?;
            slots[self.rank] = Some(tensors.clone());
        }
        self.barrier()?;

        let reduced = {
            let slots = self.shared.reduce_slots.lock().map_err(|_| poisoned())?;
            mean_of_slots(&slots)
        };
        self.barrier()?;

        *tensors = reduced?;
        Ok(())
    }

    fn broadcast_flag(&self, value: bool) -> TrainingResult<bool> {
        if self.rank == 0 {
            *self.shared.flag.lock().map_err(|_| poisoned())? = value;
        }
        self.barrier()?;
        let value = *self.shared.flag.lock().map_err(|_| poisoned())?;
        self.barrier()?;
        Ok(value)
    }

    fn abort(&self) {
        self.shared.barrier.abort();
    }
}

fn mean_of_slots(slots: &[Option<ParameterState>]) -> TrainingResult<ParameterState> {
    let states = slots
        .iter()
        .enumerate()
        .map(|(rank, slot)| {
            slot.as_ref().ok_or_else(|| {
                TrainingError::Collective(format!("rank {rank} did not contribute to all-reduce"))
            })
        })
        .collect::<TrainingResult<Vec<_>>>()?;

    let Some((first, rest)) = states.split_first() else {
        return Ok(ParameterState::new());
    };

    let count = states.len() as f32;
    let mut out = ParameterState::new();
    for (name, values) in first.iter() {
        let mut sum = values.clone();
        for other in rest {
            let peer = other.get(name).filter(|p| p.len() == values.len()).ok_or_else(|| {
                TrainingError::Collective(format!("tensor `{name}` differs in shape across ranks"))
            })?;
            for (acc, v) in sum.iter_mut().zip(peer) {
                *acc += v;
            }
        }
        for acc in &mut sum {
            *acc /= count;
        }
        out.insert(name.clone(), sum);
    }
    Ok(out)
}

/// A model replica prepared for distributed execution.
///
/// The raw model is only reachable through [`Accelerator::unwrap_model`],
/// or mutably for the optimizer step via [`DistributedModel::replica_mut`].
#[derive(Debug)]
pub struct DistributedModel<M> {
    inner: M,
    rank: usize,
}

impl<M: Seq2SeqModel> DistributedModel<M> {
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn train(&mut self) {
        self.inner.set_training(true);
    }

    pub fn eval(&mut self) {
        self.inner.set_training(false);
    }

    pub fn forward(
        &mut self,
        batch: &BatchRecord,
        labels: &TokenBatch,
    ) -> TrainingResult<Loss> {
        self.inner.forward(batch, labels)
    }

    /// The rank-local replica, for the optimizer step inside a training step.
    pub fn replica_mut(&mut self) -> &mut M {
        &mut self.inner
    }
}

/// Training-facing view of the distributed runtime.
#[derive(Clone)]
pub struct Accelerator {
    comm: Arc<dyn Collective>,
    device: Device,
    mixed_precision: MixedPrecision,
}

impl std::fmt::Debug for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accelerator")
            .field("rank", &self.comm.rank())
            .field("world_size", &self.comm.world_size())
            .field("device", &self.device)
            .field("mixed_precision", &self.mixed_precision)
            .finish()
    }
}

impl Accelerator {
    #[must_use]
    pub fn new(comm: Arc<dyn Collective>, device: Device, mixed_precision: MixedPrecision) -> Self {
        Self { comm, device, mixed_precision }
    }

    #[must_use]
    pub fn single_process(mixed_precision: MixedPrecision) -> Self {
        Self::new(Arc::new(SingleProcess), Device::cpu(), mixed_precision)
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn mixed_precision(&self) -> MixedPrecision {
        self.mixed_precision
    }

    #[must_use]
    pub fn is_main_process(&self) -> bool {
        self.comm.rank() == 0
    }

    #[must_use]
    pub fn process_index(&self) -> usize {
        self.comm.rank()
    }

    #[must_use]
    pub fn process_count(&self) -> usize {
        self.comm.world_size()
    }

    /// Wrap a freshly built model. Consumes it so it cannot be prepared twice.
    pub fn prepare_model<M: Seq2SeqModel>(&self, model: M) -> DistributedModel<M> {
        DistributedModel { inner: model, rank: self.comm.rank() }
    }

    /// Shard a loader so each rank sees a disjoint slice of every global batch.
    pub fn prepare_loader<D: Dataset + 'static>(
        &self,
        loader: DataLoader<D>,
    ) -> TrainingResult<DataLoader<D>> {
        loader.shard(self.comm.rank(), self.comm.world_size())
    }

    /// Populate gradients from `loss`, averaging them across ranks.
    pub fn backward<M: Seq2SeqModel>(
        &self,
        model: &mut DistributedModel<M>,
        loss: &Loss,
    ) -> TrainingResult<()> {
        model.inner.backward(loss)?;
        if self.comm.world_size() > 1 {
            let (_, grads) = model.inner.params_and_grads();
            self.comm.all_reduce_mean(grads)?;
        }
        Ok(())
    }

    /// Scale gradients so their global L2 norm is at most `max_norm`.
    /// Returns the norm measured before clipping.
    pub fn clip_grad_norm<M: Seq2SeqModel>(&self, model: &mut DistributedModel<M>, max_norm: f64) -> f64 {
        let (_, grads) = model.inner.params_and_grads();
        clip_grad_norm(grads, max_norm)
    }

    pub fn barrier(&self) -> TrainingResult<()> {
        self.comm.barrier()
    }

    /// Concatenate every rank's real rows in rank order.
    pub fn gather_for_metrics(&self, local: &TokenBatch) -> TrainingResult<TokenBatch> {
        let shards = self.comm.all_gather(local)?;
        let rows = shards.iter().flat_map(|shard| shard.valid_rows().iter().cloned()).collect();
        Ok(TokenBatch::new(rows))
    }

    /// Rank 0's decision, agreed on by every rank.
    pub fn broadcast_flag(&self, value: bool) -> TrainingResult<bool> {
        self.comm.broadcast_flag(value)
    }

    #[must_use]
    pub fn unwrap_model<'a, M>(&self, model: &'a DistributedModel<M>) -> &'a M {
        &model.inner
    }

    /// Print once across all ranks.
    pub fn print(&self, msg: &str) {
        if self.is_main_process() {
            println!("{msg}");
        }
    }

    pub fn abort(&self) {
        self.comm.abort();
    }
}

pub(crate) fn clip_grad_norm(grads: &mut ParameterState, max_norm: f64) -> f64 {
    let total_norm = grads
        .values()
        .flat_map(|g| g.iter())
        .map(|&v| f64::from(v) * f64::from(v))
        .sum::<f64>()
        .sqrt();

    if total_norm > max_norm {
        let coef = (max_norm / (total_norm + 1e-6)) as f32;
        for g in grads.values_mut() {
            for v in g.iter_mut() {
                *v *= coef;
            }
        }
    }
    total_norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_ranks<T, F>(world_size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(ProcessGroup) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = ProcessGroup::new(world_size)
            .into_iter()
            .map(|group| {
                let f = Arc::clone(&f);
                thread::spawn(move || f(group))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_gather_for_metrics_identical_on_every_rank() {
        let results = run_ranks(3, |group| {
            let rank = group.rank() as i64;
            let accel = Accelerator::new(Arc::new(group), Device::cpu(), MixedPrecision::No);
            let local = TokenBatch::new(vec![vec![rank * 10], vec![rank * 10 + 1]]);
            accel.gather_for_metrics(&local).unwrap()
        });

        let expected = vec![vec![0], vec![1], vec![10], vec![11], vec![20], vec![21]];
        for gathered in results {
            assert_eq!(gathered.rows, expected);
        }
    }

    #[test]
    fn test_gather_for_metrics_drops_padded_rows() {
        let results = run_ranks(2, |group| {
            let rank = group.rank();
            let accel = Accelerator::new(Arc::new(group), Device::cpu(), MixedPrecision::No);
            let mut local = TokenBatch::new(vec![vec![rank as i64], vec![99]]);
            local.padded_rows = rank;
            accel.gather_for_metrics(&local).unwrap()
        });

        for gathered in results {
            assert_eq!(gathered.rows, vec![vec![0], vec![99], vec![1]]);
        }
    }

    #[test]
    fn test_all_reduce_mean_averages() {
        let results = run_ranks(2, |group| {
            let mut state = ParameterState::new();
            state.insert("w".to_string(), vec![group.rank() as f32 * 2.0, 4.0]);
            group.all_reduce_mean(&mut state).unwrap();
            state
        });
        for state in results {
            assert_eq!(state["w"], vec![1.0, 4.0]);
        }
    }

    #[test]
    fn test_broadcast_flag_uses_rank_zero_value() {
        let results = run_ranks(3, |group| {
            let value = group.rank() == 0;
            group.broadcast_flag(value).unwrap()
        });
        assert_eq!(results, vec![true, true, true]);
    }

    #[test]
    fn test_abort_releases_waiting_ranks() {
        let results = run_ranks(2, |group| {
            if group.rank() == 0 {
                group.abort();
                Err(aborted())
            } else {
                group.barrier()
            }
        });
        assert!(results.iter().all(Result::is_err));
    }

    #[test]
    fn test_clip_grad_norm_scales_to_max() {
        let mut grads = ParameterState::new();
        grads.insert("a".to_string(), vec![3.0, 4.0]);
        let norm = clip_grad_norm(&mut grads, 1.0);
        assert!((norm - 5.0).abs() < 1e-9);
        let clipped: f32 = grads["a"].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((clipped - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_clip_grad_norm_leaves_small_gradients() {
        let mut grads = ParameterState::new();
        grads.insert("a".to_string(), vec![0.3, 0.4]);
        clip_grad_norm(&mut grads, 1.0);
        assert_eq!(grads["a"], vec![0.3, 0.4]);
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::cpu().to_string(), "cpu");
        assert_eq!(Device::for_rank(DeviceKind::Cuda, 2).to_string(), "cuda:2");
        assert_eq!(Device::for_rank(DeviceKind::Cpu, 2).to_string(), "cpu");
    }
}
