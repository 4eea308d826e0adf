//! Rank launcher: one thread per rank, joined through a shared process group.

use anyhow::{anyhow, Context, Result};
use seq2seq_training::{Accelerator, Collective, Device, DeviceKind, MixedPrecision, ProcessGroup, TrainingResult};
use std::sync::Arc;

/// Run `job` on `num_processes` ranks and return each rank's result in rank order.
///
/// A single process skips the group entirely. Any rank's error fails the
/// launch; the orchestrator aborts the group on error so peers unblock.
pub fn ranks<T, F>(num_processes: usize, mixed_precision: MixedPrecision, job: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(Accelerator) -> TrainingResult<T> + Send + Sync + 'static,
{
    if num_processes <= 1 {
        let accelerator = Accelerator::single_process(mixed_precision);
        return Ok(vec![job(accelerator)?]);
    }

    let job = Arc::new(job);
    let mut handles = Vec::with_capacity(num_processes);
    for group in ProcessGroup::new(num_processes) {
        let rank = group.rank();
        let job = Arc::clone(&job);
        let handle = std::thread::Builder::new()
            .name(format!("rank-{rank}"))
            .spawn(move || {
                let device = Device::for_rank(DeviceKind::Cpu, rank);
                job(Accelerator::new(Arc::new(group), device, mixed_precision))
            })
            .with_context(|| format!("failed to spawn rank {rank}"))?;
        handles.push(handle);
    }

    let mut results = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(err)) => {
                tracing::debug!(rank, error = %err, "rank failed");
                first_error.get_or_insert_with(|| anyhow::Error::new(err).context(format!("rank {rank} failed")));
            }
            Err(_) => {
                first_error.get_or_insert_with(|| anyhow!("rank {rank} panicked"));
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(results),
    }
}
