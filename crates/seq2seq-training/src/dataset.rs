use crate::backend::Dataset;
use crate::batch::BatchRecord;
use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Batches each prefetch worker may hold ahead of the consumer.
const PREFETCH_PER_WORKER: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub num_workers: usize,
    pub pin_memory: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self { batch_size: 1, shuffle: false, seed: 0, num_workers: 0, pin_memory: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Shard {
    rank: usize,
    world_size: usize,
}

/// One planned batch: dataset indices plus how many trailing rows are filler.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlannedBatch {
    indices: Vec<usize>,
    padded_rows: usize,
}

/// Batches a [`Dataset`], optionally sharded across ranks.
///
/// Every rank computes the same epoch order from `seed + epoch`, so shards
/// never overlap. A short final global batch is evened out by wrapping to
/// the start of the order; the filler rows are marked as padding.
pub struct DataLoader<D> {
    dataset: Arc<D>,
    options: LoaderOptions,
    shard: Option<Shard>,
}

impl<D> std::fmt::Debug for DataLoader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader").field("options", &self.options).field("shard", &self.shard).finish()
    }
}

impl<D: Dataset + 'static> DataLoader<D> {
    pub fn new(dataset: Arc<D>, options: LoaderOptions) -> TrainingResult<Self> {
        if options.batch_size == 0 {
            return Err(TrainingError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        Ok(Self { dataset, options, shard: None })
    }

    #[must_use]
    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    #[must_use]
    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub(crate) fn shard(self, rank: usize, world_size: usize) -> TrainingResult<Self> {
        if self.shard.is_some() {
            return Err(TrainingError::InvalidConfig("data loader was already prepared".to_string()));
        }
        if rank >= world_size {
            return Err(TrainingError::InvalidConfig(format!("rank {rank} outside world of {world_size}")));
        }
        Ok(Self { shard: Some(Shard { rank, world_size }), ..self })
    }

    /// Batches this rank yields per epoch.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.global_batch_size())
    }

    fn global_batch_size(&self) -> usize {
        self.options.batch_size * self.shard.map_or(1, |s| s.world_size)
    }

    fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    fn plan(&self, epoch: usize) -> Vec<PlannedBatch> {
        let order = self.epoch_order(epoch);
        let batch_size = self.options.batch_size;

        let Some(shard) = self.shard else {
            return order
                .chunks(batch_size)
                .map(|chunk| PlannedBatch { indices: chunk.to_vec(), padded_rows: 0 })
                .collect();
        };

        let global = self.global_batch_size();
        order
            .chunks(global)
            .map(|chunk| {
                let real = chunk.len();
                let start = shard.rank * batch_size;
                let indices = (start..start + batch_size)
                    .map(|pos| if pos < real { chunk[pos] } else { order[(pos - real) % order.len()] })
                    .collect();
                let real_here = real.saturating_sub(start).min(batch_size);
                PlannedBatch { indices, padded_rows: batch_size - real_here }
            })
            .collect()
    }

    /// Iterate one epoch. With `num_workers > 0`, batches are collated on
    /// background threads and delivered in order.
    pub fn iter(&self, epoch: usize) -> Batches<D> {
        let plan = self.plan(epoch);
        if self.options.num_workers == 0 {
            return Batches {
                dataset: Arc::clone(&self.dataset),
                plan,
                receivers: Vec::new(),
                workers: Vec::new(),
                next: 0,
                total: 0,
            };
        }

        let num_workers = self.options.num_workers.min(plan.len().max(1));
        let total = plan.len();
        let mut receivers = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);

        for worker in 0..num_workers {
            let (tx, rx) = mpsc::sync_channel(PREFETCH_PER_WORKER);
            let dataset = Arc::clone(&self.dataset);
            let assigned: Vec<PlannedBatch> = plan.iter().skip(worker).step_by(num_workers).cloned().collect();

            workers.push(std::thread::spawn(move || {
                for planned in assigned {
                    let batch = collate(dataset.as_ref(), &planned);
                    if tx.send(batch).is_err() {
                        break;
                    }
                }
            }));
            receivers.push(rx);
        }

        Batches { dataset: Arc::clone(&self.dataset), plan: Vec::new(), receivers, workers, next: 0, total }
    }
}

fn collate<D: Dataset>(dataset: &D, planned: &PlannedBatch) -> TrainingResult<BatchRecord> {
    let mut batch = dataset.collate(&planned.indices)?;
    batch.set_padded_rows(planned.padded_rows);
    Ok(batch)
}

/// Iterator over one epoch of batches.
pub struct Batches<D> {
    dataset: Arc<D>,
    plan: Vec<PlannedBatch>,
    receivers: Vec<Receiver<TrainingResult<BatchRecord>>>,
    workers: Vec<JoinHandle<()>>,
    next: usize,
    total: usize,
}

impl<D: Dataset> Iterator for Batches<D> {
    type Item = TrainingResult<BatchRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.receivers.is_empty() {
            let planned = self.plan.get(self.next)?;
            self.next += 1;
            return Some(collate(self.dataset.as_ref(), planned));
        }

        if self.next >= self.total {
            return None;
        }
        let rx = &self.receivers[self.next % self.receivers.len()];
        self.next += 1;
        Some(rx.recv().unwrap_or_else(|_| {
            Err(TrainingError::Dataset("data loader worker exited early".to_string()))
        }))
    }
}

impl<D> Drop for Batches<D> {
    fn drop(&mut self) {
        // Hanging up first lets blocked workers observe the closed channel.
        self.receivers.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Tokenizer;
    use crate::batch::TokenBatch;

    struct NullTokenizer;

    impl Tokenizer for NullTokenizer {
        fn token_to_id(&self, _token: &str) -> Option<u32> {
            None
        }

        fn vocab_size(&self) -> usize {
            0
        }

        fn decode_batch(&self, ids: &[Vec<i64>], _skip: bool) -> Vec<String> {
            ids.iter().map(|_| String::new()).collect()
        }
    }

    /// Sample `i` collates to a single-token row `[i]`.
    struct IndexDataset {
        len: usize,
        tokenizer: NullTokenizer,
    }

    impl Dataset for IndexDataset {
        type Tokenizer = NullTokenizer;

        fn len(&self) -> usize {
            self.len
        }

        fn collate(&self, indices: &[usize]) -> TrainingResult<BatchRecord> {
            let rows: Vec<Vec<i64>> = indices.iter().map(|&i| vec![i as i64]).collect();
            Ok(BatchRecord {
                input_ids: TokenBatch::new(rows.clone()),
                input_mask: TokenBatch::new(rows.iter().map(|_| vec![1]).collect()),
                target_ids: TokenBatch::new(rows),
            })
        }

        fn tokenizer(&self) -> &NullTokenizer {
            &self.tokenizer
        }
    }

    fn loader(len: usize, options: LoaderOptions) -> DataLoader<IndexDataset> {
        DataLoader::new(Arc::new(IndexDataset { len, tokenizer: NullTokenizer }), options).unwrap()
    }

    fn ids(batch: &BatchRecord) -> Vec<i64> {
        batch.input_ids.rows.iter().map(|r| r[0]).collect()
    }

    #[test]
    fn test_unsharded_keeps_short_final_batch() {
        let loader = loader(5, LoaderOptions { batch_size: 2, ..Default::default() });
        let batches: Vec<_> = loader.iter(0).map(Result::unwrap).collect();
        assert_eq!(loader.num_batches(), 3);
        assert_eq!(batches.iter().map(ids).collect::<Vec<_>>(), vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_sharded_ranks_are_disjoint_and_padded() {
        let options = LoaderOptions { batch_size: 2, ..Default::default() };
        let rank0 = loader(5, options.clone()).shard(0, 2).unwrap();
        let rank1 = loader(5, options).shard(1, 2).unwrap();

        assert_eq!(rank0.num_batches(), 2);
        assert_eq!(rank1.num_batches(), 2);

        let b0: Vec<_> = rank0.iter(0).map(Result::unwrap).collect();
        let b1: Vec<_> = rank1.iter(0).map(Result::unwrap).collect();

        assert_eq!(ids(&b0[0]), vec![0, 1]);
        assert_eq!(ids(&b1[0]), vec![2, 3]);
        assert_eq!(ids(&b0[1]), vec![4, 0]);
        assert_eq!(b0[1].input_ids.padded_rows, 1);
        assert_eq!(ids(&b1[1]), vec![1, 2]);
        assert_eq!(b1[1].input_ids.padded_rows, 2);
    }

    #[test]
    fn test_shuffle_is_seeded_per_epoch() {
        let options = LoaderOptions { batch_size: 4, shuffle: true, seed: 7, ..Default::default() };
        let a = loader(32, options.clone());
        let b = loader(32, options);
        assert_eq!(a.epoch_order(0), b.epoch_order(0));
        assert_ne!(a.epoch_order(0), a.epoch_order(1));
    }

    #[test]
    fn test_workers_preserve_order() {
        let inline = loader(17, LoaderOptions { batch_size: 3, shuffle: true, seed: 1, ..Default::default() });
        let threaded = loader(
            17,
            LoaderOptions { batch_size: 3, shuffle: true, seed: 1, num_workers: 3, ..Default::default() },
        );
        let a: Vec<_> = inline.iter(2).map(|b| ids(&b.unwrap())).collect();
        let b: Vec<_> = threaded.iter(2).map(|b| ids(&b.unwrap())).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_dropping_iterator_early_joins_workers() {
        let loader = loader(100, LoaderOptions { batch_size: 1, num_workers: 2, ..Default::default() });
        let mut it = loader.iter(0);
        assert!(it.next().is_some());
        drop(it);
    }

    #[test]
    fn test_preparing_twice_is_rejected() {
        let loader = loader(4, LoaderOptions::default()).shard(0, 1).unwrap();
        assert!(loader.shard(0, 1).is_err());
    }
}
