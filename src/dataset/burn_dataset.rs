//! Burn Dataset Integration for patch stores
//!
//! This module implements Burn's Dataset trait and Batcher on top of the
//! memory-mapped [`PatchStore`], plus [`PatchFlow`], the per-epoch batch
//! stream consumed by the training loop.
//!
//! - `PatchStoreDataset`: random access to stored (input, target) rows
//! - `SrBatcher`: stacks rows into `[batch, channels, height, width]` tensors
//! - `PatchFlow`: shuffled batch order, optional parallel row loading

use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;

use super::store::PatchStore;
use crate::utils::error::{Result, SrError};

/// A single (input, target) pair ready for Burn
#[derive(Clone, Debug)]
pub struct PatchItem {
    /// Network input as flattened CHW floats
    pub data: Vec<f32>,
    /// HR target as flattened CHW floats
    pub label: Vec<f32>,
}

/// Burn dataset over a patch store
#[derive(Debug, Clone)]
pub struct PatchStoreDataset {
    store: Arc<PatchStore>,
}

impl PatchStoreDataset {
    pub fn new(store: PatchStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn store(&self) -> &PatchStore {
        &self.store
    }

    /// `[channels, height, width]` of inputs
    pub fn data_shape(&self) -> [usize; 3] {
        self.store.manifest().data_shape
    }

    /// `[channels, height, width]` of targets
    pub fn label_shape(&self) -> [usize; 3] {
        self.store.manifest().label_shape
    }
}

impl Dataset<PatchItem> for PatchStoreDataset {
    fn get(&self, index: usize) -> Option<PatchItem> {
        let data = self.store.data(index)?;
        let label = self.store.label(index)?;
        Some(PatchItem { data, label })
    }

    fn len(&self) -> usize {
        self.store.len()
    }
}

/// A batch of patch pairs
#[derive(Clone, Debug)]
pub struct SrBatch<B: Backend> {
    /// Inputs with shape [batch_size, channels, h_in, w_in]
    pub inputs: Tensor<B, 4>,
    /// Targets with shape [batch_size, channels, h_out, w_out]
    pub targets: Tensor<B, 4>,
}

/// Batcher stacking patch items into tensors
#[derive(Clone, Debug)]
pub struct SrBatcher {
    data_shape: [usize; 3],
    label_shape: [usize; 3],
}

impl SrBatcher {
    pub fn new(data_shape: [usize; 3], label_shape: [usize; 3]) -> Self {
        Self {
            data_shape,
            label_shape,
        }
    }

    /// Batcher matching a store's row shapes
    pub fn for_dataset(dataset: &PatchStoreDataset) -> Self {
        Self::new(dataset.data_shape(), dataset.label_shape())
    }

    /// Stack only the inputs, for inference
    pub fn inputs<B: Backend>(&self, data: &[&[f32]], device: &B::Device) -> Tensor<B, 4> {
        let [c, h, w] = self.data_shape;
        let flat: Vec<f32> = data.iter().flat_map(|d| d.iter().copied()).collect();
        Tensor::<B, 4>::from_floats(TensorData::new(flat, [data.len(), c, h, w]), device)
    }
}

impl<B: Backend> Batcher<B, PatchItem, SrBatch<B>> for SrBatcher {
    fn batch(&self, items: Vec<PatchItem>, device: &B::Device) -> SrBatch<B> {
        let batch_size = items.len();
        let [dc, dh, dw] = self.data_shape;
        let [lc, lh, lw] = self.label_shape;

        let data: Vec<f32> = items.iter().flat_map(|item| item.data.iter().copied()).collect();
        let label: Vec<f32> = items.iter().flat_map(|item| item.label.iter().copied()).collect();

        let inputs = Tensor::<B, 4>::from_floats(TensorData::new(data, [batch_size, dc, dh, dw]), device);
        let targets = Tensor::<B, 4>::from_floats(TensorData::new(label, [batch_size, lc, lh, lw]), device);

        SrBatch { inputs, targets }
    }
}

/// Epoch-by-epoch batch stream over a dataset
///
/// Batches are cut lazily from a shuffled index list so only one batch lives
/// on the device at a time. With a worker pool, the rows of each batch are
/// read in parallel.
pub struct PatchFlow {
    dataset: PatchStoreDataset,
    batch_size: usize,
    shuffle: bool,
    rng: ChaCha8Rng,
    pool: Option<ThreadPool>,
}

impl PatchFlow {
    pub fn new(dataset: PatchStoreDataset, batch_size: usize, shuffle: bool, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(SrError::Config("batch_size must be positive".to_string()));
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pool: None,
        })
    }

    /// Load rows on a dedicated pool of `workers` threads
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("patch-loader-{}", i))
            .build()
            .map_err(|e| SrError::Dataset(format!("Failed to start loader pool: {}", e)))?;
        self.pool = Some(pool);
        Ok(self)
    }

    pub fn dataset(&self) -> &PatchStoreDataset {
        &self.dataset
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Number of batches in one epoch
    pub fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    /// Index batches for the next epoch
    pub fn epoch_batches(&mut self) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            indices.shuffle(&mut self.rng);
        }
        indices.chunks(self.batch_size).map(|c| c.to_vec()).collect()
    }

    /// Read the rows behind a list of indices
    pub fn load(&self, indices: &[usize]) -> Vec<PatchItem> {
        match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .filter_map(|&i| self.dataset.get(i))
                    .collect()
            }),
            None => indices.iter().filter_map(|&i| self.dataset.get(i)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::store::PatchStoreWriter;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn build_store(dir: &std::path::Path, rows: usize) -> PatchStoreDataset {
        let mut writer = PatchStoreWriter::create(dir, [1, 2, 2], [1, 4, 4]).unwrap();
        for i in 0..rows {
            writer.append(&vec![i as f32; 4], &vec![i as f32; 16]).unwrap();
        }
        writer.finish().unwrap();
        PatchStoreDataset::new(PatchStore::open(dir).unwrap())
    }

    #[test]
    fn test_dataset_get() {
        let dir = TempDir::new().unwrap();
        let dataset = build_store(dir.path(), 5);

        assert_eq!(dataset.len(), 5);
        let item = dataset.get(3).unwrap();
        assert_eq!(item.data, vec![3.0; 4]);
        assert_eq!(item.label.len(), 16);
        assert!(dataset.get(5).is_none());
    }

    #[test]
    fn test_batcher_shapes() {
        let dir = TempDir::new().unwrap();
        let dataset = build_store(dir.path(), 3);
        let batcher = SrBatcher::for_dataset(&dataset);
        let device = Default::default();

        let items: Vec<_> = (0..3).filter_map(|i| dataset.get(i)).collect();
        let batch: SrBatch<TestBackend> = batcher.batch(items, &device);

        assert_eq!(batch.inputs.dims(), [3, 1, 2, 2]);
        assert_eq!(batch.targets.dims(), [3, 1, 4, 4]);
    }

    #[test]
    fn test_flow_covers_every_row_once() {
        let dir = TempDir::new().unwrap();
        let dataset = build_store(dir.path(), 10);
        let mut flow = PatchFlow::new(dataset, 4, true, 42).unwrap().with_workers(2).unwrap();

        assert_eq!(flow.num_batches(), 3);
        let batches = flow.epoch_batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 2);

        let mut seen: Vec<usize> = batches.iter().flatten().copied().collect();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        let items = flow.load(&batches[0]);
        assert_eq!(items.len(), 4);
    }

    #[test]
    fn test_flow_without_shuffle_is_ordered() {
        let dir = TempDir::new().unwrap();
        let dataset = build_store(dir.path(), 5);
        let mut flow = PatchFlow::new(dataset, 2, false, 0).unwrap();
        assert_eq!(flow.epoch_batches(), vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert!(PatchFlow::new(flow.dataset().clone(), 0, false, 0).is_err());
    }
}
