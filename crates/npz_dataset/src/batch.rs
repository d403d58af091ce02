//! Batch loading over a `SampleStore`.

use crate::store::SampleStore;
use crate::types::{DatasetError, DatasetResult, Sample, Target};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::{seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Reshuffle the sample order every epoch.
    pub shuffle: bool,
    /// Seed for reproducible shuffling (`seed + epoch`).
    pub seed: Option<u64>,
    /// Loader threads; 0 loads on the calling thread.
    pub num_workers: usize,
    /// Drop the last partial batch.
    pub drop_last: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            shuffle: true,
            seed: None,
            num_workers: 4,
            drop_last: false,
        }
    }
}

/// One collated batch. Images are CHW, normalized to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct DetectionBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Vec<Target>,
    pub width: u32,
    pub height: u32,
}

impl<B: Backend> DetectionBatch<B> {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

pub struct DataLoader {
    store: Arc<SampleStore>,
    cfg: LoaderConfig,
    pool: Option<rayon::ThreadPool>,
}

impl DataLoader {
    pub fn new(store: Arc<SampleStore>, cfg: LoaderConfig) -> DatasetResult<Self> {
        if cfg.batch_size == 0 {
            return Err(DatasetError::Other("batch_size must be at least 1".into()));
        }
        let pool = if cfg.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(cfg.num_workers)
                .thread_name(|i| format!("npz-loader-{i}"))
                .build()
                .map_err(|e| DatasetError::Other(format!("failed to start loader pool: {e}")))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self { store, cfg, pool })
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.cfg
    }

    pub fn num_batches(&self) -> usize {
        let n = self.store.len();
        if self.cfg.drop_last {
            n / self.cfg.batch_size
        } else {
            n.div_ceil(self.cfg.batch_size)
        }
    }

    /// Batches for one epoch, in a fresh order when shuffling.
    pub fn iter(&self, epoch: usize) -> BatchIter<'_> {
        let mut order: Vec<usize> = (0..self.store.len()).collect();
        if self.cfg.shuffle {
            let mut rng = match self.cfg.seed {
                Some(seed) => rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)),
                None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
            };
            order.shuffle(&mut rng);
        }
        BatchIter {
            loader: self,
            order,
            cursor: 0,
        }
    }

    fn load(&self, indices: &[usize]) -> DatasetResult<Vec<Sample>> {
        let store = &self.store;
        match &self.pool {
            // Indexed parallel collect keeps batch order.
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&i| store.get(i))
                    .collect::<DatasetResult<Vec<_>>>()
            }),
            None => indices.iter().map(|&i| store.get(i)).collect(),
        }
    }
}

pub struct BatchIter<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl BatchIter<'_> {
    /// Sample indices in the order this epoch visits them.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<DetectionBatch<B>>> {
        let batch_size = self.loader.cfg.batch_size;
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + batch_size).min(self.order.len());
        if self.loader.cfg.drop_last && end - self.cursor < batch_size {
            self.cursor = self.order.len();
            return Ok(None);
        }
        let slice = &self.order[self.cursor..end];
        self.cursor = end;

        let samples = self.loader.load(slice)?;
        collate(samples, device).map(Some)
    }
}

/// Stack samples into a batch.
///
/// Images smaller than the largest one in the batch are zero-padded on the
/// right and bottom, so pixel boxes keep their meaning on the padded canvas.
pub fn collate<B: Backend>(
    samples: Vec<Sample>,
    device: &B::Device,
) -> DatasetResult<DetectionBatch<B>> {
    if samples.is_empty() {
        return Err(DatasetError::Other("cannot collate empty batch".into()));
    }
    let (width, height) = samples
        .iter()
        .map(Sample::dimensions)
        .fold((0, 0), |(w, h), (sw, sh)| (w.max(sw), h.max(sh)));
    let plane = (width * height) as usize;
    let batch = samples.len();

    let mut image_buf = vec![0.0f32; batch * 3 * plane];
    let mut targets = Vec::with_capacity(batch);
    for (b, sample) in samples.into_iter().enumerate() {
        let base = b * 3 * plane;
        for (x, y, pixel) in sample.image.enumerate_pixels() {
            let offset = (y * width + x) as usize;
            image_buf[base + offset] = pixel[0] as f32 / 255.0;
            image_buf[base + plane + offset] = pixel[1] as f32 / 255.0;
            image_buf[base + 2 * plane + offset] = pixel[2] as f32 / 255.0;
        }
        targets.push(sample.target);
    }

    let images = Tensor::<B, 4>::from_data(
        TensorData::new(image_buf, [batch, 3, height as usize, width as usize]),
        device,
    );
    Ok(DetectionBatch {
        images,
        targets,
        width,
        height,
    })
}
