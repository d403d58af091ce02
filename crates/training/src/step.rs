//! One optimisation step, behind a trait so the epoch driver can be
//! exercised with any trainer.

use anyhow::Context;
use burn::module::Module;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{GradientsParams, Optimizer, Sgd};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::{AutodiffBackend, Backend};
use models::{assign_region_targets, RegionDetector, RegionTargets};
use npz_dataset::DetectionBatch;
use std::path::Path;

/// Consumes one batch, updates parameters in place, returns the scalar loss.
pub trait TrainStep<B: Backend> {
    fn step(&mut self, batch: DetectionBatch<B>, lr: f64) -> anyhow::Result<f32>;
}

/// Persists the current parameters.
pub trait Checkpoint {
    fn save_checkpoint(&self, path: &Path) -> anyhow::Result<()>;
}

pub type DetectorOptimizer<B> =
    OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, RegionDetector<B>, B>;

pub struct DetectorTrainer<B: AutodiffBackend, O = DetectorOptimizer<B>> {
    model: RegionDetector<B>,
    optim: O,
}

impl<B: AutodiffBackend, O> DetectorTrainer<B, O> {
    pub fn new(model: RegionDetector<B>, optim: O) -> Self {
        Self { model, optim }
    }

    pub fn model(&self) -> &RegionDetector<B> {
        &self.model
    }

    fn region_targets(&self, batch: &DetectionBatch<B>) -> anyhow::Result<Vec<RegionTargets>> {
        let grid = self.model.grid();
        let num_classes = self.model.num_classes();
        batch
            .targets
            .iter()
            .map(|t| {
                let boxes = t.normalized_boxes(batch.width, batch.height);
                assign_region_targets(&boxes, &t.labels, grid, num_classes)
                    .with_context(|| format!("building targets for image {}", t.image_id))
            })
            .collect()
    }
}

impl<B, O> TrainStep<B> for DetectorTrainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<RegionDetector<B>, B>,
{
    fn step(&mut self, batch: DetectionBatch<B>, lr: f64) -> anyhow::Result<f32> {
        let targets = self.region_targets(&batch)?;
        let output = self.model.forward(batch.images);
        let loss = self.model.loss(output, &targets)?;

        let loss_val = loss
            .clone()
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("reading loss value: {e:?}"))?
            .into_iter()
            .next()
            .unwrap_or(f32::NAN);
        if !loss_val.is_finite() {
            anyhow::bail!("loss is {loss_val}, stopping training");
        }

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self.optim.step(lr, self.model.clone(), grads);
        Ok(loss_val)
    }
}

impl<B: AutodiffBackend, O> Checkpoint for DetectorTrainer<B, O> {
    fn save_checkpoint(&self, path: &Path) -> anyhow::Result<()> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.model
            .clone()
            .save_file(path, &recorder)
            .map_err(|e| anyhow::anyhow!("failed to save checkpoint {}: {e}", path.display()))
    }
}
