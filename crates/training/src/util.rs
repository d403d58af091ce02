use anyhow::Context;
use burn::module::Module;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::SgdConfig;
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::backend::{AutodiffBackend, Backend};
use models::{Backbone, RegionDetector};
use npz_dataset::{DataLoader, SampleStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    backend_name, ADBackend, Checkpoint, DetectorOptimizer, DetectorTrainer, StepLr, TrainConfig,
    TrainStep, WarmupLr,
};

/// Model, optimizer, and schedule for a fresh run.
pub struct TrainingSetup<B: AutodiffBackend> {
    pub trainer: DetectorTrainer<B, DetectorOptimizer<B>>,
    pub schedule: StepLr,
}

/// Build the detector with a replaced head plus SGD and a step schedule.
pub fn setup<B: AutodiffBackend>(
    cfg: &TrainConfig,
    device: &B::Device,
) -> anyhow::Result<TrainingSetup<B>> {
    let mut model = RegionDetector::<B>::new(&cfg.pretrained_model_config(), device);
    match &cfg.pretrained_backbone {
        Some(path) => {
            let backbone = Backbone::new(&cfg.backbone_config(), device)
                .load_pretrained(path, device)
                .map_err(|e| {
                    anyhow::anyhow!("failed to load backbone {}: {e}", path.display())
                })?;
            model = model.with_backbone(backbone);
            tracing::info!(path = %path.display(), "loaded pretrained backbone");
        }
        None => {
            tracing::warn!("no pretrained backbone configured; backbone starts from random init")
        }
    }
    let model = model.with_predictor(cfg.num_classes, device);

    let optim = SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(cfg.momentum.into())
                .with_dampening(0.0),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(cfg.weight_decay.into())))
        .init::<B, RegionDetector<B>>();

    Ok(TrainingSetup {
        trainer: DetectorTrainer::new(model, optim),
        schedule: StepLr::new(cfg.lr, cfg.lr_step_size, cfg.lr_gamma),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub batches: usize,
    pub avg_loss: f32,
    /// Rate the epoch started with, before warmup.
    pub lr: f64,
}

/// Run every batch of `loader` once through `trainer`.
pub fn train_one_epoch<B, T>(
    trainer: &mut T,
    loader: &DataLoader,
    epoch: usize,
    base_lr: f64,
    warmup: Option<WarmupLr>,
    print_freq: usize,
    device: &B::Device,
) -> anyhow::Result<EpochSummary>
where
    B: Backend,
    T: TrainStep<B>,
{
    let total = loader.num_batches();
    let mut batches = loader.iter(epoch);
    let mut losses = Vec::with_capacity(total);

    while let Some(batch) = batches.next_batch::<B>(device)? {
        let i = losses.len();
        let lr = base_lr * warmup.map_or(1.0, |w| w.factor(i));
        let loss = trainer.step(batch, lr)?;
        if !loss.is_finite() {
            anyhow::bail!("loss is {loss} at epoch {epoch} batch {i}, stopping training");
        }
        losses.push(loss);

        let last = i + 1 == total;
        if last || (print_freq > 0 && i % print_freq == 0) {
            let avg = losses.iter().sum::<f32>() / losses.len() as f32;
            tracing::info!("epoch [{epoch}] [{i}/{total}] lr: {lr:.6} loss: {loss:.4} ({avg:.4})");
        }
    }

    let avg_loss = if losses.is_empty() {
        0.0
    } else {
        losses.iter().sum::<f32>() / losses.len() as f32
    };
    Ok(EpochSummary {
        epoch,
        batches: losses.len(),
        avg_loss,
        lr: base_lr,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub dataset_len: usize,
    pub epochs: Vec<EpochSummary>,
    pub checkpoint: PathBuf,
    /// Files written, counting each overwrite.
    pub checkpoint_writes: usize,
}

/// Epoch loop: train, step the schedule, write the checkpoint.
pub fn fit<B, T>(
    trainer: &mut T,
    loader: &DataLoader,
    schedule: &mut StepLr,
    cfg: &TrainConfig,
    device: &B::Device,
) -> anyhow::Result<(Vec<EpochSummary>, usize)>
where
    B: Backend,
    T: TrainStep<B> + Checkpoint,
{
    let checkpoint = cfg.checkpoint_path();
    if let Some(parent) = checkpoint.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating weights dir {}", parent.display()))?;
    }

    let mut summaries = Vec::with_capacity(cfg.epochs);
    let mut writes = 0;
    for epoch in 0..cfg.epochs {
        let warmup = (epoch == 0 && cfg.warmup_iters > 0)
            .then(|| WarmupLr::for_epoch(loader.num_batches(), cfg.warmup_iters));
        let summary = train_one_epoch::<B, T>(
            trainer,
            loader,
            epoch,
            schedule.lr(),
            warmup,
            cfg.print_freq,
            device,
        )?;
        tracing::info!(epoch, avg_loss = summary.avg_loss, "trained one epoch");
        schedule.step();

        tracing::info!(path = %checkpoint.display(), "saving weights");
        trainer.save_checkpoint(&checkpoint)?;
        writes += 1;
        if let Some(extra) = cfg.epoch_checkpoint_path(epoch) {
            trainer.save_checkpoint(&extra)?;
            writes += 1;
        }
        summaries.push(summary);
    }
    Ok((summaries, writes))
}

/// Full training run with the compiled-in backend.
pub fn run(cfg: &TrainConfig) -> anyhow::Result<RunReport> {
    cfg.validate()?;
    let device = <ADBackend as Backend>::Device::default();
    tracing::info!(backend = backend_name(), "starting training");
    let checkpoint = cfg.checkpoint_path();
    if checkpoint != cfg.weights_path {
        tracing::warn!(
            requested = %cfg.weights_path.display(),
            "checkpoints are written as {}",
            checkpoint.display()
        );
    }

    let transform = cfg.transform();
    tracing::info!(transform = %transform.describe(), "sample transform");
    let store = SampleStore::with_transform(&cfg.dataset_root, transform);
    if store.is_empty() {
        anyhow::bail!(
            "no samples found under {} (expected 0.npz, 1.npz, ...)",
            store.root().display()
        );
    }
    let dataset_len = store.len();
    let loader = DataLoader::new(Arc::new(store), cfg.loader_config())?;

    let TrainingSetup {
        mut trainer,
        mut schedule,
    } = setup::<ADBackend>(cfg, &device)?;
    let (epochs, checkpoint_writes) =
        fit::<ADBackend, _>(&mut trainer, &loader, &mut schedule, cfg, &device)?;

    tracing::info!(
        epochs = epochs.len(),
        checkpoint = %checkpoint.display(),
        "training complete"
    );
    Ok(RunReport {
        dataset_len,
        epochs,
        checkpoint,
        checkpoint_writes,
    })
}

/// Load a checkpoint written by `run` into a detector shaped by `cfg`.
pub fn load_checkpoint<B: Backend, P: AsRef<Path>>(
    path: P,
    cfg: &TrainConfig,
    device: &B::Device,
) -> Result<RegionDetector<B>, RecorderError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    RegionDetector::<B>::new(&cfg.model_config(), device).load_file(
        path.as_ref(),
        &recorder,
        device,
    )
}
