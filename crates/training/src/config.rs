//! Run configuration: built-in defaults, optional TOML file, optional CLI overrides.

use anyhow::Context;
use clap::Parser;
use models::{BackboneConfig, RegionDetectorConfig};
use npz_dataset::{LoaderConfig, TransformPipeline, TransformPipelineBuilder};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Extension `BinFileRecorder` puts on every file it writes.
pub const CHECKPOINT_EXTENSION: &str = "bin";

/// Everything a training run needs. `Default` reproduces the fixed setup
/// the binary runs with when given no arguments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// Directory holding `0.npz`, `1.npz`, ...
    pub dataset_root: PathBuf,
    /// Checkpoint overwritten after every epoch.
    pub weights_path: PathBuf,
    /// Also keep `model_epoch_<e>.bin` next to `weights_path`.
    pub keep_epoch_checkpoints: bool,
    /// Backbone record to start from; random init when unset.
    pub pretrained_backbone: Option<PathBuf>,

    /// Classes in the replaced head, background included.
    pub num_classes: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub num_workers: usize,
    pub shuffle: bool,
    pub seed: Option<u64>,

    pub lr: f64,
    pub momentum: f32,
    pub weight_decay: f32,
    pub lr_step_size: usize,
    pub lr_gamma: f64,
    /// Upper bound on epoch-0 warmup iterations; 0 disables warmup.
    pub warmup_iters: usize,
    /// Log every N batches; 0 only logs the last batch.
    pub print_freq: usize,

    pub flip_prob: f32,
    pub color_jitter_prob: f32,
    /// Max brightness/contrast change as a fraction of full scale.
    pub color_jitter_strength: f32,
    /// Resize every image to `(width, height)` before batching.
    pub target_size: Option<(u32, u32)>,
    pub backbone_channels: Vec<usize>,
    pub grid: usize,
    pub box_loss_weight: f32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        let backbone = BackboneConfig::default();
        Self {
            dataset_root: default_dataset_root(),
            weights_path: default_weights_path(),
            keep_epoch_checkpoints: false,
            pretrained_backbone: None,
            num_classes: 5,
            epochs: 10,
            batch_size: 2,
            num_workers: 4,
            shuffle: true,
            seed: None,
            lr: 0.005,
            momentum: 0.9,
            weight_decay: 0.0005,
            lr_step_size: 3,
            lr_gamma: 0.1,
            warmup_iters: 1000,
            print_freq: 10,
            flip_prob: 0.5,
            color_jitter_prob: 0.0,
            color_jitter_strength: 0.1,
            target_size: None,
            backbone_channels: backbone.channels,
            grid: backbone.grid,
            box_loss_weight: 1.0,
        }
    }
}

/// `<workspace>/data_collection/dataset`.
pub fn default_dataset_root() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest
        .ancestors()
        .nth(2)
        .unwrap_or(manifest)
        .join("data_collection")
        .join("dataset")
}

/// `<crates/training>/weights/model.bin`.
pub fn default_weights_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("weights")
        .join("model.bin")
}

impl TrainConfig {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: TrainConfig =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_classes < 2 {
            anyhow::bail!("num_classes must include background plus at least one class");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if self.lr_step_size == 0 {
            anyhow::bail!("lr_step_size must be at least 1");
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            anyhow::bail!("lr must be a positive number, got {}", self.lr);
        }
        if !(0.0..=1.0).contains(&self.flip_prob) {
            anyhow::bail!("flip_prob must be in [0, 1], got {}", self.flip_prob);
        }
        if !(0.0..=1.0).contains(&self.color_jitter_prob) {
            anyhow::bail!(
                "color_jitter_prob must be in [0, 1], got {}",
                self.color_jitter_prob
            );
        }
        if self.backbone_channels.is_empty() || self.grid == 0 {
            anyhow::bail!("backbone needs at least one stage and a non-zero grid");
        }
        if let Some((w, h)) = self.target_size {
            if w == 0 || h == 0 {
                anyhow::bail!("target_size must be non-zero, got {w}x{h}");
            }
        }
        Ok(())
    }

    pub fn backbone_config(&self) -> BackboneConfig {
        BackboneConfig {
            channels: self.backbone_channels.clone(),
            grid: self.grid,
        }
    }

    /// Detector as it ships before its head is replaced.
    pub fn pretrained_model_config(&self) -> RegionDetectorConfig {
        RegionDetectorConfig {
            backbone: self.backbone_config(),
            box_loss_weight: self.box_loss_weight,
            ..Default::default()
        }
    }

    /// Detector shape after head replacement; matches saved checkpoints.
    pub fn model_config(&self) -> RegionDetectorConfig {
        RegionDetectorConfig {
            num_classes: self.num_classes,
            ..self.pretrained_model_config()
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            seed: self.seed,
            num_workers: self.num_workers,
            drop_last: false,
        }
    }

    pub fn transform(&self) -> TransformPipeline {
        TransformPipelineBuilder::new()
            .target_size(self.target_size)
            .flip_horizontal_prob(self.flip_prob)
            .color_jitter(self.color_jitter_prob, self.color_jitter_strength)
            .seed(self.seed)
            .build()
    }

    /// File the recorder actually writes: `weights_path` with a `.bin` extension.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.weights_path.with_extension(CHECKPOINT_EXTENSION)
    }

    /// Extra per-epoch checkpoint path, when enabled.
    pub fn epoch_checkpoint_path(&self, epoch: usize) -> Option<PathBuf> {
        if !self.keep_epoch_checkpoints {
            return None;
        }
        let dir = self.weights_path.parent().unwrap_or_else(|| Path::new("."));
        Some(dir.join(format!("model_epoch_{epoch}.{CHECKPOINT_EXTENSION}")))
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train the region detector on <index>.npz sample archives"
)]
pub struct TrainArgs {
    /// TOML file overriding the built-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Dataset directory (defaults to <workspace>/data_collection/dataset).
    #[arg(long)]
    pub dataset_root: Option<PathBuf>,
    /// Checkpoint path, overwritten every epoch.
    #[arg(long)]
    pub weights: Option<PathBuf>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Seed shuffling and augmentation for a reproducible run.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl TrainArgs {
    /// Defaults, then the config file, then explicit flags.
    pub fn resolve(&self) -> anyhow::Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::from_path(path)?,
            None => TrainConfig::default(),
        };
        if let Some(root) = &self.dataset_root {
            cfg.dataset_root = root.clone();
        }
        if let Some(weights) = &self.weights {
            cfg.weights_path = weights.clone();
        }
        if let Some(epochs) = self.epochs {
            cfg.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            cfg.batch_size = batch_size;
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_run() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.num_classes, 5);
        assert_eq!(cfg.epochs, 10);
        assert_eq!(cfg.batch_size, 2);
        assert_eq!(cfg.num_workers, 4);
        assert!(cfg.shuffle);
        assert_eq!(cfg.lr, 0.005);
        assert_eq!(cfg.lr_step_size, 3);
        assert_eq!(cfg.lr_gamma, 0.1);
        assert_eq!(cfg.print_freq, 10);
        assert_eq!(cfg.flip_prob, 0.5);
        assert!(cfg.dataset_root.ends_with("data_collection/dataset"));
        assert!(cfg.weights_path.ends_with("weights/model.bin"));
        cfg.validate().unwrap();
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("train.toml");
        fs::write(
            &path,
            "epochs = 2\nlr = 0.01\ntarget_size = [32, 24]\nkeep_epoch_checkpoints = true\n",
        )
        .unwrap();
        let cfg = TrainConfig::from_path(&path).unwrap();
        assert_eq!(cfg.epochs, 2);
        assert_eq!(cfg.lr, 0.01);
        assert_eq!(cfg.target_size, Some((32, 24)));
        assert_eq!(cfg.momentum, 0.9);
        assert_eq!(
            cfg.epoch_checkpoint_path(4).unwrap().file_name().unwrap(),
            "model_epoch_4.bin"
        );
    }

    #[test]
    fn checkpoint_path_always_ends_in_bin() {
        let cfg = TrainConfig {
            weights_path: PathBuf::from("/tmp/weights/model.pt"),
            ..Default::default()
        };
        assert_eq!(cfg.checkpoint_path(), PathBuf::from("/tmp/weights/model.bin"));
        let cfg = TrainConfig {
            weights_path: PathBuf::from("/tmp/weights/model"),
            ..Default::default()
        };
        assert_eq!(cfg.checkpoint_path(), PathBuf::from("/tmp/weights/model.bin"));
        assert_eq!(
            TrainConfig::default().checkpoint_path(),
            TrainConfig::default().weights_path
        );
    }

    #[test]
    fn jitter_settings_reach_the_transform() {
        let cfg = TrainConfig {
            color_jitter_prob: 0.3,
            color_jitter_strength: 0.2,
            ..Default::default()
        };
        let t = cfg.transform();
        assert_eq!(t.color_jitter_prob, 0.3);
        assert_eq!(t.color_jitter_strength, 0.2);
        assert_eq!(t.flip_horizontal_prob, 0.5);

        let bad = TrainConfig {
            color_jitter_prob: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("train.toml");
        fs::write(&path, "epochz = 2\n").unwrap();
        assert!(TrainConfig::from_path(&path).is_err());
    }

    #[test]
    fn flags_win_over_defaults() {
        let args = TrainArgs::parse_from(["train", "--epochs", "1", "--weights", "/tmp/w.bin"]);
        let cfg = args.resolve().unwrap();
        assert_eq!(cfg.epochs, 1);
        assert_eq!(cfg.weights_path, PathBuf::from("/tmp/w.bin"));
        assert_eq!(cfg.epoch_checkpoint_path(0), None);

        let bare = TrainArgs::parse_from(["train"]);
        assert_eq!(bare.resolve().unwrap(), TrainConfig::default());
    }

    #[test]
    fn invalid_settings_fail_validation() {
        let cfg = TrainConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = TrainConfig {
            lr_step_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
