//! Burn detection model for the archive-backed training pipeline.
//!
//! The detector is split the way region-based detectors usually are:
//! - `Backbone`: strided conv stack pooled to a `grid x grid` region map. Every
//!   cell of the map is one fixed region proposal.
//! - `BoxPredictor`: the head. Per region it scores `num_classes` classes
//!   (class 0 is background) and regresses one box.
//!
//! The backbone can be loaded from a pretrained record and the head swapped
//! for a freshly initialised one sized for a new class count.
//!
//! Shapes (normalized coords):
//! - Input images: `[N, 3, H, W]`
//! - Class logits: `[N, K, G, G]`
//! - Boxes: `[N, 4, G, G]` (x_min, y_min, x_max, y_max in 0..1)

pub mod targets;

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use std::path::Path;

pub use targets::{assign_region_targets, RegionTargets, TargetError};

/// Class count of the generic dataset the backbone is pretrained on.
pub const PRETRAINED_NUM_CLASSES: usize = 91;

#[derive(Debug, Clone, PartialEq)]
pub struct BackboneConfig {
    /// Output channels of each stride-2 conv stage.
    pub channels: Vec<usize>,
    /// Side of the pooled region map.
    pub grid: usize,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            channels: vec![16, 32, 64],
            grid: 4,
        }
    }
}

#[derive(Debug, Module)]
pub struct Backbone<B: Backend> {
    stages: Vec<Conv2d<B>>,
    pool: AdaptiveAvgPool2d,
    out_channels: usize,
    grid: usize,
}

impl<B: Backend> Backbone<B> {
    pub fn new(cfg: &BackboneConfig, device: &B::Device) -> Self {
        let grid = cfg.grid.max(1);
        let mut stages = Vec::with_capacity(cfg.channels.len());
        let mut in_channels = 3;
        for &out in &cfg.channels {
            let out = out.max(1);
            stages.push(
                Conv2dConfig::new([in_channels, out], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            );
            in_channels = out;
        }
        Self {
            stages,
            pool: AdaptiveAvgPool2dConfig::new([grid, grid]).init(),
            out_channels: in_channels,
            grid,
        }
    }

    /// Feature width seen by the head.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn grid(&self) -> usize {
        self.grid
    }

    /// `[N, 3, H, W]` -> `[N, C, G, G]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = images;
        for stage in &self.stages {
            x = relu(stage.forward(x));
        }
        self.pool.forward(x)
    }

    /// Load backbone weights saved with `BinFileRecorder<FullPrecisionSettings>`.
    pub fn load_pretrained<P: AsRef<Path>>(
        self,
        path: P,
        device: &B::Device,
    ) -> Result<Self, RecorderError> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.load_file(path.as_ref(), &recorder, device)
    }
}

#[derive(Debug, Module)]
pub struct BoxPredictor<B: Backend> {
    cls_score: Conv2d<B>,
    bbox_pred: Conv2d<B>,
    num_classes: usize,
}

impl<B: Backend> BoxPredictor<B> {
    pub fn new(in_features: usize, num_classes: usize, device: &B::Device) -> Self {
        let num_classes = num_classes.max(1);
        let cls_score = Conv2dConfig::new([in_features, num_classes], [1, 1])
            .with_padding(PaddingConfig2d::Valid)
            .init(device);
        let bbox_pred = Conv2dConfig::new([in_features, 4], [1, 1])
            .with_padding(PaddingConfig2d::Valid)
            .init(device);
        Self {
            cls_score,
            bbox_pred,
            num_classes,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Returns (class_logits, boxes); boxes pass through sigmoid.
    pub fn forward(&self, features: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let logits = self.cls_score.forward(features.clone());
        let boxes = sigmoid(self.bbox_pred.forward(features));
        (logits, boxes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionDetectorConfig {
    pub backbone: BackboneConfig,
    /// Classes scored by the head, background included.
    pub num_classes: usize,
    /// Weight of the L1 box term relative to classification.
    pub box_loss_weight: f32,
}

impl Default for RegionDetectorConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneConfig::default(),
            num_classes: PRETRAINED_NUM_CLASSES,
            box_loss_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegionOutput<B: Backend> {
    pub class_logits: Tensor<B, 4>,
    pub boxes: Tensor<B, 4>,
}

#[derive(Debug, Module)]
pub struct RegionDetector<B: Backend> {
    backbone: Backbone<B>,
    predictor: BoxPredictor<B>,
    box_loss_weight: f32,
}

impl<B: Backend> RegionDetector<B> {
    pub fn new(cfg: &RegionDetectorConfig, device: &B::Device) -> Self {
        let backbone = Backbone::new(&cfg.backbone, device);
        let predictor = BoxPredictor::new(backbone.out_channels(), cfg.num_classes, device);
        Self {
            backbone,
            predictor,
            box_loss_weight: cfg.box_loss_weight,
        }
    }

    /// Replace the head with a freshly initialised one for `num_classes`.
    pub fn with_predictor(self, num_classes: usize, device: &B::Device) -> Self {
        let predictor = BoxPredictor::new(self.backbone.out_channels(), num_classes, device);
        Self { predictor, ..self }
    }

    pub fn with_backbone(self, backbone: Backbone<B>) -> Self {
        Self { backbone, ..self }
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    pub fn num_classes(&self) -> usize {
        self.predictor.num_classes()
    }

    pub fn grid(&self) -> usize {
        self.backbone.grid()
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> RegionOutput<B> {
        let features = self.backbone.forward(images);
        let (class_logits, boxes) = self.predictor.forward(features);
        RegionOutput {
            class_logits,
            boxes,
        }
    }

    /// Cross-entropy over every region (unassigned regions are background)
    /// plus L1 on the boxes of assigned regions.
    pub fn loss(
        &self,
        output: RegionOutput<B>,
        targets: &[RegionTargets],
    ) -> Result<Tensor<B, 1>, TargetError> {
        let [n, k, g, _] = output.class_logits.dims();
        if targets.len() != n {
            return Err(TargetError::BatchMismatch {
                expected: n,
                got: targets.len(),
            });
        }
        let cells = g * g;
        let device = output.class_logits.device();

        let mut classes = Vec::with_capacity(n * cells);
        let mut boxes = Vec::with_capacity(n * 4 * cells);
        let mut mask = Vec::with_capacity(n * 4 * cells);
        for t in targets {
            if t.grid != g {
                return Err(TargetError::GridMismatch {
                    expected: g,
                    got: t.grid,
                });
            }
            classes.extend_from_slice(&t.classes);
            boxes.extend_from_slice(&t.boxes);
            mask.extend_from_slice(&t.box_mask);
        }
        let matched = targets.iter().map(RegionTargets::assigned).sum::<usize>();

        let class_targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(classes, [n * cells]), &device);
        let logits = output
            .class_logits
            .permute([0, 2, 3, 1])
            .reshape([n * cells, k]);
        let cls_loss = CrossEntropyLossConfig::new()
            .init(&device)
            .forward(logits, class_targets);

        let box_targets = Tensor::<B, 4>::from_data(TensorData::new(boxes, [n, 4, g, g]), &device);
        let box_mask = Tensor::<B, 4>::from_data(TensorData::new(mask, [n, 4, g, g]), &device);
        let box_loss = ((output.boxes - box_targets).abs() * box_mask)
            .sum()
            .div_scalar(matched.max(1) as f32);

        Ok(cls_loss + box_loss.mul_scalar(self.box_loss_weight))
    }
}

pub mod prelude {
    pub use super::{
        assign_region_targets, Backbone, BackboneConfig, BoxPredictor, RegionDetector,
        RegionDetectorConfig, RegionOutput, RegionTargets, TargetError,
    };
}
