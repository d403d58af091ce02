//! Sample transforms applied by the store before a sample is returned.

use crate::types::{DatasetResult, Target};
use image::imageops::FilterType;
use image::RgbImage;
use rand::{Rng, SeedableRng};

/// Transform applied to an `(image, target)` pair.
///
/// Implementations may change the raster and the boxes but must keep
/// `boxes` and `labels` paired; the store re-checks this after `apply`.
pub trait SampleTransform: Send + Sync {
    fn apply(&self, image: RgbImage, target: Target) -> DatasetResult<(RgbImage, Target)>;
}

impl<F> SampleTransform for F
where
    F: Fn(RgbImage, Target) -> DatasetResult<(RgbImage, Target)> + Send + Sync,
{
    fn apply(&self, image: RgbImage, target: Target) -> DatasetResult<(RgbImage, Target)> {
        self(image, target)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformPipeline {
    /// Resize every image to this (width, height); boxes are rescaled.
    pub target_size: Option<(u32, u32)>,
    /// Probability of a horizontal flip.
    pub flip_horizontal_prob: f32,
    /// Probability of a light brightness/contrast jitter.
    pub color_jitter_prob: f32,
    /// Max jitter scale for brightness/contrast.
    pub color_jitter_strength: f32,
    /// Per-sample deterministic RNG (`seed ^ image_id`) when set.
    pub seed: Option<u64>,
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::evaluation()
    }
}

impl TransformPipeline {
    /// Random horizontal flip with p = 0.5.
    pub fn training() -> Self {
        Self {
            flip_horizontal_prob: 0.5,
            ..Self::evaluation()
        }
    }

    /// Identity: no resize, no augmentation.
    pub fn evaluation() -> Self {
        Self {
            target_size: None,
            flip_horizontal_prob: 0.0,
            color_jitter_prob: 0.0,
            color_jitter_strength: 0.1,
            seed: None,
        }
    }

    /// One-line summary for run logs.
    pub fn describe(&self) -> String {
        let size = match self.target_size {
            Some((w, h)) => format!("{w}x{h}"),
            None => "native".into(),
        };
        format!(
            "size={size} flip_p={:.2} jitter_p={:.2}/{:.2} seeded={}",
            self.flip_horizontal_prob,
            self.color_jitter_prob,
            self.color_jitter_strength,
            self.seed.is_some()
        )
    }
}

impl SampleTransform for TransformPipeline {
    fn apply(&self, img: RgbImage, mut target: Target) -> DatasetResult<(RgbImage, Target)> {
        let mut rng_local;
        let mut seeded_rng;
        let rng: &mut dyn rand::RngCore = if let Some(seed) = self.seed {
            seeded_rng = rand::rngs::StdRng::seed_from_u64(seed ^ target.image_id);
            &mut seeded_rng
        } else {
            rng_local = rand::rng();
            &mut rng_local
        };

        let mut img = match self.target_size {
            Some((w, h)) if (w, h) != img.dimensions() && w > 0 && h > 0 => {
                let (src_w, src_h) = img.dimensions();
                let sx = w as f32 / src_w.max(1) as f32;
                let sy = h as f32 / src_h.max(1) as f32;
                for b in target.boxes.iter_mut() {
                    b[0] *= sx;
                    b[1] *= sy;
                    b[2] *= sx;
                    b[3] *= sy;
                }
                image::imageops::resize(&img, w, h, FilterType::Triangle)
            }
            _ => img,
        };

        maybe_hflip(&mut img, &mut target.boxes, self.flip_horizontal_prob, rng);
        maybe_jitter(
            &mut img,
            self.color_jitter_prob,
            self.color_jitter_strength,
            rng,
        );
        Ok((img, target))
    }
}

#[derive(Debug, Clone)]
pub struct TransformPipelineBuilder {
    inner: TransformPipeline,
}

impl Default for TransformPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformPipelineBuilder {
    pub fn new() -> Self {
        Self {
            inner: TransformPipeline::evaluation(),
        }
    }
    pub fn target_size(mut self, size: Option<(u32, u32)>) -> Self {
        self.inner.target_size = size;
        self
    }
    pub fn flip_horizontal_prob(mut self, p: f32) -> Self {
        self.inner.flip_horizontal_prob = p;
        self
    }
    pub fn color_jitter(mut self, prob: f32, strength: f32) -> Self {
        self.inner.color_jitter_prob = prob;
        self.inner.color_jitter_strength = strength;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.inner.seed = seed;
        self
    }
    pub fn build(self) -> TransformPipeline {
        self.inner
    }
}

/// Mirror the image and its pixel-space boxes around the vertical axis.
pub(crate) fn maybe_hflip(
    img: &mut RgbImage,
    boxes: &mut [[f32; 4]],
    prob: f32,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) < prob {
        let width = img.width() as f32;
        image::imageops::flip_horizontal_in_place(img);
        for b in boxes.iter_mut() {
            let x0 = b[0];
            let x1 = b[2];
            b[0] = width - x1;
            b[2] = width - x0;
        }
    }
}

/// Random contrast change and brightness shift, each up to `strength` of full scale.
pub(crate) fn maybe_jitter(
    img: &mut RgbImage,
    prob: f32,
    strength: f32,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 || strength <= 0.0 || rng.random_range(0.0..1.0) >= prob {
        return;
    }
    let strength = strength.min(1.0);
    let contrast_pct = rng.random_range(-strength..=strength) * 100.0;
    let shift = (rng.random_range(-strength..=strength) * 255.0).round() as i32;
    image::imageops::colorops::contrast_in_place(img, contrast_pct);
    image::imageops::colorops::brighten_in_place(img, shift);
}
