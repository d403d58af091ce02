//! Core types, error definitions, and data structures for npz_dataset.

use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("sample file at {path} does not exist")]
    NotFound { path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive decode error at {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: ndarray_npy::ReadNpzError,
    },
    #[error("malformed archive at {path}: {msg}")]
    Malformed { path: PathBuf, msg: String },
    #[error("target invariant violated for image {image_id}: {boxes} boxes vs {labels} labels")]
    Unpaired {
        image_id: u64,
        boxes: usize,
        labels: usize,
    },
    #[error("{0}")]
    Other(String),
}

/// Annotation for one image. Boxes are pixel-space `[x0, y0, x1, y1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub boxes: Vec<[f32; 4]>,
    /// Class ids, parallel to `boxes`.
    pub labels: Vec<i64>,
    pub image_id: u64,
}

impl Target {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Errors if `boxes` and `labels` have drifted apart.
    pub fn check_paired(&self) -> DatasetResult<()> {
        if self.boxes.len() != self.labels.len() {
            return Err(DatasetError::Unpaired {
                image_id: self.image_id,
                boxes: self.boxes.len(),
                labels: self.labels.len(),
            });
        }
        Ok(())
    }

    /// Boxes scaled into `0..1` by the image dimensions.
    pub fn normalized_boxes(&self, width: u32, height: u32) -> Vec<[f32; 4]> {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        self.boxes
            .iter()
            .map(|b| {
                [
                    (b[0] / w).clamp(0.0, 1.0),
                    (b[1] / h).clamp(0.0, 1.0),
                    (b[2] / w).clamp(0.0, 1.0),
                    (b[3] / h).clamp(0.0, 1.0),
                ]
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub image: image::RgbImage,
    pub target: Target,
}

impl Sample {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}
