//! Indexed `.npz` sample store, augmentation, and Burn-compatible batching.
//!
//! This crate provides:
//! - Decoding of per-sample archives (`arr_0` image, `arr_1` boxes, `arr_2` labels)
//! - A fixed-size, randomly indexable store over `<root>/<index>.npz`
//! - Sample transforms (resize, horizontal flip, color jitter)
//! - A multi-threaded batch loader producing Burn tensors

pub mod archive;
pub mod aug;
pub mod batch;
pub mod store;
pub mod types;

pub use archive::{read_archive, ArchiveContents, ARCHIVE_EXTENSION};
pub use aug::{SampleTransform, TransformPipeline, TransformPipelineBuilder};
pub use batch::{collate, BatchIter, DataLoader, DetectionBatch, LoaderConfig};
pub use store::{sample_path, SampleStore};
pub use types::*;
