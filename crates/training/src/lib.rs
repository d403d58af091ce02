#![recursion_limit = "256"]

pub mod config;
pub mod schedule;
pub mod step;
pub mod util;

pub use config::{TrainArgs, TrainConfig};
pub use models::{RegionDetector, RegionDetectorConfig};
pub use schedule::{StepLr, WarmupLr};
pub use step::{Checkpoint, DetectorOptimizer, DetectorTrainer, TrainStep};
pub use util::{
    fit, load_checkpoint, run, setup, train_one_epoch, EpochSummary, RunReport, TrainingSetup,
};

/// Backend alias for training (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

/// Autodiff wrapper used for the optimizer loop.
pub type ADBackend = burn::backend::Autodiff<TrainBackend>;

/// Human-readable name of the compiled-in backend.
pub fn backend_name() -> &'static str {
    if cfg!(feature = "backend-wgpu") {
        "wgpu"
    } else {
        "ndarray"
    }
}
