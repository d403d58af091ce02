//! Learning-rate schedules.

/// Decays the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    epoch: usize,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            epoch: 0,
        }
    }

    /// Epochs completed so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Rate for the current epoch.
    pub fn lr(&self) -> f64 {
        self.lr_at(self.epoch)
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        let decays = (epoch / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    /// Advance one epoch; returns the new rate.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.lr()
    }
}

/// Linear warmup applied per iteration within the first epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupLr {
    start_factor: f64,
    iters: usize,
}

impl WarmupLr {
    pub const START_FACTOR: f64 = 1.0 / 1000.0;

    pub fn new(start_factor: f64, iters: usize) -> Self {
        Self {
            start_factor,
            iters,
        }
    }

    /// Warmup spanning `min(max_iters, batches - 1)` iterations.
    pub fn for_epoch(batches: usize, max_iters: usize) -> Self {
        Self::new(Self::START_FACTOR, max_iters.min(batches.saturating_sub(1)))
    }

    pub fn iters(&self) -> usize {
        self.iters
    }

    /// Multiplier for iteration `iter` (0-based).
    pub fn factor(&self, iter: usize) -> f64 {
        if iter >= self.iters {
            return 1.0;
        }
        let alpha = iter as f64 / self.iters as f64;
        self.start_factor * (1.0 - alpha) + alpha
    }
}
