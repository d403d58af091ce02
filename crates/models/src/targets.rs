//! Assignment of ground-truth boxes to region cells.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TargetError {
    #[error("label {label} is outside 0..{num_classes}")]
    LabelOutOfRange { label: i64, num_classes: usize },
    #[error("{boxes} boxes but {labels} labels")]
    Unpaired { boxes: usize, labels: usize },
    #[error("batch has {expected} images but {got} targets")]
    BatchMismatch { expected: usize, got: usize },
    #[error("model grid is {expected} but targets were built for {got}")]
    GridMismatch { expected: usize, got: usize },
}

/// Per-image, per-cell training targets for a `grid x grid` region map.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionTargets {
    pub grid: usize,
    /// Class id per cell, row-major; 0 is background.
    pub classes: Vec<i64>,
    /// Boxes laid out `[4, grid, grid]` to match the head output.
    pub boxes: Vec<f32>,
    /// 1.0 where `boxes` holds a target, same layout.
    pub box_mask: Vec<f32>,
}

impl RegionTargets {
    /// Number of cells holding a box target.
    pub fn assigned(&self) -> usize {
        let cells = self.grid * self.grid;
        self.box_mask[..cells].iter().filter(|v| **v > 0.0).count()
    }
}

/// Assign each normalized box to the cell containing its centre.
///
/// When several boxes land in one cell the later one wins.
pub fn assign_region_targets(
    boxes: &[[f32; 4]],
    labels: &[i64],
    grid: usize,
    num_classes: usize,
) -> Result<RegionTargets, TargetError> {
    if boxes.len() != labels.len() {
        return Err(TargetError::Unpaired {
            boxes: boxes.len(),
            labels: labels.len(),
        });
    }
    let grid = grid.max(1);
    let cells = grid * grid;
    let mut classes = vec![0i64; cells];
    let mut tgt = vec![0.0f32; 4 * cells];
    let mut mask = vec![0.0f32; 4 * cells];

    for (b, &label) in boxes.iter().zip(labels) {
        if label < 0 || label as usize >= num_classes {
            return Err(TargetError::LabelOutOfRange { label, num_classes });
        }
        let cx = (b[0] + b[2]) * 0.5;
        let cy = (b[1] + b[3]) * 0.5;
        let gx = (cx * grid as f32).clamp(0.0, (grid - 1) as f32) as usize;
        let gy = (cy * grid as f32).clamp(0.0, (grid - 1) as f32) as usize;
        let idx = gy * grid + gx;
        classes[idx] = label;
        for (c, v) in b.iter().enumerate() {
            tgt[c * cells + idx] = *v;
            mask[c * cells + idx] = 1.0;
        }
    }

    Ok(RegionTargets {
        grid,
        classes,
        boxes: tgt,
        box_mask: mask,
    })
}
