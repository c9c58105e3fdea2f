//! Summaries of training runs and fitting results.

use serde::Serialize;

use crate::types::Shape;

/// Which stage entry point a batch used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    Train,
    Increment,
}

/// Where a batch's initial estimates came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PerturbationSource {
    /// A single seed box per image, `generated` noisy boxes added to it.
    Generated { seed_key: String, generated: usize },
    /// The caller attached `count` boxes per image; they are used as-is.
    Supplied { count: usize },
}

impl PerturbationSource {
    /// Estimates per image this source yields.
    pub fn count(&self) -> usize {
        match self {
            PerturbationSource::Generated { generated, .. } => generated + 1,
            PerturbationSource::Supplied { count } => *count,
        }
    }
}

/// Non-fatal conditions surfaced during training.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainerWarning {
    /// The reference shape was estimated from the first of several batches.
    ReferenceFromFirstBatch,
    /// Supplied bounding boxes overrode the configured perturbation count.
    PerturbationCountReset { configured: usize, found: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleReport {
    pub scale: f32,
    /// Holistic features were computed rather than reused from the previous scale.
    pub features_computed: bool,
    /// Feature images were resampled (scale differs from 1).
    pub rescaled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub n_images: usize,
    pub mode: StageMode,
    pub perturbations: PerturbationSource,
    pub scales: Vec<ScaleReport>,
    /// Final estimates per image, in the finest scale's frame.
    pub estimates_per_image: Vec<usize>,
    /// Mean point-to-point error of the final estimates at the finest scale.
    pub mean_error: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainReport {
    pub batches: Vec<BatchReport>,
    pub warnings: Vec<TrainerWarning>,
}

impl TrainReport {
    pub fn n_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn n_images(&self) -> usize {
        self.batches.iter().map(|b| b.n_images).sum()
    }
}

/// Outcome of running a trained cascade on one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FittingResult {
    /// Reference shape placed in the initial bounding box.
    pub initial_shape: Shape,
    pub final_shape: Shape,
    /// Estimate after every iteration of every scale, coarse to fine.
    pub iterations: Vec<Shape>,
}

impl FittingResult {
    pub fn n_iterations(&self) -> usize {
        self.iterations.len()
    }

    pub fn initial_error(&self, gt_shape: &Shape) -> f32 {
        self.initial_shape.mean_distance(gt_shape)
    }

    pub fn final_error(&self, gt_shape: &Shape) -> f32 {
        self.final_shape.mean_distance(gt_shape)
    }
}
