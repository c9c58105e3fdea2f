//! # percent-sdm
//!
//! Pure Rust training of multi-scale Supervised Descent Method (SDM)
//! landmark cascades.
//!
//! This crate provides:
//! - **Cascade training**: one regressor cascade per pyramid scale, trained
//!   coarse to fine on perturbed initial shapes
//! - **Incremental learning**: images may arrive in batches; the first batch
//!   trains every stage, later batches update it
//! - **Fitting**: run the trained cascade from a bounding box
//!
//! Implements the algorithm from "Supervised Descent Method and its
//! Applications to Face Alignment" (Xiong & De la Torre, 2013).
//!
//! ## Algorithm Overview
//!
//! 1. Estimate a reference shape (mean of the ground truth, optionally scaled
//!    to a fixed bounding-box diagonal) and normalize every image to it
//! 2. Place the reference shape into each image's bounding box, plus noisy
//!    perturbations of that box, to get the initial estimates
//! 3. For each scale:
//!    - Compute holistic features (reused when the previous scale used the same one)
//!    - Resample the feature images to the scale
//!    - Train the scale's stage, which regresses shape updates from patch features
//!    - Carry the refined estimates to the next scale
//!
//! ## Quick Start
//!
//! ```ignore
//! use percent_sdm::{io, CascadeTrainer, TrainOptions, TrainerConfig};
//!
//! let images = io::import_images("lfpw/trainset".as_ref())?;
//! let config = TrainerConfig::builder()
//!     .scales([0.5, 1.0])
//!     .n_perturbations(10)
//!     .build()?;
//!
//! let mut trainer = CascadeTrainer::regularized_sdm(config, 1.0)?;
//! let report = trainer.train(images, &TrainOptions::default().with_batch_size(100))?;
//! println!("{trainer}");
//! ```
//!
//! ## Custom Stages
//!
//! Any regression family can sit in the cascade by implementing
//! [`CascadeStage`] and passing a factory to [`CascadeTrainer::new`].

mod config;
mod error;
mod features;
mod images;
pub mod io;
mod perturb;
mod reference;
mod regression;
mod report;
mod stage;
mod trainer;
mod transform;
mod types;

pub use config::{PerScale, ScaleLevel, TrainerConfig, TrainerConfigBuilder, MIN_DIAGONAL};
pub use error::{Error, Result};
pub use features::{
    compute_features, extract_patch_features, no_op, raw_patch, Gradient, HolisticFeature, NoOp,
    OrientationHistogram, Patch, PatchFeature, RawPatch,
};
pub use images::{Image, ImageAccess, LandmarkGroups};
pub use perturb::{NoiseType, NoisyBoundingBox, ShapePerturber};
pub use reference::{compute_reference_shape, rescale_to_diagonal, rescale_to_reference_shape};
pub use regression::IncrementalRidge;
pub use report::{
    BatchReport, FittingResult, PerturbationSource, ScaleReport, StageMode, TrainReport,
    TrainerWarning,
};
pub use stage::{mean_error, CascadeStage, StageConfig, SupervisedDescentStage};
pub use trainer::{CascadeTrainer, TrainOptions, GT_BB_NAMESPACE};
pub use transform::{
    align_shape_with_bounding_box, find_similarity_transform, scale_estimates,
    uniform_scale_between, SimilarityTransform2D,
};
pub use types::{BoundingBox, Point, Shape};
