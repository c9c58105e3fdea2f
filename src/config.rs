//! Trainer configuration and the per-scale ladder it resolves to.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::features::{no_op, raw_patch, HolisticFeature, PatchFeature};
use crate::types::Shape;

/// Smallest accepted reference diagonal, in pixels.
pub const MIN_DIAGONAL: f32 = 20.0;

/// A setting given once for every scale, or once per scale.
#[derive(Debug, Clone)]
pub enum PerScale<T> {
    Shared(T),
    Each(Vec<T>),
}

impl<T: Clone> PerScale<T> {
    fn resolve(&self, n_scales: usize, what: &str) -> Result<Vec<T>> {
        match self {
            PerScale::Shared(value) => Ok(vec![value.clone(); n_scales]),
            PerScale::Each(values) if values.len() == n_scales => Ok(values.clone()),
            PerScale::Each(values) => Err(Error::InvalidConfig(format!(
                "{what} must be given once or once per scale ({n_scales}), got {}",
                values.len()
            ))),
        }
    }
}

/// Everything needed to build a [`CascadeTrainer`](crate::CascadeTrainer).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Reference shape bounding-box diagonal; `None` keeps the mean's own size.
    pub diagonal: Option<f32>,
    /// Pyramid scale factors, index 0 first (coarsest by convention).
    pub scales: Vec<f32>,
    pub holistic_features: PerScale<Arc<dyn HolisticFeature>>,
    pub patch_features: PerScale<Arc<dyn PatchFeature>>,
    /// Patch (height, width).
    pub patch_shapes: PerScale<(usize, usize)>,
    pub n_iterations: PerScale<usize>,
    pub n_perturbations: usize,
    pub batch_size: Option<usize>,
    pub verbose: bool,
    /// Known reference shape; computed from the first batch otherwise.
    pub reference_shape: Option<Shape>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            diagonal: None,
            scales: vec![0.5, 1.0],
            holistic_features: PerScale::Shared(no_op()),
            patch_features: PerScale::Shared(raw_patch()),
            patch_shapes: PerScale::Shared((17, 17)),
            n_iterations: PerScale::Shared(6),
            n_perturbations: 30,
            batch_size: None,
            verbose: false,
            reference_shape: None,
        }
    }
}

/// One resolved pyramid level.
#[derive(Debug, Clone)]
pub struct ScaleLevel {
    pub scale: f32,
    pub holistic_feature: Arc<dyn HolisticFeature>,
    pub patch_feature: Arc<dyn PatchFeature>,
    pub patch_shape: (usize, usize),
    pub n_iterations: usize,
}

impl TrainerConfig {
    pub fn builder() -> TrainerConfigBuilder {
        TrainerConfigBuilder::new()
    }

    /// Check every setting and expand per-scale values into the ladder.
    pub fn validate(&self) -> Result<Vec<ScaleLevel>> {
        if let Some(diagonal) = self.diagonal {
            if !diagonal.is_finite() || diagonal < MIN_DIAGONAL {
                return Err(Error::InvalidConfig(format!(
                    "diagonal must be at least {MIN_DIAGONAL}, got {diagonal}"
                )));
            }
        }
        if self.scales.is_empty() {
            return Err(Error::InvalidConfig("at least one scale is required".into()));
        }
        if let Some(bad) = self.scales.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "scales must be positive, got {bad}"
            )));
        }
        if self.n_perturbations == 0 {
            return Err(Error::InvalidConfig(
                "n_perturbations must be at least 1".into(),
            ));
        }
        validate_batch_size(self.batch_size)?;

        let n_scales = self.scales.len();
        let holistic = self.holistic_features.resolve(n_scales, "holistic features")?;
        let patch = self.patch_features.resolve(n_scales, "patch features")?;
        let patch_shapes = self.patch_shapes.resolve(n_scales, "patch shapes")?;
        let n_iterations = self.n_iterations.resolve(n_scales, "iteration counts")?;

        if let Some(shape) = patch_shapes.iter().find(|(h, w)| *h == 0 || *w == 0) {
            return Err(Error::InvalidConfig(format!(
                "patch shape dimensions must be positive, got {shape:?}"
            )));
        }
        if n_iterations.iter().any(|n| *n == 0) {
            return Err(Error::InvalidConfig(
                "each scale needs at least one iteration".into(),
            ));
        }

        Ok(self
            .scales
            .iter()
            .zip(holistic)
            .zip(patch)
            .zip(patch_shapes)
            .zip(n_iterations)
            .map(
                |((((scale, holistic_feature), patch_feature), patch_shape), n_iterations)| {
                    ScaleLevel {
                        scale: *scale,
                        holistic_feature,
                        patch_feature,
                        patch_shape,
                        n_iterations,
                    }
                },
            )
            .collect())
    }
}

pub(crate) fn validate_batch_size(batch_size: Option<usize>) -> Result<()> {
    if batch_size == Some(0) {
        return Err(Error::InvalidConfig("batch_size must be at least 1".into()));
    }
    Ok(())
}

/// Builder for [`TrainerConfig`].
pub struct TrainerConfigBuilder {
    config: TrainerConfig,
}

impl TrainerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TrainerConfig::default(),
        }
    }

    pub fn diagonal(mut self, diagonal: f32) -> Self {
        self.config.diagonal = Some(diagonal);
        self
    }

    pub fn scales(mut self, scales: impl Into<Vec<f32>>) -> Self {
        self.config.scales = scales.into();
        self
    }

    /// Same holistic feature at every scale; computed once per batch.
    pub fn holistic_feature(mut self, feature: Arc<dyn HolisticFeature>) -> Self {
        self.config.holistic_features = PerScale::Shared(feature);
        self
    }

    pub fn holistic_features(mut self, features: Vec<Arc<dyn HolisticFeature>>) -> Self {
        self.config.holistic_features = PerScale::Each(features);
        self
    }

    pub fn patch_feature(mut self, feature: Arc<dyn PatchFeature>) -> Self {
        self.config.patch_features = PerScale::Shared(feature);
        self
    }

    pub fn patch_features(mut self, features: Vec<Arc<dyn PatchFeature>>) -> Self {
        self.config.patch_features = PerScale::Each(features);
        self
    }

    pub fn patch_shape(mut self, height: usize, width: usize) -> Self {
        self.config.patch_shapes = PerScale::Shared((height, width));
        self
    }

    pub fn patch_shapes(mut self, shapes: Vec<(usize, usize)>) -> Self {
        self.config.patch_shapes = PerScale::Each(shapes);
        self
    }

    pub fn n_iterations(mut self, n: usize) -> Self {
        self.config.n_iterations = PerScale::Shared(n);
        self
    }

    pub fn n_iterations_per_scale(mut self, n: Vec<usize>) -> Self {
        self.config.n_iterations = PerScale::Each(n);
        self
    }

    pub fn n_perturbations(mut self, n: usize) -> Self {
        self.config.n_perturbations = n;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = Some(batch_size);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    pub fn reference_shape(mut self, shape: Shape) -> Self {
        self.config.reference_shape = Some(shape);
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<TrainerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for TrainerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
