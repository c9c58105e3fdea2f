//! The cascade training orchestrator.
//!
//! Training runs strictly in sequence: batches, then scales (index 0 first),
//! then the scale's stage. Each stage consumes the estimates the previous
//! scale produced, so nothing here can be reordered or run concurrently.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{validate_batch_size, ScaleLevel, TrainerConfig};
use crate::error::{Error, Result};
use crate::features::compute_features;
use crate::images::{Image, LandmarkGroups};
use crate::perturb::{NoisyBoundingBox, ShapePerturber};
use crate::reference::{compute_reference_shape, rescale_to_reference_shape};
use crate::report::{
    BatchReport, FittingResult, PerturbationSource, ScaleReport, StageMode, TrainReport,
    TrainerWarning,
};
use crate::stage::{mean_error, CascadeStage, StageConfig, SupervisedDescentStage};
use crate::transform::{align_shape_with_bounding_box, scale_estimates, uniform_scale_between};
use crate::types::{BoundingBox, Shape};

/// Key namespace for bounding boxes synthesized from ground truth.
pub const GT_BB_NAMESPACE: &str = "__gt_bb_";

macro_rules! progress {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// Per-call training options.
#[derive(Debug, Clone, Default)]
pub struct TrainOptions {
    /// Ground-truth landmark group; the first group of the first image if unset.
    pub group: Option<String>,
    /// Namespace of caller-supplied initial boxes; ground truth boxes if unset.
    pub bounding_box_group: Option<String>,
    /// Overrides the configured batch size.
    pub batch_size: Option<usize>,
}

impl TrainOptions {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_bounding_box_group(mut self, group: impl Into<String>) -> Self {
        self.bounding_box_group = Some(group.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// Multi-scale supervised descent trainer.
///
/// # Usage
///
/// ```ignore
/// let config = TrainerConfig::builder().scales([0.5, 1.0]).n_perturbations(10).build()?;
/// let mut trainer = CascadeTrainer::regularized_sdm(config, 1.0)?;
/// let report = trainer.train(images, &TrainOptions::default())?;
/// let result = trainer.fit_from_bb(&image, &face_box)?;
/// ```
pub struct CascadeTrainer {
    levels: Vec<ScaleLevel>,
    stages: Vec<Box<dyn CascadeStage>>,
    perturber: Box<dyn ShapePerturber>,
    diagonal: Option<f32>,
    batch_size: Option<usize>,
    verbose: bool,

    /// Set once, from the config or the first batch; never replaced.
    reference_shape: Option<Shape>,

    /// Effective perturbation count. Starts at the configured value and is
    /// overwritten when supplied bounding boxes disagree with it.
    n_perturbations: usize,

    /// Latched after the first batch completes.
    trained: bool,
}

impl CascadeTrainer {
    /// Validate `config` and create one stage per scale with `factory`.
    pub fn new<F>(config: TrainerConfig, mut factory: F) -> Result<Self>
    where
        F: FnMut(StageConfig) -> Box<dyn CascadeStage>,
    {
        let levels = config.validate()?;
        let stages = levels
            .iter()
            .map(|level| {
                factory(StageConfig {
                    patch_feature: Arc::clone(&level.patch_feature),
                    patch_shape: level.patch_shape,
                    n_iterations: level.n_iterations,
                })
            })
            .collect();

        Ok(Self {
            levels,
            stages,
            perturber: Box::new(NoisyBoundingBox::default()),
            diagonal: config.diagonal,
            batch_size: config.batch_size,
            verbose: config.verbose,
            reference_shape: config.reference_shape,
            n_perturbations: config.n_perturbations,
            trained: false,
        })
    }

    /// Supervised Descent Method with unregularized Newton stages.
    pub fn sdm(config: TrainerConfig) -> Result<Self> {
        Self::new(config, |cfg| Box::new(SupervisedDescentStage::newton(cfg)))
    }

    /// Supervised Descent Method with ridge-regularized stages.
    pub fn regularized_sdm(config: TrainerConfig, alpha: f64) -> Result<Self> {
        Self::new(config, move |cfg| {
            Box::new(SupervisedDescentStage::regularized(cfg, alpha))
        })
    }

    /// Replace the initial-shape perturbation strategy.
    pub fn with_perturber(mut self, perturber: impl ShapePerturber + 'static) -> Self {
        self.perturber = Box::new(perturber);
        self
    }

    pub fn reference_shape(&self) -> Option<&Shape> {
        self.reference_shape.as_ref()
    }

    pub fn n_perturbations(&self) -> usize {
        self.n_perturbations
    }

    pub fn n_scales(&self) -> usize {
        self.levels.len()
    }

    pub fn scales(&self) -> impl Iterator<Item = f32> + '_ {
        self.levels.iter().map(|l| l.scale)
    }

    pub fn levels(&self) -> &[ScaleLevel] {
        &self.levels
    }

    pub fn stages(&self) -> &[Box<dyn CascadeStage>] {
        &self.stages
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Train on `images`. The first batch fits every stage from scratch,
    /// later batches extend the fit.
    pub fn train<I>(&mut self, images: I, options: &TrainOptions) -> Result<TrainReport>
    where
        I: IntoIterator<Item = Image>,
    {
        self.run_batches(images, options, false)
    }

    /// Extend an existing fit; every batch increments.
    pub fn increment<I>(&mut self, images: I, options: &TrainOptions) -> Result<TrainReport>
    where
        I: IntoIterator<Item = Image>,
    {
        self.run_batches(images, options, true)
    }

    fn run_batches<I>(
        &mut self,
        images: I,
        options: &TrainOptions,
        increment: bool,
    ) -> Result<TrainReport>
    where
        I: IntoIterator<Item = Image>,
    {
        validate_batch_size(options.batch_size)?;
        let batch_size = options.batch_size.or(self.batch_size);
        let mut source = images.into_iter();
        let mut report = TrainReport::default();
        let mut resolved_group = options.group.clone();

        for index in 0.. {
            // Pull one batch at a time so unbounded sources work.
            let batch: Vec<Image> = match batch_size {
                Some(n) => source.by_ref().take(n).collect(),
                None => source.by_ref().collect(),
            };
            if batch.is_empty() {
                break;
            }

            // Resolved once; every later batch is assumed to use the same name.
            let group = match &resolved_group {
                Some(group) => group.clone(),
                None => {
                    let first = batch[0]
                        .landmarks
                        .first_label()
                        .ok_or(Error::NoLandmarks)?
                        .to_string();
                    resolved_group = Some(first.clone());
                    first
                }
            };

            let mode = if increment || index > 0 {
                StageMode::Increment
            } else {
                StageMode::Train
            };
            let batch_report = self.train_batch(
                index,
                batch,
                &group,
                options.bounding_box_group.as_deref(),
                mode,
                batch_size.is_some(),
                &mut report.warnings,
            )?;
            report.batches.push(batch_report);
            self.trained = true;
        }

        if report.batches.is_empty() {
            return Err(Error::NoTrainingImages);
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn train_batch(
        &mut self,
        index: usize,
        batch: Vec<Image>,
        group: &str,
        bounding_box_group: Option<&str>,
        mode: StageMode,
        batching: bool,
        warnings: &mut Vec<TrainerWarning>,
    ) -> Result<BatchReport> {
        let verbose = self.verbose;
        progress!(verbose, "Computing batch {} ({} images)", index, batch.len());

        let reference = self.establish_reference_shape(&batch, group, batching, warnings)?;

        let mut batch = batch
            .iter()
            .map(|image| rescale_to_reference_shape(image, group, &reference))
            .collect::<Result<Vec<_>>>()?;

        // Ground-truth boxes are regenerated for every batch, so increments
        // see exactly what a single full batch would.
        let namespace = match bounding_box_group {
            Some(namespace) => namespace.to_string(),
            None => {
                for image in &mut batch {
                    let gt_box = image.landmarks.require(group)?.bounding_box().corners();
                    image
                        .landmarks
                        .insert(format!("{GT_BB_NAMESPACE}0"), gt_box);
                }
                GT_BB_NAMESPACE.to_string()
            }
        };

        let bb_keys = batch[0].landmarks.keys_matching(&namespace);
        let perturbations = match bb_keys.as_slice() {
            [] => return Err(Error::MissingLandmarkGroup(namespace)),
            [seed_key] => {
                let generated =
                    self.generate_perturbations(&mut batch, group, &namespace, seed_key)?;
                PerturbationSource::Generated {
                    seed_key: seed_key.clone(),
                    generated,
                }
            }
            supplied => {
                if let Some(warning) = self.reconcile_perturbation_count(supplied.len()) {
                    warnings.push(warning);
                }
                PerturbationSource::Supplied {
                    count: supplied.len(),
                }
            }
        };
        let bb_keys = batch[0].landmarks.keys_matching(&namespace);

        let n_scales = self.levels.len();
        let mut scales = Vec::with_capacity(n_scales);
        let mut feature_images: Vec<Image> = Vec::new();
        let mut current: Vec<Vec<Shape>> = Vec::new();
        let mut final_error = 0.0;

        for j in 0..n_scales {
            let level = &self.levels[j];
            let prefix = if n_scales > 1 {
                format!("Scale {j}: ")
            } else {
                String::new()
            };

            let features_computed =
                j == 0 || !Arc::ptr_eq(&level.holistic_feature, &self.levels[j - 1].holistic_feature);
            if features_computed {
                progress!(
                    verbose,
                    "{}Computing {} features",
                    prefix,
                    level.holistic_feature.name()
                );
                feature_images = compute_features(&batch, level.holistic_feature.as_ref());
            }

            let rescaled = level.scale != 1.0;
            let scaled_images: Cow<'_, [Image]> = if rescaled {
                progress!(verbose, "{}Scaling images by {}", prefix, level.scale);
                Cow::Owned(
                    feature_images
                        .iter()
                        .map(|image| image.rescale(level.scale))
                        .collect::<Result<Vec<_>>>()?,
                )
            } else {
                Cow::Borrowed(feature_images.as_slice())
            };

            let gt_shapes = scaled_images
                .iter()
                .map(|image| image.landmarks.require(group).cloned())
                .collect::<Result<Vec<_>>>()?;

            if j == 0 {
                progress!(
                    verbose,
                    "{}Generating {} perturbations per image",
                    prefix,
                    bb_keys.len()
                );
                current = seed_estimates(&scaled_images, &bb_keys, &reference)?;
            }

            let stage = &mut self.stages[j];
            current = match mode {
                StageMode::Train => stage.train(&scaled_images, &gt_shapes, current)?,
                StageMode::Increment => stage.increment(&scaled_images, &gt_shapes, current)?,
            };
            if let Some(count) = current.iter().map(Vec::len).find(|n| *n != bb_keys.len()) {
                return Err(Error::InconsistentBatch(format!(
                    "stage {j} returned {count} estimates for an image, expected {}",
                    bb_keys.len()
                )));
            }

            if j + 1 < n_scales {
                current = scale_estimates(&current, self.levels[j + 1].scale / level.scale);
            } else {
                final_error = mean_error(&gt_shapes, &current);
            }

            scales.push(ScaleReport {
                scale: level.scale,
                features_computed,
                rescaled,
            });
        }

        progress!(verbose, "Batch {} done, mean error {:.4}", index, final_error);
        Ok(BatchReport {
            index,
            n_images: batch.len(),
            mode,
            perturbations,
            scales,
            estimates_per_image: current.iter().map(Vec::len).collect(),
            mean_error: final_error,
        })
    }

    /// Latch the reference shape from this batch if none is set yet.
    fn establish_reference_shape(
        &mut self,
        batch: &[Image],
        group: &str,
        batching: bool,
        warnings: &mut Vec<TrainerWarning>,
    ) -> Result<Shape> {
        if let Some(reference) = &self.reference_shape {
            return Ok(reference.clone());
        }
        if batching {
            warn!(
                "No reference shape was provided. The mean of the first batch will be the \
                 reference shape; if it is not representative of the population this may \
                 cause issues."
            );
            warnings.push(TrainerWarning::ReferenceFromFirstBatch);
        }
        let shapes = batch
            .iter()
            .map(|image| image.landmarks.require(group))
            .collect::<Result<Vec<_>>>()?;
        let reference = compute_reference_shape(&shapes, self.diagonal)?;
        Ok(self.reference_shape.insert(reference).clone())
    }

    /// Adopt the number of supplied boxes as the perturbation count.
    fn reconcile_perturbation_count(&mut self, found: usize) -> Option<TrainerWarning> {
        if found == self.n_perturbations {
            return None;
        }
        warn!(
            configured = self.n_perturbations,
            found,
            "n_perturbations reset to agree with the provided bounding box group"
        );
        let warning = TrainerWarning::PerturbationCountReset {
            configured: self.n_perturbations,
            found,
        };
        self.n_perturbations = found;
        Some(warning)
    }

    /// Add `n_perturbations - 1` noisy boxes next to the seed box of every image.
    fn generate_perturbations(
        &mut self,
        batch: &mut [Image],
        group: &str,
        namespace: &str,
        seed_key: &str,
    ) -> Result<usize> {
        let n_new = self.n_perturbations - 1;
        progress!(
            self.verbose,
            "Generating {} new initial bounding boxes per image",
            n_new
        );
        // The seed itself is a valid initialization and stays untouched, so
        // its key is never reused for a generated box.
        let keys: Vec<String> = (1..)
            .map(|j| format!("{namespace}_{j}"))
            .filter(|key| key != seed_key)
            .take(n_new)
            .collect();
        for image in batch.iter_mut() {
            let gt_box = image.landmarks.require(group)?.bounding_box().corners();
            let seed = image.landmarks.require(seed_key)?.clone();
            for key in &keys {
                let noisy = self.perturber.perturb(&gt_box, &seed);
                image.landmarks.insert(key.as_str(), noisy);
            }
        }
        Ok(n_new)
    }

    /// Fit the trained cascade starting from `bbox`.
    pub fn fit_from_bb(&self, image: &Image, bbox: &BoundingBox) -> Result<FittingResult> {
        let reference = self.reference_shape.as_ref().ok_or(Error::NotTrained)?;
        if !self.trained {
            return Err(Error::NotTrained);
        }

        let initial_shape = align_shape_with_bounding_box(reference, bbox);
        let to_reference = uniform_scale_between(&initial_shape, reference);
        let normalized = image
            .clone()
            .with_landmarks(LandmarkGroups::new())
            .rescale(to_reference)?;

        let mut feature_image = self.levels[0].holistic_feature.compute(&normalized);
        let mut shape = initial_shape.scaled(to_reference * self.levels[0].scale);
        let mut iterations = Vec::new();

        for (j, level) in self.levels.iter().enumerate() {
            if j > 0 && !Arc::ptr_eq(&level.holistic_feature, &self.levels[j - 1].holistic_feature) {
                feature_image = level.holistic_feature.compute(&normalized);
            }
            let scaled_image: Cow<'_, Image> = if level.scale != 1.0 {
                Cow::Owned(feature_image.rescale(level.scale)?)
            } else {
                Cow::Borrowed(&feature_image)
            };

            let to_original = 1.0 / (to_reference * level.scale);
            let shapes = self.stages[j].run(&scaled_image, &shape)?;
            iterations.extend(shapes.iter().map(|s| s.scaled(to_original)));
            if let Some(last) = shapes.into_iter().last() {
                shape = last;
            }

            if let Some(next) = self.levels.get(j + 1) {
                shape = shape.scaled(next.scale / level.scale);
            }
        }

        let last_scale = self.levels[self.levels.len() - 1].scale;
        let final_shape = shape.scaled(1.0 / (to_reference * last_scale));
        Ok(FittingResult {
            initial_shape,
            final_shape,
            iterations,
        })
    }

    /// Fit starting from the bounding box of `shape`.
    pub fn fit_from_shape(&self, image: &Image, shape: &Shape) -> Result<FittingResult> {
        self.fit_from_bb(image, &shape.bounding_box())
    }
}

/// Place the reference shape in every bounding box of every image.
fn seed_estimates(images: &[Image], bb_keys: &[String], reference: &Shape) -> Result<Vec<Vec<Shape>>> {
    images
        .iter()
        .map(|image| {
            bb_keys
                .iter()
                .map(|key| {
                    let bbox = image.landmarks.require(key)?.bounding_box();
                    Ok(align_shape_with_bounding_box(reference, &bbox))
                })
                .collect::<Result<Vec<_>>>()
        })
        .collect()
}

impl fmt::Display for CascadeTrainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let diagonal = self.diagonal.or_else(|| {
            self.reference_shape
                .as_ref()
                .map(|s| s.bounding_box().diagonal())
        });
        let regressor = self.stages.first().map(|s| s.name()).unwrap_or("none");
        let scales: Vec<f32> = self.scales().collect();

        writeln!(f, "Supervised Descent Method")?;
        writeln!(f, " - Regression performed using the {regressor} algorithm")?;
        writeln!(f, " - Scales: {scales:?}")?;
        for level in &self.levels {
            writeln!(f, "  - Scale {}", level.scale)?;
            writeln!(f, "   - {} iterations", level.n_iterations)?;
            writeln!(f, "   - Patch shape: {:?}", level.patch_shape)?;
            writeln!(f, "   - Holistic feature: {}", level.holistic_feature.name())?;
            writeln!(f, "   - Patch feature: {}", level.patch_feature.name())?;
        }
        writeln!(
            f,
            " - Perturbations generated per shape: {}",
            self.n_perturbations
        )?;
        match diagonal {
            Some(d) => writeln!(f, " - Images scaled to diagonal: {d:.2}")?,
            None => writeln!(f, " - Images scaled to diagonal: not set")?,
        }
        write!(
            f,
            " - Custom perturbation scheme used: {}",
            self.perturber.is_custom()
        )
    }
}

impl fmt::Debug for CascadeTrainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CascadeTrainer")
            .field("scales", &self.scales().collect::<Vec<_>>())
            .field("n_perturbations", &self.n_perturbations)
            .field("trained", &self.trained)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;

    fn template() -> Shape {
        Shape::new(vec![
            Point::new(0.30, 0.30),
            Point::new(0.70, 0.30),
            Point::new(0.50, 0.55),
            Point::new(0.35, 0.75),
            Point::new(0.65, 0.75),
        ])
    }

    fn image(offset: f32) -> Image {
        let shape = Shape::new(
            template()
                .points
                .iter()
                .map(|p| Point::new(20.0 + offset + p.x * 40.0, 20.0 + p.y * 40.0))
                .collect(),
        );
        let mut img = Image::from_fn(80, 80, |x, y| ((x + y) % 7) as f32 / 7.0);
        img.landmarks.insert("PTS", shape);
        img
    }

    fn config() -> TrainerConfig {
        TrainerConfig::builder()
            .scales([1.0])
            .patch_shape(3, 3)
            .n_iterations(1)
            .n_perturbations(2)
            .build()
            .unwrap()
    }

    #[test]
    fn reconcile_warns_only_on_divergence() {
        let mut trainer = CascadeTrainer::sdm(config()).unwrap();
        assert!(trainer.reconcile_perturbation_count(2).is_none());
        assert_eq!(
            trainer.reconcile_perturbation_count(4),
            Some(TrainerWarning::PerturbationCountReset {
                configured: 2,
                found: 4
            })
        );
        assert_eq!(trainer.n_perturbations(), 4);
        assert!(trainer.reconcile_perturbation_count(4).is_none());
    }

    #[test]
    fn reference_shape_is_latched() {
        let mut trainer = CascadeTrainer::sdm(config()).unwrap();
        let mut warnings = Vec::new();
        let first = trainer
            .establish_reference_shape(&[image(0.0)], "PTS", true, &mut warnings)
            .unwrap();
        let second = trainer
            .establish_reference_shape(&[image(10.0)], "PTS", true, &mut warnings)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(warnings, vec![TrainerWarning::ReferenceFromFirstBatch]);
    }

    #[test]
    fn generated_perturbations_follow_seed_key() {
        let mut trainer = CascadeTrainer::sdm(config())
            .unwrap()
            .with_perturber(|shape: &Shape, _bb: &Shape| shape.scaled(2.0));
        let mut batch = vec![image(0.0)];
        let seed = batch[0].landmarks.get("PTS").unwrap().bounding_box().corners();
        batch[0].landmarks.insert("box", seed);

        let n = trainer
            .generate_perturbations(&mut batch, "PTS", "box", "box")
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            batch[0].landmarks.keys_matching("box"),
            vec!["box".to_string(), "box_1".to_string()]
        );
    }

    #[test]
    fn generated_keys_skip_a_numbered_seed() {
        let mut trainer = CascadeTrainer::sdm(config())
            .unwrap()
            .with_perturber(|shape: &Shape, _bb: &Shape| shape.scaled(2.0));
        let mut batch = vec![image(0.0)];
        let seed = batch[0].landmarks.get("PTS").unwrap().bounding_box().corners();
        batch[0].landmarks.insert("box_1", seed.clone());

        trainer
            .generate_perturbations(&mut batch, "PTS", "box", "box_1")
            .unwrap();
        assert_eq!(
            batch[0].landmarks.keys_matching("box"),
            vec!["box_1".to_string(), "box_2".to_string()]
        );
        assert_eq!(batch[0].landmarks.get("box_1"), Some(&seed));
    }

    #[test]
    fn fitting_requires_training() {
        let trainer = CascadeTrainer::sdm(config()).unwrap();
        let bbox = BoundingBox::new(10.0, 10.0, 40.0, 40.0);
        assert!(matches!(
            trainer.fit_from_bb(&image(0.0), &bbox),
            Err(Error::NotTrained)
        ));
    }

    #[test]
    fn summary_mentions_configuration() {
        let trainer = CascadeTrainer::regularized_sdm(config(), 2.0).unwrap();
        let summary = trainer.to_string();
        assert!(summary.contains("Regularized Newton"));
        assert!(summary.contains("Perturbations generated per shape: 2"));
        assert!(summary.contains("Custom perturbation scheme used: false"));
    }
}
