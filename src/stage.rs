//! Cascade stages: one regressor cascade per pyramid scale.
//!
//! A stage owns `n_iterations` linear regressors. At every iteration the
//! patch features around each current estimate are mapped to a shape update,
//! which is applied before the next iteration samples its features. Training
//! therefore fits each regressor on the residual left by the previous one.

use std::sync::Arc;

use nalgebra::DMatrix;
use tracing::debug;

use crate::error::{Error, Result};
use crate::features::{extract_patch_features, PatchFeature};
use crate::images::Image;
use crate::regression::IncrementalRidge;
use crate::types::Shape;

/// Per-scale parameters handed to a stage factory.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub patch_feature: Arc<dyn PatchFeature>,
    pub patch_shape: (usize, usize),
    pub n_iterations: usize,
}

/// One scale of the cascade.
///
/// `train` and `increment` take, per image, the current estimates for every
/// perturbation and return the corrected estimates with the same nesting.
pub trait CascadeStage {
    /// Regression family, for summaries.
    fn name(&self) -> &str;

    /// Fit from scratch.
    fn train(
        &mut self,
        images: &[Image],
        gt_shapes: &[Shape],
        current: Vec<Vec<Shape>>,
    ) -> Result<Vec<Vec<Shape>>>;

    /// Update the existing fit with new data.
    fn increment(
        &mut self,
        images: &[Image],
        gt_shapes: &[Shape],
        current: Vec<Vec<Shape>>,
    ) -> Result<Vec<Vec<Shape>>>;

    /// Refine one estimate; returns the shape after every iteration.
    fn run(&self, image: &Image, initial: &Shape) -> Result<Vec<Shape>>;

    /// Learned parameters, one matrix per iteration.
    fn parameters(&self) -> Vec<&DMatrix<f64>> {
        Vec::new()
    }
}

/// Supervised descent with a (ridge-)regularized Newton-like linear update.
#[derive(Debug, Clone)]
pub struct SupervisedDescentStage {
    config: StageConfig,
    regressors: Vec<IncrementalRidge>,
    name: String,
}

impl SupervisedDescentStage {
    /// Plain least-squares updates.
    pub fn newton(config: StageConfig) -> Self {
        let mut stage = Self::regularized(config, 0.0);
        stage.name = "Newton".to_string();
        stage
    }

    /// Ridge-regularized updates with coefficient `alpha`.
    pub fn regularized(config: StageConfig, alpha: f64) -> Self {
        let regressors = (0..config.n_iterations)
            .map(|_| IncrementalRidge::new(alpha, true))
            .collect();
        Self {
            config,
            regressors,
            name: format!("Regularized Newton (alpha={alpha})"),
        }
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn regressors(&self) -> &[IncrementalRidge] {
        &self.regressors
    }

    fn feature_row(&self, image: &Image, shape: &Shape) -> Vec<f32> {
        extract_patch_features(
            image,
            shape,
            self.config.patch_shape,
            self.config.patch_feature.as_ref(),
        )
    }

    fn fit(
        &mut self,
        images: &[Image],
        gt_shapes: &[Shape],
        mut current: Vec<Vec<Shape>>,
        reset: bool,
    ) -> Result<Vec<Vec<Shape>>> {
        check_batch(images, gt_shapes, &current)?;
        let n_rows: usize = current.iter().map(Vec::len).sum();
        if n_rows == 0 {
            return Ok(current);
        }

        for k in 0..self.regressors.len() {
            let mut features = Vec::new();
            let mut targets = Vec::new();
            for ((image, gt), estimates) in images.iter().zip(gt_shapes).zip(&current) {
                for shape in estimates {
                    features.extend(self.feature_row(image, shape));
                    targets.extend(
                        gt.points
                            .iter()
                            .zip(&shape.points)
                            .flat_map(|(g, s)| [g.x - s.x, g.y - s.y]),
                    );
                }
            }
            let x = to_matrix(n_rows, &features);
            let y = to_matrix(n_rows, &targets);

            let regressor = &mut self.regressors[k];
            if reset {
                regressor.train(&x, &y)?;
            } else {
                regressor.increment(&x, &y)?;
            }
            let deltas = regressor.predict(&x)?;

            let mut row = 0;
            for estimates in &mut current {
                for shape in estimates.iter_mut() {
                    apply_update(shape, deltas.row(row).iter());
                    row += 1;
                }
            }
            debug!(
                iteration = k,
                error = mean_error(gt_shapes, &current),
                "supervised descent update"
            );
        }
        Ok(current)
    }
}

impl CascadeStage for SupervisedDescentStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn train(
        &mut self,
        images: &[Image],
        gt_shapes: &[Shape],
        current: Vec<Vec<Shape>>,
    ) -> Result<Vec<Vec<Shape>>> {
        self.fit(images, gt_shapes, current, true)
    }

    fn increment(
        &mut self,
        images: &[Image],
        gt_shapes: &[Shape],
        current: Vec<Vec<Shape>>,
    ) -> Result<Vec<Vec<Shape>>> {
        self.fit(images, gt_shapes, current, false)
    }

    fn run(&self, image: &Image, initial: &Shape) -> Result<Vec<Shape>> {
        let mut shape = initial.clone();
        let mut shapes = Vec::with_capacity(self.regressors.len());
        for regressor in &self.regressors {
            let x = to_matrix(1, &self.feature_row(image, &shape));
            let delta = regressor.predict(&x)?;
            apply_update(&mut shape, delta.row(0).iter());
            shapes.push(shape.clone());
        }
        Ok(shapes)
    }

    fn parameters(&self) -> Vec<&DMatrix<f64>> {
        self.regressors.iter().filter_map(|r| r.weights()).collect()
    }
}

fn check_batch(images: &[Image], gt_shapes: &[Shape], current: &[Vec<Shape>]) -> Result<()> {
    if images.len() != gt_shapes.len() || images.len() != current.len() {
        return Err(Error::InconsistentBatch(format!(
            "{} images, {} ground-truth shapes, {} estimate sets",
            images.len(),
            gt_shapes.len(),
            current.len()
        )));
    }
    for (gt, estimates) in gt_shapes.iter().zip(current) {
        for shape in estimates {
            if shape.num_landmarks() != gt.num_landmarks() {
                return Err(Error::LandmarkCountMismatch {
                    expected: gt.num_landmarks(),
                    actual: shape.num_landmarks(),
                });
            }
        }
    }
    Ok(())
}

fn to_matrix(n_rows: usize, values: &[f32]) -> DMatrix<f64> {
    let n_cols = if n_rows == 0 { 0 } else { values.len() / n_rows };
    DMatrix::from_row_iterator(n_rows, n_cols, values.iter().map(|v| *v as f64))
}

fn apply_update<'a>(shape: &mut Shape, delta: impl Iterator<Item = &'a f64>) {
    let delta: Vec<f32> = delta.map(|d| *d as f32).collect();
    for (p, d) in shape.points.iter_mut().zip(delta.chunks_exact(2)) {
        p.x += d[0];
        p.y += d[1];
    }
}

/// Mean point-to-point error of every estimate against its ground truth.
pub fn mean_error(gt_shapes: &[Shape], current: &[Vec<Shape>]) -> f32 {
    let mut total = 0.0;
    let mut count = 0usize;
    for (gt, estimates) in gt_shapes.iter().zip(current) {
        for shape in estimates {
            total += gt.mean_distance(shape);
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::raw_patch;
    use crate::types::Point;

    fn blob_image(center: Point) -> Image {
        Image::from_fn(32, 32, |x, y| {
            let dx = x as f32 - center.x;
            let dy = y as f32 - center.y;
            (-(dx * dx + dy * dy) / 18.0).exp()
        })
    }

    fn config(n_iterations: usize) -> StageConfig {
        StageConfig {
            patch_feature: raw_patch(),
            patch_shape: (7, 7),
            n_iterations,
        }
    }

    fn dataset() -> (Vec<Image>, Vec<Shape>, Vec<Vec<Shape>>) {
        let mut images = Vec::new();
        let mut gts = Vec::new();
        let mut current = Vec::new();
        for i in 0..6 {
            let c = Point::new(14.0 + i as f32 * 0.5, 15.0 + (i % 3) as f32);
            images.push(blob_image(c));
            gts.push(Shape::new(vec![c]));
            current.push(vec![
                Shape::new(vec![c + Point::new(1.5, -1.0)]),
                Shape::new(vec![c + Point::new(-1.0, 1.5)]),
            ]);
        }
        (images, gts, current)
    }

    #[test]
    fn training_reduces_error_and_keeps_nesting() {
        let (images, gts, current) = dataset();
        let before = mean_error(&gts, &current);

        let mut stage = SupervisedDescentStage::regularized(config(2), 1e-3);
        let after = stage.train(&images, &gts, current).unwrap();

        assert_eq!(after.len(), 6);
        assert!(after.iter().all(|e| e.len() == 2));
        assert!(mean_error(&gts, &after) < before);
        assert_eq!(stage.parameters().len(), 2);
    }

    #[test]
    fn run_returns_one_shape_per_iteration() {
        let (images, gts, current) = dataset();
        let mut stage = SupervisedDescentStage::regularized(config(3), 1e-3);
        stage.train(&images, &gts, current).unwrap();

        let shapes = stage.run(&images[0], &Shape::new(vec![Point::new(15.0, 14.0)])).unwrap();
        assert_eq!(shapes.len(), 3);
    }

    #[test]
    fn untrained_stage_cannot_run() {
        let stage = SupervisedDescentStage::newton(config(1));
        let image = blob_image(Point::new(10.0, 10.0));
        assert!(matches!(
            stage.run(&image, &Shape::new(vec![Point::new(10.0, 10.0)])),
            Err(Error::NotTrained)
        ));
        assert_eq!(stage.name(), "Newton");
    }

    #[test]
    fn rejects_inconsistent_batches() {
        let (images, gts, mut current) = dataset();
        current.pop();
        let mut stage = SupervisedDescentStage::newton(config(1));
        assert!(matches!(
            stage.train(&images, &gts, current),
            Err(Error::InconsistentBatch(_))
        ));
    }
}
