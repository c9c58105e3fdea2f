//! Initial-shape perturbation strategies.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::transform::{find_similarity_transform, SimilarityTransform2D};
use crate::types::Shape;

/// Produces one plausible noisy initialization from a shape and a box.
pub trait ShapePerturber {
    /// `shape` is placed into `bounding_box` with noise. The trainer passes
    /// the ground-truth bounding box (as corners) for `shape`, so the result is
    /// itself a noisy bounding box.
    fn perturb(&mut self, shape: &Shape, bounding_box: &Shape) -> Shape;

    /// Whether this is something other than the stock strategy.
    fn is_custom(&self) -> bool {
        true
    }
}

impl<F> ShapePerturber for F
where
    F: FnMut(&Shape, &Shape) -> Shape,
{
    fn perturb(&mut self, shape: &Shape, bounding_box: &Shape) -> Shape {
        self(shape, bounding_box)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseType {
    Uniform,
    Normal,
}

/// Noisy similarity alignment of a shape's bounding box onto a target box.
///
/// The noise on each similarity parameter is proportional to that
/// parameter's natural range: the alignment scale for `a` and `b`, the target
/// box width and height for the translation.
#[derive(Debug, Clone)]
pub struct NoisyBoundingBox {
    pub noise_type: NoiseType,
    pub noise_percentage: f32,
    pub allow_rotation: bool,
    rng: StdRng,
}

impl NoisyBoundingBox {
    pub fn new(noise_percentage: f32) -> Self {
        Self {
            noise_type: NoiseType::Uniform,
            noise_percentage,
            allow_rotation: false,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic perturbations for reproducible training.
    pub fn seeded(noise_percentage: f32, seed: u64) -> Self {
        Self {
            noise_type: NoiseType::Uniform,
            noise_percentage,
            allow_rotation: false,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_noise_type(mut self, noise_type: NoiseType) -> Self {
        self.noise_type = noise_type;
        self
    }

    pub fn with_rotation(mut self, allow_rotation: bool) -> Self {
        self.allow_rotation = allow_rotation;
        self
    }

    fn noisy_transform(&mut self, source: &Shape, target: &Shape) -> SimilarityTransform2D {
        let tform = find_similarity_transform(source, target, self.allow_rotation);
        let target_box = target.bounding_box();
        let scale = tform.scale_factor();
        let ranges = [scale, scale, target_box.width, target_box.height];

        let mut params = tform.as_vector();
        for (i, (param, range)) in params.iter_mut().zip(ranges).enumerate() {
            if i == 1 && !self.allow_rotation {
                continue;
            }
            let unit = match self.noise_type {
                NoiseType::Uniform => self.rng.random_range(-1.0f32..=1.0),
                NoiseType::Normal => self.rng.sample(StandardNormal),
            };
            *param += unit * range * self.noise_percentage;
        }
        SimilarityTransform2D::from_vector(params)
    }
}

impl Default for NoisyBoundingBox {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl ShapePerturber for NoisyBoundingBox {
    fn perturb(&mut self, shape: &Shape, bounding_box: &Shape) -> Shape {
        let source = shape.bounding_box().corners();
        let target = bounding_box.bounding_box().corners();
        self.noisy_transform(&source, &target).apply(shape)
    }

    fn is_custom(&self) -> bool {
        false
    }
}
