//! Reference shape estimation and scale normalization.

use crate::error::{Error, Result};
use crate::images::Image;
use crate::transform::uniform_scale_between;
use crate::types::{Point, Shape};

/// Mean of `shapes`, optionally rescaled so its bounding-box diagonal equals
/// `diagonal`.
pub fn compute_reference_shape(shapes: &[&Shape], diagonal: Option<f32>) -> Result<Shape> {
    let first = shapes.first().ok_or(Error::NoTrainingImages)?;
    let n_points = first.num_landmarks();

    let mut sum = vec![Point::zero(); n_points];
    for shape in shapes {
        if shape.num_landmarks() != n_points {
            return Err(Error::LandmarkCountMismatch {
                expected: n_points,
                actual: shape.num_landmarks(),
            });
        }
        for (acc, p) in sum.iter_mut().zip(shape.points.iter()) {
            *acc += *p;
        }
    }
    let inv = 1.0 / shapes.len() as f32;
    let mean = Shape::new(sum.into_iter().map(|p| p * inv).collect());

    match diagonal {
        Some(diagonal) => Ok(rescale_to_diagonal(&mean, diagonal)),
        None => Ok(mean),
    }
}

/// Scale about the origin so the bounding-box diagonal becomes `diagonal`.
pub fn rescale_to_diagonal(shape: &Shape, diagonal: f32) -> Shape {
    let current = shape.bounding_box().diagonal();
    if current <= f32::EPSILON {
        return shape.clone();
    }
    shape.scaled(diagonal / current)
}

/// Rescale `image` so the landmarks in `group` have the spread of `reference`.
pub fn rescale_to_reference_shape(image: &Image, group: &str, reference: &Shape) -> Result<Image> {
    let shape = image.landmarks.require(group)?;
    if shape.num_landmarks() != reference.num_landmarks() {
        return Err(Error::LandmarkCountMismatch {
            expected: reference.num_landmarks(),
            actual: shape.num_landmarks(),
        });
    }
    image.rescale(uniform_scale_between(shape, reference))
}
