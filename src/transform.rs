//! Geometric transforms between shape frames.

use serde::{Deserialize, Serialize};

use crate::types::{BoundingBox, Point, Shape};

/// A 2D similarity transform: `p' = [a -b; b a] p + t`.
///
/// `a = s cos(theta)` and `b = s sin(theta)`, so a transform without rotation
/// has `b == 0` and `a` equal to the isotropic scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityTransform2D {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform2D {
    pub const fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            tx: 0.0,
            ty: 0.0,
        }
    }

    /// Parameters as `[a, b, tx, ty]`.
    pub fn as_vector(&self) -> [f32; 4] {
        [self.a, self.b, self.tx, self.ty]
    }

    pub fn from_vector(v: [f32; 4]) -> Self {
        Self {
            a: v[0],
            b: v[1],
            tx: v[2],
            ty: v[3],
        }
    }

    pub fn scale_factor(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    #[inline]
    pub fn apply_point(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x - self.b * p.y + self.tx,
            self.b * p.x + self.a * p.y + self.ty,
        )
    }

    pub fn apply(&self, shape: &Shape) -> Shape {
        Shape::new(shape.points.iter().map(|p| self.apply_point(*p)).collect())
    }

    /// Inverse transform. Identity if the transform is degenerate.
    pub fn inverse(&self) -> Self {
        let det = self.a * self.a + self.b * self.b;
        if det <= f32::EPSILON {
            return Self::identity();
        }
        let a = self.a / det;
        let b = -self.b / det;
        Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        }
    }
}

/// Least-squares similarity aligning `source` onto `target`.
///
/// With `allow_rotation == false` only scale and translation are estimated.
pub fn find_similarity_transform(
    source: &Shape,
    target: &Shape,
    allow_rotation: bool,
) -> SimilarityTransform2D {
    debug_assert_eq!(source.num_landmarks(), target.num_landmarks());
    let src_c = source.centroid();
    let tgt_c = target.centroid();

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut src_sq = 0.0f32;
    for (s, t) in source.points.iter().zip(target.points.iter()) {
        let s = *s - src_c;
        let t = *t - tgt_c;
        dot += s.x * t.x + s.y * t.y;
        cross += s.x * t.y - s.y * t.x;
        src_sq += s.x * s.x + s.y * s.y;
    }

    if src_sq <= f32::EPSILON {
        return SimilarityTransform2D {
            a: 1.0,
            b: 0.0,
            tx: tgt_c.x - src_c.x,
            ty: tgt_c.y - src_c.y,
        };
    }

    let a = dot / src_sq;
    let b = if allow_rotation { cross / src_sq } else { 0.0 };
    SimilarityTransform2D {
        a,
        b,
        tx: tgt_c.x - (a * src_c.x - b * src_c.y),
        ty: tgt_c.y - (b * src_c.x + a * src_c.y),
    }
}

/// Place `shape` inside `bbox` by aligning its own bounding box onto it.
pub fn align_shape_with_bounding_box(shape: &Shape, bbox: &BoundingBox) -> Shape {
    let tform = find_similarity_transform(&shape.bounding_box().corners(), &bbox.corners(), false);
    tform.apply(shape)
}

/// Uniform scale that maps the spread of `source` onto that of `target`.
pub fn uniform_scale_between(source: &Shape, target: &Shape) -> f32 {
    let src = source.centred_norm();
    if src <= f32::EPSILON {
        return 1.0;
    }
    target.centred_norm() / src
}

/// Move per-image shape estimates into another scale's frame.
///
/// Returns new shapes rather than mutating, so candidates that started from
/// the same value never alias each other.
pub fn scale_estimates(estimates: &[Vec<Shape>], ratio: f32) -> Vec<Vec<Shape>> {
    estimates
        .iter()
        .map(|per_image| per_image.iter().map(|s| s.scaled(ratio)).collect())
        .collect()
}
