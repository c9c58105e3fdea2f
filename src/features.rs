//! Holistic (whole-image) and patch feature functions.
//!
//! Holistic features run once per pyramid level over a batch and are shared
//! between levels as `Arc<dyn HolisticFeature>`: two consecutive levels that
//! hold the *same* `Arc` reuse the computed feature images. Patch features
//! turn the pixels sampled around each landmark into the regression input.

use std::f32::consts::PI;
use std::fmt;
use std::sync::Arc;

use crate::images::Image;
use crate::types::Shape;

/// A deterministic whole-image feature transform.
pub trait HolisticFeature {
    fn name(&self) -> &str;

    /// Compute the feature image. Landmarks are reattached by the caller.
    fn compute(&self, image: &Image) -> Image;
}

impl fmt::Debug for dyn HolisticFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HolisticFeature({})", self.name())
    }
}

/// Pass pixels through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOp;

impl HolisticFeature for NoOp {
    fn name(&self) -> &str {
        "no_op"
    }

    fn compute(&self, image: &Image) -> Image {
        image.clone()
    }
}

/// Central-difference gradients: two channels (dx, dy) per input channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gradient;

impl HolisticFeature for Gradient {
    fn name(&self) -> &str {
        "gradient"
    }

    fn compute(&self, image: &Image) -> Image {
        let (w, h) = (image.width() as i32, image.height() as i32);
        let n_channels = image.n_channels();
        let mut pixels = Vec::with_capacity(image.pixels().len() * 2);
        for c in 0..n_channels {
            for y in 0..h {
                for x in 0..w {
                    let l = image.get(c, (x - 1).max(0), y);
                    let r = image.get(c, (x + 1).min(w - 1), y);
                    pixels.push((r - l) * 0.5);
                }
            }
            for y in 0..h {
                for x in 0..w {
                    let u = image.get(c, x, (y - 1).max(0));
                    let d = image.get(c, x, (y + 1).min(h - 1));
                    pixels.push((d - u) * 0.5);
                }
            }
        }
        Image::new(pixels, image.width(), image.height(), n_channels * 2)
    }
}

/// Shared handle to the default holistic feature.
pub fn no_op() -> Arc<dyn HolisticFeature> {
    Arc::new(NoOp)
}

/// Apply `feature` to every image, carrying landmarks over.
pub fn compute_features(images: &[Image], feature: &dyn HolisticFeature) -> Vec<Image> {
    images
        .iter()
        .map(|image| {
            feature
                .compute(image)
                .with_landmarks(image.landmarks.clone())
        })
        .collect()
}

/// Pixels sampled around one landmark: `n_channels` planes of `height x width`.
pub struct Patch<'a> {
    pub values: &'a [f32],
    pub n_channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Patch<'_> {
    #[inline]
    fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.values[(c * self.height + y) * self.width + x]
    }
}

/// Describes a patch as a feature vector.
pub trait PatchFeature {
    fn name(&self) -> &str;

    /// Length of the output for a patch of the given geometry.
    fn output_len(&self, n_channels: usize, patch_shape: (usize, usize)) -> usize;

    fn compute(&self, patch: &Patch<'_>, out: &mut Vec<f32>);
}

impl fmt::Debug for dyn PatchFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PatchFeature({})", self.name())
    }
}

/// Raw sampled pixels.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPatch;

impl PatchFeature for RawPatch {
    fn name(&self) -> &str {
        "raw"
    }

    fn output_len(&self, n_channels: usize, patch_shape: (usize, usize)) -> usize {
        n_channels * patch_shape.0 * patch_shape.1
    }

    fn compute(&self, patch: &Patch<'_>, out: &mut Vec<f32>) {
        out.extend_from_slice(patch.values);
    }
}

/// Magnitude-weighted gradient orientation histogram over the whole patch,
/// per channel, L2-normalized. A single-cell HOG descriptor.
#[derive(Debug, Clone, Copy)]
pub struct OrientationHistogram {
    pub n_bins: usize,
}

impl Default for OrientationHistogram {
    fn default() -> Self {
        Self { n_bins: 9 }
    }
}

impl PatchFeature for OrientationHistogram {
    fn name(&self) -> &str {
        "orientation_histogram"
    }

    fn output_len(&self, n_channels: usize, _patch_shape: (usize, usize)) -> usize {
        n_channels * self.n_bins
    }

    fn compute(&self, patch: &Patch<'_>, out: &mut Vec<f32>) {
        let bin_width = PI / self.n_bins as f32;
        for c in 0..patch.n_channels {
            let mut hist = vec![0.0f32; self.n_bins];
            for y in 0..patch.height {
                for x in 0..patch.width {
                    let l = patch.at(c, y, x.saturating_sub(1));
                    let r = patch.at(c, y, (x + 1).min(patch.width - 1));
                    let u = patch.at(c, y.saturating_sub(1), x);
                    let d = patch.at(c, (y + 1).min(patch.height - 1), x);
                    let (gx, gy) = (r - l, d - u);
                    let magnitude = (gx * gx + gy * gy).sqrt();
                    if magnitude <= f32::EPSILON {
                        continue;
                    }
                    // Unsigned orientation in [0, pi)
                    let angle = gy.atan2(gx).rem_euclid(PI);
                    let bin = ((angle / bin_width) as usize).min(self.n_bins - 1);
                    hist[bin] += magnitude;
                }
            }
            let norm = hist.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > f32::EPSILON {
                hist.iter_mut().for_each(|v| *v /= norm);
            }
            out.extend_from_slice(&hist);
        }
    }
}

/// Shared handle to the default patch feature.
pub fn raw_patch() -> Arc<dyn PatchFeature> {
    Arc::new(RawPatch)
}

/// Sample a `patch_shape` (height, width) window around every landmark of
/// `shape` and concatenate the patch features.
pub fn extract_patch_features(
    image: &Image,
    shape: &Shape,
    patch_shape: (usize, usize),
    feature: &dyn PatchFeature,
) -> Vec<f32> {
    let (height, width) = patch_shape;
    let n_channels = image.n_channels();
    let half_h = (height as f32 - 1.0) / 2.0;
    let half_w = (width as f32 - 1.0) / 2.0;

    let mut out = Vec::with_capacity(shape.num_landmarks() * feature.output_len(n_channels, patch_shape));
    let mut buffer = Vec::with_capacity(n_channels * height * width);
    for p in &shape.points {
        buffer.clear();
        for c in 0..n_channels {
            for dy in 0..height {
                for dx in 0..width {
                    let x = p.x - half_w + dx as f32;
                    let y = p.y - half_h + dy as f32;
                    buffer.push(image.sample_bilinear(c, x, y));
                }
            }
        }
        let patch = Patch {
            values: &buffer,
            n_channels,
            height,
            width,
        };
        feature.compute(&patch, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;

    #[test]
    fn gradient_doubles_channels() {
        let image = Image::from_fn(8, 6, |x, y| (2 * x + 3 * y) as f32);
        let grad = Gradient.compute(&image);
        assert_eq!(grad.n_channels(), 2);
        // Interior pixels see the exact slope.
        assert!((grad.get(0, 3, 3) - 2.0).abs() < 1e-5);
        assert!((grad.get(1, 3, 3) - 3.0).abs() < 1e-5);
    }

    #[test]
    fn compute_features_keeps_landmarks() {
        let mut image = Image::from_fn(4, 4, |_, _| 1.0);
        image.landmarks.insert("PTS", Shape::zeros(2));
        let out = compute_features(&[image], &Gradient);
        assert!(out[0].landmarks.contains("PTS"));
    }

    #[test]
    fn raw_patch_samples_centred_window() {
        let image = Image::from_fn(10, 10, |x, _y| x as f32);
        let shape = Shape::new(vec![Point::new(5.0, 5.0)]);
        let values = extract_patch_features(&image, &shape, (1, 3), &RawPatch);
        assert_eq!(values, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn orientation_histogram_is_normalized() {
        // Vertical edge: all gradient energy is horizontal, bin 0.
        let image = Image::from_fn(12, 12, |x, _| if x < 6 { 0.0 } else { 1.0 });
        let shape = Shape::new(vec![Point::new(6.0, 6.0)]);
        let feature = OrientationHistogram::default();
        let values = extract_patch_features(&image, &shape, (5, 5), &feature);
        assert_eq!(values.len(), feature.output_len(1, (5, 5)));
        assert!((values[0] - 1.0).abs() < 1e-5);
        assert!(values[1..].iter().all(|v| v.abs() < 1e-5));
    }
}
