//! Multi-channel images with attached landmark groups.
//!
//! Training images start life as grayscale intensities (any [`ImageAccess`],
//! such as a decoded `image::GrayImage`) and are converted into [`Image`], a
//! planar `f32` buffer that holistic feature functions can expand into
//! several channels. Every image carries its own [`LandmarkGroups`], which is
//! also where synthesized bounding boxes and perturbations are stashed during
//! training.

use crate::error::{Error, Result};
use crate::types::Shape;

/// Trait for accessing pixel intensities from an image.
pub trait ImageAccess {
    /// Get the grayscale intensity at (x, y). Returns 0 for out-of-bounds pixels.
    /// Coordinates are in image space (not normalized).
    fn get_pixel(&self, x: i32, y: i32) -> u8;

    /// Image dimensions.
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

impl ImageAccess for image::GrayImage {
    fn get_pixel(&self, x: i32, y: i32) -> u8 {
        if x < 0 || y < 0 || x >= self.width() as i32 || y >= self.height() as i32 {
            return 0;
        }
        image::GenericImageView::get_pixel(self, x as u32, y as u32).0[0]
    }

    fn width(&self) -> u32 {
        self.dimensions().0
    }

    fn height(&self) -> u32 {
        self.dimensions().1
    }
}

/// Keyed landmark storage, kept in insertion order.
///
/// Order matters: the first key matching a bounding-box namespace is the
/// seed box that perturbations are generated from.
#[derive(Debug, Clone, Default)]
pub struct LandmarkGroups {
    groups: Vec<(String, Shape)>,
}

impl LandmarkGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a shape under `key`, replacing any existing group of that name.
    pub fn insert(&mut self, key: impl Into<String>, shape: Shape) {
        let key = key.into();
        match self.groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = shape,
            None => self.groups.push((key, shape)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Shape> {
        self.groups
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, shape)| shape)
    }

    /// Like [`get`](Self::get), but a missing group is an error.
    pub fn require(&self, key: &str) -> Result<&Shape> {
        self.get(key)
            .ok_or_else(|| Error::MissingLandmarkGroup(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(k, _)| k.as_str())
    }

    pub fn first_label(&self) -> Option<&str> {
        self.groups.first().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// All keys containing `needle`, in insertion order.
    pub fn keys_matching(&self, needle: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|(k, _)| k.contains(needle))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Scale every point of every group about the origin.
    pub fn scale_all(&mut self, factor: f32) {
        for (_, shape) in &mut self.groups {
            for p in &mut shape.points {
                *p = *p * factor;
            }
        }
    }
}

/// A planar multi-channel `f32` image with landmarks.
#[derive(Debug, Clone)]
pub struct Image {
    pixels: Vec<f32>,
    width: u32,
    height: u32,
    n_channels: usize,
    pub landmarks: LandmarkGroups,
}

impl Image {
    /// Create an image from channel-major pixel planes.
    pub fn new(pixels: Vec<f32>, width: u32, height: u32, n_channels: usize) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize * n_channels);
        Self {
            pixels,
            width,
            height,
            n_channels,
            landmarks: LandmarkGroups::new(),
        }
    }

    /// Single-channel image with intensities scaled to [0, 1].
    pub fn from_access<I: ImageAccess>(source: &I) -> Self {
        let (width, height) = (source.width(), source.height());
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height as i32 {
            for x in 0..width as i32 {
                pixels.push(source.get_pixel(x, y) as f32 / 255.0);
            }
        }
        Self::new(pixels, width, height, 1)
    }

    pub fn from_fn<F>(width: u32, height: u32, f: F) -> Self
    where
        F: Fn(u32, u32) -> f32,
    {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self::new(pixels, width, height, 1)
    }

    pub fn with_landmarks(mut self, landmarks: LandmarkGroups) -> Self {
        self.landmarks = landmarks;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    /// Pixel planes, channel-major.
    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    /// Value at integer coordinates. Returns 0 for out-of-bounds pixels.
    #[inline]
    pub fn get(&self, channel: usize, x: i32, y: i32) -> f32 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0.0;
        }
        let plane = self.width as usize * self.height as usize;
        self.pixels[channel * plane + y as usize * self.width as usize + x as usize]
    }

    /// Sample a channel with bilinear interpolation for sub-pixel accuracy.
    #[inline]
    pub fn sample_bilinear(&self, channel: usize, x: f32, y: f32) -> f32 {
        let x0 = x.floor() as i32;
        let y0 = y.floor() as i32;
        let x1 = x0 + 1;
        let y1 = y0 + 1;

        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let p00 = self.get(channel, x0, y0);
        let p10 = self.get(channel, x1, y0);
        let p01 = self.get(channel, x0, y1);
        let p11 = self.get(channel, x1, y1);

        let top = p00 * (1.0 - fx) + p10 * fx;
        let bottom = p01 * (1.0 - fx) + p11 * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Resample every channel by `factor`, scaling all landmark groups with it.
    pub fn rescale(&self, factor: f32) -> Result<Image> {
        if !(factor.is_finite() && factor > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "rescale factor must be positive, got {factor}"
            )));
        }
        let width = ((self.width as f32 * factor).round() as u32).max(1);
        let height = ((self.height as f32 * factor).round() as u32).max(1);
        let inv = 1.0 / factor;

        let mut pixels = Vec::with_capacity(width as usize * height as usize * self.n_channels);
        for c in 0..self.n_channels {
            for y in 0..height {
                for x in 0..width {
                    pixels.push(self.sample_bilinear(c, x as f32 * inv, y as f32 * inv));
                }
            }
        }

        let mut landmarks = self.landmarks.clone();
        landmarks.scale_all(factor);
        Ok(Image::new(pixels, width, height, self.n_channels).with_landmarks(landmarks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Point};

    #[test]
    fn bilinear_interpolation() {
        let img = Image::new(vec![0.0, 100.0, 200.0, 50.0], 2, 2, 1);

        assert!((img.sample_bilinear(0, 0.0, 0.0) - 0.0).abs() < 0.01);
        assert!((img.sample_bilinear(0, 1.0, 0.0) - 100.0).abs() < 0.01);
        assert!((img.sample_bilinear(0, 0.0, 1.0) - 200.0).abs() < 0.01);
        assert!((img.sample_bilinear(0, 1.0, 1.0) - 50.0).abs() < 0.01);

        // (0+100+200+50)/4
        assert!((img.sample_bilinear(0, 0.5, 0.5) - 87.5).abs() < 0.01);
        assert!((img.sample_bilinear(0, 0.5, 0.0) - 50.0).abs() < 0.01);
    }

    #[test]
    fn gray_image_access() {
        let data = vec![
            0, 255, 0, //
            255, 0, 255, //
            0, 255, 0, //
        ];
        let img = image::GrayImage::from_raw(3, 3, data).unwrap();

        assert_eq!(ImageAccess::get_pixel(&img, 0, 0), 0);
        assert_eq!(ImageAccess::get_pixel(&img, 1, 0), 255);
        assert_eq!(ImageAccess::get_pixel(&img, 1, 1), 0);

        // Out of bounds returns 0
        assert_eq!(ImageAccess::get_pixel(&img, -1, 0), 0);
        assert_eq!(ImageAccess::get_pixel(&img, 3, 0), 0);

        let converted = Image::from_access(&img);
        assert_eq!(converted.n_channels(), 1);
        assert!((converted.get(0, 1, 0) - 1.0).abs() < 1e-6);
        assert_eq!(converted.get(0, 5, 5), 0.0);
    }

    #[test]
    fn landmark_groups_keep_insertion_order() {
        let mut groups = LandmarkGroups::new();
        groups.insert("PTS", Shape::zeros(3));
        groups.insert("__gt_bb_0", BoundingBox::new(0.0, 0.0, 1.0, 1.0).corners());
        groups.insert("__gt_bb__1", BoundingBox::new(0.0, 0.0, 2.0, 2.0).corners());
        groups.insert("__gt_bb_0", BoundingBox::new(0.0, 0.0, 3.0, 3.0).corners());

        assert_eq!(groups.len(), 3);
        assert_eq!(groups.first_label(), Some("PTS"));
        assert_eq!(
            groups.keys_matching("__gt_bb_"),
            vec!["__gt_bb_0".to_string(), "__gt_bb__1".to_string()]
        );
        let replaced = groups.require("__gt_bb_0").unwrap().bounding_box();
        assert_eq!(replaced.width, 3.0);
        assert!(matches!(
            groups.require("missing"),
            Err(Error::MissingLandmarkGroup(_))
        ));
    }

    #[test]
    fn rescale_scales_pixels_and_landmarks() {
        let mut img = Image::from_fn(20, 10, |x, _| x as f32);
        img.landmarks
            .insert("PTS", Shape::new(vec![Point::new(4.0, 2.0), Point::new(10.0, 8.0)]));

        let half = img.rescale(0.5).unwrap();
        assert_eq!(half.width(), 10);
        assert_eq!(half.height(), 5);
        assert!((half.get(0, 3, 0) - 6.0).abs() < 1e-5);

        let pts = half.landmarks.get("PTS").unwrap();
        assert_eq!(pts[0], Point::new(2.0, 1.0));
        assert_eq!(pts[1], Point::new(5.0, 4.0));

        assert!(img.rescale(0.0).is_err());
    }
}
