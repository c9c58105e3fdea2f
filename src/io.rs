//! Importing annotated training images from disk.
//!
//! Each image is paired with a sibling `.pts` file of the same stem. Point
//! coordinates in `.pts` files are 1-based and are shifted to 0-based pixel
//! coordinates on import.
//!
//! ```text
//! version: 1
//! n_points: 5
//! {
//! 30.0 30.0
//! ...
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::images::Image;
use crate::types::{Point, Shape};

/// Landmark group name used for imported `.pts` annotations.
pub const PTS_GROUP: &str = "PTS";

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

/// Parse the contents of a `.pts` file.
pub fn parse_pts(contents: &str, path: &Path) -> Result<Shape> {
    let parse_error = |reason: String| Error::LandmarkParse {
        path: path.display().to_string(),
        reason,
    };

    let mut expected = None;
    let mut in_body = false;
    let mut points = Vec::new();
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("n_points:") {
            let n = rest
                .trim()
                .parse::<usize>()
                .map_err(|e| parse_error(format!("bad n_points: {e}")))?;
            expected = Some(n);
        } else if line == "{" {
            in_body = true;
        } else if line == "}" {
            in_body = false;
        } else if in_body {
            let mut coords = line.split_whitespace().map(str::parse::<f32>);
            match (coords.next(), coords.next()) {
                (Some(Ok(x)), Some(Ok(y))) => points.push(Point::new(x - 1.0, y - 1.0)),
                _ => return Err(parse_error(format!("bad point line '{line}'"))),
            }
        }
    }

    match expected {
        Some(n) if n != points.len() => Err(parse_error(format!(
            "header declares {n} points, found {}",
            points.len()
        ))),
        _ if points.is_empty() => Err(parse_error("no points".into())),
        _ => Ok(Shape::new(points)),
    }
}

/// Load one grayscale image and attach its landmarks under [`PTS_GROUP`].
pub fn import_image(image_path: &Path, pts_path: &Path) -> Result<Image> {
    let decoded = image::open(image_path)?.to_luma8();

    let contents = fs::read_to_string(pts_path)?;
    let shape = parse_pts(&contents, pts_path)?;

    let mut image = Image::from_access(&decoded);
    image.landmarks.insert(PTS_GROUP, shape);
    Ok(image)
}

/// Image files in `dir` that have a matching `.pts`, sorted by path.
pub fn annotated_image_paths(dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut pairs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !is_image {
            continue;
        }
        let pts = path.with_extension("pts");
        if pts.exists() {
            pairs.push((path, pts));
        } else {
            debug!(image = %path.display(), "skipping image without landmarks");
        }
    }
    pairs.sort();
    Ok(pairs)
}

/// Lazily load the annotated images in `dir`, one per `next()`.
///
/// Only the directory listing happens up front, so a trainer pulling
/// batches holds at most one batch of decoded images.
pub fn iter_images(dir: &Path) -> Result<impl Iterator<Item = Result<Image>>> {
    Ok(annotated_image_paths(dir)?
        .into_iter()
        .map(|(image, pts)| import_image(&image, &pts)))
}

/// Load every annotated image in `dir`.
pub fn import_images(dir: &Path) -> Result<Vec<Image>> {
    iter_images(dir)?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pts_file() {
        let contents = "version: 1\nn_points: 2\n{\n10.5 20.0\n30 40\n}\n";
        let shape = parse_pts(contents, Path::new("a.pts")).unwrap();
        assert_eq!(shape.num_landmarks(), 2);
        assert_eq!(shape[0], Point::new(9.5, 19.0));
        assert_eq!(shape[1], Point::new(29.0, 39.0));
    }

    #[test]
    fn pts_origin_maps_to_first_pixel() {
        let shape = parse_pts("n_points: 1\n{\n1 1\n}", Path::new("o.pts")).unwrap();
        assert_eq!(shape[0], Point::new(0.0, 0.0));
    }

    #[test]
    fn rejects_point_count_mismatch() {
        let contents = "version: 1\nn_points: 3\n{\n1 2\n}\n";
        assert!(matches!(
            parse_pts(contents, Path::new("b.pts")),
            Err(Error::LandmarkParse { .. })
        ));
        assert!(parse_pts("{\n1 x\n}", Path::new("c.pts")).is_err());
    }

    #[test]
    fn imports_annotated_images_from_directory() {
        let dir = std::env::temp_dir().join(format!("percent_sdm_io_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let img = image::GrayImage::from_fn(16, 12, |x, y| image::Luma([(x * 10 + y) as u8]));
        img.save(dir.join("face.png")).unwrap();
        fs::write(dir.join("face.pts"), "version: 1\nn_points: 1\n{\n4 5\n}\n").unwrap();
        img.save(dir.join("unlabelled.png")).unwrap();

        let images = import_images(&dir).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].width(), 16);
        assert_eq!(
            images[0].landmarks.get(PTS_GROUP).unwrap()[0],
            Point::new(3.0, 4.0)
        );
        // Pixel (3, 4) of the decoded image, scaled to [0, 1].
        assert!((images[0].get(0, 3, 4) - 34.0 / 255.0).abs() < 1e-6);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn iter_images_loads_on_demand() {
        let dir = std::env::temp_dir().join(format!("percent_sdm_iter_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let img = image::GrayImage::from_fn(8, 8, |x, _| image::Luma([x as u8]));
        img.save(dir.join("a.png")).unwrap();
        fs::write(dir.join("a.pts"), "n_points: 1\n{\n2 2\n}\n").unwrap();
        img.save(dir.join("b.png")).unwrap();
        fs::write(dir.join("b.pts"), "n_points: 1\n{\n3 3\n}\n").unwrap();

        let mut images = iter_images(&dir).unwrap();
        let first = images.next().unwrap().unwrap();
        assert_eq!(first.landmarks.get(PTS_GROUP).unwrap()[0], Point::new(1.0, 1.0));

        // A file removed after listing only fails when its turn comes.
        fs::remove_file(dir.join("b.png")).unwrap();
        assert!(matches!(images.next(), Some(Err(Error::Image(_)))));
        assert!(images.next().is_none());

        fs::remove_dir_all(&dir).ok();
    }
}
