//! Cleaning up photos of documents before OCR.
//!
//! Steps run in a fixed order. Each one is best-effort: if it fails or
//! panics, we log it, keep the image from the previous step, and move on.

use std::{
    io::Cursor,
    panic::{AssertUnwindSafe, catch_unwind},
};

use image::{
    DynamicImage, GrayImage, ImageFormat, ImageReader, Luma,
    imageops::{self, FilterType},
};
use imageproc::{
    contrast::adaptive_threshold,
    edges::canny,
    filter::{median_filter, sharpen3x3},
    geometric_transformations::{Interpolation, rotate_about_center},
    hough::{LineDetectionOptions, detect_lines},
};
use schemars::JsonSchema;

use crate::prelude::*;

/// Radius of the adaptive threshold window. A 31x31 block.
const THRESHOLD_BLOCK_RADIUS: u32 = 15;

/// We look for text lines on a copy no wider than this.
const DESKEW_ANALYSIS_WIDTH: u32 = 1000;

/// Ignore skew smaller than this, in degrees.
const MIN_SKEW_DEGREES: f32 = 0.5;

/// Don't trust skew estimates larger than this, in degrees.
const MAX_SKEW_DEGREES: f32 = 15.0;

/// An enhancement step. Ordered the way the steps run.
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Enhancement {
    Grayscale,
    Deskew,
    AdaptiveThreshold,
    Denoise,
    Sharpen,
}

/// The result of [`prepare_image_sync`].
#[derive(Debug)]
pub struct EnhancedImage {
    /// PNG-encoded output.
    pub png: Vec<u8>,
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Steps which were applied.
    pub applied: Vec<Enhancement>,
    /// Steps which failed.
    pub skipped: Vec<Enhancement>,
}

/// Decode a photo or a rendered PDF page, optionally enhance it, and
/// re-encode it as PNG.
///
/// This is CPU-heavy. Call it from a blocking thread.
pub fn prepare_image_sync(bytes: &[u8], enhance: bool) -> Result<EnhancedImage> {
    let image = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("cannot detect image format")?
        .decode()
        .context("cannot decode image")?;

    let (output, applied, skipped) = if enhance {
        enhance_photo(image)
    } else {
        (image, vec![], vec![])
    };

    let mut png = Cursor::new(Vec::new());
    output
        .write_to(&mut png, ImageFormat::Png)
        .context("cannot encode PNG")?;
    Ok(EnhancedImage {
        png: png.into_inner(),
        width: output.width(),
        height: output.height(),
        applied,
        skipped,
    })
}

/// Run our enhancement steps over a photo.
///
/// Returns the enhanced image, the steps applied, and the steps that failed.
pub fn enhance_photo(image: DynamicImage) -> (DynamicImage, Vec<Enhancement>, Vec<Enhancement>) {
    let mut applied = vec![];
    let mut skipped = vec![];

    let mut gray = image.to_luma8();
    applied.push(Enhancement::Grayscale);

    let steps: [(Enhancement, fn(&GrayImage) -> Result<Option<GrayImage>>); 4] = [
        (Enhancement::Deskew, deskew),
        (Enhancement::AdaptiveThreshold, |img| {
            Ok(Some(adaptive_threshold(img, THRESHOLD_BLOCK_RADIUS)))
        }),
        (Enhancement::Denoise, |img| Ok(Some(median_filter(img, 1, 1)))),
        (Enhancement::Sharpen, |img| Ok(Some(sharpen3x3(img)))),
    ];
    for (step, func) in steps {
        match run_step(step, &gray, func) {
            StepOutcome::Applied(next) => {
                gray = next;
                applied.push(step);
            }
            StepOutcome::NotNeeded => {}
            StepOutcome::Failed => skipped.push(step),
        }
    }

    (DynamicImage::ImageLuma8(gray), applied, skipped)
}

/// What happened when we ran a step.
enum StepOutcome {
    Applied(GrayImage),
    NotNeeded,
    Failed,
}

/// Run a step, catching errors and panics.
fn run_step(
    step: Enhancement,
    image: &GrayImage,
    func: fn(&GrayImage) -> Result<Option<GrayImage>>,
) -> StepOutcome {
    match catch_unwind(AssertUnwindSafe(|| func(image))) {
        Ok(Ok(Some(output))) => StepOutcome::Applied(output),
        Ok(Ok(None)) => {
            debug!(?step, "enhancement not needed");
            StepOutcome::NotNeeded
        }
        Ok(Err(err)) => {
            warn!(?step, "enhancement failed, keeping previous image: {:?}", err);
            StepOutcome::Failed
        }
        Err(_) => {
            warn!(?step, "enhancement panicked, keeping previous image");
            StepOutcome::Failed
        }
    }
}

/// Straighten a slightly rotated page. Returns `None` if the page already
/// looks straight, or if we can't tell.
fn deskew(image: &GrayImage) -> Result<Option<GrayImage>> {
    let Some(skew) = estimate_skew_degrees(image) else {
        return Ok(None);
    };
    if skew.abs() < MIN_SKEW_DEGREES || skew.abs() > MAX_SKEW_DEGREES {
        debug!(skew, "not deskewing");
        return Ok(None);
    }
    debug!(skew, "deskewing");
    Ok(Some(rotate_about_center(
        image,
        -skew.to_radians(),
        Interpolation::Bilinear,
        Luma([255]),
    )))
}

/// Estimate how far text lines are from horizontal, in degrees, using the
/// median angle of strong near-horizontal lines.
fn estimate_skew_degrees(image: &GrayImage) -> Option<f32> {
    let small = if image.width() > DESKEW_ANALYSIS_WIDTH {
        let height = (u64::from(image.height()) * u64::from(DESKEW_ANALYSIS_WIDTH)
            / u64::from(image.width()))
        .max(1);
        imageops::resize(
            image,
            DESKEW_ANALYSIS_WIDTH,
            u32::try_from(height).ok()?,
            FilterType::Triangle,
        )
    } else {
        image.clone()
    };

    let edges = canny(&small, 50.0, 150.0);
    let options = LineDetectionOptions {
        vote_threshold: (small.width() / 4).max(10),
        suppression_radius: 8,
    };
    // Hough angles are the direction of the line's normal, so horizontal
    // lines are near 90 degrees.
    let mut angles = detect_lines(&edges, options)
        .into_iter()
        .map(|line| line.angle_in_degrees as f32 - 90.0)
        .filter(|angle| angle.abs() <= MAX_SKEW_DEGREES)
        .collect::<Vec<_>>();
    median(&mut angles)
}

/// The median of `values`, if there are any.
fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f32::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;

    #[test]
    fn median_handles_odd_and_even_lengths() {
        assert_eq!(median(&mut []), None);
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), Some(2.5));
    }

    #[test]
    fn enhancement_steps_run_in_order() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(80, 60, |x, _y| {
            if x % 10 < 5 {
                image::Rgb([10, 10, 10])
            } else {
                image::Rgb([240, 240, 240])
            }
        }));
        let (output, applied, skipped) = enhance_photo(image);
        assert!(skipped.is_empty());
        assert_eq!(applied[0], Enhancement::Grayscale);
        let threshold = applied
            .iter()
            .position(|s| *s == Enhancement::AdaptiveThreshold)
            .unwrap();
        let sharpen = applied.iter().position(|s| *s == Enhancement::Sharpen).unwrap();
        assert!(threshold < sharpen);
        assert_eq!((output.width(), output.height()), (80, 60));
        assert!(matches!(output, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn blank_pages_are_not_deskewed() {
        let blank = GrayImage::from_pixel(200, 100, Luma([255]));
        assert_eq!(estimate_skew_degrees(&blank), None);
        assert!(deskew(&blank).unwrap().is_none());
    }

    #[test]
    fn panicking_steps_are_skipped() {
        let image = GrayImage::from_pixel(4, 4, Luma([0]));
        let outcome = run_step(Enhancement::Sharpen, &image, |_| panic!("boom"));
        assert!(matches!(outcome, StepOutcome::Failed));
        let outcome = run_step(Enhancement::Sharpen, &image, |_| Err(anyhow!("nope")));
        assert!(matches!(outcome, StepOutcome::Failed));
    }

    #[test]
    fn unenhanced_photos_keep_their_size() {
        let mut png = Cursor::new(Vec::new());
        RgbImage::new(30, 20)
            .write_to(&mut png, ImageFormat::Png)
            .unwrap();
        let out = prepare_image_sync(png.get_ref(), false).unwrap();
        assert!(out.applied.is_empty());
        assert_eq!((out.width, out.height), (30, 20));
    }
}
