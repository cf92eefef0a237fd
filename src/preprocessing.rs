//! Per-frame normalization ahead of encoding.
//!
//! Every source frame is decoded, given a light unsharp mask and written back
//! out as an uncompressed, unfiltered RGBA PNG named by its position in the
//! run (`processed_0001.png`, `processed_0002.png`, ...). The renumbering
//! closes any gaps in the source indices, which the encoder's `%04d` input
//! pattern cannot cross.

use anyhow::{Context, Result};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ConvertError, ConvertResult};
use crate::frames::FrameSpec;
use crate::progress::{CancelToken, PREPROCESS_BUDGET};

/// printf-style name of processed frames, as handed to the encoder.
pub const PROCESSED_FRAME_PATTERN: &str = "processed_%04d.png";

/// Unsharp-mask settings applied to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharpenParams {
    /// Gaussian sigma of the blur the mask is built from
    pub radius: f32,
    /// How much of the sharpened difference is applied (1.0 = all of it)
    pub amount: f32,
    /// Minimum per-channel difference before a pixel is sharpened
    pub threshold: i32,
}

impl Default for SharpenParams {
    fn default() -> Self {
        Self {
            radius: 0.5,
            amount: 1.0,
            threshold: 2,
        }
    }
}

/// Turns one source image into one processed image on disk.
pub trait FrameTransform: Send + Sync {
    fn apply(&self, input: &Path, output: &Path) -> Result<()>;
}

/// The default transform: decode, sharpen, write lossless RGBA PNG.
#[derive(Debug, Clone, Default)]
pub struct SharpenTransform {
    params: SharpenParams,
}

impl SharpenTransform {
    pub fn new(params: SharpenParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SharpenParams {
        &self.params
    }
}

impl FrameTransform for SharpenTransform {
    fn apply(&self, input: &Path, output: &Path) -> Result<()> {
        let img = image::open(input)
            .with_context(|| format!("opening {}", input.display()))?
            .to_rgba8();
        let sharpened = sharpen(&img, &self.params);

        let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
        // stored deflate blocks, no row filters, never palettized
        let encoder = PngEncoder::new_with_quality(
            BufWriter::new(file),
            CompressionType::Uncompressed,
            FilterType::NoFilter,
        );
        encoder
            .write_image(
                sharpened.as_raw(),
                sharpened.width(),
                sharpened.height(),
                ExtendedColorType::Rgba8,
            )
            .with_context(|| format!("writing {}", output.display()))?;
        Ok(())
    }
}

fn sharpen(img: &RgbaImage, params: &SharpenParams) -> RgbaImage {
    let mut sharpened = image::imageops::unsharpen(img, params.radius, params.threshold);
    if (params.amount - 1.0).abs() <= f32::EPSILON {
        return sharpened;
    }

    for (out, orig) in sharpened.pixels_mut().zip(img.pixels()) {
        for c in 0..4 {
            let base = orig[c] as f32;
            let delta = out[c] as f32 - base;
            out[c] = (base + delta * params.amount).round().clamp(0.0, 255.0) as u8;
        }
    }
    sharpened
}

/// A frame written to the scratch directory, ready for the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedFrame {
    /// 1-based position in the run, contiguous
    pub sequence_number: u32,
    pub file_path: PathBuf,
}

pub fn processed_frame_path(dir: &Path, sequence_number: u32) -> PathBuf {
    dir.join(format!("processed_{:04}.png", sequence_number))
}

/// Overall progress after `completed` of `total` frames are preprocessed.
pub fn preprocess_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (completed as f64 / total as f64 * f64::from(PREPROCESS_BUDGET)).round() as u8
}

/// Runs a `FrameTransform` over a resolved frame list.
pub struct Preprocessor<'a> {
    transform: &'a dyn FrameTransform,
    parallel: bool,
}

impl<'a> Preprocessor<'a> {
    pub fn new(transform: &'a dyn FrameTransform) -> Self {
        Self {
            transform,
            parallel: false,
        }
    }

    /// Transform frames on the rayon pool instead of one at a time.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Process `frames` in order into `scratch_dir`.
    ///
    /// `on_progress` receives the overall percentage (0-30) after each
    /// finished frame. The first failure stops the batch.
    pub fn process(
        &self,
        frames: &[FrameSpec],
        scratch_dir: &Path,
        cancel: &CancelToken,
        on_progress: &(dyn Fn(u8) + Sync),
    ) -> ConvertResult<Vec<ProcessedFrame>> {
        let processed: Vec<ProcessedFrame> = (1..=frames.len() as u32)
            .map(|sequence_number| ProcessedFrame {
                sequence_number,
                file_path: processed_frame_path(scratch_dir, sequence_number),
            })
            .collect();

        if self.parallel {
            self.process_parallel(frames, &processed, cancel, on_progress)?;
        } else {
            self.process_sequential(frames, &processed, cancel, on_progress)?;
        }

        log::info!("preprocessed {} frames into {}", processed.len(), scratch_dir.display());
        Ok(processed)
    }

    fn process_sequential(
        &self,
        frames: &[FrameSpec],
        processed: &[ProcessedFrame],
        cancel: &CancelToken,
        on_progress: &(dyn Fn(u8) + Sync),
    ) -> ConvertResult<()> {
        let total = frames.len();
        for (i, (frame, target)) in frames.iter().zip(processed).enumerate() {
            if cancel.is_cancelled() {
                return Err(ConvertError::Cancelled);
            }
            self.transform_one(frame, target)?;
            on_progress(preprocess_percent(i + 1, total));
        }
        Ok(())
    }

    fn process_parallel(
        &self,
        frames: &[FrameSpec],
        processed: &[ProcessedFrame],
        cancel: &CancelToken,
        on_progress: &(dyn Fn(u8) + Sync),
    ) -> ConvertResult<()> {
        let total = frames.len();
        // Report under the lock so completed counts reach the callback in order.
        let completed = Mutex::new(0usize);

        frames
            .par_iter()
            .zip(processed.par_iter())
            .try_for_each(|(frame, target)| -> ConvertResult<()> {
                if cancel.is_cancelled() {
                    return Err(ConvertError::Cancelled);
                }
                self.transform_one(frame, target)?;

                let mut done = completed.lock().unwrap_or_else(|e| e.into_inner());
                *done += 1;
                on_progress(preprocess_percent(*done, total));
                Ok(())
            })
    }

    fn transform_one(&self, frame: &FrameSpec, target: &ProcessedFrame) -> ConvertResult<()> {
        log::debug!(
            "frame {} -> {}",
            frame.source_path.display(),
            target.file_path.display()
        );
        self.transform
            .apply(&frame.source_path, &target.file_path)
            .map_err(|cause| {
                log::error!("error processing {}: {:#}", frame.source_path.display(), cause);
                ConvertError::Preprocess {
                    path: frame.source_path.clone(),
                    cause,
                }
            })
    }
}
