//! # framereel - frame sequence to MP4
//!
//! `framereel` turns a set of numbered still images (`0001.png`, `0002.png`,
//! ...) into a single H.264 MP4 file.
//!
//! ## Pipeline
//!
//! 1. Resolve: keep files named exactly `NNNN.png`, order them by number
//! 2. Preprocess: sharpen each frame and write it losslessly into a scratch
//!    directory under a contiguous name (`processed_0001.png`, ...)
//! 3. Encode: stream the processed frames through ffmpeg, turning its
//!    `frame=` status output into progress
//!
//! The scratch directory is removed whatever the outcome.
//!
//! ## Example
//!
//! ```no_run
//! use framereel::{ConversionRequest, ConversionResult, Converter, NoopObserver};
//!
//! let converter = Converter::new();
//! let request = ConversionRequest::new(
//!     vec!["render/0001.png".into(), "render/0002.png".into()],
//!     "out/shot.mp4",
//!     24.0,
//! );
//! match converter.convert(&request, &NoopObserver) {
//!     ConversionResult::Success { output_path } => println!("wrote {}", output_path.display()),
//!     ConversionResult::Failure { message } => eprintln!("failed: {message}"),
//! }
//! ```
//!
//! ## Progress Reporting
//!
//! Implement [`ConversionObserver`] to receive updates on a 0-100 scale.
//! Preprocessing covers 0-30, encoding 30-100, and the value never goes
//! backwards within a run.

pub mod encoder;
pub mod error;
pub mod frames;
pub mod preprocessing;
pub mod progress;
pub mod scratch;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub use encoder::{
    build_encoder_args, normalize_output_path, EncoderDriver, EncoderLauncher, EncoderProcess,
    EncoderSettings, FfmpegLauncher,
};
pub use error::{ConvertError, ConvertResult};
pub use frames::{frame_index, resolve_frames, FrameSpec};
pub use preprocessing::{FrameTransform, ProcessedFrame, Preprocessor, SharpenParams, SharpenTransform};
pub use progress::{CancelToken, ConversionObserver, NoopObserver, ProgressEvent, ProgressPhase};
pub use scratch::ScratchDir;

use crate::preprocessing::PROCESSED_FRAME_PATTERN;
use crate::progress::ProgressTracker;

const CONFIG_FILE_NAME: &str = "framereel.json";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// ffmpeg executable, looked up on PATH unless absolute
    pub ffmpeg_path: String,
    /// Frame rate offered when none is given on the command line
    pub default_frame_rate: f64,
    /// Transform frames on all cores instead of one at a time
    pub parallel_preprocessing: bool,
    /// Where scratch directories are created (system temp dir if unset)
    pub scratch_root: Option<PathBuf>,
    pub sharpen: SharpenParams,
    pub encoder: EncoderSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            default_frame_rate: 24.0,
            parallel_preprocessing: false,
            scratch_root: None,
            sharpen: SharpenParams::default(),
            encoder: EncoderSettings::default(),
        }
    }
}

impl AppConfig {
    /// Look for `framereel.json` in the app data dir, then the current dir,
    /// then fall back to built-in defaults.
    pub fn load() -> Result<Self> {
        let mut tried: Vec<PathBuf> = Vec::new();
        if let Some(mut d) = dirs::data_dir() {
            d.push("framereel");
            d.push(CONFIG_FILE_NAME);
            tried.push(d);
        }
        tried.push(PathBuf::from(CONFIG_FILE_NAME));

        for p in &tried {
            if p.exists() {
                return Self::from_file(p);
            }
        }

        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config json {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ffmpeg_path.trim().is_empty() {
            return Err(anyhow!("ffmpeg_path cannot be empty"));
        }
        if !is_valid_frame_rate(self.default_frame_rate) {
            return Err(anyhow!(
                "default_frame_rate must be a positive number, got {}",
                self.default_frame_rate
            ));
        }
        if !(self.sharpen.radius.is_finite() && self.sharpen.radius > 0.0) {
            return Err(anyhow!("sharpen.radius must be positive, got {}", self.sharpen.radius));
        }
        if !self.sharpen.amount.is_finite() || self.sharpen.amount < 0.0 {
            return Err(anyhow!("sharpen.amount cannot be negative, got {}", self.sharpen.amount));
        }
        Ok(())
    }
}

fn is_valid_frame_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

/// One conversion job as supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    /// Candidate frame files, in any order
    pub frames: Vec<PathBuf>,
    /// Requested output file; the extension is always replaced with `.mp4`
    pub output_path: PathBuf,
    pub frame_rate: f64,
}

impl ConversionRequest {
    pub fn new(frames: Vec<PathBuf>, output_path: impl Into<PathBuf>, frame_rate: f64) -> Self {
        Self {
            frames,
            output_path: output_path.into(),
            frame_rate,
        }
    }
}

/// Terminal outcome of a run. Exactly one is produced per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionResult {
    Success { output_path: PathBuf },
    Failure { message: String },
}

impl ConversionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ConversionResult::Success { .. })
    }
}

impl From<ConvertResult<PathBuf>> for ConversionResult {
    fn from(result: ConvertResult<PathBuf>) -> Self {
        match result {
            Ok(output_path) => ConversionResult::Success { output_path },
            Err(e) => ConversionResult::Failure { message: e.to_string() },
        }
    }
}

impl fmt::Display for ConversionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionResult::Success { output_path } => {
                write!(f, "conversion complete: {}", output_path.display())
            }
            ConversionResult::Failure { message } => write!(f, "error: {}", message),
        }
    }
}

/// Where a converter is in its current (or last) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionState {
    Idle,
    Resolving,
    Preprocessing,
    Encoding,
    Succeeded,
    Failed,
}

/// Runs conversions end to end.
///
/// A converter handles one run at a time; callers that may trigger runs
/// concurrently must serialize them.
pub struct Converter {
    config: AppConfig,
    transform: Box<dyn FrameTransform>,
    launcher: Box<dyn EncoderLauncher>,
    state: Mutex<ConversionState>,
}

impl Converter {
    /// Create a new converter with default configuration
    pub fn new() -> Self {
        Self::build(AppConfig::default())
    }

    /// Create a converter with custom configuration
    pub fn with_config(config: AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// Load configuration from a file
    pub fn from_config_file(path: &Path) -> Result<Self> {
        Ok(Self::build(AppConfig::from_file(path)?))
    }

    fn build(config: AppConfig) -> Self {
        Self {
            transform: Box::new(SharpenTransform::new(config.sharpen)),
            launcher: Box::new(FfmpegLauncher),
            config,
            state: Mutex::new(ConversionState::Idle),
        }
    }

    /// Replace the per-frame image transform
    pub fn with_transform(mut self, transform: impl FrameTransform + 'static) -> Self {
        self.transform = Box::new(transform);
        self
    }

    /// Replace how the encoder process is started
    pub fn with_launcher(mut self, launcher: impl EncoderLauncher + 'static) -> Self {
        self.launcher = Box::new(launcher);
        self
    }

    /// Get the current configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> ConversionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a conversion to completion.
    pub fn convert(&self, request: &ConversionRequest, observer: &dyn ConversionObserver) -> ConversionResult {
        self.convert_with_cancel(request, observer, &CancelToken::new())
    }

    /// Run a conversion that stops early once `cancel` is triggered.
    ///
    /// The token is checked between frames while preprocessing and on every
    /// line of encoder output; a cancelled run ends as a `Failure`.
    pub fn convert_with_cancel(
        &self,
        request: &ConversionRequest,
        observer: &dyn ConversionObserver,
        cancel: &CancelToken,
    ) -> ConversionResult {
        let tracker = ProgressTracker::new(observer);

        let result = match self.run(request, &tracker, cancel) {
            Ok(output_path) => {
                if tracker.last() != Some(100) {
                    log::debug!("encoder finished before its last frame marker");
                }
                tracker.report(ProgressPhase::Encoding, 100);
                self.transition(ConversionState::Succeeded);
                ConversionResult::Success { output_path }
            }
            Err(e) => {
                log::error!("conversion failed: {}", e);
                self.transition(ConversionState::Failed);
                ConversionResult::Failure { message: e.to_string() }
            }
        };

        observer.on_complete(&result);
        result
    }

    fn run(&self, request: &ConversionRequest, tracker: &ProgressTracker<'_>, cancel: &CancelToken) -> ConvertResult<PathBuf> {
        self.transition(ConversionState::Resolving);

        if !is_valid_frame_rate(request.frame_rate) {
            return Err(ConvertError::InvalidFrameRate(request.frame_rate));
        }
        let frames = resolve_frames(&request.frames)?;
        if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
            log::info!(
                "resolved {} frames ({:04}..{:04}) from {} inputs",
                frames.len(),
                first.index,
                last.index,
                request.frames.len()
            );
        }
        if cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }

        let scratch = match &self.config.scratch_root {
            Some(root) => ScratchDir::acquire_in(root)?,
            None => ScratchDir::acquire()?,
        };
        let outcome = self.run_stages(&frames, &scratch, request, tracker, cancel);
        scratch.release();
        outcome
    }

    fn run_stages(
        &self,
        frames: &[FrameSpec],
        scratch: &ScratchDir,
        request: &ConversionRequest,
        tracker: &ProgressTracker<'_>,
        cancel: &CancelToken,
    ) -> ConvertResult<PathBuf> {
        self.transition(ConversionState::Preprocessing);
        tracker.report(ProgressPhase::Preprocessing, 0);

        let processed = Preprocessor::new(self.transform.as_ref())
            .with_parallel(self.config.parallel_preprocessing)
            .process(frames, scratch.path(), cancel, &|p| {
                tracker.report(ProgressPhase::Preprocessing, p)
            })?;

        ensure_parent_dir(&request.output_path)?;

        self.transition(ConversionState::Encoding);
        let input_pattern = scratch.path().join(PROCESSED_FRAME_PATTERN);
        EncoderDriver::new(
            self.launcher.as_ref(),
            OsStr::new(&self.config.ffmpeg_path),
            &self.config.encoder,
        )
        .encode(
            &input_pattern,
            processed.len(),
            request.frame_rate,
            &request.output_path,
            cancel,
            &|p| tracker.report(ProgressPhase::Encoding, p),
        )
    }

    fn transition(&self, next: ConversionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        log::debug!("conversion state {:?} -> {:?}", *state, next);
        *state = next;
    }
}

impl Default for Converter {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_parent_dir(path: &Path) -> ConvertResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|source| ConvertError::Output {
                path: parent.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{ "default_frame_rate": 30, "sharpen": { "radius": 0.8 }, "encoder": { "crf": 16 } }"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.default_frame_rate, 30.0);
        assert_eq!(config.sharpen.radius, 0.8);
        assert_eq!(config.sharpen.threshold, 2);
        assert_eq!(config.encoder.crf, 16);
        assert_eq!(config.encoder.preset, "slow");
        assert_eq!(config.ffmpeg_path, "ffmpeg");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{ "default_frame_rate": 0 }"#).unwrap();
        assert!(AppConfig::from_file(&path).is_err());

        let config = AppConfig {
            ffmpeg_path: "  ".to_string(),
            ..AppConfig::default()
        };
        assert!(Converter::with_config(config).is_err());
    }

    #[test]
    fn frame_rate_must_be_positive() {
        assert!(is_valid_frame_rate(24.0));
        assert!(is_valid_frame_rate(0.5));
        assert!(!is_valid_frame_rate(0.0));
        assert!(!is_valid_frame_rate(-1.0));
        assert!(!is_valid_frame_rate(f64::NAN));
        assert!(!is_valid_frame_rate(f64::INFINITY));
    }

    #[test]
    fn result_converts_from_pipeline_outcome() {
        let ok: ConversionResult = Ok::<_, ConvertError>(PathBuf::from("/out/a.mp4")).into();
        assert_eq!(ok, ConversionResult::Success { output_path: PathBuf::from("/out/a.mp4") });

        let failed: ConversionResult = Err::<PathBuf, _>(ConvertError::EncoderExit(3)).into();
        assert_eq!(
            failed,
            ConversionResult::Failure { message: "encoder exited with code 3".to_string() }
        );
        assert!(!failed.is_success());
    }

    #[test]
    fn new_converter_is_idle() {
        assert_eq!(Converter::new().state(), ConversionState::Idle);
    }
}
