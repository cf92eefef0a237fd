//! ffmpeg invocation and progress parsing.
//!
//! The encoder is driven as a child process. Its stderr is the only progress
//! channel, so it is read incrementally and scanned for `frame=<N>` markers.
//! ffmpeg rewrites its status line with `\r`, which is why chunks are split
//! on carriage returns as well as newlines.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command as ProcCommand, Stdio};

use crate::error::{ConvertError, ConvertResult};
use crate::progress::{CancelToken, PREPROCESS_BUDGET};

static FRAME_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"frame=\s*(\d+)").expect("frame marker pattern is valid"));

/// Diagnostic lines kept for the failure log.
const STDERR_TAIL_LINES: usize = 20;

/// Longest chunk handed out before a line break arrives.
const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// Codec settings passed to ffmpeg. The defaults produce a near-lossless,
/// widely playable H.264 MP4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub codec: String,
    pub crf: u8,
    pub preset: String,
    pub pixel_format: String,
    pub profile: String,
    pub level: String,
    pub tune: String,
    pub movflags: String,
    pub x264_params: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            crf: 10,
            preset: "slow".to_string(),
            pixel_format: "yuv420p".to_string(),
            profile: "high".to_string(),
            level: "4.1".to_string(),
            tune: "stillimage".to_string(),
            movflags: "+faststart".to_string(),
            x264_params: "aq-mode=2:aq-strength=0.8".to_string(),
        }
    }
}

/// Force the container extension to `.mp4`, whatever the caller asked for.
pub fn normalize_output_path(path: &Path) -> PathBuf {
    path.with_extension("mp4")
}

/// Build the full ffmpeg argument list. Order matters: input options must
/// precede `-i`.
pub fn build_encoder_args(
    settings: &EncoderSettings,
    frame_rate: f64,
    input_pattern: &Path,
    output: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::with_capacity(28);
    args.push("-y".into());
    let mut push = |flag: &str, value: &OsStr| {
        args.push(flag.into());
        args.push(value.to_os_string());
    };

    push("-framerate", OsStr::new(&frame_rate.to_string()));
    push("-start_number", OsStr::new("1"));
    push("-i", input_pattern.as_os_str());
    push("-c:v", OsStr::new(&settings.codec));
    push("-crf", OsStr::new(&settings.crf.to_string()));
    push("-preset", OsStr::new(&settings.preset));
    push("-pix_fmt", OsStr::new(&settings.pixel_format));
    push("-profile:v", OsStr::new(&settings.profile));
    push("-level", OsStr::new(&settings.level));
    push("-tune", OsStr::new(&settings.tune));
    push("-movflags", OsStr::new(&settings.movflags));
    push("-x264-params", OsStr::new(&settings.x264_params));

    args.push(normalize_output_path(output).into_os_string());
    args
}

/// First `frame=<N>` value in a chunk of diagnostic output.
pub fn parse_frame_marker(chunk: &str) -> Option<u64> {
    FRAME_MARKER.captures(chunk)?.get(1)?.as_str().parse().ok()
}

/// Overall progress once the encoder reports `frame` of `total_frames`.
pub fn encoding_percent(frame: u64, total_frames: usize) -> u8 {
    let encode_budget = f64::from(100 - PREPROCESS_BUDGET);
    let ratio = if total_frames == 0 {
        1.0
    } else {
        frame as f64 / total_frames as f64
    };
    let percent = f64::from(PREPROCESS_BUDGET) + (ratio * encode_budget).round();
    percent.min(100.0) as u8
}

/// Splits a byte stream into non-empty chunks at `\n` or `\r`.
///
/// A run of output with no line break is cut into pieces of at most
/// `MAX_CHUNK_BYTES`.
pub struct DiagnosticChunks<R> {
    reader: R,
}

impl<R: BufRead> DiagnosticChunks<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> Iterator for DiagnosticChunks<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let available = match self.reader.fill_buf() {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            };

            if available.is_empty() {
                if buf.is_empty() {
                    return None;
                }
                return Some(Ok(String::from_utf8_lossy(&buf).into_owned()));
            }

            match available.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(pos) => {
                    buf.extend_from_slice(&available[..pos]);
                    self.reader.consume(pos + 1);
                    if !buf.is_empty() {
                        return Some(Ok(String::from_utf8_lossy(&buf).into_owned()));
                    }
                }
                None => {
                    let len = available.len().min(MAX_CHUNK_BYTES - buf.len());
                    buf.extend_from_slice(&available[..len]);
                    self.reader.consume(len);
                    if buf.len() >= MAX_CHUNK_BYTES {
                        return Some(Ok(String::from_utf8_lossy(&buf).into_owned()));
                    }
                }
            }
        }
    }
}

/// A running encoder.
pub trait EncoderProcess {
    /// Hand over the diagnostic (stderr) stream. Returns `None` once taken.
    fn take_diagnostics(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Block until exit. `None` means the process had no exit code.
    fn wait(&mut self) -> io::Result<Option<i32>>;

    fn kill(&mut self) -> io::Result<()>;
}

/// Starts encoder processes.
pub trait EncoderLauncher: Send + Sync {
    fn launch(&self, program: &OsStr, args: &[OsString]) -> io::Result<Box<dyn EncoderProcess>>;
}

/// Launches the real ffmpeg binary with stderr piped.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegLauncher;

impl EncoderLauncher for FfmpegLauncher {
    fn launch(&self, program: &OsStr, args: &[OsString]) -> io::Result<Box<dyn EncoderProcess>> {
        let child = ProcCommand::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(Box::new(FfmpegProcess { child }))
    }
}

struct FfmpegProcess {
    child: Child,
}

impl EncoderProcess for FfmpegProcess {
    fn take_diagnostics(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as Box<dyn Read + Send>)
    }

    fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait()?.code())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

/// Runs one encode and turns its diagnostic stream into progress.
pub struct EncoderDriver<'a> {
    launcher: &'a dyn EncoderLauncher,
    program: &'a OsStr,
    settings: &'a EncoderSettings,
}

impl<'a> EncoderDriver<'a> {
    pub fn new(launcher: &'a dyn EncoderLauncher, program: &'a OsStr, settings: &'a EncoderSettings) -> Self {
        Self {
            launcher,
            program,
            settings,
        }
    }

    /// Encode the contiguous frame sequence at `input_pattern` into
    /// `output_path` (extension forced to `.mp4`).
    ///
    /// Returns the path actually written. `on_progress` receives overall
    /// percentages in the 30-100 range as frame markers arrive.
    pub fn encode(
        &self,
        input_pattern: &Path,
        total_frames: usize,
        frame_rate: f64,
        output_path: &Path,
        cancel: &CancelToken,
        on_progress: &dyn Fn(u8),
    ) -> ConvertResult<PathBuf> {
        let final_output = normalize_output_path(output_path);
        let args = build_encoder_args(self.settings, frame_rate, input_pattern, &final_output);

        log::info!(
            "running {} {}",
            self.program.to_string_lossy(),
            args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
        );

        let mut process = self
            .launcher
            .launch(self.program, &args)
            .map_err(|source| ConvertError::EncoderLaunch {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        if let Some(diagnostics) = process.take_diagnostics() {
            for chunk in DiagnosticChunks::new(BufReader::new(diagnostics)) {
                if cancel.is_cancelled() {
                    log::info!("cancelling encoder");
                    stop_process(process.as_mut());
                    return Err(ConvertError::Cancelled);
                }

                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        stop_process(process.as_mut());
                        return Err(ConvertError::EncoderIo(e));
                    }
                };

                log::debug!(target: "ffmpeg_log", "{}", chunk);
                if let Some(frame) = parse_frame_marker(&chunk) {
                    on_progress(encoding_percent(frame, total_frames));
                }

                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(chunk);
            }
        }

        match process.wait().map_err(ConvertError::EncoderIo)? {
            Some(0) => {
                log::info!("encoded {}", final_output.display());
                Ok(final_output)
            }
            Some(code) => {
                log::warn!(
                    "encoder exited with code {}; last output:\n{}",
                    code,
                    tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
                );
                Err(ConvertError::EncoderExit(code))
            }
            None => Err(ConvertError::EncoderSignal),
        }
    }
}

/// Kill the encoder and reap it.
fn stop_process(process: &mut dyn EncoderProcess) {
    if let Err(e) = process.kill() {
        log::warn!("failed to kill encoder: {}", e);
    }
    if let Err(e) = process.wait() {
        log::warn!("failed to wait for encoder: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[test]
    fn default_args_follow_encoder_contract() {
        let args = build_encoder_args(
            &EncoderSettings::default(),
            24.0,
            Path::new("/tmp/run/processed_%04d.png"),
            Path::new("/out/movie.mp4"),
        );
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();

        let expected = [
            "-y",
            "-framerate",
            "24",
            "-start_number",
            "1",
            "-i",
            "/tmp/run/processed_%04d.png",
            "-c:v",
            "libx264",
            "-crf",
            "10",
            "-preset",
            "slow",
            "-pix_fmt",
            "yuv420p",
            "-profile:v",
            "high",
            "-level",
            "4.1",
            "-tune",
            "stillimage",
            "-movflags",
            "+faststart",
            "-x264-params",
            "aq-mode=2:aq-strength=0.8",
            "/out/movie.mp4",
        ];
        assert_eq!(args, expected);
    }

    #[test]
    fn fractional_frame_rate_is_passed_verbatim() {
        let args = build_encoder_args(
            &EncoderSettings::default(),
            23.976,
            Path::new("in_%04d.png"),
            Path::new("out.mp4"),
        );
        let pos = args.iter().position(|a| a == "-framerate").unwrap();
        assert_eq!(args[pos + 1], "23.976");
    }

    #[test]
    fn output_extension_is_forced_to_mp4() {
        assert_eq!(normalize_output_path(Path::new("/v/clip.mov")), PathBuf::from("/v/clip.mp4"));
        assert_eq!(normalize_output_path(Path::new("/v/clip.MP4")), PathBuf::from("/v/clip.mp4"));
        assert_eq!(normalize_output_path(Path::new("/v/clip")), PathBuf::from("/v/clip.mp4"));

        let args = build_encoder_args(
            &EncoderSettings::default(),
            30.0,
            Path::new("in_%04d.png"),
            Path::new("/v/clip.mov"),
        );
        assert_eq!(args.last().unwrap(), "/v/clip.mp4");
    }

    #[test]
    fn frame_marker_parsing() {
        assert_eq!(parse_frame_marker("frame=   42 fps=12 q=-1.0 size=256kB"), Some(42));
        assert_eq!(parse_frame_marker("frame=7"), Some(7));
        assert_eq!(parse_frame_marker("frame= 10 fps=1 frame= 11"), Some(10));
        assert_eq!(parse_frame_marker("Input #0, image2, from 'processed_%04d.png':"), None);
        assert_eq!(parse_frame_marker("frame=N/A"), None);
    }

    #[test]
    fn encoding_percent_maps_onto_remaining_budget() {
        assert_eq!(encoding_percent(0, 10), 30);
        assert_eq!(encoding_percent(5, 10), 65);
        assert_eq!(encoding_percent(10, 10), 100);
        assert_eq!(encoding_percent(25, 10), 100);
        assert_eq!(encoding_percent(1, 3), 53);
    }

    #[test]
    fn chunks_split_on_carriage_returns_and_newlines() {
        let input = b"header line\nframe=    1 fps=0\rframe=    2 fps=0\r\n\nlast";
        let chunks: Vec<String> = DiagnosticChunks::new(Cursor::new(&input[..]))
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(chunks, vec!["header line", "frame=    1 fps=0", "frame=    2 fps=0", "last"]);
    }

    #[test]
    fn chunks_survive_small_read_buffers() {
        let input = b"frame=  123 fps=4\rframe=  124\n";
        let reader = BufReader::with_capacity(3, Cursor::new(&input[..]));
        let chunks: Vec<String> = DiagnosticChunks::new(reader).collect::<io::Result<_>>().unwrap();
        assert_eq!(chunks, vec!["frame=  123 fps=4", "frame=  124"]);
    }

    #[test]
    fn unbroken_output_is_split_at_the_chunk_limit() {
        let input = vec![b'x'; MAX_CHUNK_BYTES * 2 + 10];
        let chunks: Vec<String> = DiagnosticChunks::new(Cursor::new(input))
            .collect::<io::Result<_>>()
            .unwrap();
        let lens: Vec<usize> = chunks.iter().map(String::len).collect();
        assert_eq!(lens, vec![MAX_CHUNK_BYTES, MAX_CHUNK_BYTES, 10]);
    }

    #[derive(Default)]
    struct StuckProcess {
        kills: usize,
        waits: usize,
    }

    impl EncoderProcess for StuckProcess {
        fn take_diagnostics(&mut self) -> Option<Box<dyn Read + Send>> {
            None
        }

        fn wait(&mut self) -> io::Result<Option<i32>> {
            self.waits += 1;
            Err(io::Error::new(io::ErrorKind::Other, "wait failed"))
        }

        fn kill(&mut self) -> io::Result<()> {
            self.kills += 1;
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "kill failed"))
        }
    }

    #[test]
    fn stopping_still_reaps_when_kill_fails() {
        let mut process = StuckProcess::default();
        stop_process(&mut process);
        assert_eq!((process.kills, process.waits), (1, 1));
    }

    struct ScriptedProcess {
        stderr: Option<Vec<u8>>,
        code: Option<i32>,
        killed: Arc<Mutex<bool>>,
    }

    impl EncoderProcess for ScriptedProcess {
        fn take_diagnostics(&mut self) -> Option<Box<dyn Read + Send>> {
            self.stderr
                .take()
                .map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>)
        }

        fn wait(&mut self) -> io::Result<Option<i32>> {
            Ok(self.code)
        }

        fn kill(&mut self) -> io::Result<()> {
            *self.killed.lock().unwrap() = true;
            Ok(())
        }
    }

    struct ScriptedLauncher {
        stderr: &'static str,
        code: Option<i32>,
        launched: Mutex<Vec<Vec<OsString>>>,
        killed: Arc<Mutex<bool>>,
    }

    impl ScriptedLauncher {
        fn new(stderr: &'static str, code: Option<i32>) -> Self {
            Self {
                stderr,
                code,
                launched: Mutex::new(Vec::new()),
                killed: Arc::new(Mutex::new(false)),
            }
        }
    }

    impl EncoderLauncher for ScriptedLauncher {
        fn launch(&self, _program: &OsStr, args: &[OsString]) -> io::Result<Box<dyn EncoderProcess>> {
            self.launched.lock().unwrap().push(args.to_vec());
            Ok(Box::new(ScriptedProcess {
                stderr: Some(self.stderr.as_bytes().to_vec()),
                code: self.code,
                killed: Arc::clone(&self.killed),
            }))
        }
    }

    struct FailingLauncher;

    impl EncoderLauncher for FailingLauncher {
        fn launch(&self, _program: &OsStr, _args: &[OsString]) -> io::Result<Box<dyn EncoderProcess>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such file"))
        }
    }

    fn run(launcher: &dyn EncoderLauncher, cancel: &CancelToken) -> (ConvertResult<PathBuf>, Vec<u8>) {
        let settings = EncoderSettings::default();
        let driver = EncoderDriver::new(launcher, OsStr::new("ffmpeg"), &settings);
        let seen = Mutex::new(Vec::new());
        let result = driver.encode(
            Path::new("/scratch/processed_%04d.png"),
            4,
            12.0,
            Path::new("/out/anim.mov"),
            cancel,
            &|p| seen.lock().unwrap().push(p),
        );
        (result, seen.into_inner().unwrap())
    }

    #[test]
    fn successful_encode_reports_progress_and_output() {
        let launcher = ScriptedLauncher::new(
            "ffmpeg version 6.1\nInput #0, image2\nframe=    2 fps=0.0\rframe=    4 fps=3.1\nvideo:12kB\n",
            Some(0),
        );
        let (result, seen) = run(&launcher, &CancelToken::new());

        assert_eq!(result.unwrap(), PathBuf::from("/out/anim.mp4"));
        assert_eq!(seen, vec![65, 100]);

        let launched = launcher.launched.lock().unwrap();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].last().unwrap(), "/out/anim.mp4");
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let launcher = ScriptedLauncher::new("Conversion failed!\n", Some(1));
        let (result, seen) = run(&launcher, &CancelToken::new());

        assert!(matches!(result, Err(ConvertError::EncoderExit(1))));
        assert!(seen.is_empty());
    }

    #[test]
    fn missing_exit_code_is_a_signal_error() {
        let launcher = ScriptedLauncher::new("frame=1\n", None);
        let (result, _) = run(&launcher, &CancelToken::new());
        assert!(matches!(result, Err(ConvertError::EncoderSignal)));
    }

    #[test]
    fn launch_failure_names_the_program() {
        let (result, _) = run(&FailingLauncher, &CancelToken::new());
        match result {
            Err(ConvertError::EncoderLaunch { program, .. }) => assert_eq!(program, "ffmpeg"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn cancellation_kills_the_process() {
        let launcher = ScriptedLauncher::new("frame=1\nframe=2\n", Some(0));
        let cancel = CancelToken::new();
        cancel.cancel();

        let (result, seen) = run(&launcher, &cancel);
        assert!(matches!(result, Err(ConvertError::Cancelled)));
        assert!(seen.is_empty());
        assert!(*launcher.killed.lock().unwrap());
    }
}
