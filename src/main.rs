use anyhow::{anyhow, Result};
use clap::Parser;
use dialoguer::{Confirm, Input};
use framereel::{
    normalize_output_path, AppConfig, ConversionObserver, ConversionRequest, ConversionResult,
    Converter, ProgressEvent, ProgressPhase,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Convert numbered PNG frames (0001.png, 0002.png, ...) into an MP4 video."
)]
struct Args {
    /// Frame images, or directories containing them
    inputs: Vec<PathBuf>,

    /// Output video file (the extension is always replaced with .mp4)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Frames per second of the output video
    #[arg(long)]
    fps: Option<f64>,

    /// Read configuration from this file instead of the default locations
    #[arg(long)]
    config: Option<PathBuf>,

    /// ffmpeg executable to run
    #[arg(long)]
    ffmpeg: Option<String>,

    /// Directory in which the scratch directory is created
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Preprocess frames on all cores
    #[arg(long, default_value_t = false)]
    parallel: bool,

    /// Never prompt, overwrite an existing output file
    #[arg(long, short, default_value_t = false)]
    yes: bool,

    /// Log pipeline details to standard error
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

/// Mirrors run progress onto a terminal progress bar.
struct BarObserver {
    bar: ProgressBar,
}

impl ConversionObserver for BarObserver {
    fn on_progress(&self, event: ProgressEvent) {
        let msg = match event.phase {
            ProgressPhase::Preprocessing => "Preprocessing frames",
            ProgressPhase::Encoding => "Encoding video",
        };
        self.bar.set_message(msg);
        self.bar.set_position(u64::from(event.percent));
    }

    fn on_complete(&self, result: &ConversionResult) {
        if result.is_success() {
            self.bar.finish_with_message("Done");
        } else {
            self.bar.abandon_with_message("Failed");
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    let is_interactive = !args.yes && std::io::stdin().is_terminal();

    let mut cfg = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::load()?,
    };
    if let Some(ffmpeg) = &args.ffmpeg {
        cfg.ffmpeg_path = ffmpeg.clone();
    }
    if let Some(dir) = &args.scratch_dir {
        cfg.scratch_root = Some(dir.clone());
    }
    if args.parallel {
        cfg.parallel_preprocessing = true;
    }

    // --- Inputs ---
    let frames = if args.inputs.is_empty() {
        let found = find_png_files()?;
        if found.is_empty() {
            return Err(anyhow!("No PNG files found in current directory."));
        }
        if is_interactive
            && !Confirm::new()
                .with_prompt(format!("Use the {} PNG files in the current directory?", found.len()))
                .default(true)
                .interact()?
        {
            println!("Operation cancelled.");
            return Ok(());
        }
        found
    } else {
        expand_inputs(&args.inputs)?
    };

    let output = match args.output {
        Some(p) => p,
        None if is_interactive => PathBuf::from(
            Input::<String>::new()
                .with_prompt("Output file")
                .default("output.mp4".to_string())
                .interact_text()?,
        ),
        None => PathBuf::from("output.mp4"),
    };

    let fps = match args.fps {
        Some(fps) => fps,
        None if is_interactive => Input::<f64>::new()
            .with_prompt("Frames per second (FPS)")
            .default(cfg.default_frame_rate)
            .interact_text()?,
        None => cfg.default_frame_rate,
    };

    let final_output = normalize_output_path(&output);
    if final_output.exists() && !args.yes {
        if !is_interactive {
            return Err(anyhow!(
                "{} already exists (pass --yes to overwrite)",
                final_output.display()
            ));
        }
        if !Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", final_output.display()))
            .default(false)
            .interact()?
        {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    // --- Execution ---
    let converter = Converter::with_config(cfg)?;
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("#>-"),
    );
    let observer = BarObserver { bar };

    let request = ConversionRequest::new(frames, output, fps);
    match converter.convert(&request, &observer) {
        ConversionResult::Success { output_path } => {
            println!("High-quality conversion complete: {}", output_path.display());
            Ok(())
        }
        ConversionResult::Failure { message } => Err(anyhow!(message)),
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();
}

/// Expand directories (one level deep) into the files they contain.
fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            files.extend(
                WalkDir::new(input)
                    .min_depth(1)
                    .max_depth(1)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.into_path()),
            );
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            return Err(anyhow!("Input path does not exist: {}", input.display()));
        }
    }
    Ok(files)
}

fn find_png_files() -> Result<Vec<PathBuf>> {
    Ok(WalkDir::new(".")
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file() && e.path().extension().is_some_and(|ext| ext == "png")
        })
        .map(|e| e.into_path())
        .collect())
}
