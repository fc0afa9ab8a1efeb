use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facesort_core::{
    codec, CascadeDetector, Config, FaceDetector, HaarCascade, PhotoSorter, RunReport, SortError,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facesort", about = "Move photos into folders by whether they show a face")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify every image in the source directory and move it (default)
    Sort(SortArgs),
    /// Run face detection on one image without moving it
    Detect {
        /// Image to inspect
        image: PathBuf,
        #[command(flatten)]
        detection: DetectionArgs,
        /// Print the detected regions as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Default)]
struct SortArgs {
    /// Directory holding the photos to sort
    source: Option<PathBuf>,
    /// Destination for photos with a face
    #[arg(long)]
    with_face: Option<PathBuf>,
    /// Destination for photos without a face
    #[arg(long)]
    without_face: Option<PathBuf>,
    #[command(flatten)]
    detection: DetectionArgs,
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Default)]
struct DetectionArgs {
    /// OpenCV Haar cascade XML (e.g. haarcascade_frontalface_default.xml)
    #[arg(long)]
    cascade: Option<PathBuf>,
    /// Pyramid scale step, > 1.0
    #[arg(long)]
    scale_factor: Option<f64>,
    /// Overlapping detections required to accept a face
    #[arg(long)]
    min_neighbors: Option<u32>,
    /// Smallest face side in pixels
    #[arg(long)]
    min_size: Option<u32>,
}

impl DetectionArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.cascade {
            config.cascade_path = path.clone();
        }
        if let Some(v) = self.scale_factor {
            config.scale_factor = v;
        }
        if let Some(v) = self.min_neighbors {
            config.min_neighbors = v;
        }
        if let Some(v) = self.min_size {
            config.min_window_size = v;
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = base_config(cli.config.as_ref())?;

    match cli.command.unwrap_or_else(|| Commands::Sort(SortArgs::default())) {
        Commands::Sort(args) => {
            if let Some(source) = args.source {
                config.source_dir = source;
            }
            if let Some(dir) = args.with_face {
                config.with_face_dir = dir;
            }
            if let Some(dir) = args.without_face {
                config.without_face_dir = dir;
            }
            args.detection.apply(&mut config);
            config.validate()?;

            let detector = load_detector(&config)?;
            let sorter = PhotoSorter::new(config, detector);
            match sorter.run() {
                Ok(report) => print_report(&report, args.json)?,
                Err(SortError::SourceMissing(dir)) => {
                    tracing::error!(dir = %dir.display(), "source directory does not exist");
                    eprintln!(
                        "Source directory '{}' does not exist. Create it and put your photos inside.",
                        dir.display()
                    );
                }
                Err(e) => return Err(e).context("sorting failed"),
            }
        }
        Commands::Detect {
            image,
            detection,
            json,
        } => {
            detection.apply(&mut config);
            config.validate()?;

            let detector = load_detector(&config)?;
            let img = codec::load(&image)
                .with_context(|| format!("cannot load {}", image.display()))?;
            let faces = detector.detect(&codec::to_grayscale(&img));

            if json {
                println!("{}", serde_json::to_string_pretty(&faces)?);
            } else if faces.is_empty() {
                println!("{}: no face detected", image.display());
            } else {
                println!("{}: {} face(s)", image.display(), faces.len());
                for face in &faces {
                    println!(
                        "  x={} y={} {}x{} neighbors={}",
                        face.x, face.y, face.width, face.height, face.neighbors
                    );
                }
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Defaults, then the optional config file, then `FACESORT_*` variables.
fn base_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(p) => Config::load(p)?,
        None => Config::default(),
    };
    config.apply_env();
    Ok(config)
}

fn load_detector(config: &Config) -> Result<CascadeDetector> {
    let cascade = HaarCascade::load(&config.cascade_path)
        .with_context(|| format!("cannot load cascade {}", config.cascade_path.display()))?;
    Ok(CascadeDetector::new(cascade, config.detection_params()))
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "Sorting complete: {} with face, {} without face, {} skipped.",
        report.with_face.len(),
        report.without_face.len(),
        report.skipped
    );
    for path in &report.load_failures {
        println!("  could not load: {}", path.display());
    }
    for path in &report.move_failures {
        println!("  could not move: {}", path.display());
    }
    Ok(())
}
