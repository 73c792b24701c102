use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::{FaceRecognition, MatchResult, OnnxExtractor};
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "facewatch", about = "Recognize faces against a watched persons database")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize the faces in one image
    Match {
        /// Input image
        #[arg(short, long)]
        image: PathBuf,
        /// Persons database (one sub-folder per person)
        #[arg(short, long)]
        db: Option<PathBuf>,
        /// Similarity a match must exceed
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Write the annotated image here
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Report only the best face
        #[arg(long)]
        single: bool,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load the persons database and list enrolled identities
    Load {
        #[arg(short, long)]
        db: Option<PathBuf>,
        /// Write an annotated `_visualize` copy next to every image
        #[arg(long)]
        visualize: bool,
        #[arg(long)]
        json: bool,
    },
    /// Watch the database and re-run recognition every interval
    Watch {
        #[arg(short, long)]
        image: PathBuf,
        #[arg(short, long)]
        db: Option<PathBuf>,
        /// Seconds between database scans and recognition rounds
        #[arg(long)]
        interval: Option<u64>,
        /// Number of recognition rounds before exiting
        #[arg(long, default_value_t = 10)]
        rounds: u32,
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Exercise the database watcher end to end
    Selftest {
        #[arg(short, long)]
        image: PathBuf,
        #[arg(short, long)]
        db: Option<PathBuf>,
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    disable_core_dumps();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Match { image, db, threshold, output, single, json } => {
            let fr = recognizer(&config)?;
            fr.load_persons_db(db.unwrap_or(config.db_path.clone()), false, false)?;

            let mut frame = open_rgb(&image)?;
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            let visualize = output.is_some();

            let results = if single {
                vec![fr.run_one_face(&mut frame, threshold, visualize)?]
            } else {
                fr.run(&mut frame, threshold, visualize)?
            };
            print_results(&results, json)?;

            if let Some(out) = output {
                frame
                    .save(&out)
                    .with_context(|| format!("writing {}", out.display()))?;
                println!("Annotated image written to {}", out.display());
            }
        }
        Commands::Load { db, visualize, json } => {
            let fr = recognizer(&config)?;
            fr.load_persons_db(db.unwrap_or(config.db_path.clone()), true, visualize)?;
            let registry = fr.registry();

            if json {
                let identities: Vec<_> = registry
                    .iter()
                    .map(|i| serde_json::json!({ "name": i.name, "embeddings": i.embeddings.len() }))
                    .collect();
                println!(
                    "{}",
                    serde_json::json!({
                        "status": fr.load_status().to_string(),
                        "identities": identities,
                    })
                );
            } else {
                println!("{} identities, {} embeddings", registry.len(), registry.embedding_count());
                for identity in registry.iter() {
                    println!("  {:<24} {}", identity.name, identity.embeddings.len());
                }
            }
        }
        Commands::Watch { image, db, interval, rounds, threshold } => {
            let fr = recognizer(&config)?;
            fr.load_persons_db(db.unwrap_or(config.db_path.clone()), false, false)?;
            let interval = Duration::from_secs(interval.unwrap_or(config.watch_interval_secs));
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            fr.start_watching(interval)?;

            for round in 1..=rounds {
                let mut frame = open_rgb(&image)?;
                let best = fr.run_one_face(&mut frame, threshold, false)?;
                let registry = fr.registry();
                println!(
                    "[{round}/{rounds}] {best}  (db: {} identities, {} embeddings, {})",
                    registry.len(),
                    registry.embedding_count(),
                    fr.load_status()
                );
                if round < rounds {
                    thread::sleep(interval);
                }
            }
            fr.stop_watching();
        }
        Commands::Selftest { image, db, interval } => {
            let fr = recognizer(&config)?;
            selftest(&fr, &image, &db.unwrap_or(config.db_path.clone()), Duration::from_secs(interval), config.similarity_threshold)?;
        }
    }

    Ok(())
}

fn recognizer(config: &Config) -> Result<FaceRecognition> {
    let extractor = OnnxExtractor::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        config.max_image_size,
    )
    .context("loading ONNX models")?;
    Ok(FaceRecognition::new(Box::new(extractor)))
}

fn open_rgb(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("reading image {}", path.display()))?
        .to_rgb8())
}

fn print_results(results: &[MatchResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No faces found");
    }
    for (i, result) in results.iter().enumerate() {
        println!("Face {}: {result}", i + 1);
    }
    Ok(())
}

/// Load, watch, add an identity on disk, and confirm the watcher reloads it.
fn selftest(fr: &FaceRecognition, image: &Path, db: &Path, interval: Duration, threshold: f32) -> Result<()> {
    tracing::info!("1. loading persons database");
    fr.load_persons_db(db, false, false)?;

    tracing::info!(interval_secs = interval.as_secs(), "2. starting database watcher");
    fr.start_watching(interval)?;

    tracing::info!("3. first recognition run");
    let best = fr.run_one_face(&mut open_rgb(image)?, threshold, false)?;
    println!("Found: {best}");

    let test_face = TestIdentity::create(db)?;
    tracing::info!(path = %test_face.file.display(), "4. triggering a database change");

    tracing::info!("5. waiting for the watcher to reload");
    let deadline = Instant::now() + interval * 5;
    let mut reloaded = false;
    while Instant::now() < deadline {
        if fr.registry().get("misterx").is_some() {
            reloaded = true;
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("6. second recognition run");
    let best = fr.run_one_face(&mut open_rgb(image)?, threshold, false)?;
    println!("Found: {best}");

    tracing::info!("7. cleaning up");
    drop(test_face);
    fr.stop_watching();

    if reloaded {
        println!("Selftest passed: watcher picked up the new identity");
        Ok(())
    } else {
        anyhow::bail!("watcher did not reload within {:?}", interval * 5)
    }
}

/// `misterx/testme.jpg` written into the database for the self-test and
/// removed again on drop, including when a later step fails.
struct TestIdentity {
    dir: PathBuf,
    file: PathBuf,
    created_dir: bool,
}

impl TestIdentity {
    fn create(db: &Path) -> Result<Self> {
        let dir = db.join("misterx");
        let created_dir = !dir.exists();
        if created_dir {
            std::fs::create_dir(&dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let guard = Self {
            file: dir.join("testme.jpg"),
            dir,
            created_dir,
        };
        RgbImage::from_pixel(400, 400, Rgb([255, 255, 255]))
            .save(&guard.file)
            .with_context(|| format!("writing {}", guard.file.display()))?;
        Ok(guard)
    }
}

impl Drop for TestIdentity {
    fn drop(&mut self) {
        if self.file.exists() {
            if let Err(e) = std::fs::remove_file(&self.file) {
                tracing::warn!(path = %self.file.display(), error = %e, "cannot remove self-test image");
            }
        }
        if self.created_dir {
            if let Err(e) = std::fs::remove_dir(&self.dir) {
                tracing::warn!(path = %self.dir.display(), error = %e, "cannot remove self-test identity");
            }
        }
    }
}

/// The process holds biometric templates in memory; keep them out of core files.
#[cfg(unix)]
fn disable_core_dumps() {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a fully initialized rlimit that outlives the call.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if rc != 0 {
        tracing::warn!(error = %std::io::Error::last_os_error(), "cannot disable core dumps");
    }
}

#[cfg(not(unix))]
fn disable_core_dumps() {}
