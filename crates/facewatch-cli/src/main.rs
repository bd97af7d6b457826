use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::{largest_face, verify, CosineResolver, EmbeddingExtractor, OnnxExtractor, VERIFY_THRESHOLD};
use facewatch_hw::Camera;
use facewatch_pipeline::{
    find_system_font, load_font, run_session, Config, MatchSnapshot, Overlay, Pipeline, ScaleFactors, SessionStats,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod db;
mod display;

#[derive(Parser)]
#[command(name = "facewatch", version, about = "Real-time face recognition from a webcam")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/facewatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Face store to use instead of the configured one
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Directory holding det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    models: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize faces live from the camera
    Live {
        /// Minimum similarity for a match
        #[arg(long)]
        threshold: Option<f32>,
        /// Run recognition on every Nth frame
        #[arg(long)]
        decimation: Option<u32>,
        /// V4L2 device path
        #[arg(long)]
        camera: Option<String>,
    },
    /// Manage enrolled faces
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Recognize faces in a still image
    Recognize {
        image: PathBuf,
        #[arg(long, default_value_t = 0.5)]
        threshold: f32,
        /// Write an annotated copy here
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check whether two images show the same person
    Verify { image1: PathBuf, image2: PathBuf },
    /// Show paths, models, database summary and cameras
    Info,
}

#[derive(Subcommand)]
enum DbCommand {
    /// List enrolled people
    List,
    /// Enroll a person from images
    Add {
        name: String,
        #[arg(long, num_args = 1.., required_unless_present = "directory", conflicts_with = "directory")]
        images: Vec<PathBuf>,
        /// Enroll every image in this directory
        #[arg(long)]
        directory: Option<PathBuf>,
    },
    /// Enroll from <root>/<name>/<image> layout
    Load { root: PathBuf },
    /// Remove a person and all their faces
    Remove { name: String },
    /// Write a JSON summary
    Export { output: PathBuf },
    /// Check database integrity
    Verify,
    /// Copy the face store
    Backup { dest: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(path) = cli.database {
        config.db_path = path;
    }
    if let Some(dir) = cli.models {
        config.model_dir = dir;
    }

    match cli.command {
        Commands::Live {
            threshold,
            decimation,
            camera,
        } => {
            if let Some(t) = threshold {
                config.threshold = t;
            }
            if let Some(k) = decimation {
                config.decimation = k;
            }
            if let Some(device) = camera {
                config.camera_device = device;
            }
            config.validate()?;
            live(config).await
        }
        Commands::Db { command } => db_command(&config, command),
        Commands::Recognize {
            image,
            threshold,
            output,
        } => recognize(&config, &image, threshold, output.as_deref()),
        Commands::Verify { image1, image2 } => verify_pair(&config, &image1, &image2),
        Commands::Info => {
            info(&config);
            Ok(())
        }
    }
}

async fn live(config: Config) -> Result<()> {
    let (_, database) = db::open_store(&config.db_path)?;
    if database.is_empty() {
        tracing::warn!("face database is empty; every face will show as Unknown");
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; stopping");
                stop.store(true, Ordering::Release);
            }
        });
    }

    // Camera, window and worker all live on one blocking thread.
    let stats = tokio::task::spawn_blocking(move || run_live(&config, database, &stop))
        .await
        .context("live session panicked")??;

    println!(
        "{} frames shown, {} submitted, {} dropped, {:.1} fps",
        stats.frames_displayed,
        stats.frames_submitted,
        stats.frames_dropped,
        stats.average_fps()
    );
    Ok(())
}

fn run_live(config: &Config, database: facewatch_core::FaceDatabase, stop: &AtomicBool) -> Result<SessionStats> {
    let extractor = load_extractor(config)?;
    let mut camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)
        .with_context(|| format!("opening camera {}", config.camera_device))?;
    let overlay = overlay(config)?;
    let mut window =
        display::WindowSink::new("facewatch", camera.width, camera.height).context("opening preview window")?;

    let mut pipeline = Pipeline::new(Arc::new(database), config.pipeline_config())?;
    let stats = run_session(&mut camera, &mut window, &mut pipeline, extractor, &overlay, stop)?;
    Ok(stats)
}

fn load_extractor(config: &Config) -> Result<OnnxExtractor> {
    OnnxExtractor::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))
}

fn overlay(config: &Config) -> Result<Overlay> {
    let font = match &config.font_path {
        Some(path) => match load_font(path) {
            Ok(font) => Some(font),
            Err(e) => {
                tracing::warn!(error = %e, "configured font unusable; trying system fonts");
                find_system_font()
            }
        },
        None => find_system_font(),
    };
    let overlay = Overlay::new(config.overlay_style()?, font);
    if !overlay.has_font() {
        tracing::info!("no caption font found; drawing boxes only");
    }
    Ok(overlay)
}

fn db_command(config: &Config, command: DbCommand) -> Result<()> {
    let (mut store, mut database) = db::open_store(&config.db_path)?;

    match command {
        DbCommand::List => {
            db::print_list(&database);
            return Ok(());
        }
        DbCommand::Add {
            name,
            images,
            directory,
        } => {
            let paths = match directory {
                Some(dir) => db::images_in(&dir)?,
                None => images,
            };
            let mut extractor = load_extractor(config)?;
            let added = db::enroll_images(&mut extractor, &mut database, &name, &paths)?;
            println!("Added {added} face(s) for {name}");
        }
        DbCommand::Load { root } => {
            let mut extractor = load_extractor(config)?;
            let added = db::load_structured(&mut extractor, &mut database, &root)?;
            println!("Loaded {added} face(s) from {}", root.display());
        }
        DbCommand::Remove { name } => {
            if !database.remove(&name) {
                bail!("person '{name}' not found in database");
            }
            println!("Removed '{name}' from database");
        }
        DbCommand::Export { output } => {
            return db::export(&database, &facewatch_core::ModelInfo::in_dir(&config.model_dir), &output);
        }
        DbCommand::Verify => {
            if !db::print_integrity(&database) {
                bail!("database integrity check failed");
            }
            return Ok(());
        }
        DbCommand::Backup { dest } => {
            store.backup(&dest)?;
            println!("Database backed up to {}", dest.display());
            return Ok(());
        }
    }

    store.save(&database).context("saving face database")?;
    Ok(())
}

fn recognize(config: &Config, path: &Path, threshold: f32, output: Option<&Path>) -> Result<()> {
    let (_, database) = db::open_store(&config.db_path)?;
    let mut extractor = load_extractor(config)?;
    let image = image::open(path)
        .with_context(|| format!("loading {}", path.display()))?
        .to_rgb8();

    let results = facewatch_core::recognize(&mut extractor, &CosineResolver, &image, &database, threshold)?;
    if results.is_empty() {
        println!("No faces recognized");
    }
    for r in &results {
        println!(
            "{} ({:.3}) at x={:.0} y={:.0} w={:.0} h={:.0}",
            r.identity, r.similarity, r.bbox.x, r.bbox.y, r.bbox.width, r.bbox.height
        );
        if let Some(age) = r.age {
            println!("    Age: {age:.0}");
        }
        if let Some(gender) = r.gender {
            println!("    Gender: {gender}");
        }
    }

    if let Some(out) = output {
        let snapshot = MatchSnapshot {
            results,
            scale: ScaleFactors::IDENTITY,
            sequence: 0,
            published_at: std::time::Instant::now(),
        };
        let mut annotated = image;
        overlay(config)?.render(&mut annotated, Some(&snapshot));
        annotated
            .save(out)
            .with_context(|| format!("writing {}", out.display()))?;
        println!("Annotated image saved to {}", out.display());
    }
    Ok(())
}

fn verify_pair(config: &Config, first: &Path, second: &Path) -> Result<()> {
    let mut extractor = load_extractor(config)?;
    let mut embed = |path: &Path| -> Result<Option<facewatch_core::Embedding>> {
        let image = image::open(path)
            .with_context(|| format!("loading {}", path.display()))?
            .to_rgb8();
        let faces = extractor.extract(&image)?;
        Ok(largest_face(&faces).map(|f| f.embedding.clone()))
    };

    match (embed(first)?, embed(second)?) {
        (Some(a), Some(b)) => {
            let result = verify(&a, &b);
            println!(
                "Verified: {} (similarity {:.3}, threshold {VERIFY_THRESHOLD})",
                result.verified, result.similarity
            );
        }
        _ => println!("Verified: false (similarity 0.000): no face detected in one or both images"),
    }
    Ok(())
}

fn info(config: &Config) {
    let models = facewatch_core::ModelInfo::in_dir(&config.model_dir);
    println!("Config file:  {}", Config::default_path().display());
    println!("Face store:   {}", config.db_path.display());
    println!("Models:       {}", config.model_dir.display());
    println!("  detector:   {}", presence(&models.detector));
    println!("  recognizer: {}", presence(&models.recognizer));
    println!("  gender/age: {} (optional)", presence(&models.attributes));

    if config.db_path.exists() {
        match db::open_store(&config.db_path) {
            Ok((_, database)) => db::print_list(&database),
            Err(e) => println!("Face store unreadable: {e:#}"),
        }
    } else {
        println!("Face store not created yet");
    }

    let cameras = Camera::list_devices();
    if cameras.is_empty() {
        println!("No capture devices found");
    }
    for cam in cameras {
        println!("Camera {}: {} ({}, {})", cam.path, cam.name, cam.driver, cam.bus);
    }
}

fn presence(path: &Path) -> String {
    let state = if path.exists() { "present" } else { "missing" };
    format!("{} [{state}]", path.display())
}
