//! Corn Diagnosis CLI
//!
//! Train the corn leaf classifier on a directory tree, classify images with a
//! trained checkpoint, or list the disease taxonomy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use burn::config::Config;
use burn::module::AutodiffModule;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};
use walkdir::WalkDir;

use corn_diagnosis::backend::{backend_name, default_device, InferenceBackend, TrainingBackend};
use corn_diagnosis::dataset::{
    DatasetIndex, TransformConfig, TransformPipeline, DEFAULT_VARIANTS, IMAGE_EXTENSIONS,
};
use corn_diagnosis::inference::{BatchPolicy, ImageUpload, InferenceService, ServiceConfig};
use corn_diagnosis::model::{ClassifierConfig, CHECKPOINT_FILE, CLASSIFIER_CONFIG_FILE};
use corn_diagnosis::taxonomy::{self, DiseaseClass};
use corn_diagnosis::training::{SampleLoader, Trainer, TrainingConfig};
use corn_diagnosis::utils::format_elapsed;
use corn_diagnosis::utils::logging::{init_logging, LogConfig, LogLevel};

/// Corn leaf disease classification with Burn
#[derive(Parser, Debug)]
#[command(name = "corn_diagnosis")]
#[command(version)]
#[command(about = "Corn leaf disease classification with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CORN_LOG", default_value = "info")]
    log_level: String,

    /// Plain log output without colors, for log collectors
    #[arg(long, default_value = "false")]
    plain: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train the classifier on a `root/<Class>/<Variant>/` image tree
    Train {
        /// Dataset root directory
        #[arg(short, long, default_value = "data/corn")]
        data_dir: PathBuf,

        /// Accepted variant sub-directories (comma separated)
        #[arg(long, value_delimiter = ',', default_values = DEFAULT_VARIANTS)]
        variants: Vec<String>,

        #[arg(short, long, default_value = "10")]
        epochs: usize,

        #[arg(short, long, default_value = "32")]
        batch_size: usize,

        #[arg(short, long, default_value = "0.001")]
        learning_rate: f64,

        /// Share of each class held out for validation; 0 validates on the full dataset
        #[arg(long, default_value = "0.2")]
        validation_fraction: f64,

        /// Only train the classification head
        #[arg(long, default_value = "false")]
        freeze_backbone: bool,

        /// Backbone-only weights to start from
        #[arg(long)]
        pretrained_backbone: Option<PathBuf>,

        /// Input resolution (square)
        #[arg(long, default_value = "224")]
        image_size: usize,

        /// Output directory for the checkpoint and run report
        #[arg(short, long, default_value = "output/models")]
        output_dir: PathBuf,

        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Classify images (files or directories)
    Predict {
        /// Images or directories of images
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Trained checkpoint; random weights are used when missing. The
        /// classifier config saved next to it is picked up as well.
        #[arg(short, long)]
        checkpoint: Option<PathBuf>,

        /// Input resolution (square), must match training
        #[arg(long, default_value = "224")]
        image_size: usize,

        /// Report each image separately instead of failing on the first bad one
        #[arg(long, default_value = "false")]
        per_image: bool,

        /// Print results as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// List the disease classes
    Classes,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.plain {
        LogConfig {
            level: LogLevel::parse(&cli.log_level),
            ..LogConfig::production()
        }
    } else {
        LogConfig {
            level: LogLevel::parse(&cli.log_level),
            ..LogConfig::default()
        }
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("{} {}", "Warning:".yellow().bold(), e);
    }

    match cli.command {
        Commands::Train {
            data_dir,
            variants,
            epochs,
            batch_size,
            learning_rate,
            validation_fraction,
            freeze_backbone,
            pretrained_backbone,
            image_size,
            output_dir,
            seed,
        } => {
            let config = TrainingConfig::new()
                .with_num_epochs(epochs)
                .with_batch_size(batch_size)
                .with_learning_rate(learning_rate)
                .with_validation_fraction(validation_fraction)
                .with_freeze_backbone(freeze_backbone)
                .with_seed(seed);
            cmd_train(
                &data_dir,
                &variants,
                config,
                pretrained_backbone.as_deref(),
                image_size,
                &output_dir,
            )?;
        }

        Commands::Predict {
            inputs,
            checkpoint,
            image_size,
            per_image,
            json,
        } => {
            cmd_predict(&inputs, checkpoint, image_size, per_image, json)?;
        }

        Commands::Classes => cmd_classes(),
    }

    Ok(())
}

fn cmd_train(
    data_dir: &Path,
    variants: &[String],
    config: TrainingConfig,
    pretrained_backbone: Option<&Path>,
    image_size: usize,
    output_dir: &Path,
) -> Result<()> {
    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Dataset:         {}", data_dir.display());
    println!("  Variants:        {}", variants.join(", "));
    println!("  Backend:         {}", backend_name());
    println!("  Epochs:          {}", config.num_epochs);
    println!("  Batch size:      {}", config.batch_size);
    println!("  Learning rate:   {}", config.learning_rate);
    println!("  Freeze backbone: {}", config.freeze_backbone);
    println!();

    let index = Arc::new(DatasetIndex::build(data_dir, variants)?);
    if index.is_empty() {
        bail!("no images found under {}", data_dir.display());
    }

    for (id, name) in index.class_names().iter().enumerate() {
        if taxonomy::id_of(name) != Some(id) {
            warn!(
                "Class directory '{}' gets id {} but the taxonomy names that id '{}'",
                name,
                id,
                taxonomy::name_of(id)
            );
        }
    }

    println!("{}", "Class Distribution:".cyan().bold());
    for (name, count) in index.class_names().iter().zip(index.class_counts()) {
        let pct = 100.0 * count as f64 / index.len() as f64;
        println!("  {:25} {:>6} ({:>5.1}%)", name, count, pct);
    }
    println!();

    let (train_indices, valid_indices) = if config.validation_fraction > 0.0 {
        index.stratified_split(config.validation_fraction, config.seed)?
    } else {
        let all: Vec<usize> = (0..index.len()).collect();
        (all.clone(), all)
    };

    let transform = TransformConfig::new().with_image_size(image_size);
    let train_loader = SampleLoader::new(
        index.clone(),
        train_indices,
        TransformPipeline::training(transform.clone()),
        config.batch_size,
    )?
    .with_shuffle(config.seed);
    let valid_loader = SampleLoader::new(
        index.clone(),
        valid_indices,
        TransformPipeline::inference(transform),
        config.batch_size,
    )?;

    let device = default_device();
    let model_config = ClassifierConfig::new().with_num_classes(index.num_classes());
    let model = match pretrained_backbone {
        Some(path) => {
            let blob = std::fs::read(path)
                .with_context(|| format!("reading pretrained backbone {}", path.display()))?;
            model_config
                .clone()
                .with_use_pretrained_backbone(true)
                .init_pretrained::<TrainingBackend>(&device, &blob)?
        }
        None => model_config.init::<TrainingBackend>(&device),
    };

    let started = Instant::now();
    let mut trainer = Trainer::<TrainingBackend>::new(config, device);
    let (model, run) = trainer.fit(model, &train_loader, &valid_loader)?;
    info!("Training took {}", format_elapsed(started.elapsed()));

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let checkpoint_path = output_dir.join(CHECKPOINT_FILE);
    std::fs::write(&checkpoint_path, model.valid().to_bytes()?)?;
    model_config.save(output_dir.join(CLASSIFIER_CONFIG_FILE))?;

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let report_path = output_dir.join(format!("training_run_{}.json", timestamp));
    std::fs::write(&report_path, serde_json::to_string_pretty(&run)?)?;

    println!();
    println!("{}", run.evaluation.metrics.display());
    println!(
        "{} checkpoint saved to {}",
        "Done:".green().bold(),
        checkpoint_path.display()
    );
    info!("Run report written to {}", report_path.display());

    Ok(())
}

fn cmd_predict(
    inputs: &[PathBuf],
    checkpoint: Option<PathBuf>,
    image_size: usize,
    per_image: bool,
    json: bool,
) -> Result<()> {
    let uploads = collect_uploads(inputs)?;

    // The classifier layout comes from the config saved next to the checkpoint
    let base = match checkpoint {
        Some(path) => ServiceConfig::for_checkpoint(path)?,
        None => ServiceConfig::default(),
    };
    let config = ServiceConfig {
        transform: TransformConfig::new().with_image_size(image_size),
        batch_policy: if per_image {
            BatchPolicy::PerImage
        } else {
            BatchPolicy::Atomic
        },
        ..base
    };

    let service =
        InferenceService::<InferenceBackend>::new(config).with_device_selector(default_device);
    let results = service.predict_with_policy(&uploads)?;

    if json {
        let rendered: Vec<serde_json::Value> = results
            .iter()
            .zip(&uploads)
            .map(|(result, upload)| match result {
                Ok(prediction) => serde_json::to_value(prediction).unwrap_or_default(),
                Err(e) => serde_json::json!({
                    "source_identifier": upload.identifier,
                    "error": e.to_string(),
                }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rendered)?);
        return Ok(());
    }

    for (result, upload) in results.iter().zip(&uploads) {
        match result {
            Ok(prediction) => println!("{} {}", "✓".green(), prediction.display()),
            Err(e) => println!("{} {}: {}", "✗".red(), upload.identifier, e),
        }
    }

    Ok(())
}

fn collect_uploads(inputs: &[PathBuf]) -> Result<Vec<ImageUpload>> {
    let mut paths = Vec::new();
    for input in inputs {
        if input.is_dir() {
            for entry in WalkDir::new(input).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file() && content_type_for(entry.path()).is_some() {
                    paths.push(entry.into_path());
                }
            }
        } else {
            paths.push(input.clone());
        }
    }

    paths
        .into_iter()
        .map(|path| {
            let bytes =
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let upload = ImageUpload::new(path.display().to_string(), bytes);
            Ok(match content_type_for(&path) {
                Some(content_type) => upload.with_content_type(content_type),
                None => upload,
            })
        })
        .collect()
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    Some(if ext == "png" { "image/png" } else { "image/jpeg" })
}

fn cmd_classes() {
    println!("{}", "Disease Classes:".cyan().bold());
    for class in DiseaseClass::ALL {
        println!(
            "  {:>2}  {:25} {}",
            class.id(),
            class.canonical_name().green(),
            class.localized_name()
        );
    }
}
