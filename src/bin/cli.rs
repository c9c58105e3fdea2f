//! CLI application for training SDM landmark cascades.
//!
//! Usage:
//!   percent-sdm <train-dir>                          # Human-readable summary
//!   percent-sdm <train-dir> --eval <test-dir>        # Also report fitting error
//!   percent-sdm <train-dir> --json -o report.json    # JSON report to a file

use clap::Parser;
use percent_sdm::{
    io, BatchReport, CascadeTrainer, TrainOptions, TrainReport, TrainerConfig,
    TrainerWarning,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "percent-sdm")]
#[command(author, version, about = "Train multi-scale SDM landmark cascades", long_about = None)]
struct Args {
    /// Directory of training images with sibling .pts files
    #[arg(required = true)]
    train: PathBuf,

    /// Directory of held-out images to fit after training
    #[arg(long)]
    eval: Option<PathBuf>,

    /// Pyramid scales, coarsest first
    #[arg(long, value_delimiter = ',', default_value = "0.5,1.0")]
    scales: Vec<f32>,

    /// Initial shapes per training image
    #[arg(long, default_value = "10")]
    n_perturbations: usize,

    /// Images per incremental batch (default: one batch)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Ridge regularization; 0 for plain Newton updates
    #[arg(long, default_value = "1.0")]
    alpha: f64,

    /// Reference shape bounding-box diagonal
    #[arg(long)]
    diagonal: Option<f32>,

    /// Square patch side length
    #[arg(long, default_value = "17")]
    patch_size: usize,

    /// Cascade iterations per scale
    #[arg(long, default_value = "6")]
    iterations: usize,

    /// Output as JSON
    #[arg(short, long)]
    json: bool,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Show training progress
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct Output {
    train_dir: String,
    n_training_images: usize,
    summary: String,
    training: TrainReport,
    evaluation: Option<EvaluationOutput>,
}

#[derive(Serialize)]
struct EvaluationOutput {
    eval_dir: String,
    n_images: usize,
    mean_initial_error: f32,
    mean_final_error: f32,
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = TrainerConfig::builder()
        .scales(args.scales.clone())
        .patch_shape(args.patch_size, args.patch_size)
        .n_iterations(args.iterations)
        .n_perturbations(args.n_perturbations)
        .verbose(args.verbose);
    if let Some(diagonal) = args.diagonal {
        builder = builder.diagonal(diagonal);
    }
    let config = builder.build()?;

    let mut trainer = if args.alpha == 0.0 {
        CascadeTrainer::sdm(config)?
    } else {
        CascadeTrainer::regularized_sdm(config, args.alpha)?
    };

    let mut options = TrainOptions::default().with_group(io::PTS_GROUP);
    if let Some(batch_size) = args.batch_size {
        options = options.with_batch_size(batch_size);
    }

    // Images are decoded as the trainer pulls each batch. The first load
    // failure ends the source and is reported in place of the training result.
    info!(dir = %args.train.display(), "streaming training images");
    let mut load_error = None;
    let images = io::iter_images(&args.train)?.map_while(|loaded| match loaded {
        Ok(image) => Some(image),
        Err(e) => {
            load_error = Some(e);
            None
        }
    });
    let training = trainer.train(images, &options);
    if let Some(e) = load_error {
        return Err(e.into());
    }
    let training = training?;
    let n_training_images = training.n_images();

    let evaluation = match &args.eval {
        Some(dir) => Some(evaluate(&trainer, dir)?),
        None => None,
    };

    let output = Output {
        train_dir: args.train.display().to_string(),
        n_training_images,
        summary: trainer.to_string(),
        training,
        evaluation,
    };

    let output_str = if args.json {
        serde_json::to_string_pretty(&output)?
    } else {
        format_human_readable(&output)
    };

    if let Some(ref path) = args.output {
        std::fs::write(path, &output_str)?;
        info!(path = %path.display(), "output written");
    } else {
        println!("{}", output_str);
    }

    Ok(())
}

fn evaluate(
    trainer: &CascadeTrainer,
    dir: &Path,
) -> Result<EvaluationOutput, Box<dyn std::error::Error>> {
    info!(dir = %dir.display(), "fitting evaluation images");
    let mut n_images = 0;
    let mut initial = 0.0;
    let mut fitted = 0.0;
    for image in io::iter_images(dir)? {
        let image = image?;
        let gt = image.landmarks.require(io::PTS_GROUP)?;
        let result = trainer.fit_from_shape(&image, gt)?;
        initial += result.initial_error(gt);
        fitted += result.final_error(gt);
        n_images += 1;
    }
    let n = n_images.max(1) as f32;

    Ok(EvaluationOutput {
        eval_dir: dir.display().to_string(),
        n_images,
        mean_initial_error: initial / n,
        mean_final_error: fitted / n,
    })
}

fn format_human_readable(output: &Output) -> String {
    let mut s = String::new();

    s.push_str(&format!(
        "Training set: {} ({} images)\n",
        output.train_dir, output.n_training_images
    ));
    s.push_str(&format!("\n{}\n", output.summary));

    s.push_str("\nBatches:\n");
    for batch in &output.training.batches {
        s.push_str(&format_batch(batch));
    }

    if !output.training.warnings.is_empty() {
        s.push_str("\nWarnings:\n");
        for warning in &output.training.warnings {
            let text = match warning {
                TrainerWarning::ReferenceFromFirstBatch => {
                    "reference shape estimated from the first batch".to_string()
                }
                TrainerWarning::PerturbationCountReset { configured, found } => {
                    format!("n_perturbations reset from {configured} to {found}")
                }
            };
            s.push_str(&format!("  - {}\n", text));
        }
    }

    if let Some(eval) = &output.evaluation {
        s.push_str(&format!(
            "\nEvaluation: {} ({} images)\n",
            eval.eval_dir, eval.n_images
        ));
        s.push_str(&format!("  Initial error: {:.3}\n", eval.mean_initial_error));
        s.push_str(&format!("  Final error:   {:.3}\n", eval.mean_final_error));
    }

    s
}

fn format_batch(batch: &BatchReport) -> String {
    format!(
        "  {:>3}: {:>4} images, {:?}, {} estimates/image, error {:.3}\n",
        batch.index,
        batch.n_images,
        batch.mode,
        batch.perturbations.count(),
        batch.mean_error
    )
}
