//! srnet CLI
//!
//! Prepare patch stores, train super-resolution networks, and score them
//! with PSNR on whole images.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::module::AutodiffModule;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use srnet::backend::{backend_name, default_device, InferenceBackend, TrainingBackend};
use srnet::config::ExperimentConfig;
use srnet::dataset::SrDataset;
use srnet::model::{Edsr, ResNetSr, SrArchitecture, SrModel, SrNetwork, Srcnn};
use srnet::training::SrLoss;
use srnet::utils::format_duration;
use srnet::utils::logging::{init_logging, LogConfig};

/// Super-resolution CNNs with Burn
#[derive(Parser, Debug)]
#[command(name = "srnet")]
#[command(version)]
#[command(about = "Train and evaluate SRCNN, ResNetSR and EDSR super-resolution networks", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command
#[derive(Args, Debug, Clone)]
struct ExperimentArgs {
    /// TOML experiment file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network architecture: srcnn, resnetsr or edsr
    #[arg(short, long)]
    arch: Option<SrArchitecture>,

    /// Upscale factor (2, 3 or 4)
    #[arg(short, long)]
    scale: Option<usize>,

    /// Directory holding weight files
    #[arg(long)]
    weight_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Slice image directories into patch stores
    Prepare {
        #[command(flatten)]
        experiment: ExperimentArgs,

        /// Image directories; defaults to every directory in [paths]
        #[arg(short, long)]
        data_dir: Vec<PathBuf>,

        /// Side of an LR patch
        #[arg(long)]
        lr_size: Option<usize>,

        /// Distance between patches in HR pixels
        #[arg(long)]
        stride: Option<usize>,
    },

    /// Train a network on prepared patch stores
    Train {
        #[command(flatten)]
        experiment: ExperimentArgs,

        /// Training image directory
        #[arg(long)]
        train_dir: Option<PathBuf>,

        /// Validation image directory
        #[arg(long)]
        val_dir: Option<PathBuf>,

        /// Number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Batch size for training
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Pixel loss: mse or mae
        #[arg(long)]
        loss: Option<SrLoss>,

        /// Do not write the event log
        #[arg(long, default_value = "false")]
        no_history: bool,

        /// Start from the saved weights instead of a fresh network
        #[arg(long, default_value = "false")]
        resume: bool,
    },

    /// Super-resolve one image and save the result
    Generate {
        #[command(flatten)]
        experiment: ExperimentArgs,

        /// Directory containing the image
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Image path relative to the directory
        #[arg(short, long)]
        image: String,

        /// Output directory for the SR image
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Only report PSNR, do not write the SR image
        #[arg(long, default_value = "false")]
        no_save: bool,
    },

    /// Average PSNR over every image of a directory
    Evaluate {
        #[command(flatten)]
        experiment: ExperimentArgs,

        /// Test image directory
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Write the per-image report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the model overview and parameter count
    Summary {
        #[command(flatten)]
        experiment: ExperimentArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };

    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Prepare {
            experiment,
            data_dir,
            lr_size,
            stride,
        } => {
            let mut exp = resolve_experiment(&experiment)?;
            if let Some(lr_size) = lr_size {
                exp.dataset.lr_size = lr_size;
            }
            if let Some(stride) = stride {
                exp.dataset.stride = stride;
            }
            exp.validate()?;
            cmd_prepare(&exp, data_dir)?;
        }

        Commands::Train {
            experiment,
            train_dir,
            val_dir,
            epochs,
            batch_size,
            learning_rate,
            loss,
            no_history,
            resume,
        } => {
            let mut exp = resolve_experiment(&experiment)?;
            if train_dir.is_some() {
                exp.paths.train_dir = train_dir;
            }
            if val_dir.is_some() {
                exp.paths.val_dir = val_dir;
            }
            if let Some(epochs) = epochs {
                exp.training.nb_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                exp.training.batch_size = batch_size;
            }
            if let Some(learning_rate) = learning_rate {
                exp.training.learning_rate = learning_rate;
            }
            if let Some(loss) = loss {
                exp.training.loss = loss;
            }
            if no_history {
                exp.training.save_history = false;
            }
            exp.validate()?;

            let scale = exp.dataset.scale;
            match exp.model.architecture {
                SrArchitecture::Srcnn => {
                    cmd_train::<Srcnn<TrainingBackend>>(&exp, exp.model.srcnn_config(), resume)?
                }
                SrArchitecture::ResNetSr => cmd_train::<ResNetSr<TrainingBackend>>(
                    &exp,
                    exp.model.resnet_config(scale),
                    resume,
                )?,
                SrArchitecture::Edsr => {
                    cmd_train::<Edsr<TrainingBackend>>(&exp, exp.model.edsr_config(scale), resume)?
                }
            }
        }

        Commands::Generate {
            experiment,
            data_dir,
            image,
            output_dir,
            no_save,
        } => {
            let mut exp = resolve_experiment(&experiment)?;
            if data_dir.is_some() {
                exp.paths.test_dir = data_dir;
            }
            if let Some(output_dir) = output_dir {
                exp.model.output_dir = output_dir;
            }

            let scale = exp.dataset.scale;
            match exp.model.architecture {
                SrArchitecture::Srcnn => cmd_generate::<Srcnn<InferenceBackend>>(
                    &exp,
                    exp.model.srcnn_config(),
                    &image,
                    !no_save,
                )?,
                SrArchitecture::ResNetSr => cmd_generate::<ResNetSr<InferenceBackend>>(
                    &exp,
                    exp.model.resnet_config(scale),
                    &image,
                    !no_save,
                )?,
                SrArchitecture::Edsr => cmd_generate::<Edsr<InferenceBackend>>(
                    &exp,
                    exp.model.edsr_config(scale),
                    &image,
                    !no_save,
                )?,
            }
        }

        Commands::Evaluate {
            experiment,
            data_dir,
            output,
        } => {
            let mut exp = resolve_experiment(&experiment)?;
            if data_dir.is_some() {
                exp.paths.test_dir = data_dir;
            }

            let scale = exp.dataset.scale;
            let output = output.as_deref();
            match exp.model.architecture {
                SrArchitecture::Srcnn => cmd_evaluate::<Srcnn<InferenceBackend>>(
                    &exp,
                    exp.model.srcnn_config(),
                    output,
                    cli.verbose,
                )?,
                SrArchitecture::ResNetSr => cmd_evaluate::<ResNetSr<InferenceBackend>>(
                    &exp,
                    exp.model.resnet_config(scale),
                    output,
                    cli.verbose,
                )?,
                SrArchitecture::Edsr => cmd_evaluate::<Edsr<InferenceBackend>>(
                    &exp,
                    exp.model.edsr_config(scale),
                    output,
                    cli.verbose,
                )?,
            }
        }

        Commands::Summary { experiment } => {
            let exp = resolve_experiment(&experiment)?;
            let scale = exp.dataset.scale;
            match exp.model.architecture {
                SrArchitecture::Srcnn => {
                    cmd_summary::<Srcnn<InferenceBackend>>(&exp, exp.model.srcnn_config())?
                }
                SrArchitecture::ResNetSr => {
                    cmd_summary::<ResNetSr<InferenceBackend>>(&exp, exp.model.resnet_config(scale))?
                }
                SrArchitecture::Edsr => {
                    cmd_summary::<Edsr<InferenceBackend>>(&exp, exp.model.edsr_config(scale))?
                }
            }
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        format!("srnet {} | super-resolution with Burn | {}", srnet::VERSION, backend_name())
            .green()
            .bold()
    );
    println!();
}

/// Experiment from `--config` (or defaults) with command-line overrides
fn resolve_experiment(args: &ExperimentArgs) -> Result<ExperimentConfig> {
    let mut exp = match &args.config {
        Some(path) => {
            let exp = ExperimentConfig::load(path)
                .with_context(|| format!("Failed to load experiment {}", path.display()))?;
            info!("Loaded experiment from {}", path.display());
            exp
        }
        None => ExperimentConfig::for_architecture(args.arch.unwrap_or(SrArchitecture::Edsr)),
    };

    if let Some(arch) = args.arch {
        exp.model.architecture = arch;
        exp.dataset.interpolate_input = arch == SrArchitecture::Srcnn;
    }
    if let Some(scale) = args.scale {
        exp.dataset.scale = scale;
    }
    if let Some(weight_dir) = &args.weight_dir {
        exp.model.weight_dir = weight_dir.clone();
    }

    exp.validate()?;
    Ok(exp)
}

fn build_model<B, N>(exp: &ExperimentConfig, config: N::Config, device: &B::Device) -> Result<SrModel<B, N>>
where
    B: burn::tensor::backend::Backend,
    N: SrNetwork<B>,
{
    let model = SrModel::new(&exp.model_type(), exp.input_size(), exp.channels(), config, device)?
        .with_weight_dir(&exp.model.weight_dir)
        .with_output_dir(&exp.model.output_dir);
    Ok(model)
}

fn cmd_prepare(exp: &ExperimentConfig, data_dirs: Vec<PathBuf>) -> Result<()> {
    let dirs: Vec<PathBuf> = if data_dirs.is_empty() {
        [&exp.paths.train_dir, &exp.paths.val_dir, &exp.paths.test_dir]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    } else {
        data_dirs
    };

    if dirs.is_empty() {
        anyhow::bail!("No image directories given; pass --data-dir or set [paths] in the config");
    }

    println!("{}", "Preparing Patch Stores...".cyan().bold());
    println!(
        "  LR patch {} | HR patch {} | stride {} | scale x{} | inputs {}",
        exp.dataset.lr_size,
        exp.dataset.hr_size(),
        exp.dataset.stride,
        exp.dataset.scale,
        if exp.dataset.interpolate_input { "interpolated" } else { "LR" }
    );

    for dir in dirs {
        let dataset = SrDataset::new(&dir, exp.dataset.clone())?;
        let manifest = dataset
            .save()
            .with_context(|| format!("Failed to prepare {}", dir.display()))?;
        println!(
            "  {} {} patches from {} images -> {}",
            "✓".green(),
            manifest.num_data,
            manifest.num_images,
            dataset.store_dir().display()
        );
    }

    Ok(())
}

fn cmd_train<N>(exp: &ExperimentConfig, config: N::Config, resume: bool) -> Result<()>
where
    N: SrNetwork<TrainingBackend> + AutodiffModule<TrainingBackend>,
    N::InnerModule: SrNetwork<InferenceBackend>,
{
    let train_dir = ExperimentConfig::require_dir(&exp.paths.train_dir, "train_dir")?;
    let val_dir = ExperimentConfig::require_dir(&exp.paths.val_dir, "val_dir")?;
    let train_dst = SrDataset::new(&train_dir, exp.dataset.clone())?;
    let val_dst = SrDataset::new(&val_dir, exp.dataset.clone())?;

    let device = default_device();
    let mut model = build_model::<TrainingBackend, N>(exp, config, &device)?;
    if resume {
        model.load_weights()?;
    }

    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Model:          {}", model.name());
    println!("  Parameters:     {}", srnet::utils::format_number(model.num_params()));
    println!("  Train images:   {}", train_dir.display());
    println!("  Val images:     {}", val_dir.display());
    println!("  Epochs:         {}", exp.training.nb_epochs);
    println!("  Batch size:     {}", exp.training.batch_size);
    println!("  Learning rate:  {}", exp.training.learning_rate);
    println!("  Loss:           {}", exp.training.loss);
    println!("  Device:         {:?}", device);
    println!();

    let start = std::time::Instant::now();
    let (_, history) = model
        .fit(&train_dst, &val_dst, &exp.training)
        .with_context(|| {
            format!(
                "Training {} failed (have the datasets been prepared with `srnet prepare`?)",
                model.name()
            )
        })?;

    let history_path = exp.training.log_dir.join(model.name()).join("history.json");
    if exp.training.save_history {
        std::fs::write(&history_path, serde_json::to_string_pretty(&history)?)?;
    }

    println!();
    println!("{}", "Training Complete!".green().bold());
    println!("  Time:           {}", format_duration(start.elapsed().as_secs_f64()));
    if let (Some(epoch), Some(loss)) = (history.best_epoch, history.best_val_loss) {
        println!("  Best val_loss:  {:.6} (epoch {})", loss, epoch);
        println!("  Weights:        {}", model.weight_file().display());
    } else {
        println!("  {} No finite validation loss, no weights saved", "Warning:".yellow());
    }
    if let Some(last) = history.last() {
        println!("  Final val PSNR: {:.2} dB", last.val_psnr);
    }
    if exp.training.save_history {
        println!("  History:        {}", history_path.display());
        println!(
            "  TensorBoard:    tensorboard --logdir {}",
            exp.training.log_dir.display()
        );
    }

    Ok(())
}

fn load_trained<N>(exp: &ExperimentConfig, config: N::Config) -> Result<SrModel<InferenceBackend, N>>
where
    N: SrNetwork<InferenceBackend>,
{
    let mut model = build_model::<InferenceBackend, N>(exp, config, &default_device())?;
    model
        .create_model(true)
        .with_context(|| format!("No trained weights for {}; run `srnet train` first", model.name()))?;
    Ok(model)
}

fn cmd_generate<N>(exp: &ExperimentConfig, config: N::Config, image: &str, save: bool) -> Result<()>
where
    N: SrNetwork<InferenceBackend>,
{
    let data_dir = ExperimentConfig::require_dir(&exp.paths.test_dir, "test_dir")?;
    let test_dst = SrDataset::new(&data_dir, exp.dataset.clone())?;
    let model = load_trained::<N>(exp, config)?;

    let output = model.gen_sr_img(&test_dst, image, save, true)?;

    println!("{}", "Super-Resolution Result:".cyan().bold());
    println!("  Image:  {}", image);
    println!("  LR:     {}x{}", output.lr.width, output.lr.height);
    println!("  SR:     {}x{}", output.sr.width, output.sr.height);
    println!("  PSNR:   {}", format!("{:.4} dB", output.psnr).green());
    if save {
        println!(
            "  Saved:  {}",
            srnet::inference::sr_image_path(model.output_dir(), image).display()
        );
    }

    Ok(())
}

fn cmd_evaluate<N>(
    exp: &ExperimentConfig,
    config: N::Config,
    output: Option<&Path>,
    verbose: bool,
) -> Result<()>
where
    N: SrNetwork<InferenceBackend>,
{
    let data_dir = ExperimentConfig::require_dir(&exp.paths.test_dir, "test_dir")?;
    let test_dst = SrDataset::new(&data_dir, exp.dataset.clone())?;
    let model = load_trained::<N>(exp, config)?;

    println!("{}", format!("Evaluating {} on {}", model.name(), data_dir.display()).cyan().bold());
    let report = model.evaluate(&test_dst, verbose)?;

    for score in &report.images {
        println!("  {:<40} {:>8.4} dB", score.image_name, score.psnr);
    }
    for name in &report.skipped {
        println!("  {:<40} {:>11}", name, "skipped".yellow());
    }
    println!();
    println!(
        "  {} {}",
        "Average PSNR:".bold(),
        format!("{:.4} dB", report.mean_psnr).green().bold()
    );
    println!("  Time: {}", format_duration(report.elapsed_secs));

    if let Some(path) = output {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        println!("  Report saved to {}", path.display());
    }

    Ok(())
}

fn cmd_summary<N>(exp: &ExperimentConfig, config: N::Config) -> Result<()>
where
    N: SrNetwork<InferenceBackend>,
{
    let model = build_model::<InferenceBackend, N>(exp, config, &default_device())?;
    println!("{}", model.summary());
    Ok(())
}
