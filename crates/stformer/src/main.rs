//! stformer - spatio-temporal trajectory forecaster CLI
//!
//! Usage:
//!   stformer check <config>                          Validate a config and report model size
//!   stformer train <config> --steps N --checkpoint P Train on synthetic scenes
//!   stformer eval <config> --checkpoint P            Report ADE/FDE on a synthetic scene

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use stformer_core::params::count_parameters;
use stformer_core::{
    average_displacement_error, build_model, final_displacement_error, load_config, Config,
    ModelConfig, SyntheticScenes, TrainConfig, Trainer,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "stformer", version, about = "Spatio-temporal trajectory forecasting")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Synthetic scene settings shared by train and eval
#[derive(Args, Clone)]
struct SceneArgs {
    /// Observed timesteps per scene
    #[arg(long, default_value = "8")]
    past_len: usize,

    /// Largest per-axis speed of a synthetic agent
    #[arg(long, default_value = "1.0")]
    max_speed: f32,

    /// Seed for the scene generator
    #[arg(long, default_value = "0")]
    scene_seed: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config file and print the model size
    Check {
        /// TOML config with [model] and optional [training] tables
        config: PathBuf,
    },
    /// Train on synthetic constant-velocity scenes
    Train {
        config: PathBuf,

        /// Number of optimizer steps
        #[arg(long, default_value = "1000")]
        steps: u64,

        /// Where to write the checkpoint
        #[arg(long)]
        checkpoint: PathBuf,

        /// Continue from the checkpoint if it exists
        #[arg(long)]
        resume: bool,

        #[command(flatten)]
        scene: SceneArgs,
    },
    /// Evaluate a checkpoint on synthetic scenes
    Eval {
        config: PathBuf,

        #[arg(long)]
        checkpoint: PathBuf,

        /// Number of synthetic batches to average over
        #[arg(long, default_value = "10")]
        batches: usize,

        #[command(flatten)]
        scene: SceneArgs,
    },
}

fn select_device() -> Result<Device> {
    if cfg!(feature = "cuda") {
        Device::new_cuda(0).context("Failed to open CUDA device 0")
    } else if cfg!(feature = "metal") {
        Device::new_metal(0).context("Failed to open Metal device 0")
    } else {
        Ok(Device::Cpu)
    }
}

fn load(path: &Path) -> Result<(ModelConfig, TrainConfig)> {
    let config: Config = load_config(path)
        .with_context(|| format!("Failed to load config: {}", path.display()))?;
    let model = config
        .model_config()
        .with_context(|| format!("Invalid [model] table in {}", path.display()))?;
    let train = config
        .train_config()
        .with_context(|| format!("Invalid [training] table in {}", path.display()))?;
    Ok((model, train))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match cli.command {
        Commands::Check { config } => cmd_check(&config),
        Commands::Train {
            config,
            steps,
            checkpoint,
            resume,
            scene,
        } => cmd_train(&config, steps, &checkpoint, resume, &scene),
        Commands::Eval {
            config,
            checkpoint,
            batches,
            scene,
        } => cmd_eval(&config, &checkpoint, batches, &scene),
    }
}

fn cmd_check(path: &Path) -> Result<()> {
    let (model, train) = load(path)?;
    let (_, varmap) = build_model(&model, &Device::Cpu).context("Failed to build model")?;
    let parameters = count_parameters(&varmap)?;

    println!("{}", "Config OK".green().bold());
    println!(
        "  Scene: {} features, {} neighbors, horizon {}",
        model.features_size.to_string().cyan(),
        model.neigh_size.to_string().cyan(),
        model.seq_size.to_string().cyan()
    );
    println!(
        "  Spatial: d_k {} with {} heads x {} layers",
        model.sp_dk, model.sp_enc_heads, model.sp_num_encoders
    );
    println!("  Temporal: {:?}, hidden {}", model.temporal_encoder, model.rnn_hidden);
    println!("  Schedule: {:?}", train.schedule);
    println!("  Parameters: {}", parameters.to_string().cyan().bold());
    Ok(())
}

fn cmd_train(path: &Path, steps: u64, checkpoint: &Path, resume: bool, args: &SceneArgs) -> Result<()> {
    let (model, train) = load(path)?;
    let device = select_device()?;
    let mut trainer = Trainer::new(&model, &train, &device).context("Failed to build trainer")?;
    if resume && checkpoint.exists() {
        trainer
            .restore(checkpoint)
            .with_context(|| format!("Failed to restore {}", checkpoint.display()))?;
        println!(
            "Resumed from {} at step {}",
            checkpoint.display(),
            trainer.step().to_string().cyan()
        );
    }

    let mut scenes = SyntheticScenes::new(&model, args.past_len, args.max_speed, args.scene_seed, &device)?;

    let pb = ProgressBar::new(steps);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )?
        .progress_chars("#>-"),
    );

    let mut last_loss = f32::NAN;
    for _ in 0..steps {
        let batch = scenes.next_batch()?;
        last_loss = trainer.train_step(&batch)?;
        pb.set_message(format!("loss {last_loss:.5} lr {:.2e}", trainer.learning_rate()));
        pb.inc(1);
    }
    pb.finish_and_clear();

    trainer
        .save(checkpoint)
        .with_context(|| format!("Failed to save {}", checkpoint.display()))?;

    println!("{}", "Training complete!".green().bold());
    println!("  Steps: {}", trainer.step().to_string().cyan());
    println!("  Final loss: {}", format!("{last_loss:.5}").cyan());
    println!("  Checkpoint: {}", checkpoint.display());
    Ok(())
}

/// `[b, h, n, d]` → `[b·n, h, d]`
fn as_tracks(t: &Tensor) -> Result<Tensor> {
    let (b, h, n, d) = t.dims4()?;
    Ok(t.permute((0, 2, 1, 3))?.reshape((b * n, h, d))?)
}

fn cmd_eval(path: &Path, checkpoint: &Path, batches: usize, args: &SceneArgs) -> Result<()> {
    let (model, train) = load(path)?;
    let device = select_device()?;
    let mut trainer = Trainer::new(&model, &train, &device).context("Failed to build trainer")?;
    trainer
        .restore(checkpoint)
        .with_context(|| format!("Failed to restore {}", checkpoint.display()))?;

    let mut scenes = SyntheticScenes::new(&model, args.past_len, args.max_speed, args.scene_seed, &device)?;
    let (mut ade, mut fde) = (0f32, 0f32);
    for _ in 0..batches.max(1) {
        let batch = scenes.next_batch()?;
        let (real, pred) = trainer.eval_positions(&batch)?;
        ade += average_displacement_error(&as_tracks(&real)?, &as_tracks(&pred)?)?;
        fde += final_displacement_error(&as_tracks(&real)?, &as_tracks(&pred)?)?;
    }
    let n = batches.max(1) as f32;

    println!("{}", "Evaluation".cyan().bold());
    println!("  Checkpoint step: {}", trainer.step());
    println!("  ADE: {}", format!("{:.4}", ade / n).green());
    println!("  FDE: {}", format!("{:.4}", fde / n).green());
    Ok(())
}
