//! Command implementations: build collaborators, run training, write the run directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::tensor::backend::AutodiffBackend;
use clap::{Args, ValueEnum};
use serde::Serialize;

use logcosh_vae::data::{Augmentation, ImageFolder, ImageSource, SamplerKind};
use logcosh_vae::eval::PixelFid;
use logcosh_vae::memory::MemoryBudget;
use logcosh_vae::search::BayesianSearch;
use logcosh_vae::tracker::RunTracker;
use logcosh_vae::trainer::{
    train, Collaborators, Hyperparameters, RuntimeConfig, TrainConfig, TrainOutcome, PENALTY_SCORE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Wgpu,
    Ndarray,
}

/// Hyperparameters as exponents: `2^x` for sizes, `10^x` for the rest.
#[derive(Debug, Clone, Args)]
pub struct ExponentArgs {
    #[arg(long = "latent_dim", default_value_t = 8)]
    pub latent_dim: i32,
    #[arg(long = "learning_rate", default_value_t = -3.0)]
    pub learning_rate: f64,
    #[arg(long = "number_filters", default_value_t = 4)]
    pub number_filters: i32,
    #[arg(long = "vae_alpha", default_value_t = -2.0)]
    pub vae_alpha: f64,
    #[arg(long = "vae_beta", default_value_t = -3.0)]
    pub vae_beta: f64,
    #[arg(long = "kl_divergence_weight", default_value_t = -3.0)]
    pub kl_divergence_weight: f64,
}

impl ExponentArgs {
    pub fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::from_exponents(
            self.latent_dim,
            self.learning_rate,
            self.number_filters,
            self.vae_alpha,
            self.vae_beta,
            self.kl_divergence_weight,
        )
    }
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Directory of training images.
    #[arg(long, default_value = "data")]
    pub data: PathBuf,
    /// Root directory for run outputs.
    #[arg(long, default_value = "runs")]
    pub output: PathBuf,
    /// Optimizer steps per attempt.
    #[arg(long)]
    pub num_iters: Option<usize>,
    /// Batch size of the first attempt.
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Fixed memory budget; defaults to the host memory available at start.
    #[arg(long)]
    pub memory_budget_mb: Option<u64>,
    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu)]
    pub backend: BackendKind,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Image decoding threads.
    #[arg(long, default_value_t = 12)]
    pub workers: usize,
    #[arg(long, value_enum, default_value_t = SamplerKind::Shuffled)]
    pub sampler: SamplerKind,
    #[arg(long, default_value_t = 0)]
    pub rank: usize,
    #[arg(long, default_value_t = 1)]
    pub world_size: usize,
    /// Width-expanding encoder stages; input resolution is `4 << stages`.
    #[arg(long)]
    pub stages: Option<usize>,
    /// Generated samples per FID evaluation.
    #[arg(long)]
    pub fid_samples: Option<usize>,
}

impl RunArgs {
    fn train_config(&self) -> TrainConfig {
        let mut config = TrainConfig::new()
            .with_workers(self.workers)
            .with_sampler(self.sampler);
        if let Some(n) = self.num_iters {
            config = config.with_num_iters(n);
        }
        if let Some(b) = self.batch_size {
            config = config.with_initial_batch_size(b);
        }
        if let Some(s) = self.stages {
            config = config.with_num_stages(s);
        }
        if let Some(n) = self.fid_samples {
            config = config.with_fid_samples(n);
        }
        config
    }

    fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            rank: self.rank,
            world_size: self.world_size,
            seed: self.seed,
        }
    }

    fn allocator(&self) -> MemoryBudget {
        match self.memory_budget_mb {
            Some(mb) => MemoryBudget::fixed(mb.saturating_mul(1024 * 1024)),
            None => MemoryBudget::host(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct SearchArgs {
    /// Latin hypercube points evaluated before the first model-guided step.
    #[arg(long, default_value_t = 5)]
    pub initial_points: usize,
    /// Expected-improvement iterations after the initial design.
    #[arg(long, default_value_t = 20)]
    pub iterations: usize,
    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Serialize)]
struct RunManifest<'a> {
    hyperparameters: &'a Hyperparameters,
    exponents: Vec<f64>,
    train: &'a TrainConfig,
    backend: String,
    rank: usize,
    world_size: usize,
    seed: Option<u64>,
}

#[derive(Serialize)]
struct RunSummary {
    outcome: &'static str,
    score: Option<f64>,
    batch_size: Option<usize>,
    attempts: Option<usize>,
    step: Option<usize>,
}

impl RunSummary {
    fn of(outcome: &TrainOutcome) -> Self {
        let (name, batch_size, attempts, step) = match outcome {
            TrainOutcome::Completed { batch_size, attempts, .. } => ("completed", Some(*batch_size), Some(*attempts), None),
            TrainOutcome::Diverged { step, batch_size } => ("diverged", Some(*batch_size), None, Some(*step)),
            TrainOutcome::OutOfMemory { batch_size, attempts, .. } => {
                ("out_of_memory", Some(*batch_size), Some(*attempts), None)
            }
            TrainOutcome::Failed { step, .. } => ("failed", None, None, *step),
        };
        Self {
            outcome: name,
            score: outcome.score(),
            batch_size,
            attempts,
            step,
        }
    }
}

/// First `{prefix}_NNN` under `root` that does not exist yet.
fn next_run_dir(root: &Path, prefix: &str) -> PathBuf {
    (0..)
        .map(|n| root.join(format!("{prefix}_{n:03}")))
        .find(|dir| !dir.exists())
        .unwrap_or_else(|| root.join(prefix))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

fn train_in_dir<B: AutodiffBackend>(
    hp: &Hyperparameters,
    args: &RunArgs,
    run_dir: &Path,
    device: &B::Device,
) -> anyhow::Result<TrainOutcome> {
    let config = args.train_config();
    let runtime = args.runtime();
    let resolution = hp.vae_config(config.num_stages).resolution();

    let images: Arc<dyn ImageSource> =
        Arc::new(ImageFolder::directory(&args.data, resolution)?.with_augmentation(Augmentation::new()));
    let real: Arc<dyn ImageSource> = Arc::new(ImageFolder::directory(&args.data, resolution)?);

    let mut tracker = RunTracker::create(run_dir)?;
    write_json(
        &run_dir.join("config.json"),
        &RunManifest {
            hyperparameters: hp,
            exponents: hp.to_array(),
            train: &config,
            backend: format!("{:?}", args.backend).to_lowercase(),
            rank: runtime.rank,
            world_size: runtime.world_size,
            seed: runtime.seed,
        },
    )?;
    tracing::info!(run_dir = %run_dir.display(), resolution, "Run directory ready");

    let mut evaluator = PixelFid::new(real, config.workers);
    let mut allocator = args.allocator();
    let outcome = train::<B>(
        hp,
        &config,
        &runtime,
        Collaborators {
            images,
            tracker: &mut tracker,
            evaluator: &mut evaluator,
            allocator: &mut allocator,
        },
        device,
    );

    write_json(&run_dir.join("summary.json"), &RunSummary::of(&outcome))?;
    Ok(outcome)
}

fn train_once<B: AutodiffBackend>(hp: &Hyperparameters, args: &RunArgs, device: B::Device) -> anyhow::Result<()> {
    let run_dir = next_run_dir(&args.output, "run");
    match train_in_dir::<B>(hp, args, &run_dir, &device)? {
        TrainOutcome::Failed { error, step } => {
            Err(error.context(format!("training failed at step {step:?}")))
        }
        outcome => {
            println!("Score: {:.4}", outcome.fitness());
            Ok(())
        }
    }
}

pub fn run_train(hp: ExponentArgs, args: RunArgs) -> anyhow::Result<()> {
    let hp = hp.hyperparameters();
    match args.backend {
        BackendKind::Wgpu => train_once::<Autodiff<Wgpu>>(&hp, &args, WgpuDevice::default()),
        BackendKind::Ndarray => train_once::<Autodiff<NdArray>>(&hp, &args, NdArrayDevice::Cpu),
    }
}

fn search_with<B: AutodiffBackend>(args: &SearchArgs, device: B::Device) -> anyhow::Result<()> {
    let search_root = args.run.output.join("search");
    let objective = {
        let run = args.run.clone();
        let root = search_root.clone();
        move |hp: &Hyperparameters| {
            let run_dir = next_run_dir(&root, "eval");
            match train_in_dir::<B>(hp, &run, &run_dir, &device) {
                Ok(outcome) => outcome.fitness(),
                Err(e) => {
                    tracing::warn!(error = %e, run_dir = %run_dir.display(), "Evaluation failed, scoring as penalty");
                    PENALTY_SCORE
                }
            }
        }
    };

    let result = BayesianSearch::new(args.iterations, args.initial_points).optimize(objective)?;
    std::fs::create_dir_all(&search_root)
        .with_context(|| format!("failed to create {}", search_root.display()))?;
    write_json(
        &search_root.join("best.json"),
        &serde_json::json!({
            "hyperparameters": result.best,
            "exponents": result.exponents,
            "score": result.score,
        }),
    )?;

    println!("Best exponents: {:?}", result.exponents);
    println!("Best hyperparameters: {:?}", result.best);
    println!("Score: {:.4}", result.score);
    Ok(())
}

pub fn run_search(args: SearchArgs) -> anyhow::Result<()> {
    match args.run.backend {
        BackendKind::Wgpu => search_with::<Autodiff<Wgpu>>(&args, WgpuDevice::default()),
        BackendKind::Ndarray => search_with::<Autodiff<NdArray>>(&args, NdArrayDevice::Cpu),
    }
}
