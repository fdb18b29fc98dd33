//! VAE training loop with batch-size back-off on memory exhaustion.
//!
//! One call to [`train`] runs up to `log2(initial_batch_size) + 1` attempts.
//! An attempt builds the loader, model and Adam optimizer for the current batch
//! size and runs the fixed-length step loop. Running out of memory early in an
//! attempt tears it down, halves the batch size and starts over; every other
//! failure ends the run. The result is a single [`TrainOutcome`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::{BatchLoader, DatasetError, ImageSource, SamplerKind, Shard};
use crate::eval::{score_probe, visual_probe, FidEvaluator, ProbeSamples, ScoreSample, ScoreSettings};
use crate::memory::{AllocationRequest, Footprint, OutOfResourceError, Phase, ResourceAllocator};
use crate::model::VaeConfig;
use crate::tracker::{make_grid, Tracker};

/// Score reported for diverged runs and configurations that never fit in memory.
pub const PENALTY_SCORE: f64 = 27_000.0;

/// The hyperparameter vector searched over by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub latent_dim: usize,
    pub learning_rate: f64,
    pub number_filters: usize,
    pub vae_alpha: f64,
    pub vae_beta: f64,
    pub kl_divergence_weight: f64,
}

impl Hyperparameters {
    /// Decode an exponent vector: `2^x` for `latent_dim` and `number_filters`,
    /// `10^x` for the rest.
    pub fn from_exponents(
        latent_dim: i32,
        learning_rate: f64,
        number_filters: i32,
        vae_alpha: f64,
        vae_beta: f64,
        kl_divergence_weight: f64,
    ) -> Self {
        Self {
            latent_dim: 2f64.powi(latent_dim).round() as usize,
            learning_rate: 10f64.powf(learning_rate),
            number_filters: 2f64.powi(number_filters).round() as usize,
            vae_alpha: 10f64.powf(vae_alpha),
            vae_beta: 10f64.powf(vae_beta),
            kl_divergence_weight: 10f64.powf(kl_divergence_weight),
        }
    }

    /// Exponent vector in `[latent_dim, learning_rate, number_filters, vae_alpha,
    /// vae_beta, kl_divergence_weight]` order. Integer exponents are rounded.
    pub fn array(srr: &[f64]) -> Self {
        Self::from_exponents(
            srr[0].round() as i32,
            srr[1],
            srr[2].round() as i32,
            srr[3],
            srr[4],
            srr[5],
        )
    }

    pub fn to_array(&self) -> Vec<f64> {
        vec![
            (self.latent_dim as f64).log2(),
            self.learning_rate.log10(),
            (self.number_filters as f64).log2(),
            self.vae_alpha.log10(),
            self.vae_beta.log10(),
            self.kl_divergence_weight.log10(),
        ]
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.latent_dim > 0, "latent_dim must be positive");
        anyhow::ensure!(self.number_filters > 0, "number_filters must be positive");
        anyhow::ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learning_rate must be positive, got {}",
            self.learning_rate
        );
        anyhow::ensure!(
            self.vae_alpha.is_finite() && self.vae_alpha > 0.0,
            "vae_alpha must be positive, got {}",
            self.vae_alpha
        );
        anyhow::ensure!(self.vae_beta >= 0.0, "vae_beta must be non-negative");
        anyhow::ensure!(
            self.kl_divergence_weight >= 0.0,
            "kl_divergence_weight must be non-negative"
        );
        Ok(())
    }

    pub fn vae_config(&self, num_stages: usize) -> VaeConfig {
        VaeConfig::new(self.latent_dim, self.number_filters)
            .with_num_stages(num_stages)
            .with_alpha(self.vae_alpha)
            .with_beta(self.vae_beta)
            .with_kld_weight(self.kl_divergence_weight)
    }
}

#[derive(Config, Debug)]
pub struct TrainConfig {
    /// Optimizer steps per attempt.
    #[config(default = 20_000)]
    pub num_iters: usize,
    /// Batch size of the first attempt.
    #[config(default = 512)]
    pub initial_batch_size: usize,
    /// Memory exhaustion after this many steps of an attempt is fatal.
    #[config(default = 10_000)]
    pub retry_cutoff: usize,
    /// Generated samples per FID evaluation; also scales the MSE term.
    #[config(default = 5_000)]
    pub fid_samples: usize,
    /// Images in each visual grid.
    #[config(default = 24)]
    pub sample_count: usize,
    #[config(default = 6)]
    pub grid_columns: usize,
    #[config(default = 5)]
    pub num_stages: usize,
    #[config(default = "SamplerKind::Shuffled")]
    pub sampler: SamplerKind,
    /// Image decoding threads.
    #[config(default = 12)]
    pub workers: usize,
}

impl TrainConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.num_iters >= 2, "num_iters must be at least 2");
        anyhow::ensure!(self.initial_batch_size >= 1, "initial_batch_size must be at least 1");
        anyhow::ensure!(self.fid_samples >= 1, "fid_samples must be at least 1");
        anyhow::ensure!(self.sample_count >= 1, "sample_count must be at least 1");
        anyhow::ensure!(self.grid_columns >= 1, "grid_columns must be at least 1");
        Ok(())
    }

    fn visual_interval(&self) -> usize {
        (self.num_iters / 20).max(1)
    }

    fn score_interval(&self) -> usize {
        (self.num_iters / 10).max(1)
    }

    /// First step whose score counts toward the final result.
    fn scoring_start(&self) -> usize {
        self.num_iters.div_ceil(2)
    }
}

/// Process-level settings passed explicitly instead of living in globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub rank: usize,
    pub world_size: usize,
    pub seed: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            seed: None,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.world_size >= 1, "world_size must be at least 1");
        anyhow::ensure!(
            self.rank < self.world_size,
            "rank {} out of range for world_size {}",
            self.rank,
            self.world_size
        );
        Ok(())
    }

    pub fn shard(&self) -> Shard {
        Shard {
            rank: self.rank,
            world_size: self.world_size,
        }
    }
}

/// External services a run talks to.
pub struct Collaborators<'a, B: AutodiffBackend> {
    pub images: Arc<dyn ImageSource>,
    pub tracker: &'a mut dyn Tracker,
    pub evaluator: &'a mut dyn FidEvaluator<B::InnerBackend>,
    pub allocator: &'a mut dyn ResourceAllocator,
}

/// Why memory exhaustion ended the run instead of triggering a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomFatal {
    /// The attempt had already run past the retry cutoff.
    PastCutoff { step: usize },
    /// Halving would take the batch size below 1.
    BatchFloor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { batch_size: usize },
    Fatal(OomFatal),
}

/// State threaded through the attempts of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub batch_size: usize,
    /// Last step index entered; `None` until the first step of the run.
    pub step: Option<usize>,
    pub attempts: usize,
}

impl RetryState {
    pub fn new(initial_batch_size: usize) -> Self {
        Self {
            batch_size: initial_batch_size,
            step: None,
            attempts: 0,
        }
    }

    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_step(&mut self, step: usize) {
        self.step = Some(step);
    }

    pub fn on_out_of_resource(&mut self, retry_cutoff: usize) -> RetryDecision {
        if let Some(step) = self.step {
            if step > retry_cutoff {
                return RetryDecision::Fatal(OomFatal::PastCutoff { step });
            }
        }
        let halved = self.batch_size / 2;
        if halved < 1 {
            return RetryDecision::Fatal(OomFatal::BatchFloor);
        }
        self.batch_size = halved;
        RetryDecision::Retry { batch_size: halved }
    }
}

#[derive(Debug)]
pub enum TrainOutcome {
    Completed {
        score: f64,
        batch_size: usize,
        attempts: usize,
        samples: Vec<ScoreSample>,
    },
    /// The loss became non-finite; scored with [`PENALTY_SCORE`].
    Diverged { step: usize, batch_size: usize },
    /// Scored with [`PENALTY_SCORE`].
    OutOfMemory {
        cause: OomFatal,
        batch_size: usize,
        attempts: usize,
    },
    /// Unclassified failure; no score is reported.
    Failed {
        error: anyhow::Error,
        step: Option<usize>,
    },
}

impl TrainOutcome {
    pub fn score(&self) -> Option<f64> {
        match self {
            TrainOutcome::Completed { score, .. } => Some(*score),
            TrainOutcome::Diverged { .. } | TrainOutcome::OutOfMemory { .. } => Some(PENALTY_SCORE),
            TrainOutcome::Failed { .. } => None,
        }
    }

    /// Score for callers that need a number: a missing score counts as the penalty.
    pub fn fitness(&self) -> f64 {
        self.score().unwrap_or(PENALTY_SCORE)
    }
}

#[derive(Debug, Error)]
enum TrainError {
    #[error(transparent)]
    OutOfResource(#[from] OutOfResourceError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("training attempt panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

enum AttemptEnd {
    Completed { score: f64, samples: Vec<ScoreSample> },
    Diverged { step: usize },
}

/// `sum(w_k * score_k)` with `w_k = sqrt(k)` for `k = 1..=n`, normalized to sum to 1.
pub fn weighted_score(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let weights: Vec<f64> = (1..=scores.len()).map(|k| (k as f64).sqrt()).collect();
    let total: f64 = weights.iter().sum();
    Some(weights.iter().zip(scores).map(|(w, s)| w / total * s).sum())
}

/// Run one training job for `hp` and return its outcome.
///
/// Every scored outcome is also logged to the tracker under `"Score"`.
pub fn train<B: AutodiffBackend>(
    hp: &Hyperparameters,
    config: &TrainConfig,
    runtime: &RuntimeConfig,
    mut collab: Collaborators<'_, B>,
    device: &B::Device,
) -> TrainOutcome {
    tracing::info!(
        latent_dim = hp.latent_dim,
        learning_rate = hp.learning_rate,
        number_filters = hp.number_filters,
        vae_alpha = hp.vae_alpha,
        vae_beta = hp.vae_beta,
        kl_divergence_weight = hp.kl_divergence_weight,
        "Starting training run"
    );

    if let Err(error) = hp
        .validate()
        .and_then(|_| config.validate())
        .and_then(|_| runtime.validate())
    {
        tracing::error!(error = %error, "Invalid training configuration");
        return TrainOutcome::Failed { error, step: None };
    }
    if let Some(seed) = runtime.seed {
        B::seed(seed);
    }

    let mut state = RetryState::new(config.initial_batch_size);
    loop {
        state.begin_attempt();
        // Device failures in the backend surface as panics; contain them to this run.
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            run_attempt::<B>(hp, config, runtime, &mut collab, &mut state, device)
        }))
        .unwrap_or_else(|payload| Err(TrainError::Panicked(panic_message(payload.as_ref()))));

        match attempt {
            Ok(AttemptEnd::Completed { score, samples }) => {
                report_score(collab.tracker, score);
                tracing::info!(score, batch_size = state.batch_size, attempts = state.attempts, "Training complete");
                return TrainOutcome::Completed {
                    score,
                    batch_size: state.batch_size,
                    attempts: state.attempts,
                    samples,
                };
            }
            Ok(AttemptEnd::Diverged { step }) => {
                tracing::warn!(step, "NaN losses, exiting...");
                report_score(collab.tracker, PENALTY_SCORE);
                return TrainOutcome::Diverged {
                    step,
                    batch_size: state.batch_size,
                };
            }
            Err(TrainError::OutOfResource(err)) => {
                let failed_batch = state.batch_size;
                match state.on_out_of_resource(config.retry_cutoff) {
                    RetryDecision::Retry { batch_size } => {
                        tracing::warn!(
                            error = %err,
                            step = ?state.step,
                            batch_size,
                            "Out of memory, halving batch size..."
                        );
                        collab.allocator.reclaim();
                    }
                    RetryDecision::Fatal(cause) => {
                        tracing::warn!(
                            error = %err,
                            ?cause,
                            batch_size = failed_batch,
                            "This configuration does not fit into memory, exiting..."
                        );
                        report_score(collab.tracker, PENALTY_SCORE);
                        return TrainOutcome::OutOfMemory {
                            cause,
                            batch_size: failed_batch,
                            attempts: state.attempts,
                        };
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, step = ?state.step, "Training failed");
                if let Err(e) = collab.tracker.flush() {
                    tracing::warn!(error = %e, "Failed to flush tracker");
                }
                return TrainOutcome::Failed {
                    error: match err {
                        TrainError::Other(e) => e,
                        other => anyhow::Error::new(other),
                    },
                    step: state.step,
                };
            }
        }
    }
}

fn report_score(tracker: &mut dyn Tracker, score: f64) {
    let logged = tracker
        .log_scalar(None, "Score", score)
        .and_then(|_| tracker.flush());
    if let Err(e) = logged {
        tracing::warn!(error = %e, score, "Failed to report score");
    }
}

fn progress_bar(runtime: &RuntimeConfig, total: usize) -> ProgressBar {
    if runtime.rank != 0 {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}

fn run_attempt<B: AutodiffBackend>(
    hp: &Hyperparameters,
    config: &TrainConfig,
    runtime: &RuntimeConfig,
    collab: &mut Collaborators<'_, B>,
    state: &mut RetryState,
    device: &B::Device,
) -> Result<AttemptEnd, TrainError> {
    let batch_size = state.batch_size;
    let vae_config = hp.vae_config(config.num_stages);
    let resolution = vae_config.resolution();
    let shape = collab.images.shape();
    if shape != [vae_config.in_channels, resolution, resolution] {
        return Err(anyhow::anyhow!(
            "dataset shape {shape:?} does not match the model input [{}, {resolution}, {resolution}]",
            vae_config.in_channels
        )
        .into());
    }

    let mut loader = BatchLoader::new(
        collab.images.clone(),
        batch_size,
        config.sampler,
        runtime.shard(),
        runtime.seed.unwrap_or(0),
        config.workers,
    )?;
    let first: Tensor<B, 4> = loader.next_batch(device)?;
    let shown = config.sample_count.min(batch_size);
    let probe = ProbeSamples {
        images: first.slice([0..shown]).inner(),
        latents: Tensor::<B::InnerBackend, 2>::random(
            [config.sample_count, hp.latent_dim],
            Distribution::Normal(0.0, 1.0),
            device,
        ),
    };
    collab.tracker.log_images(
        None,
        "Real Images",
        make_grid(probe.images.clone(), config.grid_columns, (-1.0, 1.0))?,
        None,
    )?;

    let mut model = vae_config.init::<B>(device);
    let mut optimizer = AdamConfig::new().init();
    let footprint = Footprint::estimate(&vae_config, model.num_params());
    let score_settings = ScoreSettings {
        batch_size,
        latent_dim: hp.latent_dim,
        num_samples: config.fid_samples,
        dataset_name: collab.images.name(),
    };
    tracing::info!(batch_size, attempt = state.attempts, params = footprint.parameters, "Attempt started");

    let pb = progress_bar(runtime, config.num_iters);
    let mut scores: Vec<ScoreSample> = Vec::new();

    for i in 0..config.num_iters {
        state.record_step(i);
        let last = i + 1 == config.num_iters;
        collab.allocator.reserve(&AllocationRequest {
            step: i,
            batch_size,
            phase: Phase::Train,
            footprint,
        })?;

        let real = loader.next_batch::<B>(device)?;
        let output = model.forward(real.clone());
        let losses = model.loss(real.clone(), &output);

        let total: f64 = losses.total.clone().into_scalar().elem();
        let reconstruction: f64 = losses.reconstruction.into_scalar().elem();
        let kl_divergence: f64 = losses.kl_divergence.into_scalar().elem();

        let grads = GradientsParams::from_grads(losses.total.backward(), &model);
        model = optimizer.step(hp.learning_rate, model, grads);

        collab.tracker.log_scalar(Some(i), "VAE", total)?;
        collab.tracker.log_scalar(Some(i), "Reconstruction", reconstruction)?;
        collab.tracker.log_scalar(Some(i), "KL Divergence", kl_divergence)?;

        if !total.is_finite() {
            pb.abandon_with_message("NaN loss");
            return Ok(AttemptEnd::Diverged { step: i });
        }

        if i % config.visual_interval() == 0 || last {
            visual_probe(&model.valid(), &probe, i, config.grid_columns, collab.tracker)?;
        }

        if i % config.score_interval() == 0 || last {
            collab.allocator.reserve(&AllocationRequest {
                step: i,
                batch_size,
                phase: Phase::Evaluation,
                footprint,
            })?;
            let sample = score_probe(
                &model.valid(),
                collab.evaluator,
                output.reconstruction.inner(),
                real.inner(),
                score_settings,
                i,
                collab.tracker,
                device,
            )?;
            pb.set_message(format!("FID: {:.2} MSE: {:.2}", sample.fid, sample.mse));
            if i >= config.scoring_start() {
                scores.push(sample);
            }
        }

        pb.inc(1);
    }
    pb.finish_and_clear();

    let values: Vec<f64> = scores.iter().map(|s| s.score).collect();
    let score = weighted_score(&values).unwrap_or_else(|| {
        tracing::warn!("No score samples collected, reporting penalty");
        PENALTY_SCORE
    });
    Ok(AttemptEnd::Completed { score, samples: scores })
}
