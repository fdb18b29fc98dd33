//! Periodic quality probes: image grids for inspection and the FID + MSE step score.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use burn::prelude::*;
use burn::tensor::module::adaptive_avg_pool2d;
use burn::tensor::Distribution;
use serde::Serialize;

use crate::data::{BatchLoader, ImageSource, SamplerKind, Shard};
use crate::model::LogCoshVae;
use crate::tracker::{make_grid, Tracker};

pub const FID_KEY: &str = "FID";

/// Pooled feature grid side used by [`PixelFid`].
const POOL_SIDE: usize = 8;

/// Named metrics returned by a [`FidEvaluator`]; always contains [`FID_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FidReport {
    values: BTreeMap<String, f64>,
}

impl FidReport {
    pub fn new(fid: f64) -> Self {
        let mut values = BTreeMap::new();
        values.insert(FID_KEY.to_string(), fid);
        Self { values }
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn fid(&self) -> f64 {
        self.values.get(FID_KEY).copied().unwrap_or(f64::NAN)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Distributional distance between generated and real images.
pub trait FidEvaluator<B: Backend> {
    fn compute_fid(
        &mut self,
        model: &LogCoshVae<B>,
        batch_size: usize,
        latent_dim: usize,
        num_samples: usize,
        dataset_name: &str,
        device: &B::Device,
    ) -> anyhow::Result<FidReport>;
}

/// Per-feature mean and variance of a sample set.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStats {
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
    pub count: usize,
}

#[derive(Debug, Default)]
struct StatsAccumulator {
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    count: usize,
}

impl StatsAccumulator {
    fn push_rows(&mut self, values: &[f32], dim: usize) {
        if self.sum.is_empty() {
            self.sum = vec![0.0; dim];
            self.sum_sq = vec![0.0; dim];
        }
        for row in values.chunks_exact(dim) {
            for (j, &v) in row.iter().enumerate() {
                let v = v as f64;
                self.sum[j] += v;
                self.sum_sq[j] += v * v;
            }
            self.count += 1;
        }
    }

    fn finish(self) -> FeatureStats {
        let n = self.count.max(1) as f64;
        let mean: Vec<f64> = self.sum.iter().map(|s| s / n).collect();
        let var = self
            .sum_sq
            .iter()
            .zip(&mean)
            .map(|(sq, m)| (sq / n - m * m).max(0.0))
            .collect();
        FeatureStats {
            mean,
            var,
            count: self.count,
        }
    }
}

/// Fréchet distance between two Gaussians with diagonal covariance:
/// `|mu_a - mu_b|^2 + sum(var_a + var_b - 2 sqrt(var_a var_b))`.
pub fn frechet_distance_diag(a: &FeatureStats, b: &FeatureStats) -> f64 {
    let mean_term: f64 = a.mean.iter().zip(&b.mean).map(|(x, y)| (x - y).powi(2)).sum();
    let var_term: f64 = a
        .var
        .iter()
        .zip(&b.var)
        .map(|(x, y)| x + y - 2.0 * (x * y).sqrt())
        .sum();
    mean_term + var_term
}

/// Pools each image to `POOL_SIDE x POOL_SIDE` per channel and returns the
/// flattened features, one row per image.
fn pooled_features<B: Backend>(images: Tensor<B, 4>) -> anyhow::Result<(Vec<f32>, usize)> {
    let pooled = adaptive_avg_pool2d(images, [POOL_SIDE, POOL_SIDE]);
    let [_, c, h, w] = pooled.dims();
    let values: Vec<f32> = pooled
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("failed to read pooled features: {e:?}"))?;
    Ok((values, c * h * w))
}

/// FID-style score over pooled pixel features instead of Inception activations.
///
/// Real-image statistics are computed once per dataset name and cached.
pub struct PixelFid {
    real: Arc<dyn ImageSource>,
    workers: usize,
    cache: HashMap<String, FeatureStats>,
}

impl PixelFid {
    pub fn new(real: Arc<dyn ImageSource>, workers: usize) -> Self {
        Self {
            real,
            workers,
            cache: HashMap::new(),
        }
    }

    fn real_stats<B: Backend>(
        &mut self,
        batch_size: usize,
        num_samples: usize,
        dataset_name: &str,
        device: &B::Device,
    ) -> anyhow::Result<FeatureStats> {
        if let Some(stats) = self.cache.get(dataset_name) {
            return Ok(stats.clone());
        }

        let available = num_samples.min(self.real.len());
        let batch_size = batch_size.min(available).max(1);
        let mut loader = BatchLoader::new(
            self.real.clone(),
            batch_size,
            SamplerKind::Sequential,
            Shard::default(),
            0,
            self.workers,
        )
        .context("failed to open real images for FID")?;

        let mut acc = StatsAccumulator::default();
        for _ in 0..(available / batch_size).max(1) {
            let batch = loader.next_batch::<B>(device)?;
            let (values, dim) = pooled_features(batch)?;
            acc.push_rows(&values, dim);
        }
        let stats = acc.finish();
        tracing::info!(dataset = dataset_name, samples = stats.count, "Cached real-image FID statistics");
        self.cache.insert(dataset_name.to_string(), stats.clone());
        Ok(stats)
    }
}

impl<B: Backend> FidEvaluator<B> for PixelFid {
    fn compute_fid(
        &mut self,
        model: &LogCoshVae<B>,
        batch_size: usize,
        latent_dim: usize,
        num_samples: usize,
        dataset_name: &str,
        device: &B::Device,
    ) -> anyhow::Result<FidReport> {
        anyhow::ensure!(batch_size > 0 && num_samples > 0, "FID needs a positive batch size and sample count");
        let real = self.real_stats::<B>(batch_size, num_samples, dataset_name, device)?;

        let mut acc = StatsAccumulator::default();
        let mut remaining = num_samples;
        while remaining > 0 {
            let n = remaining.min(batch_size);
            let z = Tensor::<B, 2>::random([n, latent_dim], Distribution::Normal(0.0, 1.0), device);
            let (values, dim) = pooled_features(model.decode(z))?;
            acc.push_rows(&values, dim);
            remaining -= n;
        }
        let fake = acc.finish();

        Ok(FidReport::new(frechet_distance_diag(&fake, &real))
            .with("FID Real Samples", real.count as f64))
    }
}

/// Fixed inputs reused by every visual probe of one attempt.
#[derive(Debug, Clone)]
pub struct ProbeSamples<B: Backend> {
    pub images: Tensor<B, 4>,
    pub latents: Tensor<B, 2>,
}

/// Reconstructs the held-out images and decodes the fixed latents, logging
/// both as grids captioned with the step.
pub fn visual_probe<B: Backend>(
    model: &LogCoshVae<B>,
    samples: &ProbeSamples<B>,
    step: usize,
    nrow: usize,
    tracker: &mut dyn Tracker,
) -> anyhow::Result<()> {
    let caption = Some(format!("Step {step}"));

    let reconstructed = model.forward(samples.images.clone()).reconstruction;
    let grid = make_grid(reconstructed, nrow, (-1.0, 1.0))?;
    tracker.log_images(Some(step), "Reconstructed Images VAE", grid, caption.clone())?;

    let generated = model.decode(samples.latents.clone());
    let grid = make_grid(generated, nrow, (-1.0, 1.0))?;
    tracker.log_images(Some(step), "Generated Images VAE", grid, caption)?;
    Ok(())
}

/// One quantitative evaluation point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreSample {
    pub step: usize,
    pub fid: f64,
    pub mse: f64,
    pub score: f64,
}

/// Inputs of [`score_probe`] that stay fixed for a run.
#[derive(Debug, Clone, Copy)]
pub struct ScoreSettings<'a> {
    pub batch_size: usize,
    pub latent_dim: usize,
    pub num_samples: usize,
    pub dataset_name: &'a str,
}

/// `score = FID + mean((fake - real)^2) * num_samples`, using the latest
/// training batch for the MSE term. Logs the FID report and the score.
pub fn score_probe<B: Backend>(
    model: &LogCoshVae<B>,
    evaluator: &mut dyn FidEvaluator<B>,
    fake: Tensor<B, 4>,
    real: Tensor<B, 4>,
    settings: ScoreSettings<'_>,
    step: usize,
    tracker: &mut dyn Tracker,
    device: &B::Device,
) -> anyhow::Result<ScoreSample> {
    let report = evaluator
        .compute_fid(
            model,
            settings.batch_size,
            settings.latent_dim,
            settings.num_samples,
            settings.dataset_name,
            device,
        )
        .context("FID evaluation failed")?;
    for (key, value) in report.iter() {
        tracker.log_scalar(Some(step), key, value)?;
    }

    let mse: f64 = (fake - real).powf_scalar(2.0).mean().into_scalar().elem();
    let mse = mse * settings.num_samples as f64;
    let fid = report.fid();
    let score = fid + mse;
    tracker.log_scalar(Some(step), "Score", score)?;

    Ok(ScoreSample { step, fid, mse, score })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DatasetResult;
    use crate::model::VaeConfig;
    use crate::tracker::MemoryTracker;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    struct ConstantImages {
        value: f32,
    }

    impl ImageSource for ConstantImages {
        fn name(&self) -> &str {
            "constant"
        }
        fn len(&self) -> usize {
            16
        }
        fn shape(&self) -> [usize; 3] {
            [3, 8, 8]
        }
        fn load(&self, _idx: usize) -> DatasetResult<Vec<f32>> {
            Ok(vec![self.value; 3 * 64])
        }
    }

    struct FixedFid(f64);

    impl<B: Backend> FidEvaluator<B> for FixedFid {
        fn compute_fid(
            &mut self,
            _model: &LogCoshVae<B>,
            _batch_size: usize,
            _latent_dim: usize,
            _num_samples: usize,
            _dataset_name: &str,
            _device: &B::Device,
        ) -> anyhow::Result<FidReport> {
            Ok(FidReport::new(self.0))
        }
    }

    #[test]
    fn test_frechet_identical_is_zero() {
        let stats = FeatureStats {
            mean: vec![0.5, -0.2],
            var: vec![1.0, 0.25],
            count: 10,
        };
        assert!(frechet_distance_diag(&stats, &stats).abs() < 1e-12);
    }

    #[test]
    fn test_frechet_known_value() {
        let a = FeatureStats { mean: vec![0.0], var: vec![1.0], count: 1 };
        let b = FeatureStats { mean: vec![2.0], var: vec![4.0], count: 1 };
        // 4 + (1 + 4 - 2*2) = 5
        assert!((frechet_distance_diag(&a, &b) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_accumulator_stats() {
        let mut acc = StatsAccumulator::default();
        acc.push_rows(&[1.0, 10.0, 3.0, 10.0], 2);
        let stats = acc.finish();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean, vec![2.0, 10.0]);
        assert_eq!(stats.var, vec![1.0, 0.0]);
    }

    #[test]
    fn test_pixel_fid_runs_and_caches() {
        let device = Default::default();
        let model = VaeConfig::new(8, 4).with_num_stages(1).init::<TestBackend>(&device);
        let mut fid = PixelFid::new(Arc::new(ConstantImages { value: 0.0 }), 1);

        let report =
            FidEvaluator::<TestBackend>::compute_fid(&mut fid, &model, 4, 8, 10, "constant", &device).unwrap();
        assert!(report.fid().is_finite());
        assert!(report.fid() >= 0.0);
        assert_eq!(report.iter().find(|(k, _)| *k == "FID Real Samples").map(|(_, v)| v), Some(8.0));
        assert!(fid.cache.contains_key("constant"));
    }

    #[test]
    fn test_score_probe_adds_scaled_mse() {
        let device = Default::default();
        let model = VaeConfig::new(8, 4).with_num_stages(1).init::<TestBackend>(&device);
        let mut tracker = MemoryTracker::new();
        let real = Tensor::<TestBackend, 4>::zeros([2, 3, 8, 8], &device);
        let fake = Tensor::<TestBackend, 4>::ones([2, 3, 8, 8], &device).mul_scalar(0.1);

        let settings = ScoreSettings {
            batch_size: 2,
            latent_dim: 8,
            num_samples: 5000,
            dataset_name: "constant",
        };
        let sample = score_probe(&model, &mut FixedFid(40.0), fake, real, settings, 7, &mut tracker, &device).unwrap();

        assert!((sample.mse - 50.0).abs() < 1e-3, "0.01 * 5000 = 50, got {}", sample.mse);
        assert!((sample.score - 90.0).abs() < 1e-3);
        assert_eq!(tracker.last_scalar("FID"), Some(40.0));
        assert_eq!(tracker.last_scalar("Score"), Some(sample.score));
    }

    #[test]
    fn test_visual_probe_logs_two_grids() {
        let device = Default::default();
        let model = VaeConfig::new(8, 4).with_num_stages(1).init::<TestBackend>(&device);
        let samples = ProbeSamples {
            images: Tensor::<TestBackend, 4>::zeros([4, 3, 8, 8], &device),
            latents: Tensor::<TestBackend, 2>::zeros([4, 8], &device),
        };
        let mut tracker = MemoryTracker::new();

        visual_probe(&model, &samples, 12, 2, &mut tracker).unwrap();

        assert_eq!(tracker.image_steps("Reconstructed Images VAE"), vec![Some(12)]);
        assert_eq!(tracker.image_steps("Generated Images VAE"), vec![Some(12)]);
    }
}
