//! Bayesian optimisation over the exponent space of [`Hyperparameters`].

use egobox_doe::{Lhs, SamplingMethod};
use egobox_ego::{EgorBuilder, InfillOptimizer, InfillStrategy};
use egobox_moe::{CorrelationSpec, RegressionSpec};
use ndarray::{array, Array2, ArrayView2};

use crate::trainer::Hyperparameters;

/// Best point found by a search.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub best: Hyperparameters,
    pub exponents: Vec<f64>,
    pub score: f64,
}

pub struct BayesianSearch {
    pub n_initial_points: usize,
    pub n_iter: usize,
}

impl BayesianSearch {
    pub fn new(n_iter: usize, n_initial_points: usize) -> Self {
        Self {
            n_initial_points,
            n_iter,
        }
    }

    /// Exponent bounds, one row per entry of [`Hyperparameters::to_array`].
    pub fn bounds() -> Array2<f64> {
        array![
            [4.0, 9.0],   // latent_dim = 2^x
            [-5.0, -2.0], // learning_rate = 10^x
            [2.0, 6.0],   // number_filters = 2^x
            [-3.0, 1.0],  // vae_alpha = 10^x
            [-5.0, 0.0],  // vae_beta = 10^x
            [-5.0, 0.0],  // kl_divergence_weight = 10^x
        ]
    }

    /// Minimise `objective` starting from a Latin hypercube of
    /// `n_initial_points`, followed by `n_iter` expected-improvement steps.
    pub fn optimize<F>(&self, objective: F) -> anyhow::Result<SearchResult>
    where
        F: Fn(&Hyperparameters) -> f64 + Clone + Send + Sync + 'static,
    {
        anyhow::ensure!(self.n_initial_points > 0, "search needs at least one initial point");
        let xlimits = Self::bounds();
        let doe = Lhs::new(&xlimits).sample(self.n_initial_points);
        tracing::info!(
            initial_points = self.n_initial_points,
            iterations = self.n_iter,
            "Starting Bayesian optimization"
        );

        let fobj = move |x: &ArrayView2<f64>| -> Array2<f64> {
            Array2::from_shape_fn((x.nrows(), 1), |(i, _)| {
                let exponents = x.row(i).to_vec();
                let hp = Hyperparameters::array(&exponents);
                let score = objective(&hp);
                tracing::info!(?exponents, score, "Evaluated hyperparameters");
                score
            })
        };

        let egor = EgorBuilder::optimize(fobj)
            .configure(|config| {
                config
                    .doe(&doe)
                    .infill_strategy(InfillStrategy::EI)
                    .infill_optimizer(InfillOptimizer::Cobyla)
                    .regression_spec(RegressionSpec::CONSTANT)
                    .correlation_spec(CorrelationSpec::SQUAREDEXPONENTIAL)
                    .max_iters(self.n_iter)
            })
            .min_within(&xlimits)
            .run()
            .map_err(|e| anyhow::anyhow!("Bayesian optimization failed: {e}"))?;

        let exponents = egor.x_opt.to_vec();
        let score = egor.y_opt[0];
        let best = Hyperparameters::array(&exponents);
        tracing::info!(?best, score, "Best hyperparameters found");

        Ok(SearchResult {
            best,
            exponents,
            score,
        })
    }
}
