//! Memory admission for training and evaluation steps.
//!
//! Every step asks a [`ResourceAllocator`] for the bytes it is about to use.
//! Refusal is a typed [`OutOfResourceError`], which the trainer treats as the
//! one retryable failure.

use sysinfo::System;
use thiserror::Error;

use crate::model::VaeConfig;

const ELEMENT_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// Parameter, gradient and two Adam moment buffers.
const TRAIN_PARAM_COPIES: u64 = 4;
/// Forward activations, their gradients, and batch-norm saved inputs.
const TRAIN_ACTIVATION_COPIES: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out of memory: step needs {requested} bytes at batch size {batch_size}, {available} bytes available")]
pub struct OutOfResourceError {
    pub requested: u64,
    pub available: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Evaluation,
}

/// Size of one model instance in f32 elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footprint {
    pub parameters: usize,
    pub activations_per_sample: usize,
}

impl Footprint {
    /// Activation count from the stage schedule: each stage keeps its conv,
    /// norm and activation outputs, mirrored by the decoder.
    pub fn estimate(config: &VaeConfig, parameters: usize) -> Self {
        let hidden = config.hidden_dims();
        let mut side = config.resolution();
        let mut per_sample = 2 * config.in_channels * side * side;
        for &width in &hidden {
            side /= 2;
            per_sample += 2 * 3 * width * side * side;
        }
        per_sample += 2 * config.latent_dim * 3;

        Self {
            parameters,
            activations_per_sample: per_sample,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    pub step: usize,
    pub batch_size: usize,
    pub phase: Phase,
    pub footprint: Footprint,
}

impl AllocationRequest {
    pub fn bytes(&self) -> u64 {
        let params = self.footprint.parameters as u64 * ELEMENT_BYTES;
        let activations =
            self.batch_size as u64 * self.footprint.activations_per_sample as u64 * ELEMENT_BYTES;
        match self.phase {
            Phase::Train => params * TRAIN_PARAM_COPIES + activations * TRAIN_ACTIVATION_COPIES,
            Phase::Evaluation => params + activations,
        }
    }
}

pub trait ResourceAllocator {
    fn reserve(&mut self, request: &AllocationRequest) -> Result<(), OutOfResourceError>;

    /// Called after the model and optimizer of a failed attempt are dropped.
    fn reclaim(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BudgetSource {
    Fixed,
    /// Tracks the host's available memory; refreshed on reclaim.
    Host,
}

/// Admits a request when its estimated size fits within a byte budget.
#[derive(Debug)]
pub struct MemoryBudget {
    budget: u64,
    source: BudgetSource,
    peak: u64,
}

impl MemoryBudget {
    pub fn fixed(bytes: u64) -> Self {
        Self {
            budget: bytes,
            source: BudgetSource::Fixed,
            peak: 0,
        }
    }

    /// Budget equal to the host memory currently available.
    pub fn host() -> Self {
        Self {
            budget: host_available(),
            source: BudgetSource::Host,
            peak: 0,
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Largest request admitted since the last reclaim.
    pub fn peak(&self) -> u64 {
        self.peak
    }
}

fn host_available() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

impl ResourceAllocator for MemoryBudget {
    fn reserve(&mut self, request: &AllocationRequest) -> Result<(), OutOfResourceError> {
        let requested = request.bytes();
        if requested > self.budget {
            return Err(OutOfResourceError {
                requested,
                available: self.budget,
                batch_size: request.batch_size,
            });
        }
        self.peak = self.peak.max(requested);
        Ok(())
    }

    fn reclaim(&mut self) {
        if self.source == BudgetSource::Host {
            self.budget = host_available();
        }
        tracing::debug!(budget = self.budget, peak = self.peak, "Reclaimed memory budget");
        self.peak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(batch_size: usize, phase: Phase) -> AllocationRequest {
        AllocationRequest {
            step: 0,
            batch_size,
            phase,
            footprint: Footprint::estimate(&VaeConfig::new(256, 16), 1_000_000),
        }
    }

    #[test]
    fn test_estimate_grows_with_batch() {
        let small = request(64, Phase::Train).bytes();
        let large = request(128, Phase::Train).bytes();
        assert!(large > small);
        assert!(request(128, Phase::Evaluation).bytes() < large);
    }

    #[test]
    fn test_budget_refuses_oversized_request() {
        let fits = request(8, Phase::Train).bytes();
        let mut budget = MemoryBudget::fixed(fits);

        assert!(budget.reserve(&request(8, Phase::Train)).is_ok());
        assert_eq!(budget.peak(), fits);

        let err = budget.reserve(&request(16, Phase::Train)).unwrap_err();
        assert_eq!(err.batch_size, 16);
        assert_eq!(err.available, fits);
        assert!(err.requested > fits);

        budget.reclaim();
        assert_eq!(budget.peak(), 0);
        assert_eq!(budget.budget(), fits);
    }

    #[test]
    fn test_halving_eventually_fits() {
        let mut budget = MemoryBudget::fixed(request(100, Phase::Train).bytes());
        let mut batch_size = 512;
        while budget.reserve(&request(batch_size, Phase::Train)).is_err() {
            batch_size /= 2;
        }
        assert_eq!(batch_size, 64);
    }

    #[test]
    fn test_host_budget_is_finite() {
        let mut budget = MemoryBudget::host();
        assert!(budget.budget() < u64::MAX);
        assert!(budget.reserve(&request(1 << 20, Phase::Train)).is_err());
        budget.reclaim();
        assert!(budget.budget() < u64::MAX);
    }
}
