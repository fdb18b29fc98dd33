//! Log-cosh VAE training that reduces one hyperparameter vector to a single
//! fitness score, backing off the batch size when a step does not fit in memory.
//!
//! [`trainer::train`] is the entry point. Everything it talks to beyond the
//! tensor backend sits behind a trait: [`data::ImageSource`] for images,
//! [`tracker::Tracker`] for telemetry, [`eval::FidEvaluator`] for sample
//! quality and [`memory::ResourceAllocator`] for memory admission.

pub mod data;
pub mod eval;
pub mod loss;
pub mod memory;
pub mod model;
pub mod search;
pub mod tracker;
pub mod trainer;
