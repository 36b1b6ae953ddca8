//! Hierarchical EM tissue segmentation.
//!
//! The engine walks a tree of tissue classes top-down. Every superclass runs
//! its own EM loop over the voxels its parent assigned to it: an E-step
//! combining spatial priors, intensity likelihoods and MRF regularisation,
//! then bias, optional intensity, registration and shape M-steps.

pub mod config;
pub mod engine;
pub mod input;
pub mod progress;

mod bias;
mod convergence;
mod estep;
mod intensity;
mod level;
mod register;
mod shape_step;

pub use config::EngineConfig;
pub use engine::{EmEngine, LevelReport, Segmentation};
pub use input::SegmentationInput;
pub use progress::{HistoryProgress, IterationInfo, ProgressCallback, ProgressTracker, TracingProgress};
