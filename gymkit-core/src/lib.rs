//! Core environment traits and types for gymkit
//!
//! This crate provides the foundational abstractions for building
//! reinforcement-learning environments: spaces and their samples, the
//! [`Environment`] trait with its reset/step/render contract, and the
//! error and seeding plumbing shared by every environment crate.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod environment;
pub mod error;
pub mod reward;
pub mod seeding;
pub mod space;

// Re-export core traits and types
pub use environment::{
    EnvMetadata, Environment, EnvironmentConfig, Episode, RenderFrame, ResetOptions, Step,
    StepInfo, TrackedEnvironment,
};
pub use error::{GymError, Result};
pub use reward::Reward;
pub use seeding::rng_from_seed;
pub use space::{Sample, Space};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Environment, EnvironmentConfig, GymError, ResetOptions, Result, Reward, Sample, Space,
        Step, StepInfo,
    };
}
