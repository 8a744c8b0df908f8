//! Reinforcement learning environments for gymkit
//!
//! This crate provides:
//! - Classic control environments
//! - An environment registry with ID-based `make`
//! - Composable wrappers (time limits, observation and reward transforms)
//! - Batched execution via [`AsyncVectorEnv`]

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod classic;
pub mod registry;
pub mod vector;
pub mod wrappers;

// Re-export environments
pub use classic::{CartPoleEnv, MountainCarContinuousEnv, MountainCarEnv, PendulumEnv};
pub use registry::{
    deregister_env, env_spec, list_envs, make_env, register_env, EnvId, EnvRegistry, EnvSpec,
};
pub use vector::{AsyncVectorEnv, VectorStep};
pub use wrappers::{
    ClipAction, FlattenObservation, FrameStack, NormalizeObservation, OrderEnforcing,
    RecordEpisodeStatistics, TimeLimit, TransformReward,
};

// Re-export core types
pub use gymkit_core::{
    EnvMetadata, Environment, EnvironmentConfig, GymError, RenderFrame, ResetOptions, Result,
    Reward, Sample, Space, Step, StepInfo,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        make_env, register_env, AsyncVectorEnv, CartPoleEnv, EnvRegistry, EnvSpec, FrameStack,
        TimeLimit,
    };
    pub use gymkit_core::prelude::*;
}
