//! Environment trait and step/reset types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GymError, Result};
use crate::reward::Reward;
use crate::space::{Sample, Space};

/// Result of a single environment step
#[derive(Debug, Clone)]
pub struct Step {
    /// Observation from the environment
    pub observation: Sample,
    /// Reward signal
    pub reward: Reward,
    /// Whether the episode terminated
    pub done: bool,
    /// Whether the episode was cut short (e.g. time limit)
    pub truncated: bool,
    /// Additional info from the environment
    pub info: StepInfo,
}

/// Additional information from a step or reset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepInfo {
    /// Custom fields
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl StepInfo {
    /// Insert a custom field
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.fields.insert(key.into(), value);
    }

    /// Look up a custom field
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }
}

/// Options passed to [`Environment::reset`]
///
/// A `Some(seed)` reseeds the environment's RNG before drawing the initial
/// state; `None` leaves an already-initialized RNG untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetOptions {
    /// Seed for the environment's RNG
    pub seed: Option<u64>,
    /// Environment-specific reset parameters
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl ResetOptions {
    /// Reset options carrying only a seed
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            options: serde_json::Map::new(),
        }
    }
}

/// Static environment properties
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvMetadata {
    /// Render modes the environment supports
    pub render_modes: Vec<String>,
    /// Frames per second for rendered output
    pub render_fps: Option<u32>,
}

impl EnvMetadata {
    /// Metadata advertising the given render modes
    #[must_use]
    pub fn with_render_modes(modes: &[&str]) -> Self {
        Self {
            render_modes: modes.iter().map(ToString::to_string).collect(),
            render_fps: None,
        }
    }

    /// Supported modes formatted for error messages, `None` first
    #[must_use]
    pub fn valid_modes(&self) -> String {
        let mut modes = vec!["None".to_string()];
        modes.extend(self.render_modes.iter().cloned());
        modes.join(", ")
    }
}

/// A rendered view of the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RenderFrame {
    /// No rendering output, produced by the `None` mode
    None,
    /// Terminal-style text representation
    Ansi(String),
    /// RGB pixel buffer, row-major, 3 bytes per pixel
    RgbArray {
        /// Frame width in pixels
        width: usize,
        /// Frame height in pixels
        height: usize,
        /// Pixel data
        pixels: Vec<u8>,
    },
}

/// Configuration for environment construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Random seed
    pub seed: Option<u64>,
    /// Maximum episode steps
    pub max_steps: Option<usize>,
    /// Render mode
    pub render_mode: Option<String>,
    /// Additional parameters
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            seed: None,
            max_steps: None,
            render_mode: None,
            params: serde_json::Map::new(),
        }
    }
}

/// Core environment trait
///
/// Observations and actions are [`Sample`]s of the declared spaces, which
/// keeps the trait object-safe: registries and vectorized environments deal
/// in `Box<dyn Environment>`.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Get the observation space
    fn observation_space(&self) -> Space;

    /// Get the action space
    fn action_space(&self) -> Space;

    /// Static properties such as supported render modes
    fn metadata(&self) -> EnvMetadata {
        EnvMetadata::default()
    }

    /// The registry ID this environment was made from, if any
    fn spec_id(&self) -> Option<&str> {
        None
    }

    /// Reset the environment, returning the initial observation
    async fn reset(&mut self, options: ResetOptions) -> Result<(Sample, StepInfo)>;

    /// Take a step in the environment
    async fn step(&mut self, action: &Sample) -> Result<Step>;

    /// Render the environment in the given mode
    ///
    /// Every environment supports the `None` mode as a no-op.
    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        if mode == "None" {
            return Ok(RenderFrame::None);
        }
        Err(GymError::InvalidRenderMode {
            mode: mode.to_string(),
            valid_modes: self.metadata().valid_modes(),
        })
    }

    /// Close the environment
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Get current episode info
    fn episode_info(&self) -> Option<Episode> {
        None
    }
}

#[async_trait]
impl Environment for Box<dyn Environment> {
    fn observation_space(&self) -> Space {
        (**self).observation_space()
    }

    fn action_space(&self) -> Space {
        (**self).action_space()
    }

    fn metadata(&self) -> EnvMetadata {
        (**self).metadata()
    }

    fn spec_id(&self) -> Option<&str> {
        (**self).spec_id()
    }

    async fn reset(&mut self, options: ResetOptions) -> Result<(Sample, StepInfo)> {
        (**self).reset(options).await
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        (**self).step(action).await
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        (**self).render(mode).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn episode_info(&self) -> Option<Episode> {
        (**self).episode_info()
    }
}

/// Episode bookkeeping record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// Episode ID
    pub id: String,
    /// Total reward
    pub total_reward: f64,
    /// Number of steps
    pub steps: usize,
    /// Whether the episode was truncated
    pub truncated: bool,
    /// Start time
    pub start_time: chrono::DateTime<chrono::Utc>,
    /// End time
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Wrapper for environments that tracks episodes
pub struct TrackedEnvironment<E> {
    /// Inner environment
    pub env: E,
    /// Current episode
    pub episode: Option<Episode>,
    /// Step counter
    pub step_count: usize,
}

impl<E> TrackedEnvironment<E> {
    /// Create a new tracked environment
    pub fn new(env: E) -> Self {
        Self {
            env,
            episode: None,
            step_count: 0,
        }
    }
}

#[async_trait]
impl<E> Environment for TrackedEnvironment<E>
where
    E: Environment,
{
    fn observation_space(&self) -> Space {
        self.env.observation_space()
    }

    fn action_space(&self) -> Space {
        self.env.action_space()
    }

    fn metadata(&self) -> EnvMetadata {
        self.env.metadata()
    }

    fn spec_id(&self) -> Option<&str> {
        self.env.spec_id()
    }

    async fn reset(&mut self, options: ResetOptions) -> Result<(Sample, StepInfo)> {
        // End current episode if one is open
        if let Some(ref mut episode) = self.episode {
            episode.end_time = Some(chrono::Utc::now());
        }

        self.episode = Some(Episode {
            id: uuid::Uuid::new_v4().to_string(),
            total_reward: 0.0,
            steps: 0,
            truncated: false,
            start_time: chrono::Utc::now(),
            end_time: None,
        });
        self.step_count = 0;

        self.env.reset(options).await
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        let step = self.env.step(action).await?;

        self.step_count += 1;
        if let Some(ref mut episode) = self.episode {
            episode.total_reward += step.reward.0;
            episode.steps = self.step_count;

            if step.done || step.truncated {
                episode.truncated = step.truncated;
                episode.end_time = Some(chrono::Utc::now());
                tracing::debug!(
                    id = %episode.id,
                    steps = episode.steps,
                    total_reward = episode.total_reward,
                    truncated = episode.truncated,
                    "episode finished"
                );
            }
        }

        Ok(step)
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        self.env.render(mode).await
    }

    async fn close(&mut self) -> Result<()> {
        self.env.close().await
    }

    fn episode_info(&self) -> Option<Episode> {
        self.episode.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-step environment used to exercise the tracking wrapper
    struct CountdownEnv {
        remaining: usize,
    }

    #[async_trait]
    impl Environment for CountdownEnv {
        fn observation_space(&self) -> Space {
            Space::box1d(vec![0.0], vec![10.0]).unwrap()
        }

        fn action_space(&self) -> Space {
            Space::discrete(1)
        }

        async fn reset(&mut self, _options: ResetOptions) -> Result<(Sample, StepInfo)> {
            self.remaining = 2;
            Ok((Sample::from_vec(vec![2.0]), StepInfo::default()))
        }

        async fn step(&mut self, _action: &Sample) -> Result<Step> {
            self.remaining -= 1;
            Ok(Step {
                observation: Sample::from_vec(vec![self.remaining as f64]),
                reward: Reward(1.0),
                done: self.remaining == 0,
                truncated: false,
                info: StepInfo::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_tracked_environment_accumulates_episode() {
        let mut env = TrackedEnvironment::new(CountdownEnv { remaining: 0 });
        env.reset(ResetOptions::default()).await.unwrap();

        let first = env.step(&Sample::Discrete(0)).await.unwrap();
        assert!(!first.done);
        let last = env.step(&Sample::Discrete(0)).await.unwrap();
        assert!(last.done);

        let episode = env.episode_info().expect("episode should be tracked");
        assert_eq!(episode.steps, 2);
        assert_eq!(episode.total_reward, 2.0);
        assert!(episode.end_time.is_some());
        assert!(!episode.truncated);
    }

    #[tokio::test]
    async fn test_default_render_is_an_error() {
        let mut env = CountdownEnv { remaining: 0 };
        let err = env.render("human").await.unwrap_err();
        assert!(matches!(err, GymError::InvalidRenderMode { .. }));
        assert!(err.to_string().contains("Valid render_modes: None"));
    }

    #[tokio::test]
    async fn test_none_render_mode_is_a_no_op() {
        let mut env = CountdownEnv { remaining: 0 };
        let frame = env.render("None").await.unwrap();
        assert!(matches!(frame, RenderFrame::None));
    }
}
