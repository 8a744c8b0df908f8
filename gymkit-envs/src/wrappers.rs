//! Environment wrappers for common transformations
//!
//! Wrappers implement [`Environment`] by delegation, so they can be stacked
//! in any order. The inner environment stays reachable through the public
//! `env` field or [`into_inner`](TimeLimit::into_inner).

use std::collections::VecDeque;
use std::time::Instant;

use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};

use gymkit_core::{
    EnvMetadata, Environment, GymError, RenderFrame, ResetOptions, Result, Reward, Sample, Space,
    Step, StepInfo,
};

/// Truncates episodes after a fixed number of steps
pub struct TimeLimit<E> {
    /// Inner environment
    pub env: E,
    /// Maximum steps per episode
    pub max_steps: usize,
    steps: usize,
}

impl<E> TimeLimit<E> {
    /// Create a new time limit wrapper
    pub fn new(env: E, max_steps: usize) -> Self {
        Self {
            env,
            max_steps,
            steps: 0,
        }
    }

    /// Unwrap the inner environment
    pub fn into_inner(self) -> E {
        self.env
    }
}

#[async_trait]
impl<E: Environment> Environment for TimeLimit<E> {
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
        self.steps = 0;
        self.env.reset(options).await
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        self.steps += 1;
        let mut step = self.env.step(action).await?;

        if self.steps >= self.max_steps && !step.done {
            step.truncated = true;
            step.done = true;
            step.info
                .insert("TimeLimit.truncated", serde_json::Value::Bool(true));
        }

        Ok(step)
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        self.env.render(mode).await
    }

    async fn close(&mut self) -> Result<()> {
        self.env.close().await
    }
}

/// Rejects `step` calls made before the first `reset`
pub struct OrderEnforcing<E> {
    /// Inner environment
    pub env: E,
    has_reset: bool,
}

impl<E> OrderEnforcing<E> {
    /// Create a new order-enforcing wrapper
    pub fn new(env: E) -> Self {
        Self {
            env,
            has_reset: false,
        }
    }

    /// Unwrap the inner environment
    pub fn into_inner(self) -> E {
        self.env
    }
}

#[async_trait]
impl<E: Environment> Environment for OrderEnforcing<E> {
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
        self.has_reset = true;
        self.env.reset(options).await
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        if !self.has_reset {
            return Err(GymError::ResetNeeded);
        }
        self.env.step(action).await
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        self.env.render(mode).await
    }

    async fn close(&mut self) -> Result<()> {
        self.env.close().await
    }
}

/// Clips box actions into the action-space bounds before stepping
pub struct ClipAction<E> {
    /// Inner environment
    pub env: E,
}

impl<E> ClipAction<E> {
    /// Create a new action-clipping wrapper
    pub fn new(env: E) -> Self {
        Self { env }
    }

    /// Unwrap the inner environment
    pub fn into_inner(self) -> E {
        self.env
    }
}

#[async_trait]
impl<E: Environment> Environment for ClipAction<E> {
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
        self.env.reset(options).await
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        if let (Space::Box { low, high }, Sample::Box(arr)) =
            (self.env.action_space(), action)
        {
            if arr.shape() == low.shape() {
                let clipped: Vec<f64> = arr
                    .iter()
                    .zip(low.iter())
                    .zip(high.iter())
                    .map(|((&x, &l), &h)| x.clamp(l, h))
                    .collect();
                let clipped = Sample::Box(
                    ArrayD::from_shape_vec(arr.raw_dim(), clipped).unwrap(),
                );
                return self.env.step(&clipped).await;
            }
        }
        self.env.step(action).await
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        self.env.render(mode).await
    }

    async fn close(&mut self) -> Result<()> {
        self.env.close().await
    }
}

/// Flattens observations into 1-D box samples
pub struct FlattenObservation<E> {
    /// Inner environment
    pub env: E,
}

impl<E: Environment> FlattenObservation<E> {
    /// Create a new observation-flattening wrapper
    pub fn new(env: E) -> Self {
        Self { env }
    }

    /// Unwrap the inner environment
    pub fn into_inner(self) -> E {
        self.env
    }

    fn flatten(&self, obs: &Sample) -> Result<Sample> {
        Ok(Sample::from_vec(
            self.env.observation_space().flatten(obs)?,
        ))
    }
}

#[async_trait]
impl<E: Environment> Environment for FlattenObservation<E> {
    fn observation_space(&self) -> Space {
        self.env.observation_space().flatten_space()
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
        let (obs, info) = self.env.reset(options).await?;
        Ok((self.flatten(&obs)?, info))
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        let mut step = self.env.step(action).await?;
        step.observation = self.flatten(&step.observation)?;
        Ok(step)
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        self.env.render(mode).await
    }

    async fn close(&mut self) -> Result<()> {
        self.env.close().await
    }
}

/// Applies a closure to every reward
pub struct TransformReward<E, F> {
    /// Inner environment
    pub env: E,
    /// Reward transformation
    pub reward_fn: F,
}

impl<E, F> TransformReward<E, F> {
    /// Create a new reward-transforming wrapper
    pub fn new(env: E, reward_fn: F) -> Self {
        Self { env, reward_fn }
    }
}

#[async_trait]
impl<E, F> Environment for TransformReward<E, F>
where
    E: Environment,
    F: Fn(Reward) -> Reward + Send + Sync,
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
        self.env.reset(options).await
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        let mut step = self.env.step(action).await?;
        step.reward = (self.reward_fn)(step.reward);
        Ok(step)
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        self.env.render(mode).await
    }

    async fn close(&mut self) -> Result<()> {
        self.env.close().await
    }
}

/// Records per-episode return and length statistics
///
/// When an episode ends the final step's info gains an `episode` entry with
/// `r` (return), `l` (length) and `t` (seconds since wrapper creation), and
/// the totals are pushed onto bounded recent-history queues.
pub struct RecordEpisodeStatistics<E> {
    /// Inner environment
    pub env: E,
    t0: Instant,
    episode_return: f64,
    episode_length: usize,
    return_queue: VecDeque<f64>,
    length_queue: VecDeque<usize>,
    deque_size: usize,
}

impl<E> RecordEpisodeStatistics<E> {
    /// Create a new statistics wrapper keeping the last `deque_size` episodes
    pub fn new(env: E, deque_size: usize) -> Self {
        Self {
            env,
            t0: Instant::now(),
            episode_return: 0.0,
            episode_length: 0,
            return_queue: VecDeque::with_capacity(deque_size),
            length_queue: VecDeque::with_capacity(deque_size),
            deque_size,
        }
    }

    /// Returns of recently finished episodes, oldest first
    #[must_use]
    pub fn return_queue(&self) -> &VecDeque<f64> {
        &self.return_queue
    }

    /// Lengths of recently finished episodes, oldest first
    #[must_use]
    pub fn length_queue(&self) -> &VecDeque<usize> {
        &self.length_queue
    }
}

#[async_trait]
impl<E: Environment> Environment for RecordEpisodeStatistics<E> {
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
        self.episode_return = 0.0;
        self.episode_length = 0;
        self.env.reset(options).await
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        let mut step = self.env.step(action).await?;
        self.episode_return += step.reward.value();
        self.episode_length += 1;

        if step.done || step.truncated {
            step.info.insert(
                "episode",
                serde_json::json!({
                    "r": self.episode_return,
                    "l": self.episode_length,
                    "t": self.t0.elapsed().as_secs_f64(),
                }),
            );
            if self.return_queue.len() == self.deque_size {
                self.return_queue.pop_front();
                self.length_queue.pop_front();
            }
            self.return_queue.push_back(self.episode_return);
            self.length_queue.push_back(self.episode_length);
            self.episode_return = 0.0;
            self.episode_length = 0;
        }

        Ok(step)
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        self.env.render(mode).await
    }

    async fn close(&mut self) -> Result<()> {
        self.env.close().await
    }
}

/// Stacks the last `n` box observations along a new leading axis
pub struct FrameStack<E> {
    /// Inner environment
    pub env: E,
    /// Number of frames to stack
    pub n_frames: usize,
    frames: VecDeque<Sample>,
}

impl<E> FrameStack<E> {
    /// Create a new frame-stacking wrapper
    pub fn new(env: E, n_frames: usize) -> Self {
        Self {
            env,
            n_frames,
            frames: VecDeque::with_capacity(n_frames),
        }
    }

    fn stacked(&self) -> Result<Sample> {
        let mut data = Vec::new();
        let mut inner_shape: Option<Vec<usize>> = None;
        for frame in &self.frames {
            let arr = frame.as_box().ok_or_else(|| {
                GymError::Environment("FrameStack requires box observations".to_string())
            })?;
            inner_shape.get_or_insert_with(|| arr.shape().to_vec());
            data.extend(arr.iter().copied());
        }
        let mut shape = vec![self.frames.len()];
        shape.extend(inner_shape.unwrap_or_default());
        ArrayD::from_shape_vec(IxDyn(&shape), data)
            .map(Sample::Box)
            .map_err(|e| GymError::Environment(e.to_string()))
    }
}

fn stack_space(space: &Space, n: usize) -> Space {
    match space {
        Space::Box { low, high } => {
            let mut shape = vec![n];
            shape.extend(low.shape());
            let rep = |bounds: &ArrayD<f64>| {
                let data: Vec<f64> = std::iter::repeat(bounds.iter().copied())
                    .take(n)
                    .flatten()
                    .collect();
                ArrayD::from_shape_vec(IxDyn(&shape), data).unwrap()
            };
            Space::Box {
                low: rep(low),
                high: rep(high),
            }
        }
        other => other.clone(),
    }
}

#[async_trait]
impl<E: Environment> Environment for FrameStack<E> {
    fn observation_space(&self) -> Space {
        stack_space(&self.env.observation_space(), self.n_frames)
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
        let (obs, info) = self.env.reset(options).await?;
        self.frames.clear();
        for _ in 0..self.n_frames {
            self.frames.push_back(obs.clone());
        }
        Ok((self.stacked()?, info))
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        let mut step = self.env.step(action).await?;
        self.frames.pop_front();
        self.frames.push_back(step.observation);
        step.observation = self.stacked()?;
        Ok(step)
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        self.env.render(mode).await
    }

    async fn close(&mut self) -> Result<()> {
        self.env.close().await
    }
}

/// Normalizes box observations with running mean/std estimates
pub struct NormalizeObservation<E> {
    /// Inner environment
    pub env: E,
    mean: Vec<f64>,
    std: Vec<f64>,
    /// Whether statistics keep updating
    pub update_stats: bool,
    /// Clip range applied after normalization
    pub clip_range: Option<(f64, f64)>,
}

impl<E> NormalizeObservation<E> {
    /// Create a new normalization wrapper for `obs_dim`-element observations
    pub fn new(env: E, obs_dim: usize) -> Self {
        Self {
            env,
            mean: vec![0.0; obs_dim],
            std: vec![1.0; obs_dim],
            update_stats: true,
            clip_range: Some((-5.0, 5.0)),
        }
    }

    fn update(&mut self, obs: &[f64]) {
        if !self.update_stats || obs.len() != self.mean.len() {
            return;
        }
        // Exponential moving estimates
        for i in 0..obs.len() {
            let delta = obs[i] - self.mean[i];
            self.mean[i] += delta * 0.01;
            self.std[i] = (self.std[i].powi(2) * 0.99 + delta.powi(2) * 0.01).sqrt();
        }
    }

    fn normalize(&self, obs: &[f64]) -> Vec<f64> {
        obs.iter()
            .enumerate()
            .map(|(i, &x)| {
                let z = (x - self.mean[i]) / (self.std[i] + 1e-8);
                match self.clip_range {
                    Some((min, max)) => z.clamp(min, max),
                    None => z,
                }
            })
            .collect()
    }

    fn transform(&mut self, obs: Sample) -> Sample {
        match obs {
            Sample::Box(arr) => {
                let flat: Vec<f64> = arr.iter().copied().collect();
                if flat.len() != self.mean.len() {
                    return Sample::Box(arr);
                }
                self.update(&flat);
                let normalized = self.normalize(&flat);
                Sample::Box(ArrayD::from_shape_vec(arr.raw_dim(), normalized).unwrap())
            }
            other => other,
        }
    }
}

#[async_trait]
impl<E: Environment> Environment for NormalizeObservation<E> {
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
        let (obs, info) = self.env.reset(options).await?;
        Ok((self.transform(obs), info))
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        let mut step = self.env.step(action).await?;
        step.observation = self.transform(step.observation);
        Ok(step)
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        self.env.render(mode).await
    }

    async fn close(&mut self) -> Result<()> {
        self.env.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classic::{CartPoleEnv, MountainCarContinuousEnv, PendulumEnv};
    use approx::assert_relative_eq;
    use gymkit_core::EnvironmentConfig;

    #[tokio::test]
    async fn test_time_limit_truncates() {
        let env = PendulumEnv::new(EnvironmentConfig::default()).unwrap();
        let mut env = TimeLimit::new(env, 5);
        env.reset(ResetOptions::with_seed(0)).await.unwrap();
        for i in 1..=5 {
            let step = env.step(&Sample::from_vec(vec![0.0])).await.unwrap();
            if i < 5 {
                assert!(!step.done);
            } else {
                assert!(step.done);
                assert!(step.truncated);
                assert_eq!(
                    step.info.get("TimeLimit.truncated"),
                    Some(&serde_json::Value::Bool(true))
                );
            }
        }
        // Counter restarts with the episode
        env.reset(ResetOptions::default()).await.unwrap();
        let step = env.step(&Sample::from_vec(vec![0.0])).await.unwrap();
        assert!(!step.done);
    }

    #[tokio::test]
    async fn test_order_enforcing_rejects_early_step() {
        let env = CartPoleEnv::new(EnvironmentConfig::default()).unwrap();
        let mut env = OrderEnforcing::new(env);
        let err = env.step(&Sample::Discrete(0)).await.unwrap_err();
        assert!(matches!(err, GymError::ResetNeeded));
        env.reset(ResetOptions::default()).await.unwrap();
        assert!(env.step(&Sample::Discrete(0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_clip_action_matches_manual_clipping() {
        let seed = 0;
        let mut plain = MountainCarContinuousEnv::new(EnvironmentConfig::default()).unwrap();
        let mut wrapped = ClipAction::new(
            MountainCarContinuousEnv::new(EnvironmentConfig::default()).unwrap(),
        );
        plain.reset(ResetOptions::with_seed(seed)).await.unwrap();
        wrapped.reset(ResetOptions::with_seed(seed)).await.unwrap();

        for raw in [0.4f64, 1.2, -0.3, 0.0, -2.5] {
            let clipped = raw.clamp(-1.0, 1.0);
            let s1 = plain.step(&Sample::from_vec(vec![clipped])).await.unwrap();
            let s2 = wrapped.step(&Sample::from_vec(vec![raw])).await.unwrap();
            assert_relative_eq!(s1.reward.value(), s2.reward.value());
            assert_eq!(s1.observation, s2.observation);
            assert_eq!(s1.done, s2.done);
            assert_eq!(s1.truncated, s2.truncated);
        }
    }

    #[tokio::test]
    async fn test_flatten_observation_space_and_obs() {
        let env = CartPoleEnv::new(EnvironmentConfig::default()).unwrap();
        let mut env = FlattenObservation::new(env);
        assert_eq!(env.observation_space().shape(), Some(vec![4]));
        let (obs, _) = env.reset(ResetOptions::with_seed(0)).await.unwrap();
        assert_eq!(obs.as_box().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_transform_reward() {
        let env = CartPoleEnv::new(EnvironmentConfig::default()).unwrap();
        let mut env = TransformReward::new(env, |r: Reward| r * 2.0);
        env.reset(ResetOptions::with_seed(0)).await.unwrap();
        let step = env.step(&Sample::Discrete(0)).await.unwrap();
        assert_eq!(step.reward.value(), 2.0);
    }

    #[tokio::test]
    async fn test_record_episode_statistics() {
        let env = CartPoleEnv::new(EnvironmentConfig::default()).unwrap();
        let env = TimeLimit::new(env, 8);
        let mut env = RecordEpisodeStatistics::new(env, 100);

        for _ in 0..2 {
            env.reset(ResetOptions::with_seed(0)).await.unwrap();
            loop {
                let step = env.step(&Sample::Discrete(1)).await.unwrap();
                if step.done {
                    let episode = step.info.get("episode").expect("episode stats");
                    assert!(episode["r"].as_f64().is_some());
                    assert!(episode["l"].as_u64().unwrap() >= 1);
                    break;
                }
                assert!(step.info.get("episode").is_none());
            }
        }
        assert_eq!(env.return_queue().len(), 2);
        assert_eq!(env.length_queue().len(), 2);
    }

    #[tokio::test]
    async fn test_frame_stack_shapes() {
        let env = CartPoleEnv::new(EnvironmentConfig::default()).unwrap();
        let mut env = FrameStack::new(env, 3);
        assert_eq!(env.observation_space().shape(), Some(vec![3, 4]));

        let (obs, _) = env.reset(ResetOptions::with_seed(0)).await.unwrap();
        let arr = obs.as_box().unwrap();
        assert_eq!(arr.shape(), &[3, 4]);
        // All stacked frames equal the reset observation
        let first: Vec<f64> = arr.iter().take(4).copied().collect();
        let last: Vec<f64> = arr.iter().skip(8).copied().collect();
        assert_eq!(first, last);

        let step = env.step(&Sample::Discrete(0)).await.unwrap();
        assert_eq!(step.observation.as_box().unwrap().shape(), &[3, 4]);
    }

    #[tokio::test]
    async fn test_normalize_observation_clips() {
        let env = CartPoleEnv::new(EnvironmentConfig::default()).unwrap();
        let mut env = NormalizeObservation::new(env, 4);
        let (obs, _) = env.reset(ResetOptions::with_seed(0)).await.unwrap();
        for x in obs.as_box().unwrap() {
            assert!(*x >= -5.0 && *x <= 5.0);
        }
    }
}
