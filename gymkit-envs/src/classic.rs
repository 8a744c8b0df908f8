//! Classic control environments

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;

use gymkit_core::{
    rng_from_seed, EnvMetadata, Environment, EnvironmentConfig, GymError, RenderFrame,
    ResetOptions, Result, Reward, Sample, Space, Step, StepInfo,
};

fn param_f64(config: &EnvironmentConfig, key: &str) -> Option<f64> {
    config.params.get(key).and_then(serde_json::Value::as_f64)
}

fn discrete_action(action: &Sample, n: usize) -> Result<usize> {
    match action.as_discrete() {
        Some(a) if a < n => Ok(a),
        _ => Err(GymError::InvalidAction(format!(
            "expected discrete action in 0..{n}, got {action:?}"
        ))),
    }
}

fn box1_action(action: &Sample) -> Result<f64> {
    action
        .as_box()
        .and_then(|arr| arr.iter().next().copied())
        .ok_or_else(|| {
            GymError::InvalidAction(format!("expected 1-dimensional box action, got {action:?}"))
        })
}

/// Cart-pole balancing task
///
/// A pole is attached to a cart moving on a frictionless track. Pushing the
/// cart left or right earns +1 per step until the pole falls past ~12
/// degrees or the cart leaves the track.
pub struct CartPoleEnv {
    state: CartPoleState,
    config: CartPoleConfig,
    rng: StdRng,
    steps_beyond_done: Option<usize>,
}

#[derive(Debug, Clone, Default)]
struct CartPoleState {
    x: f64,
    x_dot: f64,
    theta: f64,
    theta_dot: f64,
}

#[derive(Debug, Clone)]
struct CartPoleConfig {
    gravity: f64,
    mass_cart: f64,
    mass_pole: f64,
    length: f64,
    force_mag: f64,
    tau: f64,
    x_threshold: f64,
    theta_threshold: f64,
}

impl Default for CartPoleConfig {
    fn default() -> Self {
        Self {
            gravity: 9.8,
            mass_cart: 1.0,
            mass_pole: 0.1,
            length: 0.5,
            force_mag: 10.0,
            tau: 0.02,
            x_threshold: 2.4,
            theta_threshold: 12.0 * 2.0 * std::f64::consts::PI / 360.0,
        }
    }
}

impl CartPoleEnv {
    /// Create a new cart-pole environment
    pub fn new(config: EnvironmentConfig) -> Result<Self> {
        let mut physics = CartPoleConfig::default();
        if let Some(g) = param_f64(&config, "gravity") {
            physics.gravity = g;
        }
        if let Some(f) = param_f64(&config, "force_mag") {
            physics.force_mag = f;
        }
        let (rng, _) = rng_from_seed(config.seed);
        Ok(Self {
            state: CartPoleState::default(),
            config: physics,
            rng,
            steps_beyond_done: None,
        })
    }

    fn observation(&self) -> Sample {
        Sample::from_vec(vec![
            self.state.x,
            self.state.x_dot,
            self.state.theta,
            self.state.theta_dot,
        ])
    }

    fn is_done(&self) -> bool {
        self.state.x.abs() > self.config.x_threshold
            || self.state.theta.abs() > self.config.theta_threshold
    }
}

#[async_trait]
impl Environment for CartPoleEnv {
    fn observation_space(&self) -> Space {
        let high = vec![
            self.config.x_threshold * 2.0,
            f64::INFINITY,
            self.config.theta_threshold * 2.0,
            f64::INFINITY,
        ];
        let low = high.iter().map(|&x| -x).collect();
        Space::box1d(low, high).unwrap()
    }

    fn action_space(&self) -> Space {
        Space::discrete(2) // 0: push left, 1: push right
    }

    fn metadata(&self) -> EnvMetadata {
        EnvMetadata::with_render_modes(&["ansi"])
    }

    async fn reset(&mut self, options: ResetOptions) -> Result<(Sample, StepInfo)> {
        if let Some(seed) = options.seed {
            (self.rng, _) = rng_from_seed(Some(seed));
        }
        self.state = CartPoleState {
            x: self.rng.gen_range(-0.05..0.05),
            x_dot: self.rng.gen_range(-0.05..0.05),
            theta: self.rng.gen_range(-0.05..0.05),
            theta_dot: self.rng.gen_range(-0.05..0.05),
        };
        self.steps_beyond_done = None;
        Ok((self.observation(), StepInfo::default()))
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        let action = discrete_action(action, 2)?;
        let force = if action == 1 {
            self.config.force_mag
        } else {
            -self.config.force_mag
        };

        let cos_theta = self.state.theta.cos();
        let sin_theta = self.state.theta.sin();

        let total_mass = self.config.mass_cart + self.config.mass_pole;
        let pole_mass_length = self.config.mass_pole * self.config.length;

        let temp =
            (force + pole_mass_length * self.state.theta_dot.powi(2) * sin_theta) / total_mass;
        let theta_acc = (self.config.gravity * sin_theta - cos_theta * temp)
            / (self.config.length
                * (4.0 / 3.0 - self.config.mass_pole * cos_theta.powi(2) / total_mass));
        let x_acc = temp - pole_mass_length * theta_acc * cos_theta / total_mass;

        // Euler integration
        self.state.x += self.config.tau * self.state.x_dot;
        self.state.x_dot += self.config.tau * x_acc;
        self.state.theta += self.config.tau * self.state.theta_dot;
        self.state.theta_dot += self.config.tau * theta_acc;

        let done = self.is_done();
        let reward = if !done {
            1.0
        } else if self.steps_beyond_done.is_none() {
            // The step that crosses the threshold still pays out
            self.steps_beyond_done = Some(0);
            1.0
        } else {
            let n = self.steps_beyond_done.unwrap() + 1;
            self.steps_beyond_done = Some(n);
            if n == 1 {
                tracing::warn!(
                    "calling step() after the episode terminated; call reset() instead"
                );
            }
            0.0
        };

        Ok(Step {
            observation: self.observation(),
            reward: Reward(reward),
            done,
            truncated: false,
            info: StepInfo::default(),
        })
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        match mode {
            "ansi" => Ok(RenderFrame::Ansi(format!(
                "x={:+.3} x_dot={:+.3} theta={:+.3} theta_dot={:+.3}",
                self.state.x, self.state.x_dot, self.state.theta, self.state.theta_dot
            ))),
            "None" => Ok(RenderFrame::None),
            _ => Err(GymError::InvalidRenderMode {
                mode: mode.to_string(),
                valid_modes: self.metadata().valid_modes(),
            }),
        }
    }
}

/// Mountain-car task with three discrete throttle actions
pub struct MountainCarEnv {
    position: f64,
    velocity: f64,
    config: MountainCarConfig,
    rng: StdRng,
}

#[derive(Debug, Clone)]
struct MountainCarConfig {
    min_position: f64,
    max_position: f64,
    max_speed: f64,
    goal_position: f64,
    goal_velocity: f64,
    force: f64,
    gravity: f64,
}

impl Default for MountainCarConfig {
    fn default() -> Self {
        Self {
            min_position: -1.2,
            max_position: 0.6,
            max_speed: 0.07,
            goal_position: 0.5,
            goal_velocity: 0.0,
            force: 0.001,
            gravity: 0.0025,
        }
    }
}

impl MountainCarEnv {
    /// Create a new mountain-car environment
    pub fn new(config: EnvironmentConfig) -> Result<Self> {
        let mut physics = MountainCarConfig::default();
        if let Some(v) = param_f64(&config, "goal_velocity") {
            physics.goal_velocity = v;
        }
        let (rng, _) = rng_from_seed(config.seed);
        Ok(Self {
            position: -0.5,
            velocity: 0.0,
            config: physics,
            rng,
        })
    }

    fn observation(&self) -> Sample {
        Sample::from_vec(vec![self.position, self.velocity])
    }
}

#[async_trait]
impl Environment for MountainCarEnv {
    fn observation_space(&self) -> Space {
        Space::box1d(
            vec![self.config.min_position, -self.config.max_speed],
            vec![self.config.max_position, self.config.max_speed],
        )
        .unwrap()
    }

    fn action_space(&self) -> Space {
        Space::discrete(3) // 0: push left, 1: no push, 2: push right
    }

    fn metadata(&self) -> EnvMetadata {
        EnvMetadata::with_render_modes(&["ansi"])
    }

    async fn reset(&mut self, options: ResetOptions) -> Result<(Sample, StepInfo)> {
        if let Some(seed) = options.seed {
            (self.rng, _) = rng_from_seed(Some(seed));
        }
        self.position = self.rng.gen_range(-0.6..-0.4);
        self.velocity = 0.0;
        Ok((self.observation(), StepInfo::default()))
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        let action = discrete_action(action, 3)?;
        let force = (action as f64) - 1.0;

        self.velocity += force * self.config.force
            + (3.0 * self.position).cos() * (-self.config.gravity);
        self.velocity = self
            .velocity
            .clamp(-self.config.max_speed, self.config.max_speed);

        self.position += self.velocity;
        self.position = self
            .position
            .clamp(self.config.min_position, self.config.max_position);
        if self.position <= self.config.min_position && self.velocity < 0.0 {
            self.velocity = 0.0;
        }

        let done = self.position >= self.config.goal_position
            && self.velocity >= self.config.goal_velocity;

        Ok(Step {
            observation: self.observation(),
            reward: Reward(-1.0),
            done,
            truncated: false,
            info: StepInfo::default(),
        })
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        match mode {
            "ansi" => Ok(RenderFrame::Ansi(format!(
                "position={:+.3} velocity={:+.4}",
                self.position, self.velocity
            ))),
            "None" => Ok(RenderFrame::None),
            _ => Err(GymError::InvalidRenderMode {
                mode: mode.to_string(),
                valid_modes: self.metadata().valid_modes(),
            }),
        }
    }
}

/// Mountain-car task with a continuous throttle in `[-1, 1]`
pub struct MountainCarContinuousEnv {
    position: f64,
    velocity: f64,
    config: MountainCarContinuousConfig,
    rng: StdRng,
}

#[derive(Debug, Clone)]
struct MountainCarContinuousConfig {
    min_position: f64,
    max_position: f64,
    max_speed: f64,
    goal_position: f64,
    goal_velocity: f64,
    power: f64,
}

impl Default for MountainCarContinuousConfig {
    fn default() -> Self {
        Self {
            min_position: -1.2,
            max_position: 0.6,
            max_speed: 0.07,
            goal_position: 0.45,
            goal_velocity: 0.0,
            power: 0.0015,
        }
    }
}

impl MountainCarContinuousEnv {
    /// Create a new continuous mountain-car environment
    pub fn new(config: EnvironmentConfig) -> Result<Self> {
        let mut physics = MountainCarContinuousConfig::default();
        if let Some(v) = param_f64(&config, "goal_velocity") {
            physics.goal_velocity = v;
        }
        let (rng, _) = rng_from_seed(config.seed);
        Ok(Self {
            position: -0.5,
            velocity: 0.0,
            config: physics,
            rng,
        })
    }

    fn observation(&self) -> Sample {
        Sample::from_vec(vec![self.position, self.velocity])
    }
}

#[async_trait]
impl Environment for MountainCarContinuousEnv {
    fn observation_space(&self) -> Space {
        Space::box1d(
            vec![self.config.min_position, -self.config.max_speed],
            vec![self.config.max_position, self.config.max_speed],
        )
        .unwrap()
    }

    fn action_space(&self) -> Space {
        Space::box1d(vec![-1.0], vec![1.0]).unwrap()
    }

    fn metadata(&self) -> EnvMetadata {
        EnvMetadata::with_render_modes(&["ansi"])
    }

    async fn reset(&mut self, options: ResetOptions) -> Result<(Sample, StepInfo)> {
        if let Some(seed) = options.seed {
            (self.rng, _) = rng_from_seed(Some(seed));
        }
        self.position = self.rng.gen_range(-0.6..-0.4);
        self.velocity = 0.0;
        Ok((self.observation(), StepInfo::default()))
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        let force = box1_action(action)?.clamp(-1.0, 1.0);

        self.velocity +=
            force * self.config.power - 0.0025 * (3.0 * self.position).cos();
        self.velocity = self
            .velocity
            .clamp(-self.config.max_speed, self.config.max_speed);

        self.position += self.velocity;
        self.position = self
            .position
            .clamp(self.config.min_position, self.config.max_position);
        if self.position <= self.config.min_position && self.velocity < 0.0 {
            self.velocity = 0.0;
        }

        let done = self.position >= self.config.goal_position
            && self.velocity >= self.config.goal_velocity;

        let mut reward = -force.powi(2) * 0.1;
        if done {
            reward += 100.0;
        }

        Ok(Step {
            observation: self.observation(),
            reward: Reward(reward),
            done,
            truncated: false,
            info: StepInfo::default(),
        })
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        match mode {
            "ansi" => Ok(RenderFrame::Ansi(format!(
                "position={:+.3} velocity={:+.4}",
                self.position, self.velocity
            ))),
            "None" => Ok(RenderFrame::None),
            _ => Err(GymError::InvalidRenderMode {
                mode: mode.to_string(),
                valid_modes: self.metadata().valid_modes(),
            }),
        }
    }
}

/// Inverted pendulum swing-up with a continuous torque action
///
/// The episode never terminates on its own; the registry applies a time
/// limit.
pub struct PendulumEnv {
    theta: f64,
    theta_dot: f64,
    config: PendulumConfig,
    rng: StdRng,
}

#[derive(Debug, Clone)]
struct PendulumConfig {
    max_speed: f64,
    max_torque: f64,
    dt: f64,
    gravity: f64,
    mass: f64,
    length: f64,
}

impl Default for PendulumConfig {
    fn default() -> Self {
        Self {
            max_speed: 8.0,
            max_torque: 2.0,
            dt: 0.05,
            gravity: 10.0,
            mass: 1.0,
            length: 1.0,
        }
    }
}

fn angle_normalize(x: f64) -> f64 {
    use std::f64::consts::PI;
    (x + PI).rem_euclid(2.0 * PI) - PI
}

impl PendulumEnv {
    /// Create a new pendulum environment
    pub fn new(config: EnvironmentConfig) -> Result<Self> {
        let mut physics = PendulumConfig::default();
        if let Some(g) = param_f64(&config, "g") {
            physics.gravity = g;
        }
        let (rng, _) = rng_from_seed(config.seed);
        Ok(Self {
            theta: 0.0,
            theta_dot: 0.0,
            config: physics,
            rng,
        })
    }

    /// Gravity in effect, after any `g` override
    #[must_use]
    pub fn gravity(&self) -> f64 {
        self.config.gravity
    }

    fn observation(&self) -> Sample {
        Sample::from_vec(vec![self.theta.cos(), self.theta.sin(), self.theta_dot])
    }
}

#[async_trait]
impl Environment for PendulumEnv {
    fn observation_space(&self) -> Space {
        Space::box1d(
            vec![-1.0, -1.0, -self.config.max_speed],
            vec![1.0, 1.0, self.config.max_speed],
        )
        .unwrap()
    }

    fn action_space(&self) -> Space {
        Space::box1d(vec![-self.config.max_torque], vec![self.config.max_torque]).unwrap()
    }

    fn metadata(&self) -> EnvMetadata {
        EnvMetadata::with_render_modes(&["ansi"])
    }

    async fn reset(&mut self, options: ResetOptions) -> Result<(Sample, StepInfo)> {
        if let Some(seed) = options.seed {
            (self.rng, _) = rng_from_seed(Some(seed));
        }
        self.theta = self.rng.gen_range(-std::f64::consts::PI..std::f64::consts::PI);
        self.theta_dot = self.rng.gen_range(-1.0..1.0);
        Ok((self.observation(), StepInfo::default()))
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        let u = box1_action(action)?.clamp(-self.config.max_torque, self.config.max_torque);
        let PendulumConfig {
            max_speed,
            dt,
            gravity: g,
            mass: m,
            length: l,
            ..
        } = self.config;

        let costs = angle_normalize(self.theta).powi(2)
            + 0.1 * self.theta_dot.powi(2)
            + 0.001 * u.powi(2);

        self.theta_dot += (3.0 * g / (2.0 * l) * self.theta.sin()
            + 3.0 / (m * l.powi(2)) * u)
            * dt;
        self.theta_dot = self.theta_dot.clamp(-max_speed, max_speed);
        self.theta += self.theta_dot * dt;

        Ok(Step {
            observation: self.observation(),
            reward: Reward(-costs),
            done: false,
            truncated: false,
            info: StepInfo::default(),
        })
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        match mode {
            "ansi" => Ok(RenderFrame::Ansi(format!(
                "theta={:+.3} theta_dot={:+.3}",
                angle_normalize(self.theta),
                self.theta_dot
            ))),
            "None" => Ok(RenderFrame::None),
            _ => Err(GymError::InvalidRenderMode {
                mode: mode.to_string(),
                valid_modes: self.metadata().valid_modes(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[tokio::test]
    async fn test_cartpole_seeded_reset_is_deterministic() {
        let mut a = CartPoleEnv::new(EnvironmentConfig::default()).unwrap();
        let mut b = CartPoleEnv::new(EnvironmentConfig::default()).unwrap();
        let (oa, _) = a.reset(ResetOptions::with_seed(3)).await.unwrap();
        let (ob, _) = b.reset(ResetOptions::with_seed(3)).await.unwrap();
        assert_eq!(oa, ob);
        assert!(a.observation_space().contains(&oa));
    }

    #[tokio::test]
    async fn test_cartpole_episode_terminates() {
        let mut env = CartPoleEnv::new(EnvironmentConfig::default()).unwrap();
        env.reset(ResetOptions::with_seed(0)).await.unwrap();
        // Constantly pushing right tips the pole over well within 500 steps
        let mut terminated = false;
        for _ in 0..500 {
            let step = env.step(&Sample::Discrete(1)).await.unwrap();
            assert_eq!(step.reward.value(), 1.0);
            if step.done {
                terminated = true;
                break;
            }
        }
        assert!(terminated);
    }

    #[tokio::test]
    async fn test_cartpole_rejects_out_of_range_action() {
        let mut env = CartPoleEnv::new(EnvironmentConfig::default()).unwrap();
        env.reset(ResetOptions::default()).await.unwrap();
        let err = env.step(&Sample::Discrete(2)).await.unwrap_err();
        assert!(matches!(err, GymError::InvalidAction(_)));
    }

    #[tokio::test]
    async fn test_mountain_car_reward_and_bounds() {
        let mut env = MountainCarEnv::new(EnvironmentConfig::default()).unwrap();
        let (obs, _) = env.reset(ResetOptions::with_seed(1)).await.unwrap();
        let arr = obs.as_box().unwrap();
        assert!(arr[0] >= -0.6 && arr[0] <= -0.4);
        let step = env.step(&Sample::Discrete(2)).await.unwrap();
        assert_eq!(step.reward.value(), -1.0);
        assert!(env.observation_space().contains(&step.observation));
    }

    #[tokio::test]
    async fn test_continuous_mountain_car_action_cost() {
        let mut env = MountainCarContinuousEnv::new(EnvironmentConfig::default()).unwrap();
        env.reset(ResetOptions::with_seed(1)).await.unwrap();
        let step = env.step(&Sample::from_vec(vec![0.5])).await.unwrap();
        assert_relative_eq!(step.reward.value(), -0.1 * 0.25, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn test_pendulum_never_terminates() {
        let mut env = PendulumEnv::new(EnvironmentConfig::default()).unwrap();
        env.reset(ResetOptions::with_seed(5)).await.unwrap();
        for _ in 0..50 {
            let step = env.step(&Sample::from_vec(vec![1.0])).await.unwrap();
            assert!(!step.done);
            assert!(step.reward.value() <= 0.0);
            assert!(env.observation_space().contains(&step.observation));
        }
    }

    #[tokio::test]
    async fn test_pendulum_gravity_override() {
        let mut config = EnvironmentConfig::default();
        config
            .params
            .insert("g".to_string(), serde_json::json!(9.81));
        let env = PendulumEnv::new(config).unwrap();
        assert_relative_eq!(env.gravity(), 9.81);
    }

    #[tokio::test]
    async fn test_ansi_render() {
        let mut env = CartPoleEnv::new(EnvironmentConfig::default()).unwrap();
        env.reset(ResetOptions::default()).await.unwrap();
        match env.render("ansi").await.unwrap() {
            RenderFrame::Ansi(text) => assert!(text.contains("theta=")),
            other => panic!("expected text rendering, got {other:?}"),
        }
        assert!(matches!(
            env.render("None").await.unwrap(),
            RenderFrame::None
        ));
        assert!(env.render("human").await.is_err());
    }
}
