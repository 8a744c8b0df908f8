//! Batched environment execution on background tasks
//!
//! [`AsyncVectorEnv`] runs N copies of an environment concurrently, one
//! tokio task per copy, and exposes a split async API: `reset_async` /
//! `reset_wait` and `step_async` / `step_wait`, plus combined `reset` and
//! `step` conveniences. Finished sub-episodes reset automatically; the
//! terminal observation is preserved under the `"final_observation"` info
//! key.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use gymkit_core::{
    Environment, GymError, ResetOptions, Result, Reward, Sample, Space, Step, StepInfo,
};

/// One batched step across all sub-environments
#[derive(Debug)]
pub struct VectorStep {
    /// Per-environment observations
    pub observations: Vec<Sample>,
    /// Per-environment rewards
    pub rewards: Vec<Reward>,
    /// Per-environment termination flags
    pub dones: Vec<bool>,
    /// Per-environment truncation flags
    pub truncations: Vec<bool>,
    /// Per-environment info maps
    pub infos: Vec<StepInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsyncState {
    Default,
    WaitingReset,
    WaitingStep,
}

impl AsyncState {
    fn pending_call(self) -> &'static str {
        match self {
            AsyncState::Default => "none",
            AsyncState::WaitingReset => "reset_async",
            AsyncState::WaitingStep => "step_async",
        }
    }
}

enum Command {
    Reset(ResetOptions),
    Step(Sample),
    Close,
}

enum Reply {
    Reset(Result<(Sample, StepInfo)>),
    Step(Result<Step>),
    Closed,
}

struct Worker {
    commands: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

/// Runs multiple copies of an environment concurrently
pub struct AsyncVectorEnv {
    observation_space: Space,
    action_space: Space,
    workers: Vec<Worker>,
    results: mpsc::Receiver<(usize, Reply)>,
    state: AsyncState,
    closed: bool,
}

impl AsyncVectorEnv {
    /// Spawn one worker task per environment
    ///
    /// All environments must share the same observation and action spaces.
    pub fn new(envs: Vec<Box<dyn Environment>>) -> Result<Self> {
        if envs.is_empty() {
            return Err(GymError::Environment(
                "AsyncVectorEnv requires at least one environment".to_string(),
            ));
        }
        let observation_space = envs[0].observation_space();
        let action_space = envs[0].action_space();
        for (index, env) in envs.iter().enumerate().skip(1) {
            if env.observation_space() != observation_space
                || env.action_space() != action_space
            {
                return Err(GymError::Environment(format!(
                    "environment {index} does not share the batch's observation and action spaces"
                )));
            }
        }

        let (result_tx, result_rx) = mpsc::channel(envs.len() * 2);
        let workers = envs
            .into_iter()
            .enumerate()
            .map(|(index, env)| {
                let (command_tx, command_rx) = mpsc::channel(1);
                let handle =
                    tokio::spawn(worker_loop(index, env, command_rx, result_tx.clone()));
                Worker {
                    commands: command_tx,
                    handle,
                }
            })
            .collect();

        Ok(Self {
            observation_space,
            action_space,
            workers,
            results: result_rx,
            state: AsyncState::Default,
            closed: false,
        })
    }

    /// Number of sub-environments
    #[must_use]
    pub fn num_envs(&self) -> usize {
        self.workers.len()
    }

    /// Observation space shared by every sub-environment
    #[must_use]
    pub fn observation_space(&self) -> Space {
        self.observation_space.clone()
    }

    /// Action space shared by every sub-environment
    #[must_use]
    pub fn action_space(&self) -> Space {
        self.action_space.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(closed_error());
        }
        Ok(())
    }

    fn ensure_idle(&self, call: &str) -> Result<()> {
        if self.state != AsyncState::Default {
            return Err(GymError::AlreadyPending(format!(
                "cannot call `{call}` while waiting for a pending `{}`",
                self.state.pending_call()
            )));
        }
        Ok(())
    }

    /// Dispatch a reset to every sub-environment
    ///
    /// A batch seed fans out as `seed + index` (wrapping) so each
    /// sub-environment gets a distinct stream.
    pub async fn reset_async(&mut self, options: ResetOptions) -> Result<()> {
        self.ensure_open()?;
        self.ensure_idle("reset_async")?;
        for (index, worker) in self.workers.iter().enumerate() {
            let mut worker_options = options.clone();
            worker_options.seed = options.seed.map(|s| s.wrapping_add(index as u64));
            worker
                .commands
                .send(Command::Reset(worker_options))
                .await
                .map_err(|_| closed_error())?;
        }
        self.state = AsyncState::WaitingReset;
        Ok(())
    }

    /// Collect the observations from a pending reset
    pub async fn reset_wait(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<(Vec<Sample>, Vec<StepInfo>)> {
        self.ensure_open()?;
        if self.state != AsyncState::WaitingReset {
            return Err(GymError::NoPendingCall(
                "Calling `reset_wait` without any prior call to `reset_async`.".to_string(),
            ));
        }

        // The pending call is consumed even when collection fails, so a
        // timed-out wait can be retried with a fresh dispatch.
        let outcome = self.collect_resets(timeout).await;
        self.state = AsyncState::Default;
        outcome
    }

    async fn collect_resets(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<(Vec<Sample>, Vec<StepInfo>)> {
        let mut observations: Vec<Option<Sample>> = vec![None; self.num_envs()];
        let mut infos: Vec<StepInfo> = vec![StepInfo::default(); self.num_envs()];
        let mut remaining = self.num_envs();
        while remaining > 0 {
            let (index, reply) = self.recv_reply(timeout).await?;
            match reply {
                Reply::Reset(result) => {
                    let (observation, info) = result?;
                    observations[index] = Some(observation);
                    infos[index] = info;
                    remaining -= 1;
                }
                Reply::Step(_) | Reply::Closed => {
                    return Err(GymError::Environment(
                        "unexpected reply while waiting for reset".to_string(),
                    ));
                }
            }
        }

        let observations = observations.into_iter().flatten().collect();
        Ok((observations, infos))
    }

    /// Dispatch one action per sub-environment
    pub async fn step_async(&mut self, actions: &[Sample]) -> Result<()> {
        self.ensure_open()?;
        self.ensure_idle("step_async")?;
        if actions.len() != self.num_envs() {
            return Err(GymError::DimensionMismatch {
                expected: self.num_envs(),
                actual: actions.len(),
            });
        }
        for (worker, action) in self.workers.iter().zip(actions) {
            worker
                .commands
                .send(Command::Step(action.clone()))
                .await
                .map_err(|_| closed_error())?;
        }
        self.state = AsyncState::WaitingStep;
        Ok(())
    }

    /// Collect the results of a pending step
    pub async fn step_wait(&mut self, timeout: Option<Duration>) -> Result<VectorStep> {
        self.ensure_open()?;
        if self.state != AsyncState::WaitingStep {
            return Err(GymError::NoPendingCall(
                "Calling `step_wait` without any prior call to `step_async`.".to_string(),
            ));
        }

        // As with reset_wait, failure still clears the pending call.
        let outcome = self.collect_steps(timeout).await;
        self.state = AsyncState::Default;
        outcome
    }

    async fn collect_steps(&mut self, timeout: Option<Duration>) -> Result<VectorStep> {
        let n = self.num_envs();
        let mut steps: Vec<Option<Step>> = (0..n).map(|_| None).collect();
        let mut remaining = n;
        while remaining > 0 {
            let (index, reply) = self.recv_reply(timeout).await?;
            match reply {
                Reply::Step(result) => {
                    steps[index] = Some(result?);
                    remaining -= 1;
                }
                Reply::Reset(_) | Reply::Closed => {
                    return Err(GymError::Environment(
                        "unexpected reply while waiting for step".to_string(),
                    ));
                }
            }
        }

        let mut batch = VectorStep {
            observations: Vec::with_capacity(n),
            rewards: Vec::with_capacity(n),
            dones: Vec::with_capacity(n),
            truncations: Vec::with_capacity(n),
            infos: Vec::with_capacity(n),
        };
        for step in steps.into_iter().flatten() {
            batch.observations.push(step.observation);
            batch.rewards.push(step.reward);
            batch.dones.push(step.done);
            batch.truncations.push(step.truncated);
            batch.infos.push(step.info);
        }
        Ok(batch)
    }

    /// Reset every sub-environment and wait for the observations
    pub async fn reset(&mut self, options: ResetOptions) -> Result<(Vec<Sample>, Vec<StepInfo>)> {
        self.reset_async(options).await?;
        self.reset_wait(None).await
    }

    /// Step every sub-environment and wait for the results
    pub async fn step(&mut self, actions: &[Sample]) -> Result<VectorStep> {
        self.step_async(actions).await?;
        self.step_wait(None).await
    }

    /// Shut down the workers
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for worker in &self.workers {
            let _ = worker.commands.send(Command::Close).await;
        }
        for worker in &mut self.workers {
            let _ = (&mut worker.handle).await;
        }
        Ok(())
    }

    async fn recv_reply(&mut self, timeout: Option<Duration>) -> Result<(usize, Reply)> {
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.results.recv())
                .await
                .map_err(|_| {
                    GymError::Timeout(format!("The call timed out after {limit:?}."))
                })?,
            None => self.results.recv().await,
        };
        received.ok_or_else(closed_error)
    }
}

impl Drop for AsyncVectorEnv {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.handle.abort();
        }
    }
}

fn closed_error() -> GymError {
    GymError::ClosedEnvironment("AsyncVectorEnv".to_string())
}

async fn worker_loop(
    index: usize,
    mut env: Box<dyn Environment>,
    mut commands: mpsc::Receiver<Command>,
    results: mpsc::Sender<(usize, Reply)>,
) {
    while let Some(command) = commands.recv().await {
        let reply = match command {
            Command::Reset(options) => Reply::Reset(env.reset(options).await),
            Command::Step(action) => Reply::Step(step_with_autoreset(&mut env, &action).await),
            Command::Close => {
                if let Err(error) = env.close().await {
                    tracing::warn!(index, %error, "environment close failed");
                }
                let _ = results.send((index, Reply::Closed)).await;
                return;
            }
        };
        if results.send((index, reply)).await.is_err() {
            return;
        }
    }
}

async fn step_with_autoreset(env: &mut Box<dyn Environment>, action: &Sample) -> Result<Step> {
    let mut step = env.step(action).await?;
    if step.done || step.truncated {
        let final_observation =
            std::mem::replace(&mut step.observation, Sample::Discrete(0));
        step.info
            .insert("final_observation", serde_json::to_value(&final_observation)?);
        let (observation, _) = env.reset(ResetOptions::default()).await?;
        step.observation = observation;
    }
    Ok(step)
}
