//! Example: random policy playing CartPole through the registry

use rand::SeedableRng;

use gymkit_envs::prelude::*;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // CartPole-v1 comes time-limited and order-enforced out of the registry
    let mut env = make_env("CartPole-v1", EnvironmentConfig::default())?;
    let action_space = env.action_space();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);

    // Run episodes
    let num_episodes = 10;
    let mut episode_rewards = Vec::new();

    for episode in 0..num_episodes {
        env.reset(ResetOptions::default()).await?;
        let mut total_reward = 0.0;
        let mut steps = 0;

        loop {
            let action = action_space.sample(&mut rng);
            let step = env.step(&action).await?;
            total_reward += step.reward.value();
            steps += 1;

            if step.done || step.truncated {
                break;
            }
        }

        episode_rewards.push(total_reward);
        println!(
            "Episode {}: Total Reward = {:.2}, Steps = {}",
            episode + 1,
            total_reward,
            steps
        );
    }

    // Print statistics
    let avg_reward: f64 = episode_rewards.iter().sum::<f64>() / episode_rewards.len() as f64;
    println!("\nAverage Reward over {num_episodes} episodes: {avg_reward:.2}");

    env.close().await?;

    Ok(())
}
