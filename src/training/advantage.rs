//! Group-relative advantages and PPO-style ratio clipping.
//!
//! For a group of G completions sampled from the same prompt:
//!
//!   A_i = (R_i - mean(R)) / (std(R) + 1e-4)   (scale_rewards = true)
//!   A_i =  R_i - mean(R)                       (scale_rewards = false)
//!
//! std is the sample standard deviation (N - 1 denominator).

const STD_EPSILON: f64 = 1e-4;

/// Mean and sample standard deviation of a reward group. Groups with fewer
/// than two rewards have a std of 0.
pub fn mean_std(rewards: &[f64]) -> (f64, f64) {
    if rewards.is_empty() {
        return (0.0, 0.0);
    }
    let n = rewards.len() as f64;
    let mean = rewards.iter().sum::<f64>() / n;
    if rewards.len() < 2 {
        return (mean, 0.0);
    }
    let variance = rewards.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

/// Advantages of one group of G rewards. A constant group yields all zeros,
/// scaled or not.
pub fn compute_group_advantages(rewards: &[f64], scale_rewards: bool) -> Vec<f64> {
    let (mean, std) = mean_std(rewards);
    rewards
        .iter()
        .map(|r| if scale_rewards { (r - mean) / (std + STD_EPSILON) } else { r - mean })
        .collect()
}

/// Advantages for consecutive groups of `group_size` rewards.
pub fn compute_grouped_advantages(rewards: &[f64], group_size: usize, scale_rewards: bool) -> Vec<f64> {
    if group_size == 0 {
        return Vec::new();
    }
    rewards
        .chunks(group_size)
        .flat_map(|group| compute_group_advantages(group, scale_rewards))
        .collect()
}

/// Importance sampling ratio between the current and old policies:
///
///   rho = exp(log pi_theta - log pi_old)
pub fn compute_importance_ratio(current_log_prob: f64, old_log_prob: f64) -> f64 {
    (current_log_prob - old_log_prob).exp()
}

/// Clip an importance ratio to `[1 - epsilon_low, 1 + epsilon_high]`.
pub fn clip_ratio(ratio: f64, epsilon_low: f64, epsilon_high: f64) -> f64 {
    ratio.clamp(1.0 - epsilon_low, 1.0 + epsilon_high)
}
