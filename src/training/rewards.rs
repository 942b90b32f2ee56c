//! Built-in reward functions for GRPO.

use crate::config::RewardFunc;

/// 1.0 when the completion opens with exactly one `<think>` block that is
/// closed by `</think>`, else 0.0.
pub fn think_format_reward(completion: &str) -> f64 {
    let Some(rest) = completion.strip_prefix("<think>") else {
        return 0.0;
    };
    if !rest.contains("<think>") && rest.contains("</think>") {
        1.0
    } else {
        0.0
    }
}

/// Linear penalty over the last `soft_punish_cache` tokens of the budget:
/// 0 up to `max_completion_len - soft_punish_cache` tokens, falling to -1 at
/// `max_completion_len`, -1 beyond.
pub fn soft_overlong_punishment(completion_len: usize, max_completion_len: usize, soft_punish_cache: usize) -> f64 {
    let threshold = max_completion_len.saturating_sub(soft_punish_cache);
    if completion_len <= threshold {
        0.0
    } else if completion_len <= max_completion_len {
        (threshold as f64 - completion_len as f64) / soft_punish_cache.max(1) as f64
    } else {
        -1.0
    }
}

/// Name used in metric keys, e.g. `rewards/think_format_reward/mean`.
pub fn reward_name(func: RewardFunc) -> &'static str {
    match func {
        RewardFunc::ThinkFormatReward => "think_format_reward",
        RewardFunc::SoftOverlongPunishment => "soft_overlong_punishment",
    }
}

/// Score one completion. The soft overlong window is the last quarter of the
/// generation budget.
pub fn score(func: RewardFunc, completion: &str, completion_len: usize, max_completion_length: usize) -> f64 {
    match func {
        RewardFunc::ThinkFormatReward => think_format_reward(completion),
        RewardFunc::SoftOverlongPunishment => soft_overlong_punishment(
            completion_len,
            max_completion_length,
            (max_completion_length / 4).max(1),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_think_format() {
        assert_eq!(think_format_reward("<think>\nplan\n</think>\nanswer"), 1.0);
        assert_eq!(think_format_reward("<think></think>"), 1.0);
        assert_eq!(think_format_reward("answer <think>x</think>"), 0.0);
        assert_eq!(think_format_reward("<think>a<think>b</think>"), 0.0);
        assert_eq!(think_format_reward("<think>never closed"), 0.0);
    }

    #[test]
    fn test_soft_overlong_punishment() {
        assert_eq!(soft_overlong_punishment(10, 20, 5), 0.0);
        assert_eq!(soft_overlong_punishment(15, 20, 5), 0.0);
        assert!((soft_overlong_punishment(18, 20, 5) + 0.6).abs() < 1e-12);
        assert!((soft_overlong_punishment(20, 20, 5) + 1.0).abs() < 1e-12);
        assert_eq!(soft_overlong_punishment(21, 20, 5), -1.0);
    }

    #[test]
    fn test_score_dispatch() {
        assert_eq!(score(RewardFunc::ThinkFormatReward, "<think>x</think>", 3, 8), 1.0);
        assert_eq!(score(RewardFunc::SoftOverlongPunishment, "", 8, 8), -1.0);
        assert_eq!(score(RewardFunc::SoftOverlongPunishment, "", 6, 8), 0.0);
    }
}
