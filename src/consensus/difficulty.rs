// Difficulty retargeting.
//
// The retarget runs before mining: a block's difficulty field must equal the
// value derived from its ancestors, so every node agrees on the expected
// difficulty without a fixed adjustment interval. All math is u128 to keep
// intermediate products away from overflow; every result clamps to >= 1.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::primitives::block::Block;

/// LWMA-3 averaging window.
pub const LWMA_WINDOW: usize = 90;
/// Short window for the fast-reacting variant.
pub const AGGRESSIVE_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyAlgorithm {
    #[default]
    Lwma3,
    Aggressive,
    Dogecoin,
}

impl std::str::FromStr for DifficultyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lwma3" => Ok(DifficultyAlgorithm::Lwma3),
            "aggressive" => Ok(DifficultyAlgorithm::Aggressive),
            "dogecoin" => Ok(DifficultyAlgorithm::Dogecoin),
            other => Err(format!("unknown difficulty algorithm: {other}")),
        }
    }
}

impl std::fmt::Display for DifficultyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyAlgorithm::Lwma3 => write!(f, "lwma3"),
            DifficultyAlgorithm::Aggressive => write!(f, "aggressive"),
            DifficultyAlgorithm::Dogecoin => write!(f, "dogecoin"),
        }
    }
}

/// Difficulty for the block that will extend `blocks` (the current chain,
/// oldest first). With fewer than two blocks there are no solve times yet,
/// so the tip's difficulty carries over.
pub fn next_difficulty(blocks: &[Block], algo: DifficultyAlgorithm, block_time_ms: u64) -> u64 {
    let Some(tip) = blocks.last() else {
        return 1;
    };
    if blocks.len() < 2 {
        return tip.difficulty.max(1);
    }

    match algo {
        DifficultyAlgorithm::Lwma3 => lwma(blocks, LWMA_WINDOW, block_time_ms, 0),
        DifficultyAlgorithm::Aggressive => lwma(blocks, AGGRESSIVE_WINDOW, block_time_ms, 3),
        DifficultyAlgorithm::Dogecoin => per_block_retarget(blocks, block_time_ms),
    }
}

/// Linearly weighted moving average over the last `window` solve times:
/// recent blocks weigh more, and the window's difficulty is averaged as a
/// weighted harmonic mean (targets are averaged arithmetically, then
/// inverted), scaled by the ratio of target spacing to the weighted solve
/// time. `step_clamp` (0 = none) bounds the change relative to the tip
/// difficulty.
fn lwma(blocks: &[Block], window: usize, block_time_ms: u64, step_clamp: u128) -> u64 {
    let t = block_time_ms.max(1) as u128;
    let n = window.min(blocks.len() - 1);
    let tail = &blocks[blocks.len() - n - 1..];

    let mut weighted_solve = 0u128;
    let mut target_sum = U256::zero();
    for (i, pair) in tail.windows(2).enumerate() {
        let solve = pair[1]
            .timestamp
            .saturating_sub(pair[0].timestamp)
            .clamp(1, block_time_ms.saturating_mul(6)) as u128;
        weighted_solve += solve * (i as u128 + 1);
        target_sum += U256::MAX / U256::from(pair[1].difficulty.max(1));
    }

    let weight_sum = (n as u128 * (n as u128 + 1)) / 2;
    let lwma_solve = (weighted_solve / weight_sum).max(1);

    // Mean target over the window; its inverse is the harmonic difficulty
    // mean, so one low-difficulty outlier cannot drag the average the way a
    // plain sum of difficulties would.
    let avg_target = (target_sum / U256::from(n as u64)).max(U256::one());
    let harmonic_difficulty = U256::MAX / avg_target;

    // difficulty fields are u64, so harmonic_difficulty fits u128 with
    // headroom for the spacing ratio.
    let harmonic = harmonic_difficulty.min(U256::from(u64::MAX)).as_u128();
    let mut next = (harmonic.saturating_mul(t) / lwma_solve).max(1);

    if step_clamp > 0 {
        let tip = blocks.last().map(|b| b.difficulty).unwrap_or(1).max(1) as u128;
        next = next.clamp((tip / step_clamp).max(1), tip * step_clamp);
    }

    saturate(next)
}

/// DigiShield-style per-block retarget: scale the tip difficulty by
/// target/actual spacing, clamped to a 4x swing either way.
fn per_block_retarget(blocks: &[Block], block_time_ms: u64) -> u64 {
    let t = block_time_ms.max(1) as u128;
    let tip = &blocks[blocks.len() - 1];
    let parent = &blocks[blocks.len() - 2];

    let actual = tip
        .timestamp
        .saturating_sub(parent.timestamp)
        .clamp(block_time_ms / 4, block_time_ms.saturating_mul(4))
        .max(1) as u128;

    let prev = tip.difficulty.max(1) as u128;
    let next = (prev * t / actual).clamp((prev / 4).max(1), prev * 4);
    saturate(next)
}

fn saturate(v: u128) -> u64 {
    v.min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: u64 = 60_000;

    fn chain_with_spacing(len: usize, spacing_ms: u64, difficulty: u64) -> Vec<Block> {
        (0..len)
            .map(|i| Block {
                index: i as u64,
                timestamp: 1_700_000_000_000 + i as u64 * spacing_ms,
                previous_hash: if i == 0 { "0".into() } else { format!("{:064x}", i - 1) },
                merkle_root: String::new(),
                nonce: 0,
                difficulty,
                transactions: vec![],
                hash: format!("{i:064x}"),
                algorithm: "velora".into(),
            })
            .collect()
    }

    #[test]
    fn test_on_target_holds_steady() {
        let blocks = chain_with_spacing(100, T, 1000);
        let next = next_difficulty(&blocks, DifficultyAlgorithm::Lwma3, T);
        // On-schedule chain: stays within a few percent of current.
        assert!((950..=1050).contains(&next), "got {next}");
    }

    #[test]
    fn test_fast_blocks_raise_difficulty() {
        let blocks = chain_with_spacing(100, T / 4, 1000);
        let next = next_difficulty(&blocks, DifficultyAlgorithm::Lwma3, T);
        assert!(next > 1000, "got {next}");
    }

    #[test]
    fn test_slow_blocks_lower_difficulty() {
        let blocks = chain_with_spacing(100, T * 4, 1000);
        let next = next_difficulty(&blocks, DifficultyAlgorithm::Lwma3, T);
        assert!(next < 1000, "got {next}");
    }

    #[test]
    fn test_varying_difficulty_uses_harmonic_mean() {
        // Alternating 1000/4000 at on-target spacing: the weighted harmonic
        // mean sits at 2/(1/1000 + 1/4000) = 1600. An arithmetic mean of the
        // difficulties would land at 2500.
        let mut blocks = chain_with_spacing(101, T, 1000);
        for (i, block) in blocks.iter_mut().enumerate() {
            block.difficulty = if i % 2 == 0 { 1000 } else { 4000 };
        }
        let next = next_difficulty(&blocks, DifficultyAlgorithm::Lwma3, T);
        assert!(
            (1500..=1700).contains(&next),
            "expected the harmonic mean near 1600, got {next}"
        );
    }

    #[test]
    fn test_never_below_one() {
        let blocks = chain_with_spacing(100, T * 100, 1);
        for algo in [
            DifficultyAlgorithm::Lwma3,
            DifficultyAlgorithm::Aggressive,
            DifficultyAlgorithm::Dogecoin,
        ] {
            assert!(next_difficulty(&blocks, algo, T) >= 1);
        }
    }

    #[test]
    fn test_short_chain_carries_tip_difficulty() {
        let blocks = chain_with_spacing(1, T, 777);
        assert_eq!(next_difficulty(&blocks, DifficultyAlgorithm::Lwma3, T), 777);
        assert_eq!(next_difficulty(&[], DifficultyAlgorithm::Lwma3, T), 1);
    }

    #[test]
    fn test_aggressive_clamps_step() {
        // A pathological timestamp gap cannot move the aggressive variant
        // more than 3x in one step.
        let mut blocks = chain_with_spacing(30, T, 1000);
        let last = blocks.len() - 1;
        blocks[last].timestamp = blocks[last - 1].timestamp + 1;
        let next = next_difficulty(&blocks, DifficultyAlgorithm::Aggressive, T);
        assert!(next <= 3000, "got {next}");
    }

    #[test]
    fn test_dogecoin_four_x_clamp() {
        let mut blocks = chain_with_spacing(10, T, 1000);
        let last = blocks.len() - 1;
        // Instant block: actual clamps to T/4, difficulty at most 4x.
        blocks[last].timestamp = blocks[last - 1].timestamp;
        assert_eq!(next_difficulty(&blocks, DifficultyAlgorithm::Dogecoin, T), 4000);
    }

    #[test]
    fn test_algorithm_parse_roundtrip() {
        for algo in ["lwma3", "aggressive", "dogecoin"] {
            let parsed: DifficultyAlgorithm = algo.parse().unwrap();
            assert_eq!(parsed.to_string(), algo);
        }
        assert!("scrypt".parse::<DifficultyAlgorithm>().is_err());
        assert_eq!(DifficultyAlgorithm::default(), DifficultyAlgorithm::Lwma3);
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&DifficultyAlgorithm::Dogecoin).unwrap();
        assert_eq!(json, "\"dogecoin\"");
    }
}
