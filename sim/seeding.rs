//! Seed handling for reproducible runs.
//!
//! Every run owns a `StdRng` built from a single `u64`. Monte-Carlo replicate
//! `i` of a run with base seed `s` uses `splitmix64(s ^ splitmix64(i))`, so
//! any replicate can be regenerated on its own and no two replicates share a
//! random stream.

use crate::types::SimulationError;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};

/// One step of the SplitMix64 output function (Steele, Lea & Flood 2014).
pub fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for Monte-Carlo replicate `index` of a run seeded with `base_seed`.
pub fn replicate_seed(base_seed: u64, index: usize) -> u64 {
    splitmix64(base_seed ^ splitmix64(index as u64))
}

/// Draws a fresh seed from the operating system. The top bit is cleared so
/// the seed fits a TOML integer and can be pasted back into a config.
pub fn entropy_seed() -> Result<u64, SimulationError> {
    let mut bytes = [0u8; 8];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes) >> 1)
}

/// Uses `seed` when given, otherwise draws one from the operating system.
pub fn resolve_seed(seed: Option<u64>) -> Result<u64, SimulationError> {
    match seed {
        Some(seed) => Ok(seed),
        None => {
            let seed = entropy_seed()?;
            log::info!("No seed configured; drew seed {seed} from the operating system.");
            Ok(seed)
        }
    }
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;

    #[test]
    fn splitmix_matches_reference_output() {
        // First outputs of the reference generator seeded with 0; the
        // generator adds the golden gamma before mixing, as `splitmix64` does.
        assert_eq!(splitmix64(0), 0xE220_A839_7B1D_CDAF);
        assert_eq!(splitmix64(0x9E37_79B9_7F4A_7C15), 0x6E78_9E6A_A1B9_65F4);
    }

    #[test]
    fn replicate_seeds_are_distinct_and_stable() {
        let seeds: Vec<u64> = (0..10_000).map(|i| replicate_seed(2024, i)).collect();
        let unique: HashSet<_> = seeds.iter().collect();
        assert_eq!(unique.len(), seeds.len());
        assert_eq!(replicate_seed(2024, 17), seeds[17]);
        assert_ne!(replicate_seed(2025, 17), seeds[17]);
    }

    #[test]
    fn seeded_streams_repeat() {
        let stream = |seed: u64| -> Vec<u64> {
            let mut rng = seeded_rng(seed);
            (0..1_000).map(|_| rng.r#gen::<u64>()).collect()
        };
        assert_eq!(stream(7), stream(7));
        let sibling = stream(replicate_seed(7, 1));
        assert_ne!(stream(replicate_seed(7, 0)), sibling);
        assert!(stream(7).iter().zip(&sibling).all(|(a, b)| a != b));
    }

    #[test]
    fn explicit_seed_is_kept() {
        assert_eq!(resolve_seed(Some(42)).unwrap(), 42);
    }

    #[test]
    fn entropy_seeds_fit_a_toml_integer() {
        for _ in 0..32 {
            assert!(entropy_seed().unwrap() <= i64::MAX as u64);
        }
    }
}
