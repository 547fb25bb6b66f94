//! Runtime-configurable tuning parameters for the custom allreduce.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `CUSTOM_AR_`) or by constructing a custom `CustomArConfig`.
//! The Rank Data layout is not configurable: `meta_size` depends only on the
//! world size.

/// Tuning parameters for strategy selection and barrier spinning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomArConfig {
    /// Largest payload reduced with the one-shot strategy when the world has
    /// at most four ranks. Larger payloads use two-shot.
    pub one_shot_max_bytes_small_world: usize,

    /// Same limit for worlds of five to eight ranks.
    pub one_shot_max_bytes_large_world: usize,

    /// Busy-spin iterations a barrier waiter performs before it starts
    /// yielding its thread between flag polls.
    pub spin_before_yield: u32,
}

impl Default for CustomArConfig {
    fn default() -> Self {
        Self {
            one_shot_max_bytes_small_world: 512 * 1024, // 512 KiB
            one_shot_max_bytes_large_world: 256 * 1024, // 256 KiB
            spin_before_yield: 1024,
        }
    }
}

impl CustomArConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `CUSTOM_AR_ONE_SHOT_MAX_BYTES_SMALL_WORLD`
    /// - `CUSTOM_AR_ONE_SHOT_MAX_BYTES_LARGE_WORLD`
    /// - `CUSTOM_AR_SPIN_BEFORE_YIELD`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("CUSTOM_AR_ONE_SHOT_MAX_BYTES_SMALL_WORLD")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.one_shot_max_bytes_small_world = n;
        }
        if let Ok(v) = std::env::var("CUSTOM_AR_ONE_SHOT_MAX_BYTES_LARGE_WORLD")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.one_shot_max_bytes_large_world = n;
        }
        if let Ok(v) = std::env::var("CUSTOM_AR_SPIN_BEFORE_YIELD")
            && let Ok(n) = v.parse::<u32>()
        {
            cfg.spin_before_yield = n;
        }

        cfg
    }

    /// One-shot payload limit for a world of `world_size` ranks.
    pub fn one_shot_limit(&self, world_size: usize) -> usize {
        if world_size <= 4 {
            self.one_shot_max_bytes_small_world
        } else {
            self.one_shot_max_bytes_large_world
        }
    }
}
