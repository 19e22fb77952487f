use serde::{Deserialize, Serialize};

/// Lower bound of [`StalkerConfig::ic_entries`] (§3: "an `ic_entries`
/// configuration in [2, 32]").
pub const IC_ENTRIES_MIN: usize = 2;
/// Upper bound of [`StalkerConfig::ic_entries`].
pub const IC_ENTRIES_MAX: usize = 32;

/// Process-wide tuning knobs for the engine.
///
/// Construction-time/runtime configuration only; there is no persisted
/// state layout (§6). Deliberately `serde`-derived so a host application can
/// load it from a config file the way the richer repos in this workspace's
/// lineage load service configuration, even though the engine itself never
/// touches disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalkerConfig {
    /// Governs block reuse (§4.4) and backpatch eligibility (§4.7).
    ///
    /// `< 0` disables caching (always retranslate), `0` never reuses without
    /// re-verifying the snapshot, `> 0` reuses once a block has been
    /// observed that many times.
    pub trust_threshold: i32,
    /// Inline-cache capacity per indirect branch site, in `[2, 32]`.
    pub ic_entries: usize,
}

impl Default for StalkerConfig {
    fn default() -> Self {
        // Matches GumStalker's historical defaults: trust everything after
        // one observation, four inline-cache slots per indirect site.
        Self {
            trust_threshold: 1,
            ic_entries: 4,
        }
    }
}

impl StalkerConfig {
    /// Construct a config, validating `ic_entries` against §3's invariant.
    pub fn new(trust_threshold: i32, ic_entries: usize) -> Result<Self, ConfigError> {
        if !(IC_ENTRIES_MIN..=IC_ENTRIES_MAX).contains(&ic_entries) {
            return Err(ConfigError::IcEntriesOutOfRange(ic_entries));
        }
        Ok(Self {
            trust_threshold,
            ic_entries,
        })
    }

    /// `true` if `recycle_count` observations are enough to make a block
    /// backpatch-eligible (§4.7: "target's `recycle_count` ≥
    /// `trust_threshold`"), taken literally — at `trust_threshold == 0` this
    /// is true from the very first observation, since backpatching a known
    /// target doesn't depend on ever treating the block itself as
    /// permanently warm (see [`StalkerConfig::requires_snapshot_check`] for
    /// that, separate, decision).
    pub fn is_trusted(&self, recycle_count: u32) -> bool {
        self.trust_threshold < 0 || recycle_count as i64 >= self.trust_threshold as i64
    }

    /// `true` if `recycle_count` observations are enough to skip
    /// re-verifying a block's snapshot entirely on reuse (§4.4 "warm
    /// cache"). Unlike [`StalkerConfig::is_trusted`], this is false for
    /// every `recycle_count` when `trust_threshold == 0` — §3's "0 never
    /// reuses [without re-verifying]" read literally, so a block is never
    /// permanently warm at that setting, only ever found up to date by
    /// comparing its snapshot each time.
    fn is_warm(&self, recycle_count: u32) -> bool {
        self.trust_threshold < 0
            || (self.trust_threshold > 0 && recycle_count as i64 >= self.trust_threshold as i64)
    }

    /// `true` if reuse decisions must re-verify the block's snapshot rather
    /// than trusting it outright (§4.4).
    pub fn requires_snapshot_check(&self, recycle_count: u32) -> bool {
        !self.is_warm(recycle_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("ic_entries must be in [{IC_ENTRIES_MIN}, {IC_ENTRIES_MAX}], got {0}")]
    IcEntriesOutOfRange(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = StalkerConfig::default();
        assert!((IC_ENTRIES_MIN..=IC_ENTRIES_MAX).contains(&cfg.ic_entries));
    }

    #[test]
    fn rejects_out_of_range_ic_entries() {
        assert!(StalkerConfig::new(1, 1).is_err());
        assert!(StalkerConfig::new(1, 33).is_err());
        assert!(StalkerConfig::new(1, 2).is_ok());
        assert!(StalkerConfig::new(1, 32).is_ok());
    }

    #[test]
    fn negative_threshold_always_trusted() {
        let cfg = StalkerConfig::new(-1, 4).unwrap();
        assert!(cfg.is_trusted(0));
        assert!(!cfg.requires_snapshot_check(0));
    }

    #[test]
    fn zero_threshold_never_trusted_without_check() {
        let cfg = StalkerConfig::new(0, 4).unwrap();
        assert!(cfg.is_trusted(0));
        assert!(cfg.requires_snapshot_check(0));
        assert!(cfg.requires_snapshot_check(100));
    }

    #[test]
    fn positive_threshold_trusts_after_n_observations() {
        let cfg = StalkerConfig::new(3, 4).unwrap();
        assert!(!cfg.is_trusted(2));
        assert!(cfg.is_trusted(3));
        assert!(cfg.is_trusted(4));
        assert!(cfg.requires_snapshot_check(2));
        assert!(!cfg.requires_snapshot_check(3));
    }

    #[test]
    fn zero_threshold_is_backpatch_eligible_but_never_reuse_warm() {
        // §4.7 is satisfied from the first observation (any recycle_count
        // >= 0), but §4.4 reuse must still re-verify the snapshot every
        // time at trust_threshold == 0 — these are deliberately different
        // predicates.
        let cfg = StalkerConfig::new(0, 4).unwrap();
        assert!(cfg.is_trusted(0), "backpatch eligibility ignores trust=0");
        assert!(cfg.requires_snapshot_check(0), "reuse must still re-verify at trust=0");
    }
}
