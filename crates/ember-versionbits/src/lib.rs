//! BIP9 version-bits deployment state tracking.
//!
//! Each deployment moves through a fixed automaton as the chain grows:
//! `Defined → Started → LockedIn → Active`, with `Failed` reachable from
//! `Defined` and `Started` once the timeout passes. A block's state is
//! that of the period containing it, so states are computed and cached
//! only at aligned ancestors, the last block of the preceding period.
//!
//! The cache is keyed on arena handles (`None` standing for the parent
//! of genesis), never on addresses, and is only valid for indices on
//! the canonical chain under the chain-state lock.

use ember_primitives::{ArenaIx, BipDeployment, BlockIndexArena, ChainParams, DeploymentPos};
use std::collections::HashMap;

/// Block version top bits signalling version-bits semantics.
pub const VERSIONBITS_TOP_BITS: u32 = 0x2000_0000;
/// Mask of the top bits checked against [`VERSIONBITS_TOP_BITS`].
pub const VERSIONBITS_TOP_MASK: u32 = 0xe000_0000;
/// Number of usable signalling bits.
pub const VERSIONBITS_NUM_BITS: u32 = 29;

/// Position of a deployment within its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdState {
    /// Not yet signalling; the initial state of every deployment.
    Defined,
    /// Inside the signalling window.
    Started,
    /// The threshold was met in a completed period.
    LockedIn,
    /// The new rules apply. Terminal.
    Active,
    /// The timeout passed without lock-in. Terminal.
    Failed,
}

/// Per-deployment memo of aligned ancestors to their computed state.
///
/// `None` keys the parent of genesis, which is `Defined` by definition.
pub type ThresholdConditionCache = HashMap<Option<ArenaIx>, ThresholdState>;

/// Signalling statistics of the period containing a given block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bip9Stats {
    /// Length of the signalling period.
    pub period: u32,
    /// Blocks per period required to lock in.
    pub threshold: u32,
    /// Blocks elapsed in the current period, including the given block.
    pub elapsed: u32,
    /// Signalling blocks among the elapsed ones.
    pub count: u32,
    /// Whether the threshold is still reachable within this period.
    pub possible: bool,
}

/// The per-deployment condition evaluated over every block of a period.
pub trait ThresholdConditionChecker {
    /// The deployment being tracked.
    fn deployment(&self) -> &BipDeployment;

    /// Whether the block at `ix` counts towards the threshold.
    fn condition(&self, arena: &BlockIndexArena, ix: ArenaIx) -> bool;

    /// State of the block following `index_prev`, memoized in `cache`.
    fn state(
        &self,
        arena: &BlockIndexArena,
        index_prev: Option<ArenaIx>,
        cache: &mut ThresholdConditionCache,
    ) -> ThresholdState {
        let dep = self.deployment();
        if dep.start_time == BipDeployment::ALWAYS_ACTIVE {
            return ThresholdState::Active;
        }
        let period = dep.period;

        // Walk backwards in strides of one period, collecting aligned
        // ancestors whose state is not known yet.
        let mut cursor = index_prev.and_then(|ix| aligned_ancestor(arena, ix, period));
        let mut to_compute = Vec::new();
        while !cache.contains_key(&cursor) {
            match cursor {
                None => {
                    // The parent of genesis is defined by definition.
                    cache.insert(None, ThresholdState::Defined);
                    break;
                }
                Some(ix) => {
                    if arena.median_time_past(ix) < dep.start_time {
                        // Every earlier block is before the start time
                        // as well, so the walk can stop here.
                        cache.insert(Some(ix), ThresholdState::Defined);
                        break;
                    }
                    to_compute.push(ix);
                    cursor = previous_period(arena, ix, period);
                }
            }
        }

        let mut state = *cache
            .get(&cursor)
            .expect("the walk above terminates on a cached entry; qed");

        // Unwind, deriving each successor state from its predecessor.
        while let Some(ix) = to_compute.pop() {
            state = match state {
                ThresholdState::Defined => {
                    let mtp = arena.median_time_past(ix);
                    if mtp >= dep.timeout {
                        ThresholdState::Failed
                    } else if mtp >= dep.start_time {
                        ThresholdState::Started
                    } else {
                        ThresholdState::Defined
                    }
                }
                ThresholdState::Started => {
                    if arena.median_time_past(ix) >= dep.timeout {
                        ThresholdState::Failed
                    } else {
                        let mut count = 0u32;
                        let mut walk = Some(ix);
                        for _ in 0..period {
                            let Some(cur) = walk else { break };
                            if self.condition(arena, cur) {
                                count += 1;
                            }
                            walk = arena.get(cur).prev;
                        }
                        if count >= dep.threshold {
                            ThresholdState::LockedIn
                        } else {
                            ThresholdState::Started
                        }
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                terminal @ (ThresholdState::Active | ThresholdState::Failed) => terminal,
            };
            cache.insert(Some(ix), state);
        }

        state
    }

    /// Signalling statistics for the period containing `index`.
    fn statistics(&self, arena: &BlockIndexArena, index: Option<ArenaIx>) -> Bip9Stats {
        let dep = self.deployment();
        let mut stats = Bip9Stats {
            period: dep.period,
            threshold: dep.threshold,
            ..Default::default()
        };
        let Some(ix) = index else { return stats };

        let height = arena.height(ix);
        let end_of_prev = i64::from(height) - i64::from((height + 1) % dep.period);
        stats.elapsed = (i64::from(height) - end_of_prev) as u32;

        let mut count = 0u32;
        let mut walk = Some(ix);
        while let Some(cur) = walk {
            if i64::from(arena.height(cur)) <= end_of_prev {
                break;
            }
            if self.condition(arena, cur) {
                count += 1;
            }
            walk = arena.get(cur).prev;
        }
        stats.count = count;
        stats.possible = (dep.period - dep.threshold) >= (stats.elapsed - count);
        stats
    }

    /// Smallest height whose period already has the current state.
    fn state_since_height(
        &self,
        arena: &BlockIndexArena,
        index_prev: Option<ArenaIx>,
        cache: &mut ThresholdConditionCache,
    ) -> u32 {
        let dep = self.deployment();
        if dep.start_time == BipDeployment::ALWAYS_ACTIVE {
            return 0;
        }

        let initial = self.state(arena, index_prev, cache);
        // Every deployment starts out defined at genesis.
        if initial == ThresholdState::Defined {
            return 0;
        }
        let period = dep.period;

        // A non-defined state implies a non-null aligned ancestor.
        let Some(mut ix) = index_prev.and_then(|ix| aligned_ancestor(arena, ix, period)) else {
            return 0;
        };

        while let Some(parent) = previous_period(arena, ix, period) {
            if self.state(arena, Some(parent), cache) != initial {
                break;
            }
            ix = parent;
        }

        arena.height(ix) + 1
    }
}

/// The standard version-bits condition for one deployment.
pub struct VersionBitsConditionChecker {
    bip: BipDeployment,
}

impl VersionBitsConditionChecker {
    /// Constructs a checker for `bip`.
    pub fn new(bip: BipDeployment) -> Self {
        Self { bip }
    }

    /// Bit mask the deployment signals with in the block version.
    pub fn mask(&self) -> u32 {
        1u32 << self.bip.bit
    }
}

impl ThresholdConditionChecker for VersionBitsConditionChecker {
    fn deployment(&self) -> &BipDeployment {
        &self.bip
    }

    fn condition(&self, arena: &BlockIndexArena, ix: ArenaIx) -> bool {
        let version = arena.get(ix).version as u32;
        (version & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS && (version & self.mask()) != 0
    }
}

/// Caches for every known deployment.
#[derive(Debug, Default)]
pub struct VersionBitsCache {
    caches: [ThresholdConditionCache; ember_primitives::MAX_VERSION_BITS_DEPLOYMENTS],
}

impl VersionBitsCache {
    /// Constructs an empty cache set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache of `pos`.
    pub fn cache_mut(&mut self, pos: DeploymentPos) -> &mut ThresholdConditionCache {
        &mut self.caches[pos as usize]
    }

    /// Drops every cached state, e.g. around a deep reorganization.
    pub fn clear(&mut self) {
        for cache in &mut self.caches {
            cache.clear();
        }
    }
}

/// State of deployment `pos` for the successor of `index_prev`.
pub fn versionbits_state(
    arena: &BlockIndexArena,
    index_prev: Option<ArenaIx>,
    params: &ChainParams,
    pos: DeploymentPos,
    cache: &mut VersionBitsCache,
) -> ThresholdState {
    VersionBitsConditionChecker::new(*params.deployment(pos)).state(
        arena,
        index_prev,
        cache.cache_mut(pos),
    )
}

/// Signalling statistics of deployment `pos` at `index_prev`.
pub fn versionbits_statistics(
    arena: &BlockIndexArena,
    index_prev: Option<ArenaIx>,
    params: &ChainParams,
    pos: DeploymentPos,
) -> Bip9Stats {
    VersionBitsConditionChecker::new(*params.deployment(pos)).statistics(arena, index_prev)
}

/// First height at which the current state of `pos` applied.
pub fn versionbits_state_since_height(
    arena: &BlockIndexArena,
    index_prev: Option<ArenaIx>,
    params: &ChainParams,
    pos: DeploymentPos,
    cache: &mut VersionBitsCache,
) -> u32 {
    VersionBitsConditionChecker::new(*params.deployment(pos)).state_since_height(
        arena,
        index_prev,
        cache.cache_mut(pos),
    )
}

/// Version mask deployment `pos` signals with.
pub fn versionbits_mask(params: &ChainParams, pos: DeploymentPos) -> u32 {
    VersionBitsConditionChecker::new(*params.deployment(pos)).mask()
}

/// The aligned ancestor governing the period that follows `ix`.
///
/// Returns the ancestor at the last height `h` with `(h + 1) % period
/// == 0` at or below `ix`, or `None` when `ix` lies within the first
/// period (the parent of genesis).
fn aligned_ancestor(arena: &BlockIndexArena, ix: ArenaIx, period: u32) -> Option<ArenaIx> {
    let height = arena.height(ix);
    let target = i64::from(height) - i64::from((height + 1) % period);
    if target < 0 {
        return None;
    }
    arena.ancestor(ix, target as u32)
}

/// The aligned ancestor one full period below the aligned `ix`.
fn previous_period(arena: &BlockIndexArena, ix: ArenaIx, period: u32) -> Option<ArenaIx> {
    let height = arena.height(ix);
    if height >= period {
        arena.ancestor(ix, height - period)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_matches_bit() {
        let checker = VersionBitsConditionChecker::new(BipDeployment {
            bit: 28,
            start_time: 0,
            timeout: i64::MAX,
            period: 144,
            threshold: 108,
        });
        assert_eq!(checker.mask(), 0x1000_0000);
    }

    #[test]
    fn top_bits_gate_the_condition() {
        // A version with the right bit but wrong top bits must not count.
        let version: u32 = 0x4000_0000 | (1 << 5);
        assert_ne!(version & VERSIONBITS_TOP_MASK, VERSIONBITS_TOP_BITS);

        let signalling: u32 = VERSIONBITS_TOP_BITS | (1 << 5);
        assert_eq!(signalling & VERSIONBITS_TOP_MASK, VERSIONBITS_TOP_BITS);
    }
}
