//! End-to-end activation walks over built block-index chains.

use bitcoin::hashes::Hash;
use ember_primitives::{
    ArenaIx, BipDeployment, BlockHash, BlockIndexArena, ChainParams, DeploymentPos, Network,
};
use ember_versionbits::{
    versionbits_mask, versionbits_state, versionbits_state_since_height, versionbits_statistics,
    Bip9Stats, ThresholdConditionCache, ThresholdConditionChecker, ThresholdState,
    VersionBitsCache, VersionBitsConditionChecker, VERSIONBITS_TOP_BITS,
};

const DEPLOYMENT: BipDeployment = BipDeployment {
    bit: 7,
    start_time: 100,
    timeout: 1_000,
    period: 10,
    threshold: 8,
};

fn hash_of(n: u32) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&n.to_le_bytes());
    bytes[31] = 0x7f;
    BlockHash::from_byte_array(bytes)
}

/// Appends a block with the given time and version to the chain.
fn append(
    arena: &mut BlockIndexArena,
    chain: &mut Vec<ArenaIx>,
    time: u32,
    version: i32,
) -> ArenaIx {
    let height = chain.len() as u32;
    let ix = arena.insert(hash_of(height));
    let entry = arena.get_mut(ix);
    entry.prev = chain.last().copied();
    entry.height = height;
    entry.time = time;
    entry.version = version;
    arena.build_skip(ix);
    chain.push(ix);
    ix
}

fn signalling_version(bit: u8) -> i32 {
    (VERSIONBITS_TOP_BITS | (1u32 << bit)) as i32
}

fn quiet_version() -> i32 {
    VERSIONBITS_TOP_BITS as i32
}

/// Builds the canonical activation chain for [`DEPLOYMENT`]:
/// period 0 sits before the start time, period 1 crosses it, period 2
/// signals on exactly the threshold number of blocks.
fn activation_chain(arena: &mut BlockIndexArena) -> Vec<ArenaIx> {
    let mut chain = Vec::new();
    for height in 0..45u32 {
        let time = match height {
            0..=9 => 50,
            10..=19 => 250,
            _ => 300,
        };
        let version = if (20..28).contains(&height) {
            signalling_version(DEPLOYMENT.bit)
        } else {
            quiet_version()
        };
        append(arena, &mut chain, time, version);
    }
    chain
}

fn state_at(
    arena: &BlockIndexArena,
    index_prev: Option<ArenaIx>,
    cache: &mut ThresholdConditionCache,
) -> ThresholdState {
    VersionBitsConditionChecker::new(DEPLOYMENT).state(arena, index_prev, cache)
}

#[test]
fn activation_walks_the_automaton() {
    let mut arena = BlockIndexArena::new();
    let chain = activation_chain(&mut arena);
    let mut cache = ThresholdConditionCache::new();

    // The parent of genesis is defined.
    assert_eq!(state_at(&arena, None, &mut cache), ThresholdState::Defined);

    // First period: aligned ancestor is the genesis parent.
    for h in 0..9 {
        assert_eq!(
            state_at(&arena, Some(chain[h]), &mut cache),
            ThresholdState::Defined,
            "height {h}"
        );
    }

    // Second period: the median time at height 9 is still before the
    // start time.
    for h in 9..19 {
        assert_eq!(
            state_at(&arena, Some(chain[h]), &mut cache),
            ThresholdState::Defined,
            "height {h}"
        );
    }

    // Third period: started, the median time crossed the start time.
    for h in 19..29 {
        assert_eq!(
            state_at(&arena, Some(chain[h]), &mut cache),
            ThresholdState::Started,
            "height {h}"
        );
    }

    // Eight of the ten blocks ending at height 29 signalled.
    for h in 29..39 {
        assert_eq!(
            state_at(&arena, Some(chain[h]), &mut cache),
            ThresholdState::LockedIn,
            "height {h}"
        );
    }

    // Lock-in always progresses into active.
    for h in 39..45 {
        assert_eq!(
            state_at(&arena, Some(chain[h]), &mut cache),
            ThresholdState::Active,
            "height {h}"
        );
    }

    // Cache entries are keyed on aligned ancestors only.
    for key in cache.keys().flatten() {
        assert_eq!((arena.height(*key) + 1) % DEPLOYMENT.period, 0);
    }
}

#[test]
fn since_height_finds_the_first_block_of_each_state() {
    let mut arena = BlockIndexArena::new();
    let chain = activation_chain(&mut arena);
    let mut cache = ThresholdConditionCache::new();
    let checker = VersionBitsConditionChecker::new(DEPLOYMENT);

    assert_eq!(
        checker.state_since_height(&arena, Some(chain[5]), &mut cache),
        0
    );
    assert_eq!(
        checker.state_since_height(&arena, Some(chain[24]), &mut cache),
        20
    );
    assert_eq!(
        checker.state_since_height(&arena, Some(chain[34]), &mut cache),
        30
    );
    assert_eq!(
        checker.state_since_height(&arena, Some(chain[44]), &mut cache),
        40
    );
}

#[test]
fn always_active_bypasses_the_cache() {
    let mut arena = BlockIndexArena::new();
    let chain = activation_chain(&mut arena);

    let checker = VersionBitsConditionChecker::new(BipDeployment {
        start_time: BipDeployment::ALWAYS_ACTIVE,
        ..DEPLOYMENT
    });
    let mut cache = ThresholdConditionCache::new();

    for prev in std::iter::once(None).chain(chain.iter().copied().map(Some)) {
        assert_eq!(
            checker.state(&arena, prev, &mut cache),
            ThresholdState::Active
        );
    }
    assert!(cache.is_empty());
    assert_eq!(checker.state_since_height(&arena, Some(chain[44]), &mut cache), 0);
}

#[test]
fn timeout_fails_the_deployment_for_good() {
    let mut arena = BlockIndexArena::new();
    let mut chain = Vec::new();

    // The start time is crossed and the timeout follows immediately;
    // every block signals, which must not matter once failed.
    for height in 0..40u32 {
        let time = match height {
            0..=9 => 150,
            _ => 2_000,
        };
        append(&mut arena, &mut chain, time, signalling_version(DEPLOYMENT.bit));
    }

    let mut cache = ThresholdConditionCache::new();
    assert_eq!(
        state_at(&arena, Some(chain[15]), &mut cache),
        ThresholdState::Started
    );
    assert_eq!(
        state_at(&arena, Some(chain[25]), &mut cache),
        ThresholdState::Failed
    );
    assert_eq!(
        state_at(&arena, Some(chain[39]), &mut cache),
        ThresholdState::Failed
    );
}

#[test]
fn statistics_track_a_period_in_flight() {
    let dep = BipDeployment {
        bit: 7,
        start_time: 0,
        timeout: i64::MAX,
        period: 2_016,
        threshold: 1_916,
    };
    let checker = VersionBitsConditionChecker::new(dep);

    let mut arena = BlockIndexArena::new();
    let mut chain = Vec::new();

    // 2016 quiet blocks, then 1000 blocks of which 900 signal.
    for _ in 0..2_016u32 {
        append(&mut arena, &mut chain, 100, quiet_version());
    }
    for n in 0..1_000u32 {
        let version = if n < 900 {
            signalling_version(dep.bit)
        } else {
            quiet_version()
        };
        append(&mut arena, &mut chain, 100, version);
    }

    let stats = checker.statistics(&arena, chain.last().copied());
    assert_eq!(
        stats,
        Bip9Stats {
            period: 2_016,
            threshold: 1_916,
            elapsed: 1_000,
            count: 900,
            possible: true,
        }
    );

    // One more quiet block pushes the threshold out of reach.
    append(&mut arena, &mut chain, 100, quiet_version());
    let stats = checker.statistics(&arena, chain.last().copied());
    assert_eq!(stats.elapsed, 1_001);
    assert_eq!(stats.count, 900);
    assert!(!stats.possible);

    // The null index reports an empty period.
    let stats = checker.statistics(&arena, None);
    assert_eq!(stats.elapsed, 0);
    assert_eq!(stats.count, 0);
}

#[test]
fn deployment_table_entry_points() {
    let mut params = ChainParams::new(Network::Unittest);
    params.set_deployment(DeploymentPos::TestDummy, DEPLOYMENT);

    let mut arena = BlockIndexArena::new();
    let chain = activation_chain(&mut arena);
    let mut cache = VersionBitsCache::new();
    let tip = Some(chain[44]);
    let pos = DeploymentPos::TestDummy;

    assert_eq!(versionbits_mask(&params, pos), 1 << 7);
    assert_eq!(
        versionbits_state(&arena, tip, &params, pos, &mut cache),
        ThresholdState::Active
    );
    assert_eq!(
        versionbits_state_since_height(&arena, tip, &params, pos, &mut cache),
        40
    );
    let stats = versionbits_statistics(&arena, tip, &params, pos);
    assert_eq!(stats.period, 10);
    assert_eq!(stats.threshold, 8);

    cache.clear();
    assert_eq!(
        versionbits_state(&arena, tip, &params, pos, &mut cache),
        ThresholdState::Active
    );
}

/// A tiny deterministic generator so the randomized comparison below
/// reproduces across runs.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[test]
fn cached_states_match_uncached_recomputation() {
    let mut rng = XorShift(0x3243_f6a8_885a_308d);
    let mut arena = BlockIndexArena::new();
    let mut chain = Vec::new();

    let mut time = 50u32;
    for _ in 0..200u32 {
        // Time advances erratically; roughly half the blocks signal.
        time += (rng.next() % 40) as u32;
        let version = if rng.next() % 2 == 0 {
            signalling_version(DEPLOYMENT.bit)
        } else {
            quiet_version()
        };
        append(&mut arena, &mut chain, time, version);
    }

    let checker = VersionBitsConditionChecker::new(DEPLOYMENT);
    let mut warm = ThresholdConditionCache::new();
    let mut previous = checker.state(&arena, None, &mut warm);

    for prev in chain.iter().copied() {
        let cached = checker.state(&arena, Some(prev), &mut warm);

        let mut cold = ThresholdConditionCache::new();
        let recomputed = checker.state(&arena, Some(prev), &mut cold);
        assert_eq!(cached, recomputed, "height {}", arena.height(prev));

        // Transitions follow the table; terminal states absorb.
        let legal = match previous {
            ThresholdState::Defined => matches!(
                cached,
                ThresholdState::Defined | ThresholdState::Started | ThresholdState::Failed
            ),
            ThresholdState::Started => matches!(
                cached,
                ThresholdState::Started | ThresholdState::LockedIn | ThresholdState::Failed
            ),
            ThresholdState::LockedIn => {
                matches!(cached, ThresholdState::LockedIn | ThresholdState::Active)
            }
            ThresholdState::Active => cached == ThresholdState::Active,
            ThresholdState::Failed => cached == ThresholdState::Failed,
        };
        assert!(
            legal,
            "illegal transition {previous:?} -> {cached:?} at height {}",
            arena.height(prev)
        );
        previous = cached;
    }
}
