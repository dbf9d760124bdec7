//! The in-memory block index.
//!
//! Entries live in an append-only arena and refer to each other through
//! [`ArenaIx`] handles instead of raw pointers, which keeps the tree an
//! owned forest while preserving O(1) parent hops and logarithmic
//! [`BlockIndexArena::ancestor`] walks through skip pointers.

use crate::coins::OutPoint;
use crate::hashes::{BlockHash, MerkleRoot, Txid};
use crate::Amount;
use bitcoin::hashes::{sha256d, Hash};
use std::collections::HashMap;

/// Number of blocks over which the median time past is taken.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Validation status bits of a block index entry.
pub mod block_status {
    /// Parsed, has a valid header.
    pub const VALID_HEADER: u32 = 1;
    /// Parent found, difficulty and timestamp checked.
    pub const VALID_TREE: u32 = 2;
    /// Transactions checked for structural validity.
    pub const VALID_TRANSACTIONS: u32 = 3;
    /// Outputs known to not exceed inputs up to this block.
    pub const VALID_CHAIN: u32 = 4;
    /// Scripts and signatures verified.
    pub const VALID_SCRIPTS: u32 = 5;
    /// Mask covering the validity levels above.
    pub const VALID_MASK: u32 = 7;

    /// Full block data available in a block file.
    pub const HAVE_DATA: u32 = 8;
    /// Undo data available in a block file.
    pub const HAVE_UNDO: u32 = 16;

    /// The block itself failed validation.
    pub const FAILED_VALID: u32 = 32;
    /// A predecessor of the block failed validation.
    pub const FAILED_CHILD: u32 = 64;
}

/// Stake-related flag bits of a block index entry.
pub mod stake_flags {
    /// The block is proof-of-stake.
    pub const PROOF_OF_STAKE: u32 = 1;
    /// The block contributed stake entropy.
    pub const STAKE_ENTROPY: u32 = 2;
    /// The stake modifier was regenerated at this block.
    pub const STAKE_MODIFIER: u32 = 4;
}

/// Handle of a block index entry inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaIx(u32);

impl ArenaIx {
    /// Position of the entry in the arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One entry of the block index tree.
#[derive(Debug, Clone)]
pub struct BlockIndex {
    /// Hash of the block.
    pub hash: BlockHash,
    /// Parent entry; `None` only for the genesis block.
    pub prev: Option<ArenaIx>,
    /// Advisory successor on the currently-selected chain.
    pub next: Option<ArenaIx>,
    /// Skip pointer for logarithmic ancestor walks.
    pub skip: Option<ArenaIx>,
    /// Height of the block in the chain.
    pub height: u32,
    /// Block file holding the raw block, when data is available.
    pub file: u32,
    /// Byte offset of the block inside its file.
    pub data_pos: u32,
    /// Byte offset of the undo data inside the undo file.
    pub undo_pos: u32,
    /// Validation status, a combination of [`block_status`] bits.
    pub status: u32,
    /// Number of transactions in the block.
    pub tx_count: u32,

    /// Header: block version.
    pub version: i32,
    /// Header: merkle root.
    pub merkle_root: MerkleRoot,
    /// Header: timestamp.
    pub time: u32,
    /// Header: compact difficulty target.
    pub bits: u32,
    /// Header: nonce.
    pub nonce: u32,

    /// Amount of new money created by this block.
    pub mint: Amount,
    /// Total supply after this block.
    pub money_supply: Amount,
    /// Stake-related flags, a combination of [`stake_flags`] bits.
    pub flags: u32,
    /// Stake modifier mixed into the next kernel.
    pub stake_modifier: u64,
    /// Outpoint staked by a proof-of-stake block; null for PoW.
    pub prevout_stake: OutPoint,
    /// Timestamp of the staked output; zero for PoW.
    pub stake_time: u32,
    /// Kernel hash of a proof-of-stake block; zero for PoW.
    pub hash_proof_of_stake: sha256d::Hash,
    /// Coinstake txids of the lottery winners paid at this block.
    pub lottery_winners: Vec<Txid>,
    /// Accumulator checkpoint carried by this block.
    pub accumulator_checkpoint: sha256d::Hash,
}

impl BlockIndex {
    fn new(hash: BlockHash) -> Self {
        Self {
            hash,
            prev: None,
            next: None,
            skip: None,
            height: 0,
            file: 0,
            data_pos: 0,
            undo_pos: 0,
            status: 0,
            tx_count: 0,
            version: 0,
            merkle_root: MerkleRoot::all_zeros(),
            time: 0,
            bits: 0,
            nonce: 0,
            mint: 0,
            money_supply: 0,
            flags: 0,
            stake_modifier: 0,
            prevout_stake: OutPoint::null(),
            stake_time: 0,
            hash_proof_of_stake: sha256d::Hash::all_zeros(),
            lottery_winners: Vec::new(),
            accumulator_checkpoint: sha256d::Hash::all_zeros(),
        }
    }

    /// Whether the block was produced by staking.
    pub fn is_proof_of_stake(&self) -> bool {
        self.flags & stake_flags::PROOF_OF_STAKE != 0
    }
}

/// Owned arena of block index entries, interned by block hash.
///
/// `insert` either returns the existing entry for a hash or creates a
/// placeholder to be filled in by the caller, mirroring how the block
/// tree is reconstructed from disk records that may reference parents
/// not seen yet.
#[derive(Debug, Default)]
pub struct BlockIndexArena {
    entries: Vec<BlockIndex>,
    by_hash: HashMap<BlockHash, ArenaIx>,
}

impl BlockIndexArena {
    /// Constructs an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of interned entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the arena holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Interns `hash`, creating a default entry when it is new.
    pub fn insert(&mut self, hash: BlockHash) -> ArenaIx {
        if let Some(ix) = self.by_hash.get(&hash) {
            return *ix;
        }
        let ix = ArenaIx(self.entries.len() as u32);
        self.entries.push(BlockIndex::new(hash));
        self.by_hash.insert(hash, ix);
        ix
    }

    /// Looks up the entry for `hash` without creating one.
    pub fn lookup(&self, hash: &BlockHash) -> Option<ArenaIx> {
        self.by_hash.get(hash).copied()
    }

    /// Shared access to an entry.
    pub fn get(&self, ix: ArenaIx) -> &BlockIndex {
        &self.entries[ix.index()]
    }

    /// Exclusive access to an entry.
    pub fn get_mut(&mut self, ix: ArenaIx) -> &mut BlockIndex {
        &mut self.entries[ix.index()]
    }

    /// Height shorthand.
    pub fn height(&self, ix: ArenaIx) -> u32 {
        self.get(ix).height
    }

    /// Walks to the ancestor of `ix` at `height`.
    ///
    /// Uses the skip pointers where they help, falling back to parent
    /// hops; returns `None` when `height` exceeds the entry's height.
    pub fn ancestor(&self, ix: ArenaIx, height: u32) -> Option<ArenaIx> {
        let mut walk = ix;
        let mut height_walk = self.get(walk).height;
        if height > height_walk {
            return None;
        }
        while height_walk > height {
            let entry = self.get(walk);
            let height_skip = skip_height(height_walk);
            match entry.skip {
                Some(skip)
                    if height_skip == height
                        || (height_skip > height
                            && !(skip_height(height_walk - 1) < height_skip.saturating_sub(2)
                                && skip_height(height_walk - 1) >= height)) =>
                {
                    walk = skip;
                    height_walk = height_skip;
                }
                _ => {
                    walk = entry.prev?;
                    height_walk -= 1;
                }
            }
        }
        Some(walk)
    }

    /// Computes the skip pointer of `ix` from its parent linkage.
    ///
    /// Must be called with all lower entries' skip pointers already
    /// built, e.g. in increasing height order after a reload.
    pub fn build_skip(&mut self, ix: ArenaIx) {
        let entry = self.get(ix);
        let skip = match entry.prev {
            Some(prev) => self.ancestor(prev, skip_height(entry.height)),
            None => None,
        };
        self.get_mut(ix).skip = skip;
    }

    /// Builds every entry's skip pointer in height order.
    pub fn build_skips(&mut self) {
        let mut order: Vec<ArenaIx> = (0..self.entries.len() as u32).map(ArenaIx).collect();
        order.sort_by_key(|ix| self.get(*ix).height);
        for ix in order {
            self.build_skip(ix);
        }
    }

    /// Median of the timestamps of the last [`MEDIAN_TIME_SPAN`] blocks
    /// ending at `ix` (inclusive).
    pub fn median_time_past(&self, ix: ArenaIx) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut walk = Some(ix);
        for _ in 0..MEDIAN_TIME_SPAN {
            let Some(cur) = walk else { break };
            let entry = self.get(cur);
            times.push(i64::from(entry.time));
            walk = entry.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }
}

/// Height the skip pointer of a block at `height` jumps to.
///
/// Turning the lowest set bit off twice (then adding one back for odd
/// heights) spreads the pointers so any ancestor is reachable in
/// O(log n) hops.
fn skip_height(height: u32) -> u32 {
    if height < 2 {
        return 0;
    }
    fn invert_lowest_one(n: u32) -> u32 {
        n & (n - 1)
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(n: u32) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&n.to_le_bytes());
        bytes[31] = 0x7f;
        BlockHash::from_byte_array(bytes)
    }

    fn build_chain(arena: &mut BlockIndexArena, length: u32) -> Vec<ArenaIx> {
        let mut chain = Vec::with_capacity(length as usize);
        let mut prev = None;
        for height in 0..length {
            let ix = arena.insert(hash_of(height));
            let entry = arena.get_mut(ix);
            entry.prev = prev;
            entry.height = height;
            entry.time = 1_000 + height * 60;
            arena.build_skip(ix);
            chain.push(ix);
            prev = Some(ix);
        }
        chain
    }

    #[test]
    fn interning_is_idempotent() {
        let mut arena = BlockIndexArena::new();
        let a = arena.insert(hash_of(1));
        let b = arena.insert(hash_of(1));
        assert_eq!(a, b);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.lookup(&hash_of(1)), Some(a));
        assert_eq!(arena.lookup(&hash_of(2)), None);
    }

    #[test]
    fn ancestor_walks_match_heights() {
        let mut arena = BlockIndexArena::new();
        let chain = build_chain(&mut arena, 1_000);
        let tip = *chain.last().unwrap();

        for target in [0u32, 1, 2, 3, 255, 256, 500, 998, 999] {
            let anc = arena.ancestor(tip, target).unwrap();
            assert_eq!(arena.get(anc).height, target);
            assert_eq!(anc, chain[target as usize]);
        }
        assert_eq!(arena.ancestor(tip, 1_000), None);
        assert_eq!(arena.ancestor(chain[0], 0), Some(chain[0]));
    }

    #[test]
    fn median_time_past_is_window_median() {
        let mut arena = BlockIndexArena::new();
        let chain = build_chain(&mut arena, 30);

        // Full 11-block window ending at height 29 covers 19..=29.
        let expected = i64::from(1_000 + 24 * 60);
        assert_eq!(arena.median_time_past(chain[29]), expected);

        // Short window at the start of the chain.
        assert_eq!(arena.median_time_past(chain[0]), 1_000);
        assert_eq!(arena.median_time_past(chain[2]), i64::from(1_000 + 60));
    }

    #[test]
    fn proof_of_stake_flag() {
        let mut arena = BlockIndexArena::new();
        let ix = arena.insert(hash_of(1));
        assert!(!arena.get(ix).is_proof_of_stake());
        arena.get_mut(ix).flags |= stake_flags::PROOF_OF_STAKE;
        assert!(arena.get(ix).is_proof_of_stake());
    }
}
