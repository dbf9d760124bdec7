//! The block-tree database.
//!
//! Persists one record per block-index entry plus a handful of small
//! markers (block-file info, the last used file, the reindex flag and
//! named flags/integers), and rebuilds the in-memory block forest from
//! those records at startup.

use crate::interrupt::Interrupt;
use crate::kv::{bare_key, kv_decode, make_key, tag, KvBatch, KvDatabase};
use crate::{Error, Result};
use bitcoin::consensus::{encode, Decodable, Encodable};
use bitcoin::hashes::sha256d;
use bitcoin::io;
use ember_primitives::codec::{read_compact_size, write_compact_size};
use ember_primitives::{
    check_proof_of_work, Amount, ArenaIx, BlockHash, BlockIndexArena, ChainParams, MerkleRoot,
    OutPoint, Txid,
};
use std::collections::HashSet;
use std::path::Path;

/// The durable form of one block-index entry.
///
/// Linkage is stored by hash; the zero hash stands for "no block" both
/// for the genesis parent and for entries without a selected successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskBlockIndex {
    /// Hash of the block; also the record's key.
    pub hash: BlockHash,
    /// Hash of the parent block.
    pub prev_hash: BlockHash,
    /// Advisory successor on the currently-selected chain.
    pub next_hash: BlockHash,
    /// Height of the block.
    pub height: u32,
    /// Block file number.
    pub file: u32,
    /// Offset of the block data inside its file.
    pub data_pos: u32,
    /// Offset of the undo data inside the undo file.
    pub undo_pos: u32,
    /// Validation status bits.
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
    /// New money created by the block.
    pub mint: Amount,
    /// Total supply after the block.
    pub money_supply: Amount,
    /// Stake flag bits.
    pub flags: u32,
    /// Stake modifier.
    pub stake_modifier: u64,
    /// Staked outpoint; null for proof-of-work blocks.
    pub prevout_stake: OutPoint,
    /// Timestamp of the staked output; zero for proof-of-work blocks.
    pub stake_time: u32,
    /// Kernel hash; zero for proof-of-work blocks.
    pub hash_proof_of_stake: sha256d::Hash,
    /// Coinstake txids of the lottery winners paid at this block.
    pub lottery_winners: Vec<Txid>,
    /// Accumulator checkpoint carried by the block.
    pub accumulator_checkpoint: sha256d::Hash,
}

impl DiskBlockIndex {
    /// Snapshots the arena entry at `ix` into its durable form.
    pub fn from_entry(arena: &BlockIndexArena, ix: ArenaIx) -> Self {
        let entry = arena.get(ix);
        let link = |link: Option<ArenaIx>| {
            link.map(|l| arena.get(l).hash).unwrap_or_else(BlockHash::zero)
        };
        Self {
            hash: entry.hash,
            prev_hash: link(entry.prev),
            next_hash: link(entry.next),
            height: entry.height,
            file: entry.file,
            data_pos: entry.data_pos,
            undo_pos: entry.undo_pos,
            status: entry.status,
            tx_count: entry.tx_count,
            version: entry.version,
            merkle_root: entry.merkle_root,
            time: entry.time,
            bits: entry.bits,
            nonce: entry.nonce,
            mint: entry.mint,
            money_supply: entry.money_supply,
            flags: entry.flags,
            stake_modifier: entry.stake_modifier,
            prevout_stake: entry.prevout_stake,
            stake_time: entry.stake_time,
            hash_proof_of_stake: entry.hash_proof_of_stake,
            lottery_winners: entry.lottery_winners.clone(),
            accumulator_checkpoint: entry.accumulator_checkpoint,
        }
    }

    /// Interns this record (and its linked hashes) into `arena`,
    /// copying every scalar field.
    pub fn apply_to(&self, arena: &mut BlockIndexArena) -> ArenaIx {
        let ix = arena.insert(self.hash);
        let prev = (!self.prev_hash.is_zero()).then(|| arena.insert(self.prev_hash));
        let next = (!self.next_hash.is_zero()).then(|| arena.insert(self.next_hash));

        let entry = arena.get_mut(ix);
        entry.prev = prev;
        entry.next = next;
        entry.height = self.height;
        entry.file = self.file;
        entry.data_pos = self.data_pos;
        entry.undo_pos = self.undo_pos;
        entry.status = self.status;
        entry.tx_count = self.tx_count;
        entry.version = self.version;
        entry.merkle_root = self.merkle_root;
        entry.time = self.time;
        entry.bits = self.bits;
        entry.nonce = self.nonce;
        entry.mint = self.mint;
        entry.money_supply = self.money_supply;
        entry.flags = self.flags;
        entry.stake_modifier = self.stake_modifier;
        entry.prevout_stake = self.prevout_stake;
        entry.stake_time = self.stake_time;
        entry.hash_proof_of_stake = self.hash_proof_of_stake;
        entry.lottery_winners = self.lottery_winners.clone();
        entry.accumulator_checkpoint = self.accumulator_checkpoint;
        ix
    }

    /// Whether the recorded block is proof-of-stake.
    pub fn is_proof_of_stake(&self) -> bool {
        self.flags & ember_primitives::stake_flags::PROOF_OF_STAKE != 0
    }
}

impl Encodable for DiskBlockIndex {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> std::result::Result<usize, io::Error> {
        let mut len = self.hash.consensus_encode(w)?;
        len += self.prev_hash.consensus_encode(w)?;
        len += self.next_hash.consensus_encode(w)?;
        len += self.height.consensus_encode(w)?;
        len += self.file.consensus_encode(w)?;
        len += self.data_pos.consensus_encode(w)?;
        len += self.undo_pos.consensus_encode(w)?;
        len += self.status.consensus_encode(w)?;
        len += self.tx_count.consensus_encode(w)?;
        len += self.version.consensus_encode(w)?;
        len += self.merkle_root.consensus_encode(w)?;
        len += self.time.consensus_encode(w)?;
        len += self.bits.consensus_encode(w)?;
        len += self.nonce.consensus_encode(w)?;
        len += self.mint.consensus_encode(w)?;
        len += self.money_supply.consensus_encode(w)?;
        len += self.flags.consensus_encode(w)?;
        len += self.stake_modifier.consensus_encode(w)?;
        len += self.prevout_stake.consensus_encode(w)?;
        len += self.stake_time.consensus_encode(w)?;
        len += self.hash_proof_of_stake.consensus_encode(w)?;
        len += write_compact_size(w, self.lottery_winners.len() as u64)?;
        for winner in &self.lottery_winners {
            len += winner.consensus_encode(w)?;
        }
        len += self.accumulator_checkpoint.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for DiskBlockIndex {
    fn consensus_decode<R: io::BufRead + ?Sized>(r: &mut R) -> std::result::Result<Self, encode::Error> {
        let hash = BlockHash::consensus_decode(r)?;
        let prev_hash = BlockHash::consensus_decode(r)?;
        let next_hash = BlockHash::consensus_decode(r)?;
        let height = u32::consensus_decode(r)?;
        let file = u32::consensus_decode(r)?;
        let data_pos = u32::consensus_decode(r)?;
        let undo_pos = u32::consensus_decode(r)?;
        let status = u32::consensus_decode(r)?;
        let tx_count = u32::consensus_decode(r)?;
        let version = i32::consensus_decode(r)?;
        let merkle_root = MerkleRoot::consensus_decode(r)?;
        let time = u32::consensus_decode(r)?;
        let bits = u32::consensus_decode(r)?;
        let nonce = u32::consensus_decode(r)?;
        let mint = Amount::consensus_decode(r)?;
        let money_supply = Amount::consensus_decode(r)?;
        let flags = u32::consensus_decode(r)?;
        let stake_modifier = u64::consensus_decode(r)?;
        let prevout_stake = OutPoint::consensus_decode(r)?;
        let stake_time = u32::consensus_decode(r)?;
        let hash_proof_of_stake = sha256d::Hash::consensus_decode(r)?;
        let winners = read_compact_size(r)?;
        let mut lottery_winners = Vec::with_capacity(winners.min(64) as usize);
        for _ in 0..winners {
            lottery_winners.push(Txid::consensus_decode(r)?);
        }
        let accumulator_checkpoint = sha256d::Hash::consensus_decode(r)?;
        Ok(Self {
            hash,
            prev_hash,
            next_hash,
            height,
            file,
            data_pos,
            undo_pos,
            status,
            tx_count,
            version,
            merkle_root,
            time,
            bits,
            nonce,
            mint,
            money_supply,
            flags,
            stake_modifier,
            prevout_stake,
            stake_time,
            hash_proof_of_stake,
            lottery_winners,
            accumulator_checkpoint,
        })
    }
}

/// Bookkeeping about one raw block file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFileInfo {
    /// Number of blocks stored in the file.
    pub blocks: u32,
    /// Bytes used of the block file.
    pub size: u32,
    /// Bytes used of the matching undo file.
    pub undo_size: u32,
    /// Lowest block height stored in the file.
    pub height_first: u32,
    /// Highest block height stored in the file.
    pub height_last: u32,
    /// Earliest block time stored in the file.
    pub time_first: u64,
    /// Latest block time stored in the file.
    pub time_last: u64,
}

impl BlockFileInfo {
    /// Folds one more block into the file's bounds.
    pub fn add_block(&mut self, height: u32, time: u64) {
        if self.blocks == 0 || self.height_first > height {
            self.height_first = height;
        }
        if self.blocks == 0 || self.time_first > time {
            self.time_first = time;
        }
        self.blocks += 1;
        if height > self.height_last {
            self.height_last = height;
        }
        if time > self.time_last {
            self.time_last = time;
        }
    }
}

impl std::fmt::Display for BlockFileInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BlockFileInfo(blocks={}, size={}, heights={}..{}, times={}..{})",
            self.blocks, self.size, self.height_first, self.height_last, self.time_first,
            self.time_last
        )
    }
}

impl Encodable for BlockFileInfo {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> std::result::Result<usize, io::Error> {
        let mut len = self.blocks.consensus_encode(w)?;
        len += self.size.consensus_encode(w)?;
        len += self.undo_size.consensus_encode(w)?;
        len += self.height_first.consensus_encode(w)?;
        len += self.height_last.consensus_encode(w)?;
        len += self.time_first.consensus_encode(w)?;
        len += self.time_last.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for BlockFileInfo {
    fn consensus_decode<R: io::BufRead + ?Sized>(r: &mut R) -> std::result::Result<Self, encode::Error> {
        Ok(Self {
            blocks: u32::consensus_decode(r)?,
            size: u32::consensus_decode(r)?,
            undo_size: u32::consensus_decode(r)?,
            height_first: u32::consensus_decode(r)?,
            height_last: u32::consensus_decode(r)?,
            time_first: u64::consensus_decode(r)?,
            time_last: u64::consensus_decode(r)?,
        })
    }
}

/// The `blocks/index/` database.
pub struct BlockTreeDb {
    db: KvDatabase,
}

impl BlockTreeDb {
    /// Opens the block-tree database under `datadir`, optionally
    /// wiping it first.
    pub fn open(datadir: &Path, cache_size: usize, wipe: bool) -> Result<Self> {
        let path = datadir.join("blocks").join("index");
        if wipe && path.exists() {
            KvDatabase::destroy(&path)?;
        }
        Ok(Self {
            db: KvDatabase::open(&path, cache_size)?,
        })
    }

    pub(crate) fn db(&self) -> &KvDatabase {
        &self.db
    }

    /// Persists one block-index record.
    pub fn write_block_index(&self, entry: &DiskBlockIndex) -> Result<()> {
        let mut batch = KvBatch::new();
        batch.put(make_key(tag::BLOCK_INDEX, &entry.hash), entry);
        self.db.write_batch(batch)
    }

    /// Reads one block-index record back.
    pub fn read_block_index(&self, hash: &BlockHash) -> Result<Option<DiskBlockIndex>> {
        self.db.read(&make_key(tag::BLOCK_INDEX, hash))
    }

    /// Persists the info record of block file `n`.
    pub fn write_block_file_info(&self, n: u32, info: &BlockFileInfo) -> Result<()> {
        let mut batch = KvBatch::new();
        batch.put(make_key(tag::FILE_INFO, &n), info);
        self.db.write_batch(batch)
    }

    /// Reads the info record of block file `n`.
    pub fn read_block_file_info(&self, n: u32) -> Result<Option<BlockFileInfo>> {
        self.db.read(&make_key(tag::FILE_INFO, &n))
    }

    /// Records the number of the block file currently appended to.
    pub fn write_last_block_file(&self, n: u32) -> Result<()> {
        let mut batch = KvBatch::new();
        batch.put(bare_key(tag::LAST_FILE), &n);
        self.db.write_batch(batch)
    }

    /// Reads the number of the block file currently appended to.
    pub fn read_last_block_file(&self) -> Result<Option<u32>> {
        self.db.read(&bare_key(tag::LAST_FILE))
    }

    /// Marks (or clears) the reindex-in-progress state.
    pub fn write_reindexing(&self, reindexing: bool) -> Result<()> {
        let mut batch = KvBatch::new();
        if reindexing {
            batch.put(bare_key(tag::REINDEX), &b'1');
        } else {
            batch.delete(bare_key(tag::REINDEX));
        }
        self.db.write_batch(batch)
    }

    /// Whether a reindex was in progress; key presence is the flag, so
    /// this read cannot miss.
    pub fn read_reindexing(&self) -> Result<bool> {
        self.db.exists(&bare_key(tag::REINDEX))
    }

    /// Persists a named boolean flag.
    pub fn write_flag(&self, name: &str, value: bool) -> Result<()> {
        let mut batch = KvBatch::new();
        batch.put(
            make_key(tag::FLAG, &name.to_string()),
            &if value { b'1' } else { b'0' },
        );
        self.db.write_batch(batch)
    }

    /// Reads a named boolean flag.
    pub fn read_flag(&self, name: &str) -> Result<Option<bool>> {
        Ok(self
            .db
            .read::<u8>(&make_key(tag::FLAG, &name.to_string()))?
            .map(|ch| ch == b'1'))
    }

    /// Persists a named integer.
    pub fn write_int(&self, name: &str, value: i32) -> Result<()> {
        let mut batch = KvBatch::new();
        batch.put(make_key(tag::INT, &name.to_string()), &value);
        self.db.write_batch(batch)
    }

    /// Reads a named integer.
    pub fn read_int(&self, name: &str) -> Result<Option<i32>> {
        self.db.read(&make_key(tag::INT, &name.to_string()))
    }

    /// Rebuilds the in-memory block forest from the stored records.
    ///
    /// Entries are interned into `arena` in key order with their
    /// linkage resolved by hash; proof-of-work is re-verified for every
    /// entry at or below the last PoW height, and the staked outpoints
    /// of PoS entries populate `stake_seen`. Skip pointers are built
    /// once all entries are in.
    ///
    /// Returns `Ok(false)` when `interrupt` fires before the scan
    /// completes; the arena then holds a partial forest that must not
    /// be used.
    pub fn load_block_index_guts(
        &self,
        arena: &mut BlockIndexArena,
        stake_seen: &mut HashSet<(OutPoint, u32)>,
        params: &ChainParams,
        interrupt: &Interrupt,
    ) -> Result<bool> {
        let mut loaded = 0usize;
        let mut iter = self.db.iter_from(&bare_key(tag::BLOCK_INDEX));
        while iter.valid() {
            if interrupt.is_set() {
                return Ok(false);
            }
            let key = iter.key().expect("valid iterator has a key; qed");
            if key[0] != tag::BLOCK_INDEX {
                break;
            }
            let value = iter.value().expect("valid iterator has a value; qed");
            let disk: DiskBlockIndex = kv_decode(tag::BLOCK_INDEX, value)?;

            if disk.height <= params.last_pow_block
                && !check_proof_of_work(disk.hash, disk.bits, params)
            {
                return Err(Error::BadProofOfWork(disk.hash));
            }
            if disk.is_proof_of_stake() {
                stake_seen.insert((disk.prevout_stake, disk.stake_time));
            }

            disk.apply_to(arena);
            loaded += 1;
            iter.next();
        }
        iter.status()?;

        arena.build_skips();
        tracing::info!("Loaded {loaded} block index entries");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (BlockTreeDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = BlockTreeDb::open(dir.path(), 1 << 20, false).expect("open");
        (db, dir)
    }

    #[test]
    fn reindexing_flag_round_trips() {
        let (db, _dir) = open_temp();
        assert!(!db.read_reindexing().unwrap());
        db.write_reindexing(true).unwrap();
        assert!(db.read_reindexing().unwrap());
        db.write_reindexing(false).unwrap();
        assert!(!db.read_reindexing().unwrap());
    }

    #[test]
    fn named_flags_and_ints_round_trip() {
        let (db, _dir) = open_temp();
        assert_eq!(db.read_flag("txindex").unwrap(), None);

        db.write_flag("txindex", true).unwrap();
        assert_eq!(db.read_flag("txindex").unwrap(), Some(true));
        db.write_flag("txindex", false).unwrap();
        assert_eq!(db.read_flag("txindex").unwrap(), Some(false));

        db.write_int("dbversion", 3).unwrap();
        assert_eq!(db.read_int("dbversion").unwrap(), Some(3));
        assert_eq!(db.read_int("other").unwrap(), None);
    }

    #[test]
    fn block_file_info_round_trips_and_accumulates() {
        let (db, _dir) = open_temp();

        let mut info = BlockFileInfo::default();
        info.add_block(10, 1_000);
        info.add_block(5, 2_000);
        info.add_block(20, 500);
        assert_eq!(info.blocks, 3);
        assert_eq!((info.height_first, info.height_last), (5, 20));
        assert_eq!((info.time_first, info.time_last), (500, 2_000));

        db.write_block_file_info(0, &info).unwrap();
        db.write_last_block_file(0).unwrap();
        assert_eq!(db.read_block_file_info(0).unwrap(), Some(info));
        assert_eq!(db.read_block_file_info(1).unwrap(), None);
        assert_eq!(db.read_last_block_file().unwrap(), Some(0));
    }
}
