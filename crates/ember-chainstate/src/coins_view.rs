//! Layered views over the unspent transaction output set.
//!
//! [`CoinsViewDb`] is the durable bottom layer; [`CoinsViewCache`] sits
//! on top of it as the tip cache, tracking which records were modified
//! since the last flush. Neither layer synchronizes itself: callers
//! hold the chain-state lock for the whole read-modify-flush cycle.

use crate::interrupt::Interrupt;
use crate::kv::{bare_key, make_key, tag, KvBatch, KvDatabase};
use crate::Result;
use bitcoin::consensus::{serialize, Encodable};
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use ember_primitives::codec::write_compact_size;
use ember_primitives::{Amount, BlockHash, BlockIndexArena, Coins, Txid};
use std::collections::HashMap;

/// A cached coins record together with its cache flags.
#[derive(Debug, Clone)]
pub struct CoinsCacheEntry {
    /// The cached record.
    pub coins: Coins,
    /// Combination of [`CoinsCacheEntry::DIRTY`] and
    /// [`CoinsCacheEntry::FRESH`].
    pub flags: u8,
}

impl CoinsCacheEntry {
    /// The record was modified since the last flush.
    pub const DIRTY: u8 = 1 << 0;
    /// The record does not exist in the layer below.
    pub const FRESH: u8 = 1 << 1;

    fn is_dirty(&self) -> bool {
        self.flags & Self::DIRTY != 0
    }

    fn is_fresh(&self) -> bool {
        self.flags & Self::FRESH != 0
    }
}

/// The tip cache's map of txids to cached records.
pub type CoinsMap = HashMap<Txid, CoinsCacheEntry>;

/// Read and batched-write access to a layer of the UTXO set.
pub trait CoinsView {
    /// The coins record of `txid`, if any.
    fn get_coins(&mut self, txid: &Txid) -> Result<Option<Coins>>;

    /// Whether an unpruned record exists for `txid`.
    fn have_coins(&mut self, txid: &Txid) -> Result<bool>;

    /// The best block the layer is consistent with; all-zero before the
    /// first flush.
    fn get_best_block(&self) -> Result<BlockHash>;

    /// Applies all dirty entries of `coins` and, when `best_block` is
    /// not the zero sentinel, the new best-block marker, atomically.
    fn batch_write(&mut self, coins: CoinsMap, best_block: BlockHash) -> Result<()>;
}

impl<V: CoinsView + ?Sized> CoinsView for &mut V {
    fn get_coins(&mut self, txid: &Txid) -> Result<Option<Coins>> {
        (**self).get_coins(txid)
    }

    fn have_coins(&mut self, txid: &Txid) -> Result<bool> {
        (**self).have_coins(txid)
    }

    fn get_best_block(&self) -> Result<BlockHash> {
        (**self).get_best_block()
    }

    fn batch_write(&mut self, coins: CoinsMap, best_block: BlockHash) -> Result<()> {
        (**self).batch_write(coins, best_block)
    }
}

/// Summary of a full scan over the stored UTXO set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinsStats {
    /// Best block the scanned state corresponds to.
    pub best_block: BlockHash,
    /// Height of that block, when the block index knows it.
    pub height: u32,
    /// Number of unpruned coins records.
    pub transactions: u64,
    /// Number of unspent outputs across all records.
    pub transaction_outputs: u64,
    /// Rough serialized size of all records.
    pub serialized_size: u64,
    /// Canonical digest over the whole set.
    pub hash_serialized: sha256d::Hash,
    /// Sum of all unspent output values.
    pub total_amount: Amount,
}

/// The durable bottom layer of the coin view, backed by the
/// `chainstate/` database.
pub struct CoinsViewDb {
    db: KvDatabase,
}

impl CoinsViewDb {
    /// Opens the coins database under `datadir`, optionally wiping it
    /// first.
    pub fn open(datadir: &std::path::Path, cache_size: usize, wipe: bool) -> Result<Self> {
        let path = datadir.join("chainstate");
        if wipe && path.exists() {
            KvDatabase::destroy(&path)?;
        }
        Ok(Self {
            db: KvDatabase::open(&path, cache_size)?,
        })
    }

    /// Scans every coins record, folding the canonical state digest.
    ///
    /// Returns `Ok(None)` when `interrupt` fires mid-scan; a partial
    /// digest is of no use to anyone.
    pub fn get_stats(
        &self,
        block_index: &BlockIndexArena,
        interrupt: &Interrupt,
    ) -> Result<Option<CoinsStats>> {
        let best_block = self.get_best_block()?;

        let mut engine = sha256d::Hash::engine();
        encode_to_engine(&best_block, &mut engine);

        let mut transactions = 0u64;
        let mut transaction_outputs = 0u64;
        let mut serialized_size = 0u64;
        let mut total_amount: Amount = 0;

        let mut iter = self.db.iter_from(&[]);
        while iter.valid() {
            if interrupt.is_set() {
                return Ok(None);
            }
            let (key, value) = (
                iter.key().expect("valid iterator has a key; qed"),
                iter.value().expect("valid iterator has a value; qed"),
            );
            if key[0] == tag::COINS {
                let txid = crate::kv::kv_decode::<Txid>(tag::COINS, &key[1..])?;
                let coins = crate::kv::kv_decode::<Coins>(tag::COINS, value)?;

                encode_to_engine(&txid, &mut engine);
                input_compact_size(&mut engine, u64::from(coins.version));
                engine.input(&[if coins.coinbase { b'c' } else { b'n' }]);
                input_compact_size(&mut engine, u64::from(coins.height));
                transactions += 1;
                for (i, out) in coins.outputs.iter().enumerate() {
                    if !out.is_null() {
                        transaction_outputs += 1;
                        input_compact_size(&mut engine, i as u64 + 1);
                        encode_to_engine(out, &mut engine);
                        total_amount += out.value;
                    }
                }
                input_compact_size(&mut engine, 0);
                serialized_size += 32 + value.len() as u64;
            }
            iter.next();
        }
        iter.status()?;

        let height = block_index
            .lookup(&best_block)
            .map(|ix| block_index.height(ix))
            .unwrap_or(0);

        Ok(Some(CoinsStats {
            best_block,
            height,
            transactions,
            transaction_outputs,
            serialized_size,
            hash_serialized: sha256d::Hash::from_engine(engine),
            total_amount,
        }))
    }
}

impl CoinsView for CoinsViewDb {
    fn get_coins(&mut self, txid: &Txid) -> Result<Option<Coins>> {
        self.db.read(&make_key(tag::COINS, txid))
    }

    fn have_coins(&mut self, txid: &Txid) -> Result<bool> {
        self.db.exists(&make_key(tag::COINS, txid))
    }

    fn get_best_block(&self) -> Result<BlockHash> {
        Ok(self
            .db
            .read(&bare_key(tag::BEST_BLOCK))?
            .unwrap_or_else(BlockHash::zero))
    }

    fn batch_write(&mut self, coins: CoinsMap, best_block: BlockHash) -> Result<()> {
        let mut batch = KvBatch::new();
        let count = coins.len();
        let mut changed = 0usize;
        for (txid, entry) in coins {
            if entry.is_dirty() {
                // A fully pruned record is erased rather than stored.
                if entry.coins.is_pruned() {
                    batch.delete(make_key(tag::COINS, &txid));
                } else {
                    batch.put(make_key(tag::COINS, &txid), &entry.coins);
                }
                changed += 1;
            }
        }
        if !best_block.is_zero() {
            batch.put(bare_key(tag::BEST_BLOCK), &best_block);
        }
        tracing::debug!(
            "Committing {changed} changed transactions (out of {count}) to coin database"
        );
        self.db.write_batch(batch)
    }
}

/// The tip cache over a backing coin view.
///
/// Records are pulled in lazily on reads and marked dirty through
/// [`CoinsViewCache::modify`]; [`CoinsViewCache::flush`] drains the
/// whole cache into one atomic batch on the backing view.
pub struct CoinsViewCache<V: CoinsView> {
    base: V,
    cache: CoinsMap,
    best_block: Option<BlockHash>,
}

impl<V: CoinsView> CoinsViewCache<V> {
    /// Constructs an empty cache over `base`.
    pub fn new(base: V) -> Self {
        Self {
            base,
            cache: CoinsMap::new(),
            best_block: None,
        }
    }

    /// Number of records currently cached.
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Shared access to the backing view.
    pub fn base(&self) -> &V {
        &self.base
    }

    fn fetch(&mut self, txid: &Txid) -> Result<Option<&CoinsCacheEntry>> {
        if !self.cache.contains_key(txid) {
            match self.base.get_coins(txid)? {
                Some(coins) => {
                    self.cache
                        .insert(*txid, CoinsCacheEntry { coins, flags: 0 });
                }
                None => return Ok(None),
            }
        }
        Ok(self.cache.get(txid))
    }

    /// Exclusive access to the coins record of `txid`, creating a fresh
    /// empty record when neither layer has one.
    ///
    /// The returned record is marked dirty up front; it is flushed (or
    /// erased, if left fully pruned) on the next [`flush`].
    ///
    /// [`flush`]: CoinsViewCache::flush
    pub fn modify(&mut self, txid: &Txid) -> Result<&mut Coins> {
        if !self.cache.contains_key(txid) {
            let (coins, fresh) = match self.base.get_coins(txid)? {
                Some(coins) => (coins, 0),
                None => (Coins::new(false, 0, 0, Vec::new()), CoinsCacheEntry::FRESH),
            };
            self.cache.insert(
                *txid,
                CoinsCacheEntry {
                    coins,
                    flags: fresh,
                },
            );
        }
        let entry = self
            .cache
            .get_mut(txid)
            .expect("entry was just inserted; qed");
        entry.flags |= CoinsCacheEntry::DIRTY;
        Ok(&mut entry.coins)
    }

    /// Atomically persists all dirty entries together with the new
    /// best-block marker, then empties the cache.
    pub fn flush(&mut self, best_block: BlockHash) -> Result<()> {
        let map = std::mem::take(&mut self.cache);
        self.base.batch_write(map, best_block)?;
        if !best_block.is_zero() {
            self.best_block = Some(best_block);
        }
        Ok(())
    }
}

impl<V: CoinsView> CoinsView for CoinsViewCache<V> {
    fn get_coins(&mut self, txid: &Txid) -> Result<Option<Coins>> {
        Ok(self.fetch(txid)?.map(|entry| entry.coins.clone()))
    }

    fn have_coins(&mut self, txid: &Txid) -> Result<bool> {
        // A cached fully-pruned record means the coins are gone even if
        // the layer below still holds a stale copy.
        match self.fetch(txid)? {
            Some(entry) => Ok(!entry.coins.is_pruned()),
            None => Ok(false),
        }
    }

    fn get_best_block(&self) -> Result<BlockHash> {
        match self.best_block {
            Some(hash) => Ok(hash),
            None => self.base.get_best_block(),
        }
    }

    fn batch_write(&mut self, coins: CoinsMap, best_block: BlockHash) -> Result<()> {
        for (txid, entry) in coins {
            if entry.is_dirty() {
                // Entries fresh in the child supersede whatever the
                // cache holds; otherwise merge on top.
                if entry.is_fresh() && entry.coins.is_pruned() {
                    self.cache.remove(&txid);
                } else {
                    self.cache.insert(txid, entry);
                }
            }
        }
        if !best_block.is_zero() {
            self.best_block = Some(best_block);
        }
        Ok(())
    }
}

fn encode_to_engine<T: Encodable, E: HashEngine>(value: &T, engine: &mut E) {
    engine.input(&serialize(value));
}

fn input_compact_size<E: HashEngine>(engine: &mut E, size: u64) {
    let mut buf = Vec::with_capacity(9);
    write_compact_size(&mut buf, size).expect("writing to a Vec cannot fail; qed");
    engine.input(&buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_primitives::TxOut;

    fn txid_of(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    fn open_db() -> (CoinsViewDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = CoinsViewDb::open(dir.path(), 1 << 20, false).expect("open");
        (db, dir)
    }

    #[test]
    fn cache_loads_lazily_and_flushes_dirty_entries() {
        let (db, _dir) = open_db();
        let mut cache = CoinsViewCache::new(db);
        let txid = txid_of(1);
        let best = BlockHash::from_byte_array([0xaa; 32]);

        assert!(!cache.have_coins(&txid).unwrap());

        *cache.modify(&txid).unwrap() =
            Coins::new(false, 10, 1, vec![TxOut::new(500, vec![0x51])]);
        assert!(cache.have_coins(&txid).unwrap());

        cache.flush(best).unwrap();
        assert_eq!(cache.cache_size(), 0);
        assert_eq!(cache.get_best_block().unwrap(), best);

        // The record survives the flush and reloads from the base.
        let coins = cache.get_coins(&txid).unwrap().unwrap();
        assert_eq!(coins.outputs[0].value, 500);
        assert_eq!(cache.cache_size(), 1);
    }

    #[test]
    fn unflushed_best_block_comes_from_base() {
        let (db, _dir) = open_db();
        let mut cache = CoinsViewCache::new(db);
        assert!(cache.get_best_block().unwrap().is_zero());

        // Flushing with the zero sentinel must not install a marker.
        *cache.modify(&txid_of(9)).unwrap() =
            Coins::new(false, 1, 1, vec![TxOut::new(1, vec![])]);
        cache.flush(BlockHash::zero()).unwrap();
        assert!(cache.get_best_block().unwrap().is_zero());
    }

    #[test]
    fn fresh_pruned_records_do_not_resurrect() {
        let (db, _dir) = open_db();
        let mut cache = CoinsViewCache::new(db);
        let txid = txid_of(2);

        // Created and fully spent between flushes.
        *cache.modify(&txid).unwrap() =
            Coins::new(false, 10, 1, vec![TxOut::new(5, vec![0x51])]);
        cache.modify(&txid).unwrap().spend(0);
        assert!(!cache.have_coins(&txid).unwrap());

        cache.flush(BlockHash::from_byte_array([0xbb; 32])).unwrap();
        assert!(!cache.have_coins(&txid).unwrap());
    }
}
