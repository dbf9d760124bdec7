//! Top-level ownership of the chain state.
//!
//! Everything the original codebase kept in process-wide singletons
//! (the block map, the stake-seen set, the block tree and the coins
//! tip) lives here behind one chain-state lock, owned by the driver
//! and threaded through by reference.

use crate::block_tree::BlockTreeDb;
use crate::coins_view::{CoinsViewCache, CoinsViewDb};
use crate::config::Config;
use crate::interrupt::Interrupt;
use crate::{Error, Result};
use ember_primitives::{BlockIndexArena, ChainParams, OutPoint};
use ember_versionbits::VersionBitsCache;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;

/// Everything guarded by the chain-state lock.
pub struct ChainState {
    /// The in-memory block forest.
    pub block_index: BlockIndexArena,
    /// Staked outpoints already seen, to reject stake reuse.
    pub stake_seen: HashSet<(OutPoint, u32)>,
    /// The block-tree database.
    pub block_tree: BlockTreeDb,
    /// The coins tip cache over the chainstate database.
    pub coins: CoinsViewCache<CoinsViewDb>,
    /// Version-bits deployment states along the active chain.
    pub versionbits: VersionBitsCache,
}

/// The node's chain-state context: parameters plus the locked state.
///
/// Consensus work (block connection, flushes, index updates) runs with
/// the lock held for the whole read-modify-flush cycle.
pub struct NodeContext {
    /// Parameters of the selected network.
    pub params: ChainParams,
    chain: Mutex<ChainState>,
}

impl NodeContext {
    /// Opens the databases under `config.datadir` and wires up an empty
    /// in-memory state.
    ///
    /// On `config.reindex` the block tree is wiped and the reindex
    /// marker is written so an aborted rebuild is detected on the next
    /// start.
    pub fn open(params: ChainParams, config: &Config) -> Result<Self> {
        let block_tree = BlockTreeDb::open(&config.datadir, config.index_cache_size, config.reindex)?;
        if config.reindex {
            block_tree.write_reindexing(true)?;
        }
        verify_index_flags(&block_tree, config)?;

        let coins_db = CoinsViewDb::open(&config.datadir, config.coins_cache_size, false)?;
        tracing::info!(
            network = params.network.name(),
            datadir = %config.datadir.display(),
            "Opened chainstate databases"
        );

        Ok(Self {
            params,
            chain: Mutex::new(ChainState {
                block_index: BlockIndexArena::new(),
                stake_seen: HashSet::new(),
                block_tree,
                coins: CoinsViewCache::new(coins_db),
                versionbits: VersionBitsCache::new(),
            }),
        })
    }

    /// Locks the chain state.
    pub fn chain(&self) -> MutexGuard<'_, ChainState> {
        self.chain.lock()
    }

    /// Reloads the block forest and the stake-seen set from disk.
    ///
    /// Returns `Ok(false)` when interrupted before completion.
    pub fn load_block_index(&self, interrupt: &Interrupt) -> Result<bool> {
        let mut chain = self.chain.lock();
        let ChainState {
            ref mut block_index,
            ref mut stake_seen,
            ref block_tree,
            ..
        } = *chain;
        block_tree.load_block_index_guts(block_index, stake_seen, &self.params, interrupt)
    }
}

/// Compares the stored index flags against the requested configuration.
///
/// Fresh databases (no flag stored yet) adopt the requested setting;
/// anything else may only change under a reindex, since the records of
/// a disabled index were never written.
fn verify_index_flags(block_tree: &BlockTreeDb, config: &Config) -> Result<()> {
    let checks: [(&'static str, bool); 3] = [
        ("txindex", config.txindex),
        ("addressindex", config.addressindex),
        ("spentindex", config.spentindex),
    ];
    for (name, requested) in checks {
        match block_tree.read_flag(name)? {
            None => block_tree.write_flag(name, requested)?,
            Some(stored) if stored == requested => {}
            Some(_) if config.reindex => block_tree.write_flag(name, requested)?,
            Some(_) => return Err(Error::IndexRequiresReindex { index: name }),
        }
    }
    Ok(())
}
