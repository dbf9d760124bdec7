//! Node configuration recognized by the chainstate layer.

use std::path::PathBuf;

/// Default byte budget of the coins tip cache.
pub const DEFAULT_COINS_CACHE: usize = 64 << 20;

/// Default byte budget of the block-tree database cache.
pub const DEFAULT_INDEX_CACHE: usize = 2 << 20;

/// Configuration of the on-disk chain state.
///
/// Enabling any of the auxiliary indexes on a database that was built
/// without it requires `reindex`; startup fails otherwise.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all node state; the databases live in `chainstate/` and
    /// `blocks/index/` below it.
    pub datadir: PathBuf,

    /// Wipe the block tree and rebuild it from the raw block files.
    pub reindex: bool,

    /// Byte budget of the coins tip cache.
    pub coins_cache_size: usize,

    /// Byte budget of the block-tree database cache.
    pub index_cache_size: usize,

    /// Maintain the transaction position index (`'t'`/`'T'`).
    pub txindex: bool,

    /// Maintain the address and address-unspent indexes (`'a'`/`'u'`).
    pub addressindex: bool,

    /// Maintain the spent-output index (`'p'`).
    pub spentindex: bool,
}

impl Config {
    /// Configuration with default settings rooted at `datadir`.
    pub fn new(datadir: impl Into<PathBuf>) -> Self {
        Self {
            datadir: datadir.into(),
            reindex: false,
            coins_cache_size: DEFAULT_COINS_CACHE,
            index_cache_size: DEFAULT_INDEX_CACHE,
            txindex: false,
            addressindex: false,
            spentindex: false,
        }
    }
}
