//! Persistent chainstate for the Ember node.
//!
//! This crate owns everything the node keeps on disk about the chain:
//!
//! - **Coin view**: a layered cache/store of the UTXO set, flushed in
//!   atomic batches together with the best-block marker.
//! - **Block tree**: the block-index records from which the in-memory
//!   block forest is rebuilt at startup.
//! - **Auxiliary indexes**: optional address, address-unspent, spent
//!   and tx/bare-txid indexes sharing the block-tree database.
//!
//! All persistence goes through a single ordered key-value engine; keys
//! are a one-byte tag followed by the consensus encoding of the
//! structured remainder, so range scans by prefix walk entries in
//! ledger order.

mod block_tree;
mod coins_view;
mod config;
mod context;
mod error;
mod indexes;
mod interrupt;
mod kv;

pub use block_tree::{BlockFileInfo, BlockTreeDb, DiskBlockIndex};
pub use coins_view::{CoinsCacheEntry, CoinsMap, CoinsStats, CoinsView, CoinsViewCache, CoinsViewDb};
pub use config::{Config, DEFAULT_COINS_CACHE, DEFAULT_INDEX_CACHE};
pub use context::{ChainState, NodeContext};
pub use error::Error;
pub use indexes::{
    address_type, AddressIndexKey, AddressUnspentKey, AddressUnspentValue, DiskTxPos, IndexScan,
    SpentIndexKey, SpentIndexValue, TxIndexEntry,
};
pub use interrupt::Interrupt;
pub use kv::{KvBatch, KvDatabase};

/// Result type for chainstate operations.
pub type Result<T> = std::result::Result<T, Error>;
