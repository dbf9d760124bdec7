//! Core primitives shared across the Ember node.
//!
//! This crate holds the consensus-critical value types the rest of the
//! node is built from: the hash domain, outpoints and coins records,
//! the in-memory block index (an owned arena rather than a web of raw
//! pointers), chain parameters and the proof-of-work re-check used when
//! reloading the block tree from disk.

pub mod codec;

mod chain;
mod coins;
mod hashes;
mod params;
mod pow;

pub use chain::{
    block_status, stake_flags, ArenaIx, BlockIndex, BlockIndexArena, MEDIAN_TIME_SPAN,
};
pub use coins::{Coins, OutPoint, TxOut};
pub use hashes::{AddressHash, BareTxid, BlockHash, MerkleRoot, Txid};
pub use params::{
    BipDeployment, ChainParams, DeploymentPos, Network, MAX_VERSION_BITS_DEPLOYMENTS,
};
pub use pow::check_proof_of_work;

/// Monetary amount in the smallest unit.
pub type Amount = i64;

/// One coin in the smallest unit.
pub const COIN: Amount = 100_000_000;
