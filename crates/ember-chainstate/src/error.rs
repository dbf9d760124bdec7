//! Error types for the chainstate databases.

use ember_primitives::BlockHash;

/// Errors raised by the chainstate, block-tree and index stores.
///
/// An [`Error::Rocksdb`] is fatal to the node: the caller must stop
/// accepting blocks and shut down rather than continue over a store in
/// an unknown state. [`Error::Corrupted`] at startup is an operator
/// problem and normally requires a reindex.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    Rocksdb(#[from] rocksdb::Error),

    /// Corrupt record encountered during load or iteration.
    #[error("corrupted record under tag {tag:?}: {reason}")]
    Corrupted {
        /// Key tag the record was filed under.
        tag: char,
        /// Decoder diagnostic.
        reason: String,
    },

    /// A stored proof-of-work block failed its re-check at load.
    #[error("stored block {0} fails its claimed proof of work")]
    BadProofOfWork(BlockHash),

    /// An index was enabled without rebuilding it first.
    #[error("the {index} index was built with different settings; restart with reindex")]
    IndexRequiresReindex {
        /// Name of the offending index flag.
        index: &'static str,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps a decode failure of a record filed under `tag`.
    pub(crate) fn corrupted(tag: u8, err: impl std::fmt::Display) -> Self {
        Self::Corrupted {
            tag: tag as char,
            reason: err.to_string(),
        }
    }
}
