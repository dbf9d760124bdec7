//! Proof-of-work verification.

use crate::hashes::BlockHash;
use crate::params::ChainParams;
use bitcoin::hashes::Hash;
use bitcoin::pow::{CompactTarget, Target};

/// Checks that `hash` satisfies the difficulty claimed by `bits`.
///
/// Used both when accepting new PoW blocks and when re-verifying stored
/// index entries at startup; the claimed target must decode into the
/// admissible range before the hash is compared against it.
pub fn check_proof_of_work(hash: BlockHash, bits: u32, params: &ChainParams) -> bool {
    let target = Target::from_compact(CompactTarget::from_consensus(bits));

    if target == Target::ZERO || target > params.pow_limit {
        return false;
    }

    target.is_met_by(bitcoin::BlockHash::from_byte_array(hash.to_byte_array()))
}
