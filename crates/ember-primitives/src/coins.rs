//! Transaction outpoints and per-transaction coins records.

use crate::codec::{read_compact_size, write_compact_size};
use crate::hashes::Txid;
use crate::Amount;
use bitcoin::consensus::{encode, Decodable, Encodable};
use bitcoin::hashes::Hash;
use bitcoin::io;

/// A reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutPoint {
    /// The transaction ID of the referenced output.
    pub txid: Txid,
    /// The index of the output within the referenced transaction.
    pub vout: u32,
}

impl OutPoint {
    /// Constructs a new outpoint.
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The null outpoint carried by coinbase inputs and pure-PoW index
    /// entries.
    pub fn null() -> Self {
        Self {
            txid: Txid::all_zeros(),
            vout: u32::MAX,
        }
    }

    /// Whether this is the null outpoint.
    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl Encodable for OutPoint {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.txid.consensus_encode(w)?;
        len += self.vout.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for OutPoint {
    fn consensus_decode<R: io::BufRead + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(Self {
            txid: Txid::consensus_decode(r)?,
            vout: u32::consensus_decode(r)?,
        })
    }
}

/// A single transaction output as tracked by the UTXO set.
///
/// A spent (or never-existing) output is represented by the null marker
/// so that coins records can be pruned in place without renumbering the
/// remaining outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Transfer value in the smallest unit; `-1` marks a null output.
    pub value: Amount,
    /// Spending condition of the output.
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    /// Constructs an unspent output.
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// The null marker standing in for a spent output.
    pub fn null() -> Self {
        Self {
            value: -1,
            script_pubkey: Vec::new(),
        }
    }

    /// Whether this output has been spent (or never existed).
    pub fn is_null(&self) -> bool {
        self.value == -1
    }
}

impl Encodable for TxOut {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.value.consensus_encode(w)?;
        len += self.script_pubkey.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for TxOut {
    fn consensus_decode<R: io::BufRead + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(Self {
            value: Amount::consensus_decode(r)?,
            script_pubkey: Vec::<u8>::consensus_decode(r)?,
        })
    }
}

/// The unspent outputs of one transaction.
///
/// Outputs are pruned in place as they are spent; trailing null entries
/// are trimmed so the serialized form does not grow with spent tails. A
/// record whose outputs are all null is fully pruned and must never be
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coins {
    /// Whether the creating transaction was a coinbase.
    pub coinbase: bool,
    /// Height of the block containing the creating transaction.
    pub height: u32,
    /// Version of the creating transaction.
    pub version: u32,
    /// Outputs, indexed by `vout`; spent entries are null.
    pub outputs: Vec<TxOut>,
}

impl Coins {
    /// Constructs a coins record from the outputs of a transaction.
    pub fn new(coinbase: bool, height: u32, version: u32, outputs: Vec<TxOut>) -> Self {
        let mut coins = Self {
            coinbase,
            height,
            version,
            outputs,
        };
        coins.cleanup();
        coins
    }

    /// Whether every output has been spent.
    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(TxOut::is_null)
    }

    /// Whether output `vout` exists and is unspent.
    pub fn is_available(&self, vout: u32) -> bool {
        self.outputs
            .get(vout as usize)
            .is_some_and(|out| !out.is_null())
    }

    /// Marks output `vout` as spent.
    ///
    /// Returns `false` if the output does not exist or was already
    /// spent. Trailing null outputs are trimmed afterwards.
    pub fn spend(&mut self, vout: u32) -> bool {
        match self.outputs.get_mut(vout as usize) {
            Some(out) if !out.is_null() => {
                *out = TxOut::null();
                self.cleanup();
                true
            }
            _ => false,
        }
    }

    fn cleanup(&mut self) {
        while self.outputs.last().is_some_and(TxOut::is_null) {
            self.outputs.pop();
        }
    }
}

impl Encodable for Coins {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = write_compact_size(w, u64::from(self.version))?;
        len += self.coinbase.consensus_encode(w)?;
        len += write_compact_size(w, u64::from(self.height))?;
        len += write_compact_size(w, self.outputs.len() as u64)?;
        for out in &self.outputs {
            len += out.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl Decodable for Coins {
    fn consensus_decode<R: io::BufRead + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let version = u32::try_from(read_compact_size(r)?)
            .map_err(|_| encode::Error::ParseFailed("coins version out of range"))?;
        let coinbase = bool::consensus_decode(r)?;
        let height = u32::try_from(read_compact_size(r)?)
            .map_err(|_| encode::Error::ParseFailed("coins height out of range"))?;
        let count = read_compact_size(r)?;
        let mut outputs = Vec::with_capacity(count.min(10_000) as usize);
        for _ in 0..count {
            outputs.push(TxOut::consensus_decode(r)?);
        }
        Ok(Self {
            coinbase,
            height,
            version,
            outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Coins {
        Coins::new(
            false,
            10,
            1,
            vec![TxOut::new(500, vec![0x51]), TxOut::new(700, vec![0x52])],
        )
    }

    #[test]
    fn spend_prunes_in_place() {
        let mut coins = record();
        assert!(coins.spend(0));
        assert!(!coins.is_pruned());
        assert!(coins.outputs[0].is_null());
        assert_eq!(coins.outputs[1].value, 700);

        // Spending the same output again is rejected.
        assert!(!coins.spend(0));
        assert!(!coins.spend(5));
    }

    #[test]
    fn fully_spent_record_is_pruned() {
        let mut coins = record();
        assert!(coins.spend(1));
        // Trailing null trimmed, leading null kept.
        assert_eq!(coins.outputs.len(), 1);
        assert!(coins.spend(0));
        assert!(coins.outputs.is_empty());
        assert!(coins.is_pruned());
    }

    #[test]
    fn outpoint_null_sentinel() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint::new(Txid::all_zeros(), 0).is_null());
    }
}
