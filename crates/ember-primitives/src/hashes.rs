//! Hash types for the Ember chain.
//!
//! Two distinct transaction identifiers coexist: [`Txid`] over the full
//! serialization and [`BareTxid`] over the reduced one. They are kept as
//! separate types so the two keyspaces cannot be confused in signatures,
//! even though both are 256-bit double-SHA256 digests.

use bitcoin::consensus::{encode, Decodable, Encodable};
use bitcoin::hashes::{hash160, hash_newtype, sha256d, Hash};
use bitcoin::io;

hash_newtype! {
    /// A block's double-SHA256 identifier.
    pub struct BlockHash(sha256d::Hash);

    /// A transaction's identifier over its full serialization.
    pub struct Txid(sha256d::Hash);

    /// A transaction's identifier over its reduced serialization.
    pub struct BareTxid(sha256d::Hash);

    /// The merkle root committed to by a block header.
    pub struct MerkleRoot(sha256d::Hash);

    /// A 160-bit pubkey or script hash identifying an address.
    pub struct AddressHash(hash160::Hash);
}

macro_rules! impl_consensus_encoding_32 {
    ($ty:ident) => {
        impl Encodable for $ty {
            fn consensus_encode<W: io::Write + ?Sized>(
                &self,
                w: &mut W,
            ) -> Result<usize, io::Error> {
                self.to_byte_array().consensus_encode(w)
            }
        }

        impl Decodable for $ty {
            fn consensus_decode<R: io::BufRead + ?Sized>(
                r: &mut R,
            ) -> Result<Self, encode::Error> {
                Ok(Self::from_byte_array(<[u8; 32]>::consensus_decode(r)?))
            }
        }
    };
}

impl_consensus_encoding_32!(BlockHash);
impl_consensus_encoding_32!(Txid);
impl_consensus_encoding_32!(BareTxid);
impl_consensus_encoding_32!(MerkleRoot);

impl Encodable for AddressHash {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        w.write_all(&self.to_byte_array())?;
        Ok(20)
    }
}

impl Decodable for AddressHash {
    fn consensus_decode<R: io::BufRead + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let mut bytes = [0u8; 20];
        r.read_exact(&mut bytes)?;
        Ok(Self::from_byte_array(bytes))
    }
}

impl BlockHash {
    /// The all-zero hash used as the "no block" sentinel in disk records.
    pub fn zero() -> Self {
        Self::all_zeros()
    }

    /// Whether this is the "no block" sentinel.
    pub fn is_zero(&self) -> bool {
        *self == Self::all_zeros()
    }
}
