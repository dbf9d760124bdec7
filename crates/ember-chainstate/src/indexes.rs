//! Auxiliary indexes sharing the block-tree database.
//!
//! Four optional record families: the address index (`'a'`, an
//! append-only ledger of per-address events), the address-unspent
//! index (`'u'`), the spent-output index (`'p'`) and the transaction
//! position index under both the txid (`'t'`) and the bare txid
//! (`'T'`). Deletion is expressed by a tombstone value the writers
//! turn into an erase inside the batch.
//!
//! Address keys embed the block height and intra-block position in
//! big-endian so that iterating a `(type, address)` prefix yields
//! events in ledger order.

use crate::block_tree::BlockTreeDb;
use crate::interrupt::Interrupt;
use crate::kv::{kv_decode, make_key, tag, KvBatch};
use crate::Result;
use bitcoin::consensus::{encode, Decodable, Encodable};
use bitcoin::hashes::Hash;
use bitcoin::io;
use ember_primitives::{AddressHash, Amount, BareTxid, Txid};

/// Address types distinguished by the address-keyed indexes.
pub mod address_type {
    /// Pay-to-pubkey-hash.
    pub const PUBKEY_HASH: u8 = 1;
    /// Pay-to-script-hash.
    pub const SCRIPT_HASH: u8 = 2;
}

/// Result of a range read that honors cooperative cancellation.
///
/// When `interrupted` is set the entries cover only a prefix of the
/// requested range.
#[derive(Debug, Clone)]
pub struct IndexScan<T> {
    /// Entries read before the scan ended.
    pub entries: Vec<T>,
    /// Whether the scan was cut short by an interrupt.
    pub interrupted: bool,
}

impl<T> IndexScan<T> {
    fn complete(entries: Vec<T>) -> Self {
        Self {
            entries,
            interrupted: false,
        }
    }

    fn interrupted(entries: Vec<T>) -> Self {
        Self {
            entries,
            interrupted: true,
        }
    }
}

/// One ledger event of an address: an output credited to it or an
/// input spending from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressIndexKey {
    /// Address type, one of [`address_type`].
    pub address_type: u8,
    /// The 160-bit address hash.
    pub address: AddressHash,
    /// Height of the block the event happened in.
    pub height: u32,
    /// Position of the transaction within its block.
    pub tx_number: u32,
    /// Transaction the event belongs to.
    pub txid: Txid,
    /// Output index (or input index for spends).
    pub index: u32,
    /// Whether the event is a spending input rather than an output.
    pub spending: bool,
}

impl Encodable for AddressIndexKey {
    fn consensus_encode<W: io::Write + ?Sized>(
        &self,
        w: &mut W,
    ) -> std::result::Result<usize, io::Error> {
        let mut len = self.address_type.consensus_encode(w)?;
        len += self.address.consensus_encode(w)?;
        // Big-endian so key order is ledger order.
        w.write_all(&self.height.to_be_bytes())?;
        w.write_all(&self.tx_number.to_be_bytes())?;
        len += 8;
        len += self.txid.consensus_encode(w)?;
        len += self.index.consensus_encode(w)?;
        len += self.spending.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for AddressIndexKey {
    fn consensus_decode<R: io::BufRead + ?Sized>(
        r: &mut R,
    ) -> std::result::Result<Self, encode::Error> {
        let address_type = u8::consensus_decode(r)?;
        let address = AddressHash::consensus_decode(r)?;
        let mut be = [0u8; 4];
        r.read_exact(&mut be)?;
        let height = u32::from_be_bytes(be);
        r.read_exact(&mut be)?;
        let tx_number = u32::from_be_bytes(be);
        Ok(Self {
            address_type,
            address,
            height,
            tx_number,
            txid: Txid::consensus_decode(r)?,
            index: u32::consensus_decode(r)?,
            spending: bool::consensus_decode(r)?,
        })
    }
}

/// Key of one currently-unspent output in the address-unspent index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressUnspentKey {
    /// Address type, one of [`address_type`].
    pub address_type: u8,
    /// The 160-bit address hash.
    pub address: AddressHash,
    /// Transaction holding the output.
    pub txid: Txid,
    /// Output index.
    pub index: u32,
}

impl Encodable for AddressUnspentKey {
    fn consensus_encode<W: io::Write + ?Sized>(
        &self,
        w: &mut W,
    ) -> std::result::Result<usize, io::Error> {
        let mut len = self.address_type.consensus_encode(w)?;
        len += self.address.consensus_encode(w)?;
        len += self.txid.consensus_encode(w)?;
        len += self.index.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for AddressUnspentKey {
    fn consensus_decode<R: io::BufRead + ?Sized>(
        r: &mut R,
    ) -> std::result::Result<Self, encode::Error> {
        Ok(Self {
            address_type: u8::consensus_decode(r)?,
            address: AddressHash::consensus_decode(r)?,
            txid: Txid::consensus_decode(r)?,
            index: u32::consensus_decode(r)?,
        })
    }
}

/// Value of an address-unspent entry; the null value is the tombstone
/// turning the batched write into an erase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressUnspentValue {
    /// Output value; `-1` marks the tombstone.
    pub satoshis: Amount,
    /// The output's script.
    pub script: Vec<u8>,
    /// Height the output was created at.
    pub height: u32,
}

impl AddressUnspentValue {
    /// The tombstone requesting deletion of the entry.
    pub fn null() -> Self {
        Self {
            satoshis: -1,
            script: Vec::new(),
            height: 0,
        }
    }

    /// Whether this value is the tombstone.
    pub fn is_null(&self) -> bool {
        self.satoshis == -1
    }
}

impl Encodable for AddressUnspentValue {
    fn consensus_encode<W: io::Write + ?Sized>(
        &self,
        w: &mut W,
    ) -> std::result::Result<usize, io::Error> {
        let mut len = self.satoshis.consensus_encode(w)?;
        len += self.script.consensus_encode(w)?;
        len += self.height.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for AddressUnspentValue {
    fn consensus_decode<R: io::BufRead + ?Sized>(
        r: &mut R,
    ) -> std::result::Result<Self, encode::Error> {
        Ok(Self {
            satoshis: Amount::consensus_decode(r)?,
            script: Vec::<u8>::consensus_decode(r)?,
            height: u32::consensus_decode(r)?,
        })
    }
}

/// Key of the spent-output index: the outpoint that was spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpentIndexKey {
    /// Transaction holding the spent output.
    pub txid: Txid,
    /// Output index.
    pub index: u32,
}

impl Encodable for SpentIndexKey {
    fn consensus_encode<W: io::Write + ?Sized>(
        &self,
        w: &mut W,
    ) -> std::result::Result<usize, io::Error> {
        let mut len = self.txid.consensus_encode(w)?;
        len += self.index.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for SpentIndexKey {
    fn consensus_decode<R: io::BufRead + ?Sized>(
        r: &mut R,
    ) -> std::result::Result<Self, encode::Error> {
        Ok(Self {
            txid: Txid::consensus_decode(r)?,
            index: u32::consensus_decode(r)?,
        })
    }
}

/// Where and by what a tracked output was spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpentIndexValue {
    /// Transaction that spent the output; zero marks the tombstone.
    pub spending_txid: Txid,
    /// Input index within the spending transaction.
    pub input_index: u32,
    /// Height of the spending block.
    pub height: u32,
    /// Value of the spent output.
    pub satoshis: Amount,
    /// Address type of the spent output, one of [`address_type`].
    pub address_type: u8,
    /// Address hash of the spent output.
    pub address: AddressHash,
}

impl SpentIndexValue {
    /// The tombstone requesting deletion of the entry.
    pub fn null() -> Self {
        Self {
            spending_txid: Txid::all_zeros(),
            input_index: 0,
            height: 0,
            satoshis: 0,
            address_type: 0,
            address: AddressHash::all_zeros(),
        }
    }

    /// Whether this value is the tombstone.
    pub fn is_null(&self) -> bool {
        self.spending_txid == Txid::all_zeros()
    }
}

impl Encodable for SpentIndexValue {
    fn consensus_encode<W: io::Write + ?Sized>(
        &self,
        w: &mut W,
    ) -> std::result::Result<usize, io::Error> {
        let mut len = self.spending_txid.consensus_encode(w)?;
        len += self.input_index.consensus_encode(w)?;
        len += self.height.consensus_encode(w)?;
        len += self.satoshis.consensus_encode(w)?;
        len += self.address_type.consensus_encode(w)?;
        len += self.address.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for SpentIndexValue {
    fn consensus_decode<R: io::BufRead + ?Sized>(
        r: &mut R,
    ) -> std::result::Result<Self, encode::Error> {
        Ok(Self {
            spending_txid: Txid::consensus_decode(r)?,
            input_index: u32::consensus_decode(r)?,
            height: u32::consensus_decode(r)?,
            satoshis: Amount::consensus_decode(r)?,
            address_type: u8::consensus_decode(r)?,
            address: AddressHash::consensus_decode(r)?,
        })
    }
}

/// Position of a serialized transaction on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskTxPos {
    /// Block file number.
    pub file: u32,
    /// Offset of the block inside the file.
    pub block_offset: u32,
    /// Offset of the transaction inside the block.
    pub tx_offset: u32,
}

impl Encodable for DiskTxPos {
    fn consensus_encode<W: io::Write + ?Sized>(
        &self,
        w: &mut W,
    ) -> std::result::Result<usize, io::Error> {
        let mut len = self.file.consensus_encode(w)?;
        len += self.block_offset.consensus_encode(w)?;
        len += self.tx_offset.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for DiskTxPos {
    fn consensus_decode<R: io::BufRead + ?Sized>(
        r: &mut R,
    ) -> std::result::Result<Self, encode::Error> {
        Ok(Self {
            file: u32::consensus_decode(r)?,
            block_offset: u32::consensus_decode(r)?,
            tx_offset: u32::consensus_decode(r)?,
        })
    }
}

/// One transaction's entry in the tx index: the same position filed
/// under both of its identifiers.
#[derive(Debug, Clone, Copy)]
pub struct TxIndexEntry {
    /// Full transaction id.
    pub txid: Txid,
    /// Bare transaction id.
    pub bare_txid: BareTxid,
    /// Where the transaction lives on disk.
    pub pos: DiskTxPos,
}

/// Seek prefix shared by the address-keyed indexes.
fn address_prefix(index_tag: u8, address_type: u8, address: &AddressHash) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(22);
    prefix.push(index_tag);
    prefix.push(address_type);
    prefix.extend_from_slice(&address.to_byte_array());
    prefix
}

impl BlockTreeDb {
    /// Writes tx-index entries, each under its txid and its bare txid.
    pub fn write_tx_index(&self, entries: &[TxIndexEntry]) -> Result<()> {
        let mut batch = KvBatch::new();
        for entry in entries {
            batch.put(make_key(tag::TX_INDEX, &entry.txid), &entry.pos);
            batch.put(make_key(tag::BARE_TX_INDEX, &entry.bare_txid), &entry.pos);
        }
        self.db().write_batch(batch)
    }

    /// Looks up a transaction position by txid or bare txid.
    ///
    /// Both keyspaces are tried; whichever resolves is the answer, as a
    /// 256-bit collision between a txid and a foreign bare txid would
    /// be a hash collision.
    pub fn read_tx_index(&self, hash: &bitcoin::hashes::sha256d::Hash) -> Result<Option<DiskTxPos>> {
        if let Some(pos) = self.db().read(&make_key(tag::TX_INDEX, hash))? {
            return Ok(Some(pos));
        }
        self.db().read(&make_key(tag::BARE_TX_INDEX, hash))
    }

    /// Appends address-index events for one connected block.
    pub fn write_address_index(&self, entries: &[(AddressIndexKey, Amount)]) -> Result<()> {
        let mut batch = KvBatch::new();
        for (key, amount) in entries {
            batch.put(make_key(tag::ADDRESS_INDEX, key), amount);
        }
        self.db().write_batch(batch)
    }

    /// Removes address-index events of one disconnected block.
    pub fn erase_address_index(&self, entries: &[(AddressIndexKey, Amount)]) -> Result<()> {
        let mut batch = KvBatch::new();
        for (key, _) in entries {
            batch.delete(make_key(tag::ADDRESS_INDEX, key));
        }
        self.db().write_batch(batch)
    }

    /// Reads the ledger events of `(address_type, address)` in order,
    /// optionally restricted to block heights in `[start, end]`.
    pub fn read_address_index(
        &self,
        address_type: u8,
        address: &AddressHash,
        start: Option<u32>,
        end: Option<u32>,
        interrupt: &Interrupt,
    ) -> Result<IndexScan<(AddressIndexKey, Amount)>> {
        let prefix = address_prefix(tag::ADDRESS_INDEX, address_type, address);
        let mut seek = prefix.clone();
        if let Some(start) = start {
            seek.extend_from_slice(&start.to_be_bytes());
        }

        let mut entries = Vec::new();
        let mut iter = self.db().iter_from(&seek);
        while iter.valid() {
            if interrupt.is_set() {
                return Ok(IndexScan::interrupted(entries));
            }
            let key = iter.key().expect("valid iterator has a key; qed");
            if !key.starts_with(&prefix) {
                break;
            }
            let index_key: AddressIndexKey = kv_decode(tag::ADDRESS_INDEX, &key[1..])?;
            if end.is_some_and(|end| index_key.height > end) {
                break;
            }
            let value = iter.value().expect("valid iterator has a value; qed");
            let amount: Amount = kv_decode(tag::ADDRESS_INDEX, value)?;
            entries.push((index_key, amount));
            iter.next();
        }
        iter.status()?;
        Ok(IndexScan::complete(entries))
    }

    /// Applies address-unspent updates; tombstones erase.
    pub fn update_address_unspent(
        &self,
        entries: &[(AddressUnspentKey, AddressUnspentValue)],
    ) -> Result<()> {
        let mut batch = KvBatch::new();
        for (key, value) in entries {
            if value.is_null() {
                batch.delete(make_key(tag::ADDRESS_UNSPENT, key));
            } else {
                batch.put(make_key(tag::ADDRESS_UNSPENT, key), value);
            }
        }
        self.db().write_batch(batch)
    }

    /// Reads all currently-unspent outputs of `(address_type, address)`.
    pub fn read_address_unspent(
        &self,
        address_type: u8,
        address: &AddressHash,
        interrupt: &Interrupt,
    ) -> Result<IndexScan<(AddressUnspentKey, AddressUnspentValue)>> {
        let prefix = address_prefix(tag::ADDRESS_UNSPENT, address_type, address);

        let mut entries = Vec::new();
        let mut iter = self.db().iter_from(&prefix);
        while iter.valid() {
            if interrupt.is_set() {
                return Ok(IndexScan::interrupted(entries));
            }
            let key = iter.key().expect("valid iterator has a key; qed");
            if !key.starts_with(&prefix) {
                break;
            }
            let index_key: AddressUnspentKey = kv_decode(tag::ADDRESS_UNSPENT, &key[1..])?;
            let value = iter.value().expect("valid iterator has a value; qed");
            let unspent: AddressUnspentValue = kv_decode(tag::ADDRESS_UNSPENT, value)?;
            entries.push((index_key, unspent));
            iter.next();
        }
        iter.status()?;
        Ok(IndexScan::complete(entries))
    }

    /// Point-reads one spent-output entry.
    pub fn read_spent_index(&self, key: &SpentIndexKey) -> Result<Option<SpentIndexValue>> {
        self.db().read(&make_key(tag::SPENT_INDEX, key))
    }

    /// Applies spent-index updates; tombstones erase.
    pub fn update_spent_index(&self, entries: &[(SpentIndexKey, SpentIndexValue)]) -> Result<()> {
        let mut batch = KvBatch::new();
        for (key, value) in entries {
            if value.is_null() {
                batch.delete(make_key(tag::SPENT_INDEX, key));
            } else {
                batch.put(make_key(tag::SPENT_INDEX, key), value);
            }
        }
        self.db().write_batch(batch)
    }
}
