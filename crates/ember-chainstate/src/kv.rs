//! Ordered key-value storage over RocksDB.
//!
//! Every structured key is a one-byte tag followed by the consensus
//! encoding of the remainder; a few markers use the bare tag as the
//! whole key. The encoding is stable and bit-exact, changing it breaks
//! on-disk compatibility.

use crate::error::Error;
use crate::Result;
use bitcoin::consensus::{deserialize, serialize, Decodable, Encodable};
use rocksdb::{DBRawIterator, Options, WriteBatch, DB};
use std::path::Path;

/// Key tags of every record family sharing the stores.
pub(crate) mod tag {
    /// Coins record, keyed by txid.
    pub const COINS: u8 = b'c';
    /// Best-block marker; the tag is the whole key.
    pub const BEST_BLOCK: u8 = b'B';
    /// Block-index entry, keyed by block hash.
    pub const BLOCK_INDEX: u8 = b'b';
    /// Block-file info, keyed by file number.
    pub const FILE_INFO: u8 = b'f';
    /// Last block file; the tag is the whole key.
    pub const LAST_FILE: u8 = b'l';
    /// Reindex-in-progress marker; the tag is the whole key.
    pub const REINDEX: u8 = b'R';
    /// Named boolean flag.
    pub const FLAG: u8 = b'F';
    /// Named integer.
    pub const INT: u8 = b'I';
    /// Address-index event.
    pub const ADDRESS_INDEX: u8 = b'a';
    /// Spent-output entry.
    pub const SPENT_INDEX: u8 = b'p';
    /// Address-unspent entry.
    pub const ADDRESS_UNSPENT: u8 = b'u';
    /// Transaction position, keyed by txid.
    pub const TX_INDEX: u8 = b't';
    /// Transaction position, keyed by bare txid.
    pub const BARE_TX_INDEX: u8 = b'T';
}

/// Serializes a structured key under its tag byte.
pub(crate) fn make_key<K: Encodable>(tag: u8, body: &K) -> Vec<u8> {
    let mut key = vec![tag];
    body.consensus_encode(&mut key)
        .expect("writing to a Vec cannot fail; qed");
    key
}

/// A single-byte key consisting of the tag alone.
pub(crate) fn bare_key(tag: u8) -> Vec<u8> {
    vec![tag]
}

/// Decodes `bytes` as `T`, attributing failures to records under `tag`.
pub(crate) fn kv_decode<T: Decodable>(tag: u8, bytes: &[u8]) -> Result<T> {
    deserialize(bytes).map_err(|e| Error::corrupted(tag, e))
}

/// A batch of writes and erases applied in one atomic step.
///
/// Within a batch the last operation per key wins; readers observe
/// either all of a committed batch or none of it.
#[derive(Default)]
pub struct KvBatch {
    inner: WriteBatch,
}

impl KvBatch {
    /// Constructs an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a write of `value` under `key`.
    pub fn put<V: Encodable>(&mut self, key: Vec<u8>, value: &V) {
        self.inner.put(key, serialize(value));
    }

    /// Queues an erase of `key`.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.inner.delete(key);
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// An ordered byte-keyed store with batched atomic writes.
pub struct KvDatabase {
    db: DB,
}

impl KvDatabase {
    /// Opens (or creates) the database at `path`.
    ///
    /// `cache_size` is a rough byte budget steering the write buffers;
    /// the store additionally enables bloom filters and LZ4 the way
    /// every Ember database is tuned.
    pub fn open(path: &Path, cache_size: usize) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size((cache_size / 4).max(4 << 20));
        opts.set_max_write_buffer_number(4);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Destroys the database at `path`, wiping all records.
    pub fn destroy(path: &Path) -> Result<()> {
        DB::destroy(&Options::default(), path)?;
        Ok(())
    }

    /// Reads and decodes the value stored under `key`.
    ///
    /// A missing key is `Ok(None)`; an undecodable value is
    /// [`Error::Corrupted`].
    pub fn read<V: Decodable>(&self, key: &[u8]) -> Result<Option<V>> {
        match self.db.get_pinned(key)? {
            Some(bytes) => deserialize(&bytes)
                .map(Some)
                .map_err(|e| Error::corrupted(key[0], e)),
            None => Ok(None),
        }
    }

    /// Whether `key` is present.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.db.get_pinned(key)?.is_some())
    }

    /// Applies `batch` in one atomic, durable step.
    pub fn write_batch(&self, batch: KvBatch) -> Result<()> {
        self.db.write(batch.inner)?;
        Ok(())
    }

    /// A forward cursor positioned at the first key `>= seek`.
    pub fn iter_from(&self, seek: &[u8]) -> DBRawIterator<'_> {
        let mut iter = self.db.raw_iterator();
        iter.seek(seek);
        iter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (KvDatabase, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = KvDatabase::open(dir.path(), 1 << 20).expect("open");
        (db, dir)
    }

    #[test]
    fn batch_applies_last_write_per_key() {
        let (db, _dir) = open_temp();

        let mut batch = KvBatch::new();
        batch.put(make_key(tag::INT, &"a".to_string()), &1u32);
        batch.put(make_key(tag::INT, &"a".to_string()), &2u32);
        batch.put(make_key(tag::INT, &"b".to_string()), &3u32);
        batch.delete(make_key(tag::INT, &"b".to_string()));
        db.write_batch(batch).unwrap();

        let a: Option<u32> = db.read(&make_key(tag::INT, &"a".to_string())).unwrap();
        assert_eq!(a, Some(2));
        let b: Option<u32> = db.read(&make_key(tag::INT, &"b".to_string())).unwrap();
        assert_eq!(b, None);
    }

    #[test]
    fn read_miss_is_not_an_error() {
        let (db, _dir) = open_temp();
        let missing: Option<u32> = db.read(&bare_key(tag::LAST_FILE)).unwrap();
        assert_eq!(missing, None);
        assert!(!db.exists(&bare_key(tag::REINDEX)).unwrap());
    }

    #[test]
    fn iteration_runs_in_key_order_from_seek() {
        let (db, _dir) = open_temp();

        let mut batch = KvBatch::new();
        for n in [3u32, 1, 2] {
            batch.put(make_key(tag::FILE_INFO, &n), &n);
        }
        batch.put(bare_key(tag::BEST_BLOCK), &7u32);
        db.write_batch(batch).unwrap();

        let mut iter = db.iter_from(&bare_key(tag::FILE_INFO));
        let mut seen = Vec::new();
        while iter.valid() {
            let key = iter.key().unwrap();
            if key[0] != tag::FILE_INFO {
                break;
            }
            seen.push(key.to_vec());
            iter.next();
        }
        assert_eq!(seen.len(), 3);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn corrupt_value_reports_its_tag() {
        let (db, _dir) = open_temp();

        let mut batch = KvBatch::new();
        batch.put(bare_key(tag::BEST_BLOCK), &1u8);
        db.write_batch(batch).unwrap();

        // A one-byte value cannot decode as u32.
        let err = db.read::<u32>(&bare_key(tag::BEST_BLOCK)).unwrap_err();
        assert!(matches!(err, Error::Corrupted { tag: 'B', .. }));
    }
}
