//! Persistent, TTL-aware record cache: a typed facade over a transactional
//! key/value store.
//!
//! Keys are `tag || lookup-name || type` so that records, packets and
//! signatures for one name cluster together and byte-prefix scans walk DNS
//! subtrees. Values are a fixed 12-byte header followed by the rdata blob.

use crate::error::{Error, Result};
use recursor_proto::name::lookup_form;
use recursor_proto::packet::record::Record;
use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};
use std::cell::RefCell;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Positive record sets.
pub const TAG_RECORD: u8 = b'R';
/// Whole packets, used for negative answers.
pub const TAG_PACKET: u8 = b'P';
/// Signatures, keyed by the type they cover.
pub const TAG_RRSIG: u8 = b'G';
/// First tag value free for user modules.
pub const TAG_USER: u8 = 0x80;

/// Cache ABI version marker; a store carrying anything else is cleared.
const VERSION_KEY: &[u8] = b"V\x02";

pub const ENTRY_HEADER_LEN: usize = 12;

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

/// Trust level of a cached entry. Higher ranks dominate on insert
/// collisions; producers check `peek_rank` before overwriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rank {
    Bad = 0,
    Insecure = 1,
    NonAuth = 2,
    Auth = 3,
    Secure = 4,
}

impl Rank {
    pub fn into_num(self) -> u8 {
        self as u8
    }

    pub fn from_num(num: u8) -> Self {
        match num {
            1 => Self::Insecure,
            2 => Self::NonAuth,
            3 => Self::Auth,
            4 => Self::Secure,
            _ => Self::Bad,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Absolute seconds when the entry was cached.
    pub timestamp: u32,
    /// Largest TTL among the contained records.
    pub ttl: u32,
    /// Number of rdata records in the blob.
    pub count: u16,
    pub rank: Rank,
    pub flags: u8,
}

impl EntryHeader {
    pub fn to_bytes(&self) -> [u8; ENTRY_HEADER_LEN] {
        let mut out = [0u8; ENTRY_HEADER_LEN];
        out[0..4].copy_from_slice(&self.timestamp.to_le_bytes());
        out[4..8].copy_from_slice(&self.ttl.to_le_bytes());
        out[8..10].copy_from_slice(&self.count.to_le_bytes());
        out[10] = self.rank.into_num();
        out[11] = self.flags;
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENTRY_HEADER_LEN {
            return Err(Error::Proto);
        }
        Ok(Self {
            timestamp: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            ttl: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            count: u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
            rank: Rank::from_num(bytes[10]),
            flags: bytes[11],
        })
    }
}

/// One cached value, copied out of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub header: EntryHeader,
    pub data: Vec<u8>,
}

/// A record set peeked from the cache, TTLs still at cache time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeekedRrset {
    pub records: Vec<Record>,
    pub rank: Rank,
    pub flags: u8,
    pub drift: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hit: u64,
    pub miss: u64,
    pub insert: u64,
    pub delete: u64,
    pub txn_read: u64,
    pub txn_write: u64,
}

/// Wall clock in cache time, whole seconds.
pub fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}

/// Build the composed key `{ tag, reversed-lowercased-name, type }`.
pub fn cache_key(tag: u8, name: &str, rtype: u16) -> Result<Vec<u8>> {
    let lookup = lookup_form(name)?;
    let mut key = Vec::with_capacity(1 + lookup.len() + 2);
    key.push(tag);
    key.extend_from_slice(&lookup);
    key.extend_from_slice(&rtype.to_le_bytes());
    Ok(key)
}

/// Copy a record set into answer time: drop records the drift already
/// expired and charge the drift against the survivors.
pub fn materialize(records: &[Record], drift: u32) -> Vec<Record> {
    records
        .iter()
        .filter(|record| record.ttl() > drift)
        .map(|record| record.with_ttl(record.ttl() - drift))
        .collect()
}

fn check_lifetime(header: &EntryHeader, now: u32) -> Result<u32> {
    if now <= header.timestamp {
        // Record cached in the future, e.g. after a clock step; accept it
        // and report zero drift.
        return Ok(0);
    }
    let drift = now - header.timestamp;
    if drift <= header.ttl {
        Ok(drift)
    } else {
        Err(Error::Stale)
    }
}

fn rrset_blob(records: &[Record]) -> Result<(Vec<u8>, u32)> {
    let mut blob = Vec::new();
    let mut max_ttl = 0;
    for record in records {
        let rdata = record.rdata_bytes()?;
        blob.extend_from_slice(&record.ttl().to_le_bytes());
        blob.extend_from_slice(&(rdata.len() as u16).to_le_bytes());
        blob.extend_from_slice(&rdata);
        max_ttl = max_ttl.max(record.ttl());
    }
    Ok((blob, max_ttl))
}

fn rrset_from_blob(owner: &str, rtype: u16, count: u16, blob: &[u8]) -> Result<Vec<Record>> {
    let mut records = Vec::with_capacity(count as usize);
    let mut at = 0;
    for _ in 0..count {
        if at + 6 > blob.len() {
            return Err(Error::Proto);
        }
        let ttl = u32::from_le_bytes(blob[at..at + 4].try_into().unwrap());
        let len = u16::from_le_bytes(blob[at + 4..at + 6].try_into().unwrap()) as usize;
        at += 6;
        if at + len > blob.len() {
            return Err(Error::Proto);
        }
        records.push(Record::from_rdata(
            owner.to_string(),
            rtype,
            ttl,
            &blob[at..at + len],
        )?);
        at += len;
    }
    Ok(records)
}

pub struct Cache {
    db: redb::Database,
    stats: RefCell<CacheStats>,
}

impl Cache {
    /// Open or create the persistent cache, then run the version check:
    /// a non-empty store without the version marker is cleared and
    /// restamped. A failing check leaves the cache usable but unstamped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = redb::Database::create(path)?;
        let cache = Self {
            db,
            stats: RefCell::new(CacheStats::default()),
        };
        cache.assert_right_version();
        Ok(cache)
    }

    fn assert_right_version(&self) {
        let Ok(mut txn) = self.begin_write() else {
            return;
        };
        if matches!(txn.get_raw(VERSION_KEY), Ok(Some(_))) {
            txn.abort();
            return;
        }
        if txn.count().unwrap_or(0) > 0 {
            tracing::info!("cache version mismatch, clearing");
            if txn.clear().is_err() {
                txn.abort();
                return;
            }
        }
        if txn.insert_raw(VERSION_KEY, &[]).is_ok() {
            let _ = txn.commit();
        } else {
            txn.abort();
        }
    }

    pub fn begin_read(&self) -> Result<Txn<'_>> {
        let txn = self.db.begin_read()?;
        self.stats.borrow_mut().txn_read += 1;
        Ok(Txn {
            cache: self,
            inner: Inner::Read(txn),
        })
    }

    pub fn begin_write(&self) -> Result<Txn<'_>> {
        let txn = self.db.begin_write()?;
        self.stats.borrow_mut().txn_write += 1;
        Ok(Txn {
            cache: self,
            inner: Inner::Write(txn),
        })
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.borrow()
    }
}

enum Inner {
    Read(redb::ReadTransaction),
    Write(redb::WriteTransaction),
}

pub struct Txn<'a> {
    cache: &'a Cache,
    inner: Inner,
}

impl<'a> Txn<'a> {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match &self.inner {
            Inner::Read(txn) => match txn.open_table(TABLE) {
                Ok(table) => Ok(table.get(key)?.map(|guard| guard.value().to_vec())),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
                Err(error) => Err(error.into()),
            },
            Inner::Write(txn) => {
                let table = txn.open_table(TABLE)?;
                let value = table.get(key)?.map(|guard| guard.value().to_vec());
                Ok(value)
            }
        }
    }

    fn insert_raw(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match &mut self.inner {
            Inner::Read(_) => Err(Error::InvalidArg),
            Inner::Write(txn) => {
                let mut table = txn.open_table(TABLE)?;
                table.insert(key, value)?;
                Ok(())
            }
        }
    }

    fn remove_raw(&mut self, key: &[u8]) -> Result<()> {
        match &mut self.inner {
            Inner::Read(_) => Err(Error::InvalidArg),
            Inner::Write(txn) => {
                let mut table = txn.open_table(TABLE)?;
                table.remove(key)?;
                Ok(())
            }
        }
    }

    /// Number of stored keys, the version marker included.
    pub fn count(&self) -> Result<u64> {
        match &self.inner {
            Inner::Read(txn) => match txn.open_table(TABLE) {
                Ok(table) => Ok(table.len()?),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
                Err(error) => Err(error.into()),
            },
            Inner::Write(txn) => {
                let table = txn.open_table(TABLE)?;
                Ok(table.len()?)
            }
        }
    }

    /// Truncate the whole store, version marker included.
    pub fn clear(&mut self) -> Result<()> {
        match &mut self.inner {
            Inner::Read(_) => Err(Error::InvalidArg),
            Inner::Write(txn) => {
                txn.delete_table(TABLE)?;
                txn.open_table(TABLE)?;
                Ok(())
            }
        }
    }

    pub fn commit(self) -> Result<()> {
        match self.inner {
            Inner::Read(_) => Ok(()),
            Inner::Write(txn) => Ok(txn.commit()?),
        }
    }

    pub fn abort(self) {
        if let Inner::Write(txn) = self.inner {
            let _ = txn.abort();
        }
    }

    /// Look an entry up and account its lifetime against `now`. Returns the
    /// entry and the drift, i.e. the seconds that already passed since it
    /// was cached.
    pub fn peek(&self, tag: u8, name: &str, rtype: u16, now: u32) -> Result<(Entry, u32)> {
        let key = cache_key(tag, name, rtype)?;
        let Some(value) = self.get_raw(&key)? else {
            self.cache.stats.borrow_mut().miss += 1;
            return Err(Error::NotFound);
        };
        let header = EntryHeader::from_bytes(&value)?;
        match check_lifetime(&header, now) {
            Ok(drift) => {
                self.cache.stats.borrow_mut().hit += 1;
                Ok((
                    Entry {
                        header,
                        data: value[ENTRY_HEADER_LEN..].to_vec(),
                    },
                    drift,
                ))
            }
            Err(error) => {
                self.cache.stats.borrow_mut().miss += 1;
                Err(error)
            }
        }
    }

    /// Rank of a live entry, without touching the hit/miss counters.
    pub fn peek_rank(&self, tag: u8, name: &str, rtype: u16, now: u32) -> Result<Rank> {
        let key = cache_key(tag, name, rtype)?;
        let Some(value) = self.get_raw(&key)? else {
            return Err(Error::NotFound);
        };
        let header = EntryHeader::from_bytes(&value)?;
        check_lifetime(&header, now)?;
        Ok(header.rank)
    }

    pub fn insert(
        &mut self,
        tag: u8,
        name: &str,
        rtype: u16,
        header: EntryHeader,
        data: &[u8],
    ) -> Result<()> {
        let key = cache_key(tag, name, rtype)?;
        // The backend wants one contiguous value; stage header and rdata
        // in a single allocation.
        let mut value = Vec::with_capacity(ENTRY_HEADER_LEN + data.len());
        value.extend_from_slice(&header.to_bytes());
        value.extend_from_slice(data);
        self.insert_raw(&key, &value)?;
        self.cache.stats.borrow_mut().insert += 1;
        Ok(())
    }

    pub fn remove(&mut self, tag: u8, name: &str, rtype: u16) -> Result<()> {
        let key = cache_key(tag, name, rtype)?;
        self.remove_raw(&key)?;
        self.cache.stats.borrow_mut().delete += 1;
        Ok(())
    }

    /// Store a record set under the `'R'` tag. An empty set is a no-op,
    /// not an error.
    pub fn insert_rrset(
        &mut self,
        records: &[Record],
        rank: Rank,
        flags: u8,
        timestamp: u32,
    ) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let (blob, max_ttl) = rrset_blob(records)?;
        let header = EntryHeader {
            timestamp,
            ttl: max_ttl,
            count: records.len() as u16,
            rank,
            flags,
        };
        self.insert(TAG_RECORD, first.owner(), first.rtype_num(), header, &blob)
    }

    pub fn peek_rrset(&self, name: &str, rtype: u16, now: u32) -> Result<PeekedRrset> {
        let (entry, drift) = self.peek(TAG_RECORD, name, rtype, now)?;
        Ok(PeekedRrset {
            records: rrset_from_blob(name, rtype, entry.header.count, &entry.data)?,
            rank: entry.header.rank,
            flags: entry.header.flags,
            drift,
        })
    }

    /// Store signature records under the type they cover, not under RRSIG.
    pub fn insert_rrsig(
        &mut self,
        records: &[Record],
        rank: Rank,
        timestamp: u32,
    ) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let covered = match first {
            Record::Unknown { rdata, .. } if rdata.len() >= 2 => {
                u16::from_be_bytes([rdata[0], rdata[1]])
            }
            _ => return Err(Error::InvalidArg),
        };
        let (blob, max_ttl) = rrset_blob(records)?;
        let header = EntryHeader {
            timestamp,
            ttl: max_ttl,
            count: records.len() as u16,
            rank,
            flags: 0,
        };
        self.insert(TAG_RRSIG, first.owner(), covered, header, &blob)
    }

    pub fn peek_rrsig(&self, name: &str, covered: u16, now: u32) -> Result<PeekedRrset> {
        let (entry, drift) = self.peek(TAG_RRSIG, name, covered, now)?;
        Ok(PeekedRrset {
            records: rrset_from_blob(
                name,
                recursor_proto::packet::RType::RRSIG.into_num(),
                entry.header.count,
                &entry.data,
            )?,
            rank: entry.header.rank,
            flags: entry.header.flags,
            drift,
        })
    }

    /// Store a whole wire packet under the `'P'` tag, for negative answers.
    pub fn insert_packet(
        &mut self,
        name: &str,
        rtype: u16,
        wire: &[u8],
        ttl: u32,
        rank: Rank,
        timestamp: u32,
    ) -> Result<()> {
        let header = EntryHeader {
            timestamp,
            ttl,
            count: 1,
            rank,
            flags: 0,
        };
        self.insert(TAG_PACKET, name, rtype, header, wire)
    }

    pub fn peek_packet(&self, name: &str, rtype: u16, now: u32) -> Result<(Vec<u8>, u32)> {
        let (entry, drift) = self.peek(TAG_PACKET, name, rtype, now)?;
        Ok((entry.data, drift))
    }
}
