// Copyright (c) 2024 Botho Foundation

//! LMDB-backed versioned record store.
//!
//! One logical table keyed by `(address, height)` holds the append-only
//! chain of record versions per address. A per-address height index makes
//! "most recent version at or before H" a binary search plus one exact get,
//! and a rates table stores the distribution rate recorded for each packed
//! height. `commit_batch` materializes a block's pending set in one write
//! transaction: either every entry becomes visible or none does.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use lmdb::{Database, DatabaseFlags, Environment, EnvironmentFlags, Transaction, WriteFlags};
use tracing::debug;

use crate::address::Address;
use crate::cache::{CacheEntry, RecordKey};
use crate::error::LedgerError;
use crate::record::MemberRecord;

const RECORDS_DB_NAME: &str = "records";
const HEIGHTS_DB_NAME: &str = "heights";
const RATES_DB_NAME: &str = "rates";

/// Composite key: address bytes followed by the big-endian height.
fn version_key(address: &Address, height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(address.as_bytes().len() + 8);
    key.extend_from_slice(address.as_bytes());
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn be_bytes_to_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes.try_into().unwrap_or([0; 8]))
}

pub struct VersionedStore {
    env: Environment,
    /// records: address || height (8 bytes BE) -> encoded MemberRecord
    records: Database,
    /// heights: address -> [height (8 bytes BE), ...] ascending
    heights: Database,
    /// rates: leader || height (8 bytes BE) -> rate in bps (8 bytes BE)
    rates: Database,
}

impl VersionedStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path, map_size: usize) -> Result<Self, LedgerError> {
        fs::create_dir_all(path).map_err(|e| {
            LedgerError::Storage(lmdb::Error::Other(e.raw_os_error().unwrap_or(0)))
        })?;

        let env = Environment::new()
            .set_flags(EnvironmentFlags::NO_SUB_DIR)
            .set_max_dbs(3)
            .set_map_size(map_size)
            .open(path.join("memberinfo.mdb").as_ref())?;

        let records = env.create_db(Some(RECORDS_DB_NAME), DatabaseFlags::empty())?;
        let heights = env.create_db(Some(HEIGHTS_DB_NAME), DatabaseFlags::empty())?;
        let rates = env.create_db(Some(RATES_DB_NAME), DatabaseFlags::empty())?;

        Ok(Self {
            env,
            records,
            heights,
            rates,
        })
    }

    /// Heights at which the address has a committed record version,
    /// ascending.
    pub fn versions(&self, address: &Address) -> Result<Vec<u64>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        Self::versions_in(&txn, self.heights, address)
    }

    fn versions_in<T: Transaction>(
        txn: &T,
        heights: Database,
        address: &Address,
    ) -> Result<Vec<u64>, LedgerError> {
        match txn.get(heights, &address.as_bytes()) {
            Ok(bytes) => Ok(bytes
                .chunks(8)
                .filter(|chunk| chunk.len() == 8)
                .map(be_bytes_to_u64)
                .collect()),
            Err(lmdb::Error::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// The last indexed height at or below `height`.
    fn floor_version(versions: &[u64], height: u64) -> Option<u64> {
        match versions.binary_search(&height) {
            Ok(_) => Some(height),
            Err(0) => None,
            Err(pos) => Some(versions[pos - 1]),
        }
    }

    /// Most recent committed version height at or before `height`.
    pub fn version_at_or_before(
        &self,
        address: &Address,
        height: u64,
    ) -> Result<Option<u64>, LedgerError> {
        let versions = self.versions(address)?;
        Ok(Self::floor_version(&versions, height))
    }

    /// Whether the address has any committed version at all.
    pub fn has_record(&self, address: &Address) -> Result<bool, LedgerError> {
        Ok(!self.versions(address)?.is_empty())
    }

    fn record_in<T: Transaction>(
        txn: &T,
        records: Database,
        address: &Address,
        height: u64,
    ) -> Result<Option<MemberRecord>, LedgerError> {
        match txn.get(records, &version_key(address, height)) {
            Ok(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    LedgerError::MalformedRecord(format!(
                        "non-utf8 record for {address} at height {height}"
                    ))
                })?;
                Ok(Some(MemberRecord::decode(text)?))
            }
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Exact-height record read.
    pub fn get_exact(
        &self,
        address: &Address,
        height: u64,
    ) -> Result<Option<MemberRecord>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        Self::record_in(&txn, self.records, address, height)
    }

    /// The record in force at `height`: the most recent committed version at
    /// or before it, together with the height it was written at.
    pub fn get_at_or_before(
        &self,
        address: &Address,
        height: u64,
    ) -> Result<Option<(u64, MemberRecord)>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        let versions = Self::versions_in(&txn, self.heights, address)?;
        let found = match Self::floor_version(&versions, height) {
            Some(found) => found,
            None => return Ok(None),
        };
        let record = Self::record_in(&txn, self.records, address, found)?.ok_or_else(|| {
            LedgerError::MalformedRecord(format!(
                "height index names {address}@{found} but no record is stored"
            ))
        })?;
        Ok(Some((found, record)))
    }

    /// Distribution rate recorded for `leader` at exactly `height`, in bps.
    pub fn rate(&self, leader: &Address, height: u64) -> Result<Option<u64>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.rates, &version_key(leader, height)) {
            Ok(bytes) => Ok(Some(be_bytes_to_u64(bytes))),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically materialize a block's pending set. Record puts/deletes,
    /// height-index maintenance, and rate puts all land in one write
    /// transaction; on failure the transaction aborts and prior state is
    /// untouched.
    pub fn commit_batch(
        &self,
        height: u64,
        entries: &BTreeMap<RecordKey, CacheEntry>,
        rates: &BTreeMap<RecordKey, u64>,
    ) -> Result<(), LedgerError> {
        let mut txn = self.env.begin_rw_txn()?;

        for (key, entry) in entries {
            match entry {
                CacheEntry::Pending(record) => {
                    let encoded = record.encode()?;
                    txn.put(
                        self.records,
                        &version_key(&key.address, key.height),
                        &encoded.as_bytes(),
                        WriteFlags::empty(),
                    )?;
                    self.index_insert(&mut txn, &key.address, key.height)?;
                }
                CacheEntry::Deleted => {
                    match txn.del(self.records, &version_key(&key.address, key.height), None) {
                        Ok(()) | Err(lmdb::Error::NotFound) => {}
                        Err(e) => return Err(e.into()),
                    }
                    self.index_remove(&mut txn, &key.address, key.height)?;
                }
            }
        }

        for (key, rate_bps) in rates {
            txn.put(
                self.rates,
                &version_key(&key.address, key.height),
                &rate_bps.to_be_bytes(),
                WriteFlags::empty(),
            )?;
        }

        txn.commit()?;
        debug!(
            height,
            records = entries.len(),
            rates = rates.len(),
            "committed record batch"
        );
        Ok(())
    }

    /// Add a height to the address's version index, keeping it sorted. An
    /// already-indexed height means the record was rewritten in place.
    fn index_insert(
        &self,
        txn: &mut lmdb::RwTransaction,
        address: &Address,
        height: u64,
    ) -> Result<(), LedgerError> {
        let existing = match txn.get(self.heights, &address.as_bytes()) {
            Ok(bytes) => bytes.to_vec(),
            Err(lmdb::Error::NotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut versions: Vec<u64> = existing
            .chunks(8)
            .filter(|chunk| chunk.len() == 8)
            .map(be_bytes_to_u64)
            .collect();
        match versions.binary_search(&height) {
            Ok(_) => return Ok(()),
            Err(pos) => versions.insert(pos, height),
        }

        let mut encoded = Vec::with_capacity(versions.len() * 8);
        for version in &versions {
            encoded.extend_from_slice(&version.to_be_bytes());
        }
        txn.put(self.heights, &address.as_bytes(), &encoded, WriteFlags::empty())?;
        Ok(())
    }

    /// Remove a height from the address's version index, dropping the entry
    /// entirely once no versions remain.
    fn index_remove(
        &self,
        txn: &mut lmdb::RwTransaction,
        address: &Address,
        height: u64,
    ) -> Result<(), LedgerError> {
        let existing = match txn.get(self.heights, &address.as_bytes()) {
            Ok(bytes) => bytes.to_vec(),
            Err(lmdb::Error::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let height_bytes = height.to_be_bytes();
        let filtered: Vec<u8> = existing
            .chunks(8)
            .filter(|chunk| chunk != &height_bytes)
            .flat_map(|chunk| chunk.iter().copied())
            .collect();

        if filtered.is_empty() {
            let _ = txn.del(self.heights, &address.as_bytes(), None);
        } else {
            txn.put(self.heights, &address.as_bytes(), &filtered, WriteFlags::empty())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TEST_MAP_SIZE: usize = 16 * 1024 * 1024;

    fn open_store(dir: &Path) -> VersionedStore {
        VersionedStore::open(dir, TEST_MAP_SIZE).unwrap()
    }

    fn pending(power: u64, balance: i64) -> CacheEntry {
        CacheEntry::Pending(MemberRecord {
            power,
            balance,
            ..Default::default()
        })
    }

    fn batch(entries: Vec<(RecordKey, CacheEntry)>) -> BTreeMap<RecordKey, CacheEntry> {
        entries.into_iter().collect()
    }

    #[test]
    fn test_open_empty() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let addr = Address::from("1Addr");
        assert!(!store.has_record(&addr).unwrap());
        assert!(store.get_at_or_before(&addr, 100).unwrap().is_none());
    }

    #[test]
    fn test_at_or_before_resolution() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let addr = Address::from("1Addr");

        store
            .commit_batch(
                5,
                &batch(vec![(RecordKey::new(addr.clone(), 5), pending(1, 10))]),
                &BTreeMap::new(),
            )
            .unwrap();
        store
            .commit_batch(
                9,
                &batch(vec![(RecordKey::new(addr.clone(), 9), pending(2, 20))]),
                &BTreeMap::new(),
            )
            .unwrap();

        assert!(store.get_at_or_before(&addr, 4).unwrap().is_none());
        let (height, record) = store.get_at_or_before(&addr, 5).unwrap().unwrap();
        assert_eq!((height, record.power), (5, 1));
        let (height, record) = store.get_at_or_before(&addr, 7).unwrap().unwrap();
        assert_eq!((height, record.power), (5, 1));
        let (height, record) = store.get_at_or_before(&addr, 9).unwrap().unwrap();
        assert_eq!((height, record.power), (9, 2));
        let (height, record) = store.get_at_or_before(&addr, 10_000).unwrap().unwrap();
        assert_eq!((height, record.power), (9, 2));

        assert_eq!(store.versions(&addr).unwrap(), vec![5, 9]);
    }

    #[test]
    fn test_delete_unwinds_index() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let addr = Address::from("1Addr");

        store
            .commit_batch(
                3,
                &batch(vec![(RecordKey::new(addr.clone(), 3), pending(1, 0))]),
                &BTreeMap::new(),
            )
            .unwrap();
        store
            .commit_batch(
                3,
                &batch(vec![(RecordKey::new(addr.clone(), 3), CacheEntry::Deleted)]),
                &BTreeMap::new(),
            )
            .unwrap();

        assert!(!store.has_record(&addr).unwrap());
        assert!(store.get_exact(&addr, 3).unwrap().is_none());
        assert!(store.get_at_or_before(&addr, 3).unwrap().is_none());
    }

    #[test]
    fn test_commit_batch_is_atomic_on_mid_batch_failure() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let good = Address::from("1AGood");
        // An address containing the codec delimiter fails encode() partway
        // through the batch, after the first put already happened.
        let bad = CacheEntry::Pending(MemberRecord {
            father: Address::from("bad_father"),
            ..Default::default()
        });

        let result = store.commit_batch(
            7,
            &batch(vec![
                (RecordKey::new(good.clone(), 7), pending(1, 1)),
                (RecordKey::new(Address::from("1ZBad"), 7), bad),
            ]),
            &BTreeMap::new(),
        );
        assert!(matches!(result, Err(LedgerError::MalformedRecord(_))));

        // The aborted transaction left no partial subset behind.
        assert!(!store.has_record(&good).unwrap());
        assert!(store.get_exact(&good, 7).unwrap().is_none());
    }

    #[test]
    fn test_rates_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let leader = Address::from("1Leader");

        let rates: BTreeMap<RecordKey, u64> =
            [(RecordKey::new(leader.clone(), 11), 7_500u64)].into_iter().collect();
        store.commit_batch(11, &BTreeMap::new(), &rates).unwrap();

        assert_eq!(store.rate(&leader, 11).unwrap(), Some(7_500));
        assert_eq!(store.rate(&leader, 12).unwrap(), None);
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = tempdir().unwrap();
        let addr = Address::from("1Addr");
        {
            let store = open_store(dir.path());
            store
                .commit_batch(
                    2,
                    &batch(vec![(RecordKey::new(addr.clone(), 2), pending(4, 40))]),
                    &BTreeMap::new(),
                )
                .unwrap();
        }
        let store = open_store(dir.path());
        let (_, record) = store.get_at_or_before(&addr, 2).unwrap().unwrap();
        assert_eq!(record.power, 4);
        assert_eq!(record.balance, 40);
    }
}
