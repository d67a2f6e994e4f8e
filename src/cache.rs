// Copyright (c) 2024 Botho Foundation

//! Two-tier caching in front of the versioned store.
//!
//! The write cache is the height-scoped overlay of a block's pending
//! mutations; nothing reaches the store until `Commit` flushes the whole set
//! atomically. The read cache memoizes store resolutions and is dropped
//! whenever the answer set could change.

use std::collections::{BTreeMap, HashMap};

use crate::address::Address;
use crate::record::MemberRecord;

/// Typed key of a record version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub address: Address,
    pub height: u64,
}

impl RecordKey {
    pub fn new(address: Address, height: u64) -> Self {
        Self { address, height }
    }
}

/// A pending mutation for one record version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    Pending(MemberRecord),
    /// The version is to be removed; written only when undoing the
    /// operation that created it.
    Deleted,
}

/// Height-scoped overlay of pending record mutations, plus the pending
/// per-leader distribution rates recorded while processing the block.
#[derive(Debug, Default)]
pub struct WriteCache {
    entries: BTreeMap<RecordKey, CacheEntry>,
    rates: BTreeMap<RecordKey, u64>,
}

impl WriteCache {
    pub fn insert(&mut self, key: RecordKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Exact-height pending entry.
    pub fn get(&self, key: &RecordKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// The pending entry with the greatest height at or below `height` for
    /// this address. Pending versions participate in at-or-before
    /// resolution just like committed ones.
    pub fn get_at_or_before(
        &self,
        address: &Address,
        height: u64,
    ) -> Option<(u64, &CacheEntry)> {
        let lo = RecordKey::new(address.clone(), 0);
        let hi = RecordKey::new(address.clone(), height);
        self.entries
            .range(lo..=hi)
            .next_back()
            .map(|(key, entry)| (key.height, entry))
    }

    pub fn insert_rate(&mut self, leader: Address, height: u64, rate_bps: u64) {
        self.rates.insert(RecordKey::new(leader, height), rate_bps);
    }

    pub fn rate(&self, leader: &Address, height: u64) -> Option<u64> {
        self.rates
            .get(&RecordKey::new(leader.clone(), height))
            .copied()
    }

    pub fn entries(&self) -> &BTreeMap<RecordKey, CacheEntry> {
        &self.entries
    }

    pub fn rates(&self) -> &BTreeMap<RecordKey, u64> {
        &self.rates
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.rates.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.rates.clear();
    }
}

/// Memo of records already resolved against the store. Never a write path:
/// the write cache always takes precedence over anything memoized here.
#[derive(Debug, Default)]
pub struct ReadCache {
    records: HashMap<RecordKey, MemberRecord>,
}

impl ReadCache {
    pub fn get(&self, key: &RecordKey) -> Option<&MemberRecord> {
        self.records.get(key)
    }

    pub fn insert(&mut self, key: RecordKey, record: MemberRecord) {
        self.records.insert(key, record);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
