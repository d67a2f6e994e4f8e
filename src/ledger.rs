// Copyright (c) 2024 Botho Foundation

//! The member ledger coordinator.
//!
//! [`MemberLedger`] owns the versioned store and both caches, tracks the
//! current height, and exposes the apply/undo entry points block processing
//! drives. All operations take `&mut self`: block processing is sequential
//! and the embedding node holds the single instance behind one mutex, so the
//! ledger itself carries no locking.
//!
//! A block is applied transaction by transaction into the write cache, then
//! either committed atomically via [`MemberLedger::commit`] or discarded via
//! [`MemberLedger::clear_cache`]. Undo runs the same operations in reverse
//! order with [`TxOp::Undo`]; the versioned layout keeps every committed
//! prior state available, so rollback restores records exactly.

use std::sync::Arc;

use tracing::{debug, info};

use crate::address::{Address, Amount};
use crate::cache::{CacheEntry, ReadCache, RecordKey, WriteCache};
use crate::club::ClubDirectory;
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::record::MemberRecord;
use crate::rewards::{forwarded_rate_bps, plan_distribution, Distribution};
use crate::store::VersionedStore;
use crate::tx::{CoinView, InputValues, Transaction, TxKind, TxOp};

pub struct MemberLedger {
    store: VersionedStore,
    write_cache: WriteCache,
    read_cache: ReadCache,
    clubs: Arc<dyn ClubDirectory>,
    current_height: u64,
    max_father_depth: usize,
}

impl MemberLedger {
    /// Open or create a ledger at the configured path.
    pub fn open(
        config: &LedgerConfig,
        clubs: Arc<dyn ClubDirectory>,
    ) -> Result<Self, LedgerError> {
        let store = VersionedStore::open(&config.path, config.map_size)?;
        info!(path = %config.path.display(), "opened member ledger");
        Ok(Self {
            store,
            write_cache: WriteCache::default(),
            read_cache: ReadCache::default(),
            clubs,
            current_height: 0,
            max_father_depth: config.max_father_depth,
        })
    }

    // ========================================================================
    // Height bookkeeping and cache lifecycle
    // ========================================================================

    pub fn set_current_height(&mut self, height: u64) {
        self.current_height = height;
    }

    pub fn current_height(&self) -> u64 {
        self.current_height
    }

    /// Atomically flush the pending set and make `height` current.
    ///
    /// Entries carry their own heights (an undone block commits restored
    /// records keyed at the undone height while `height` steps back to the
    /// prior one). On storage failure the caches are left intact so the
    /// caller may retry or discard via [`Self::clear_cache`].
    pub fn commit(&mut self, height: u64) -> Result<(), LedgerError> {
        self.store
            .commit_batch(height, self.write_cache.entries(), self.write_cache.rates())?;
        let flushed = self.write_cache.len();
        self.write_cache.clear();
        self.read_cache.clear();
        self.current_height = height;
        info!(height, records = flushed, "committed member ledger block");
        Ok(())
    }

    /// Discard all pending mutations without writing, e.g. after a block
    /// fails validation partway through.
    pub fn clear_cache(&mut self) {
        self.write_cache.clear();
    }

    /// Drop the read memo. Done automatically on every commit, since
    /// at-or-before answers change across heights.
    pub fn clear_read_cache(&mut self) {
        self.read_cache.clear();
    }

    // ========================================================================
    // Genesis
    // ========================================================================

    /// Seed self-rooted records for a fixed address set at height 0.
    pub fn init_genesis_db(&mut self, addresses: &[Address]) -> Result<(), LedgerError> {
        for address in addresses {
            if self.store.has_record(address)? {
                return Err(LedgerError::AlreadyInitialized(address.clone()));
            }
        }
        for address in addresses {
            self.stage(address, 0, MemberRecord::genesis(address));
        }
        self.commit(0)?;
        info!(count = addresses.len(), "seeded genesis member records");
        Ok(())
    }

    // ========================================================================
    // Father / power updates
    // ========================================================================

    /// Attribute a transaction in the referral tree and adjust the power
    /// counters, or exactly invert a prior attribution.
    pub fn update_father_and_mp_by_tx(
        &mut self,
        tx: &Transaction,
        view: &dyn CoinView,
        height: u64,
        op: &TxOp,
    ) -> Result<(), LedgerError> {
        match tx.kind {
            // Block rewards carry no spendable inputs to attribute; genesis
            // addresses are seeded by init_genesis_db instead.
            TxKind::Reward => Ok(()),
            TxKind::Entrust => self.entrust_by_tx(tx, view, height, op),
            TxKind::Standard => self.attribute_by_tx(tx, view, height, op),
        }
    }

    fn attribute_by_tx(
        &mut self,
        tx: &Transaction,
        view: &dyn CoinView,
        height: u64,
        op: &TxOp,
    ) -> Result<(), LedgerError> {
        let values = self.input_values(tx, view, op);
        let primary = self.select_primary(&values, height)?;

        if op.is_undo() {
            let record = self
                .record_at(&primary, height)?
                .ok_or_else(|| LedgerError::MissingPriorState(primary.clone()))?;
            let father = record.father.clone();

            // take back the unit of power
            self.cache_power_bump(&primary, height, true)?;
            self.cache_group_power_change(&father, height, 1, false)?;

            // restore the pre-block father/packer, moving the remaining own
            // power back if the forward op re-fathered the address
            let baseline = self.committed_at(&primary, height.saturating_sub(1))?;
            let (prior_father, prior_packer) = match &baseline {
                Some(prior) => (prior.father.clone(), prior.packer.clone()),
                None => (Address::default(), Address::default()),
            };
            if prior_father != father {
                let remaining = self
                    .record_at(&primary, height)?
                    .map(|r| r.power)
                    .unwrap_or(0);
                self.cache_group_power_change(&father, height, remaining, false)?;
                self.cache_group_power_change(&prior_father, height, remaining, true)?;
            }
            self.cache_father_and_packer(&primary, height, prior_father, prior_packer)?;

            self.tombstone_if_created(&primary, height)?;
            self.tombstone_if_created(&father, height)?;
            debug!(%primary, height, "undid father attribution");
        } else {
            let current = self
                .record_at(&primary, height)?
                .ok_or_else(|| LedgerError::MissingPriorState(primary.clone()))?;
            let father = self.resolve_root(&primary, height)?;
            let packer = self
                .record_at(&father, height)?
                .map(|r| r.packer)
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| father.clone());

            // re-fathering moves the address's own prior power with it
            if current.father != father {
                self.cache_group_power_change(&current.father, height, current.power, false)?;
                self.cache_group_power_change(&father, height, current.power, true)?;
            }
            self.cache_father_and_packer(&primary, height, father.clone(), packer)?;
            self.cache_power_bump(&primary, height, false)?;
            self.cache_group_power_change(&father, height, 1, true)?;
            debug!(%primary, %father, height, "attributed transaction");
        }
        Ok(())
    }

    /// Explicit delegation: the input address re-fathers itself to the first
    /// output address, moving its own power contribution between the two
    /// fathers' group counters within the same pending batch.
    fn entrust_by_tx(
        &mut self,
        tx: &Transaction,
        view: &dyn CoinView,
        height: u64,
        op: &TxOp,
    ) -> Result<(), LedgerError> {
        let values = self.input_values(tx, view, op);
        let delegator = match values.keys().next() {
            Some(address) => address.clone(),
            None => return Err(LedgerError::NoEligibleFather),
        };
        let target = match tx.outputs.first() {
            Some(output) => output.address.clone(),
            None => return Err(LedgerError::NoEligibleFather),
        };
        let record = self
            .record_at(&delegator, height)?
            .ok_or(LedgerError::NoEligibleFather)?;

        if op.is_undo() {
            let baseline = self
                .committed_at(&delegator, height.saturating_sub(1))?
                .ok_or_else(|| LedgerError::MissingPriorState(delegator.clone()))?;
            let current_father = record.father.clone();
            if current_father != baseline.father {
                self.cache_group_power_change(&current_father, height, record.power, false)?;
                self.cache_group_power_change(&baseline.father, height, record.power, true)?;
            }
            self.cache_father_and_packer(
                &delegator,
                height,
                baseline.father.clone(),
                baseline.packer.clone(),
            )?;
            self.tombstone_if_created(&current_father, height)?;
            debug!(%delegator, father = %baseline.father, height, "undid entrustment");
        } else {
            let old_father = record.father.clone();
            if old_father != target {
                self.cache_group_power_change(&old_father, height, record.power, false)?;
                self.cache_group_power_change(&target, height, record.power, true)?;
            }
            let packer = self
                .record_at(&target, height)?
                .map(|r| r.packer)
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| target.clone());
            self.cache_father_and_packer(&delegator, height, target.clone(), packer)?;
            debug!(%delegator, father = %target, height, "entrusted");
        }
        Ok(())
    }

    /// The input address the transaction is attributed to: greatest total
    /// spent value, ties broken to the lexicographically smallest address,
    /// restricted to addresses that already have a ledger record.
    fn select_primary(
        &mut self,
        values: &InputValues,
        height: u64,
    ) -> Result<Address, LedgerError> {
        let mut candidates: Vec<(&Address, &Amount)> = values.iter().collect();
        candidates.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (address, _) in candidates {
            if self.record_at(address, height)?.is_some() {
                return Ok(address.clone());
            }
        }
        Err(LedgerError::NoEligibleFather)
    }

    /// Walk the father chain from `start` to its root: a self-reference or
    /// an unattached record, bounded by the configured depth.
    fn resolve_root(&mut self, start: &Address, height: u64) -> Result<Address, LedgerError> {
        let mut current = start.clone();
        for _ in 0..self.max_father_depth {
            let record = match self.record_at(&current, height)? {
                Some(record) => record,
                None => break,
            };
            if record.father.is_empty() || record.father == current {
                break;
            }
            current = record.father;
        }
        Ok(current)
    }

    /// Per-address spent-value totals: supplied with the operation when
    /// present, otherwise resolved through the coin view.
    fn input_values(&self, tx: &Transaction, view: &dyn CoinView, op: &TxOp) -> InputValues {
        match op.provided_values() {
            Some(values) if !values.is_empty() => values.clone(),
            _ => {
                let mut totals = InputValues::new();
                for input in &tx.inputs {
                    match view.resolve(&input.previous) {
                        Some((address, value)) => {
                            *totals.entry(address).or_insert(0) += value;
                        }
                        None => debug!(
                            outpoint = %hex::encode(&input.previous.txid[0..8]),
                            "input not found in coin view"
                        ),
                    }
                }
                totals
            }
        }
    }

    // ========================================================================
    // Rewards
    // ========================================================================

    /// Apply (or invert) a transaction's balance traffic.
    ///
    /// Reward transactions credit their outputs, which the block builder
    /// derives from [`Self::init_rewards_dist`]; everything else debits the
    /// spent inputs and credits the outputs.
    pub fn update_rewards_by_tx(
        &mut self,
        tx: &Transaction,
        view: &dyn CoinView,
        block_reward: Amount,
        height: u64,
        op: &TxOp,
    ) -> Result<(), LedgerError> {
        let undo = op.is_undo();
        if tx.is_reward() {
            let paid: Amount = tx.outputs.iter().map(|o| o.value).sum();
            if paid > block_reward {
                return Err(LedgerError::DistributionMismatch {
                    total: block_reward,
                    distributed: paid,
                });
            }
            for output in &tx.outputs {
                self.cache_reward_change(&output.address, height, output.value, undo)?;
            }
            return Ok(());
        }

        let values = self.input_values(tx, view, op);
        for (address, value) in &values {
            self.cache_reward_change(address, height, -value, undo)?;
        }
        for output in &tx.outputs {
            self.cache_reward_change(&output.address, height, output.value, undo)?;
        }
        Ok(())
    }

    /// Plan the split of a block's member reward pool across the packer's
    /// club, proportional to accumulated power at `height`. Pure compute:
    /// the block builder turns the returned shares into the reward
    /// transaction's outputs, and [`Self::update_rewards_by_tx`] credits
    /// them, which is what keeps undo exact.
    pub fn init_rewards_dist(
        &mut self,
        member_total: Amount,
        packer: &Address,
        height: u64,
    ) -> Result<Distribution, LedgerError> {
        let leader = self
            .clubs
            .leader_of(packer)
            .unwrap_or_else(|| packer.clone());
        let group_power = self.get_total_tx_cnt(&leader, height)?;
        let member_addrs = self.clubs.members_of(&leader);
        let mut members = Vec::with_capacity(member_addrs.len());
        for address in member_addrs {
            let power = self.get_tx_cnt(&address, height)?;
            members.push((address, power));
        }
        let dist = plan_distribution(leader, &members, group_power, member_total)?;
        debug!(
            leader = %dist.leader,
            distributed = dist.distributed,
            members = dist.member_rewards.len(),
            height,
            "planned reward distribution"
        );
        Ok(dist)
    }

    /// Record the fraction of the block reward a leader forwarded to its
    /// members at `height`, pending until commit.
    pub fn reward_rate_update(
        &mut self,
        block_reward: Amount,
        distributed: Amount,
        leader: &Address,
        height: u64,
    ) -> Result<(), LedgerError> {
        let rate_bps = forwarded_rate_bps(block_reward, distributed)?;
        self.write_cache.insert_rate(leader.clone(), height, rate_bps);
        debug!(%leader, rate_bps, height, "recorded distribution rate");
        Ok(())
    }

    /// Distribution rate recorded for `leader` at exactly `height`, in bps.
    pub fn get_reward_rate(
        &self,
        leader: &Address,
        height: u64,
    ) -> Result<Option<u64>, LedgerError> {
        if let Some(rate) = self.write_cache.rate(leader, height) {
            return Ok(Some(rate));
        }
        self.store.rate(leader, height)
    }

    // ========================================================================
    // Query surface
    // ========================================================================

    pub fn get_packer(
        &mut self,
        address: &Address,
        height: u64,
    ) -> Result<Option<Address>, LedgerError> {
        Ok(self
            .record_at(address, height)?
            .map(|r| r.packer)
            .filter(|p| !p.is_empty()))
    }

    pub fn get_father(
        &mut self,
        address: &Address,
        height: u64,
    ) -> Result<Option<Address>, LedgerError> {
        Ok(self
            .record_at(address, height)?
            .map(|r| r.father)
            .filter(|f| !f.is_empty()))
    }

    /// This address's own accumulated power (transaction count).
    pub fn get_tx_cnt(&mut self, address: &Address, height: u64) -> Result<u64, LedgerError> {
        Ok(self.record_at(address, height)?.map(|r| r.power).unwrap_or(0))
    }

    /// Aggregate power of the group rooted at this address.
    pub fn get_total_tx_cnt(
        &mut self,
        address: &Address,
        height: u64,
    ) -> Result<u64, LedgerError> {
        Ok(self
            .record_at(address, height)?
            .map(|r| r.group_power)
            .unwrap_or(0))
    }

    pub fn get_rwd_balance(
        &mut self,
        address: &Address,
        height: u64,
    ) -> Result<Amount, LedgerError> {
        Ok(self
            .record_at(address, height)?
            .map(|r| r.balance)
            .unwrap_or(0))
    }

    /// The full record in force at `height`. With `db_only` the caches are
    /// bypassed and only committed state is consulted; the undo paths read
    /// their restore baseline this way.
    pub fn get_full_record(
        &mut self,
        address: &Address,
        height: u64,
        db_only: bool,
    ) -> Result<Option<MemberRecord>, LedgerError> {
        if db_only {
            return self.committed_at(address, height);
        }
        self.record_at(address, height)
    }

    /// Harvest power of a club leader: the aggregate power of the club it
    /// leads. Zero for everyone else.
    pub fn get_harvest_power_by_address(
        &mut self,
        address: &Address,
        height: u64,
    ) -> Result<u64, LedgerError> {
        if self.clubs.leader_of(address).as_ref() == Some(address) {
            return self.get_total_tx_cnt(address, height);
        }
        Ok(0)
    }

    // ========================================================================
    // Record plumbing
    // ========================================================================

    /// The record in force for `address` at `height`: the write cache takes
    /// precedence, then the read memo, then the store's at-or-before
    /// resolution (memoized on first use).
    fn record_at(
        &mut self,
        address: &Address,
        height: u64,
    ) -> Result<Option<MemberRecord>, LedgerError> {
        if let Some((_, entry)) = self.write_cache.get_at_or_before(address, height) {
            return Ok(match entry {
                CacheEntry::Pending(record) => Some(record.clone()),
                CacheEntry::Deleted => None,
            });
        }
        let key = RecordKey::new(address.clone(), height);
        if let Some(record) = self.read_cache.get(&key) {
            return Ok(Some(record.clone()));
        }
        match self.store.get_at_or_before(address, height)? {
            Some((_, record)) => {
                self.read_cache.insert(key, record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Committed state only, bypassing both caches.
    fn committed_at(
        &self,
        address: &Address,
        height: u64,
    ) -> Result<Option<MemberRecord>, LedgerError> {
        Ok(self
            .store
            .get_at_or_before(address, height)?
            .map(|(_, record)| record))
    }

    fn stage(&mut self, address: &Address, height: u64, record: MemberRecord) {
        self.write_cache.insert(
            RecordKey::new(address.clone(), height),
            CacheEntry::Pending(record),
        );
    }

    /// Load the working copy of a record for mutation at `height`.
    fn working_record(
        &mut self,
        address: &Address,
        height: u64,
    ) -> Result<MemberRecord, LedgerError> {
        Ok(self.record_at(address, height)?.unwrap_or_default())
    }

    fn cache_father_and_packer(
        &mut self,
        address: &Address,
        height: u64,
        father: Address,
        packer: Address,
    ) -> Result<(), LedgerError> {
        let mut record = self.working_record(address, height)?;
        record.father = father;
        record.packer = packer;
        self.stage(address, height, record);
        Ok(())
    }

    fn cache_power_bump(
        &mut self,
        address: &Address,
        height: u64,
        undo: bool,
    ) -> Result<(), LedgerError> {
        let mut record = self.working_record(address, height)?;
        if undo {
            record.power = record
                .power
                .checked_sub(1)
                .ok_or_else(|| LedgerError::MissingPriorState(address.clone()))?;
        } else {
            record.power += 1;
        }
        self.stage(address, height, record);
        Ok(())
    }

    /// Adjust a father's aggregate counter. No-op for the empty (unattached)
    /// address; an undo driving the counter below zero means the expected
    /// prior state is gone.
    fn cache_group_power_change(
        &mut self,
        address: &Address,
        height: u64,
        count: u64,
        add: bool,
    ) -> Result<(), LedgerError> {
        if address.is_empty() || count == 0 {
            return Ok(());
        }
        let mut record = self.working_record(address, height)?;
        if add {
            record.group_power = record.group_power.saturating_add(count);
        } else {
            record.group_power = record
                .group_power
                .checked_sub(count)
                .ok_or_else(|| LedgerError::MissingPriorState(address.clone()))?;
        }
        self.stage(address, height, record);
        Ok(())
    }

    fn cache_reward_change(
        &mut self,
        address: &Address,
        height: u64,
        change: Amount,
        undo: bool,
    ) -> Result<(), LedgerError> {
        let delta = if undo { -change } else { change };
        let mut record = self.working_record(address, height)?;
        record.balance += delta;
        self.stage(address, height, record);
        if undo {
            self.tombstone_if_created(address, height)?;
        }
        Ok(())
    }

    /// After an undo, a record left fully vacant with no committed version
    /// below `height` was created by the operation being undone; remove the
    /// version instead of keeping an empty one.
    fn tombstone_if_created(
        &mut self,
        address: &Address,
        height: u64,
    ) -> Result<(), LedgerError> {
        if address.is_empty() || height == 0 {
            return Ok(());
        }
        let key = RecordKey::new(address.clone(), height);
        let vacant = matches!(
            self.write_cache.get(&key),
            Some(CacheEntry::Pending(record)) if record.is_vacant()
        );
        if !vacant {
            return Ok(());
        }
        if self
            .store
            .version_at_or_before(address, height - 1)?
            .is_none()
        {
            self.write_cache.insert(key, CacheEntry::Deleted);
        }
        Ok(())
    }
}
