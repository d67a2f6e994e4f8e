// Copyright (c) 2024 Botho Foundation

//! Height-versioned member and reward ledger.
//!
//! Tracks, per address: its position in the referral tree (father pointer and
//! assigned block packer), its accumulated mining power together with its
//! group's aggregate power, and its accrued reward balance. Every record is
//! versioned by block height, so the ledger can be read as of any committed
//! height and rolled back exactly during chain reorganization.
//!
//! Block processing drives the ledger once per transaction and once per
//! block, in both the forward (apply) and reverse (undo) directions. Pending
//! mutations accumulate in a write cache and become durable only through the
//! atomic [`MemberLedger::commit`].

pub mod address;
pub mod cache;
pub mod club;
pub mod config;
pub mod error;
pub mod ledger;
pub mod record;
pub mod rewards;
pub mod store;
pub mod tx;

pub use address::{Address, Amount};
pub use club::{ClubDirectory, InMemoryClubDirectory};
pub use config::LedgerConfig;
pub use error::LedgerError;
pub use ledger::MemberLedger;
pub use record::MemberRecord;
pub use rewards::{compute_member_reward, Distribution};
pub use tx::{CoinView, InputValues, OutPoint, Transaction, TxInput, TxKind, TxOp, TxOutput};
