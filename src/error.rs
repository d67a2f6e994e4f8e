// Copyright (c) 2024 Botho Foundation

use thiserror::Error;

use crate::address::{Address, Amount};

/// Errors surfaced by ledger operations.
///
/// Storage and codec failures abort the current block's application; the
/// pending write cache is left intact so the caller may `ClearCache` and
/// reprocess the block from scratch.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Storage(#[from] lmdb::Error),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// Father resolution found no input address with a ledger record.
    #[error("No eligible father among transaction inputs")]
    NoEligibleFather,

    /// A reward split failed to reconcile with the amount being distributed.
    /// Never swallowed: it indicates a reward-accounting fault.
    #[error("Distribution mismatch: distributed {distributed} of {total}")]
    DistributionMismatch { total: Amount, distributed: Amount },

    #[error("Ledger already initialized: {0} has a record")]
    AlreadyInitialized(Address),

    /// An undo could not find the committed prior state it must restore.
    #[error("Missing prior state for {0} during undo")]
    MissingPriorState(Address),
}
