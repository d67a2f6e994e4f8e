// Copyright (c) 2024 Botho Foundation

//! Address and amount primitives.
//!
//! Addresses are opaque base58-style strings owned by the wallet/key layer;
//! this crate only orders them, hashes them, and uses their bytes as store
//! key material. Amounts are signed fixed-point integers so paired
//! credit/debit bookkeeping can be expressed directly.

use std::fmt;

/// Signed fixed-point reward amount.
pub type Amount = i64;

/// An opaque blockchain address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(String);

impl Address {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Key material for the versioned store.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty address, used by records not yet attached to the
    /// referral tree.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}
