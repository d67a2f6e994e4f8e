// Copyright (c) 2024 Botho Foundation

//! The per-address member record and its storage codec.
//!
//! Records are stored as five `_`-delimited fields:
//! `packer_father_power_groupPower_balance`. The format round-trips exactly;
//! decoding fails on truncated or non-numeric input rather than guessing.

use crate::address::{Address, Amount};
use crate::error::LedgerError;

/// Field delimiter of the stored record format. Addresses never contain it.
const DELIMITER: char = '_';

/// One member's ledger state at a given height.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemberRecord {
    /// Address designated to pack blocks on this member's behalf.
    pub packer: Address,
    /// Address this member's mining power rolls up to. Empty until the
    /// member is attached to the referral tree; equal to the member itself
    /// at a group root.
    pub father: Address,
    /// This address's own accumulated unit-of-work counter.
    pub power: u64,
    /// Aggregate power of all members currently attributed to this address.
    pub group_power: u64,
    /// Accrued reward balance.
    pub balance: Amount,
}

impl MemberRecord {
    /// A self-rooted record, as seeded for genesis addresses.
    pub fn genesis(address: &Address) -> Self {
        Self {
            packer: address.clone(),
            father: address.clone(),
            power: 0,
            group_power: 0,
            balance: 0,
        }
    }

    /// True when every field is at its initial value. An undo that empties a
    /// record this way is undoing the operation that created it.
    pub fn is_vacant(&self) -> bool {
        self.packer.is_empty()
            && self.father.is_empty()
            && self.power == 0
            && self.group_power == 0
            && self.balance == 0
    }

    /// Serialize to the stored field format.
    pub fn encode(&self) -> Result<String, LedgerError> {
        for addr in [&self.packer, &self.father] {
            if addr.as_str().contains(DELIMITER) {
                return Err(LedgerError::MalformedRecord(format!(
                    "address {addr} contains the field delimiter"
                )));
            }
        }
        Ok(format!(
            "{}_{}_{}_{}_{}",
            self.packer, self.father, self.power, self.group_power, self.balance
        ))
    }

    /// Parse a stored record.
    pub fn decode(input: &str) -> Result<Self, LedgerError> {
        let fields: Vec<&str> = input.split(DELIMITER).collect();
        if fields.len() != 5 {
            return Err(LedgerError::MalformedRecord(format!(
                "expected 5 fields, found {}",
                fields.len()
            )));
        }
        let power = fields[2].parse::<u64>().map_err(|_| {
            LedgerError::MalformedRecord(format!("non-numeric power field: {:?}", fields[2]))
        })?;
        let group_power = fields[3].parse::<u64>().map_err(|_| {
            LedgerError::MalformedRecord(format!(
                "non-numeric group power field: {:?}",
                fields[3]
            ))
        })?;
        let balance = fields[4].parse::<Amount>().map_err(|_| {
            LedgerError::MalformedRecord(format!("non-numeric balance field: {:?}", fields[4]))
        })?;
        Ok(Self {
            packer: Address::from(fields[0]),
            father: Address::from(fields[1]),
            power,
            group_power,
            balance,
        })
    }
}
