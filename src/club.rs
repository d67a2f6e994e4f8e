//! Club metadata collaborator.
//!
//! Maps addresses to the delegation group they belong to. The ledger
//! consults this directory and never mutates it.

use std::collections::BTreeMap;

use crate::address::Address;

pub trait ClubDirectory: Send + Sync {
    /// The leader of the club the address belongs to, if any.
    fn leader_of(&self, address: &Address) -> Option<Address>;

    /// Every member of the club led by `leader`, excluding the leader
    /// itself, in address order.
    fn members_of(&self, leader: &Address) -> Vec<Address>;
}

/// Static directory for embedders that already hold club membership in
/// memory, and for tests.
#[derive(Debug, Default)]
pub struct InMemoryClubDirectory {
    members_by_leader: BTreeMap<Address, Vec<Address>>,
}

impl InMemoryClubDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_club(&mut self, leader: Address, mut members: Vec<Address>) {
        members.sort();
        members.dedup();
        members.retain(|m| *m != leader);
        self.members_by_leader.insert(leader, members);
    }
}

impl ClubDirectory for InMemoryClubDirectory {
    fn leader_of(&self, address: &Address) -> Option<Address> {
        for (leader, members) in &self.members_by_leader {
            if leader == address || members.contains(address) {
                return Some(leader.clone());
            }
        }
        None
    }

    fn members_of(&self, leader: &Address) -> Vec<Address> {
        self.members_by_leader
            .get(leader)
            .cloned()
            .unwrap_or_default()
    }
}
