// Copyright (c) 2024 Botho Foundation

//! Reward distribution arithmetic.
//!
//! A block's member reward pool is split proportionally to accumulated
//! power. Shares use flooring integer division; the club leader absorbs
//! whatever the flooring leaves over, and the reconciled sum must equal the
//! pool exactly.

use std::collections::BTreeMap;

use crate::address::{Address, Amount};
use crate::error::LedgerError;

/// One member's share of `total_rewards`: floor(total * power / group_power).
///
/// Widened through i128 so large pools cannot overflow the multiply. A group
/// with no accumulated power earns nothing.
pub fn compute_member_reward(
    power: u64,
    group_power: u64,
    total_rewards: Amount,
) -> Result<Amount, LedgerError> {
    if total_rewards < 0 {
        return Err(LedgerError::DistributionMismatch {
            total: total_rewards,
            distributed: 0,
        });
    }
    if group_power == 0 {
        return Ok(0);
    }
    let share = (total_rewards as i128) * (power as i128) / (group_power as i128);
    Ok(share as Amount)
}

/// A reconciled split of a member reward pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub leader: Address,
    /// Sum of all member shares, excluding the leader's retained part.
    pub distributed: Amount,
    /// Per-member shares; zero shares are omitted.
    pub member_rewards: BTreeMap<Address, Amount>,
}

impl Distribution {
    /// What the leader keeps: its own proportional share plus the flooring
    /// remainder.
    pub fn retained(&self, total: Amount) -> Amount {
        total - self.distributed
    }
}

/// Split `total` across `members` proportionally to their power. The leader
/// absorbs the flooring remainder along with its own share. Fails with
/// `DistributionMismatch` when the shares cannot be reconciled with `total`
/// exactly; that check is the primary defense against silent reward
/// inflation or loss.
pub fn plan_distribution(
    leader: Address,
    members: &[(Address, u64)],
    group_power: u64,
    total: Amount,
) -> Result<Distribution, LedgerError> {
    let mut member_rewards = BTreeMap::new();
    let mut distributed: Amount = 0;

    for (member, power) in members {
        if *member == leader {
            continue;
        }
        let share = compute_member_reward(*power, group_power, total)?;
        if share > 0 {
            member_rewards.insert(member.clone(), share);
            distributed += share;
        }
    }

    let retained = total - distributed;
    let reconciled = member_rewards.values().sum::<Amount>() + retained;
    if retained < 0 || reconciled != total {
        return Err(LedgerError::DistributionMismatch { total, distributed });
    }

    Ok(Distribution {
        leader,
        distributed,
        member_rewards,
    })
}

/// Fraction of the block reward forwarded to members, in basis points.
pub fn forwarded_rate_bps(block_reward: Amount, distributed: Amount) -> Result<u64, LedgerError> {
    if block_reward <= 0 || distributed < 0 || distributed > block_reward {
        return Err(LedgerError::DistributionMismatch {
            total: block_reward,
            distributed,
        });
    }
    Ok(((distributed as i128) * 10_000 / (block_reward as i128)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_reward_floors() {
        assert_eq!(compute_member_reward(3, 10, 100).unwrap(), 30);
        // floor of 3.33
        assert_eq!(compute_member_reward(1, 3, 10).unwrap(), 3);
        assert_eq!(compute_member_reward(0, 10, 100).unwrap(), 0);
        assert_eq!(compute_member_reward(5, 0, 100).unwrap(), 0);
    }

    #[test]
    fn test_member_reward_widens() {
        // power * total would overflow i64 without the i128 intermediate
        let total = i64::MAX / 2;
        let share = compute_member_reward(u64::MAX / 2, u64::MAX, total).unwrap();
        assert!(share > 0 && share <= total);
    }

    #[test]
    fn test_member_reward_rejects_negative_total() {
        assert!(matches!(
            compute_member_reward(1, 10, -1),
            Err(LedgerError::DistributionMismatch { .. })
        ));
    }

    #[test]
    fn test_distribution_conserves_total() {
        let leader = Address::from("1Leader");
        let members = vec![
            (Address::from("1MemberA"), 1u64),
            (Address::from("1MemberB"), 2u64),
            (Address::from("1MemberC"), 4u64),
        ];
        // leader holds the remaining 3 units of power
        let dist = plan_distribution(leader.clone(), &members, 10, 100).unwrap();

        assert_eq!(dist.member_rewards[&Address::from("1MemberA")], 10);
        assert_eq!(dist.member_rewards[&Address::from("1MemberB")], 20);
        assert_eq!(dist.member_rewards[&Address::from("1MemberC")], 40);
        assert_eq!(dist.distributed, 70);
        assert_eq!(dist.retained(100), 30);
        assert_eq!(dist.distributed + dist.retained(100), 100);
    }

    #[test]
    fn test_distribution_remainder_goes_to_leader() {
        let leader = Address::from("1Leader");
        let members = vec![(Address::from("1Member"), 1u64)];
        // member earns floor(10 * 1/3) = 3, remainder 1 stays with the
        // leader on top of its own floor(10 * 2/3) = 6
        let dist = plan_distribution(leader.clone(), &members, 3, 10).unwrap();
        assert_eq!(dist.member_rewards[&Address::from("1Member")], 3);
        assert_eq!(dist.retained(10), 7);
    }

    #[test]
    fn test_distribution_skips_leader_and_zero_shares() {
        let leader = Address::from("1Leader");
        let members = vec![
            (leader.clone(), 5u64),
            (Address::from("1Dust"), 0u64),
        ];
        let dist = plan_distribution(leader.clone(), &members, 10, 100).unwrap();
        assert!(dist.member_rewards.is_empty());
        assert_eq!(dist.distributed, 0);
        assert_eq!(dist.retained(100), 100);
    }

    #[test]
    fn test_distribution_mismatch_on_overrun() {
        let leader = Address::from("1Leader");
        // inconsistent counters: a member holding more power than the group
        let members = vec![(Address::from("1Member"), 20u64)];
        assert!(matches!(
            plan_distribution(leader, &members, 10, 100),
            Err(LedgerError::DistributionMismatch { .. })
        ));
    }

    #[test]
    fn test_forwarded_rate() {
        assert_eq!(forwarded_rate_bps(100, 70).unwrap(), 7_000);
        assert_eq!(forwarded_rate_bps(3, 1).unwrap(), 3_333);
        assert_eq!(forwarded_rate_bps(100, 0).unwrap(), 0);
        assert!(forwarded_rate_bps(0, 0).is_err());
        assert!(forwarded_rate_bps(100, 101).is_err());
        assert!(forwarded_rate_bps(100, -1).is_err());
    }
}
