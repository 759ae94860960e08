//! # Committee Membership
//!
//! Who is allowed to vote, and at which tip. The committee-selection policy
//! itself (stake accounting, rotation) lives outside the core; this module
//! only defines the shape of its answer and how the controller consumes it.
//!
//! The committee registered at a tip is the authoritative source of truth
//! for authenticating votes that reference that tip. A key that verifies
//! but is not in that committee is not a voter, full stop.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::consensus::messages::{BlockHash, MemberId};
use crate::crypto::keys::OperatorPublicKey;

/// The ordered set of committee members at one tip: member ID → the
/// operator public key that signs for that seat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
    members: BTreeMap<MemberId, OperatorPublicKey>,
}

impl Committee {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seat a member. Last write wins if a member ID is reused.
    pub fn insert(&mut self, member: MemberId, key: OperatorPublicKey) {
        self.members.insert(member, key);
    }

    /// Number of seats.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The key signing for a member, if seated.
    pub fn key_of(&self, member: &MemberId) -> Option<&OperatorPublicKey> {
        self.members.get(member)
    }

    /// Resolve an operator key to its seat. This is the authentication
    /// lookup: a verified signature is only a vote if its key maps here.
    pub fn member_by_key(&self, key: &OperatorPublicKey) -> Option<MemberId> {
        self.members
            .iter()
            .find(|(_, seat_key)| *seat_key == key)
            .map(|(member, _)| *member)
    }

    /// Iterate seats in member-ID order.
    pub fn iter(&self) -> impl Iterator<Item = (&MemberId, &OperatorPublicKey)> {
        self.members.iter()
    }
}

/// Read access to committee history, within the keep window.
///
/// Implementations must tolerate hashes of ancestors up to
/// `MAX_BLOCKS_TO_KEEP` deep and answer `None` for anything they no longer
/// know — the controller treats that as "unknown block", not as an empty
/// committee.
pub trait CommitteeView {
    /// The committee that was authoritative at this block hash.
    fn committee_at(&self, tip: &BlockHash) -> Option<Committee>;
}

/// A fixed committee for every tip. Devnets and tests; production wires a
/// chain-backed view instead.
#[derive(Debug, Clone, Default)]
pub struct StaticCommittee {
    committee: Committee,
}

impl StaticCommittee {
    pub fn new(committee: Committee) -> Self {
        Self { committee }
    }
}

impl CommitteeView for StaticCommittee {
    fn committee_at(&self, _tip: &BlockHash) -> Option<Committee> {
        Some(self.committee.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::OperatorKeypair;

    fn member(i: u8) -> MemberId {
        [i; 32]
    }

    #[test]
    fn member_resolution_by_key() {
        let mut committee = Committee::new();
        let kp_a = OperatorKeypair::from_seed(&[1u8; 32]);
        let kp_b = OperatorKeypair::from_seed(&[2u8; 32]);
        committee.insert(member(1), kp_a.public_key());
        committee.insert(member(2), kp_b.public_key());

        assert_eq!(committee.member_by_key(&kp_a.public_key()), Some(member(1)));
        assert_eq!(committee.member_by_key(&kp_b.public_key()), Some(member(2)));

        let stranger = OperatorKeypair::from_seed(&[3u8; 32]);
        assert_eq!(committee.member_by_key(&stranger.public_key()), None);
    }

    #[test]
    fn static_view_answers_for_any_tip() {
        let mut committee = Committee::new();
        committee.insert(member(1), OperatorKeypair::generate().public_key());
        let view = StaticCommittee::new(committee.clone());

        assert_eq!(view.committee_at(&[0u8; 32]), Some(committee.clone()));
        assert_eq!(view.committee_at(&[9u8; 32]), Some(committee));
    }

    #[test]
    fn iteration_is_member_ordered() {
        let mut committee = Committee::new();
        committee.insert(member(3), OperatorKeypair::from_seed(&[3u8; 32]).public_key());
        committee.insert(member(1), OperatorKeypair::from_seed(&[1u8; 32]).public_key());
        committee.insert(member(2), OperatorKeypair::from_seed(&[2u8; 32]).public_key());

        let order: Vec<MemberId> = committee.iter().map(|(m, _)| *m).collect();
        assert_eq!(order, vec![member(1), member(2), member(3)]);
    }
}
