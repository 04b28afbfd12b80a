// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Unix permission evaluation.
//!
//! Exactly one tier (owner, group or other) is selected per request and only
//! that tier's bits are tested. There is no fallthrough: an owner whose own
//! triplet lacks a bit is denied even if the group or other triplet grants it.
//! Group selection matches the node's group against the identity's primary
//! group and every secondary group.

use crate::identity::{Gid, Identity, Uid};
use crate::tree::Node;
use crate::types::{AccessMask, Mode, NodeInfo};

/// Anything carrying Unix ownership and mode bits
pub trait Securable {
    fn owner(&self) -> Uid;
    fn group(&self) -> Gid;
    fn mode(&self) -> Mode;
}

impl Securable for Node {
    fn owner(&self) -> Uid {
        self.uid()
    }

    fn group(&self) -> Gid {
        self.gid()
    }

    fn mode(&self) -> Mode {
        Node::mode(self)
    }
}

impl Securable for NodeInfo {
    fn owner(&self) -> Uid {
        self.uid
    }

    fn group(&self) -> Gid {
        self.gid
    }

    fn mode(&self) -> Mode {
        self.mode
    }
}

/// The rule-set a request is evaluated against
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessTier {
    Owner,
    Group,
    Other,
}

impl AccessTier {
    fn shift(self) -> u32 {
        match self {
            AccessTier::Owner => 6,
            AccessTier::Group => 3,
            AccessTier::Other => 0,
        }
    }
}

/// Pick the single applicable tier: owner, else group, else other
pub fn select_tier<N: Securable + ?Sized>(node: &N, identity: &Identity) -> AccessTier {
    if node.owner() == identity.uid {
        AccessTier::Owner
    } else if identity.in_group(node.group()) {
        AccessTier::Group
    } else {
        AccessTier::Other
    }
}

/// Bits granted to `tier` on `node`
pub fn tier_grants<N: Securable + ?Sized>(node: &N, tier: AccessTier) -> AccessMask {
    node.mode().triplet(tier.shift())
}

/// Decide whether `identity` may perform `required` on `node`.
///
/// A missing node is allowed: creation requests check the parent separately.
pub fn check_access<N: Securable + ?Sized>(
    node: Option<&N>,
    identity: &Identity,
    required: AccessMask,
) -> bool {
    let Some(node) = node else {
        return true;
    };
    if identity.is_root() {
        return true;
    }
    let tier = select_tier(node, identity);
    tier_grants(node, tier).contains(required)
}

/// Sticky-directory rule: in a sticky directory only the entry's owner, the
/// directory's owner or root may remove or rename an entry.
pub fn may_unlink_from_sticky<D, C>(dir: &D, child: &C, identity: &Identity) -> bool
where
    D: Securable + ?Sized,
    C: Securable + ?Sized,
{
    if !dir.mode().is_sticky() || identity.is_root() {
        return true;
    }
    identity.uid == dir.owner() || identity.uid == child.owner()
}

/// Only the owner or root may change mode bits
pub fn may_chmod<N: Securable + ?Sized>(node: &N, identity: &Identity) -> bool {
    identity.is_root() || identity.uid == node.owner()
}

/// Root may change anything; an owner may only move the group to one they belong to
pub fn may_chown<N: Securable + ?Sized>(
    node: &N,
    identity: &Identity,
    uid: Option<Uid>,
    gid: Option<Gid>,
) -> bool {
    if identity.is_root() {
        return true;
    }
    if identity.uid != node.owner() {
        return false;
    }
    if uid.is_some_and(|uid| uid != node.owner()) {
        return false;
    }
    gid.map_or(true, |gid| gid == node.group() || identity.in_group(gid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileTimes, NodeType};

    fn info(uid: Uid, gid: Gid, mode: u32) -> NodeInfo {
        NodeInfo {
            path: "/home/alice/notes.txt".to_string(),
            node_type: NodeType::File,
            len: 0,
            uid,
            gid,
            mode: Mode::new(mode),
            times: FileTimes::now(),
            entries: None,
        }
    }

    fn alice() -> Identity {
        Identity::new(1000, "alice", 1000)
    }

    fn bob() -> Identity {
        Identity::new(1001, "bob", 1001)
    }

    #[test]
    fn test_owner_tier_does_not_fall_through() {
        // Owner has no rights, everyone else may read
        let node = info(1000, 1000, 0o044);
        assert_eq!(select_tier(&node, &alice()), AccessTier::Owner);
        assert!(!check_access(Some(&node), &alice(), AccessMask::READ));
        assert!(check_access(Some(&node), &bob(), AccessMask::READ));
    }

    #[test]
    fn test_group_tier_does_not_fall_through() {
        let node = info(1000, 50, 0o604);
        let carol = Identity::new(1002, "carol", 1002).with_groups([50]);
        assert_eq!(select_tier(&node, &carol), AccessTier::Group);
        assert!(!check_access(Some(&node), &carol, AccessMask::READ));
        assert!(check_access(Some(&node), &bob(), AccessMask::READ));
    }

    #[test]
    fn test_secondary_group_selects_group_tier() {
        let node = info(1000, 50, 0o640);
        let staff_member = Identity::new(1001, "bob", 1001).with_groups([50]);
        assert_eq!(select_tier(&node, &staff_member), AccessTier::Group);
        assert!(check_access(Some(&node), &staff_member, AccessMask::READ));
        assert!(!check_access(Some(&node), &staff_member, AccessMask::WRITE));
        assert!(!check_access(Some(&node), &bob(), AccessMask::READ));
    }

    #[test]
    fn test_mask_requires_every_bit() {
        let node = info(1000, 1000, 0o500);
        assert!(check_access(Some(&node), &alice(), AccessMask::READ | AccessMask::EXECUTE));
        assert!(!check_access(Some(&node), &alice(), AccessMask::READ | AccessMask::WRITE));
        assert!(check_access(Some(&node), &alice(), AccessMask::empty()));
    }

    #[test]
    fn test_root_bypasses_everything() {
        let node = info(1000, 1000, 0o000);
        assert!(check_access(Some(&node), &Identity::root(), AccessMask::all()));
    }

    #[test]
    fn test_missing_node_is_allowed() {
        assert!(check_access::<NodeInfo>(None, &bob(), AccessMask::all()));
    }

    #[test]
    fn test_exactly_one_tier_for_every_mode() {
        let carol = Identity::new(1002, "carol", 1000);
        for bits in 0..=0o777u32 {
            let node = info(1000, 1000, bits);
            for identity in [alice(), bob(), carol.clone()] {
                let tier = select_tier(&node, &identity);
                for mask in [AccessMask::READ, AccessMask::WRITE, AccessMask::EXECUTE] {
                    let expected = tier_grants(&node, tier).contains(mask);
                    assert_eq!(check_access(Some(&node), &identity, mask), expected);
                }
            }
        }
    }

    #[test]
    fn test_sticky_directory_rule() {
        let tmp = info(0, 0, 0o1777);
        let alices_file = info(1000, 1000, 0o644);
        assert!(may_unlink_from_sticky(&tmp, &alices_file, &alice()));
        assert!(!may_unlink_from_sticky(&tmp, &alices_file, &bob()));
        assert!(may_unlink_from_sticky(&tmp, &alices_file, &Identity::root()));

        let plain = info(0, 0, 0o777);
        assert!(may_unlink_from_sticky(&plain, &alices_file, &bob()));
    }

    #[test]
    fn test_chmod_and_chown_rules() {
        let node = info(1000, 1000, 0o644);
        assert!(may_chmod(&node, &alice()));
        assert!(!may_chmod(&node, &bob()));

        let alice_staff = alice().with_groups([50]);
        assert!(may_chown(&node, &alice_staff, None, Some(50)));
        assert!(!may_chown(&node, &alice_staff, None, Some(60)));
        assert!(!may_chown(&node, &alice_staff, Some(1001), None));
        assert!(may_chown(&node, &alice_staff, Some(1000), None));
        assert!(!may_chown(&node, &bob(), None, Some(1001)));
        assert!(may_chown(&node, &Identity::root(), Some(1001), Some(1001)));
    }
}
