//! Cluster membership configuration
//!
//! Membership only changes by committing a `ConfChange` entry through the log,
//! one member at a time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Whether a member takes part in elections and quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Votes and counts toward quorum
    Voter,
    /// Receives the log but never votes
    Learner,
}

/// Identity and address of a consensus peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: u64,
    /// Address other peers use to reach this node
    pub addr: String,
}

impl PeerInfo {
    pub fn new(id: u64, addr: impl Into<String>) -> Self {
        Self { id, addr: addr.into() }
    }
}

/// A single membership transition carried by a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChange {
    AddNode { info: PeerInfo, role: PeerRole },
    Promote { id: u64 },
    RemoveNode { id: u64 },
}

/// A member of the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub info: PeerInfo,
    pub role: PeerRole,
}

/// The set of peers participating in consensus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    members: BTreeMap<u64, Member>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-voter configuration used to bootstrap a fresh cluster
    pub fn single(info: PeerInfo) -> Self {
        let mut membership = Self::new();
        membership.members.insert(info.id, Member { info, role: PeerRole::Voter });
        membership
    }

    pub fn contains(&self, id: u64) -> bool {
        self.members.contains_key(&id)
    }

    pub fn is_voter(&self, id: u64) -> bool {
        matches!(self.members.get(&id), Some(m) if m.role == PeerRole::Voter)
    }

    pub fn get(&self, id: u64) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn addr(&self, id: u64) -> Option<&str> {
        self.members.get(&id).map(|m| m.info.addr.as_str())
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.members.keys().copied().collect()
    }

    pub fn voters(&self) -> Vec<u64> {
        self.members
            .values()
            .filter(|m| m.role == PeerRole::Voter)
            .map(|m| m.info.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Strict majority of voting members
    pub fn quorum(&self) -> usize {
        self.voters().len() / 2 + 1
    }

    /// Check that `change` can be applied to this configuration
    pub fn validate(&self, change: &ConfChange) -> Result<(), String> {
        match change {
            ConfChange::AddNode { info, .. } => match self.members.get(&info.id) {
                Some(existing) if existing.info.addr != info.addr => Err(format!(
                    "node {} is already a member with address {}",
                    info.id, existing.info.addr
                )),
                Some(_) => Err(format!("node {} is already a member", info.id)),
                None => Ok(()),
            },
            ConfChange::Promote { id } => match self.members.get(id) {
                None => Err(format!("node {} is not a member", id)),
                Some(m) if m.role == PeerRole::Voter => Err(format!("node {} is already a voter", id)),
                Some(_) => Ok(()),
            },
            ConfChange::RemoveNode { id } => {
                if !self.contains(*id) {
                    return Err(format!("node {} is not a member", id));
                }
                if self.is_voter(*id) && self.voters().len() == 1 {
                    return Err(format!("cannot remove node {}: it is the last voter", id));
                }
                Ok(())
            }
        }
    }

    /// Apply a committed change. Invalid changes are ignored so every node
    /// ends up with the same configuration.
    pub fn apply(&mut self, change: &ConfChange) -> bool {
        if self.validate(change).is_err() {
            return false;
        }
        match change {
            ConfChange::AddNode { info, role } => {
                self.members.insert(info.id, Member { info: info.clone(), role: *role });
            }
            ConfChange::Promote { id } => {
                if let Some(member) = self.members.get_mut(id) {
                    member.role = PeerRole::Voter;
                }
            }
            ConfChange::RemoveNode { id } => {
                self.members.remove(id);
            }
        }
        true
    }
}
