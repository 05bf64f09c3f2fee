//! Quorum descriptors: the peer set of a replicated tablet, with roles.

use serde::{Deserialize, Serialize};
use strata_util::net::HostPort;
use strata_util::{Error, Result};

/// Role of a peer inside a quorum configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
    /// The designated leader as seen from a follower's static configuration,
    /// before the configuration is committed.
    Candidate,
    Learner,
    NonParticipant,
}

/// One peer in a quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPeer {
    /// Stable identity; resolved by RPC during quorum construction and
    /// always present once the quorum is committed.
    pub permanent_uuid: Option<String>,
    pub last_known_addr: Option<HostPort>,
    pub role: Role,
}

impl QuorumPeer {
    pub fn new(role: Role) -> Self {
        Self {
            permanent_uuid: None,
            last_known_addr: None,
            role,
        }
    }
}

/// The peer-set descriptor for a replicated tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorum {
    /// Monotonically increasing configuration version.
    pub seqno: i64,
    /// True for a single-node quorum with no replication traffic.
    pub local: bool,
    pub peers: Vec<QuorumPeer>,
}

impl Quorum {
    pub fn new(seqno: i64, local: bool) -> Self {
        Self {
            seqno,
            local,
            peers: Vec::new(),
        }
    }

    /// Single-node quorum with the given peer as leader.
    pub fn local_quorum(seqno: i64, uuid: impl Into<String>) -> Self {
        Self {
            seqno,
            local: true,
            peers: vec![QuorumPeer {
                permanent_uuid: Some(uuid.into()),
                last_known_addr: None,
                role: Role::Leader,
            }],
        }
    }

    /// Find the peer with the given uuid.
    pub fn peer_by_uuid(&self, uuid: &str) -> Option<&QuorumPeer> {
        self.peers
            .iter()
            .find(|p| p.permanent_uuid.as_deref() == Some(uuid))
    }

    /// Number of peers that must durably accept an operation before it is
    /// considered committed.
    pub fn majority_size(&self) -> usize {
        self.peers.len() / 2 + 1
    }
}

/// Enforce structural invariants on a resolved quorum.
///
/// Every peer must carry a unique permanent uuid; exactly one peer may claim
/// the leadership slot (Leader, or Candidate prior to commit); non-local
/// quorums need an address on every peer.
pub fn verify_quorum(quorum: &Quorum) -> Result<()> {
    if quorum.peers.is_empty() {
        return Err(Error::InvalidArgument(
            "quorum has no peers".to_string(),
        ));
    }
    if quorum.seqno < 0 {
        return Err(Error::InvalidArgument(format!(
            "quorum seqno must be non-negative, got {}",
            quorum.seqno
        )));
    }
    if quorum.local && quorum.peers.len() != 1 {
        return Err(Error::InvalidArgument(format!(
            "local quorum must have exactly one peer, got {}",
            quorum.peers.len()
        )));
    }

    let mut uuids = std::collections::HashSet::new();
    let mut leaders = 0usize;
    for peer in &quorum.peers {
        let Some(uuid) = peer.permanent_uuid.as_deref() else {
            return Err(Error::InvalidArgument(format!(
                "peer {:?} has no permanent uuid",
                peer.last_known_addr
            )));
        };
        if uuid.is_empty() {
            return Err(Error::InvalidArgument(
                "peer has an empty permanent uuid".to_string(),
            ));
        }
        if !uuids.insert(uuid.to_string()) {
            return Err(Error::InvalidArgument(format!(
                "duplicate peer uuid {uuid} in quorum"
            )));
        }
        if matches!(peer.role, Role::Leader | Role::Candidate) {
            leaders += 1;
        }
        if !quorum.local && peer.last_known_addr.is_none() {
            return Err(Error::InvalidArgument(format!(
                "peer {uuid} has no last known address"
            )));
        }
    }
    if leaders != 1 {
        return Err(Error::InvalidArgument(format!(
            "quorum must have exactly one leader, found {leaders}"
        )));
    }
    Ok(())
}
