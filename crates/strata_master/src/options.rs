//! Static master configuration.
//!
//! The quorum is configured administratively until leader election lands:
//! every master is told the full peer set and which one of them leads.

use std::time::Duration;

use strata_util::net::HostPort;
use strata_util::{Error, Result};

const DEFAULT_RESOLVE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// Every master in the cluster, including this one.
    pub master_addresses: Vec<HostPort>,
    /// The other masters acting as followers (derived complement of self
    /// and the designated leader).
    pub follower_addresses: Vec<HostPort>,
    /// The designated leader, used by non-leader masters.
    pub leader_address: Option<HostPort>,
    /// True iff this process is the configured leader.
    pub leader: bool,
    /// Address this process serves RPCs on.
    pub rpc_bind_addr: HostPort,
    /// Backoff between peer-uuid resolution attempts at startup.
    pub resolve_retry_interval: Duration,
    /// Give up on startup resolution after this long; None waits forever.
    pub resolve_timeout: Option<Duration>,
}

impl MasterOptions {
    /// Single-master deployment: no replication traffic at all.
    pub fn single_node(rpc_bind_addr: HostPort) -> Self {
        Self {
            master_addresses: vec![rpc_bind_addr.clone()],
            follower_addresses: Vec::new(),
            leader_address: None,
            leader: true,
            rpc_bind_addr,
            resolve_retry_interval: DEFAULT_RESOLVE_RETRY_INTERVAL,
            resolve_timeout: None,
        }
    }

    /// Multi-master deployment. `follower_addresses` is derived for this
    /// process: every master except itself and except the leader.
    pub fn distributed(
        master_addresses: Vec<HostPort>,
        rpc_bind_addr: HostPort,
        leader_address: HostPort,
    ) -> Result<Self> {
        if !master_addresses.contains(&rpc_bind_addr) {
            return Err(Error::Config(format!(
                "local address {rpc_bind_addr} is not in the master list"
            )));
        }
        if !master_addresses.contains(&leader_address) {
            return Err(Error::Config(format!(
                "leader address {leader_address} is not in the master list"
            )));
        }
        let leader = rpc_bind_addr == leader_address;
        let follower_addresses = master_addresses
            .iter()
            .filter(|addr| **addr != rpc_bind_addr && **addr != leader_address)
            .cloned()
            .collect();
        Ok(Self {
            master_addresses,
            follower_addresses,
            leader_address: Some(leader_address),
            leader,
            rpc_bind_addr,
            resolve_retry_interval: DEFAULT_RESOLVE_RETRY_INTERVAL,
            resolve_timeout: None,
        })
    }

    pub fn is_distributed(&self) -> bool {
        self.master_addresses.len() > 1
    }
}
