//! Transport seam between the consensus engine and the RPC stack.
//!
//! The engine only needs two blocking point-to-point calls: an identity
//! lookup used while building a quorum, and replicate delivery to a peer.
//! Concrete implementations live outside this crate (real RPC in the server,
//! an in-process loopback in tests).

use std::time::{Duration, Instant};

use crate::ops::ReplicateMsg;
use crate::quorum::QuorumPeer;
use strata_util::net::HostPort;
use strata_util::{Error, Result};

pub trait Transport: Send + Sync + 'static {
    /// Ask the process listening at `addr` for its permanent uuid.
    fn resolve_peer_uuid(&self, addr: &HostPort) -> Result<String>;

    /// Deliver a replicate to a peer. Returns once the peer has durably
    /// accepted the operation.
    fn replicate(&self, peer_uuid: &str, tablet_id: &str, msg: &ReplicateMsg) -> Result<()>;
}

/// Transport for single-node quorums; every remote call is a logic error.
pub struct NoRemotePeers;

impl Transport for NoRemotePeers {
    fn resolve_peer_uuid(&self, addr: &HostPort) -> Result<String> {
        Err(Error::IllegalState(format!(
            "no remote peers configured, cannot resolve {addr}"
        )))
    }

    fn replicate(&self, peer_uuid: &str, _tablet_id: &str, _msg: &ReplicateMsg) -> Result<()> {
        Err(Error::IllegalState(format!(
            "no remote peers configured, cannot replicate to {peer_uuid}"
        )))
    }
}

/// Fill in a peer's `permanent_uuid` by asking the peer itself, retrying
/// until it answers or `timeout` elapses.
///
/// Startup blocks here on purpose: the static configuration is
/// administrative, and coming up with an unresolved quorum would be worse
/// than not coming up at all.
pub fn resolve_peer_uuid_with_retries(
    transport: &dyn Transport,
    peer: &mut QuorumPeer,
    retry_interval: Duration,
    timeout: Option<Duration>,
) -> Result<()> {
    if peer.permanent_uuid.is_some() {
        return Ok(());
    }
    let addr = peer.last_known_addr.clone().ok_or_else(|| {
        Error::InvalidArgument("cannot resolve a peer with no address".to_string())
    })?;

    let started = Instant::now();
    let mut attempts = 0u64;
    loop {
        match transport.resolve_peer_uuid(&addr) {
            Ok(uuid) => {
                tracing::info!(peer = %addr, uuid = %uuid, "resolved peer uuid");
                peer.permanent_uuid = Some(uuid);
                return Ok(());
            }
            Err(err) => {
                attempts += 1;
                if let Some(timeout) = timeout {
                    if started.elapsed() >= timeout {
                        return Err(Error::Config(format!(
                            "unable to resolve uuid for peer {addr} after {attempts} attempts: {err}"
                        )));
                    }
                }
                if attempts % 10 == 1 {
                    tracing::warn!(
                        peer = %addr,
                        attempts,
                        error = %err,
                        "peer uuid not resolvable yet, retrying"
                    );
                }
                std::thread::sleep(retry_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::Role;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FlakyResolver {
        failures_left: AtomicU64,
    }

    impl Transport for FlakyResolver {
        fn resolve_peer_uuid(&self, _addr: &HostPort) -> Result<String> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(Error::ServiceUnavailable("not up yet".to_string()));
            }
            Ok("peer-uuid".to_string())
        }

        fn replicate(
            &self,
            _peer_uuid: &str,
            _tablet_id: &str,
            _msg: &ReplicateMsg,
        ) -> Result<()> {
            unreachable!()
        }
    }

    #[test]
    fn resolution_retries_until_the_peer_answers() {
        let transport = FlakyResolver {
            failures_left: AtomicU64::new(3),
        };
        let mut peer = QuorumPeer {
            permanent_uuid: None,
            last_known_addr: Some(HostPort::new("127.0.0.1", 7051)),
            role: Role::Follower,
        };
        resolve_peer_uuid_with_retries(
            &transport,
            &mut peer,
            Duration::from_millis(1),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(peer.permanent_uuid.as_deref(), Some("peer-uuid"));
    }

    #[test]
    fn resolution_times_out_as_config_error() {
        let transport = NoRemotePeers;
        let mut peer = QuorumPeer {
            permanent_uuid: None,
            last_known_addr: Some(HostPort::new("127.0.0.1", 7051)),
            role: Role::Follower,
        };
        let err = resolve_peer_uuid_with_retries(
            &transport,
            &mut peer,
            Duration::from_millis(1),
            Some(Duration::from_millis(10)),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn preset_uuid_short_circuits() {
        let mut peer = QuorumPeer {
            permanent_uuid: Some("known".to_string()),
            last_known_addr: None,
            role: Role::Follower,
        };
        resolve_peer_uuid_with_retries(&NoRemotePeers, &mut peer, Duration::ZERO, None).unwrap();
        assert_eq!(peer.permanent_uuid.as_deref(), Some("known"));
    }
}
