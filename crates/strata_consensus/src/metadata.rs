//! Durable per-tablet consensus metadata.
//!
//! A small record `{ tablet_id, current_term, committed_quorum,
//! pending_quorum? }` persisted under `<root>/consensus-meta/<tablet_id>`.
//! Writes go to a temp file and rename into place so a crash never leaves a
//! torn record. Callers mutate an in-memory copy and commit with `flush`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::quorum::Quorum;
use strata_util::{Error, Result};

const CONSENSUS_META_DIR: &str = "consensus-meta";

/// Lowest valid term for a fresh tablet.
pub const MINIMUM_TERM: u64 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsensusMetadataRecord {
    tablet_id: String,
    current_term: u64,
    committed_quorum: Quorum,
    pending_quorum: Option<Quorum>,
}

/// Handle over the persisted consensus record of one tablet.
#[derive(Debug)]
pub struct ConsensusMetadata {
    path: PathBuf,
    record: ConsensusMetadataRecord,
    /// Seqno of the last quorum persisted to disk, used to enforce that
    /// configuration versions only move forward.
    flushed_seqno: Option<i64>,
}

impl ConsensusMetadata {
    /// Persist a fresh record. Fails if one already exists for the tablet.
    pub fn create(
        root: impl AsRef<Path>,
        tablet_id: &str,
        committed_quorum: Quorum,
        current_term: u64,
    ) -> Result<Self> {
        let path = meta_path(root.as_ref(), tablet_id);
        if path.exists() {
            return Err(Error::AlreadyPresent(format!(
                "consensus metadata already exists for tablet {tablet_id}"
            )));
        }
        let mut meta = Self {
            path,
            record: ConsensusMetadataRecord {
                tablet_id: tablet_id.to_string(),
                current_term,
                committed_quorum,
                pending_quorum: None,
            },
            flushed_seqno: None,
        };
        meta.flush()?;
        Ok(meta)
    }

    pub fn load(root: impl AsRef<Path>, tablet_id: &str) -> Result<Self> {
        let path = meta_path(root.as_ref(), tablet_id);
        let data = fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!(
                    "no consensus metadata for tablet {tablet_id}"
                ))
            } else {
                Error::Io(err)
            }
        })?;
        let record: ConsensusMetadataRecord = serde_json::from_slice(&data)
            .map_err(|err| {
                Error::Corruption(format!(
                    "consensus metadata for tablet {tablet_id} is unreadable: {err}"
                ))
            })?;
        if record.tablet_id != tablet_id {
            return Err(Error::Corruption(format!(
                "consensus metadata tablet id mismatch: expected {tablet_id}, found {}",
                record.tablet_id
            )));
        }
        let flushed_seqno = Some(record.committed_quorum.seqno);
        Ok(Self {
            path,
            record,
            flushed_seqno,
        })
    }

    pub fn tablet_id(&self) -> &str {
        &self.record.tablet_id
    }

    pub fn current_term(&self) -> u64 {
        self.record.current_term
    }

    pub fn set_current_term(&mut self, term: u64) {
        self.record.current_term = term;
    }

    pub fn committed_quorum(&self) -> &Quorum {
        &self.record.committed_quorum
    }

    pub fn set_committed_quorum(&mut self, quorum: Quorum) {
        self.record.committed_quorum = quorum;
    }

    pub fn pending_quorum(&self) -> Option<&Quorum> {
        self.record.pending_quorum.as_ref()
    }

    pub fn set_pending_quorum(&mut self, quorum: Option<Quorum>) {
        self.record.pending_quorum = quorum;
    }

    /// Atomically persist the in-memory record.
    ///
    /// Refuses to persist a committed quorum whose seqno does not exceed the
    /// previously persisted one; configuration versions move forward only.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(flushed) = self.flushed_seqno {
            if self.record.committed_quorum.seqno < flushed {
                return Err(Error::IllegalState(format!(
                    "refusing to persist quorum seqno {} below already persisted {}",
                    self.record.committed_quorum.seqno, flushed
                )));
            }
        }

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_vec_pretty(&self.record)?;
        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&data)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        self.flushed_seqno = Some(self.record.committed_quorum.seqno);
        tracing::debug!(
            tablet_id = %self.record.tablet_id,
            term = self.record.current_term,
            seqno = self.record.committed_quorum.seqno,
            "flushed consensus metadata"
        );
        Ok(())
    }
}

fn meta_path(root: &Path, tablet_id: &str) -> PathBuf {
    root.join(CONSENSUS_META_DIR).join(tablet_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::{Quorum, QuorumPeer, Role};
    use strata_util::net::HostPort;

    fn quorum(seqno: i64) -> Quorum {
        Quorum {
            seqno,
            local: false,
            peers: vec![QuorumPeer {
                permanent_uuid: Some("a".to_string()),
                last_known_addr: Some(HostPort::new("127.0.0.1", 7051)),
                role: Role::Leader,
            }],
        }
    }

    #[test]
    fn create_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let meta =
            ConsensusMetadata::create(dir.path(), "tablet-1", quorum(0), MINIMUM_TERM).unwrap();
        assert_eq!(meta.current_term(), 0);

        let loaded = ConsensusMetadata::load(dir.path(), "tablet-1").unwrap();
        assert_eq!(loaded.tablet_id(), "tablet-1");
        assert_eq!(loaded.committed_quorum(), &quorum(0));
        assert!(loaded.pending_quorum().is_none());
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        ConsensusMetadata::create(dir.path(), "t", quorum(0), 0).unwrap();
        let err = ConsensusMetadata::create(dir.path(), "t", quorum(1), 0).unwrap_err();
        assert!(err.is_already_present());
    }

    #[test]
    fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConsensusMetadata::load(dir.path(), "nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn seqno_must_not_regress_across_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = ConsensusMetadata::create(dir.path(), "t", quorum(3), 1).unwrap();

        meta.set_committed_quorum(quorum(2));
        assert!(meta.flush().is_err());

        meta.set_committed_quorum(quorum(4));
        meta.flush().unwrap();
        let loaded = ConsensusMetadata::load(dir.path(), "t").unwrap();
        assert_eq!(loaded.committed_quorum().seqno, 4);
    }

    #[test]
    fn term_survives_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = ConsensusMetadata::create(dir.path(), "t", quorum(0), 0).unwrap();
        meta.set_current_term(7);
        meta.set_committed_quorum(quorum(1));
        meta.flush().unwrap();
        let loaded = ConsensusMetadata::load(dir.path(), "t").unwrap();
        assert_eq!(loaded.current_term(), 7);
    }
}
