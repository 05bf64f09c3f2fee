//! Persistent tablet metadata (the superblock).
//!
//! The superblock rotates between two block files, A and B: every flush
//! writes the next sequence number to the block *not* holding the current
//! record, syncs it, and the higher sequence wins at load. A crash mid-flush
//! leaves the previous block intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::schema::Schema;
use strata_util::{Error, Result};

const TABLET_META_DIR: &str = "tablet-meta";

/// Progress of a tablet copy from another peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletBootstrapState {
    Preparing,
    RemoteBootstrapInProgress,
    RemoteBootstrapDone,
}

/// Fixed pointers locating a tablet's superblock blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletMasterBlock {
    pub tablet_id: String,
    pub block_a: String,
    pub block_b: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TabletSuperBlock {
    sequence: u64,
    tablet_id: String,
    table_name: String,
    schema: Schema,
    schema_version: u32,
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    bootstrap_state: TabletBootstrapState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockRole {
    A,
    B,
}

impl BlockRole {
    fn other(self) -> BlockRole {
        match self {
            BlockRole::A => BlockRole::B,
            BlockRole::B => BlockRole::A,
        }
    }
}

/// Handle over a tablet's persisted metadata.
#[derive(Debug)]
pub struct TabletMetadata {
    root: PathBuf,
    master_block: TabletMasterBlock,
    super_block: TabletSuperBlock,
    /// Which block file holds the current (highest-sequence) record.
    active_block: BlockRole,
}

impl TabletMetadata {
    /// Persist metadata for a brand-new tablet.
    pub fn create_new(
        root: impl AsRef<Path>,
        master_block: TabletMasterBlock,
        table_name: impl Into<String>,
        schema: Schema,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        bootstrap_state: TabletBootstrapState,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let block_a = block_path(&root, &master_block.block_a);
        let block_b = block_path(&root, &master_block.block_b);
        if block_a.exists() || block_b.exists() {
            return Err(Error::AlreadyPresent(format!(
                "tablet metadata already exists for tablet {}",
                master_block.tablet_id
            )));
        }

        let mut meta = Self {
            root,
            super_block: TabletSuperBlock {
                sequence: 0,
                tablet_id: master_block.tablet_id.clone(),
                table_name: table_name.into(),
                schema,
                schema_version: 0,
                start_key,
                end_key,
                bootstrap_state,
            },
            master_block,
            // First flush lands in block A.
            active_block: BlockRole::B,
        };
        meta.flush()?;
        Ok(meta)
    }

    /// Load metadata, picking the valid block with the highest sequence.
    pub fn load(root: impl AsRef<Path>, master_block: TabletMasterBlock) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let a = read_block(&block_path(&root, &master_block.block_a));
        let b = read_block(&block_path(&root, &master_block.block_b));

        let (super_block, active_block) = match (a, b) {
            (Some(a), Some(b)) => {
                if a.sequence >= b.sequence {
                    (a, BlockRole::A)
                } else {
                    (b, BlockRole::B)
                }
            }
            (Some(a), None) => (a, BlockRole::A),
            (None, Some(b)) => (b, BlockRole::B),
            (None, None) => {
                return Err(Error::NotFound(format!(
                    "no tablet metadata for tablet {}",
                    master_block.tablet_id
                )))
            }
        };
        if super_block.tablet_id != master_block.tablet_id {
            return Err(Error::Corruption(format!(
                "tablet metadata id mismatch: expected {}, found {}",
                master_block.tablet_id, super_block.tablet_id
            )));
        }
        Ok(Self {
            root,
            master_block,
            super_block,
            active_block,
        })
    }

    pub fn tablet_id(&self) -> &str {
        &self.super_block.tablet_id
    }

    pub fn table_name(&self) -> &str {
        &self.super_block.table_name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schema(&self) -> &Schema {
        &self.super_block.schema
    }

    pub fn schema_version(&self) -> u32 {
        self.super_block.schema_version
    }

    pub fn set_schema(&mut self, schema: Schema, version: u32) {
        self.super_block.schema = schema;
        self.super_block.schema_version = version;
    }

    pub fn bootstrap_state(&self) -> TabletBootstrapState {
        self.super_block.bootstrap_state
    }

    pub fn set_bootstrap_state(&mut self, state: TabletBootstrapState) {
        self.super_block.bootstrap_state = state;
    }

    pub fn start_key(&self) -> &[u8] {
        &self.super_block.start_key
    }

    pub fn end_key(&self) -> &[u8] {
        &self.super_block.end_key
    }

    /// Write the superblock to the inactive block and swap roles.
    pub fn flush(&mut self) -> Result<()> {
        let target = self.active_block.other();
        let block_id = match target {
            BlockRole::A => &self.master_block.block_a,
            BlockRole::B => &self.master_block.block_b,
        };
        let path = block_path(&self.root, block_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        self.super_block.sequence += 1;
        let data = serde_json::to_vec_pretty(&self.super_block)?;
        let tmp_path = path.with_extension("tmp");
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&data)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        self.active_block = target;
        tracing::debug!(
            tablet_id = %self.super_block.tablet_id,
            sequence = self.super_block.sequence,
            block = %block_id,
            "flushed tablet superblock"
        );
        Ok(())
    }
}

fn block_path(root: &Path, block_id: &str) -> PathBuf {
    root.join(TABLET_META_DIR).join(block_id)
}

fn read_block(path: &Path) -> Option<TabletSuperBlock> {
    let data = fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(block) => Some(block),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "skipping unreadable superblock");
            None
        }
    }
}
