//! Per-tablet write-ahead log.
//!
//! A single append-only file of framed records, `[len][crc32][payload]`,
//! owned by a dedicated appender thread. Appends are acknowledged only after
//! the batch has been written and synced, so a positive ack means durable.
//! GC rewrites the file dropping entries below the minimum live anchor.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::anchor::LogAnchorRegistry;
use crate::ops::{CommitMsg, OpId, ReplicateMsg};
use strata_util::{Error, Result};

const WAL_DIR: &str = "wals";
const WAL_LOG_FILE: &str = "wal.log";
const APPEND_BATCH_MAX: usize = 64;

/// One record in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogEntry {
    Replicate(ReplicateMsg),
    Commit(CommitMsg),
}

impl LogEntry {
    pub fn op_id(&self) -> OpId {
        match self {
            LogEntry::Replicate(msg) => msg.id,
            LogEntry::Commit(msg) => msg.committed_op_id,
        }
    }
}

struct AppendWork {
    entries: Vec<LogEntry>,
    tx: mpsc::Sender<Result<()>>,
}

struct GcWork {
    min_retain_index: u64,
    tx: mpsc::Sender<Result<usize>>,
}

enum LogCommand {
    Append(AppendWork),
    Gc(GcWork),
}

/// Append handle over one tablet's log.
#[derive(Debug)]
pub struct Log {
    path: PathBuf,
    tx: mpsc::Sender<LogCommand>,
    anchor_registry: Arc<LogAnchorRegistry>,
    last_appended: Mutex<Option<OpId>>,
}

impl Log {
    /// Open (creating if needed) the log for appending.
    ///
    /// `last_appended` carries the tail op id recovered by replay so callers
    /// can keep assigning increasing indexes after a restart.
    pub fn open(
        root: impl AsRef<Path>,
        tablet_id: &str,
        anchor_registry: Arc<LogAnchorRegistry>,
        last_appended: Option<OpId>,
    ) -> Result<Log> {
        let dir = log_dir(root.as_ref(), tablet_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(WAL_LOG_FILE);

        let (tx, rx) = mpsc::channel();
        let worker_path = path.clone();
        std::thread::Builder::new()
            .name("wal-append".to_string())
            .spawn(move || append_worker(&worker_path, rx))
            .map_err(|err| {
                Error::ServiceUnavailable(format!("could not spawn wal appender: {err}"))
            })?;

        Ok(Log {
            path,
            tx,
            anchor_registry,
            last_appended: Mutex::new(last_appended),
        })
    }

    /// Read every entry of a tablet's log, in order.
    ///
    /// A partial record at the tail is treated as a torn final write and
    /// ignored; a checksum mismatch anywhere is corruption.
    pub fn read_entries(root: impl AsRef<Path>, tablet_id: &str) -> Result<Vec<LogEntry>> {
        let path = log_dir(root.as_ref(), tablet_id).join(WAL_LOG_FILE);
        read_log_entries(&path)
    }

    pub fn append_replicate(&self, msg: ReplicateMsg) -> Result<()> {
        self.append(LogEntry::Replicate(msg))
    }

    pub fn append_commit(&self, msg: CommitMsg) -> Result<()> {
        self.append(LogEntry::Commit(msg))
    }

    /// Durably append one entry; returns once it has been synced.
    pub fn append(&self, entry: LogEntry) -> Result<()> {
        let op_id = entry.op_id();
        let (tx, rx) = mpsc::channel();
        self.tx
            .send(LogCommand::Append(AppendWork {
                entries: vec![entry],
                tx,
            }))
            .map_err(|_| Error::IllegalState("wal appender has exited".to_string()))?;
        rx.recv()
            .map_err(|_| Error::IllegalState("wal append response dropped".to_string()))??;

        let mut last = self.last_appended.lock().unwrap();
        if last.map_or(true, |prev| op_id > prev) {
            *last = Some(op_id);
        }
        Ok(())
    }

    pub fn last_appended(&self) -> Option<OpId> {
        *self.last_appended.lock().unwrap()
    }

    pub fn anchor_registry(&self) -> &Arc<LogAnchorRegistry> {
        &self.anchor_registry
    }

    /// Drop entries below the minimum live anchor. With no anchors the log
    /// is left untouched.
    pub fn gc(&self) -> Result<usize> {
        let Some(min_retain_index) = self.anchor_registry.min_anchored_index() else {
            return Ok(0);
        };
        let (tx, rx) = mpsc::channel();
        self.tx
            .send(LogCommand::Gc(GcWork {
                min_retain_index,
                tx,
            }))
            .map_err(|_| Error::IllegalState("wal appender has exited".to_string()))?;
        let removed = rx
            .recv()
            .map_err(|_| Error::IllegalState("wal gc response dropped".to_string()))??;
        if removed > 0 {
            tracing::info!(
                path = %self.path.display(),
                removed,
                min_retain_index,
                "garbage-collected log prefix"
            );
        }
        Ok(removed)
    }
}

fn log_dir(root: &Path, tablet_id: &str) -> PathBuf {
    root.join(WAL_DIR).join(tablet_id)
}

fn append_worker(path: &Path, rx: mpsc::Receiver<LogCommand>) {
    let mut file = match open_for_append(path) {
        Ok(file) => file,
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "open wal for append failed");
            return;
        }
    };

    while let Ok(first) = rx.recv() {
        let mut commands = Vec::with_capacity(APPEND_BATCH_MAX);
        commands.push(first);
        // Coalesce whatever is already queued to amortize the fsync.
        while commands.len() < APPEND_BATCH_MAX {
            match rx.try_recv() {
                Ok(cmd) => commands.push(cmd),
                Err(_) => break,
            }
        }

        let mut append_resps = Vec::new();
        let mut batch = Vec::new();
        let mut gc_req: Option<GcWork> = None;
        for cmd in commands {
            match cmd {
                LogCommand::Append(work) => {
                    batch.extend(work.entries);
                    append_resps.push(work.tx);
                }
                LogCommand::Gc(work) => gc_req = Some(work),
            }
        }

        if !append_resps.is_empty() {
            let result = write_batch(&mut file, &batch);
            let err_msg = result.err().map(|err| err.to_string());
            for tx in append_resps {
                let res = match &err_msg {
                    None => Ok(()),
                    Some(msg) => Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        msg.clone(),
                    ))),
                };
                let _ = tx.send(res);
            }
        }

        if let Some(work) = gc_req {
            let res = gc_log(path, work.min_retain_index);
            let _ = work.tx.send(res);
            match open_for_append(path) {
                Ok(new_file) => file = new_file,
                Err(err) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %err,
                        "reopen wal after gc failed"
                    );
                    return;
                }
            }
        }
    }
}

fn write_batch(file: &mut File, entries: &[LogEntry]) -> Result<()> {
    for entry in entries {
        let payload = serde_json::to_vec(entry)?;
        write_record(file, &payload)?;
    }
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

fn read_log_entries(path: &Path) -> Result<Vec<LogEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        let mut payload = vec![0u8; len];
        let torn = match reader
            .read_exact(&mut crc_buf)
            .and_then(|()| reader.read_exact(&mut payload))
        {
            Ok(()) => false,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => true,
            Err(err) => return Err(err.into()),
        };
        if torn {
            // A torn final record is the normal crash signature.
            tracing::warn!(path = %path.display(), "ignoring torn record at log tail");
            break;
        }

        let expected_crc = u32::from_be_bytes(crc_buf);
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            return Err(Error::Corruption(format!(
                "log checksum mismatch in {}",
                path.display()
            )));
        }
        let entry: LogEntry = serde_json::from_slice(&payload).map_err(|err| {
            Error::Corruption(format!(
                "undecodable log entry in {}: {err}",
                path.display()
            ))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

fn gc_log(path: &Path, min_retain_index: u64) -> Result<usize> {
    let entries = read_log_entries(path)?;
    if entries.is_empty() {
        return Ok(0);
    }

    let tmp_path = path.with_extension("log.tmp");
    let mut out = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp_path)?;

    let mut removed = 0usize;
    for entry in &entries {
        if entry.op_id().index < min_retain_index {
            removed += 1;
            continue;
        }
        let payload = serde_json::to_vec(entry)?;
        write_record(&mut out, &payload)?;
    }
    out.flush()?;
    out.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(removed)
}

fn open_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
