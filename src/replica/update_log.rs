//! Update log
//!
//! Ordered, sequence-numbered log of the updates a Writer or Active replica has
//! applied. Followers replay the leader's log from a known offset; entries keep
//! the leader's sequence numbers so offsets stay comparable.
//!
//! Memory holds a bounded window of entries: once a retention limit is set,
//! committed entries beyond it are dropped from the front and followers asking
//! for an older offset fall back to a bulk resync. The file keeps the full
//! history, since a reopened core rebuilds its engine from it.
//!
//! On-disk entry format: [MAGIC][SEQUENCE][OP][LEN][PAYLOAD][CRC32]

use crate::common::{crc32, Error, Result};
use crate::replica::engine::{Document, UpdateOp};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const LOG_MAGIC: [u8; 4] = [0x55, 0x4C, 0x47, 0x31]; // "ULG1"
const OP_ADD: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_COMMIT: u8 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    Update(UpdateOp),
    Commit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub op: LogOp,
}

/// Update log, optionally mirrored to a file.
pub struct UpdateLog {
    entries: Vec<LogEntry>,
    /// First sequence still held in memory
    base: u64,
    next_sequence: u64,
    /// First sequence after the last commit entry
    committed: u64,
    retention: Option<usize>,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl UpdateLog {
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            base: 0,
            next_sequence: 0,
            committed: 0,
            retention: None,
            path: None,
            writer: None,
        }
    }

    /// Open or create a file-backed log, replaying what is already there.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = Vec::new();
        Self::replay(&path, |entry| {
            entries.push(entry);
            Ok(())
        })?;
        let base = entries.first().map(|e| e.sequence).unwrap_or(0);
        let next_sequence = entries.last().map(|e| e.sequence + 1).unwrap_or(0);
        let committed = entries
            .iter()
            .rev()
            .find(|e| e.op == LogOp::Commit)
            .map(|e| e.sequence + 1)
            .unwrap_or(base);

        // Rewrite the valid prefix so a torn tail never precedes new entries.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        for entry in &entries {
            Self::write_entry(&mut writer, entry)?;
        }
        writer.flush()?;

        Ok(Self {
            entries,
            base,
            next_sequence,
            committed,
            retention: None,
            path: Some(path),
            writer: Some(writer),
        })
    }

    /// Keep at most `limit` committed entries in memory. Uncommitted entries
    /// are never dropped.
    pub fn set_retention(&mut self, limit: usize) {
        self.retention = Some(limit.max(1));
        self.trim();
    }

    /// Sequence the next entry will get.
    pub fn head(&self) -> u64 {
        self.next_sequence
    }

    /// First sequence still held.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a local operation. Returns its sequence number.
    pub fn append(&mut self, op: LogOp) -> Result<u64> {
        let sequence = self.next_sequence;
        self.push(LogEntry { sequence, op })?;
        Ok(sequence)
    }

    /// Append an entry replicated from the leader, keeping its sequence.
    pub fn append_replicated(&mut self, entry: LogEntry) -> Result<()> {
        if entry.sequence != self.next_sequence {
            return Err(Error::UpdateLog(format!(
                "gap in replicated log: expected {}, got {}",
                self.next_sequence, entry.sequence
            )));
        }
        self.push(entry)
    }

    fn push(&mut self, entry: LogEntry) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            Self::write_entry(writer, &entry)?;
            writer.flush()?;
        }
        self.next_sequence = entry.sequence + 1;
        if entry.op == LogOp::Commit {
            self.committed = self.next_sequence;
        }
        self.entries.push(entry);
        self.trim();
        Ok(())
    }

    fn trim(&mut self) {
        let Some(limit) = self.retention else {
            return;
        };
        let excess = self.entries.len().saturating_sub(limit);
        let droppable = self.committed.saturating_sub(self.base) as usize;
        let count = excess.min(droppable);
        if count > 0 {
            self.entries.drain(..count);
            self.base += count as u64;
        }
    }

    /// Remove the backing file and keep going in memory only. Used when the
    /// core is deleted, so a later core with the same name starts empty.
    pub fn discard(&mut self) -> Result<()> {
        self.writer = None;
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Entries with `sequence >= offset`, or `None` if the log no longer holds
    /// (or never held) that offset.
    pub fn entries_since(&self, offset: u64) -> Option<Vec<LogEntry>> {
        if offset < self.base || offset > self.next_sequence {
            return None;
        }
        let start = (offset - self.base) as usize;
        Some(self.entries[start..].to_vec())
    }

    /// Drop all entries and continue numbering from `head`, after a bulk resync.
    pub fn reset_to(&mut self, head: u64) -> Result<()> {
        self.entries.clear();
        self.base = head;
        self.next_sequence = head;
        self.committed = head;
        if let Some(path) = &self.path {
            if let Some(mut writer) = self.writer.take() {
                writer.flush()?;
            }
            let file = OpenOptions::new()
                .write(true)
                .truncate(true)
                .create(true)
                .open(path)?;
            self.writer = Some(BufWriter::new(file));
        }
        Ok(())
    }

    /// Sync to disk
    pub fn sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn encode_op(op: &LogOp) -> Result<(u8, Vec<u8>)> {
        Ok(match op {
            LogOp::Update(UpdateOp::Add(doc)) => (OP_ADD, serde_json::to_vec(doc)?),
            LogOp::Update(UpdateOp::Delete { id }) => (OP_DELETE, id.as_bytes().to_vec()),
            LogOp::Commit => (OP_COMMIT, Vec::new()),
        })
    }

    fn write_entry<W: Write>(writer: &mut W, entry: &LogEntry) -> Result<()> {
        let (op, payload) = Self::encode_op(&entry.op)?;

        let mut body = Vec::with_capacity(13 + payload.len());
        body.extend_from_slice(&entry.sequence.to_le_bytes());
        body.push(op);
        body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        body.extend_from_slice(&payload);

        writer.write_all(&LOG_MAGIC)?;
        writer.write_all(&body)?;
        writer.write_all(&crc32(&body).to_le_bytes())?;
        Ok(())
    }

    /// Replay a log file entry by entry. Stops quietly at a torn or corrupted tail.
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<()>
    where
        F: FnMut(LogEntry) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some(entry)) => callback(entry)?,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Update log replay stopped at corrupted entry: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<LogEntry>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if magic != LOG_MAGIC {
            return Err(Error::UpdateLog("invalid magic".into()));
        }

        let mut header = [0u8; 13];
        reader.read_exact(&mut header)?;
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&header[..8]);
        let sequence = u64::from_le_bytes(seq_bytes);
        let op = header[8];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[9..13]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let mut body = header.to_vec();
        body.extend_from_slice(&payload);
        if crc32(&body) != u32::from_le_bytes(checksum_bytes) {
            return Err(Error::UpdateLog("checksum mismatch".into()));
        }

        let op = match op {
            OP_ADD => {
                let doc: Document = serde_json::from_slice(&payload)?;
                LogOp::Update(UpdateOp::Add(doc))
            }
            OP_DELETE => {
                let id = String::from_utf8(payload)
                    .map_err(|_| Error::UpdateLog("invalid UTF-8 in id".into()))?;
                LogOp::Update(UpdateOp::Delete { id })
            }
            OP_COMMIT => LogOp::Commit,
            other => return Err(Error::UpdateLog(format!("unknown op code: {}", other))),
        };

        Ok(Some(LogEntry { sequence, op }))
    }
}
