//! The write-ahead log.
//!
//! An append-only file of serialized log entries. Appends are buffered in
//! memory and flushed + fsynced by an explicit `sync` barrier, so that any
//! number of appends accumulated between two barriers ride a single fsync
//! (group commit). Truncation of a conflicting suffix is durable before it
//! returns.
//!
//! ## Record format
//!
//! Every record is laid out as (all integers little-endian):
//!
//! ```text
//! u32 len | u64 term | u64 index | u8 cmd_tag | payload bytes | u32 crc32
//! ```
//!
//! `len` counts the bytes from `term` through the end of `payload`; the CRC
//! covers everything before it, the length prefix included. The payload is
//! the canonical JSON encoding of the entry payload.
//!
//! ## Recovery
//!
//! On open the file is replayed from the start. A record with `len == 0`, or
//! with fewer bytes present than it declares, or a CRC-invalid record sitting
//! at the very end of the file, is a torn write: it and everything after it
//! are discarded and the file is truncated back to the last intact record. A
//! CRC mismatch anywhere *before* the end of the file is real corruption and
//! is fatal.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use tiller::raft::Entry;
use tiller::raft::EntryPayload;
use tiller::LogId;

use crate::KvRequest;

/// The number of bytes of a record before the payload: len + term + index + tag.
const RECORD_PREFIX: usize = 4 + 8 + 8 + 1;
/// The number of trailing CRC bytes of a record.
const RECORD_CRC: usize = 4;

/// Errors surfaced by the write-ahead log.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wal codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// Mid-log corruption: a CRC-invalid or undecodable record with intact
    /// records (or any further bytes) behind it. Unlike a trailing torn
    /// write, this cannot be explained by a crash during append and the node
    /// must not continue from this log.
    #[error("wal corruption at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
}

/// The append-only durable log of state-machine mutations.
pub struct Wal {
    path: PathBuf,
    file: File,
    /// Encoded records appended since the last flush.
    buf: Vec<u8>,
    /// Byte offset of the record for entry index `i` at `offsets[i - 1]`.
    /// Indexes are dense and 1-based, so a plain vector suffices.
    offsets: Vec<u64>,
    /// Logical length of the log: file bytes plus buffered bytes.
    len: u64,
}

impl Wal {
    /// Open the log at `path`, creating it if absent, and replay it.
    ///
    /// Returns the recovered entries alongside the handle. A trailing torn
    /// write is truncated away before returning; mid-log corruption is an
    /// error.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<Entry<KvRequest>>), WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let (entries, offsets, valid_len) = Self::replay_bytes(&raw)?;

        if (valid_len as usize) < raw.len() {
            tracing::warn!(
                path = %path.display(),
                torn_bytes = raw.len() as u64 - valid_len,
                "discarding torn write at end of wal"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        let wal = Self {
            path,
            file,
            buf: Vec::new(),
            offsets,
            len: valid_len,
        };
        Ok((wal, entries))
    }

    /// The file path of this log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The index of the last record in the log, 0 if empty.
    pub fn last_index(&self) -> u64 {
        self.offsets.len() as u64
    }

    /// Buffer an entry for appending, returning the byte offset its record
    /// will occupy. Nothing is durable until [`Wal::sync`] (or a flush plus
    /// fsync driven by the owner) has completed.
    pub fn append(&mut self, entry: &Entry<KvRequest>) -> Result<u64, WalError> {
        debug_assert_eq!(
            entry.log_id.index,
            self.offsets.len() as u64 + 1,
            "wal appends must be dense"
        );
        let rec = Self::encode_record(entry)?;
        let offset = self.len;
        self.offsets.push(offset);
        self.len += rec.len() as u64;
        self.buf.extend_from_slice(&rec);
        Ok(offset)
    }

    /// Write all buffered records through to the file (no fsync).
    pub fn flush(&mut self) -> Result<(), WalError> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Flush buffered records and fsync the file. Everything appended before
    /// this call is durable once it returns.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// A cloned handle to the underlying file, for handing the fsync itself
    /// to a blocking helper thread after a [`Wal::flush`].
    pub fn file_handle(&self) -> std::io::Result<File> {
        self.file.try_clone()
    }

    /// Remove the suffix of the log starting at `index` (inclusive). The
    /// truncation is fsynced before this returns.
    pub fn truncate_from(&mut self, index: u64) -> Result<(), WalError> {
        self.flush()?;
        if index == 0 || index > self.offsets.len() as u64 {
            return Ok(());
        }
        let off = self.offsets[(index - 1) as usize];
        self.file.set_len(off)?;
        self.file.sync_all()?;
        self.file.seek(SeekFrom::Start(off))?;
        self.offsets.truncate((index - 1) as usize);
        self.len = off;
        Ok(())
    }

    /// A lazy iterator over the records starting at `index`.
    ///
    /// Buffered appends are flushed first so the iterator observes them. The
    /// iteration is finite (it covers the records present at call time) and
    /// restartable: each call opens its own read handle.
    pub fn iter_from(&mut self, index: u64) -> Result<WalIter, WalError> {
        self.flush()?;
        let start = index.max(1);
        let remaining = (self.offsets.len() as u64).saturating_sub(start - 1);
        let mut reader = BufReader::new(File::open(&self.path)?);
        let offset = if start as usize - 1 < self.offsets.len() {
            self.offsets[start as usize - 1]
        } else {
            self.len
        };
        reader.seek(SeekFrom::Start(offset))?;
        Ok(WalIter {
            reader,
            offset,
            remaining,
        })
    }

    fn encode_record(entry: &Entry<KvRequest>) -> Result<Vec<u8>, WalError> {
        let payload = serde_json::to_vec(&entry.payload)?;
        let body_len = (8 + 8 + 1 + payload.len()) as u32;
        let mut rec = Vec::with_capacity(RECORD_PREFIX + payload.len() + RECORD_CRC);
        rec.extend_from_slice(&body_len.to_le_bytes());
        rec.extend_from_slice(&entry.log_id.term.to_le_bytes());
        rec.extend_from_slice(&entry.log_id.index.to_le_bytes());
        rec.push(payload_tag(&entry.payload));
        rec.extend_from_slice(&payload);
        let crc = crc32fast::hash(&rec);
        rec.extend_from_slice(&crc.to_le_bytes());
        Ok(rec)
    }

    /// Parse the raw file contents, returning the decoded entries, their byte
    /// offsets, and the length of the valid prefix.
    fn replay_bytes(raw: &[u8]) -> Result<(Vec<Entry<KvRequest>>, Vec<u64>, u64), WalError> {
        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut pos: usize = 0;

        while pos < raw.len() {
            let rest = &raw[pos..];

            // Anything short of a whole record is a torn write, as is an
            // explicit zero length.
            if rest.len() < 4 {
                break;
            }
            let body_len = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
            if body_len == 0 {
                break;
            }
            let total = 4 + body_len + RECORD_CRC;
            if rest.len() < total {
                break;
            }

            let crc_stored = u32::from_le_bytes(rest[4 + body_len..total].try_into().unwrap());
            let crc_actual = crc32fast::hash(&rest[..4 + body_len]);
            let is_last_record = pos + total >= raw.len();
            if crc_stored != crc_actual {
                if is_last_record {
                    // A trailing torn write: the crash hit mid-record.
                    break;
                }
                return Err(WalError::Corrupt {
                    offset: pos as u64,
                    reason: "crc mismatch with records following".to_string(),
                });
            }

            let entry = match Self::decode_body(&rest[4..4 + body_len]) {
                Ok(entry) => entry,
                Err(reason) => {
                    return Err(WalError::Corrupt {
                        offset: pos as u64,
                        reason,
                    })
                }
            };
            if entry.log_id.index != entries.len() as u64 + 1 {
                return Err(WalError::Corrupt {
                    offset: pos as u64,
                    reason: format!(
                        "non-dense index: expected {}, found {}",
                        entries.len() as u64 + 1,
                        entry.log_id.index
                    ),
                });
            }

            offsets.push(pos as u64);
            entries.push(entry);
            pos += total;
        }

        Ok((entries, offsets, pos as u64))
    }

    fn decode_body(body: &[u8]) -> Result<Entry<KvRequest>, String> {
        if body.len() < 17 {
            return Err("record body shorter than its fixed fields".to_string());
        }
        let term = u64::from_le_bytes(body[..8].try_into().unwrap());
        let index = u64::from_le_bytes(body[8..16].try_into().unwrap());
        let tag = body[16];
        let payload: EntryPayload<KvRequest> =
            serde_json::from_slice(&body[17..]).map_err(|err| format!("undecodable payload: {}", err))?;
        if payload_tag(&payload) != tag {
            return Err(format!("command tag {} does not match payload", tag));
        }
        Ok(Entry {
            log_id: LogId { term, index },
            payload,
        })
    }
}

/// The on-disk command tag of an entry payload.
fn payload_tag(payload: &EntryPayload<KvRequest>) -> u8 {
    match payload {
        EntryPayload::Blank => 0,
        EntryPayload::Normal(normal) => normal.data.command.tag(),
    }
}

/// A lazy iterator over WAL records. See [`Wal::iter_from`].
pub struct WalIter {
    reader: BufReader<File>,
    offset: u64,
    remaining: u64,
}

impl Iterator for WalIter {
    type Item = Result<Entry<KvRequest>, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.read_one())
    }
}

impl WalIter {
    fn read_one(&mut self) -> Result<Entry<KvRequest>, WalError> {
        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf)?;
        let body_len = u32::from_le_bytes(len_buf) as usize;
        let mut rest = vec![0u8; body_len + RECORD_CRC];
        self.reader.read_exact(&mut rest)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_buf);
        hasher.update(&rest[..body_len]);
        let crc_stored = u32::from_le_bytes(rest[body_len..].try_into().unwrap());
        if hasher.finalize() != crc_stored {
            return Err(WalError::Corrupt {
                offset: self.offset,
                reason: "crc mismatch".to_string(),
            });
        }
        let entry = Wal::decode_body(&rest[..body_len]).map_err(|reason| WalError::Corrupt {
            offset: self.offset,
            reason,
        })?;
        self.offset += (4 + body_len + RECORD_CRC) as u64;
        Ok(entry)
    }
}
