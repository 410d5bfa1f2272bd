use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use mqcluster_core::{ClockSource, EventCodecError, TransactionEvent};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::{
    unresolved, LoggedEvent, TxnLogError, FILE_MAGIC, FILE_VERSION, HEADER_LEN, RECORD_HEADER_LEN,
    RECORD_MAGIC,
};
use crate::config::TxnLogConfig;

const FILE_NAME: &str = "txn.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum FileStatus {
    Created = 0,
    CheckpointUpdated = 1,
}

impl FileStatus {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Created),
            1 => Some(Self::CheckpointUpdated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FileHeader {
    status: FileStatus,
    checkpoint_seq: u64,
}

impl FileHeader {
    fn encode(self) -> [u8; HEADER_LEN as usize] {
        let mut out = [0u8; HEADER_LEN as usize];
        let mut buf = &mut out[..];
        buf.put_u32(FILE_MAGIC);
        buf.put_u16(FILE_VERSION);
        buf.put_u16(self.status as u16);
        buf.put_u64(self.checkpoint_seq);
        out
    }

    fn decode(path: &Path, mut buf: &[u8]) -> Result<Self, TxnLogError> {
        let bad = |reason: String| TxnLogError::BadHeader {
            path: path.to_path_buf(),
            reason,
        };
        if buf.len() < HEADER_LEN as usize {
            return Err(bad(format!("{} bytes", buf.len())));
        }
        let magic = buf.get_u32();
        if magic != FILE_MAGIC {
            return Err(bad(format!("magic {magic:#010x}")));
        }
        let version = buf.get_u16();
        if version != FILE_VERSION {
            return Err(bad(format!("version {version}")));
        }
        let status = buf.get_u16();
        let status = FileStatus::from_u16(status).ok_or_else(|| bad(format!("status {status}")))?;
        Ok(Self {
            status,
            checkpoint_seq: buf.get_u64(),
        })
    }
}

pub(crate) fn encode_record(
    seq: u64,
    timestamp_ms: u64,
    body: &[u8],
) -> Result<Vec<u8>, TxnLogError> {
    let len = u32::try_from(body.len()).map_err(|_| TxnLogError::RecordTooLarge(body.len()))?;
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
    out.put_u32(RECORD_MAGIC);
    out.put_u64(seq);
    out.put_u64(timestamp_ms);
    out.put_u32(len);
    let crc = crc32c::crc32c_append(crc32c::crc32c(&out[4..24]), body);
    out.put_u32(crc);
    out.extend_from_slice(body);
    Ok(out)
}

enum Frame<'a> {
    Record {
        seq: u64,
        timestamp_ms: u64,
        body: &'a [u8],
    },
    Torn(&'static str),
}

fn read_frame(buf: &[u8]) -> Frame<'_> {
    if buf.len() < RECORD_HEADER_LEN {
        return Frame::Torn("partial record header");
    }
    let fields = &buf[4..24];
    let (mut head, rest) = buf.split_at(RECORD_HEADER_LEN);
    if head.get_u32() != RECORD_MAGIC {
        return Frame::Torn("bad record magic");
    }
    let seq = head.get_u64();
    let timestamp_ms = head.get_u64();
    let len = head.get_u32() as usize;
    let crc = head.get_u32();
    let Some(body) = rest.get(..len) else {
        return Frame::Torn("partial record body");
    };
    if crc32c::crc32c_append(crc32c::crc32c(fields), body) != crc {
        return Frame::Torn("checksum mismatch");
    }
    Frame::Record {
        seq,
        timestamp_ms,
        body,
    }
}

/// Offset of the first intact record at or after `from`.
fn next_intact(buf: &[u8], from: usize) -> Option<usize> {
    let magic = RECORD_MAGIC.to_be_bytes();
    (from..buf.len().saturating_sub(RECORD_HEADER_LEN - 1)).find(|&at| {
        buf[at..].starts_with(&magic) && matches!(read_frame(&buf[at..]), Frame::Record { .. })
    })
}

struct LogFile {
    file: File,
    /// End of the last valid record; appends start here.
    len: u64,
    checkpoint_seq: u64,
    next_seq: u64,
}

impl LogFile {
    fn write_header(&mut self, header: FileHeader, sync: bool) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        self.file.set_len(HEADER_LEN)?;
        if sync {
            self.file.sync_data()?;
        }
        self.len = HEADER_LEN;
        self.checkpoint_seq = header.checkpoint_seq;
        self.next_seq = header.checkpoint_seq + 1;
        Ok(())
    }
}

/// A transaction event log backed by one file in [`TxnLogConfig::dir`].
///
/// All operations take the same mutex, so appends from concurrent callers
/// get strictly increasing sequence numbers in file order.
pub struct TxnLog {
    path: PathBuf,
    sync: bool,
    clock: Arc<dyn ClockSource>,
    inner: Mutex<LogFile>,
}

impl TxnLog {
    /// Opens the log, creating it when absent, and positions appends after
    /// the last intact record.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, a foreign or damaged header, or an existing
    /// record this build cannot decode.
    pub fn open(config: &TxnLogConfig, clock: Arc<dyn ClockSource>) -> Result<Self, TxnLogError> {
        fs::create_dir_all(&config.dir)?;
        let path = config.dir.join(FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut head = Vec::with_capacity(HEADER_LEN as usize);
        (&mut file).take(HEADER_LEN).read_to_end(&mut head)?;
        let mut inner = LogFile {
            file,
            len: HEADER_LEN,
            checkpoint_seq: 0,
            next_seq: 1,
        };
        if head.is_empty() {
            inner.write_header(
                FileHeader {
                    status: FileStatus::Created,
                    checkpoint_seq: 0,
                },
                config.sync,
            )?;
            info!("Created transaction log {}", path.display());
        } else {
            let header = FileHeader::decode(&path, &head)?;
            inner.checkpoint_seq = header.checkpoint_seq;
            inner.next_seq = header.checkpoint_seq + 1;
        }

        let log = Self {
            path,
            sync: config.sync,
            clock,
            inner: Mutex::new(inner),
        };
        let events = log.replay()?;
        info!(
            "Opened transaction log {} with {} record(s) after checkpoint {}",
            log.path.display(),
            events.len(),
            log.checkpoint_seq()
        );
        Ok(log)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence of the last appended record, or the checkpoint when the
    /// log holds no records.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    #[must_use]
    pub fn checkpoint_seq(&self) -> u64 {
        self.inner.lock().checkpoint_seq
    }

    /// Appends one event and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Fails if the event cannot be encoded or the write fails. A failed
    /// write leaves the sequence unused; the next append overwrites it.
    pub fn append(&self, event: &TransactionEvent) -> Result<u64, TxnLogError> {
        let body = event.write_to_bytes()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let seq = inner.next_seq;
        let record = encode_record(seq, self.clock.now(), &body)?;

        inner.file.seek(SeekFrom::Start(inner.len))?;
        inner.file.write_all(&record)?;
        if self.sync {
            inner.file.sync_data()?;
        }
        inner.len += record.len() as u64;
        inner.next_seq += 1;
        Ok(seq)
    }

    /// Reads every record after the checkpoint, in order.
    ///
    /// A torn or damaged tail is cut off so the next append lands after the
    /// last intact record.
    ///
    /// # Errors
    ///
    /// Returns [`TxnLogError::Damaged`], leaving the file untouched, when a
    /// damaged or out-of-sequence record is followed by intact ones.
    /// Returns [`TxnLogError::Unsupported`] for an intact record whose event
    /// type is unknown, and [`TxnLogError::Corrupt`] for an intact record
    /// whose body does not decode.
    pub fn replay(&self) -> Result<Vec<LoggedEvent>, TxnLogError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut buf = Vec::new();
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.read_to_end(&mut buf)?;

        let mut events = Vec::new();
        let mut offset = HEADER_LEN as usize;
        let mut expected = inner.checkpoint_seq + 1;
        let torn = loop {
            let rest = buf.get(offset..).unwrap_or_default();
            if rest.is_empty() {
                break None;
            }
            let (seq, timestamp_ms, body) = match read_frame(rest) {
                Frame::Record {
                    seq,
                    timestamp_ms,
                    body,
                } => (seq, timestamp_ms, body),
                Frame::Torn(reason) => break Some(reason),
            };
            if seq != expected {
                return Err(TxnLogError::Damaged {
                    offset: offset as u64,
                    reason: "out of sequence",
                });
            }
            let event = TransactionEvent::read_from_bytes(body).map_err(|source| match source {
                EventCodecError::UnsupportedType(_)
                | EventCodecError::UnsupportedSubtype { .. } => {
                    TxnLogError::Unsupported { seq, source }
                }
                source => TxnLogError::Corrupt { seq, source },
            })?;
            events.push(LoggedEvent {
                seq,
                timestamp_ms,
                event,
            });
            offset += RECORD_HEADER_LEN + body.len();
            expected += 1;
        };

        if let Some(reason) = torn {
            if let Some(at) = next_intact(&buf, offset + 1) {
                error!(
                    "Transaction log {} is damaged at offset {offset} ({reason}); \
                     intact record follows at {at}",
                    self.path.display()
                );
                return Err(TxnLogError::Damaged {
                    offset: offset as u64,
                    reason,
                });
            }
            warn!(
                "Truncating transaction log {} at offset {offset} ({} bytes dropped): {reason}",
                self.path.display(),
                buf.len() - offset
            );
            inner.file.set_len(offset as u64)?;
            if self.sync {
                inner.file.sync_data()?;
            }
        }
        inner.len = offset as u64;
        inner.next_seq = expected;
        Ok(events)
    }

    /// Drops every record and records the last sequence as the checkpoint.
    /// Returns the checkpoint sequence.
    ///
    /// # Errors
    ///
    /// Fails if the header cannot be rewritten.
    pub fn checkpoint(&self) -> Result<u64, TxnLogError> {
        let mut inner = self.inner.lock();
        let last = inner.next_seq - 1;
        inner.write_header(
            FileHeader {
                status: FileStatus::CheckpointUpdated,
                checkpoint_seq: last,
            },
            self.sync,
        )?;
        info!("Checkpointed transaction log {} at {last}", self.path.display());
        Ok(last)
    }

    /// Transactions with a prepare record and no completion.
    ///
    /// # Errors
    ///
    /// Same as [`Self::replay`].
    pub fn unresolved(&self) -> Result<Vec<LoggedEvent>, TxnLogError> {
        Ok(unresolved(self.replay()?))
    }

    /// Empties the log and restarts sequence numbers at 1.
    ///
    /// # Errors
    ///
    /// Fails if the header cannot be rewritten.
    pub fn reset(&self) -> Result<(), TxnLogError> {
        self.inner.lock().write_header(
            FileHeader {
                status: FileStatus::Created,
                checkpoint_seq: 0,
            },
            self.sync,
        )?;
        info!("Reset transaction log {}", self.path.display());
        Ok(())
    }
}
