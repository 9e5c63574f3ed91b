use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use relay_types::{DeliveryRecord, EventId};

use crate::error::{StoreError, StoreResult};

/// A single logged mutation of the delivery ledger.
///
/// On-disk format:
/// ```text
/// [4 bytes: entry length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized WalEntry)]
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntry {
    /// Full snapshot of a record after an insert or transition.
    Put(DeliveryRecord),
    /// The record was purged by retention.
    Remove(EventId),
}

/// Flush/sync strategy for the WAL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// `fsync` after every write.
    #[default]
    EveryWrite,
    /// Flush to the OS and rely on page-cache write-back.
    OsDefault,
}

/// Configuration for the write-ahead log.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WalConfig {
    pub sync_mode: SyncMode,
}

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

struct WalWriter {
    writer: BufWriter<File>,
    offset: u64,
}

/// Crash-recoverable write-ahead log of delivery ledger mutations.
///
/// Entries are framed with a length prefix and a CRC32 checksum. On recovery
/// the file is read front-to-back; entries that fail the CRC check are
/// skipped and a short or truncated tail ends recovery (a torn write from a
/// crash).
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    config: WalConfig,
}

impl WriteAheadLog {
    /// Open (or create) the log file at the given path.
    pub fn open(path: &Path, config: WalConfig) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let offset = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                writer: BufWriter::new(file),
                offset,
            }),
            config,
        })
    }

    /// Append a single entry. Returns the byte offset of the entry.
    pub fn append(&self, entry: &WalEntry) -> StoreResult<u64> {
        let payload = encode(entry)?;
        let mut w = self.lock()?;
        let entry_offset = w.offset;

        write_frame(&mut w.writer, &payload)?;
        w.writer.flush()?;
        if self.config.sync_mode == SyncMode::EveryWrite {
            w.writer.get_ref().sync_data()?;
        }

        w.offset += (HEADER_SIZE + payload.len()) as u64;
        debug!(offset = entry_offset, len = payload.len(), "WAL append");
        Ok(entry_offset)
    }

    /// Recover all valid entries, in write order.
    pub fn recover(&self) -> StoreResult<Vec<WalEntry>> {
        let mut file = BufReader::new(File::open(&self.path)?);
        let file_len = file.get_ref().metadata()?.len();
        let mut entries = Vec::new();
        let mut offset: u64 = 0;

        while offset + HEADER_SIZE as u64 <= file_len {
            file.seek(SeekFrom::Start(offset))?;

            let mut header = [0u8; HEADER_SIZE];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            if length == 0 || offset + HEADER_SIZE as u64 + length as u64 > file_len {
                warn!(offset, length, file_len, "invalid WAL entry length; stopping recovery");
                break;
            }

            let mut payload = vec![0u8; length as usize];
            match file.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(offset, "truncated WAL entry; stopping recovery");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let actual_crc = crc32fast::hash(&payload);
            if actual_crc != expected_crc {
                warn!(
                    offset,
                    expected = expected_crc,
                    actual = actual_crc,
                    "CRC mismatch; skipping entry"
                );
            } else {
                match bincode::deserialize::<WalEntry>(&payload) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(offset, error = %e, "failed to decode WAL entry; skipping"),
                }
            }

            offset += HEADER_SIZE as u64 + length as u64;
        }

        debug!(recovered = entries.len(), "WAL recovery complete");
        Ok(entries)
    }

    /// Atomically replace the log contents with `entries`.
    ///
    /// The new log is written to a temporary file in the same directory,
    /// synced, and renamed over the old one, so a crash leaves either the old
    /// or the new log intact.
    pub fn rewrite(&self, entries: &[WalEntry]) -> StoreResult<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut w = self.lock()?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut written: u64 = 0;
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            for entry in entries {
                let payload = encode(entry)?;
                write_frame(&mut out, &payload)?;
                written += (HEADER_SIZE + payload.len()) as u64;
            }
            out.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        w.writer = BufWriter::new(file);
        w.offset = written;

        debug!(entries = entries.len(), bytes = written, "WAL rewritten");
        Ok(())
    }

    /// Current write offset (file length in bytes).
    pub fn offset(&self) -> u64 {
        self.lock().map(|w| w.offset).unwrap_or_default()
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, WalWriter>> {
        self.writer
            .lock()
            .map_err(|e| StoreError::StorageUnavailable(format!("WAL lock poisoned: {e}")))
    }
}

fn encode(entry: &WalEntry) -> StoreResult<Vec<u8>> {
    bincode::serialize(entry).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn write_frame(out: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let length = payload.len() as u32;
    let crc = crc32fast::hash(payload);
    out.write_all(&length.to_le_bytes())?;
    out.write_all(&crc.to_le_bytes())?;
    out.write_all(payload)
}
