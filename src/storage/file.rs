//! File-based storage implementation for Raft persistent state
//!
//! Stores state in three files within a directory:
//! - `hard_state` - term, vote and commit index (JSON with checksum)
//! - `log` - Log entries (JSON lines format, each line has checksum)
//! - `snapshot` - Most recent snapshot (JSON with checksum)
//!
//! Uses checksums to detect corruption from partial writes.

use crate::core::raft_core::LogEntry;
use crate::core::snapshot::Snapshot;
use super::{HardState, Storage, StorageError};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Simple CRC32 checksum (IEEE polynomial)
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Format one checksummed record: "{data} {crc32_hex}\n"
fn checksummed(data: &str) -> String {
    format!("{} {:08x}\n", data, crc32(data.as_bytes()))
}

/// Split a record into its data portion, verifying the checksum
fn verify_record<'a>(line: &'a str, what: &dyn Fn() -> String) -> Result<&'a str, StorageError> {
    let (data, checksum_str) = line
        .rsplit_once(' ')
        .ok_or_else(|| StorageError::Corruption(format!("{}: missing checksum", what())))?;

    let stored = u32::from_str_radix(checksum_str, 16)
        .map_err(|_| StorageError::Corruption(format!("{}: invalid checksum format", what())))?;
    let computed = crc32(data.as_bytes());
    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "{}: checksum mismatch: stored {:08x}, computed {:08x}",
            what(),
            stored,
            computed
        )));
    }
    Ok(data)
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

/// File-based storage implementation
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create a new FileStorage in the given directory
    /// Creates the directory if it doesn't exist
    ///
    /// A log record torn by a crash mid-append is dropped here. Only the
    /// final record may be torn; damage anywhere else surfaces from `load_log`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err)?;
        let storage = FileStorage { dir };
        storage.repair_log_tail()?;
        Ok(storage)
    }

    fn repair_log_tail(&self) -> Result<(), StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(());
        }

        let bytes = fs::read(&path).map_err(io_err)?;
        let records: Vec<&[u8]> = bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .collect();
        let Some((last, body)) = records.split_last() else {
            return Ok(());
        };

        let intact = std::str::from_utf8(last)
            .ok()
            .and_then(|line| verify_record(line, &|| "last log line".to_string()).ok())
            .is_some_and(|json| serde_json::from_str::<LogEntry>(json).is_ok());
        if intact && bytes.ends_with(b"\n") {
            return Ok(());
        }

        let kept = if intact { &records[..] } else { body };
        if !intact {
            warn!(path = %path.display(), records = kept.len(), "dropping torn record at end of log");
        }
        let mut content = Vec::with_capacity(bytes.len());
        for record in kept {
            content.extend_from_slice(record);
            content.push(b'\n');
        }
        self.atomic_write(&path, &content)
    }

    fn hard_state_path(&self) -> PathBuf {
        self.dir.join("hard_state")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot")
    }

    /// Read a single-record file and verify its checksum
    fn read_record(&self, path: &Path) -> Result<Option<String>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(io_err)?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }

        let data = verify_record(content, &|| format!("{:?}", path))?;
        Ok(Some(data.to_string()))
    }

    /// Atomically write data to a file (write to temp, fsync, rename)
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path).map_err(io_err)?;
        file.write_all(data).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        fs::rename(&temp_path, path).map_err(io_err)?;
        Ok(())
    }

    fn encode_entry(entry: &LogEntry) -> Result<String, StorageError> {
        let json = serde_json::to_string(entry).map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(checksummed(&json))
    }

    /// Rewrite the log keeping only entries that satisfy `keep`
    fn rewrite_log(&self, keep: impl Fn(&LogEntry) -> bool) -> Result<(), StorageError> {
        let mut content = String::new();
        for entry in self.load_log()?.iter().filter(|e| keep(e)) {
            content.push_str(&Self::encode_entry(entry)?);
        }
        self.atomic_write(&self.log_path(), content.as_bytes())
    }
}

impl Storage for FileStorage {
    fn load_hard_state(&self) -> Result<HardState, StorageError> {
        match self.read_record(&self.hard_state_path())? {
            None => Ok(HardState::default()),
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| StorageError::Corruption(format!("invalid hard state: {}", e))),
        }
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        let json = serde_json::to_string(state).map_err(|e| StorageError::Codec(e.to_string()))?;
        self.atomic_write(&self.hard_state_path(), checksummed(&json).as_bytes())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path).map_err(io_err)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }

            let json = verify_record(&line, &|| format!("log line {}", line_num + 1))?;
            let entry: LogEntry = serde_json::from_str(json).map_err(|e| {
                StorageError::Corruption(format!("invalid log entry at line {}: {}", line_num + 1, e))
            })?;
            entries.push(entry);
        }

        Ok(entries)
    }

    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .map_err(io_err)?;

        for entry in entries {
            file.write_all(Self::encode_entry(entry)?.as_bytes()).map_err(io_err)?;
        }

        file.sync_all().map_err(io_err)
    }

    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        self.rewrite_log(|e| e.index < from_index)
    }

    fn compact_log(&mut self, before_index: u64) -> Result<(), StorageError> {
        self.rewrite_log(|e| e.index >= before_index)
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        match self.read_record(&self.snapshot_path())? {
            None => Ok(None),
            Some(json) => {
                let snapshot: Snapshot = serde_json::from_str(&json)
                    .map_err(|e| StorageError::Corruption(format!("invalid snapshot: {}", e)))?;
                Ok(Some(snapshot))
            }
        }
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let json = serde_json::to_string(snapshot).map_err(|e| StorageError::Codec(e.to_string()))?;
        self.atomic_write(&self.snapshot_path(), checksummed(&json).as_bytes())
    }
}
