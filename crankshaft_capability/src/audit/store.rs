//! Audit record persistence.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crankshaft_core::error::AuditError;

use super::AuditRecord;

/// Durable backing for the audit log.
///
/// Stores only ever append; the log never asks a store to rewrite or delete
/// a record.
pub trait AuditStore: Send + Sync {
    /// Append records in order.
    fn append(&self, records: &[AuditRecord]) -> Result<(), AuditError>;

    /// Read every persisted record, oldest first.
    fn load(&self) -> Result<Vec<AuditRecord>, AuditError>;

    /// Push buffered writes to durable storage.
    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Keeps records in memory. Writes can be made to fail on demand to
/// exercise the log's buffering.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
    failing: AtomicBool,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, records: &[AuditRecord]) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::WriteFailure("store unavailable".to_string()));
        }
        self.records.lock().extend_from_slice(records);
        Ok(())
    }

    fn load(&self) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self.records.lock().clone())
    }
}

/// JSON Lines file store: one serialized record per line, append-only.
pub struct JsonlAuditStore {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl JsonlAuditStore {
    /// Use `path` as the log file. The file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_writer(&self) -> Result<BufWriter<File>, AuditError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        // Appending after a torn line would merge the next record into it.
        let len = file.metadata()?.len();
        let complete = complete_len(&mut file, len)?;
        if complete < len {
            warn!(
                path = %self.path.display(),
                dropped_bytes = len - complete,
                "Truncating torn audit record before appending"
            );
            file.set_len(complete)?;
        }

        debug!(path = %self.path.display(), "Opened audit log file");
        Ok(BufWriter::new(file))
    }
}

/// Length of the prefix of `file` that ends with a newline.
fn complete_len(file: &mut File, len: u64) -> io::Result<u64> {
    let mut buf = [0u8; 4096];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

impl AuditStore for JsonlAuditStore {
    fn append(&self, records: &[AuditRecord]) -> Result<(), AuditError> {
        let mut guard = self.writer.lock();
        if guard.is_none() {
            *guard = Some(self.open_writer()?);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(AuditError::Closed);
        };

        let mut result: Result<(), AuditError> = Ok(());
        for record in records {
            let line = serde_json::to_string(record)?;
            if let Err(err) = writeln!(writer, "{line}") {
                result = Err(err.into());
                break;
            }
        }
        if result.is_ok() {
            result = writer.flush().map_err(AuditError::from);
        }
        if result.is_err() {
            // Reopen on the next append.
            *guard = None;
        }
        result
    }

    fn load(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<Result<_, _>>()?;
        let last = lines.iter().rposition(|l| !l.trim().is_empty());

        let mut records = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => records.push(record),
                // A torn final line is what a crash mid-append leaves behind.
                Err(err) if Some(index) == last => {
                    warn!(path = %self.path.display(), error = %err, "Ignoring truncated final audit record");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(records)
    }

    fn flush(&self) -> Result<(), AuditError> {
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}
