//! Reminder document store with last-known-good fallback and atomic writes.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use taskminder_core::util::log_snippet;
use taskminder_core::ConfigDocument;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reminder document not found at {0}")]
    NotFound(PathBuf),
    #[error("failed to access reminder document: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse reminder document: {0}")]
    Parse(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("failed to serialize reminder document: {0}")]
    Serialize(String),
}

/// Source of a request to re-derive the schedule.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChangeSignal {
    /// The file watcher saw the document being created or modified.
    FileChanged,
    /// This store wrote the document.
    StoreWrite,
}

/// A document as stored, with its parsed view.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    raw: Value,
    document: ConfigDocument,
}

/// Owns the on-disk reminder document and the last copy that parsed.
pub struct DocumentStore {
    path: PathBuf,
    last_good: Snapshot,
    changes: Option<mpsc::UnboundedSender<ChangeSignal>>,
}

impl DocumentStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_good: Snapshot {
                raw: Value::Object(Map::new()),
                document: ConfigDocument::default(),
            },
            changes: None,
        }
    }

    /// Emit `ChangeSignal::StoreWrite` on `sender` after every successful write.
    pub fn with_change_signal(mut self, sender: mpsc::UnboundedSender<ChangeSignal>) -> Self {
        self.changes = Some(sender);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document, falling back to the last good copy on any failure.
    /// The error says why the fallback was used.
    pub fn read_checked(&mut self) -> (ConfigDocument, Option<StoreError>) {
        match self.load() {
            Ok(snapshot) => (snapshot.document, None),
            Err(err) => (self.last_good.document.clone(), Some(err)),
        }
    }

    /// The document as stored, or the last good copy if it cannot be read.
    pub fn read_raw(&mut self) -> Value {
        match self.load() {
            Ok(snapshot) => snapshot.raw,
            Err(_) => self.last_good.raw.clone(),
        }
    }

    /// The document as stored, with no fallback. Used before editing it in place.
    pub fn read_current(&mut self) -> Result<Value, StoreError> {
        self.load().map(|snapshot| snapshot.raw)
    }

    /// Validate a payload and persist it unchanged.
    pub fn write_value(&mut self, payload: Value) -> Result<(), StoreError> {
        let snapshot = parse_snapshot(payload).map_err(StoreError::InvalidPayload)?;
        let mut text = serde_json::to_string_pretty(&snapshot.raw)
            .map_err(|err| StoreError::Serialize(err.to_string()))?;
        text.push('\n');
        write_atomic(&self.path, &text)?;
        debug!(
            path = %self.path.display(),
            items = snapshot.document.items.len(),
            tasks = snapshot.document.tasks.len(),
            "reminder document written"
        );
        self.last_good = snapshot;
        if let Some(sender) = self.changes.as_ref() {
            let _ = sender.send(ChangeSignal::StoreWrite);
        }
        Ok(())
    }

    fn load(&mut self) -> Result<Snapshot, StoreError> {
        match load_snapshot(&self.path) {
            Ok(snapshot) => {
                self.last_good = snapshot.clone();
                Ok(snapshot)
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %log_snippet(&err.to_string()),
                    "reminder document unreadable; using last known good copy"
                );
                Err(err)
            }
        }
    }
}

fn load_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
    let text = fs::read_to_string(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => StoreError::NotFound(path.to_path_buf()),
        _ => StoreError::Io(err),
    })?;
    let raw: Value = serde_json::from_str(&text).map_err(|err| StoreError::Parse(err.to_string()))?;
    parse_snapshot(raw).map_err(StoreError::Parse)
}

/// A document must be a JSON object whose known keys have the expected shape.
fn parse_snapshot(raw: Value) -> Result<Snapshot, String> {
    if !raw.is_object() {
        return Err("expected a JSON object".to_string());
    }
    let document = ConfigDocument::deserialize(&raw).map_err(|err| err.to_string())?;
    Ok(Snapshot { raw, document })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_atomic(path: &Path, text: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = temp_path(path);
    fs::write(&tmp_path, text)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
