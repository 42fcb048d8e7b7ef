//! File watcher that turns edits of the reminder document into change signals.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::ChangeSignal;

/// Keeps the OS watch registered; dropping it stops the signals.
pub struct DocumentWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl DocumentWatcher {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Watch the document's directory and forward matching events to `sender`.
///
/// The parent directory is watched so atomic renames over the file are seen.
pub fn watch_document(
    path: &Path,
    sender: mpsc::UnboundedSender<ChangeSignal>,
) -> Result<DocumentWatcher> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .ok_or_else(|| anyhow!("reminder document path has no file name"))?;
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("create document directory {}", parent.display()))?;

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !is_content_change(&event.kind) {
                    return;
                }
                let matches = event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == Some(file_name.as_os_str()));
                if matches {
                    debug!(kind = ?event.kind, "reminder document changed on disk");
                    let _ = sender.send(ChangeSignal::FileChanged);
                }
            }
            Err(err) => warn!(?err, "document watcher error"),
        },
        notify::Config::default(),
    )
    .context("create document watcher")?;

    watcher
        .watch(&parent, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch {}", parent.display()))?;

    Ok(DocumentWatcher {
        _watcher: watcher,
        path: path.to_path_buf(),
    })
}

fn is_content_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}
