use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::Arc;

use tracing::{Instrument, debug, error_span, info, warn};
use walkdir::WalkDir;

use crate::{
    Error, Result,
    arr::ArrApi,
    registry::{WaitEntry, WaitRegistry},
};

/// Completes in-flight torrents once their content shows up under the debrid
/// mount. Safe for concurrent invocation: the registry's `take` guarantees a
/// single activation per expected filename.
pub struct MountHandler {
    registry: Arc<WaitRegistry>,
    notifiers: HashMap<String, Arc<dyn ArrApi>>,
}

impl MountHandler {
    pub fn new(registry: Arc<WaitRegistry>, notifiers: HashMap<String, Arc<dyn ArrApi>>) -> Self {
        Self {
            registry,
            notifiers,
        }
    }

    /// Reacts to one new entry in the mount. Entries nobody is waiting for
    /// belong to other consumers of the same debrid account and are skipped.
    pub async fn handle_new_entry(&self, path: &Path) {
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            return;
        };
        let span = error_span!("mount_entry", name = %name);
        self.process(path, &name).instrument(span).await;
    }

    async fn process(&self, path: &Path, name: &str) {
        let Some(entry) = self.registry.take(name) else {
            debug!("not waiting for this entry, skipping");
            return;
        };
        if !entry.staged_path.exists() {
            warn!(staged = ?entry.staged_path, "staged file is gone, not processing");
            return;
        }

        info!(completed_dir = ?entry.completed_dir, "linking mount entry");
        let completed = entry.completed_dir.join(name);
        let mount_entry = path.to_owned();
        let linked =
            tokio::task::spawn_blocking(move || link_tree(&mount_entry, &completed)).await;
        match linked {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // The wait entry is consumed, but the staged file stays; a
                // restart rescan gets another shot at it.
                warn!("linking failed: {e:#}");
                return;
            }
            Err(e) => {
                warn!("linking task failed: {e}");
                return;
            }
        }

        if let Err(e) = self.notify_success(&entry).await {
            warn!("completion callback failed, leaving staged file for rescan: {e:#}");
            return;
        }

        debug!(staged = ?entry.staged_path, "removing staged file");
        if let Err(e) = tokio::fs::remove_file(&entry.staged_path).await {
            warn!(staged = ?entry.staged_path, "failed to remove staged file: {e}");
        }
        info!("completed");
    }

    async fn notify_success(&self, entry: &WaitEntry) -> Result<()> {
        let Some(client) = self.notifiers.get(&entry.completion.service) else {
            warn!(service = %entry.completion.service, "no such instance, cannot notify");
            return Ok(());
        };
        client
            .refresh_monitored_downloads()
            .await
            .map(|_| ())
            .map_err(|e| Error::Callback(Box::new(e)))
    }
}

/// Mirrors every regular file under `mount_entry` as a symlink beneath
/// `completed`, keeping the relative layout. Targets stay inside the mount;
/// a relative path with a `..` segment aborts the walk.
fn link_tree(mount_entry: &Path, completed: &Path) -> Result<()> {
    std::fs::create_dir_all(completed).map_err(|source| Error::Filesystem {
        context: "creating completed directory",
        source,
    })?;
    for entry in WalkDir::new(mount_entry) {
        let entry = entry.map_err(|e| Error::Filesystem {
            context: "walking mount entry",
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(mount_entry)
            .map_err(|_| Error::PathTraversal(entry.path().to_owned()))?;
        if escapes_entry_root(rel) {
            return Err(Error::PathTraversal(entry.path().to_owned()));
        }
        // A bare file as the mount entry has an empty relative path.
        let dest = if rel.as_os_str().is_empty() {
            completed.join(entry.file_name())
        } else {
            completed.join(rel)
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::Filesystem {
                context: "creating parent directory",
                source,
            })?;
        }
        symlink(entry.path(), &dest).map_err(|source| Error::Filesystem {
            context: "creating symlink",
            source,
        })?;
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

fn escapes_entry_root(rel: &Path) -> bool {
    rel.components().any(|c| matches!(c, Component::ParentDir))
}
