use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::daemon::{ArrInstance, Daemon};
use crate::torrent_file::StagedTorrent;

/// Picks up work left over from a previous run, before any watcher starts.
///
/// Processing directories go first: their machines re-populate the wait
/// registry, so by the time the mount rescan runs, finished content can be
/// matched. A machine that registers late is still safe, it re-checks the
/// mount inline when the remote reports downloaded.
pub async fn startup_scan(daemon: &Arc<Daemon>) -> anyhow::Result<()> {
    for instance in daemon.instances() {
        resume_processing_dir(daemon, instance).await;
    }
    for instance in daemon.instances() {
        ingest_watch_dir(daemon, instance).await?;
    }
    rescan_mount(daemon).await?;
    Ok(())
}

/// Files already staged by a previous run resume at submission; staging them
/// again would be a second rename onto themselves.
async fn resume_processing_dir(daemon: &Arc<Daemon>, instance: &Arc<ArrInstance>) {
    let files = match list_files(&instance.config.processing_path).await {
        Ok(files) => files,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(dir = ?instance.config.processing_path, "error scanning processing dir: {e}");
            return;
        }
    };
    for path in files {
        let staged = match StagedTorrent::from_processing(&path) {
            Ok(staged) => staged,
            Err(e) => {
                warn!(path = ?path, "not resumable, skipping: {e:#}");
                continue;
            }
        };
        info!(path = ?path, instance = %instance.config.name, "resuming staged torrent");
        daemon.spawn_staged(instance, staged);
    }
}

async fn ingest_watch_dir(daemon: &Arc<Daemon>, instance: &Arc<ArrInstance>) -> anyhow::Result<()> {
    let files = list_files(&instance.config.watch_path)
        .await
        .with_context(|| format!("error scanning watch dir {:?}", instance.config.watch_path))?;
    for path in files {
        info!(path = ?path, instance = %instance.config.name, "found file from before startup");
        daemon.spawn_ingested(instance, path);
    }
    Ok(())
}

/// Entries already in the mount are handled as if they had just appeared.
async fn rescan_mount(daemon: &Arc<Daemon>) -> anyhow::Result<()> {
    let watch_path = daemon.debrid_watch_path();
    let mut rd = tokio::fs::read_dir(watch_path)
        .await
        .with_context(|| format!("error scanning debrid mount {watch_path:?}"))?;
    while let Some(entry) = rd
        .next_entry()
        .await
        .with_context(|| format!("error scanning debrid mount {watch_path:?}"))?
    {
        let path = entry.path();
        debug!(path = ?path, "rescanning mount entry");
        daemon.mount_handler().handle_new_entry(&path).await;
    }
    Ok(())
}

async fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}
