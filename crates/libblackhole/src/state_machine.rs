use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, info, warn};

use crate::{
    Error, InfoHash, Result,
    arr::{ArrApi, HistoryEventType},
    config::ArrInstanceConfig,
    debrid::{DebridApi, DebridStatus, FileSelection, TorrentInfo},
    mount::MountHandler,
    registry::{Completion, WaitEntry, WaitRegistry},
    spawn_utils,
    torrent_file::{StagedTorrent, TorrentKind},
};

/// Bound on the synchronous part of the pipeline (staging through debrid
/// acceptance). Once an item is registered for the mount wait, the registry
/// expiration takes over.
pub const SYNC_DEADLINE: Duration = Duration::from_secs(30);
pub const REMOTE_RETRY_DELAY: Duration = Duration::from_secs(1);
const HISTORY_PAGE_SIZE: u32 = 50;

/// Lifecycle of one ingested torrent file.
#[derive(Debug)]
pub enum TorrentState {
    /// Observed in a watch directory, nothing done yet.
    Ingested,
    /// Moving into the processing directory.
    Staging,
    /// Handing the torrent or magnet to the debrid service.
    Submitting,
    /// Asking the debrid service what it made of it.
    CheckingRemote,
    /// The remote is still chewing; check again shortly.
    AwaitingRetry,
    /// Registered in the wait registry; the mount watcher takes over.
    AwaitingMount,
    Completed,
    Failed(Error),
}

impl TorrentState {
    fn name(&self) -> &'static str {
        match self {
            TorrentState::Ingested => "ingested",
            TorrentState::Staging => "staging",
            TorrentState::Submitting => "submitting",
            TorrentState::CheckingRemote => "checking_remote",
            TorrentState::AwaitingRetry => "awaiting_retry",
            TorrentState::AwaitingMount => "awaiting_mount",
            TorrentState::Completed => "completed",
            TorrentState::Failed(_) => "failed",
        }
    }
}

/// Shared services a state machine needs from the daemon.
pub struct PipelineContext {
    pub debrid: Arc<dyn DebridApi>,
    pub registry: Arc<WaitRegistry>,
    pub mount: Arc<MountHandler>,
    pub debrid_watch_path: PathBuf,
    pub mount_timeout: Duration,
    pub cancel: CancellationToken,
}

/// One per ingested file. Drives the file from discovery to a terminal
/// state; suspended across every HTTP call and the retry sleep so siblings
/// keep moving.
pub struct TorrentItem {
    ctx: Arc<PipelineContext>,
    instance: ArrInstanceConfig,
    arr: Arc<dyn ArrApi>,
    ingested_path: Option<PathBuf>,
    staged: Option<StagedTorrent>,
    debrid_id: Option<String>,
}

impl TorrentItem {
    /// The normal entry point: a file just appeared in a watch directory.
    pub fn for_ingested(
        ctx: Arc<PipelineContext>,
        instance: ArrInstanceConfig,
        arr: Arc<dyn ArrApi>,
        path: PathBuf,
    ) -> Self {
        Self {
            ctx,
            instance,
            arr,
            ingested_path: Some(path),
            staged: None,
            debrid_id: None,
        }
    }

    /// Startup recovery: the file already sits in the processing directory,
    /// so the machine must not stage it a second time.
    pub fn for_staged(
        ctx: Arc<PipelineContext>,
        instance: ArrInstanceConfig,
        arr: Arc<dyn ArrApi>,
        staged: StagedTorrent,
    ) -> Self {
        Self {
            ctx,
            instance,
            arr,
            ingested_path: None,
            staged: Some(staged),
            debrid_id: None,
        }
    }

    /// Runs the machine on its own task.
    pub fn spawn(self, start: TorrentState) {
        let span = error_span!(
            "torrent",
            instance = %self.instance.name,
            file = tracing::field::Empty,
            debrid_id = tracing::field::Empty,
        );
        if let Some(path) = self.ingested_path.as_ref() {
            span.record("file", tracing::field::debug(path));
        } else if let Some(staged) = self.staged.as_ref() {
            span.record("file", staged.filename());
        }
        let cancel = self.ctx.cancel.clone();
        spawn_utils::spawn_with_cancel(span, cancel, async move {
            self.run(start).await;
            Ok(())
        });
    }

    /// Single driver loop: read the current state, compute the next one.
    /// Keeps the call stack flat and makes cancellation a plain task abort
    /// between transitions.
    pub async fn run(mut self, start: TorrentState) {
        let deadline = Instant::now() + SYNC_DEADLINE;
        let mut state = start;
        loop {
            debug!(state = state.name(), "entering");
            match state {
                TorrentState::Failed(err) => {
                    self.fail(err).await;
                    return;
                }
                TorrentState::AwaitingMount => {
                    debug!("registered, the mount watcher takes it from here");
                    return;
                }
                TorrentState::Completed => {
                    info!("finished handling");
                    return;
                }
                _ => {}
            }
            if Instant::now() > deadline {
                state = TorrentState::Failed(Error::Timeout);
                continue;
            }
            let next = self.step(&state).await;
            if std::mem::discriminant(&next) == std::mem::discriminant(&state) {
                state = TorrentState::Failed(Error::StuckTransition(state.name()));
                continue;
            }
            state = next;
        }
    }

    async fn step(&mut self, state: &TorrentState) -> TorrentState {
        let res = match state {
            TorrentState::Ingested => self.found(),
            TorrentState::Staging => self.stage(),
            TorrentState::Submitting => self.submit().await,
            TorrentState::CheckingRemote => self.check_remote().await,
            TorrentState::AwaitingRetry => self.wait_retry().await,
            TorrentState::AwaitingMount
            | TorrentState::Completed
            | TorrentState::Failed(_) => {
                unreachable!("terminal states are handled by the driver loop")
            }
        };
        match res {
            Ok(next) => next,
            Err(e) => TorrentState::Failed(e),
        }
    }

    fn found(&self) -> Result<TorrentState> {
        info!("found torrent file");
        Ok(TorrentState::Staging)
    }

    fn stage(&mut self) -> Result<TorrentState> {
        let path = self.ingested_path.as_ref().ok_or(Error::MissingField {
            state: "staging",
            field: "ingested_path",
        })?;
        info!("moving to processing");
        let staged = StagedTorrent::stage(path, &self.instance.processing_path)?;
        self.staged = Some(staged);
        Ok(TorrentState::Submitting)
    }

    async fn submit(&mut self) -> Result<TorrentState> {
        let staged = self.staged.as_ref().ok_or(Error::MissingField {
            state: "submitting",
            field: "staged_torrent",
        })?;
        let added = match staged.kind() {
            TorrentKind::TorrentFile => {
                info!("adding torrent file to debrid");
                let bytes =
                    tokio::fs::read(staged.staged_path())
                        .await
                        .map_err(|source| Error::ReadFile {
                            path: staged.staged_path().to_owned(),
                            source,
                        })?;
                self.ctx.debrid.add_torrent(bytes).await?
            }
            TorrentKind::Magnet => {
                let magnet = staged.magnet_uri()?;
                info!("adding magnet to debrid");
                self.ctx.debrid.add_magnet(&magnet).await?
            }
        };
        tracing::Span::current().record("debrid_id", added.id.as_str());
        self.debrid_id = Some(added.id);
        Ok(TorrentState::CheckingRemote)
    }

    async fn check_remote(&mut self) -> Result<TorrentState> {
        let id = self
            .debrid_id
            .clone()
            .ok_or(Error::MissingField {
                state: "checking_remote",
                field: "debrid_id",
            })?;
        let info = self.ctx.debrid.get_info(&id).await?;
        debug!(status = ?info.status, "handling debrid status");
        match info.status {
            DebridStatus::WaitingFilesSelection => {
                debug!("selecting all files");
                self.ctx
                    .debrid
                    .select_files(&id, FileSelection::All)
                    .await?;
                Ok(TorrentState::AwaitingRetry)
            }
            DebridStatus::Queued => Ok(TorrentState::AwaitingRetry),
            // Only instantly-available content is wanted; a remote that has
            // to download it first defeats the point of the bridge.
            DebridStatus::Downloading => Err(Error::NotInstantlyAvailable),
            DebridStatus::Downloaded => self.register_wait(info).await,
            other => Err(Error::UnexpectedDebridStatus(other)),
        }
    }

    async fn wait_retry(&mut self) -> Result<TorrentState> {
        self.debrid_id.as_deref().ok_or(Error::MissingField {
            state: "awaiting_retry",
            field: "debrid_id",
        })?;
        tokio::time::sleep(REMOTE_RETRY_DELAY).await;
        Ok(TorrentState::CheckingRemote)
    }

    /// The remote is done. Hand the item over to the mount watcher via the
    /// registry, unless the content is already sitting in the mount.
    async fn register_wait(&mut self, info: TorrentInfo) -> Result<TorrentState> {
        let staged = self.staged.as_ref().ok_or(Error::MissingField {
            state: "awaiting_mount",
            field: "staged_torrent",
        })?;
        self.debrid_id.as_deref().ok_or(Error::MissingField {
            state: "awaiting_mount",
            field: "debrid_id",
        })?;

        let info_hash = match staged.info_hash() {
            Ok(hash) => Some(hash),
            Err(e) => {
                debug!("could not derive an info-hash: {e:#}");
                None
            }
        };
        let entry = WaitEntry {
            original_filename: info.original_filename.clone(),
            expires_at: Instant::now() + self.ctx.mount_timeout,
            completed_dir: self.instance.completed_path.clone(),
            staged_path: staged.staged_path().to_owned(),
            completion: Completion {
                service: self.instance.name.clone(),
                info_hash,
            },
        };
        info!(expected = %info.filename, "waiting for the debrid mount");
        self.ctx.registry.put(info.filename.clone(), entry);

        let expected = self.ctx.debrid_watch_path.join(&info.filename);
        if tokio::fs::try_exists(&expected).await.unwrap_or(false) {
            info!("already present in the debrid mount, completing inline");
            self.ctx.mount.handle_new_entry(&expected).await;
            return Ok(TorrentState::Completed);
        }
        Ok(TorrentState::AwaitingMount)
    }

    /// Terminal cleanup, every step best-effort: the remote torrent, the
    /// staged file, and the media app's record of the grab. The info-hash is
    /// derived first, it cannot be read back once the file is gone.
    async fn fail(&mut self, err: Error) {
        warn!("giving up: {err:#}");
        let info_hash = self.staged.as_ref().and_then(|staged| match staged.info_hash() {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!("failed to derive info-hash: {e:#}");
                None
            }
        });
        if let Some(id) = self.debrid_id.as_deref() {
            match self.ctx.debrid.remove(id).await {
                Ok(()) => info!("removed from debrid"),
                Err(e) => warn!("failed to remove from debrid: {e:#}"),
            }
        }
        if let Some(staged) = self.staged.as_ref() {
            if let Err(e) = tokio::fs::remove_file(staged.staged_path()).await {
                warn!(path = ?staged.staged_path(), "failed to remove staged file: {e}");
            }
        }
        if let Some(hash) = info_hash {
            self.mark_grab_failed(hash).await;
        }
    }

    /// Finds the matching grab in the media app's history and marks it
    /// failed so the app can look for another release.
    async fn mark_grab_failed(&self, hash: InfoHash) {
        let history = match self.arr.get_history(HISTORY_PAGE_SIZE).await {
            Ok(history) => history,
            Err(e) => {
                warn!("failed to fetch history: {e:#}");
                return;
            }
        };
        let record = history.records.iter().find(|r| {
            r.event_type == HistoryEventType::Grabbed
                && r.data
                    .torrent_info_hash
                    .as_deref()
                    .and_then(|h| h.parse::<InfoHash>().ok())
                    .is_some_and(|h| h == hash)
        });
        let Some(record) = record else {
            debug!(hash = %hash, "no grabbed history record matches");
            return;
        };
        match self.arr.fail_history_item(record.id).await {
            Ok(()) => info!(history_id = record.id, "marked grab failed"),
            Err(e) => warn!(history_id = record.id, "failed to mark grab failed: {e:#}"),
        }
    }
}
