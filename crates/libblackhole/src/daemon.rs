use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error_span, info};

use crate::{
    arr::{ArrApi, ArrClient},
    config::{AppConfig, ArrInstanceConfig, Secrets},
    debounce::{DebounceKind, Debouncer},
    debrid::{DebridApi, DebridClient},
    mount::MountHandler,
    registry::WaitRegistry,
    scan, spawn_utils,
    state_machine::{PipelineContext, TorrentItem, TorrentState},
    watcher::{self, POLL_INTERVAL, WatchEvent, WatchEventKind, WatchMode, WatchSpec},
};

/// One configured media-app instance and its API client.
pub struct ArrInstance {
    pub config: ArrInstanceConfig,
    pub client: Arc<dyn ArrApi>,
}

/// The daemon root: owns every shared service explicitly and wires the
/// watchers to the per-torrent pipeline.
pub struct Daemon {
    config: AppConfig,
    registry: Arc<WaitRegistry>,
    debouncer: Arc<Debouncer>,
    instances: Vec<Arc<ArrInstance>>,
    mount: Arc<MountHandler>,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(config: AppConfig, secrets: &Secrets) -> anyhow::Result<Arc<Self>> {
        let debrid: Arc<dyn DebridApi> = Arc::new(DebridClient::new(
            config.debrid.base_url.clone(),
            secrets.debrid_api_key()?.to_owned(),
        )?);
        let mut instances = Vec::with_capacity(config.instances.len());
        for instance in &config.instances {
            let api_key = secrets.arr_api_key(&instance.name)?.to_owned();
            let client = ArrClient::new(instance.kind, instance.base_url.clone(), api_key)?;
            instances.push(Arc::new(ArrInstance {
                config: instance.clone(),
                client: Arc::new(client) as Arc<dyn ArrApi>,
            }));
        }
        Ok(Self::with_clients(config, debrid, instances))
    }

    /// Wiring seam: tests inject in-memory clients here.
    pub fn with_clients(
        config: AppConfig,
        debrid: Arc<dyn DebridApi>,
        instances: Vec<Arc<ArrInstance>>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let registry = Arc::new(WaitRegistry::new());
        let notifiers: HashMap<String, Arc<dyn ArrApi>> = instances
            .iter()
            .map(|i| (i.config.name.clone(), i.client.clone()))
            .collect();
        let mount = Arc::new(MountHandler::new(registry.clone(), notifiers));
        let ctx = Arc::new(PipelineContext {
            debrid,
            registry: registry.clone(),
            mount: mount.clone(),
            debrid_watch_path: config.debrid.watch_path.clone(),
            mount_timeout: config.mount_timeout(),
            cancel: cancel.clone(),
        });
        Arc::new(Self {
            config,
            registry,
            debouncer: Arc::new(Debouncer::new()),
            instances,
            mount,
            ctx,
            cancel,
        })
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn instances(&self) -> &[Arc<ArrInstance>] {
        &self.instances
    }

    pub fn mount_handler(&self) -> &Arc<MountHandler> {
        &self.mount
    }

    pub fn registry(&self) -> &Arc<WaitRegistry> {
        &self.registry
    }

    pub fn debrid_watch_path(&self) -> &Path {
        &self.config.debrid.watch_path
    }

    /// Runs until cancelled: registry sweeper, startup scan, then watchers.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        self.registry.spawn_sweeper(self.cancel.clone());
        scan::startup_scan(self).await?;
        let mut handles = watcher::start(self.watch_specs(), &self.cancel)?;
        info!("started");
        self.cancel.cancelled().await;
        handles.close();
        Ok(())
    }

    fn watch_specs(self: &Arc<Self>) -> Vec<WatchSpec> {
        let mut specs = Vec::new();
        for instance in self.instances.iter().cloned() {
            let daemon = Arc::clone(self);
            specs.push(WatchSpec {
                name: instance.config.name.clone(),
                directory: instance.config.watch_path.clone(),
                mode: WatchMode::Notify,
                handler: Arc::new(move |event| daemon.handle_ingest_event(&instance, event)),
            });
        }
        let daemon = Arc::clone(self);
        specs.push(WatchSpec {
            name: "debrid-mount".to_owned(),
            directory: self.config.debrid.watch_path.clone(),
            mode: WatchMode::Poll(POLL_INTERVAL),
            handler: Arc::new(move |event| daemon.handle_mount_event(event)),
        });
        specs
    }

    /// Media apps write the file and may touch it again right after; the
    /// debouncer folds that burst into one pipeline run.
    fn handle_ingest_event(self: &Arc<Self>, instance: &Arc<ArrInstance>, event: WatchEvent) {
        let kind = match event.kind {
            WatchEventKind::Create | WatchEventKind::Write => DebounceKind::CreateOrWrite,
        };
        let daemon = Arc::clone(self);
        let instance = Arc::clone(instance);
        let path = event.path.clone();
        self.debouncer.debounce(&event.path, kind, move || {
            daemon.spawn_ingested(&instance, path);
        });
    }

    fn handle_mount_event(self: &Arc<Self>, event: WatchEvent) {
        if event.kind != WatchEventKind::Create {
            return;
        }
        let mount = self.mount.clone();
        let path = event.path.clone();
        self.debouncer
            .debounce(&event.path, DebounceKind::CreateOrWrite, move || {
                spawn_utils::spawn(
                    error_span!("mount_event", path = ?path),
                    async move {
                        mount.handle_new_entry(&path).await;
                        Ok(())
                    },
                );
            });
    }

    pub(crate) fn spawn_ingested(&self, instance: &Arc<ArrInstance>, path: PathBuf) {
        TorrentItem::for_ingested(
            self.ctx.clone(),
            instance.config.clone(),
            instance.client.clone(),
            path,
        )
        .spawn(TorrentState::Ingested);
    }

    pub(crate) fn spawn_staged(
        &self,
        instance: &Arc<ArrInstance>,
        staged: crate::torrent_file::StagedTorrent,
    ) {
        TorrentItem::for_staged(
            self.ctx.clone(),
            instance.config.clone(),
            instance.client.clone(),
            staged,
        )
        .spawn(TorrentState::Submitting);
    }
}
