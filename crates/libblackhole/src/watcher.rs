use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use notify::Watcher;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, warn};

use crate::spawn_utils;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Create,
    Write,
}

#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
}

pub type WatchHandler = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// How a directory is observed: inode notifications for real filesystems,
/// a periodic scan for mounts that do not emit them reliably.
#[derive(Clone, Copy, Debug)]
pub enum WatchMode {
    Notify,
    Poll(Duration),
}

pub struct WatchSpec {
    pub name: String,
    pub directory: PathBuf,
    pub mode: WatchMode,
    pub handler: WatchHandler,
}

pub struct WatchHandles {
    // Kept alive for the OS watches; dropping it unregisters them.
    native: Option<notify::RecommendedWatcher>,
    cancel: CancellationToken,
}

impl WatchHandles {
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.native.take();
    }
}

/// Starts every watch plus one dispatch task. Events are matched to specs by
/// path prefix on the watched directory; overlapping directories dispatch to
/// every matching spec. Handlers are expected to return quickly and do their
/// own error handling; the dispatch loop never dies on their behalf.
///
/// Registration failures are startup errors and abort the caller.
pub fn start(specs: Vec<WatchSpec>, cancel: &CancellationToken) -> anyhow::Result<WatchHandles> {
    let cancel = cancel.child_token();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    let mut native = None;
    if specs.iter().any(|s| matches!(s.mode, WatchMode::Notify)) {
        let event_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |ev| {
            if let Err(e) = forward_notify_event(ev, &event_tx) {
                warn!("error processing watch event: {e:#}");
            }
        })
        .context("error creating filesystem watcher")?;
        for spec in specs.iter().filter(|s| matches!(s.mode, WatchMode::Notify)) {
            watcher
                .watch(&spec.directory, notify::RecursiveMode::NonRecursive)
                .with_context(|| format!("error watching {:?}", spec.directory))?;
            debug!(name = %spec.name, directory = ?spec.directory, "watching");
        }
        native = Some(watcher);
    }

    for spec in specs.iter() {
        if let WatchMode::Poll(interval) = spec.mode {
            debug!(name = %spec.name, directory = ?spec.directory, "polling");
            spawn_utils::spawn_with_cancel(
                error_span!("poll_watch", name = %spec.name),
                cancel.clone(),
                poll_directory(spec.directory.clone(), interval, tx.clone()),
            );
        }
    }

    spawn_utils::spawn_with_cancel(
        error_span!("watch_dispatch"),
        cancel.clone(),
        dispatch_loop(specs, rx),
    );

    Ok(WatchHandles { native, cancel })
}

fn forward_notify_event(
    ev: notify::Result<notify::Event>,
    tx: &UnboundedSender<WatchEvent>,
) -> anyhow::Result<()> {
    trace!(event = ?ev, "watch event");
    let ev = ev.context("error event")?;
    let kind = match ev.kind {
        notify::EventKind::Create(_) => WatchEventKind::Create,
        notify::EventKind::Modify(_) => WatchEventKind::Write,
        other => {
            trace!(kind = ?other, paths = ?ev.paths, "ignoring event");
            return Ok(());
        }
    };
    for path in ev.paths {
        tx.send(WatchEvent { kind, path })
            .context("dispatch channel closed")?;
    }
    Ok(())
}

async fn dispatch_loop(
    specs: Vec<WatchSpec>,
    mut rx: UnboundedReceiver<WatchEvent>,
) -> anyhow::Result<()> {
    while let Some(event) = rx.recv().await {
        for spec in specs.iter().filter(|s| event.path.starts_with(&s.directory)) {
            trace!(name = %spec.name, path = ?event.path, "dispatching");
            (spec.handler)(event.clone());
        }
    }
    Ok(())
}

/// Diff-based scan for directories without usable inode notifications. At
/// most one new entry is surfaced per cycle; the rest follow on later ticks.
/// The first scan only seeds the known set, pre-existing entries are the
/// startup scan's business.
async fn poll_directory(
    directory: PathBuf,
    interval: Duration,
    tx: UnboundedSender<WatchEvent>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    let mut seen = loop {
        ticker.tick().await;
        match list_directory(&directory).await {
            Ok(initial) => break initial,
            Err(e) => warn!(directory = ?directory, "error listing: {e}"),
        }
    };
    loop {
        ticker.tick().await;
        let current = match list_directory(&directory).await {
            Ok(current) => current,
            Err(e) => {
                warn!(directory = ?directory, "error listing: {e}");
                continue;
            }
        };
        // Entries that vanished may legitimately reappear later.
        seen.retain(|p| current.contains(p));
        if let Some(path) = current.into_iter().find(|p| !seen.contains(p)) {
            trace!(path = ?path, "new entry in polled directory");
            if tx
                .send(WatchEvent {
                    kind: WatchEventKind::Create,
                    path: path.clone(),
                })
                .is_err()
            {
                debug!("dispatch channel closed, stopping poll");
                return Ok(());
            }
            seen.insert(path);
        }
    }
}

async fn list_directory(directory: &std::path::Path) -> std::io::Result<HashSet<PathBuf>> {
    let mut entries = HashSet::new();
    let mut rd = tokio::fs::read_dir(directory).await?;
    while let Some(entry) = rd.next_entry().await? {
        entries.insert(entry.path());
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn collecting() -> (WatchHandler, Arc<Mutex<Vec<WatchEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handler: WatchHandler = Arc::new(move |ev| sink.lock().unwrap().push(ev));
        (handler, events)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_watch_surfaces_new_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("preexisting"), b"x").unwrap();

        let (handler, events) = collecting();
        let cancel = CancellationToken::new();
        let mut handles = start(
            vec![WatchSpec {
                name: "mount".to_owned(),
                directory: tmp.path().to_owned(),
                mode: WatchMode::Poll(Duration::from_millis(50)),
                handler,
            }],
            &cancel,
        )
        .unwrap();

        // Let the first scan seed, then add entries.
        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::create_dir(tmp.path().join("alpha")).unwrap();
        std::fs::create_dir(tmp.path().join("beta")).unwrap();

        wait_for(|| events.lock().unwrap().len() == 2).await;
        let seen: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.path.clone())
            .collect();
        assert!(seen.contains(&tmp.path().join("alpha")));
        assert!(seen.contains(&tmp.path().join("beta")));
        assert!(
            events
                .lock()
                .unwrap()
                .iter()
                .all(|e| e.kind == WatchEventKind::Create)
        );

        handles.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_overlapping_directories_dispatch_to_every_match() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let (outer_handler, outer_events) = collecting();
        let (inner_handler, inner_events) = collecting();
        let cancel = CancellationToken::new();
        let mut handles = start(
            vec![
                WatchSpec {
                    name: "outer".to_owned(),
                    directory: tmp.path().to_owned(),
                    mode: WatchMode::Poll(Duration::from_millis(50)),
                    handler: outer_handler,
                },
                WatchSpec {
                    name: "inner".to_owned(),
                    directory: sub.clone(),
                    mode: WatchMode::Poll(Duration::from_millis(50)),
                    handler: inner_handler,
                },
            ],
            &cancel,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::write(sub.join("new-entry"), b"x").unwrap();

        // The inner poller surfaces the event; both specs match its path.
        wait_for(|| !inner_events.lock().unwrap().is_empty()).await;
        wait_for(|| !outer_events.lock().unwrap().is_empty()).await;
        assert_eq!(
            outer_events.lock().unwrap()[0].path,
            sub.join("new-entry")
        );

        handles.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_notify_watch_sees_created_files() {
        let tmp = tempfile::tempdir().unwrap();
        let (handler, events) = collecting();
        let cancel = CancellationToken::new();
        let mut handles = start(
            vec![WatchSpec {
                name: "watch".to_owned(),
                directory: tmp.path().to_owned(),
                mode: WatchMode::Notify,
                handler,
            }],
            &cancel,
        )
        .unwrap();

        std::fs::write(tmp.path().join("alpha.magnet"), b"magnet:?xt=urn:btih:x").unwrap();

        wait_for(|| {
            events
                .lock()
                .unwrap()
                .iter()
                .any(|e| e.path == tmp.path().join("alpha.magnet"))
        })
        .await;

        handles.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watching_missing_directory_fails() {
        let (handler, _) = collecting();
        let cancel = CancellationToken::new();
        let res = start(
            vec![WatchSpec {
                name: "broken".to_owned(),
                directory: "/does/not/exist/anywhere".into(),
                mode: WatchMode::Notify,
                handler,
            }],
            &cancel,
        );
        assert!(res.is_err());
    }
}
