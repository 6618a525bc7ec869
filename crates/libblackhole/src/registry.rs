use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span};

use crate::{InfoHash, spawn_utils};

pub const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Where a finished download must be reported. Inert data rather than a
/// callback so registry contents stay inspectable.
#[derive(Clone, Debug)]
pub struct Completion {
    /// Name of the media-app instance that submitted the torrent.
    pub service: String,
    /// Info-hash of the submission, used to locate the grab in the media
    /// app's history if it has to be marked failed.
    pub info_hash: Option<InfoHash>,
}

#[derive(Clone, Debug)]
pub struct WaitEntry {
    /// Filename as reported by the submitting side, kept for future fuzzy
    /// matching against renamed mount entries.
    pub original_filename: String,
    pub expires_at: Instant,
    pub completed_dir: PathBuf,
    pub staged_path: PathBuf,
    pub completion: Completion,
}

/// Rendezvous table between in-flight state machines and the debrid mount
/// watcher, keyed by the filename the debrid service assigned. Entries are
/// swept once expired; `take` is the only way the mount handler may consume
/// one, which also makes completion single-shot.
#[derive(Default)]
pub struct WaitRegistry {
    entries: Mutex<HashMap<String, WaitEntry>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Unconditional insert/overwrite.
    pub fn put(&self, key: String, entry: WaitEntry) {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        entries.insert(key, entry);
    }

    /// Atomic lookup-and-delete.
    pub fn take(&self, key: &str) -> Option<WaitEntry> {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        entries.remove(key)
    }

    /// Lookup without consuming.
    pub fn peek(&self, key: &str) -> Option<WaitEntry> {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        entries.get(key).cloned()
    }

    pub fn sweep_expired(&self) {
        Self::sweep(&mut self.entries.lock());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn sweep(entries: &mut HashMap<String, WaitEntry>) {
        let now = Instant::now();
        entries.retain(|key, entry| {
            let keep = now <= entry.expires_at;
            if !keep {
                debug!(key = %key, "expired waiting for the debrid mount, dropping");
            }
            keep
        });
    }

    /// Periodic sweep so expiries are observed even when nothing touches the
    /// registry.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let this = Arc::clone(self);
        spawn_utils::spawn_with_cancel(error_span!("registry_sweeper"), cancel, async move {
            let mut interval = tokio::time::interval(SWEEP_PERIOD);
            loop {
                interval.tick().await;
                this.sweep_expired();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(expires_in: Duration) -> WaitEntry {
        WaitEntry {
            original_filename: "alpha".to_owned(),
            expires_at: Instant::now() + expires_in,
            completed_dir: "/completed".into(),
            staged_path: "/processing/alpha.magnet".into(),
            completion: Completion {
                service: "sonarr-main".to_owned(),
                info_hash: None,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_consumes_entry() {
        let registry = WaitRegistry::new();
        registry.put("alpha".to_owned(), entry(Duration::from_secs(600)));

        assert!(registry.take("alpha").is_some());
        assert!(registry.take("alpha").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_does_not_consume() {
        let registry = WaitRegistry::new();
        registry.put("alpha".to_owned(), entry(Duration::from_secs(600)));

        assert!(registry.peek("alpha").is_some());
        assert!(registry.peek("alpha").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_swept_on_access() {
        let registry = WaitRegistry::new();
        registry.put("alpha".to_owned(), entry(Duration::from_secs(2)));
        registry.put("beta".to_owned(), entry(Duration::from_secs(600)));

        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(registry.take("alpha").is_none());
        assert!(registry.peek("beta").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_take_is_single_shot_under_contention() {
        let registry = Arc::new(WaitRegistry::new());
        registry.put("alpha".to_owned(), entry(Duration::from_secs(600)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.take("alpha").is_some() })
            })
            .collect();
        let mut wins = 0;
        for task in tasks {
            if task.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_replaces_entry() {
        let registry = WaitRegistry::new();
        registry.put("alpha".to_owned(), entry(Duration::from_secs(600)));
        let mut replacement = entry(Duration::from_secs(600));
        replacement.original_filename = "alpha-v2".to_owned();
        registry.put("alpha".to_owned(), replacement);

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.take("alpha").unwrap().original_filename,
            "alpha-v2"
        );
    }
}
