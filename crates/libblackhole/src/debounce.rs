use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);

/// Logical event classes the watchers feed in. `Unknown` exists to classify
/// event kinds nothing acts on; it is never dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DebounceKind {
    CreateOrWrite,
    Unknown,
}

#[derive(Default)]
struct DebounceEntry {
    /// Armed deadline per event kind. A call for any kind pushes every
    /// deadline under the key forward, so a mixed burst settles as a unit.
    timers: Mutex<HashMap<DebounceKind, Arc<Mutex<Instant>>>>,
}

/// Coalesces bursts of filesystem events on a single path: `f` runs once the
/// key has been quiet for the window. The first call per `(key, kind)`
/// decides what runs; later calls within the window only delay it.
pub struct Debouncer {
    entries: DashMap<PathBuf, Arc<DebounceEntry>>,
    window: Duration,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}

impl Debouncer {
    pub fn new() -> Self {
        Self::with_window(DEBOUNCE_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            window,
        }
    }

    /// Must be called from within a tokio runtime; the timer is a task.
    pub fn debounce(
        self: &Arc<Self>,
        key: &Path,
        kind: DebounceKind,
        f: impl FnOnce() + Send + 'static,
    ) {
        let entry = self.entries.entry(key.to_owned()).or_default().clone();
        let mut timers = entry.timers.lock();

        let deadline = Instant::now() + self.window;
        for timer in timers.values() {
            *timer.lock() = deadline;
        }

        if timers.contains_key(&kind) {
            trace!(key = ?key, "timer already armed, deadlines pushed out");
            return;
        }

        let timer = Arc::new(Mutex::new(deadline));
        timers.insert(kind, timer.clone());
        drop(timers);

        let this = Arc::clone(self);
        let key = key.to_owned();
        tokio::spawn(async move {
            // The deadline may move while we sleep; only fire once it holds.
            loop {
                let deadline = *timer.lock();
                if Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep_until(deadline).await;
            }
            let mut timers = entry.timers.lock();
            timers.remove(&kind);
            let empty = timers.is_empty();
            drop(timers);
            if empty {
                this.entries
                    .remove_if(&key, |_, e| Arc::ptr_eq(e, &entry) && e.timers.lock().is_empty());
            }
            trace!(key = ?key, "debounce window elapsed");
            f();
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_calls_coalesce_into_one_firing() {
        let debouncer = Arc::new(Debouncer::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let key = Path::new("/watch/alpha.magnet");

        debouncer.debounce(key, DebounceKind::CreateOrWrite, counting(&counter));
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        debouncer.debounce(key, DebounceKind::CreateOrWrite, counting(&counter));

        // 5s after the first call: the second call pushed the deadline out.
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // 5s after the second call.
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_fire_independently() {
        let debouncer = Arc::new(Debouncer::new());
        let counter = Arc::new(AtomicUsize::new(0));

        debouncer.debounce(
            Path::new("/watch/a.magnet"),
            DebounceKind::CreateOrWrite,
            counting(&counter),
        );
        debouncer.debounce(
            Path::new("/watch/b.magnet"),
            DebounceKind::CreateOrWrite,
            counting(&counter),
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_kind_resets_every_timer_under_a_key() {
        let debouncer = Arc::new(Debouncer::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let key = Path::new("/mount/alpha");

        debouncer.debounce(key, DebounceKind::CreateOrWrite, counting(&counter));
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;

        // A different kind under the same key pushes the first timer out too.
        debouncer.debounce(key, DebounceKind::Unknown, counting(&counter));
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_is_cleaned_up_after_firing() {
        let debouncer = Arc::new(Debouncer::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let key = Path::new("/watch/alpha.magnet");

        debouncer.debounce(key, DebounceKind::CreateOrWrite, counting(&counter));
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(debouncer.entries.is_empty());

        // A later event arms a fresh timer.
        debouncer.debounce(key, DebounceKind::CreateOrWrite, counting(&counter));
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
