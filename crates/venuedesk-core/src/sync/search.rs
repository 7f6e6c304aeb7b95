//! Debounced search input.
//!
//! Raw keystrokes go to [`DebouncedSearch::on_input`]; the value is committed
//! once the input has been quiet for the debounce period. Only the pending
//! timer is ever cancelled. Fetches started by earlier commits keep running
//! and are made harmless by the cache's sequence guard.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::cache::{Loader, QueryCache};
use super::key::QueryKey;

/// Commit callback. Returns the sequence number of the fetch it issued, if any.
type CommitFn = Arc<dyn Fn(&str) -> Option<u64> + Send + Sync>;

/// Observable state of a search session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebounceSession {
    pub raw_value: String,
    pub committed_value: Option<String>,
    pub pending: bool,
    pub active_fetch_seq: Option<u64>,
}

#[derive(Default)]
struct SessionState {
    raw_value: String,
    committed_value: Option<String>,
    /// Bumped on every input; a timer only commits its own generation.
    generation: u64,
    pending: Option<JoinHandle<()>>,
    active_fetch_seq: Option<u64>,
}

struct Shared {
    debounce: Duration,
    state: Mutex<SessionState>,
    on_commit: CommitFn,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, generation: u64) {
        let value = {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.pending = None;
            state.committed_value = Some(state.raw_value.clone());
            state.raw_value.clone()
        };

        debug!(value = %value, "Committing search");
        let seq = (self.on_commit)(&value);

        if seq.is_some() {
            let mut state = self.state();
            if state.generation == generation {
                state.active_fetch_seq = seq;
            }
        }
    }
}

/// One search widget's debounce controller. Dropping it cancels the pending
/// commit.
pub struct DebouncedSearch {
    shared: Arc<Shared>,
}

impl DebouncedSearch {
    /// Controller calling `on_commit` with each committed value.
    pub fn new<F>(debounce: Duration, on_commit: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self::with_commit(
            debounce,
            Arc::new(move |value: &str| {
                on_commit(value);
                None
            }),
        )
    }

    /// Controller whose commits issue a cache fetch for the key and loader
    /// `build` returns for the committed term.
    pub fn for_query<F>(cache: QueryCache, debounce: Duration, build: F) -> Self
    where
        F: Fn(&str) -> (QueryKey, Loader) + Send + Sync + 'static,
    {
        Self::with_commit(
            debounce,
            Arc::new(move |value: &str| {
                let (key, loader) = build(value);
                Some(cache.spawn_fetch(&key, loader))
            }),
        )
    }

    fn with_commit(debounce: Duration, on_commit: CommitFn) -> Self {
        Self {
            shared: Arc::new(Shared {
                debounce,
                state: Mutex::new(SessionState::default()),
                on_commit,
            }),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.shared.debounce
    }

    /// Record a new raw value and restart the quiet period. An empty value
    /// commits immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_input(&self, raw: impl Into<String>) {
        let raw = raw.into();
        let generation = {
            let mut state = self.shared.state();
            state.raw_value = raw.clone();
            state.generation += 1;
            if let Some(timer) = state.pending.take() {
                timer.abort();
            }

            let generation = state.generation;
            if !raw.is_empty() {
                let shared = Arc::clone(&self.shared);
                let debounce = self.shared.debounce;
                state.pending = Some(tokio::spawn(async move {
                    tokio::time::sleep(debounce).await;
                    shared.commit(generation);
                }));
                return;
            }
            generation
        };

        self.shared.commit(generation);
    }

    /// Commit the pending value now (e.g. on Enter). Returns false when
    /// nothing was pending.
    pub fn flush(&self) -> bool {
        let generation = {
            let mut state = self.shared.state();
            let Some(timer) = state.pending.take() else {
                return false;
            };
            timer.abort();
            state.generation += 1;
            state.generation
        };
        self.shared.commit(generation);
        true
    }

    pub fn session(&self) -> DebounceSession {
        let state = self.shared.state();
        DebounceSession {
            raw_value: state.raw_value.clone(),
            committed_value: state.committed_value.clone(),
            pending: state.pending.is_some(),
            active_fetch_seq: state.active_fetch_seq,
        }
    }
}

impl fmt::Debug for DebouncedSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebouncedSearch")
            .field("debounce", &self.shared.debounce)
            .field("session", &self.session())
            .finish()
    }
}

impl Drop for DebouncedSearch {
    fn drop(&mut self) {
        if let Some(timer) = self.shared.state().pending.take() {
            timer.abort();
        }
    }
}
