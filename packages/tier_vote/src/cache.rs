//! Bounded, least-recently-used cache of live editors.
//!
//! The cache is the only way to reach an [`Editor`]. A miss calls the
//! injected [`EditorLoader`] once per key no matter how many callers arrive
//! concurrently. Going over capacity evicts the least recently used editor
//! and saves it in the background. Evicted editors are remembered weakly:
//! while anything still holds one (a caller, its eviction save, a pending
//! debounced save) a new request revives it instead of loading a second
//! editor from state that is about to be overwritten.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::editor::{Editor, EditorContext};
use crate::metrics::IngestMetrics;

pub type EditorLoader =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Arc<Editor>>> + Send + Sync>;

/// A loader that reads state through [`Editor::load`].
pub fn store_loader(ctx: EditorContext) -> EditorLoader {
    Arc::new(move |channel_id: String| {
        let ctx = ctx.clone();
        Box::pin(async move { Editor::load(&channel_id, ctx).await })
    })
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub save_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            save_delay: Duration::from_secs(5),
        }
    }
}

struct Entry {
    editor: Arc<Editor>,
    last_used: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    loading: HashMap<String, Arc<OnceCell<Arc<Editor>>>>,
    /// Evicted editors that may still be alive.
    retiring: HashMap<String, Weak<Editor>>,
    tick: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Insert `editor` and return whatever had to be evicted to make room.
    fn insert(&mut self, channel_id: &str, editor: Arc<Editor>, capacity: usize) -> Vec<Arc<Editor>> {
        let last_used = self.next_tick();
        self.entries
            .insert(channel_id.to_string(), Entry { editor, last_used });

        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            let oldest = self
                .entries
                .iter()
                .filter(|(id, _)| id.as_str() != channel_id)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| id.clone());
            let Some(oldest) = oldest else { break };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.retiring.insert(oldest, Arc::downgrade(&entry.editor));
                evicted.push(entry.editor);
            }
        }
        if !evicted.is_empty() {
            self.retiring.retain(|_, editor| editor.strong_count() > 0);
        }
        evicted
    }
}

pub struct StateCache {
    capacity: usize,
    loader: EditorLoader,
    metrics: Arc<IngestMetrics>,
    inner: Arc<Mutex<Inner>>,
}

impl StateCache {
    pub fn new(capacity: usize, loader: EditorLoader, metrics: Arc<IngestMetrics>) -> Self {
        Self {
            capacity: capacity.max(1),
            loader,
            metrics,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.inner.lock().entries.contains_key(channel_id)
    }

    /// The channel's editor, loading it on a miss.
    pub async fn get_editor(&self, channel_id: &str) -> Result<Arc<Editor>> {
        let cell = {
            let mut inner = self.inner.lock();
            let tick = inner.next_tick();
            if let Some(entry) = inner.entries.get_mut(channel_id) {
                entry.last_used = tick;
                return Ok(entry.editor.clone());
            }
            if let Some(editor) = inner.retiring.remove(channel_id).and_then(|w| w.upgrade()) {
                debug!(channel_id, "reviving evicted editor");
                let evicted = inner.insert(channel_id, editor.clone(), self.capacity);
                drop(inner);
                self.retire(evicted);
                return Ok(editor);
            }
            inner
                .loading
                .entry(channel_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let loaded = cell
            .get_or_try_init(|| (self.loader)(channel_id.to_string()))
            .await
            .cloned();

        // Waiters on a failed cell retry through it. After a success only the
        // first caller back publishes the editor.
        let evicted = match &loaded {
            Ok(editor) => {
                let mut inner = self.inner.lock();
                let owns_cell = inner
                    .loading
                    .get(channel_id)
                    .is_some_and(|c| Arc::ptr_eq(c, &cell));
                if owns_cell {
                    inner.loading.remove(channel_id);
                    debug!(channel_id, "editor cached");
                    inner.insert(channel_id, editor.clone(), self.capacity)
                } else {
                    Vec::new()
                }
            }
            Err(e) => {
                warn!(channel_id, error = %e, "failed to load editor");
                // Drop the cell once no other caller is still waiting on it.
                let mut inner = self.inner.lock();
                let idle_cell = inner
                    .loading
                    .get(channel_id)
                    .is_some_and(|c| Arc::ptr_eq(c, &cell) && Arc::strong_count(c) == 2);
                if idle_cell {
                    inner.loading.remove(channel_id);
                }
                Vec::new()
            }
        };
        self.retire(evicted);

        loaded
    }

    fn retire(&self, evicted: Vec<Arc<Editor>>) {
        for editor in evicted {
            self.metrics.evicted();
            info!(channel_id = %editor.channel_id(), "evicting editor");
            let inner = self.inner.clone();
            tokio::spawn(async move {
                // Save failures are logged by the editor.
                let _ = editor.save().await;
                let channel_id = editor.channel_id().to_string();
                let weak = Arc::downgrade(&editor);
                drop(editor);
                let mut inner = inner.lock();
                let forgotten = inner
                    .retiring
                    .get(&channel_id)
                    .is_some_and(|r| r.ptr_eq(&weak) && r.strong_count() == 0);
                if forgotten {
                    inner.retiring.remove(&channel_id);
                }
            });
        }
    }

    /// Save every live editor now. Returns how many saves succeeded.
    pub async fn flush_all(&self) -> Result<usize> {
        let editors: Vec<Arc<Editor>> = {
            let inner = self.inner.lock();
            inner
                .entries
                .values()
                .map(|e| e.editor.clone())
                .chain(inner.retiring.values().filter_map(Weak::upgrade))
                .collect()
        };
        let total = editors.len();
        let results = join_all(editors.iter().map(|e| e.save())).await;
        let saved = results.iter().filter(|r| r.is_ok()).count();
        if saved < total {
            warn!(saved, total, "some editors failed to flush");
            anyhow::bail!("{} of {} editors failed to save", total - saved, total);
        }
        info!(saved, "flushed all editors");
        Ok(saved)
    }
}
