//! Process-wide model memory management
//!
//! ML model handles (embedders, cross-encoders, sentence encoders) are
//! large. The manager keeps a registry keyed by model ID with last-used
//! timestamps, evicts least-recently-used handles when the total memory
//! cap is exceeded, sweeps idle handles on a background cycle, and
//! serialises reloads per model ID so a model is never loaded twice
//! concurrently.

use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A loaded model registered with the manager.
///
/// `unload` must release provider-specific resources (GPU buffers,
/// tokenizers); the default is a no-op for handles without any.
pub trait ModelHandle: Send + Sync {
    fn model_id(&self) -> &str;

    fn memory_bytes(&self) -> u64;

    fn unload(&self) {}
}

struct Entry {
    handle: Arc<dyn ModelHandle>,
    last_used: Instant,
}

/// Registry with an LRU eviction policy and idle-timeout sweeping
pub struct ModelMemoryManager {
    entries: Mutex<HashMap<String, Entry>>,
    load_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    max_total_bytes: u64,
    idle_timeout: Duration,
}

impl ModelMemoryManager {
    pub fn new(max_total_bytes: u64, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            load_locks: Mutex::new(HashMap::new()),
            max_total_bytes,
            idle_timeout,
        })
    }

    /// Fetch a registered handle, refreshing its last-used timestamp
    pub async fn get(&self, model_id: &str) -> Option<Arc<dyn ModelHandle>> {
        let mut entries = self.entries.lock().await;
        entries.get_mut(model_id).map(|entry| {
            entry.last_used = Instant::now();
            Arc::clone(&entry.handle)
        })
    }

    /// Register a handle, evicting LRU entries if the cap is exceeded
    pub async fn register(&self, handle: Arc<dyn ModelHandle>) {
        let model_id = handle.model_id().to_string();
        let bytes = handle.memory_bytes();
        {
            let mut entries = self.entries.lock().await;
            entries.insert(
                model_id.clone(),
                Entry {
                    handle,
                    last_used: Instant::now(),
                },
            );
        }
        info!("Registered model {} ({} bytes)", model_id, bytes);
        self.evict_over_cap().await;
    }

    /// Get the handle, loading it through `loader` if absent.
    ///
    /// Loads are serialised per model ID; concurrent callers wait for the
    /// first load instead of loading again.
    pub async fn get_or_load<F, Fut>(
        &self,
        model_id: &str,
        loader: F,
    ) -> Result<Arc<dyn ModelHandle>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn ModelHandle>>>,
    {
        if let Some(handle) = self.get(model_id).await {
            return Ok(handle);
        }

        let lock = {
            let mut locks = self.load_locks.lock().await;
            locks
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Another caller may have finished the load while we waited
        if let Some(handle) = self.get(model_id).await {
            return Ok(handle);
        }

        debug!("Lazily loading model {}", model_id);
        let handle = loader().await?;
        self.register(Arc::clone(&handle)).await;
        Ok(handle)
    }

    /// Drop handles idle beyond the timeout; returns the evicted count
    pub async fn sweep_idle(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let idle: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used) > self.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &idle {
            if let Some(entry) = entries.remove(id) {
                info!("Evicting idle model {}", id);
                entry.handle.unload();
            }
        }
        idle.len()
    }

    async fn evict_over_cap(&self) {
        let mut entries = self.entries.lock().await;
        loop {
            let total: u64 = entries.values().map(|e| e.handle.memory_bytes()).sum();
            if total <= self.max_total_bytes || entries.len() <= 1 {
                break;
            }

            let lru = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            match lru {
                Some(id) => {
                    if let Some(entry) = entries.remove(&id) {
                        warn!(
                            "Memory cap exceeded ({} > {}), evicting {}",
                            total, self.max_total_bytes, id
                        );
                        entry.handle.unload();
                    }
                }
                None => break,
            }
        }
    }

    /// Total bytes held by registered handles
    pub async fn total_bytes(&self) -> u64 {
        let entries = self.entries.lock().await;
        entries.values().map(|e| e.handle.memory_bytes()).sum()
    }

    pub async fn loaded_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Spawn the background eviction sweep
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let evicted = self.sweep_idle().await;
                if evicted > 0 {
                    debug!("Sweeper evicted {} idle model(s)", evicted);
                }
            }
        })
    }
}
