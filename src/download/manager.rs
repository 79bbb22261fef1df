//! Download manager: the table of downloads and its query surface
//!
//! The manager is the only writer of download state. Each key gets its own
//! lock, so concurrent runs never interleave updates to the same download
//! while unrelated keys proceed independently. Content fetches from pooled
//! sources share one semaphore; metadata fetches, event delivery and sources
//! that queue on their own side don't wait on it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock, Semaphore, broadcast};
use tracing::{debug, info, warn};

use super::machine::{Record, Run, Tracker};
use super::{DownloadEvent, DownloadHandle, DownloadKey, Snapshot};
use crate::config::Config;
use crate::error::{DownloadError, Result};
use crate::source::{Kind, Service, SourceSet};
use crate::store::ContentStore;

/// Manager tuning
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Where downloaded audio lands
    pub download_dir: PathBuf,
    /// Content fetches allowed in flight at once
    pub max_concurrent_downloads: usize,
    /// Events buffered per subscriber before it lags
    pub event_buffer: usize,
    /// Max edge of embedded cover art, in pixels
    pub cover_art_size: u32,
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            download_dir: config.download_dir.clone(),
            max_concurrent_downloads: config.max_concurrent_downloads.max(1),
            event_buffer: config.event_buffer.max(1),
            cover_art_size: config.cover_art_size,
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Counts reported by the worker's status message
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub total: usize,
    pub active: usize,
    pub stored_assets: usize,
}

type Slot = Arc<Mutex<Record>>;

#[derive(Default)]
struct Table {
    slots: HashMap<DownloadKey, Slot>,
    /// Most recently started first
    order: Vec<DownloadKey>,
}

struct Inner {
    sources: SourceSet,
    store: ContentStore,
    options: ManagerOptions,
    table: RwLock<Table>,
    events: broadcast::Sender<DownloadEvent>,
    downloads: Arc<Semaphore>,
    runs: AtomicU64,
}

/// Handle to the download table. Clones share it.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(sources: SourceSet, store: ContentStore, options: ManagerOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_buffer.max(1));
        let downloads = Arc::new(Semaphore::new(options.max_concurrent_downloads.max(1)));

        debug!(
            "Download manager ready: {:?}, {} concurrent downloads",
            sources.configured(),
            options.max_concurrent_downloads
        );

        Self {
            inner: Arc::new(Inner {
                sources,
                store,
                options,
                table: RwLock::new(Table::default()),
                events,
                downloads,
                runs: AtomicU64::new(1),
            }),
        }
    }

    pub fn sources(&self) -> &SourceSet {
        &self.inner.sources
    }

    pub fn store(&self) -> &ContentStore {
        &self.inner.store
    }

    /// Start downloading `id`, or return the run already tracking it.
    ///
    /// A new run replaces an existing one only if that run failed and has
    /// nothing left in flight.
    pub async fn start_download(
        &self,
        service: Service,
        kind: Kind,
        id: u64,
    ) -> Result<DownloadHandle> {
        let adapter = self.inner.sources.get(service)?;
        if kind == Kind::Group && !adapter.supports_groups() {
            return Err(DownloadError::invalid_argument(format!(
                "{} does not support releases or playlists",
                service
            )));
        }

        let key = DownloadKey::new(service, kind, id);
        let mut table = self.inner.table.write().await;

        let mut replaced = Vec::new();
        if let Some(slot) = table.slots.get(&key) {
            let record = slot.lock().await;
            let snapshot = record.snapshot(key);
            if !(snapshot.stage == super::Stage::Failed && snapshot.is_finished()) {
                debug!("{} already tracked as run {}", key, record.run);
                return Ok(snapshot.handle());
            }
            replaced = record.download.asset_ids();
            info!("Restarting {} after failure", key);
        }

        let run = self.inner.runs.fetch_add(1, Ordering::SeqCst);
        let slot: Slot = Arc::new(Mutex::new(Record::new(kind, id, run)));
        table.slots.insert(key, slot.clone());
        table.order.retain(|k| *k != key);
        table.order.insert(0, key);

        let tracker = Tracker {
            key,
            slot,
            events: self.inner.events.clone(),
        };
        tracker.publish().await;
        drop(table);

        // References held by the run being replaced
        for asset in replaced {
            if let Err(e) = self.inner.store.release(asset).await {
                warn!("Failed to release asset {}: {}", asset, e);
            }
        }

        info!("Starting {} (run {})", key, run);
        let job = Run {
            tracker,
            adapter,
            store: self.inner.store.clone(),
            downloads: self.inner.downloads.clone(),
            download_dir: self.inner.options.download_dir.clone(),
            cover_art_size: self.inner.options.cover_art_size,
        };
        tokio::spawn(job.execute());

        Ok(DownloadHandle { key, run })
    }

    /// Snapshots of every tracked download, most recently started first
    pub async fn get_all(&self) -> Vec<Snapshot> {
        let table = self.inner.table.read().await;
        let mut snapshots = Vec::with_capacity(table.order.len());
        for key in &table.order {
            if let Some(slot) = table.slots.get(key) {
                snapshots.push(slot.lock().await.snapshot(*key));
            }
        }
        snapshots
    }

    pub async fn get_by_id(&self, key: &DownloadKey) -> Result<Snapshot> {
        let slot = {
            let table = self.inner.table.read().await;
            table.slots.get(key).cloned()
        };
        match slot {
            Some(slot) => Ok(slot.lock().await.snapshot(*key)),
            None => Err(DownloadError::not_found(format!("{} is not tracked", key))),
        }
    }

    /// Events for every key, from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Drop a finished download and release the assets it references
    pub async fn remove(&self, key: &DownloadKey) -> Result<Snapshot> {
        let snapshot = {
            let mut table = self.inner.table.write().await;
            let slot = table
                .slots
                .get(key)
                .cloned()
                .ok_or_else(|| DownloadError::not_found(format!("{} is not tracked", key)))?;

            let record = slot.lock().await;
            let snapshot = record.snapshot(*key);
            if !snapshot.is_finished() {
                return Err(DownloadError::invalid_argument(format!(
                    "{} is still {}",
                    key, snapshot.stage
                )));
            }

            table.slots.remove(key);
            table.order.retain(|k| k != key);
            if self.inner.events.send(DownloadEvent::Removed(*key)).is_err() {
                debug!("No subscribers for removal of {}", key);
            }
            snapshot
        };

        for asset in snapshot.download.asset_ids() {
            self.inner.store.release(asset).await?;
        }

        info!("Removed {}", key);
        Ok(snapshot)
    }

    /// Wait until `key` has nothing left in flight
    pub async fn wait(&self, key: &DownloadKey) -> Result<Snapshot> {
        let mut events = self.subscribe();

        let current = self.get_by_id(key).await?;
        if current.is_finished() {
            return Ok(current);
        }

        loop {
            match events.recv().await {
                Ok(DownloadEvent::Updated(snapshot)) if snapshot.key == *key => {
                    if snapshot.is_finished() {
                        return Ok(snapshot);
                    }
                }
                Ok(DownloadEvent::Removed(removed)) if removed == *key => {
                    return Err(DownloadError::not_found(format!("{} was removed", key)));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("Waiter for {} missed {} events", key, missed);
                    let current = self.get_by_id(key).await?;
                    if current.is_finished() {
                        return Ok(current);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return self.get_by_id(key).await,
            }
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        let snapshots = self.get_all().await;
        ManagerStats {
            total: snapshots.len(),
            active: snapshots.iter().filter(|s| !s.is_finished()).count(),
            stored_assets: self.inner.store.len().await,
        }
    }
}
