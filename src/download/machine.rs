//! Download state machine runs
//!
//! One run drives one key: a track straight through its stages, or a group
//! through its metadata fetch and then every child track concurrently. Each
//! step goes through a [`Tracker`], which applies the change under the key's
//! lock and publishes the resulting snapshot. Errors never leave a run; they
//! become the `failed` stage of whatever was in progress.

use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, broadcast, watch};
use tracing::{debug, info, warn};

use super::{
    Download, DownloadEvent, DownloadItem, DownloadKey, GroupPhase, ItemState, Snapshot,
};
use crate::error::{DownloadError, FailureInfo, Result};
use crate::source::{Kind, SourceAdapter, TrackMetadata};
use crate::store::{ContentStore, StoredAsset};
use crate::tags::{self, TrackTags};

/// A key's slot in the download table
pub(crate) struct Record {
    pub run: u64,
    pub started_at: chrono::DateTime<Utc>,
    pub download: Download,
}

impl Record {
    pub fn new(kind: Kind, id: u64, run: u64) -> Self {
        Self {
            run,
            started_at: Utc::now(),
            download: Download::new(kind, id),
        }
    }

    pub fn snapshot(&self, key: DownloadKey) -> Snapshot {
        Snapshot {
            key,
            run: self.run,
            started_at: self.started_at,
            stage: self.download.stage(),
            download: self.download.clone(),
        }
    }
}

/// Applies changes to one key and publishes them
#[derive(Clone)]
pub(crate) struct Tracker {
    pub key: DownloadKey,
    pub slot: Arc<Mutex<Record>>,
    pub events: broadcast::Sender<DownloadEvent>,
}

impl Tracker {
    /// Run `change` under the key's lock; publish if it reports a change.
    ///
    /// Publishing happens before the lock is released, so observers see a
    /// key's events in the order they were produced.
    pub async fn update(&self, change: impl FnOnce(&mut Download) -> bool) -> bool {
        let mut record = self.slot.lock().await;
        if !change(&mut record.download) {
            return false;
        }

        let snapshot = record.snapshot(self.key);
        debug!("{} is now {}", self.key, snapshot.stage);
        if self.events.send(DownloadEvent::Updated(snapshot)).is_err() {
            debug!("No subscribers for {}", self.key);
        }
        true
    }

    /// Publish the current state without changing it
    pub async fn publish(&self) {
        self.update(|_| true).await;
    }

    async fn advance_item(&self, at: Position, next: ItemState) -> bool {
        self.update(|download| match item_at(download, at) {
            Some(item) => item.advance(next),
            None => false,
        })
        .await
    }

    async fn set_progress(&self, at: Position, fraction: f64) -> bool {
        self.update(|download| match item_at(download, at) {
            Some(item) => item.set_progress(fraction),
            None => false,
        })
        .await
    }

    async fn advance_group(&self, next: GroupPhase) -> bool {
        self.update(|download| match download {
            Download::Group(group) => group.advance(next),
            Download::Item(_) => false,
        })
        .await
    }
}

/// Which item of a download a step applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Position {
    /// The download is a single track
    Root,
    /// A track of a group, by index
    Track(usize),
}

fn item_at(download: &mut Download, at: Position) -> Option<&mut DownloadItem> {
    match (download, at) {
        (Download::Item(item), Position::Root) => Some(item),
        (Download::Group(group), Position::Track(index)) => group.tracks.get_mut(index),
        _ => None,
    }
}

/// Everything a run needs besides its key
#[derive(Clone)]
pub(crate) struct Run {
    pub tracker: Tracker,
    pub adapter: Arc<dyn SourceAdapter>,
    pub store: ContentStore,
    /// Bounds concurrent content fetches across all runs
    pub downloads: Arc<Semaphore>,
    pub download_dir: PathBuf,
    pub cover_art_size: u32,
}

impl Run {
    fn key(&self) -> DownloadKey {
        self.tracker.key
    }

    /// Drive the key to a terminal stage
    pub async fn execute(self) {
        match self.key().kind {
            Kind::Track => self.run_track(Position::Root, None).await,
            Kind::Group => self.run_group().await,
        }

        let record = self.tracker.slot.lock().await;
        info!("{} finished as {}", self.key(), record.download.stage());
    }

    async fn run_group(&self) {
        let key = self.key();
        self.tracker.advance_group(GroupPhase::FetchingMetadata).await;

        let metadata = match self.adapter.fetch_group_metadata(key.id).await {
            Ok(metadata) => metadata.dedup_tracks(),
            Err(e) => {
                warn!("{} failed: {}", key, e);
                self.tracker
                    .advance_group(GroupPhase::Failed {
                        error: FailureInfo::from(&e),
                    })
                    .await;
                return;
            }
        };

        let tracks = metadata.tracks.clone();
        debug!("{} has {} tracks", key, tracks.len());

        // Track list and phase change together so no snapshot shows one without the other
        self.tracker
            .update(|download| match download {
                Download::Group(group) => {
                    group.tracks = tracks
                        .iter()
                        .map(|t| DownloadItem::new(t.source_id.clone()))
                        .collect();
                    group.advance(GroupPhase::FetchedMetadata { metadata })
                }
                Download::Item(_) => false,
            })
            .await;

        join_all(
            tracks
                .into_iter()
                .enumerate()
                .map(|(index, track)| self.run_track(Position::Track(index), Some(track))),
        )
        .await;
    }

    /// Drive one track. Group members arrive with their metadata already known.
    async fn run_track(&self, at: Position, known: Option<TrackMetadata>) {
        let key = self.key();
        self.tracker
            .advance_item(at, ItemState::FetchingMetadata)
            .await;

        let metadata = match known {
            Some(metadata) => metadata,
            None => match self.adapter.fetch_metadata(key.id).await {
                Ok(metadata) => metadata,
                Err(e) => return self.fail(at, e, None, None).await,
            },
        };

        self.tracker
            .advance_item(
                at,
                ItemState::FetchedMetadata {
                    metadata: metadata.clone(),
                },
            )
            .await;

        let path = self.destination(&metadata);
        self.tracker
            .advance_item(
                at,
                ItemState::Downloading {
                    metadata: metadata.clone(),
                    path: path.clone(),
                    progress: 0.0,
                },
            )
            .await;

        if let Err(e) = self.fetch_content(at, &metadata, &path).await {
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial {}: {}", path.display(), rm);
                }
            }
            return self.fail(at, e, Some(metadata), Some(path)).await;
        }

        let cover_art = match self.finish_file(&metadata, &path).await {
            Ok(cover_art) => cover_art,
            Err(e) => return self.fail(at, e, Some(metadata), Some(path)).await,
        };

        self.tracker
            .advance_item(
                at,
                ItemState::Downloaded {
                    metadata,
                    path,
                    cover_art,
                },
            )
            .await;
    }

    /// Fetch content, forwarding progress as it arrives.
    ///
    /// Progress goes through a watch channel: a burst of callbacks collapses
    /// into the latest value, and a slow lock never stalls the adapter.
    async fn fetch_content(&self, at: Position, metadata: &TrackMetadata, path: &Path) -> Result<()> {
        let (tx, mut rx) = watch::channel(0.0_f64);
        let on_progress = move |fraction: f64| {
            let fraction = fraction.clamp(0.0, 1.0);
            tx.send_if_modified(|current| {
                if fraction > *current {
                    *current = fraction;
                    true
                } else {
                    false
                }
            });
        };

        let fetch = async {
            let _permit = if self.adapter.uses_download_pool() {
                let permit = self
                    .downloads
                    .acquire()
                    .await
                    .map_err(|_| DownloadError::io("Download pool is closed"))?;
                Some(permit)
            } else {
                None
            };
            self.adapter.fetch_content(metadata, path, &on_progress).await
        };
        tokio::pin!(fetch);

        let result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                Ok(()) = rx.changed() => {
                    let fraction = *rx.borrow_and_update();
                    self.tracker.set_progress(at, fraction).await;
                }
            }
        };

        // Whatever arrived after the last forwarded value
        if rx.has_changed().unwrap_or(false) {
            let fraction = *rx.borrow_and_update();
            self.tracker.set_progress(at, fraction).await;
        }

        let info = result?;
        debug!("{} wrote {} bytes to {}", self.key(), info.bytes, path.display());
        self.tracker.set_progress(at, 1.0).await;
        Ok(())
    }

    /// Tag the file and hand its cover art to the content store
    async fn finish_file(
        &self,
        metadata: &TrackMetadata,
        path: &Path,
    ) -> Result<Option<StoredAsset>> {
        let artwork = match self.adapter.fetch_artwork(metadata).await {
            Ok(Some(bytes)) => Some(bytes.to_vec()),
            Ok(None) => None,
            Err(e) => {
                warn!("No artwork for {}: {}", metadata.title, e);
                None
            }
        };
        let artwork = match artwork {
            Some(bytes) => Some(bytes),
            None => tags::read_cover_art_async(path.to_path_buf()).await,
        };

        if let Err(e) = tags::write_tags_async(
            path.to_path_buf(),
            TrackTags::from(metadata),
            artwork.clone(),
            self.cover_art_size,
        )
        .await
        {
            warn!("Failed to tag {}: {:#}", path.display(), e);
        }

        match artwork {
            Some(bytes) => Ok(Some(self.store.store(&bytes).await?)),
            None => Ok(None),
        }
    }

    async fn fail(
        &self,
        at: Position,
        error: DownloadError,
        metadata: Option<TrackMetadata>,
        path: Option<PathBuf>,
    ) {
        warn!("{} failed: {}", self.key(), error);
        self.tracker
            .advance_item(
                at,
                ItemState::Failed {
                    error: FailureInfo::from(&error),
                    metadata,
                    path,
                },
            )
            .await;
    }

    /// `{download_dir}/{stem}-{unix millis}-{0..9}.{ext}`
    fn destination(&self, metadata: &TrackMetadata) -> PathBuf {
        let suffix: u8 = rand::thread_rng().gen_range(0..10);
        self.download_dir.join(format!(
            "{}-{}-{}.{}",
            self.adapter.file_stem(metadata),
            Utc::now().timestamp_millis(),
            suffix,
            metadata.extension
        ))
    }
}
