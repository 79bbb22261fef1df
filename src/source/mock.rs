//! Scripted in-memory adapter for pipeline tests

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use super::{ContentInfo, GroupMetadata, Progress, Service, SourceAdapter, TrackMetadata};
use crate::error::{DownloadError, Result};

/// Scripted outcome of a content fetch
#[derive(Debug, Clone)]
pub struct ScriptedContent {
    pub progress: Vec<f64>,
    pub result: Result<Vec<u8>>,
}

/// Adapter that replays canned responses
pub struct ScriptedSource {
    service: Service,
    groups_supported: bool,
    tracks: Mutex<HashMap<u64, Result<TrackMetadata>>>,
    groups: Mutex<HashMap<u64, Result<GroupMetadata>>>,
    contents: Mutex<HashMap<String, ScriptedContent>>,
    artwork: Mutex<HashMap<String, Bytes>>,
    metadata_gate: Option<Arc<Semaphore>>,
    content_gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    pub metadata_calls: AtomicUsize,
    pub content_calls: AtomicUsize,
}

/// Minimal track metadata for tests
pub fn track_meta(source_id: &str, title: &str) -> TrackMetadata {
    TrackMetadata {
        source_id: source_id.to_string(),
        title: title.to_string(),
        artists: vec!["Test Artist".to_string()],
        album: None,
        album_artists: vec![],
        track_number: None,
        duration_ms: Some(1000),
        artwork_url: None,
        extension: "mp3".to_string(),
        size: None,
    }
}

/// Group metadata built from track ids
pub fn group_meta(source_id: &str, track_ids: &[&str]) -> GroupMetadata {
    let mut group = GroupMetadata {
        source_id: source_id.to_string(),
        title: format!("Release {}", source_id),
        artists: vec!["Test Artist".to_string()],
        artwork_url: None,
        tracks: Vec::new(),
    };
    group.tracks = track_ids
        .iter()
        .enumerate()
        .map(|(i, id)| track_meta(id, &format!("Track {}", id)).in_group(&group, i))
        .collect();
    group
}

impl ScriptedSource {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            groups_supported: false,
            tracks: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            contents: Mutex::new(HashMap::new()),
            artwork: Mutex::new(HashMap::new()),
            metadata_gate: None,
            content_gates: Mutex::new(HashMap::new()),
            metadata_calls: AtomicUsize::new(0),
            content_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_groups(mut self) -> Self {
        self.groups_supported = true;
        self
    }

    pub fn track(self, id: u64, meta: TrackMetadata) -> Self {
        self.tracks.lock().unwrap().insert(id, Ok(meta));
        self
    }

    pub fn track_error(self, id: u64, error: DownloadError) -> Self {
        self.tracks.lock().unwrap().insert(id, Err(error));
        self
    }

    pub fn group(self, id: u64, meta: GroupMetadata) -> Self {
        self.groups.lock().unwrap().insert(id, Ok(meta));
        self
    }

    pub fn group_error(self, id: u64, error: DownloadError) -> Self {
        self.groups.lock().unwrap().insert(id, Err(error));
        self
    }

    pub fn content(self, source_id: &str, progress: &[f64], bytes: &[u8]) -> Self {
        self.contents.lock().unwrap().insert(
            source_id.to_string(),
            ScriptedContent {
                progress: progress.to_vec(),
                result: Ok(bytes.to_vec()),
            },
        );
        self
    }

    pub fn content_error(self, source_id: &str, progress: &[f64], error: DownloadError) -> Self {
        self.contents.lock().unwrap().insert(
            source_id.to_string(),
            ScriptedContent {
                progress: progress.to_vec(),
                result: Err(error),
            },
        );
        self
    }

    pub fn artwork(self, source_id: &str, bytes: &[u8]) -> Self {
        self.artwork
            .lock()
            .unwrap()
            .insert(source_id.to_string(), Bytes::copy_from_slice(bytes));
        self
    }

    /// Hold every metadata fetch until the semaphore gets a permit
    pub fn with_metadata_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.metadata_gate = Some(gate);
        self
    }

    /// Hold the content fetch of one track until the semaphore gets a permit
    pub fn with_content_gate(self, source_id: &str, gate: Arc<Semaphore>) -> Self {
        self.content_gates
            .lock()
            .unwrap()
            .insert(source_id.to_string(), gate);
        self
    }

    async fn pass_metadata_gate(&self) {
        if let Some(gate) = &self.metadata_gate {
            let _permit = gate.acquire().await;
        }
    }
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    fn service(&self) -> Service {
        self.service
    }

    fn supports_groups(&self) -> bool {
        self.groups_supported
    }

    // Same split as the real adapters
    fn uses_download_pool(&self) -> bool {
        self.service != Service::Soulseek
    }

    async fn fetch_metadata(&self, id: u64) -> Result<TrackMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_metadata_gate().await;
        self.tracks
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Err(DownloadError::not_found(format!("track {}", id))))
    }

    async fn fetch_group_metadata(&self, id: u64) -> Result<GroupMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_metadata_gate().await;
        self.groups
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Err(DownloadError::not_found(format!("group {}", id))))
    }

    async fn fetch_content(
        &self,
        track: &TrackMetadata,
        dest: &Path,
        on_progress: Progress<'_>,
    ) -> Result<ContentInfo> {
        self.content_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.content_gates.lock().unwrap().get(&track.source_id).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }

        let script = self
            .contents
            .lock()
            .unwrap()
            .get(&track.source_id)
            .cloned()
            .unwrap_or_else(|| ScriptedContent {
                progress: vec![1.0],
                result: Ok(format!("audio:{}", track.source_id).into_bytes()),
            });

        for fraction in &script.progress {
            on_progress(*fraction);
            tokio::task::yield_now().await;
        }

        let bytes = script.result?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(ContentInfo {
            bytes: bytes.len() as u64,
        })
    }

    async fn fetch_artwork(&self, track: &TrackMetadata) -> Result<Option<Bytes>> {
        Ok(self.artwork.lock().unwrap().get(&track.source_id).cloned())
    }
}
