//! Soulseek adapter, driven through an slskd daemon's REST API
//!
//! Soulseek has no notion of releases here, only single shared files. The host
//! registers each file (peer + remote path + size) under a catalog id first.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, warn};
use url::Url;

use super::{
    ContentInfo, Kind, Progress, Service, SourceAdapter, TrackMetadata, UpstreamRef,
    UpstreamRefs, check_status, parse_artist_title,
};
use crate::error::{DownloadError, Result};

/// How often transfer state is polled
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A transfer that makes no progress for this long is given up on
const STALL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Serialize)]
struct EnqueueFile<'a> {
    filename: &'a str,
    size: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Transfer {
    filename: String,
    state: String,
    #[serde(default)]
    percent_complete: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct TransferDirectory {
    #[serde(default)]
    files: Vec<Transfer>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserTransfers {
    #[serde(default)]
    directories: Vec<TransferDirectory>,
}

/// Where a transfer currently stands
#[derive(Debug, Clone, PartialEq)]
enum TransferState {
    Pending(f64),
    Succeeded,
    Failed(String),
}

fn classify(transfer: &Transfer) -> TransferState {
    if transfer.state.contains("Succeeded") {
        TransferState::Succeeded
    } else if transfer.state.starts_with("Completed") {
        TransferState::Failed(transfer.state.clone())
    } else {
        TransferState::Pending((transfer.percent_complete / 100.0).clamp(0.0, 1.0))
    }
}

/// Tracks how long a transfer has gone without progress
#[derive(Debug, Clone, Copy)]
struct StallWatch {
    best: f64,
    since: Instant,
}

impl StallWatch {
    fn new(now: Instant) -> Self {
        Self { best: 0.0, since: now }
    }

    /// Record a poll; true once nothing has moved for `STALL_TIMEOUT`
    fn stalled(&mut self, fraction: f64, now: Instant) -> bool {
        if fraction > self.best {
            self.best = fraction;
            self.since = now;
        }
        now.duration_since(self.since) >= STALL_TIMEOUT
    }
}

/// Remote paths use either separator depending on the peer's OS
fn path_components(remote: &str) -> Vec<&str> {
    remote
        .split(['\\', '/'])
        .filter(|c| !c.is_empty())
        .collect()
}

fn file_name(remote: &str) -> &str {
    path_components(remote).last().copied().unwrap_or(remote)
}

/// slskd stores completed files as `{downloads}/{parent dir}/{file name}`
fn local_transfer_path(downloads_dir: &Path, remote: &str) -> PathBuf {
    let components = path_components(remote);
    match components.as_slice() {
        [.., parent, name] => downloads_dir.join(parent).join(name),
        [name] => downloads_dir.join(name),
        [] => downloads_dir.join(remote),
    }
}

fn track_metadata(id: u64, filename: &str, size: u64) -> TrackMetadata {
    let name = file_name(filename);
    let (stem, extension) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext.to_lowercase()),
        _ => (name, "mp3".to_string()),
    };
    let (artists, title) = parse_artist_title(stem);
    let artists = artists.unwrap_or_default();

    TrackMetadata {
        source_id: id.to_string(),
        album: None,
        album_artists: artists.clone(),
        title,
        artists,
        track_number: None,
        duration_ms: None,
        artwork_url: None,
        extension,
        size: Some(size),
    }
}

/// slskd REST client
pub struct SoulseekSource {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
    downloads_dir: PathBuf,
    refs: UpstreamRefs,
}

impl SoulseekSource {
    /// Create a new Soulseek adapter
    pub fn new(
        slskd_url: &str,
        api_key: Option<String>,
        downloads_dir: PathBuf,
        refs: UpstreamRefs,
    ) -> anyhow::Result<Self> {
        let base_url = Url::parse(slskd_url.trim_end_matches('/'))
            .map_err(|e| anyhow::anyhow!("Invalid slskd URL: {}", e))?;

        Ok(Self {
            http: super::http_client()?,
            base_url,
            api_key,
            downloads_dir,
            refs,
        })
    }

    fn shared_file(&self, id: u64) -> Result<(String, String, u64)> {
        match self.refs.resolve(Service::Soulseek, Kind::Track, id)? {
            UpstreamRef::SoulseekFile {
                username,
                filename,
                size,
            } => Ok((username, filename, size)),
            other => Err(DownloadError::invalid_argument(format!(
                "{:?} is not a Soulseek file",
                other
            ))),
        }
    }

    fn transfers_url(&self, username: &str) -> String {
        format!(
            "{}/api/v0/transfers/downloads/{}",
            self.base_url.as_str().trim_end_matches('/'),
            urlencoding::encode(username)
        )
    }

    fn with_key(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-API-Key", key),
            None => request,
        }
    }

    async fn enqueue(&self, username: &str, filename: &str, size: u64) -> Result<()> {
        let url = self.transfers_url(username);
        debug!("Enqueueing {} from {}", filename, username);
        let response = self
            .with_key(self.http.post(&url))
            .json(&[EnqueueFile { filename, size }])
            .send()
            .await?;
        check_status(response, "Failed to enqueue Soulseek download")?;
        Ok(())
    }

    async fn transfer(&self, username: &str, filename: &str) -> Result<Option<Transfer>> {
        let url = self.transfers_url(username);
        let response = self.with_key(self.http.get(&url)).send().await?;
        let response = check_status(response, "Failed to read Soulseek transfers")?;
        let transfers: UserTransfers = response
            .json()
            .await
            .map_err(|e| DownloadError::transient(format!("Bad transfer listing: {}", e)))?;

        Ok(transfers
            .directories
            .into_iter()
            .flat_map(|d| d.files)
            .find(|t| t.filename == filename))
    }

    /// Move a finished transfer into place, copying across filesystems
    async fn move_into_place(&self, from: &Path, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::rename(from, dest).await.is_err() {
            fs::copy(from, dest).await?;
            if let Err(e) = fs::remove_file(from).await {
                warn!("Failed to remove {}: {}", from.display(), e);
            }
        }
        Ok(fs::metadata(dest).await?.len())
    }
}

#[async_trait]
impl SourceAdapter for SoulseekSource {
    fn service(&self) -> Service {
        Service::Soulseek
    }

    // slskd queues and throttles transfers itself
    fn uses_download_pool(&self) -> bool {
        false
    }

    fn file_stem(&self, track: &TrackMetadata) -> String {
        let remote = track
            .source_id
            .parse()
            .ok()
            .and_then(|id| self.shared_file(id).ok())
            .map(|(_, filename, _)| filename)
            .unwrap_or_else(|| track.source_id.clone());

        let digest = Sha256::digest(remote.as_bytes());
        format!("{}-{}", Service::Soulseek.file_prefix(), &hex::encode(digest)[..8])
    }

    async fn fetch_metadata(&self, id: u64) -> Result<TrackMetadata> {
        let (_, filename, size) = self.shared_file(id)?;
        Ok(track_metadata(id, &filename, size))
    }

    async fn fetch_content(
        &self,
        track: &TrackMetadata,
        dest: &Path,
        on_progress: Progress<'_>,
    ) -> Result<ContentInfo> {
        let id: u64 = track.source_id.parse().map_err(|_| {
            DownloadError::invalid_argument(format!("Bad Soulseek id {}", track.source_id))
        })?;
        let (username, filename, size) = self.shared_file(id)?;

        self.enqueue(&username, &filename, size).await?;

        let mut watch = StallWatch::new(Instant::now());
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let transfer = self
                .transfer(&username, &filename)
                .await?
                .ok_or_else(|| DownloadError::transient("Soulseek transfer disappeared"))?;

            match classify(&transfer) {
                TransferState::Pending(fraction) => {
                    if watch.stalled(fraction, Instant::now()) {
                        return Err(DownloadError::transient(format!(
                            "Soulseek transfer from {} stalled in state {}",
                            username, transfer.state
                        )));
                    }
                    on_progress(fraction);
                }
                TransferState::Succeeded => break,
                TransferState::Failed(state) => {
                    return Err(DownloadError::incomplete(format!(
                        "Soulseek transfer ended as {}",
                        state
                    )));
                }
            }
        }

        let local = local_transfer_path(&self.downloads_dir, &filename);
        if !local.exists() {
            return Err(DownloadError::io(format!(
                "Completed transfer not found at {}",
                local.display()
            )));
        }

        let bytes = self.move_into_place(&local, dest).await?;
        if bytes == 0 {
            return Err(DownloadError::incomplete("Downloaded file is 0 bytes"));
        }
        if bytes < size {
            return Err(DownloadError::incomplete(format!(
                "Received {} of {} bytes",
                bytes, size
            )));
        }

        on_progress(1.0);
        Ok(ContentInfo { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(state: &str, percent: f64) -> Transfer {
        Transfer {
            filename: "x".to_string(),
            state: state.to_string(),
            percent_complete: percent,
        }
    }

    #[test]
    fn test_classify_transfer_states() {
        assert_eq!(classify(&transfer("InProgress", 40.0)), TransferState::Pending(0.4));
        assert_eq!(classify(&transfer("Queued, Remotely", 0.0)), TransferState::Pending(0.0));
        assert_eq!(
            classify(&transfer("Completed, Succeeded", 100.0)),
            TransferState::Succeeded
        );
        assert!(matches!(
            classify(&transfer("Completed, Rejected", 0.0)),
            TransferState::Failed(_)
        ));
    }

    #[test]
    fn test_stall_watch_resets_on_progress() {
        let start = Instant::now();
        let mut watch = StallWatch::new(start);

        assert!(!watch.stalled(0.0, start + STALL_TIMEOUT / 2));
        // Progress restarts the clock
        assert!(!watch.stalled(0.3, start + STALL_TIMEOUT / 2));
        assert!(!watch.stalled(0.3, start + STALL_TIMEOUT));
        assert!(watch.stalled(0.3, start + STALL_TIMEOUT / 2 + STALL_TIMEOUT));
    }

    #[test]
    fn test_queued_transfer_stalls() {
        let start = Instant::now();
        let mut watch = StallWatch::new(start);
        assert!(watch.stalled(0.0, start + STALL_TIMEOUT));
    }

    #[test]
    fn test_stays_out_of_download_pool() {
        let source = SoulseekSource::new(
            "http://localhost:5030",
            None,
            PathBuf::from("/srv/slskd"),
            UpstreamRefs::new(),
        )
        .unwrap();
        assert!(!source.uses_download_pool());
    }

    #[test]
    fn test_local_transfer_path() {
        let path = local_transfer_path(
            Path::new("/srv/slskd"),
            "@@music\\Artist\\Album\\01 - Song.flac",
        );
        assert_eq!(path, PathBuf::from("/srv/slskd/Album/01 - Song.flac"));
    }

    #[test]
    fn test_metadata_from_filename() {
        let meta = track_metadata(3, "share/Boards of Canada - Roygbiv.FLAC", 1024);
        assert_eq!(meta.title, "Roygbiv");
        assert_eq!(meta.artists, vec!["Boards of Canada".to_string()]);
        assert_eq!(meta.extension, "flac");
        assert_eq!(meta.size, Some(1024));
        assert_eq!(meta.source_id, "3");
    }

    #[test]
    fn test_file_stem_hashes_remote_path() {
        let refs = UpstreamRefs::new();
        refs.register(
            3,
            UpstreamRef::SoulseekFile {
                username: "peer".into(),
                filename: "a\\b.mp3".into(),
                size: 10,
            },
        );
        let source =
            SoulseekSource::new("http://localhost:5030", None, PathBuf::from("/tmp"), refs)
                .unwrap();
        let meta = track_metadata(3, "a\\b.mp3", 10);

        let stem = source.file_stem(&meta);
        assert!(stem.starts_with("slsk-"));
        assert_eq!(stem.len(), "slsk-".len() + 8);
    }

    #[tokio::test]
    async fn test_groups_are_rejected() {
        let source = SoulseekSource::new(
            "http://localhost:5030",
            None,
            PathBuf::from("/tmp"),
            UpstreamRefs::new(),
        )
        .unwrap();
        assert!(!source.supports_groups());
        let err = source.fetch_group_metadata(1).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }
}
