//! Source adapters: one integration per external music service
//!
//! Every service implements [`SourceAdapter`]. The pipeline only ever sees the
//! trait; [`SourceSet`] dispatches on [`Service`] to find the adapter for a
//! request, so adding a service never touches the state machine.

pub mod models;
pub mod soulseek;
pub mod soundcloud;
pub mod spotify;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::{Config, Credentials};
use crate::error::{DownloadError, Result};

pub use models::{ContentInfo, GroupMetadata, TrackMetadata, parse_artist_title};
pub use soulseek::SoulseekSource;
pub use soundcloud::SoundcloudSource;
pub use spotify::SpotifySource;

/// User agent sent by every adapter
pub const USER_AGENT: &str = concat!("tunefetch/", env!("CARGO_PKG_VERSION"));

/// Progress callback handed to [`SourceAdapter::fetch_content`]
pub type Progress<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// External services the pipeline can acquire from
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Soundcloud,
    Spotify,
    Soulseek,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::Soundcloud, Service::Spotify, Service::Soulseek];

    /// Prefix of materialized file names
    pub fn file_prefix(self) -> &'static str {
        match self {
            Service::Soundcloud => "sc",
            Service::Spotify => "spot",
            Service::Soulseek => "slsk",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Service::Soundcloud => "soundcloud",
            Service::Spotify => "spotify",
            Service::Soulseek => "soulseek",
        };
        f.write_str(name)
    }
}

/// Whether a request targets a single track or a release/playlist
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Track,
    Group,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Track => "track",
            Kind::Group => "group",
        })
    }
}

/// The upstream object a numeric catalog id stands for.
///
/// SoundCloud ids are numeric upstream and need no registration. Spotify ids
/// are base62 strings and Soulseek files are addressed by peer and path, so
/// the host registers them under a catalog id before requesting a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpstreamRef {
    #[serde(rename_all = "camelCase")]
    SpotifyTrack { spotify_id: String },
    #[serde(rename_all = "camelCase")]
    SpotifyAlbum { spotify_id: String },
    #[serde(rename_all = "camelCase")]
    SoulseekFile {
        username: String,
        filename: String,
        size: u64,
    },
}

impl UpstreamRef {
    /// Service and kind this reference can be requested as
    pub fn target(&self) -> (Service, Kind) {
        match self {
            UpstreamRef::SpotifyTrack { .. } => (Service::Spotify, Kind::Track),
            UpstreamRef::SpotifyAlbum { .. } => (Service::Spotify, Kind::Group),
            UpstreamRef::SoulseekFile { .. } => (Service::Soulseek, Kind::Track),
        }
    }
}

/// Shared catalog-id → upstream-object lookup
#[derive(Debug, Clone, Default)]
pub struct UpstreamRefs {
    inner: Arc<RwLock<HashMap<(Service, Kind, u64), UpstreamRef>>>,
}

impl UpstreamRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) what `id` refers to
    pub fn register(&self, id: u64, upstream: UpstreamRef) {
        let (service, kind) = upstream.target();
        debug!("Registered {} {} {} -> {:?}", service, kind, id, upstream);
        // A panicked writer cannot leave the map half-updated; keep using it
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert((service, kind, id), upstream);
    }

    /// Resolve a catalog id, failing with `NotFound` when it was never registered
    pub fn resolve(&self, service: Service, kind: Kind, id: u64) -> Result<UpstreamRef> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(&(service, kind, id))
            .cloned()
            .ok_or_else(|| {
                DownloadError::not_found(format!("{} {} {} is not registered", service, kind, id))
            })
    }
}

/// Capability set every external service implements
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// The service this adapter talks to
    fn service(&self) -> Service;

    /// Whether releases/playlists can be fetched
    fn supports_groups(&self) -> bool {
        false
    }

    /// Whether content fetches take a slot in the shared download pool.
    /// Sources that queue transfers on their own side keep out of it, so a
    /// transfer waiting on a remote peer never holds up other services.
    fn uses_download_pool(&self) -> bool {
        true
    }

    /// Stem of the materialized file name, before the timestamp suffix
    fn file_stem(&self, track: &TrackMetadata) -> String {
        format!("{}-{}", self.service().file_prefix(), track.source_id)
    }

    /// Fetch metadata for a single track
    async fn fetch_metadata(&self, id: u64) -> Result<TrackMetadata>;

    /// Fetch a release/playlist together with its ordered track list
    async fn fetch_group_metadata(&self, id: u64) -> Result<GroupMetadata> {
        Err(DownloadError::invalid_argument(format!(
            "{} does not support releases or playlists (requested {})",
            self.service(),
            id
        )))
    }

    /// Stream the track's audio into `dest`.
    ///
    /// Calls `on_progress` with non-decreasing fractions, ending at `1.0` on
    /// success. Fails with `Incomplete` if the stream ends early.
    async fn fetch_content(
        &self,
        track: &TrackMetadata,
        dest: &Path,
        on_progress: Progress<'_>,
    ) -> Result<ContentInfo>;

    /// Fetch cover art for a track, if the service has any
    async fn fetch_artwork(&self, _track: &TrackMetadata) -> Result<Option<Bytes>> {
        Ok(None)
    }
}

/// The configured adapters, one slot per [`Service`]
#[derive(Clone, Default)]
pub struct SourceSet {
    adapters: HashMap<Service, Arc<dyn SourceAdapter>>,
    refs: UpstreamRefs,
}

impl SourceSet {
    pub fn new(refs: UpstreamRefs) -> Self {
        Self {
            adapters: HashMap::new(),
            refs,
        }
    }

    /// Build every adapter the config has enough settings for.
    ///
    /// Services left unconfigured stay empty and fail their downloads with
    /// `Unauthorized`.
    pub fn from_config(config: &Config, credentials: &Credentials) -> anyhow::Result<Self> {
        let refs = UpstreamRefs::new();
        let mut sources = Self::new(refs.clone());

        if let Some(client_id) = &config.soundcloud.client_id {
            sources = sources.with(Arc::new(SoundcloudSource::new(
                client_id,
                credentials.soundcloud_auth_token.clone(),
            )?));
        }

        if let Some(client_id) = &config.spotify.client_id {
            sources = sources.with(Arc::new(SpotifySource::new(
                client_id,
                credentials.spotify_client_secret.clone(),
                config.spotify.stream_url.as_deref(),
                refs.clone(),
            )?));
        }

        match (&config.soulseek.slskd_url, &config.soulseek.downloads_dir) {
            (Some(url), Some(downloads_dir)) => {
                sources = sources.with(Arc::new(SoulseekSource::new(
                    url,
                    credentials.soulseek_api_key.clone(),
                    downloads_dir.clone(),
                    refs,
                )?));
            }
            (Some(_), None) => warn!("Soulseek needs soulseek.downloads_dir, skipping it"),
            _ => {}
        }

        debug!("Configured sources: {:?}", sources.configured());
        Ok(sources)
    }

    /// Install an adapter in the slot for its service
    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.service(), adapter);
        self
    }

    /// Adapter for a service, `Unauthorized` when it was never configured
    pub fn get(&self, service: Service) -> Result<Arc<dyn SourceAdapter>> {
        self.adapters.get(&service).cloned().ok_or_else(|| {
            DownloadError::unauthorized(format!("{} is not configured", service))
        })
    }

    /// Services with an adapter installed
    pub fn configured(&self) -> Vec<Service> {
        let mut services: Vec<_> = self.adapters.keys().copied().collect();
        services.sort();
        services
    }

    /// Catalog id registry shared with the adapters
    pub fn refs(&self) -> &UpstreamRefs {
        &self.refs
    }
}

/// Build the HTTP client used by the adapters
pub(crate) fn http_client() -> anyhow::Result<Client> {
    use anyhow::Context;

    Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to create HTTP client")
}

/// Turn an unsuccessful response into an error
pub(crate) fn check_status(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(DownloadError::from_status(status, context))
    }
}

/// Download a URL as bytes, treating a 404 as "nothing there"
pub(crate) async fn fetch_optional_bytes(client: &Client, url: &str) -> Result<Option<Bytes>> {
    let response = client.get(url).send().await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let response = check_status(response, "Failed to fetch artwork")?;
    Ok(Some(response.bytes().await?))
}

/// Stream a response body to a file, reporting fractional progress
pub(crate) async fn stream_to_file(
    response: Response,
    dest: &Path,
    expected_size: Option<u64>,
    on_progress: Progress<'_>,
) -> Result<ContentInfo> {
    let total = response.content_length().or(expected_size).filter(|t| *t > 0);

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(dest).await?;

    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| DownloadError::incomplete(format!("Stream interrupted: {}", e)))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if let Some(total) = total {
            on_progress((written as f64 / total as f64).min(1.0));
        }
    }
    file.flush().await?;

    if written == 0 {
        return Err(DownloadError::incomplete("Downloaded file is 0 bytes"));
    }
    if let Some(total) = total {
        if written < total {
            return Err(DownloadError::incomplete(format!(
                "Received {} of {} bytes",
                written, total
            )));
        }
    }

    on_progress(1.0);
    debug!("Wrote {} bytes to {}", written, dest.display());
    Ok(ContentInfo { bytes: written })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_wire_names() {
        assert_eq!(serde_json::to_string(&Service::Soundcloud).unwrap(), "\"soundcloud\"");
        assert_eq!(serde_json::to_string(&Kind::Group).unwrap(), "\"group\"");
        assert_eq!(Service::Soulseek.to_string(), "soulseek");
    }

    #[test]
    fn test_refs_resolve_by_kind() {
        let refs = UpstreamRefs::new();
        refs.register(
            7,
            UpstreamRef::SpotifyAlbum {
                spotify_id: "4aawyAB9vmqN3uQ7FjRGTy".to_string(),
            },
        );

        assert!(refs.resolve(Service::Spotify, Kind::Group, 7).is_ok());
        let missing = refs.resolve(Service::Spotify, Kind::Track, 7).unwrap_err();
        assert_eq!(missing.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_refs_survive_poisoned_lock() {
        let refs = UpstreamRefs::new();
        let shared = refs.clone();
        let _ = std::thread::spawn(move || {
            let _guard = shared.inner.write().unwrap();
            panic!("writer died");
        })
        .join();
        assert!(refs.inner.is_poisoned());

        refs.register(
            3,
            UpstreamRef::SpotifyTrack {
                spotify_id: "11dFghVXANMlKmJXsNCbNl".to_string(),
            },
        );
        assert_eq!(
            refs.resolve(Service::Spotify, Kind::Track, 3).unwrap(),
            UpstreamRef::SpotifyTrack {
                spotify_id: "11dFghVXANMlKmJXsNCbNl".to_string(),
            }
        );
    }

    #[test]
    fn test_upstream_ref_wire_format() {
        let json = r#"{"type":"soulseek-file","username":"peer","filename":"music\\a.flac","size":10}"#;
        let parsed: UpstreamRef = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.target(), (Service::Soulseek, Kind::Track));
    }

    #[test]
    fn test_from_config_skips_unconfigured() {
        let mut config = Config::default();
        config.soundcloud.client_id = Some("client".to_string());
        config.soulseek.slskd_url = Some("http://localhost:5030".to_string());

        let sources = SourceSet::from_config(&config, &Credentials::default()).unwrap();
        assert_eq!(sources.configured(), vec![Service::Soundcloud]);
    }

    #[test]
    fn test_unconfigured_service_is_unauthorized() {
        let sources = SourceSet::default();
        let err = sources.get(Service::Spotify).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unauthorized);
        assert!(sources.configured().is_empty());
    }
}
