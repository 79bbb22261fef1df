//! Spotify adapter
//!
//! Metadata comes from the Web API using a client-credentials token. Audio is
//! fetched from a separately configured stream endpoint; without one the
//! adapter still resolves metadata but refuses content with `Unauthorized`.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use super::{
    ContentInfo, GroupMetadata, Kind, Progress, Service, SourceAdapter, TrackMetadata,
    UpstreamRef, UpstreamRefs, check_status, fetch_optional_bytes, stream_to_file,
};
use crate::error::{DownloadError, Result};

const API_BASE: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Refresh the token this long before Spotify says it expires
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
struct SpArtist {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SpImage {
    url: String,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct SpAlbumRef {
    name: String,
    #[serde(default)]
    artists: Vec<SpArtist>,
    #[serde(default)]
    images: Vec<SpImage>,
}

#[derive(Debug, Clone, Deserialize)]
struct SpTrack {
    id: String,
    name: String,
    #[serde(default)]
    artists: Vec<SpArtist>,
    album: Option<SpAlbumRef>,
    track_number: Option<u32>,
    duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct SpPage<T> {
    items: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SpAlbum {
    id: String,
    name: String,
    #[serde(default)]
    artists: Vec<SpArtist>,
    #[serde(default)]
    images: Vec<SpImage>,
    tracks: SpPage<SpTrack>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Spotify Web API client
pub struct SpotifySource {
    http: Client,
    client_id: String,
    client_secret: Option<String>,
    stream_url: Option<Url>,
    refs: UpstreamRefs,
    token: Mutex<Option<AccessToken>>,
}

impl SpotifySource {
    /// Create a new Spotify adapter
    pub fn new(
        client_id: &str,
        client_secret: Option<String>,
        stream_url: Option<&str>,
        refs: UpstreamRefs,
    ) -> anyhow::Result<Self> {
        let stream_url = stream_url
            .map(|u| Url::parse(u.trim_end_matches('/')))
            .transpose()
            .map_err(|e| anyhow::anyhow!("Invalid Spotify stream URL: {}", e))?;

        Ok(Self {
            http: super::http_client()?,
            client_id: client_id.to_string(),
            client_secret,
            stream_url,
            refs,
            token: Mutex::new(None),
        })
    }

    /// Get a valid access token, requesting a new one when needed
    async fn access_token(&self) -> Result<String> {
        let mut token = self.token.lock().await;
        if let Some(t) = token.as_ref() {
            if Instant::now() + TOKEN_MARGIN < t.expires_at {
                return Ok(t.value.clone());
            }
        }

        let secret = self.client_secret.as_deref().ok_or_else(|| {
            DownloadError::unauthorized("Spotify client secret is not configured")
        })?;

        debug!("Requesting Spotify access token");
        let response = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let response = check_status(response, "Failed to obtain Spotify token")?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| DownloadError::transient(format!("Bad token response: {}", e)))?;

        let value = body.access_token.clone();
        *token = Some(AccessToken {
            value: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        });
        Ok(value)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, context: &str) -> Result<T> {
        let token = self.access_token().await?;
        debug!("Fetching {}: {}", context, url);
        let response = self.http.get(url).bearer_auth(token).send().await?;
        let response = check_status(response, context)?;
        response
            .json()
            .await
            .map_err(|e| DownloadError::transient(format!("Failed to parse {}: {}", context, e)))
    }

    fn spotify_id(&self, kind: Kind, id: u64) -> Result<String> {
        match self.refs.resolve(Service::Spotify, kind, id)? {
            UpstreamRef::SpotifyTrack { spotify_id } | UpstreamRef::SpotifyAlbum { spotify_id } => {
                Ok(spotify_id)
            }
            other => Err(DownloadError::invalid_argument(format!(
                "{:?} is not a Spotify reference",
                other
            ))),
        }
    }
}

fn artist_names(artists: &[SpArtist]) -> Vec<String> {
    artists.iter().map(|a| a.name.clone()).collect()
}

/// Pick the image with the most pixels
fn largest_image(images: &[SpImage]) -> Option<String> {
    images
        .iter()
        .max_by_key(|i| u64::from(i.width.unwrap_or(0)) * u64::from(i.height.unwrap_or(0)))
        .map(|i| i.url.clone())
}

fn track_metadata(track: &SpTrack) -> TrackMetadata {
    let artists = artist_names(&track.artists);
    let (album, album_artists, artwork_url) = match &track.album {
        Some(album) => (
            Some(album.name.clone()),
            artist_names(&album.artists),
            largest_image(&album.images),
        ),
        None => (None, Vec::new(), None),
    };

    TrackMetadata {
        source_id: track.id.clone(),
        title: track.name.clone(),
        album_artists: if album_artists.is_empty() {
            artists.clone()
        } else {
            album_artists
        },
        artists,
        album,
        track_number: track.track_number,
        duration_ms: track.duration_ms,
        artwork_url,
        extension: "ogg".to_string(),
        size: None,
    }
}

#[async_trait]
impl SourceAdapter for SpotifySource {
    fn service(&self) -> Service {
        Service::Spotify
    }

    fn supports_groups(&self) -> bool {
        true
    }

    async fn fetch_metadata(&self, id: u64) -> Result<TrackMetadata> {
        let spotify_id = self.spotify_id(Kind::Track, id)?;
        let track: SpTrack = self
            .get_json(&format!("{}/tracks/{}", API_BASE, spotify_id), "Spotify track")
            .await?;
        Ok(track_metadata(&track))
    }

    async fn fetch_group_metadata(&self, id: u64) -> Result<GroupMetadata> {
        let spotify_id = self.spotify_id(Kind::Group, id)?;
        let album: SpAlbum = self
            .get_json(&format!("{}/albums/{}", API_BASE, spotify_id), "Spotify album")
            .await?;

        let mut items = album.tracks.items;
        let mut next = album.tracks.next;
        while let Some(url) = next {
            let page: SpPage<SpTrack> = self.get_json(&url, "Spotify album tracks").await?;
            items.extend(page.items);
            next = page.next;
        }

        let mut group = GroupMetadata {
            source_id: album.id,
            title: album.name,
            artists: artist_names(&album.artists),
            artwork_url: largest_image(&album.images),
            tracks: Vec::new(),
        };
        group.tracks = items
            .iter()
            .enumerate()
            .map(|(i, t)| track_metadata(t).in_group(&group, i))
            .collect();

        Ok(group.dedup_tracks())
    }

    async fn fetch_content(
        &self,
        track: &TrackMetadata,
        dest: &Path,
        on_progress: Progress<'_>,
    ) -> Result<ContentInfo> {
        let base = self.stream_url.as_ref().ok_or_else(|| {
            DownloadError::unauthorized("Spotify downloads are not configured")
        })?;
        let url = format!("{}/{}", base.as_str().trim_end_matches('/'), track.source_id);

        let token = self.access_token().await?;
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        let response = check_status(response, "Failed to download track")?;
        stream_to_file(response, dest, track.size, on_progress).await
    }

    async fn fetch_artwork(&self, track: &TrackMetadata) -> Result<Option<Bytes>> {
        match &track.artwork_url {
            Some(url) => fetch_optional_bytes(&self.http, url).await,
            None => Ok(None),
        }
    }
}
