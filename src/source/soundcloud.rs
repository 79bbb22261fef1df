//! SoundCloud adapter (api-v2)

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use reqwest::{Client, RequestBuilder, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::debug;

use super::{
    ContentInfo, GroupMetadata, Progress, Service, SourceAdapter, TrackMetadata, check_status,
    fetch_optional_bytes, parse_artist_title, stream_to_file,
};
use crate::error::{DownloadError, ErrorKind, Result};

const API_BASE: &str = "https://api-v2.soundcloud.com";

#[derive(Debug, Clone, Deserialize)]
struct ScUser {
    username: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ScFormat {
    protocol: String,
    mime_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ScTranscoding {
    url: String,
    format: ScFormat,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ScMedia {
    #[serde(default)]
    transcodings: Vec<ScTranscoding>,
}

/// Track as returned by the API. Playlist members may only carry an id.
#[derive(Debug, Clone, Deserialize)]
struct ScTrack {
    id: u64,
    title: Option<String>,
    user: Option<ScUser>,
    artwork_url: Option<String>,
    duration: Option<u64>,
    streamable: Option<bool>,
    policy: Option<String>,
    media: Option<ScMedia>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScPlaylist {
    id: u64,
    title: String,
    user: Option<ScUser>,
    artwork_url: Option<String>,
    #[serde(default)]
    tracks: Vec<ScTrack>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScStreamUrl {
    url: String,
}

/// HTTP client for the SoundCloud API
pub struct SoundcloudSource {
    http: Client,
    client_id: String,
    auth_token: Option<String>,
}

impl SoundcloudSource {
    /// Create a new SoundCloud adapter
    pub fn new(client_id: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            http: super::http_client()?,
            client_id: client_id.to_string(),
            auth_token,
        })
    }

    /// GET with the client id and, if present, the OAuth token
    fn request(&self, url: &str) -> RequestBuilder {
        let mut request = self
            .http
            .get(url)
            .query(&[("client_id", self.client_id.as_str())]);
        if let Some(token) = &self.auth_token {
            request = request.header(header::AUTHORIZATION, format!("OAuth {}", token));
        }
        request
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, context: &str) -> Result<T> {
        debug!("Fetching {}: {}", context, url);
        let response = self.request(url).send().await?;
        let response = check_status(response, context)?;
        response
            .json()
            .await
            .map_err(|e| DownloadError::transient(format!("Failed to parse {}: {}", context, e)))
    }

    async fn get_track(&self, id: u64) -> Result<ScTrack> {
        self.get_json(&format!("{}/tracks/{}", API_BASE, id), &format!("track {}", id))
            .await
    }

    async fn get_playlist(&self, id: u64) -> Result<ScPlaylist> {
        self.get_json(
            &format!("{}/playlists/{}", API_BASE, id),
            &format!("playlist {}", id),
        )
        .await
    }

    /// Fill in playlist members that only came back as ids
    async fn complete_track(&self, track: ScTrack) -> Result<ScTrack> {
        if track.title.is_some() {
            Ok(track)
        } else {
            self.get_track(track.id).await
        }
    }
}

/// Prefer a progressive (plain HTTP) stream over HLS
fn pick_transcoding(track: &ScTrack) -> Option<&ScTranscoding> {
    track
        .media
        .as_ref()?
        .transcodings
        .iter()
        .find(|t| t.format.protocol == "progressive")
}

fn extension_for_mime(mime: &str) -> &'static str {
    if mime.starts_with("audio/mpeg") {
        "mp3"
    } else if mime.starts_with("audio/ogg") {
        "opus"
    } else if mime.starts_with("audio/mp4") || mime.starts_with("audio/aac") {
        "m4a"
    } else if mime.starts_with("audio/flac") {
        "flac"
    } else if mime.starts_with("audio/wav") || mime.starts_with("audio/x-wav") {
        "wav"
    } else {
        "mp3"
    }
}

/// Renditions the artwork CDN serves, largest first
const ARTWORK_SIZES: [&str; 16] = [
    "original", "t3000x3000", "t2480x2480", "t500x500", "t300x300", "t250x250", "t240x240",
    "t200x200", "t120x120", "t80x80", "t67x67", "t60x60", "t50x50", "t47x47", "t40x40", "t20x20",
];
const ARTWORK_FORMATS: [&str; 2] = ["png", "jpg"];

/// Every rendition of a "large" artwork URL, in the order to try them.
/// Not every upload has an original, so smaller sizes are fallbacks.
fn artwork_candidates(url: &str) -> Vec<String> {
    ARTWORK_SIZES
        .iter()
        .flat_map(|size| {
            let sized = url.replace("large", size);
            ARTWORK_FORMATS
                .iter()
                .map(move |ext| sized.replace(".jpg", &format!(".{}", ext)))
        })
        .collect()
}

fn track_metadata(track: &ScTrack) -> TrackMetadata {
    let raw_title = track.title.clone().unwrap_or_else(|| track.id.to_string());
    let (artists, title) = parse_artist_title(&raw_title);
    let uploader = track
        .user
        .as_ref()
        .map(|u| vec![u.username.clone()])
        .unwrap_or_default();
    let artists = artists.unwrap_or(uploader);

    TrackMetadata {
        source_id: track.id.to_string(),
        album: Some(title.clone()),
        album_artists: artists.clone(),
        title,
        artists,
        track_number: None,
        duration_ms: track.duration,
        artwork_url: track.artwork_url.clone(),
        extension: pick_transcoding(track)
            .map(|t| extension_for_mime(&t.format.mime_type))
            .unwrap_or("mp3")
            .to_string(),
        size: None,
    }
}

/// `tracks` pairs each track with its first position in the raw playlist,
/// which is its track number even when repeats were dropped before it
fn group_metadata(playlist: &ScPlaylist, tracks: &[(usize, ScTrack)]) -> GroupMetadata {
    let (artists, title) = parse_artist_title(&playlist.title);
    let artists = artists.unwrap_or_else(|| {
        playlist
            .user
            .as_ref()
            .map(|u| vec![u.username.clone()])
            .unwrap_or_default()
    });

    let mut group = GroupMetadata {
        source_id: playlist.id.to_string(),
        title,
        artists,
        artwork_url: playlist.artwork_url.clone(),
        tracks: Vec::new(),
    };

    let members = tracks
        .iter()
        .map(|(i, t)| {
            let mut member = track_metadata(t);
            // The single-track defaults do not apply inside a release
            member.album = None;
            member.album_artists = Vec::new();
            member.in_group(&group, *i)
        })
        .collect();
    group.tracks = members;
    group
}

#[async_trait]
impl SourceAdapter for SoundcloudSource {
    fn service(&self) -> Service {
        Service::Soundcloud
    }

    fn supports_groups(&self) -> bool {
        true
    }

    async fn fetch_metadata(&self, id: u64) -> Result<TrackMetadata> {
        let track = self.get_track(id).await?;
        Ok(track_metadata(&track))
    }

    async fn fetch_group_metadata(&self, id: u64) -> Result<GroupMetadata> {
        let playlist = self.get_playlist(id).await?;

        let mut seen = std::collections::HashSet::new();
        let unique: Vec<(usize, ScTrack)> = playlist
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| seen.insert(t.id))
            .map(|(i, t)| (i, t.clone()))
            .collect();

        let tracks = join_all(
            unique
                .into_iter()
                .map(|(i, t)| async move { self.complete_track(t).await.map(|t| (i, t)) }),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        debug!("Playlist {} has {} tracks", id, tracks.len());
        Ok(group_metadata(&playlist, &tracks))
    }

    async fn fetch_content(
        &self,
        track: &TrackMetadata,
        dest: &Path,
        on_progress: Progress<'_>,
    ) -> Result<ContentInfo> {
        let id: u64 = track.source_id.parse().map_err(|_| {
            DownloadError::invalid_argument(format!("Bad SoundCloud id {}", track.source_id))
        })?;
        let sc_track = self.get_track(id).await?;

        if sc_track.streamable == Some(false) {
            return Err(DownloadError::not_found("Track is not streamable"));
        }
        if sc_track.policy.as_deref() == Some("BLOCK") {
            return Err(DownloadError::unauthorized(
                "Track is not available in your location",
            ));
        }

        let transcoding = pick_transcoding(&sc_track)
            .ok_or_else(|| DownloadError::not_found("No progressive stream available"))?;
        let stream: ScStreamUrl = self
            .get_json(&transcoding.url, &format!("stream url for {}", id))
            .await?;

        let response = self.http.get(&stream.url).send().await?;
        let response = check_status(response, "Failed to download track")?;
        stream_to_file(response, dest, track.size, on_progress).await
    }

    async fn fetch_artwork(&self, track: &TrackMetadata) -> Result<Option<Bytes>> {
        let Some(url) = &track.artwork_url else {
            return Ok(None);
        };
        for candidate in artwork_candidates(url) {
            match fetch_optional_bytes(&self.http, &candidate).await {
                Ok(Some(bytes)) => {
                    debug!("Using artwork {}", candidate);
                    return Ok(Some(bytes));
                }
                Ok(None) => {}
                // The CDN answers missing renditions with 403 as well as 404
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::Unauthorized) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}
