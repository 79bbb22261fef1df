//! Typed metadata returned by source adapters

use serde::{Deserialize, Serialize};

/// Track-level metadata, stored verbatim on the download once fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetadata {
    /// Identifier of the track on the source service
    pub source_id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub album_artists: Vec<String>,
    pub track_number: Option<u32>,
    pub duration_ms: Option<u64>,
    pub artwork_url: Option<String>,
    /// File extension of the audio the source will deliver
    pub extension: String,
    /// Advertised content size in bytes, if known up front
    pub size: Option<u64>,
}

/// Release/playlist-level metadata, including the ordered track list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    pub source_id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub artwork_url: Option<String>,
    pub tracks: Vec<TrackMetadata>,
}

/// Result of a successful content fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    /// Bytes written to the destination file
    pub bytes: u64,
}

impl TrackMetadata {
    /// Metadata for this track as a member of a release or playlist.
    ///
    /// `position` is the zero-based index in the group; it is used as the
    /// track number when the source did not provide one.
    pub fn in_group(mut self, group: &GroupMetadata, position: usize) -> Self {
        self.album = Some(group.title.clone());
        self.album_artists = if group.artists.is_empty() {
            self.artists.clone()
        } else {
            group.artists.clone()
        };
        if self.track_number.is_none() {
            self.track_number = Some(position as u32 + 1);
        }
        if self.artwork_url.is_none() {
            self.artwork_url = group.artwork_url.clone();
        }
        self
    }
}

impl GroupMetadata {
    /// Drop repeated tracks, keeping the first occurrence
    pub fn dedup_tracks(mut self) -> Self {
        let mut seen = std::collections::HashSet::new();
        self.tracks.retain(|t| seen.insert(t.source_id.clone()));
        self
    }
}

const DASHES: [&str; 5] = [" - ", " − ", " – ", " — ", " ― "];

/// Split an uploader-style "Artist - Title" string.
///
/// Returns the artists (if a dash separator was present) and the title.
pub fn parse_artist_title(raw: &str) -> (Option<Vec<String>>, String) {
    let mut artists = None;
    let mut title = raw.to_string();

    for dash in DASHES {
        if let Some((artist, rest)) = title.split_once(dash) {
            artists = Some(vec![artist.trim().to_string()]);
            title = rest.trim().to_string();
        }
    }

    (artists, title)
}
