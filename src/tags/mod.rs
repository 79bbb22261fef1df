//! Audio file tags and cover art
//!
//! Downloaded files get title/artist/album/track tags written in place, and
//! cover art embedded as a baseline JPEG resized to fit `cover_art_size`.
//! Reading goes the other way: the front cover already embedded in a file is
//! used when the service had no artwork of its own.
//!
//! lofty and the image codecs are blocking, so the async wrappers hop onto
//! the blocking pool.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use lofty::config::WriteOptions;
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, Tag};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::source::TrackMetadata;

/// JPEG quality (0-100) for embedded covers
const JPEG_QUALITY: u8 = 85;

/// Lowest quality tried before giving up on shrinking
const MIN_JPEG_QUALITY: u8 = 55;

/// Embedded covers larger than this are re-encoded at lower quality
const MAX_COVER_BYTES: usize = 500 * 1024;

/// Tag values written to a downloaded file
#[derive(Debug, Clone, PartialEq)]
pub struct TrackTags {
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub album_artists: Vec<String>,
    pub track_number: Option<u32>,
}

impl From<&TrackMetadata> for TrackTags {
    fn from(meta: &TrackMetadata) -> Self {
        Self {
            title: meta.title.clone(),
            artists: meta.artists.clone(),
            album: meta.album.clone(),
            album_artists: meta.album_artists.clone(),
            track_number: meta.track_number,
        }
    }
}

fn join_artists(artists: &[String]) -> Option<String> {
    if artists.is_empty() {
        None
    } else {
        Some(artists.join(", "))
    }
}

/// Decode, shrink to fit `max_size` and re-encode as baseline JPEG
pub fn process_cover_art(data: &[u8], max_size: u32) -> Result<Vec<u8>> {
    let img = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .context("Failed to guess image format")?
        .decode()
        .context("Failed to decode cover art")?;

    // JPEG has no alpha channel
    let img = DynamicImage::ImageRgb8(resize_to_fit(img, max_size).to_rgb8());

    let mut quality = JPEG_QUALITY;
    loop {
        let mut output = Vec::new();
        JpegEncoder::new_with_quality(&mut output, quality)
            .encode_image(&img)
            .context("Failed to encode cover art as JPEG")?;

        if output.len() <= MAX_COVER_BYTES || quality <= MIN_JPEG_QUALITY {
            debug!(
                "Processed cover art: {}x{} -> {} bytes (quality {})",
                img.width(),
                img.height(),
                output.len(),
                quality
            );
            return Ok(output);
        }

        warn!(
            "Cover art too large ({} bytes), reducing quality from {} to {}",
            output.len(),
            quality,
            quality - 10
        );
        quality -= 10;
    }
}

/// Resize to fit within `max_size` on both edges, keeping the aspect ratio
fn resize_to_fit(img: DynamicImage, max_size: u32) -> DynamicImage {
    let (width, height) = (img.width(), img.height());
    if width <= max_size && height <= max_size {
        return img;
    }

    let (new_width, new_height) = if width > height {
        let ratio = max_size as f64 / width as f64;
        (max_size, ((height as f64 * ratio) as u32).max(1))
    } else {
        let ratio = max_size as f64 / height as f64;
        (((width as f64 * ratio) as u32).max(1), max_size)
    };

    debug!(
        "Resizing cover art: {}x{} -> {}x{}",
        width, height, new_width, new_height
    );
    img.resize(new_width, new_height, FilterType::Lanczos3)
}

/// Front cover embedded in an audio file, if there is one.
///
/// Unreadable files and files without pictures both yield `None`.
pub fn read_cover_art(path: &Path) -> Option<Vec<u8>> {
    let tagged_file = match Probe::open(path).and_then(|p| p.read()) {
        Ok(file) => file,
        Err(e) => {
            debug!("No readable tags in {}: {}", path.display(), e);
            return None;
        }
    };

    let pictures: Vec<&Picture> = tagged_file
        .tags()
        .iter()
        .flat_map(|tag| tag.pictures())
        .collect();

    pictures
        .iter()
        .find(|p| p.pic_type() == PictureType::CoverFront)
        .or_else(|| pictures.first())
        .map(|p| p.data().to_vec())
}

/// Write tags, and optionally an already-processed JPEG cover, in place
pub fn write_tags(path: &Path, tags: &TrackTags, cover_jpeg: Option<&[u8]>) -> Result<()> {
    let mut tagged_file = Probe::open(path)
        .context("Failed to open audio file")?
        .read()
        .context("Failed to read audio file tags")?;

    let tag = match tagged_file.primary_tag_mut() {
        Some(tag) => tag,
        None => {
            if let Some(tag) = tagged_file.first_tag_mut() {
                tag
            } else {
                let tag_type = tagged_file.primary_tag_type();
                tagged_file.insert_tag(Tag::new(tag_type));
                tagged_file
                    .primary_tag_mut()
                    .context("Failed to create tag")?
            }
        }
    };

    tag.set_title(tags.title.clone());
    if let Some(artist) = join_artists(&tags.artists) {
        tag.set_artist(artist);
    }
    if let Some(album) = &tags.album {
        tag.set_album(album.clone());
    }
    if let Some(album_artist) = join_artists(&tags.album_artists) {
        tag.insert_text(ItemKey::AlbumArtist, album_artist);
    }
    if let Some(track) = tags.track_number {
        tag.set_track(track);
    }

    if let Some(cover) = cover_jpeg {
        tag.remove_picture_type(PictureType::CoverFront);
        tag.push_picture(Picture::new_unchecked(
            PictureType::CoverFront,
            Some(MimeType::Jpeg),
            None,
            cover.to_vec(),
        ));
    }

    tagged_file
        .save_to_path(path, WriteOptions::default())
        .context("Failed to save audio file tags")?;

    debug!("Wrote tags to {}", path.display());
    Ok(())
}

/// [`read_cover_art`] on the blocking pool
pub async fn read_cover_art_async(path: PathBuf) -> Option<Vec<u8>> {
    match tokio::task::spawn_blocking(move || read_cover_art(&path)).await {
        Ok(cover) => cover,
        Err(e) => {
            warn!("Cover art read task panicked: {}", e);
            None
        }
    }
}

/// Process `cover` (raw artwork bytes) and write everything on the blocking pool
pub async fn write_tags_async(
    path: PathBuf,
    tags: TrackTags,
    cover: Option<Vec<u8>>,
    cover_art_size: u32,
) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let processed = match cover {
            Some(raw) => match process_cover_art(&raw, cover_art_size) {
                Ok(jpeg) => Some(jpeg),
                Err(e) => {
                    warn!("Skipping cover art for {}: {:#}", path.display(), e);
                    None
                }
            },
            None => None,
        };
        write_tags(&path, &tags, processed.as_deref())
    })
    .await
    .context("Tag writing task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbaImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_resize_small_image() {
        let img = DynamicImage::new_rgb8(100, 100);
        let resized = resize_to_fit(img, 500);
        assert_eq!(resized.width(), 100);
        assert_eq!(resized.height(), 100);
    }

    #[test]
    fn test_resize_large_image() {
        let img = DynamicImage::new_rgb8(1500, 1000);
        let resized = resize_to_fit(img, 500);
        assert_eq!(resized.width(), 500);
        assert!(resized.height() <= 500);
    }

    #[test]
    fn test_resize_tall_image() {
        let img = DynamicImage::new_rgb8(400, 1600);
        let resized = resize_to_fit(img, 300);
        assert_eq!(resized.height(), 300);
        assert_eq!(resized.width(), 75);
    }

    #[test]
    fn test_process_cover_art_outputs_jpeg() {
        let jpeg = process_cover_art(&png_bytes(800, 600), 300).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 300);
    }

    #[test]
    fn test_process_cover_art_rejects_garbage() {
        assert!(process_cover_art(b"definitely not an image", 300).is_err());
    }

    #[test]
    fn test_read_cover_art_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_cover_art(&dir.path().join("missing.mp3")).is_none());
    }

    #[test]
    fn test_read_cover_art_non_audio_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.mp3");
        std::fs::write(&path, b"audio:42").unwrap();
        assert!(read_cover_art(&path).is_none());
    }

    #[tokio::test]
    async fn test_write_tags_on_non_audio_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.mp3");
        std::fs::write(&path, b"audio:42").unwrap();

        let tags = TrackTags {
            title: "Song".into(),
            artists: vec!["A".into()],
            album: None,
            album_artists: vec![],
            track_number: Some(1),
        };
        assert!(write_tags_async(path, tags, None, 500).await.is_err());
    }

    #[test]
    fn test_tags_from_metadata() {
        let meta = TrackMetadata {
            source_id: "1".into(),
            title: "Windowlicker".into(),
            artists: vec!["Aphex Twin".into(), "Guest".into()],
            album: Some("Windowlicker EP".into()),
            album_artists: vec!["Aphex Twin".into()],
            track_number: Some(1),
            duration_ms: None,
            artwork_url: None,
            extension: "mp3".into(),
            size: None,
        };
        let tags = TrackTags::from(&meta);
        assert_eq!(join_artists(&tags.artists).as_deref(), Some("Aphex Twin, Guest"));
        assert_eq!(tags.track_number, Some(1));
        assert!(join_artists(&[]).is_none());
    }
}
