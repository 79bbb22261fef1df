//! Configuration persistence
//!
//! Stores pipeline settings in ~/.config/tunefetch/config.json. Secrets
//! (OAuth tokens, API keys) are not kept here; the CLI reads them from the
//! system keyring and hands them over as [`Credentials`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current config format version
const CONFIG_VERSION: u32 = 1;

/// Persistent pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config format version
    pub version: u32,
    /// Where downloaded audio files are materialized
    pub download_dir: PathBuf,
    /// Root of the content-addressed asset store
    pub store_dir: PathBuf,
    /// Number of content fetches allowed in flight at once
    pub max_concurrent_downloads: usize,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
    /// Max edge, in pixels, of cover art embedded into downloaded files
    pub cover_art_size: u32,
    pub soundcloud: SoundcloudConfig,
    pub spotify: SpotifyConfig,
    pub soulseek: SoulseekConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundcloudConfig {
    /// Public web client id, required for every API call
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    /// Web API client id (the secret lives in the keyring)
    pub client_id: Option<String>,
    /// Base URL of an audio stream endpoint; downloads are disabled without it
    pub stream_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SoulseekConfig {
    /// Base URL of the slskd daemon, e.g. http://localhost:5030
    pub slskd_url: Option<String>,
    /// Directory slskd writes completed transfers to
    pub downloads_dir: Option<PathBuf>,
}

/// Secrets loaded from the keyring
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub soundcloud_auth_token: Option<String>,
    pub spotify_client_secret: Option<String>,
    pub soulseek_api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = dirs::audio_dir()
            .map(|d| d.join("tunefetch"))
            .unwrap_or_else(|| PathBuf::from("downloads"));
        let store_dir = dirs::data_dir()
            .map(|d| d.join("tunefetch").join("images"))
            .unwrap_or_else(|| PathBuf::from("images"));

        Self {
            version: CONFIG_VERSION,
            download_dir,
            store_dir,
            max_concurrent_downloads: 10,
            event_buffer: 256,
            cover_art_size: 500,
            soundcloud: SoundcloudConfig::default(),
            spotify: SpotifyConfig::default(),
            soulseek: SoulseekConfig::default(),
        }
    }
}

impl Config {
    /// Load the config from its default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load the config from a file, falling back to defaults when it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        let config: Self =
            serde_json::from_str(&contents).with_context(|| "Failed to parse config")?;

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save the config to its default location
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save the config to a file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("tunefetch").join("config.json"))
    }

    /// Apply command-line overrides
    pub fn with_overrides(
        mut self,
        download_dir: Option<PathBuf>,
        store_dir: Option<PathBuf>,
    ) -> Self {
        if let Some(dir) = download_dir {
            self.download_dir = dir;
        }
        if let Some(dir) = store_dir {
            self.store_dir = dir;
        }
        self
    }
}
