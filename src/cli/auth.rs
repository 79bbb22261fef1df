//! Keyring-based storage for service secrets

use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use keyring::Entry;
use tracing::{debug, info, warn};

use tunefetch::config::{Config, Credentials};
use tunefetch::source::Service;

const KEYRING_SERVICE: &str = "tunefetch";

/// Manages service secrets in the system keyring
pub struct AuthManager;

impl AuthManager {
    /// Keyring entry name of a service's secret
    pub fn secret_key(service: Service) -> &'static str {
        match service {
            Service::Soundcloud => "soundcloud:auth-token",
            Service::Spotify => "spotify:client-secret",
            Service::Soulseek => "soulseek:api-key",
        }
    }

    /// What the secret is called when prompting
    fn secret_label(service: Service) -> &'static str {
        match service {
            Service::Soundcloud => "SoundCloud OAuth token",
            Service::Spotify => "Spotify client secret",
            Service::Soulseek => "slskd API key",
        }
    }

    /// Load every stored secret. Missing entries are left empty.
    pub fn load_credentials() -> Credentials {
        Credentials {
            soundcloud_auth_token: Self::load(Service::Soundcloud),
            spotify_client_secret: Self::load(Service::Spotify),
            soulseek_api_key: Self::load(Service::Soulseek),
        }
    }

    /// Load one service's secret
    pub fn load(service: Service) -> Option<String> {
        let entry = match Self::get_entry(service) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("{:#}", e);
                return None;
            }
        };
        match entry.get_password() {
            Ok(secret) => Some(secret),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!("Failed to read {} from keyring: {}", Self::secret_key(service), e);
                None
            }
        }
    }

    /// Store one service's secret
    pub fn store(service: Service, secret: &str) -> Result<()> {
        Self::get_entry(service)?
            .set_password(secret)
            .with_context(|| format!("Failed to store {} in keyring", Self::secret_key(service)))?;
        debug!("Stored {} in keyring", Self::secret_key(service));
        Ok(())
    }

    /// Remove one service's secret
    pub fn clear(service: Service) -> Result<()> {
        let _ = Self::get_entry(service)?.delete_credential();
        info!("Cleared {} from keyring", Self::secret_key(service));
        Ok(())
    }

    /// Prompt for a service's settings and secret.
    ///
    /// Non-secret settings go into `config`; the caller saves it. An existing
    /// secret is kept unless `force` is set.
    pub fn configure(service: Service, config: &mut Config, force: bool) -> Result<()> {
        match service {
            Service::Soundcloud => {
                config.soundcloud.client_id = Some(Self::prompt(
                    "SoundCloud client id",
                    config.soundcloud.client_id.clone(),
                )?);
            }
            Service::Spotify => {
                config.spotify.client_id = Some(Self::prompt(
                    "Spotify client id",
                    config.spotify.client_id.clone(),
                )?);
                let stream_url: String = Input::new()
                    .with_prompt("Spotify stream endpoint (empty for metadata only)")
                    .default(config.spotify.stream_url.clone().unwrap_or_default())
                    .allow_empty(true)
                    .interact_text()
                    .context("Failed to read stream endpoint")?;
                config.spotify.stream_url = Some(stream_url).filter(|u| !u.is_empty());
            }
            Service::Soulseek => {
                config.soulseek.slskd_url = Some(Self::prompt(
                    "slskd URL",
                    config
                        .soulseek
                        .slskd_url
                        .clone()
                        .or_else(|| Some("http://localhost:5030".to_string())),
                )?);
                let downloads_dir = Self::prompt(
                    "slskd downloads directory",
                    config
                        .soulseek
                        .downloads_dir
                        .as_ref()
                        .map(|d| d.display().to_string()),
                )?;
                config.soulseek.downloads_dir = Some(downloads_dir.into());
            }
        }

        if !force && Self::load(service).is_some() {
            info!("Keeping stored {}", Self::secret_label(service));
            return Ok(());
        }

        let secret = Password::new()
            .with_prompt(Self::secret_label(service))
            .allow_empty_password(true)
            .interact()
            .context("Failed to read secret")?;

        if secret.is_empty() {
            debug!("No {} given", Self::secret_label(service));
            return Ok(());
        }
        Self::store(service, &secret)
    }

    fn prompt(label: &str, current: Option<String>) -> Result<String> {
        let mut input = Input::<String>::new().with_prompt(label);
        if let Some(current) = current {
            input = input.default(current);
        }
        input
            .interact_text()
            .with_context(|| format!("Failed to read {}", label))
    }

    /// Get the keyring entry for a service
    fn get_entry(service: Service) -> Result<Entry> {
        Entry::new(KEYRING_SERVICE, Self::secret_key(service)).context("Failed to access keyring")
    }
}
