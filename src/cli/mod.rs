//! CLI module for tunefetch

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tunefetch::source::{Kind, Service, UpstreamRef};

pub mod auth;
pub mod commands;

pub use auth::AuthManager;

#[derive(Parser, Debug)]
#[command(
    name = "tunefetch",
    about = "Acquire tracks and releases from SoundCloud, Spotify and Soulseek"
)]
#[command(version, author)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Where downloaded audio is written (overrides the config file)
    #[arg(long, global = true, env = "TUNEFETCH_DOWNLOAD_DIR")]
    pub download_dir: Option<PathBuf>,

    /// Content store directory for cover art (overrides the config file)
    #[arg(long, global = true, env = "TUNEFETCH_STORE_DIR")]
    pub store_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a track or a release/playlist
    Download {
        /// Service to download from
        #[arg(value_enum)]
        service: Service,

        /// Single track or release/playlist
        #[arg(value_enum)]
        kind: Kind,

        /// Numeric catalog id
        id: u64,

        /// Spotify id the catalog id stands for
        #[arg(long, conflicts_with_all = ["peer", "file"])]
        spotify_id: Option<String>,

        /// Soulseek peer sharing the file
        #[arg(long, requires_all = ["file", "size"])]
        peer: Option<String>,

        /// Remote path of the shared file on the peer
        #[arg(long, requires = "peer")]
        file: Option<String>,

        /// Size of the shared file in bytes
        #[arg(long, requires = "peer")]
        size: Option<u64>,
    },

    /// Run the worker over stdin/stdout, one JSON message per line
    Serve,

    /// Configure a service and store its secret in the system keyring
    Auth {
        /// Service to configure
        #[arg(value_enum)]
        service: Service,

        /// Replace a stored secret
        #[arg(long)]
        force: bool,

        /// Remove the stored secret instead
        #[arg(long, conflicts_with = "force")]
        clear: bool,
    },

    /// Create the config file, or print it
    Config {
        /// Print the effective config
        #[arg(long)]
        show: bool,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// What a `download` command's extra flags say the id refers to
pub fn upstream_ref(
    kind: Kind,
    spotify_id: Option<String>,
    peer: Option<String>,
    file: Option<String>,
    size: Option<u64>,
) -> Option<UpstreamRef> {
    if let Some(spotify_id) = spotify_id {
        return Some(match kind {
            Kind::Track => UpstreamRef::SpotifyTrack { spotify_id },
            Kind::Group => UpstreamRef::SpotifyAlbum { spotify_id },
        });
    }
    match (peer, file, size) {
        (Some(username), Some(filename), Some(size)) => Some(UpstreamRef::SoulseekFile {
            username,
            filename,
            size,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_download() {
        let cli = Cli::try_parse_from(["tunefetch", "download", "soundcloud", "group", "42"])
            .unwrap();
        match cli.command {
            Commands::Download {
                service, kind, id, ..
            } => {
                assert_eq!(service, Service::Soundcloud);
                assert_eq!(kind, Kind::Group);
                assert_eq!(id, 42);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_soulseek_flags_need_each_other() {
        let result = Cli::try_parse_from([
            "tunefetch", "download", "soulseek", "track", "1", "--peer", "someone",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_upstream_ref_from_flags() {
        assert_eq!(
            upstream_ref(Kind::Group, Some("abc".into()), None, None, None),
            Some(UpstreamRef::SpotifyAlbum {
                spotify_id: "abc".into()
            })
        );
        assert_eq!(
            upstream_ref(
                Kind::Track,
                None,
                Some("peer".into()),
                Some("a\\b.mp3".into()),
                Some(10)
            ),
            Some(UpstreamRef::SoulseekFile {
                username: "peer".into(),
                filename: "a\\b.mp3".into(),
                size: 10
            })
        );
        assert!(upstream_ref(Kind::Track, None, None, None, None).is_none());
    }
}
