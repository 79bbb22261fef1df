//! tunefetch - Acquire music from SoundCloud, Spotify and Soulseek

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use cli::{Cli, Commands};
use tunefetch::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout carries protocol lines in `serve`
    let filter = if cli.verbose {
        "tunefetch=debug,reqwest=debug"
    } else {
        "tunefetch=info"
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Download {
            service,
            kind,
            id,
            spotify_id,
            peer,
            file,
            size,
        } => {
            let config = Config::load()?.with_overrides(cli.download_dir, cli.store_dir);
            let upstream = cli::upstream_ref(kind, spotify_id, peer, file, size);
            cli::commands::download(&config, service, kind, id, upstream).await?;
        }
        Commands::Serve => {
            let config = Config::load()?.with_overrides(cli.download_dir, cli.store_dir);
            cli::commands::serve(&config).await?;
        }
        Commands::Auth {
            service,
            force,
            clear,
        } => {
            cli::commands::auth(service, force, clear).await?;
        }
        Commands::Config { show } => {
            let config = Config::load()?.with_overrides(cli.download_dir, cli.store_dir);
            cli::commands::config(&config, show)?;
        }
        Commands::Completion { shell } => {
            cli::commands::completion(shell);
        }
    }

    Ok(())
}
