//! CLI command handlers

use anyhow::{Context, Result};
use clap_complete::generate;
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use super::AuthManager;
use tunefetch::config::Config;
use tunefetch::download::{
    Download, DownloadItem, DownloadKey, ItemState, ManagerOptions, Snapshot, Stage,
};
use tunefetch::source::{Kind, Service, SourceSet, UpstreamRef};
use tunefetch::worker::protocol::{Command, Event, Request};
use tunefetch::worker::{WorkerHost, WorkerSetup};

/// Start a worker with every configured service
async fn start_worker(config: &Config) -> Result<WorkerHost> {
    let credentials = AuthManager::load_credentials();
    let sources = SourceSet::from_config(config, &credentials)?;
    if sources.configured().is_empty() {
        warn!("No services configured. Run 'tunefetch auth <service>' first.");
    }

    WorkerHost::start(WorkerSetup {
        sources,
        store_dir: config.store_dir.clone(),
        options: ManagerOptions::from_config(config),
    })
    .await
}

fn bar_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
        .context("Invalid progress template")?
        .progress_chars("#>-"))
}

fn track_label(item: &DownloadItem) -> String {
    match item.state.metadata() {
        Some(meta) if !meta.artists.is_empty() => {
            format!("{} - {}", meta.artists.join(", "), meta.title)
        }
        Some(meta) => meta.title.clone(),
        None => item.id.clone(),
    }
}

/// One progress bar per track, created as tracks become known
struct ProgressView {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<String, ProgressBar>,
}

impl ProgressView {
    fn new() -> Result<Self> {
        Ok(Self {
            multi: MultiProgress::new(),
            style: bar_style()?,
            bars: HashMap::new(),
        })
    }

    fn render(&mut self, snapshot: &Snapshot) {
        for item in snapshot.download.items() {
            let bar = self.bars.entry(item.id.clone()).or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_style(self.style.clone());
                bar
            });

            let label = track_label(item);
            match &item.state {
                ItemState::Downloaded { .. } => {
                    bar.set_position(100);
                    bar.finish_with_message(format!("{} {}", "✓".green(), label));
                }
                ItemState::Failed { error, .. } => {
                    bar.abandon_with_message(format!("{} {}: {}", "✗".red(), label, error.message));
                }
                state => {
                    let progress = state.progress().unwrap_or(0.0);
                    bar.set_position((progress * 100.0).round() as u64);
                    bar.set_message(format!("{} ({})", label, state.stage()));
                }
            }
        }
    }
}

/// Handle the `download` command
pub async fn download(
    config: &Config,
    service: Service,
    kind: Kind,
    id: u64,
    upstream: Option<UpstreamRef>,
) -> Result<()> {
    let host = start_worker(config).await?;
    let (sender, mut receiver) = host.connect()?.split();
    let key = DownloadKey::new(service, kind, id);

    if let Some(target) = upstream {
        sender.send(&Request::new("register", Command::Register { id, target }))?;
    }
    sender.send(&Request::new("download", Command::Download { service, kind, id }))?;

    println!("{} {}", "Downloading".cyan(), key);
    let mut view = ProgressView::new()?;

    let finished = loop {
        let message = receiver
            .recv()
            .await
            .context("Worker closed the connection")?;

        match message.event {
            Event::Download { snapshot } if snapshot.key == key => {
                view.render(&snapshot);
                if snapshot.is_finished() {
                    break snapshot;
                }
            }
            Event::Error { kind, message } => {
                anyhow::bail!("Request failed ({:?}): {}", kind, message);
            }
            Event::Resync { .. } => {
                sender.send(&Request::new(
                    "resync",
                    Command::GetById { service, kind, id },
                ))?;
            }
            Event::Snapshot { snapshot } if snapshot.key == key => {
                view.render(&snapshot);
                if snapshot.is_finished() {
                    break snapshot;
                }
            }
            other => debug!("Ignoring {:?}", other),
        }
    };

    print_summary(&finished);
    tokio::task::spawn_blocking(move || host.shutdown())
        .await
        .context("Worker shutdown panicked")?;

    if finished.stage == Stage::Failed {
        anyhow::bail!("{} failed", key);
    }
    Ok(())
}

fn print_summary(snapshot: &Snapshot) {
    println!();
    match snapshot.stage {
        Stage::Downloaded => println!("{}", "Download complete!".green().bold()),
        _ => println!("{}", "Download failed".red().bold()),
    }

    match &snapshot.download {
        Download::Group(group) => {
            if let Some(meta) = group.metadata() {
                println!("  Release: {} ({} tracks)", meta.title, group.tracks.len());
            } else if let tunefetch::download::GroupPhase::Failed { error } = &group.phase {
                println!("  {}", error.message.red());
            }
        }
        Download::Item(_) => {}
    }

    for item in snapshot.download.items() {
        match &item.state {
            ItemState::Downloaded {
                path, cover_art, ..
            } => {
                let cover = match cover_art {
                    Some(asset) => format!(" (cover art #{})", asset.id),
                    None => String::new(),
                };
                println!("  {} {}{}", "✓".green(), path.display(), cover);
            }
            ItemState::Failed { error, .. } => {
                let hint = if error.retryable { " (retry may help)" } else { "" };
                println!(
                    "  {} {}: {}{}",
                    "✗".red(),
                    track_label(item),
                    error.message,
                    hint.yellow()
                );
            }
            _ => {}
        }
    }
}

/// Handle the `serve` command: stdin lines in, stdout lines out.
/// Closing stdin closes the connection, which ends the loop.
pub async fn serve(config: &Config) -> Result<()> {
    let host = start_worker(config).await?;
    let (sender, mut receiver) = host.connect()?.split();

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if sender.send_text(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
        debug!("Host input closed");
    });

    loop {
        tokio::select! {
            text = receiver.recv_text() => match text {
                Some(text) => {
                    let mut stdout = io::stdout().lock();
                    if let Err(e) = writeln!(stdout, "{}", text).and_then(|_| stdout.flush()) {
                        warn!("Failed to write to stdout: {}", e);
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    reader.abort();
    tokio::task::spawn_blocking(move || host.shutdown())
        .await
        .context("Worker shutdown panicked")?;
    Ok(())
}

/// Handle the `auth` command
pub async fn auth(service: Service, force: bool, clear: bool) -> Result<()> {
    if clear {
        AuthManager::clear(service)?;
        println!("Removed stored secret for {}.", service.to_string().cyan());
        return Ok(());
    }

    println!("{}", format!("Configuring {}...", service).cyan());

    let mut config = Config::load()?;
    AuthManager::configure(service, &mut config, force)?;
    let path = config.save()?;

    println!();
    println!("{}", "Configuration saved!".green().bold());
    println!("  Config: {}", path.display());
    if AuthManager::load(service).is_some() {
        println!("  Secret stored securely in system keyring.");
    } else {
        println!("  {}", "No secret stored; downloads may be refused.".yellow());
    }

    Ok(())
}

/// Handle the `config` command
pub fn config(config: &Config, show: bool) -> Result<()> {
    if show {
        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        println!("{}", json);
        return Ok(());
    }

    let path = Config::config_path()?;
    if path.exists() {
        println!("Config already exists at {}", path.display().to_string().cyan());
    } else {
        Config::load()?.save_to(&path)?;
        println!("{} {}", "Created".green(), path.display());
    }
    Ok(())
}

/// Handle the `completion` command
pub fn completion(shell: clap_complete::Shell) {
    let mut cmd = <super::Cli as clap::CommandFactory>::command();
    generate(shell, &mut cmd, "tunefetch", &mut io::stdout());
}
