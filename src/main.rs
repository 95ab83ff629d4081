// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use romfetch::download::{JobLedger, JobProgress, JobStatus, OwnershipLedger};
use romfetch::{logging, DownloadManager, Server, Settings};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - the job failed
    pub const ERROR: i32 = 1;
    /// Interrupted by Ctrl+C
    pub const INTERRUPTED: i32 = 130;
}

use exit_codes::*;

/// romfetch - Multi-provider ROM download orchestrator.
#[derive(Parser)]
#[command(name = "romfetch")]
#[command(version = VERSION)]
#[command(about = "Multi-provider ROM download orchestrator. Locker links in, verified files out.")]
#[command(long_about = "romfetch - Multi-provider ROM download orchestrator\n\n\
    Start the server:    romfetch (or: romfetch serve)\n\
    One-off download:    romfetch get <URL> --game \"Foo\" --platform SNES\n\
    Job history:         romfetch history\n\
    Owned games:         romfetch owned\n\n\
    Locker links go through 1fichier, AllDebrid, RealDebrid, then free mode.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Settings file (default: ~/.romfetch/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Put roms/ and data/ under one directory
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Verbose mode: detailed output for debugging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API (default)
    ///
    /// Examples:
    ///   romfetch serve
    ///   romfetch serve --port 9000 --bind 0.0.0.0
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to
        #[arg(long)]
        bind: Option<String>,
    },

    /// Download one link in the foreground
    ///
    /// Examples:
    ///   romfetch get "https://1fichier.com/?abc123" --game "Foo" --platform SNES
    ///   romfetch get https://host/Bar.zip --game Bar --platform "PlayStation 3" --extract
    Get {
        /// Source link
        url: String,
        /// Display name, used for the file name
        #[arg(short, long)]
        game: String,
        /// Platform, selects the destination folder
        #[arg(short, long)]
        platform: String,
        /// Extract archives even when the platform does not require it
        #[arg(long)]
        extract: bool,
    },

    /// Show the job ledger
    ///
    /// Examples:
    ///   romfetch history
    ///   romfetch history --json
    ///   romfetch history clear
    History {
        #[command(subcommand)]
        command: Option<HistoryCommands>,
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// List games recorded as downloaded
    Owned,
}

#[derive(Subcommand)]
enum HistoryCommands {
    /// Drop finished entries (queued and running ones stay)
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(root) = &cli.root {
        let rooted = Settings::rooted_at(root);
        settings.roms_dir = rooted.roms_dir;
        settings.data_dir = rooted.data_dir;
    }
    logging::init(cli.verbose, settings.log_dir.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve { port: None, bind: None }) {
        Commands::Serve { port, bind } => serve(settings, port, bind).await,
        Commands::Get { url, game, platform, extract } => {
            let code = get(settings, &url, &game, &platform, extract).await?;
            std::process::exit(code);
        }
        Commands::History { command: Some(HistoryCommands::Clear), .. } => {
            let removed = JobLedger::new(settings.ledger_path()).clear()?;
            println!("{} Removed {} finished entries", "[OK]".green(), removed);
            Ok(())
        }
        Commands::History { command: None, json } => show_history(&settings, json),
        Commands::Owned => show_owned(&settings),
    }
}

async fn serve(mut settings: Settings, port: Option<u16>, bind: Option<String>) -> Result<()> {
    if let Some(port) = port {
        settings.server.port = port;
    }
    if let Some(bind) = bind {
        settings.server.bind_address = bind;
    }

    let settings = Arc::new(settings);
    println!(
        "{} romfetch {} - library at {}",
        "[..]".cyan(),
        VERSION,
        settings.roms_dir.display()
    );
    let manager = Arc::new(DownloadManager::new(settings.clone()).context("Failed to start download queue")?);
    Server::new(manager, settings.server.port)
        .with_bind_address(settings.server.bind_address.clone())
        .start()
        .await
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn render(bar: &ProgressBar, view: &JobProgress) {
    bar.set_position(view.progress_percent as u64);
    let message = match view.status {
        JobStatus::Downloading if view.speed > 0.0 => format!("{} ({})", view.message, view.speed_string()),
        _ => view.message.clone(),
    };
    bar.set_message(message);
}

async fn get(settings: Settings, url: &str, game: &str, platform: &str, extract: bool) -> Result<i32> {
    let manager = DownloadManager::new(Arc::new(settings)).context("Failed to start download queue")?;
    let mut handle = manager.enqueue(url, game, platform, extract)?;
    let task_id = handle.task_id;
    let bar = progress_bar();

    let interrupted = loop {
        render(&bar, &handle.progress());
        if handle.is_complete() {
            break false;
        }
        tokio::select! {
            alive = handle.changed() => {
                if !alive {
                    break false;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                manager.cancel(task_id);
                break true;
            }
        }
    };

    let done = if interrupted { handle.wait().await } else { handle.progress() };
    bar.finish_and_clear();
    manager.shutdown().await;

    let code = match done.status {
        JobStatus::DownloadOk => {
            println!("{} {}", "[OK]".green(), done.message);
            SUCCESS
        }
        JobStatus::Canceled => {
            println!("{} {}", "[!]".yellow(), done.message);
            INTERRUPTED
        }
        _ => {
            println!("{} {}", "[X]".red(), done.message);
            ERROR
        }
    };
    Ok(code)
}

fn colored_status(status: JobStatus) -> colored::ColoredString {
    let text = format!("{:<11}", status.as_str());
    match status {
        JobStatus::DownloadOk => text.green(),
        JobStatus::Failed => text.red(),
        JobStatus::Canceled => text.yellow(),
        JobStatus::Downloading | JobStatus::Extracting => text.cyan(),
        JobStatus::Queued => text.dimmed(),
    }
}

fn show_history(settings: &Settings, json: bool) -> Result<()> {
    let entries = JobLedger::new(settings.ledger_path()).load()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No downloads recorded yet.");
        return Ok(());
    }

    for entry in &entries {
        let provider = entry.provider.map(|p| p.tag()).unwrap_or("-");
        println!(
            "{} {:>3}%  {:<6} {} [{}]",
            colored_status(entry.status),
            entry.progress_percent,
            provider,
            entry.display_name.bold(),
            entry.platform
        );
        if !entry.message.is_empty() {
            println!("      {}", entry.message.dimmed());
        }
    }
    Ok(())
}

fn show_owned(settings: &Settings) -> Result<()> {
    let owned = OwnershipLedger::new(settings.ownership_path()).load()?;
    if owned.is_empty() {
        println!("No games recorded as downloaded.");
        return Ok(());
    }
    for (platform, games) in &owned {
        println!("{} ({})", platform.bold(), games.len());
        for (game, record) in games {
            let size = record
                .size
                .map(|s| format!("{:.1} MB", s as f64 / (1024.0 * 1024.0)))
                .unwrap_or_else(|| "?".to_string());
            println!("  {} {} {}", game, size.dimmed(), record.timestamp.dimmed());
        }
    }
    Ok(())
}
