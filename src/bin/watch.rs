//! commonplace-filesync-watch: track files and print sync events
//!
//! Usage:
//!   commonplace-filesync-watch notes.md todo.txt
//!   commonplace-filesync-watch --reactive --state-file .sync-state.json notes.md
//!
//! Events are written to stdout as one JSON object per line; logs go to stderr.

use clap::Parser;
use commonplace_filesync::cli::WatchArgs;
use commonplace_filesync::storage::LocalFileStorage;
use commonplace_filesync::tracker::{SyncEvent, TrackOptions};
use commonplace_filesync::SyncSession;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let args = WatchArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match args.resolve_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("[watch] Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let mut session = SyncSession::create(Arc::new(LocalFileStorage), &config);
    tracing::info!(
        "[watch] Observer: {:?}, {}ms latency",
        session.capabilities().kind,
        session.capabilities().latency_ms
    );

    if let Some(state_file) = args.state_file.as_deref().filter(|p| p.exists()) {
        match session.restore_state(state_file).await {
            Ok(outcome) => print_events(&outcome.events),
            Err(e) => tracing::warn!("[watch] Ignoring state file: {}", e),
        }
    }

    for path in &args.paths {
        // Two spellings of one file share one entry.
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
        if session.tracker().is_tracked(&path) {
            continue;
        }
        let options = TrackOptions {
            reactive: args.reactive,
            ..TrackOptions::default()
        };
        match session.open(&path, options).await {
            Ok(state) => tracing::info!("[watch] {} is {:?}", path.display(), state),
            Err(e) => tracing::error!("[watch] Cannot track {}: {}", path.display(), e),
        }
    }

    if session.tracker().tracked_paths().next().is_none() {
        tracing::error!("[watch] Nothing to track");
        std::process::exit(1);
    }

    let mut retry = tokio::time::interval(config.poll_interval());
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("[watch] Received Ctrl+C");
                break;
            }
            _ = retry.tick() => {
                let outcome = session.refresh_unobserved().await;
                print_events(&outcome.events);
            }
            outcome = session.next_events() => {
                let Some(outcome) = outcome else {
                    tracing::warn!("[watch] Observer disconnected");
                    break;
                };
                print_events(&outcome.events);
                for error in outcome.errors {
                    tracing::warn!("[watch] {}", error);
                }
            }
        }
    }

    if let Some(state_file) = &args.state_file {
        save_state(&session, state_file).await;
    }
    session.dispose().await;
}

fn print_events(events: &[SyncEvent]) {
    for event in events {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("[watch] Cannot serialize {} event: {}", event.kind(), e),
        }
    }
}

async fn save_state(session: &SyncSession, path: &Path) {
    match session.save_state(path).await {
        Ok(()) => tracing::info!("[watch] Saved state to {}", path.display()),
        Err(e) => tracing::error!("[watch] Failed to save state: {}", e),
    }
}
