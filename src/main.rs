use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info};

use motion_stream::domain::models::Role;
use motion_stream::domain::settings::SettingsService;
use motion_stream::infrastructure::logging::init_logger;
use motion_stream::infrastructure::peer::service::PeerService;
use motion_stream::presentation::status::StatusView;

#[tokio::main]
async fn main() -> Result<()> {
    // Optional first argument: path to a settings file.
    let settings_service = match std::env::args().nth(1) {
        Some(path) => SettingsService::with_path(PathBuf::from(path)),
        None => SettingsService::new()?,
    };
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(
        "Starting motion stream ({} -> {}, settings at {})",
        settings.source_name,
        settings.display_name,
        settings_service.path().display()
    );

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let service = PeerService::start(&settings, event_tx)?;
    let mut status = StatusView::new();

    let run_for = settings
        .run_for_secs
        .map(Duration::from_secs)
        .unwrap_or(Duration::MAX);
    let deadline = tokio::time::sleep(run_for);
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => status.apply(&event),
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Interrupted, shutting down");
                break;
            }
            _ = &mut deadline => {
                info!("Run time of {:?} elapsed, shutting down", run_for);
                break;
            }
        }
    }

    let summary = service.shutdown().await?;
    while let Ok(event) = event_rx.try_recv() {
        status.apply(&event);
    }

    info!(
        "Done: {} sent, {} dropped, {} decoded; display shows '{}', source shows '{}'",
        summary.sent,
        summary.dropped,
        summary.decoded,
        status.label(Role::Advertiser),
        status.label(Role::Browser)
    );
    Ok(())
}
