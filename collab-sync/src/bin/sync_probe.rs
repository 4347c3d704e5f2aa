//! sync-probe: run one collaboration session and log its health.
//!
//! ```text
//! RUST_LOG=info sync-probe session.json
//! ```

use std::time::Duration;

use collab_sync::{CollaborationSession, SessionEvent, SyncConfig, SyncError};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run().await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), SyncError> {
    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| SyncError::Config("usage: sync-probe <config.json>".into()))?;
    let config = SyncConfig::from_file(&path)?;

    log::info!("Starting sync probe for '{}'", config.document_name);
    let session = CollaborationSession::start(config, |event: SessionEvent| {
        log::info!("Session event: {event:?}");
    })?;

    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let health = session.health();
                log::info!(
                    "mode={:?} failures={} staleness={} push_open={} can_edit={} reconciliations={} peers={}",
                    health.mode,
                    health.failure_count,
                    health.staleness,
                    health.push_channel_open,
                    health.can_edit,
                    health.reconciliations,
                    session.presence_peers().len(),
                );
                if let Some(error) = health.last_error {
                    log::info!("last error: {error}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.destroy();
    log::info!("Sync probe stopped");
    Ok(())
}
