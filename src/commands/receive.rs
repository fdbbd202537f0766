use std::error::Error;
use std::path::Path;

use log::{debug, info};

use crate::activity::ActivityLog;
use crate::keys::ReceiverKeys;
use crate::server::{ReceiverServer, ServerConfig};

/// Runs the receiver until Ctrl-C.
///
/// Every accepted connection is served on its own task; completed files land
/// in `config.storage_dir`.
pub async fn run(private_key: &Path, sender_public_key: &Path, config: ServerConfig) -> Result<(), Box<dyn Error>> {
    debug!("Starting receive command");

    let keys = ReceiverKeys::load(private_key, sender_public_key)?;
    let storage_dir = config.storage_dir.clone();
    let activity = ActivityLog::new();

    let mut server = ReceiverServer::new(config, keys, activity.clone());
    let addr = server.start().await?;
    println!("Listening on {}, saving files to {}", addr, storage_dir.display());
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    server.stop().await?;

    let failures = activity
        .entries()
        .iter()
        .filter(|entry| entry.contains("failed") || entry.contains("Failed"))
        .count();
    println!("Receiver stopped: {} events recorded, {} failures", activity.len(), failures);
    Ok(())
}
