use std::error::Error;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use tokio::time::Duration;

use crate::activity::ActivityLog;
use crate::client::{ClientConfig, SenderClient};
use crate::keys::SenderKeys;

/// Connects to a receiver and sends each file in turn over one session.
///
/// The hash and signature of every part are printed at the end so they can
/// be checked offline with `sigtrans verify`.
pub async fn run(
    host: &str,
    port: u16,
    private_key: &Path,
    receiver_public_key: &Path,
    files: &[PathBuf],
    config: ClientConfig,
) -> Result<(), Box<dyn Error>> {
    for path in files {
        if !path.is_file() {
            return Err(format!("Not a file: {}", path.display()).into());
        }
    }

    let keys = SenderKeys::load(private_key, receiver_public_key)?;
    let activity = ActivityLog::new();

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Connecting to {}:{}", host, port));
    let mut client = SenderClient::connect((host, port), keys, &config, activity.clone()).await?;
    spinner.finish_with_message("Session established");

    let mut failed = 0usize;
    for path in files {
        let filename = match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_string(),
            None => {
                warn!("Skipping {}: no usable file name", path.display());
                failed += 1;
                continue;
            }
        };
        let content = tokio::fs::read(path).await?;
        debug!("Read {} ({} bytes)", path.display(), content.len());

        let bar = ProgressBar::new(content.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar().template("[{elapsed_precise}] [{bar:40.black}] {bytes}/{total_bytes} {msg}")?,
        );
        bar.set_message(filename.clone());

        match client
            .send_file_with_progress(&filename, &content, |n| bar.inc(n as u64))
            .await
        {
            Ok(report) => {
                bar.finish_with_message(format!("{} sent", filename));
                println!("{} ({} bytes, {} parts): {}", report.file_id, report.bytes, report.num_parts, report.message);
            }
            Err(e) if e.is_transport() => {
                bar.abandon_with_message(format!("{} failed", filename));
                return Err(e.into());
            }
            Err(e) => {
                bar.abandon_with_message(format!("{} failed", filename));
                eprintln!("Transfer of {} failed: {}", filename, e);
                failed += 1;
            }
        }
    }

    println!("Signed part digests (check with `sigtrans verify`):");
    for entry in activity.entries().iter().filter(|entry| entry.contains(" hash: ")) {
        println!("  {}", entry);
    }

    if failed > 0 {
        return Err(format!("{} of {} files failed", failed, files.len()).into());
    }
    Ok(())
}
