use std::error::Error;
use std::fmt;
use std::path::Path;

use clap::ValueEnum;
use indicatif::ProgressBar;
use log::debug;
use tokio::time::Duration;

use crate::keys::generate_key_files;

/// Which side of a transfer a key pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// Generates a key pair for `role` and writes both PEM files into `out_dir`.
///
/// The private key must stay with its owner; the public key is handed to the
/// other side out of band.
pub async fn run(role: Role, out_dir: &Path, bits: usize) -> Result<(), Box<dyn Error>> {
    debug!("Generating {}-bit {} key pair", bits, role);

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Generating {}-bit RSA key pair", bits));

    // RSA prime search is CPU-bound; keep it off the async workers.
    let dir = out_dir.to_path_buf();
    let role_name = role.to_string();
    let (private_path, public_path) =
        tokio::task::spawn_blocking(move || generate_key_files(&dir, &role_name, bits)).await??;

    spinner.finish_with_message("Key pair generated");
    println!("Private key: {}", private_path.display());
    println!("Public key:  {}", public_path.display());
    Ok(())
}
