use clap::{Parser, Subcommand};
use std::error::Error;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use sigtrans::client::ClientConfig;
use sigtrans::commands::keygen::Role;
use sigtrans::server::ServerConfig;
use sigtrans::RSA_KEY_BITS;

#[derive(Parser)]
#[command(name = "sigtrans")]
#[command(about = "Signed and encrypted point-to-point file transfer", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an RSA key pair for the sender or the receiver
    Keygen {
        #[arg(long, value_enum)]
        role: Role,
        /// Directory the PEM files are written to
        #[arg(long, default_value = "keys")]
        out_dir: PathBuf,
        #[arg(long, default_value_t = RSA_KEY_BITS)]
        bits: usize,
    },
    /// Receive files until interrupted
    Receive {
        /// Receiver's private key (PEM)
        #[arg(long)]
        private_key: PathBuf,
        /// Sender's public key (PEM)
        #[arg(long)]
        sender_public_key: PathBuf,
        #[arg(short, long, default_value = "5001")]
        port: u16,
        /// Where received files are saved
        #[arg(short, long, default_value = "received_files")]
        output_dir: PathBuf,
        /// Seconds to wait for a peer's next packet (0 waits forever)
        #[arg(long, default_value = "300")]
        idle_timeout: u64,
    },
    /// Send one or more files to a receiver
    Send {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value = "5001")]
        port: u16,
        /// Sender's private key (PEM)
        #[arg(long)]
        private_key: PathBuf,
        /// Receiver's public key (PEM)
        #[arg(long)]
        receiver_public_key: PathBuf,
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Check a part's signed digest from the sender's log
    Verify {
        /// Signer's public key (PEM)
        #[arg(long)]
        public_key: PathBuf,
        /// Base64 SHA-512 of iv || cipher
        #[arg(long)]
        hash: String,
        /// Base64 signature over the hash
        #[arg(long)]
        signature: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Keygen { role, out_dir, bits } => {
            sigtrans::commands::keygen::run(role, &out_dir, bits).await?;
        }
        Commands::Receive {
            private_key,
            sender_public_key,
            port,
            output_dir,
            idle_timeout,
        } => {
            let config = ServerConfig {
                bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                storage_dir: output_dir,
                idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
                ..ServerConfig::default()
            };
            sigtrans::commands::receive::run(&private_key, &sender_public_key, config).await?;
        }
        Commands::Send {
            host,
            port,
            private_key,
            receiver_public_key,
            files,
        } => {
            sigtrans::commands::send::run(
                &host,
                port,
                &private_key,
                &receiver_public_key,
                &files,
                ClientConfig::default(),
            )
            .await?;
        }
        Commands::Verify {
            public_key,
            hash,
            signature,
        } => {
            sigtrans::commands::verify::run(&public_key, &hash, &signature).await?;
        }
    }

    Ok(())
}
