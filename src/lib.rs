pub mod activity;
pub mod bytes;
pub mod client;
pub mod cryptography;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod networking;
pub mod server;
pub mod session;
pub mod transfer;
pub mod utils;
pub mod commands;

pub use error::{Error, Result};

/// Triple-DES (EDE3) key length in bytes.
pub const SESSION_KEY_SIZE: usize = 24;
/// Block size of the session cipher; also the length of every IV on the wire.
pub const SESSION_IV_SIZE: usize = 8;
/// Files of at least this many bytes are always split into exactly this many parts.
pub const TARGET_PARTS: u64 = 3;
/// Upper bound on a single framed packet.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
pub const RSA_KEY_BITS: usize = 2048;

pub const HANDSHAKE_HELLO: &str = "Hello!";
pub const HANDSHAKE_READY: &str = "Ready!";
