//! # Commands Module
//!
//! Handlers behind the `sigtrans` subcommands:
//!
//! ## `keygen`
//! Writes an RSA key pair for one role (`sender` or `receiver`).
//!
//! ## `receive`
//! Runs the receiver until Ctrl-C:
//! - Loads its private key and the sender's public key
//! - Accepts connections and verifies every packet
//! - Writes completed files into the output directory
//!
//! ## `send`
//! Sends one or more files to a running receiver:
//! - Handshake, then RSA-wrapped session key exchange
//! - Each file split into parts, encrypted, digested and signed
//!
//! ## `verify`
//! Offline check of one part's signed digest, as printed by `send`.

pub mod keygen;
pub mod receive;
pub mod send;
pub mod verify;
