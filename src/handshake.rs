//! Liveness handshake and RSA-wrapped session key exchange.
//!
//! ```text
//! Sender                                   Receiver
//! ──────                                   ────────
//! {handshake, "Hello!"}  ─────────────────►
//!                        ◄───────────────── {handshake, "Ready!"}
//! {key_exchange,
//!   RSA(key), RSA(iv),
//!   metadata, sign(SHA-512(metadata))} ───►
//!                        ◄───────────────── {status: OK}
//! ```
//!
//! Only the metadata is signed: it names the key sizes and the sender, so
//! the receiver learns who asserts which parameters, while the key itself is
//! protected by the receiver's public key.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Local;
use log::debug;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cryptography::{digest, rsa_decrypt, rsa_encrypt, sign_digest, verify_digest};
use crate::error::{Error, Result};
use crate::keys::{ReceiverKeys, SenderKeys};
use crate::networking::Connection;
use crate::session::{Session, SessionKey};
use crate::utils::{canonical_json, iso_timestamp, parse_packet, KeyExchangeMetadata, Packet, Status};
use crate::{HANDSHAKE_HELLO, HANDSHAKE_READY};

// ============================================================================
// Metadata signatures
// ============================================================================

/// Signs the canonical form of `metadata`, returning base64 text.
pub fn sign_metadata<T: Serialize>(metadata: &T, private_key: &RsaPrivateKey) -> Result<String> {
    let canonical = canonical_json(metadata)?;
    let signature = sign_digest(&digest(&canonical), private_key)?;
    Ok(STANDARD.encode(signature))
}

/// Verifies a base64 signature over the canonical form of the received
/// metadata document.
pub fn verify_metadata(metadata: &Value, signed_metadata: &str, public_key: &RsaPublicKey) -> Result<()> {
    let signature = STANDARD.decode(signed_metadata)?;
    let canonical = canonical_json(metadata)?;
    if verify_digest(&digest(&canonical), &signature, public_key) {
        Ok(())
    } else {
        Err(Error::Authenticity {
            message: "metadata signature does not verify".to_string(),
        })
    }
}

// ============================================================================
// Sender side
// ============================================================================

/// Sends "Hello!" and requires an exact "Ready!" handshake reply.
pub async fn client_handshake<S>(conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(&Packet::Handshake {
        message: HANDSHAKE_HELLO.to_string(),
        status: None,
    })
    .await?;

    let reply = conn.recv().await?;
    match parse_packet(reply.clone()) {
        Ok(Packet::Handshake { message, status: None }) if message == HANDSHAKE_READY => {
            debug!("Handshake accepted");
            Ok(())
        }
        _ => Err(Error::Handshake {
            message: format!("unexpected reply {}", reply),
        }),
    }
}

/// Builds the `key_exchange` packet for a freshly generated session key.
pub fn build_key_exchange(session_key: &SessionKey, keys: &SenderKeys, sender_id: &str) -> Result<Packet> {
    let encrypted_key = rsa_encrypt(session_key.key(), &keys.receiver_public)?;
    let encrypted_iv = rsa_encrypt(session_key.iv(), &keys.receiver_public)?;

    let metadata = KeyExchangeMetadata {
        timestamp: iso_timestamp(Local::now()),
        sender: sender_id.to_string(),
        key_size: (session_key.key().len() * 8) as u64,
        iv_size: (session_key.iv().len() * 8) as u64,
    };
    let signed_metadata = sign_metadata(&metadata, &keys.private_key)?;

    Ok(Packet::KeyExchange {
        encrypted_session_key: STANDARD.encode(encrypted_key),
        encrypted_session_iv: STANDARD.encode(encrypted_iv),
        metadata: serde_json::to_value(&metadata)?,
        signed_metadata,
    })
}

/// Generates, wraps and sends a session key; returns it once the receiver
/// acknowledges.
pub async fn offer_session_key<S>(conn: &mut Connection<S>, keys: &SenderKeys, sender_id: &str) -> Result<SessionKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session_key = SessionKey::generate();
    conn.send(&build_key_exchange(&session_key, keys, sender_id)?).await?;

    let reply = conn.recv_reply().await?;
    if !reply.is_ok() {
        return Err(Error::Rejected { message: reply.message });
    }
    debug!("Session key accepted: {}", reply.message);
    Ok(session_key)
}

// ============================================================================
// Receiver side
// ============================================================================

/// Checks a handshake request and returns the reply to send.
///
/// Only an exact "Hello!" advances the session.
pub fn answer_handshake(session: &mut Session, message: &str) -> Packet {
    if message == HANDSHAKE_HELLO {
        session.complete_handshake();
        Packet::Handshake {
            message: HANDSHAKE_READY.to_string(),
            status: None,
        }
    } else {
        Packet::Handshake {
            message: "Invalid handshake message.".to_string(),
            status: Some(Status::Error),
        }
    }
}

/// Authenticates the key-exchange metadata and unwraps the session key.
///
/// The signature is checked before any decryption is attempted.
pub fn accept_session_key(
    keys: &ReceiverKeys,
    encrypted_session_key: &str,
    encrypted_session_iv: &str,
    metadata: &Value,
    signed_metadata: &str,
) -> Result<SessionKey> {
    verify_metadata(metadata, signed_metadata, &keys.sender_public).map_err(|e| match e {
        Error::Authenticity { .. } => Error::Authenticity {
            message: "key exchange metadata signature is invalid".to_string(),
        },
        other => other,
    })?;

    let key = rsa_decrypt(&STANDARD.decode(encrypted_session_key)?, &keys.private_key)?;
    let iv = rsa_decrypt(&STANDARD.decode(encrypted_session_iv)?, &keys.private_key)?;
    let session_key = SessionKey::from_slices(&key, &iv)?;

    // The signed sizes must describe what was actually unwrapped.
    let declared: KeyExchangeMetadata = serde_json::from_value(metadata.clone())
        .map_err(|e| Error::protocol(format!("malformed key exchange metadata: {}", e)))?;
    if declared.key_size != (key.len() * 8) as u64 || declared.iv_size != (iv.len() * 8) as u64 {
        return Err(Error::protocol(format!(
            "declared sizes {}/{} bits do not match unwrapped key material",
            declared.key_size, declared.iv_size
        )));
    }

    Ok(session_key)
}
