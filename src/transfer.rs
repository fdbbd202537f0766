//! Chunked file transfer: `file_init`, `file_chunk`, `file_end_signal`.
//!
//! The sender side builds packets; the receiver side applies them to the
//! [`Session`] owned by the connection worker and says what to answer.

use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Local;
use log::debug;
use rsa::RsaPublicKey;
use serde_json::Value;

use crate::activity::ActivityLog;
use crate::bytes::{part_count, part_size, persist_file, sanitize_filename};
use crate::cryptography::{chunk_digest, decrypt_chunk, encrypt_chunk, random_bytes, sign_digest, verify_digest};
use crate::error::{Error, Result};
use crate::handshake::{sign_metadata, verify_metadata};
use crate::keys::{ReceiverKeys, SenderKeys};
use crate::session::{Session, SessionKey, TransferOutcome};
use crate::utils::{iso_timestamp, make_file_id, ChunkPacket, FileMetadata, Packet, PacketKind, Reply};
use crate::SESSION_IV_SIZE;

// ============================================================================
// Sender side
// ============================================================================

/// Describes and signs a new file transfer.
///
/// Returns the metadata (for the caller's bookkeeping) and the `file_init`
/// packet announcing it.
pub fn open_file(filename: &str, file_size: u64, keys: &SenderKeys) -> Result<(FileMetadata, Packet)> {
    let now = Local::now();
    let metadata = FileMetadata {
        file_id: make_file_id(filename, now),
        filename: filename.to_string(),
        file_size,
        num_parts: part_count(file_size),
        timestamp: iso_timestamp(now),
    };
    let signed_metadata = sign_metadata(&metadata, &keys.private_key)?;

    let packet = Packet::FileInit {
        metadata: serde_json::to_value(&metadata)?,
        signed_metadata,
    };
    Ok((metadata, packet))
}

/// Encrypts one part under a fresh IV, then digests and signs `iv || cipher`.
pub fn seal_chunk(
    session_key: &SessionKey,
    keys: &SenderKeys,
    file_id: &str,
    part_number: u64,
    total_parts: u64,
    data: &[u8],
) -> Result<ChunkPacket> {
    let iv = random_bytes::<SESSION_IV_SIZE>();
    let cipher = encrypt_chunk(session_key.key(), &iv, data)?;
    let hash = chunk_digest(&iv, &cipher);
    let signature = sign_digest(&hash, &keys.private_key)?;

    debug!(
        "Sealed part {}/{} of {}: {} -> {} bytes",
        part_number + 1,
        total_parts,
        file_id,
        data.len(),
        cipher.len()
    );

    Ok(ChunkPacket {
        file_id: file_id.to_string(),
        part_number,
        total_parts,
        iv: STANDARD.encode(iv),
        cipher: STANDARD.encode(cipher),
        hash: STANDARD.encode(hash),
        signature: STANDARD.encode(signature),
    })
}

// ============================================================================
// Receiver side
// ============================================================================

/// Everything a connection worker needs besides its own session.
#[derive(Clone)]
pub struct ReceiverContext {
    pub keys: ReceiverKeys,
    pub storage_dir: PathBuf,
    /// Largest `file_size` a `file_init` may declare.
    pub max_file_size: u64,
    pub activity: ActivityLog,
}

/// What a handler decided: an optional reply for the peer and, when a file
/// left the session, how it ended.
#[derive(Debug, Default, PartialEq)]
pub struct Handled {
    pub reply: Option<Reply>,
    pub outcome: Option<TransferOutcome>,
}

impl Handled {
    fn silent() -> Self {
        Self::default()
    }

    fn reply(reply: Reply) -> Self {
        Handled {
            reply: Some(reply),
            outcome: None,
        }
    }

    fn aborted(reply: Reply, file_id: &str, reason: impl Into<String>) -> Self {
        Handled {
            reply: Some(reply),
            outcome: Some(TransferOutcome::Aborted {
                file_id: file_id.to_string(),
                reason: reason.into(),
            }),
        }
    }
}

/// Verifies a `file_init` and starts tracking the file.
///
/// Any earlier state under the same id is replaced on success and dropped
/// on a failed signature check.
pub fn handle_file_init(ctx: &ReceiverContext, session: &mut Session, metadata: &Value, signed_metadata: &str) -> Handled {
    let peer = session.peer();
    let file_id = match metadata.get("file_id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            ctx.activity.record_failure(format!("File init from {} rejected: missing file_id", peer));
            return Handled::reply(Reply::error("Invalid file init packet: missing file_id."));
        }
    };

    match accept_file_metadata(ctx, metadata, signed_metadata) {
        Ok(accepted) => {
            ctx.activity.record(format!(
                "Initialized file '{}' (ID: {}, {} bytes in {} parts) from {}",
                accepted.filename, file_id, accepted.file_size, accepted.num_parts, peer
            ));
            session.begin_file(accepted);
            Handled::reply(Reply::ok("File init received and verified."))
        }
        Err(e) => {
            if session.take_file(&file_id).is_some() {
                debug!("Dropped earlier state for {} after failed init", file_id);
            }
            ctx.activity
                .record_failure(format!("File init for '{}' from {} failed: {}", file_id, peer, e));
            Handled::reply(Reply::error(format!("File init failed: {}", e)))
        }
    }
}

fn accept_file_metadata(ctx: &ReceiverContext, metadata: &Value, signed_metadata: &str) -> Result<FileMetadata> {
    verify_metadata(metadata, signed_metadata, &ctx.keys.sender_public).map_err(|e| match e {
        Error::Authenticity { .. } => Error::Authenticity {
            message: "file metadata signature is invalid".to_string(),
        },
        other => other,
    })?;

    let accepted: FileMetadata = serde_json::from_value(metadata.clone())
        .map_err(|e| Error::protocol(format!("malformed file metadata: {}", e)))?;

    if accepted.file_size > ctx.max_file_size {
        return Err(Error::protocol(format!(
            "file of {} bytes exceeds limit of {} bytes",
            accepted.file_size, ctx.max_file_size
        )));
    }
    let expected_parts = part_count(accepted.file_size);
    if accepted.num_parts != expected_parts {
        return Err(Error::protocol(format!(
            "{} parts declared, {} bytes splits into {}",
            accepted.num_parts, accepted.file_size, expected_parts
        )));
    }
    if sanitize_filename(&accepted.filename).is_none() {
        return Err(Error::protocol(format!("unusable filename '{}'", accepted.filename)));
    }
    Ok(accepted)
}

/// Authenticates, decrypts and stores one chunk.
///
/// Success is silent. Any failure after the file lookup aborts the whole
/// file; every failure is answered with an ERROR tagged `file_chunk`.
pub fn handle_file_chunk(ctx: &ReceiverContext, session: &mut Session, chunk: &ChunkPacket) -> Handled {
    let peer = session.peer();
    let part = chunk.part_number;

    let (num_parts, max_part_len, filename) = match session.file(&chunk.file_id) {
        Some(state) => {
            let metadata = state.metadata();
            (metadata.num_parts, part_size(metadata.file_size), metadata.filename.clone())
        }
        None => {
            ctx.activity.record_failure(format!(
                "Chunk {} from {} names unknown file ID {}",
                part, peer, chunk.file_id
            ));
            return Handled::reply(Reply::error("Invalid or uninitialized file ID.").answering(PacketKind::FileChunk));
        }
    };

    let opened = open_chunk(session.session_key(), &ctx.keys.sender_public, chunk, num_parts, max_part_len);
    match opened {
        Ok(content) => {
            if let Some(state) = session.file_mut(&chunk.file_id) {
                state.store_chunk(part, content);
            }
            ctx.activity.record(format!(
                "Received part {}/{} of file '{}' from {}",
                part + 1,
                num_parts,
                filename,
                peer
            ));
            Handled::silent()
        }
        Err(e) => {
            session.take_file(&chunk.file_id);
            ctx.activity.record_failure(format!(
                "Failed to process part {} of file '{}' from {}: {}",
                part, chunk.file_id, peer, e
            ));
            let reply = Reply::error(format!("Failed to process part {}: {}", part, e)).answering(PacketKind::FileChunk);
            Handled::aborted(reply, &chunk.file_id, e.to_string())
        }
    }
}

fn open_chunk(
    session_key: Option<&SessionKey>,
    sender_public: &RsaPublicKey,
    chunk: &ChunkPacket,
    num_parts: u64,
    max_part_len: u64,
) -> Result<Vec<u8>> {
    let session_key = session_key.ok_or_else(|| Error::protocol("session key not established for this client"))?;

    if chunk.part_number >= num_parts {
        return Err(Error::protocol(format!(
            "part {} out of range for {} parts",
            chunk.part_number, num_parts
        )));
    }

    let iv = STANDARD.decode(&chunk.iv)?;
    let cipher = STANDARD.decode(&chunk.cipher)?;
    let received_hash = STANDARD.decode(&chunk.hash)?;
    let signature = STANDARD.decode(&chunk.signature)?;

    let hash = chunk_digest(&iv, &cipher);
    if hash != received_hash {
        return Err(Error::Integrity { part: chunk.part_number });
    }
    if !verify_digest(&hash, &signature, sender_public) {
        return Err(Error::Authenticity {
            message: format!("signature of part {} is invalid", chunk.part_number),
        });
    }

    let content = decrypt_chunk(session_key.key(), &iv, &cipher)?;
    if content.len() as u64 > max_part_len {
        return Err(Error::protocol(format!(
            "part {} holds {} bytes, at most {} expected",
            chunk.part_number,
            content.len(),
            max_part_len
        )));
    }
    Ok(content)
}

/// Finishes a file: checks completeness, reassembles and writes it out.
///
/// The file's state is gone afterwards whatever the result. The reply is
/// tagged `file_end_signal`.
pub async fn handle_file_end(ctx: &ReceiverContext, session: &mut Session, file_id: &str) -> Handled {
    let peer = session.peer();
    let answer = |reply: Reply| reply.answering(PacketKind::FileEndSignal);

    let Some(state) = session.take_file(file_id) else {
        let message = format!("File ID {} does not exist or was already processed.", file_id);
        ctx.activity.record(message.clone());
        return Handled::reply(answer(Reply::ok(message)));
    };

    let filename = state.metadata().filename.clone();
    if !state.is_complete() {
        let message = format!(
            "File '{}' is missing parts: expected {}, received {}.",
            filename,
            state.metadata().num_parts,
            state.received_count()
        );
        ctx.activity.record_failure(message.clone());
        return Handled::aborted(answer(Reply::error(message.clone())), file_id, message);
    }

    let saved = match state.into_content() {
        Ok(content) => persist_file(&ctx.storage_dir, &filename, &content)
            .await
            .map(|path| (path, content.len())),
        Err(e) => Err(e),
    };

    match saved {
        Ok((path, bytes)) => {
            ctx.activity.record(format!(
                "File '{}' (ID: {}) from {} received, decrypted and saved to {}",
                filename,
                file_id,
                peer,
                path.display()
            ));
            Handled {
                reply: Some(answer(Reply::ok(format!("File '{}' received and saved.", filename)))),
                outcome: Some(TransferOutcome::Completed {
                    file_id: file_id.to_string(),
                    path,
                    bytes,
                }),
            }
        }
        Err(e) => {
            let message = format!("Failed to complete file '{}' (ID: {}): {}", filename, file_id, e);
            ctx.activity.record_failure(message.clone());
            Handled::aborted(answer(Reply::error(message)), file_id, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::split_parts;
    use crate::keys::test_support::matching_keys;
    use crate::utils::Status;
    use std::net::SocketAddr;
    use std::path::Path;

    fn context(storage_dir: &Path) -> (SenderKeys, ReceiverContext) {
        let (sender_keys, receiver_keys) = matching_keys();
        let ctx = ReceiverContext {
            keys: receiver_keys,
            storage_dir: storage_dir.to_path_buf(),
            max_file_size: 1024,
            activity: ActivityLog::new(),
        };
        (sender_keys, ctx)
    }

    fn established(session_key: &SessionKey) -> Session {
        let mut session = Session::new(SocketAddr::from(([127, 0, 0, 1], 5555)));
        session.complete_handshake();
        session.establish(session_key.clone());
        session
    }

    fn init_parts(packet: Packet) -> (Value, String) {
        match packet {
            Packet::FileInit {
                metadata,
                signed_metadata,
            } => (metadata, signed_metadata),
            other => panic!("expected file init, got {:?}", other),
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("test_sigtrans_{}_{}", name, std::process::id()))
    }

    /// Inits `content` on `session` and returns its metadata and sealed chunks.
    fn prepare(
        ctx: &ReceiverContext,
        sender_keys: &SenderKeys,
        session_key: &SessionKey,
        session: &mut Session,
        filename: &str,
        content: &[u8],
    ) -> (FileMetadata, Vec<ChunkPacket>) {
        let (metadata, packet) = open_file(filename, content.len() as u64, sender_keys).unwrap();
        let (value, signed) = init_parts(packet);
        let handled = handle_file_init(ctx, session, &value, &signed);
        assert!(handled.reply.unwrap().is_ok());

        let parts = split_parts(content);
        let chunks = parts
            .iter()
            .enumerate()
            .map(|(i, data)| {
                seal_chunk(session_key, sender_keys, &metadata.file_id, i as u64, metadata.num_parts, data).unwrap()
            })
            .collect();
        (metadata, chunks)
    }

    // ============================================================================
    // Init Tests
    // ============================================================================

    #[test]
    fn test_open_file_metadata() {
        let (sender_keys, _) = matching_keys();
        let (metadata, packet) = open_file("report.pdf", 11, &sender_keys).unwrap();

        assert!(metadata.file_id.starts_with("report.pdf_"));
        assert_eq!(metadata.num_parts, 3);
        let (value, _) = init_parts(packet);
        assert_eq!(value["file_id"], metadata.file_id.as_str());
        assert_eq!(value["file_size"], 11);
    }

    #[test]
    fn test_init_rejections_keep_no_state() {
        let (sender_keys, ctx) = context(&temp_dir("init"));
        let mut session = established(&SessionKey::generate());

        // missing file_id
        let handled = handle_file_init(&ctx, &mut session, &serde_json::json!({"filename": "a"}), "");
        assert_eq!(handled.reply.unwrap().status, Status::Error);

        // signature over different metadata
        let (_, packet) = open_file("a.txt", 3, &sender_keys).unwrap();
        let (mut value, signed) = init_parts(packet);
        value["file_size"] = Value::from(4);
        let handled = handle_file_init(&ctx, &mut session, &value, &signed);
        let reply = handled.reply.unwrap();
        assert!(!reply.is_ok());
        assert!(reply.message.contains("signature"));

        // larger than the configured limit
        let (_, packet) = open_file("big.bin", 4096, &sender_keys).unwrap();
        let (value, signed) = init_parts(packet);
        assert!(!handle_file_init(&ctx, &mut session, &value, &signed).reply.unwrap().is_ok());

        // no usable final path component
        let (_, packet) = open_file("..", 3, &sender_keys).unwrap();
        let (value, signed) = init_parts(packet);
        assert!(!handle_file_init(&ctx, &mut session, &value, &signed).reply.unwrap().is_ok());

        assert_eq!(session.files_in_flight(), 0);
    }

    // ============================================================================
    // Chunk and End Tests
    // ============================================================================

    #[tokio::test]
    async fn test_hello_world_out_of_order() {
        let dir = temp_dir("hello");
        let (sender_keys, ctx) = context(&dir);
        let session_key = SessionKey::generate();
        let mut session = established(&session_key);

        let (metadata, chunks) = prepare(&ctx, &sender_keys, &session_key, &mut session, "a.txt", b"hello world");
        for index in [2usize, 0, 1] {
            assert_eq!(handle_file_chunk(&ctx, &mut session, &chunks[index]), Handled::silent());
        }

        let handled = handle_file_end(&ctx, &mut session, &metadata.file_id).await;
        let reply = handled.reply.unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.in_reply_to, Some(PacketKind::FileEndSignal));
        match handled.outcome {
            Some(TransferOutcome::Completed { path, bytes, .. }) => {
                assert_eq!(bytes, 11);
                assert_eq!(std::fs::read(path).unwrap(), b"hello world");
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(session.files_in_flight(), 0);
        assert!(ctx.activity.contains("Received part 3/3 of file 'a.txt'"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_tampered_cipher_aborts_file() {
        let (sender_keys, ctx) = context(&temp_dir("tamper"));
        let session_key = SessionKey::generate();
        let mut session = established(&session_key);

        let (metadata, mut chunks) = prepare(&ctx, &sender_keys, &session_key, &mut session, "a.txt", b"hello world");
        let mut cipher = STANDARD.decode(&chunks[1].cipher).unwrap();
        cipher[0] ^= 0x01;
        chunks[1].cipher = STANDARD.encode(cipher);

        assert_eq!(handle_file_chunk(&ctx, &mut session, &chunks[0]), Handled::silent());
        let handled = handle_file_chunk(&ctx, &mut session, &chunks[1]);
        let reply = handled.reply.unwrap();
        assert_eq!(reply.status, Status::Error);
        assert_eq!(reply.in_reply_to, Some(PacketKind::FileChunk));
        assert!(reply.message.contains("does not match"));
        assert!(matches!(handled.outcome, Some(TransferOutcome::Aborted { .. })));

        // the rest of the file now names an unknown id
        let handled = handle_file_chunk(&ctx, &mut session, &chunks[2]);
        assert!(handled.outcome.is_none());
        assert!(!handled.reply.unwrap().is_ok());

        let handled = handle_file_end(&ctx, &mut session, &metadata.file_id).await;
        let reply = handled.reply.unwrap();
        assert!(reply.is_ok());
        assert!(reply.message.contains("does not exist or was already processed"));
    }

    #[test]
    fn test_forged_signature_is_authenticity_failure() {
        let (sender_keys, ctx) = context(&temp_dir("forged"));
        let session_key = SessionKey::generate();
        let mut session = established(&session_key);

        let (_, mut chunks) = prepare(&ctx, &sender_keys, &session_key, &mut session, "a.txt", b"abc");
        // re-sign part 0 with the receiver's own key
        let forger = SenderKeys {
            private_key: ctx.keys.private_key.clone(),
            receiver_public: sender_keys.receiver_public.clone(),
        };
        let hash = STANDARD.decode(&chunks[0].hash).unwrap();
        chunks[0].signature = STANDARD.encode(sign_digest(&hash, &forger.private_key).unwrap());

        let reply = handle_file_chunk(&ctx, &mut session, &chunks[0]).reply.unwrap();
        assert!(reply.message.contains("signature of part 0 is invalid"));
        assert_eq!(session.files_in_flight(), 0);
    }

    #[test]
    fn test_out_of_range_part_aborts() {
        let (sender_keys, ctx) = context(&temp_dir("range"));
        let session_key = SessionKey::generate();
        let mut session = established(&session_key);

        let (metadata, _) = prepare(&ctx, &sender_keys, &session_key, &mut session, "a.txt", b"ab");
        let stray = seal_chunk(&session_key, &sender_keys, &metadata.file_id, 5, 2, b"x").unwrap();

        let handled = handle_file_chunk(&ctx, &mut session, &stray);
        assert!(matches!(handled.outcome, Some(TransferOutcome::Aborted { .. })));
        assert!(session.file(&metadata.file_id).is_none());
    }

    #[test]
    fn test_chunk_without_session_key_aborts() {
        let (sender_keys, ctx) = context(&temp_dir("nokey"));
        let session_key = SessionKey::generate();
        let mut session = Session::new(SocketAddr::from(([127, 0, 0, 1], 5556)));

        let (metadata, chunks) = prepare(&ctx, &sender_keys, &session_key, &mut session, "a.txt", b"abc");
        let handled = handle_file_chunk(&ctx, &mut session, &chunks[0]);
        assert!(handled.reply.unwrap().message.contains("session key not established"));
        assert!(session.file(&metadata.file_id).is_none());
    }

    #[tokio::test]
    async fn test_incomplete_end_then_retransmit() {
        let (sender_keys, ctx) = context(&temp_dir("incomplete"));
        let session_key = SessionKey::generate();
        let mut session = established(&session_key);

        let (metadata, chunks) = prepare(&ctx, &sender_keys, &session_key, &mut session, "a.txt", b"hello world");
        handle_file_chunk(&ctx, &mut session, &chunks[0]);
        handle_file_chunk(&ctx, &mut session, &chunks[1]);

        let handled = handle_file_end(&ctx, &mut session, &metadata.file_id).await;
        let reply = handled.reply.unwrap();
        assert_eq!(reply.status, Status::Error);
        assert!(reply.message.contains("expected 3, received 2"));
        assert!(matches!(handled.outcome, Some(TransferOutcome::Aborted { .. })));

        // a late retransmission finds nothing to attach to
        let handled = handle_file_chunk(&ctx, &mut session, &chunks[2]);
        assert!(!handled.reply.unwrap().is_ok());
        assert!(handled.outcome.is_none());
        assert_eq!(session.files_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_empty_file_roundtrip() {
        let dir = temp_dir("empty");
        let (sender_keys, ctx) = context(&dir);
        let session_key = SessionKey::generate();
        let mut session = established(&session_key);

        let (metadata, chunks) = prepare(&ctx, &sender_keys, &session_key, &mut session, "empty.txt", b"");
        assert_eq!(chunks.len(), 1);
        handle_file_chunk(&ctx, &mut session, &chunks[0]);

        let handled = handle_file_end(&ctx, &mut session, &metadata.file_id).await;
        assert!(handled.reply.unwrap().is_ok());
        assert_eq!(std::fs::read(dir.join("empty.txt")).unwrap(), b"");

        let _ = std::fs::remove_dir_all(&dir);
    }

    // ============================================================================
    // Size Limit Tests
    // ============================================================================

    #[test]
    fn test_init_rejects_part_count_mismatch() {
        let (sender_keys, ctx) = context(&temp_dir("parts"));
        let mut session = established(&SessionKey::generate());

        let metadata = FileMetadata {
            file_id: "x.bin_20240101000000".to_string(),
            filename: "x.bin".to_string(),
            file_size: 3,
            num_parts: 1000,
            timestamp: "2024-01-01T00:00:00.000000".to_string(),
        };
        let signed = sign_metadata(&metadata, &sender_keys.private_key).unwrap();
        let value = serde_json::to_value(&metadata).unwrap();

        let reply = handle_file_init(&ctx, &mut session, &value, &signed).reply.unwrap();
        assert_eq!(reply.status, Status::Error);
        assert!(reply.message.contains("1000 parts declared, 3 bytes splits into 3"));
        assert_eq!(session.files_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_oversized_part_aborts_file() {
        let dir = temp_dir("oversized");
        let (sender_keys, ctx) = context(&dir);
        let session_key = SessionKey::generate();
        let mut session = established(&session_key);

        let (metadata, _) = prepare(&ctx, &sender_keys, &session_key, &mut session, "x.bin", b"abc");
        let bloated = vec![0u8; 100_000];
        let chunk = seal_chunk(&session_key, &sender_keys, &metadata.file_id, 0, 3, &bloated).unwrap();

        let handled = handle_file_chunk(&ctx, &mut session, &chunk);
        let reply = handled.reply.unwrap();
        assert_eq!(reply.status, Status::Error);
        assert!(reply.message.contains("holds 100000 bytes, at most 1 expected"));
        assert!(matches!(handled.outcome, Some(TransferOutcome::Aborted { .. })));
        assert!(session.file(&metadata.file_id).is_none());

        let handled = handle_file_end(&ctx, &mut session, &metadata.file_id).await;
        assert!(handled.reply.unwrap().message.contains("does not exist or was already processed"));
        assert!(!dir.join("x.bin").exists());
    }

    #[tokio::test]
    async fn test_short_content_rejected_at_end() {
        let dir = temp_dir("short");
        let (sender_keys, ctx) = context(&dir);
        let session_key = SessionKey::generate();
        let mut session = established(&session_key);

        let (metadata, _) = prepare(&ctx, &sender_keys, &session_key, &mut session, "a.txt", b"hello world");
        for (index, data) in [b"a", b"b", b"c"].iter().enumerate() {
            let chunk = seal_chunk(&session_key, &sender_keys, &metadata.file_id, index as u64, 3, *data).unwrap();
            assert_eq!(handle_file_chunk(&ctx, &mut session, &chunk), Handled::silent());
        }

        let handled = handle_file_end(&ctx, &mut session, &metadata.file_id).await;
        let reply = handled.reply.unwrap();
        assert_eq!(reply.status, Status::Error);
        assert!(reply.message.contains("reassembled 3 bytes, declared file_size is 11"));
        assert!(matches!(handled.outcome, Some(TransferOutcome::Aborted { .. })));
        assert!(!dir.join("a.txt").exists());
    }
}
