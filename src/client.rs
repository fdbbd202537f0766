//! Sender: connect, authenticate, then push files one at a time.

use std::path::Path;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::activity::ActivityLog;
use crate::bytes::split_parts;
use crate::error::{Error, Result};
use crate::handshake::{client_handshake, offer_session_key};
use crate::keys::SenderKeys;
use crate::networking::Connection;
use crate::session::SessionKey;
use crate::transfer::{open_file, seal_chunk};
use crate::utils::{Packet, PacketKind, Reply};
use crate::MAX_FRAME_SIZE;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name placed in the signed key-exchange metadata.
    pub sender_id: String,
    /// How long to wait for each reply from the receiver.
    pub response_timeout: Option<Duration>,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            sender_id: "SenderApp".to_string(),
            response_timeout: Some(Duration::from_secs(30)),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Summary of a file the receiver acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub file_id: String,
    pub filename: String,
    pub bytes: u64,
    pub num_parts: u64,
    /// The receiver's acknowledgement text.
    pub message: String,
}

/// An authenticated connection to a receiver with an agreed session key.
pub struct SenderClient<S = TcpStream> {
    conn: Connection<S>,
    keys: SenderKeys,
    session_key: SessionKey,
    activity: ActivityLog,
}

impl SenderClient<TcpStream> {
    /// Connects over TCP, then runs the handshake and key exchange.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        keys: SenderKeys,
        config: &ClientConfig,
        activity: ActivityLog,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        activity.record(format!("Connected to receiver at {}", peer));
        Self::establish(stream, keys, config, activity).await
    }
}

impl<S> SenderClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the handshake and key exchange over an already connected stream.
    pub async fn establish(stream: S, keys: SenderKeys, config: &ClientConfig, activity: ActivityLog) -> Result<Self> {
        let mut conn = Connection::new(stream, config.max_frame_size, config.response_timeout);

        if let Err(e) = client_handshake(&mut conn).await {
            activity.record_failure(format!("Handshake failed: {}", e));
            return Err(e);
        }
        activity.record("Handshake succeeded");

        let session_key = match offer_session_key(&mut conn, &keys, &config.sender_id).await {
            Ok(key) => key,
            Err(e) => {
                activity.record_failure(format!("Session key exchange failed: {}", e));
                return Err(e);
            }
        };
        activity.record("Session key exchange succeeded");

        Ok(SenderClient {
            conn,
            keys,
            session_key,
            activity,
        })
    }

    /// Reads a file from disk and sends it under its final path component.
    pub async fn send_path(&mut self, path: &Path) -> Result<TransferReport> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::protocol(format!("no usable file name in {}", path.display())))?
            .to_string();
        let content = tokio::fs::read(path).await?;
        self.send_file(&filename, &content).await
    }

    pub async fn send_file(&mut self, filename: &str, content: &[u8]) -> Result<TransferReport> {
        self.send_file_with_progress(filename, content, |_| {}).await
    }

    /// Sends one file: init, every chunk, then the end signal.
    ///
    /// `on_part` is called with the plaintext length of each part once it is
    /// on the wire. The transfer fails if the receiver rejects the init or the
    /// end signal, or reports an error for any chunk.
    pub async fn send_file_with_progress<F>(
        &mut self,
        filename: &str,
        content: &[u8],
        mut on_part: F,
    ) -> Result<TransferReport>
    where
        F: FnMut(usize),
    {
        let (metadata, init) = open_file(filename, content.len() as u64, &self.keys)?;
        self.conn.send(&init).await?;

        let (reply, stale) = self.next_answer().await?;
        for message in stale {
            debug!("Discarding chunk error from an earlier file: {}", message);
        }
        if !reply.is_ok() {
            self.activity
                .record_failure(format!("Receiver rejected '{}': {}", filename, reply.message));
            return Err(Error::Rejected { message: reply.message });
        }
        self.activity.record(format!(
            "Sending '{}' (ID: {}) in {} parts",
            filename, metadata.file_id, metadata.num_parts
        ));

        for (index, part) in split_parts(content).into_iter().enumerate() {
            let part_number = index as u64;
            let chunk = seal_chunk(
                &self.session_key,
                &self.keys,
                &metadata.file_id,
                part_number,
                metadata.num_parts,
                part,
            )?;
            self.activity.record(format!(
                "Part {}/{} of '{}' hash: {} signature: {}",
                part_number + 1,
                metadata.num_parts,
                filename,
                chunk.hash,
                chunk.signature
            ));
            self.conn.send(&Packet::FileChunk(chunk)).await?;
            on_part(part.len());
        }

        self.conn
            .send(&Packet::FileEndSignal {
                file_id: metadata.file_id.clone(),
            })
            .await?;

        let (ack, chunk_errors) = self.next_answer().await?;
        if !ack.is_ok() {
            self.activity
                .record_failure(format!("Transfer of '{}' failed: {}", filename, ack.message));
            return Err(Error::Rejected { message: ack.message });
        }
        if !chunk_errors.is_empty() {
            let message = chunk_errors.join("; ");
            self.activity
                .record_failure(format!("Transfer of '{}' failed: {}", filename, message));
            return Err(Error::Rejected { message });
        }

        self.activity
            .record(format!("Transfer of '{}' complete: {}", filename, ack.message));
        Ok(TransferReport {
            file_id: metadata.file_id,
            filename: metadata.filename,
            bytes: metadata.file_size,
            num_parts: metadata.num_parts,
            message: ack.message,
        })
    }

    /// Reads replies until one that is not a chunk error arrives, returning
    /// it along with the chunk errors read on the way.
    async fn next_answer(&mut self) -> Result<(Reply, Vec<String>)> {
        let mut chunk_errors = Vec::new();
        loop {
            let reply = self.conn.recv_reply().await?;
            if reply.in_reply_to == Some(PacketKind::FileChunk) {
                debug!("Chunk error from receiver: {}", reply.message);
                chunk_errors.push(reply.message);
                continue;
            }
            return Ok((reply, chunk_errors));
        }
    }

    /// Sends an arbitrary packet without waiting for anything.
    pub async fn send_raw(&mut self, packet: &Packet) -> Result<()> {
        self.conn.send(packet).await
    }

    pub async fn read_reply(&mut self) -> Result<Reply> {
        self.conn.recv_reply().await
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    pub fn keys(&self) -> &SenderKeys {
        &self.keys
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }
}
