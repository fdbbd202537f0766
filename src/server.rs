//! Receiver: accepts connections and runs the protocol on each.
//!
//! One accept task, one task per connection. Inside a connection everything
//! is sequential: read a packet, apply it to the session, answer.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::activity::ActivityLog;
use crate::error::{Error, Result};
use crate::handshake::{accept_session_key, answer_handshake};
use crate::keys::ReceiverKeys;
use crate::networking::Connection;
use crate::session::{Session, SessionGuard, SessionPhase, SessionRegistry, TransferOutcome};
use crate::transfer::{handle_file_chunk, handle_file_end, handle_file_init, Handled, ReceiverContext};
use crate::utils::{parse_packet, Packet, PacketKind, Reply, Status};
use crate::MAX_FRAME_SIZE;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Where completed files are written.
    pub storage_dir: PathBuf,
    /// How long to wait for a peer's next packet before dropping it.
    pub idle_timeout: Option<Duration>,
    pub max_frame_size: usize,
    pub max_file_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5001)),
            storage_dir: PathBuf::from("received_files"),
            idle_timeout: Some(Duration::from_secs(300)),
            max_frame_size: MAX_FRAME_SIZE,
            max_file_size: 8 * 1024 * 1024,
        }
    }
}

/// Read limits applied to every accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_frame_size: usize,
    pub idle_timeout: Option<Duration>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The receiving end. Start it, hand out its address, stop it.
pub struct ReceiverServer {
    config: ServerConfig,
    ctx: Arc<ReceiverContext>,
    registry: Arc<SessionRegistry>,
    running: Option<Running>,
}

impl ReceiverServer {
    pub fn new(config: ServerConfig, keys: ReceiverKeys, activity: ActivityLog) -> Self {
        let ctx = Arc::new(ReceiverContext {
            keys,
            storage_dir: config.storage_dir.clone(),
            max_file_size: config.max_file_size,
            activity,
        });
        ReceiverServer {
            config,
            ctx,
            registry: SessionRegistry::new(),
            running: None,
        }
    }

    /// Binds the listener and spawns the accept loop.
    ///
    /// Returns the bound address (useful when binding port 0).
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.running.is_some() {
            return Err(Error::Server {
                message: "receiver is already running".to_string(),
            });
        }

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let limits = ConnectionLimits {
            max_frame_size: self.config.max_frame_size,
            idle_timeout: self.config.idle_timeout,
        };
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.ctx),
            Arc::clone(&self.registry),
            limits,
            shutdown_rx,
        ));

        self.ctx
            .activity
            .record(format!("Receiver listening on {}", local_addr));
        self.running = Some(Running {
            shutdown,
            task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Closes the listener. Connections already accepted run to completion.
    pub async fn stop(&mut self) -> Result<()> {
        let running = self.running.take().ok_or_else(|| Error::Server {
            message: "receiver is not running".to_string(),
        })?;

        let _ = running.shutdown.send(true);
        running.task.await.map_err(|e| Error::Server {
            message: format!("accept loop failed: {}", e),
        })?;

        self.ctx
            .activity
            .record(format!("Receiver on {} stopped", running.local_addr));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.ctx.activity
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ReceiverContext>,
    registry: Arc<SessionRegistry>,
    limits: ConnectionLimits,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender means the server itself is gone.
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Accept loop shutting down");
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("New connection from: {}", peer);
                    let guard = registry.open(peer);
                    tokio::spawn(serve_connection(stream, guard, Arc::clone(&ctx), limits));
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }
}

/// What goes back on the wire for one packet.
#[derive(Serialize)]
#[serde(untagged)]
enum Answer {
    Handshake(Packet),
    Status(Reply),
}

struct Step {
    answer: Option<Answer>,
    /// Drop the connection after answering.
    close: bool,
}

impl Step {
    fn reply(reply: Reply) -> Self {
        Step {
            answer: Some(Answer::Status(reply)),
            close: false,
        }
    }
}

impl From<Handled> for Step {
    fn from(handled: Handled) -> Self {
        match &handled.outcome {
            Some(TransferOutcome::Completed { file_id, bytes, .. }) => debug!("{} completed ({} bytes)", file_id, bytes),
            Some(TransferOutcome::Aborted { file_id, reason }) => debug!("{} aborted: {}", file_id, reason),
            None => {}
        }
        Step {
            answer: handled.reply.map(Answer::Status),
            close: false,
        }
    }
}

/// Runs the protocol on one accepted stream until the peer goes away, a
/// read times out or key exchange fails.
///
/// The guard's session is removed from the registry when this returns.
pub async fn serve_connection<S>(stream: S, guard: SessionGuard, ctx: Arc<ReceiverContext>, limits: ConnectionLimits)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = guard.peer();
    let mut conn = Connection::new(stream, limits.max_frame_size, limits.idle_timeout);

    while let Some(value) = conn.receive().await {
        let step = {
            let mut session = guard.session().lock().await;
            dispatch(&ctx, &mut session, value).await
        };

        if let Some(answer) = &step.answer {
            if let Err(e) = conn.send(answer).await {
                debug!("Failed to answer {}: {}", peer, e);
                break;
            }
        }
        if step.close {
            break;
        }
    }

    ctx.activity.record(format!("Connection with {} closed", peer));
}

async fn dispatch(ctx: &ReceiverContext, session: &mut Session, value: Value) -> Step {
    let peer = session.peer();

    let packet = match parse_packet(value.clone()) {
        Ok(packet) => packet,
        Err(e) => {
            // A broken packet that names a file takes that file down with it.
            if let Some(file_id) = value.get("file_id").and_then(Value::as_str) {
                if session.take_file(file_id).is_some() {
                    debug!("Discarded {} after malformed packet", file_id);
                }
            }
            ctx.activity
                .record_failure(format!("Malformed packet from {}: {}", peer, e));
            return Step::reply(Reply::error(e.to_string()));
        }
    };

    let kind = packet.kind();
    if let Err(e) = check_sequence(session.phase(), kind) {
        ctx.activity.record_failure(format!("Rejected packet from {}: {}", peer, e));
        return Step::reply(Reply::error(e.to_string()).answering(kind));
    }

    match packet {
        Packet::Handshake { message, .. } => {
            let answer = answer_handshake(session, &message);
            match &answer {
                Packet::Handshake {
                    status: Some(Status::Error),
                    ..
                } => ctx
                    .activity
                    .record_failure(format!("Handshake failed with {}: invalid handshake message", peer)),
                _ => ctx.activity.record(format!("Handshake succeeded with {}", peer)),
            }
            Step {
                answer: Some(Answer::Handshake(answer)),
                close: false,
            }
        }
        Packet::KeyExchange {
            encrypted_session_key,
            encrypted_session_iv,
            metadata,
            signed_metadata,
        } => match accept_session_key(
            &ctx.keys,
            &encrypted_session_key,
            &encrypted_session_iv,
            &metadata,
            &signed_metadata,
        ) {
            Ok(session_key) => {
                session.establish(session_key);
                ctx.activity
                    .record(format!("Session key exchange succeeded with {}", peer));
                Step::reply(Reply::ok("Authentication and session key exchange succeeded."))
            }
            Err(e) => {
                ctx.activity
                    .record_failure(format!("Key exchange failed with {}: {}", peer, e));
                Step {
                    answer: Some(Answer::Status(Reply::error(format!("Key exchange failed: {}", e)))),
                    close: true,
                }
            }
        },
        Packet::FileInit {
            metadata,
            signed_metadata,
        } => handle_file_init(ctx, session, &metadata, &signed_metadata).into(),
        Packet::FileChunk(chunk) => handle_file_chunk(ctx, session, &chunk).into(),
        Packet::FileEndSignal { file_id } => handle_file_end(ctx, session, &file_id).await.into(),
    }
}

/// Packets a session accepts in each phase.
///
/// A handshake is always answered. Key exchange needs a completed handshake
/// and may be repeated to rekey; file packets need an established key.
fn check_sequence(phase: SessionPhase, kind: PacketKind) -> Result<()> {
    let allowed = match kind {
        PacketKind::Handshake => true,
        PacketKind::KeyExchange => phase != SessionPhase::AwaitingHandshake,
        PacketKind::FileInit | PacketKind::FileChunk | PacketKind::FileEndSignal => {
            phase == SessionPhase::Established
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(Error::protocol(format!("{:?} packet not allowed while {:?}", kind, phase)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_support::matching_keys;
    use crate::session::SessionKey;
    use serde_json::json;
    use tokio::io::duplex;

    fn test_config(name: &str) -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            storage_dir: std::env::temp_dir().join(format!("test_sigtrans_server_{}_{}", name, std::process::id())),
            idle_timeout: Some(Duration::from_secs(5)),
            ..ServerConfig::default()
        }
    }

    fn context() -> Arc<ReceiverContext> {
        let (_, receiver_keys) = matching_keys();
        Arc::new(ReceiverContext {
            keys: receiver_keys,
            storage_dir: std::env::temp_dir(),
            max_file_size: 1024,
            activity: ActivityLog::new(),
        })
    }

    #[test]
    fn test_sequence_rules() {
        use PacketKind::*;
        use SessionPhase::*;

        assert!(check_sequence(AwaitingHandshake, Handshake).is_ok());
        assert!(check_sequence(AwaitingHandshake, KeyExchange).is_err());
        assert!(check_sequence(AwaitingKey, KeyExchange).is_ok());
        assert!(check_sequence(AwaitingKey, FileInit).is_err());
        assert!(check_sequence(AwaitingKey, FileChunk).is_err());
        assert!(check_sequence(Established, FileEndSignal).is_ok());
        assert!(check_sequence(Established, KeyExchange).is_ok());
    }

    #[tokio::test]
    async fn test_out_of_sequence_packet_keeps_connection() {
        let ctx = context();
        let registry = SessionRegistry::new();
        let guard = registry.open(SocketAddr::from(([127, 0, 0, 1], 7000)));
        let limits = ConnectionLimits {
            max_frame_size: 1024 * 1024,
            idle_timeout: Some(Duration::from_secs(5)),
        };

        let (client, server) = duplex(64 * 1024);
        let worker = tokio::spawn(serve_connection(server, guard, Arc::clone(&ctx), limits));
        let mut conn = Connection::new(client, 1024 * 1024, Some(Duration::from_secs(5)));

        // file packet before any key
        conn.send(&json!({"type": "file_end_signal", "file_id": "x"})).await.unwrap();
        let reply = conn.recv_reply().await.unwrap();
        assert!(!reply.is_ok());
        assert_eq!(reply.in_reply_to, Some(PacketKind::FileEndSignal));

        // unknown packet type
        conn.send(&json!({"type": "reboot"})).await.unwrap();
        assert!(!conn.recv_reply().await.unwrap().is_ok());

        // still answering handshakes
        conn.send(&json!({"type": "handshake", "message": "Hello!"})).await.unwrap();
        let ready = conn.recv().await.unwrap();
        assert_eq!(ready, json!({"type": "handshake", "message": "Ready!"}));

        drop(conn);
        worker.await.unwrap();
        assert!(registry.is_empty());
        assert!(ctx.activity.contains("Handshake succeeded"));
    }

    #[tokio::test]
    async fn test_malformed_chunk_discards_named_file() {
        let ctx = context();
        let registry = SessionRegistry::new();
        let guard = registry.open(SocketAddr::from(([127, 0, 0, 1], 7002)));
        let limits = ConnectionLimits {
            max_frame_size: 1024 * 1024,
            idle_timeout: Some(Duration::from_secs(5)),
        };

        let (client, server) = duplex(64 * 1024);
        let worker = tokio::spawn(serve_connection(server, guard, Arc::clone(&ctx), limits));
        let mut conn = Connection::new(client, 1024 * 1024, Some(Duration::from_secs(5)));

        let (sender_keys, _) = matching_keys();
        crate::handshake::client_handshake(&mut conn).await.unwrap();
        crate::handshake::offer_session_key(&mut conn, &sender_keys, "SenderApp")
            .await
            .expect("Should agree a session key");

        let (metadata, init) = crate::transfer::open_file("a.txt", 11, &sender_keys).unwrap();
        conn.send(&init).await.unwrap();
        assert!(conn.recv_reply().await.unwrap().is_ok());

        // a chunk naming the file but missing every other field
        conn.send(&json!({"type": "file_chunk", "file_id": metadata.file_id}))
            .await
            .unwrap();
        let reply = conn.recv_reply().await.unwrap();
        assert_eq!(reply.status, Status::Error);

        conn.send(&Packet::FileEndSignal {
            file_id: metadata.file_id.clone(),
        })
        .await
        .unwrap();
        let reply = conn.recv_reply().await.unwrap();
        assert!(reply.is_ok());
        assert!(reply.message.contains("does not exist or was already processed"));
        assert!(ctx.activity.contains("Malformed packet"));

        drop(conn);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_key_exchange_closes_connection() {
        let ctx = context();
        let registry = SessionRegistry::new();
        let guard = registry.open(SocketAddr::from(([127, 0, 0, 1], 7001)));
        let limits = ConnectionLimits {
            max_frame_size: 1024 * 1024,
            idle_timeout: Some(Duration::from_secs(5)),
        };

        let (client, server) = duplex(64 * 1024);
        let worker = tokio::spawn(serve_connection(server, guard, Arc::clone(&ctx), limits));
        let mut conn = Connection::new(client, 1024 * 1024, Some(Duration::from_secs(5)));

        conn.send(&json!({"type": "handshake", "message": "Hello!"})).await.unwrap();
        conn.recv().await.unwrap();

        // sign the key exchange with the wrong key
        let (sender_keys, receiver_keys) = matching_keys();
        let impostor = crate::keys::SenderKeys {
            private_key: receiver_keys.private_key,
            receiver_public: sender_keys.receiver_public,
        };
        let packet = crate::handshake::build_key_exchange(&SessionKey::generate(), &impostor, "SenderApp").unwrap();
        conn.send(&packet).await.unwrap();

        let reply = conn.recv_reply().await.unwrap();
        assert!(!reply.is_ok());
        assert!(reply.message.starts_with("Key exchange failed"));

        worker.await.unwrap();
        assert!(conn.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let (_, receiver_keys) = matching_keys();
        let mut server = ReceiverServer::new(test_config("lifecycle"), receiver_keys, ActivityLog::new());

        assert!(matches!(server.stop().await, Err(Error::Server { .. })));

        let addr = server.start().await.expect("Should start");
        assert!(server.is_running());
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(server.start().await, Err(Error::Server { .. })));

        server.stop().await.expect("Should stop");
        assert!(!server.is_running());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        assert!(server.activity().contains("stopped"));
    }
}
