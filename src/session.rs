//! Per-connection protocol state.
//!
//! A [`Session`] exists for every accepted connection and owns the
//! [`FileTransferState`] of each file in flight on it. The
//! [`SessionRegistry`] maps peer addresses to sessions; each entry is only
//! ever locked by the worker serving that connection.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::bytes::reassemble;
use crate::cryptography::random_bytes;
use crate::error::{Error, Result};
use crate::utils::FileMetadata;
use crate::{SESSION_IV_SIZE, SESSION_KEY_SIZE};

/// Symmetric key material agreed during key exchange.
///
/// The IV is carried for completeness only; every chunk uses its own fresh IV.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    key: [u8; SESSION_KEY_SIZE],
    iv: [u8; SESSION_IV_SIZE],
}

impl SessionKey {
    pub fn generate() -> Self {
        SessionKey {
            key: random_bytes(),
            iv: random_bytes(),
        }
    }

    /// Builds a session key from unwrapped bytes, checking both lengths.
    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self> {
        let key: [u8; SESSION_KEY_SIZE] = key.try_into().map_err(|_| Error::Crypto {
            message: format!("session key must be {} bytes, got {}", SESSION_KEY_SIZE, key.len()),
        })?;
        let iv: [u8; SESSION_IV_SIZE] = iv.try_into().map_err(|_| Error::Crypto {
            message: format!("session IV must be {} bytes, got {}", SESSION_IV_SIZE, iv.len()),
        })?;
        Ok(SessionKey { key, iv })
    }

    pub fn key(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; SESSION_IV_SIZE] {
        &self.iv
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// `file_init` accepted, no chunk stored yet.
    Initialized,
    /// At least one chunk stored.
    Receiving,
}

/// How a file transfer left the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed {
        file_id: String,
        path: PathBuf,
        bytes: usize,
    },
    Aborted {
        file_id: String,
        reason: String,
    },
}

/// Receiver-side state for one in-flight file.
#[derive(Debug)]
pub struct FileTransferState {
    metadata: FileMetadata,
    chunks: BTreeMap<u64, Vec<u8>>,
    received_count: u64,
    phase: TransferPhase,
}

impl FileTransferState {
    pub fn new(metadata: FileMetadata) -> Self {
        FileTransferState {
            metadata,
            chunks: BTreeMap::new(),
            received_count: 0,
            phase: TransferPhase::Initialized,
        }
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn received_count(&self) -> u64 {
        self.received_count
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    /// Stores a decrypted part. A repeated index overwrites the earlier bytes
    /// but still counts as a received part.
    pub fn store_chunk(&mut self, part_number: u64, content: Vec<u8>) {
        self.chunks.insert(part_number, content);
        self.received_count += 1;
        self.phase = TransferPhase::Receiving;
    }

    /// True when the declared number of parts arrived and no index is missing.
    pub fn is_complete(&self) -> bool {
        self.received_count == self.metadata.num_parts
            && (0..self.metadata.num_parts).all(|i| self.chunks.contains_key(&i))
    }

    /// Consumes the state and concatenates its parts in index order.
    ///
    /// The result must be exactly the declared `file_size`.
    pub fn into_content(self) -> Result<Vec<u8>> {
        let content = reassemble(&self.chunks, self.metadata.num_parts)?;
        if content.len() as u64 != self.metadata.file_size {
            return Err(Error::protocol(format!(
                "reassembled {} bytes, declared file_size is {}",
                content.len(),
                self.metadata.file_size
            )));
        }
        Ok(content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingHandshake,
    AwaitingKey,
    Established,
}

/// State for one accepted connection.
#[derive(Debug)]
pub struct Session {
    peer: SocketAddr,
    phase: SessionPhase,
    session_key: Option<SessionKey>,
    files: HashMap<String, FileTransferState>,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Session {
            peer,
            phase: SessionPhase::AwaitingHandshake,
            session_key: None,
            files: HashMap::new(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn complete_handshake(&mut self) {
        if self.phase == SessionPhase::AwaitingHandshake {
            self.phase = SessionPhase::AwaitingKey;
        }
    }

    pub fn establish(&mut self, key: SessionKey) {
        self.session_key = Some(key);
        self.phase = SessionPhase::Established;
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// Starts tracking a file, replacing any earlier state under the same id.
    pub fn begin_file(&mut self, metadata: FileMetadata) {
        let file_id = metadata.file_id.clone();
        if self.files.insert(file_id.clone(), FileTransferState::new(metadata)).is_some() {
            debug!("Replaced in-flight state for {} from {}", file_id, self.peer);
        }
    }

    pub fn file(&self, file_id: &str) -> Option<&FileTransferState> {
        self.files.get(file_id)
    }

    pub fn file_mut(&mut self, file_id: &str) -> Option<&mut FileTransferState> {
        self.files.get_mut(file_id)
    }

    /// Removes a file's state, whatever its progress.
    pub fn take_file(&mut self, file_id: &str) -> Option<FileTransferState> {
        self.files.remove(file_id)
    }

    pub fn files_in_flight(&self) -> usize {
        self.files.len()
    }
}

pub type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

/// Concurrency-safe map from peer address to session.
///
/// Only insertion and removal go through the map lock; the lock is never held
/// across an await point.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SocketAddr, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a fresh session for `peer`. The returned guard removes it
    /// again when dropped.
    pub fn open(self: &Arc<Self>, peer: SocketAddr) -> SessionGuard {
        let session: SessionHandle = Arc::new(tokio::sync::Mutex::new(Session::new(peer)));
        if self.lock().insert(peer, Arc::clone(&session)).is_some() {
            warn!("Replaced stale session for {}", peer);
        }
        SessionGuard {
            registry: Arc::clone(self),
            peer,
            session,
        }
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<SessionHandle> {
        self.lock().get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn close(&self, peer: &SocketAddr, session: &SessionHandle) {
        let mut sessions = self.lock();
        // A newer connection from the same address keeps its own entry.
        if sessions.get(peer).is_some_and(|current| Arc::ptr_eq(current, session)) {
            sessions.remove(peer);
            debug!("Session for {} torn down", peer);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ownership of one registry entry, held by the connection worker.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    peer: SocketAddr,
    session: SessionHandle,
}

impl SessionGuard {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.close(&self.peer, &self.session);
    }
}
