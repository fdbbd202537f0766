use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Contains the message types exchanged between sender and receiver
/// - Control packets (tagged by `type`)
/// - Acknowledgement replies (carrying `status`)
/// - The signed metadata records and their canonical encoding

/// A control packet sent from the sender to the receiver, or the receiver's
/// answer to a handshake.
///
/// Binary fields are standard base64 text. `metadata` stays a raw JSON value
/// so the receiver can canonicalize exactly what the sender signed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    Handshake {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<Status>,
    },
    KeyExchange {
        encrypted_session_key: String,
        encrypted_session_iv: String,
        metadata: Value,
        signed_metadata: String,
    },
    FileInit {
        metadata: Value,
        signed_metadata: String,
    },
    FileChunk(ChunkPacket),
    FileEndSignal {
        file_id: String,
    },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Handshake { .. } => PacketKind::Handshake,
            Packet::KeyExchange { .. } => PacketKind::KeyExchange,
            Packet::FileInit { .. } => PacketKind::FileInit,
            Packet::FileChunk(_) => PacketKind::FileChunk,
            Packet::FileEndSignal { .. } => PacketKind::FileEndSignal,
        }
    }
}

/// One encrypted, digested and signed part of a file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChunkPacket {
    pub file_id: String,
    pub part_number: u64,
    pub total_parts: u64,
    pub iv: String,
    pub cipher: String,
    /// SHA-512 of `iv || cipher`.
    pub hash: String,
    pub signature: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Handshake,
    KeyExchange,
    FileInit,
    FileChunk,
    FileEndSignal,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
}

/// Acknowledgement sent by the receiver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: Status,
    #[serde(default)]
    pub message: String,
    /// Which packet this answers. Lets the sender separate unsolicited
    /// chunk errors from the end-signal acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<PacketKind>,
}

impl Reply {
    pub fn ok(message: impl Into<String>) -> Self {
        Reply {
            status: Status::Ok,
            message: message.into(),
            in_reply_to: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply {
            status: Status::Error,
            message: message.into(),
            in_reply_to: None,
        }
    }

    pub fn answering(mut self, kind: PacketKind) -> Self {
        self.in_reply_to = Some(kind);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Signed description of the session key being offered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeyExchangeMetadata {
    pub timestamp: String,
    pub sender: String,
    /// Session key length in bits.
    pub key_size: u64,
    /// Session IV length in bits.
    pub iv_size: u64,
}

/// Signed description of one file transfer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub file_id: String,
    pub filename: String,
    pub file_size: u64,
    pub num_parts: u64,
    pub timestamp: String,
}

/// Serializes `value` with lexicographically sorted keys and compact
/// separators, so signer and verifier hash identical bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    // serde_json::Map is a BTreeMap unless `preserve_order` is enabled, so
    // going through Value sorts every object's keys.
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// ISO-8601 local timestamp with microseconds.
pub fn iso_timestamp(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// `<filename>_<YYYYmmddHHMMSS>`.
///
/// Second granularity: two transfers of the same name within one second share an id.
pub fn make_file_id(filename: &str, now: DateTime<Local>) -> String {
    format!("{}_{}", filename, now.format("%Y%m%d%H%M%S"))
}

/// Decodes a packet's JSON document into a typed packet.
pub fn parse_packet(value: Value) -> Result<Packet> {
    serde_json::from_value(value).map_err(|e| Error::protocol(format!("malformed packet: {}", e)))
}

pub fn parse_reply(value: Value) -> Result<Reply> {
    serde_json::from_value(value).map_err(|e| Error::protocol(format!("malformed reply: {}", e)))
}
