use std::time::Duration;

use log::debug;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::utils::{parse_reply, Reply};
use crate::MAX_FRAME_SIZE;

/// Length of the frame header (4 bytes, big-endian u32).
pub const FRAME_HEADER_LEN: usize = 4;

/// A connected stream plus the limits applied to every read on it.
pub struct Connection<S> {
    stream: S,
    max_frame_size: usize,
    read_timeout: Option<Duration>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, max_frame_size: usize, read_timeout: Option<Duration>) -> Self {
        Connection {
            stream,
            max_frame_size,
            read_timeout,
        }
    }

    pub async fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        write_packet(&mut self.stream, message).await
    }

    pub async fn recv(&mut self) -> Result<Value> {
        read_packet_timeout(&mut self.stream, self.max_frame_size, self.read_timeout).await
    }

    /// Like [`recv`](Self::recv) but folds every failure into `None`.
    pub async fn receive(&mut self) -> Option<Value> {
        receive_packet(&mut self.stream, self.max_frame_size, self.read_timeout).await
    }

    /// Reads the next packet and decodes it as a status reply.
    pub async fn recv_reply(&mut self) -> Result<Reply> {
        parse_reply(self.recv().await?)
    }
}

/// Serializes `message` as JSON and writes it as one length-prefixed frame.
///
/// Payloads above `MAX_FRAME_SIZE` are refused before anything is written.
///
/// Header and payload go out in a single `write_all` so frames are never
/// interleaved on the wire.
pub async fn write_packet<W, T>(stream: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one frame and decodes its JSON document.
///
/// - EOF before or inside the frame yields `Error::ConnectionClosed`
/// - a length prefix above `max_len` yields `Error::FrameTooLarge` without allocating
/// - invalid UTF-8 or JSON yields `Error::Codec`
pub async fn read_packet<R>(stream: &mut R, max_len: usize) -> Result<Value>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    read_exact_or_closed(stream, &mut header).await?;

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(Error::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    read_exact_or_closed(stream, &mut payload).await?;

    let text = std::str::from_utf8(&payload).map_err(|e| Error::Codec {
        message: format!("invalid UTF-8: {}", e),
    })?;
    Ok(serde_json::from_str(text)?)
}

/// [`read_packet`] bounded by an optional deadline.
pub async fn read_packet_timeout<R>(
    stream: &mut R,
    max_len: usize,
    deadline: Option<Duration>,
) -> Result<Value>
where
    R: AsyncRead + Unpin,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, read_packet(stream, max_len))
            .await
            .map_err(|_| Error::Timeout)?,
        None => read_packet(stream, max_len).await,
    }
}

/// Receives a packet, folding every failure into "no packet".
///
/// Connection loss, timeouts and undecodable frames are all treated the same
/// by callers: the conversation on this stream is over.
pub async fn receive_packet<R>(stream: &mut R, max_len: usize, deadline: Option<Duration>) -> Option<Value>
where
    R: AsyncRead + Unpin,
{
    match read_packet_timeout(stream, max_len, deadline).await {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("No packet received: {}", e);
            None
        }
    }
}

async fn read_exact_or_closed<R>(stream: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}
