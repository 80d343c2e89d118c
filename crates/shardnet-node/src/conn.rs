//! Shared TCP connection: framed reads and writes with progress timeouts.
//!
//! The read half is owned by the peer's read loop (and the handshake before
//! it starts); the write half is shared between the ping loop, pong replies,
//! and every protocol wrapper. Each half sits behind its own async mutex, so
//! writes are serialized without stalling reads.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use shardnet_protocol::{FrameCodec, Message, ProtocolError, MAX_FRAME_BYTES};

use crate::error::NetError;

/// Maximum time allowed for reading one complete message.
pub const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum time allowed per write progress unit, not per message --
/// message sizes vary too much for a total-latency bound.
pub const CONN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Connection {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            local_addr,
            peer_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read one framed message. Errors are fatal for the owning peer.
    pub async fn read_message(&self) -> Result<Message, NetError> {
        let mut reader = self.reader.lock().await;

        let frame = tokio::time::timeout(FRAME_READ_TIMEOUT, async {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_FRAME_BYTES {
                return Err(NetError::Protocol(ProtocolError::FrameTooLarge {
                    size: len,
                    max: MAX_FRAME_BYTES,
                }));
            }

            let mut frame = vec![0u8; len];
            reader.read_exact(&mut frame).await?;
            Ok(frame)
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "frame read timed out"))??;

        Ok(FrameCodec::decode_frame(&frame)?)
    }

    /// Write one framed message. Concurrent writers are serialized here.
    pub async fn write_message(&self, msg: &Message) -> Result<(), NetError> {
        let mut buf = BytesMut::new();
        FrameCodec::encode_frame(msg, &mut buf)?;

        let mut writer = self.writer.lock().await;
        tokio::time::timeout(CONN_WRITE_TIMEOUT, writer.write_all(&buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "frame write timed out"))??;
        tokio::time::timeout(CONN_WRITE_TIMEOUT, writer.flush())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "frame flush timed out"))??;
        Ok(())
    }
}
