//! Owns the duplex TCP connection: serialized frame writes and a byte
//! reader that respects DLE-escaping when looking for the terminating
//! `END` byte.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::codec::{self, Codec, Decoded};
use crate::config::Encoding;

/// Codec plus write half, shared between the caller-facing send path
/// and the background reader task so both sides observe the same
/// encryption state.
pub(crate) struct Shared {
    codec: Mutex<Codec>,
    write: Mutex<OwnedWriteHalf>,
}

impl Shared {
    pub fn new(write: OwnedWriteHalf, encoding: Encoding) -> Arc<Self> {
        Arc::new(Self {
            codec: Mutex::new(Codec::new(encoding)),
            write: Mutex::new(write),
        })
    }

    pub async fn set_panel_id(&self, panel_id: u32) {
        self.codec.lock().await.set_panel_id(panel_id);
    }

    pub async fn set_encrypted(&self, encrypted: bool) {
        self.codec.lock().await.set_encrypted(encrypted);
    }

    /// Encode and write a single frame. The writer lock guarantees two
    /// frames never interleave on the wire.
    pub async fn write_command(
        &self,
        id: u16,
        command: &str,
        force_encrypt: bool,
    ) -> std::io::Result<()> {
        let frame = {
            let codec = self.codec.lock().await;
            codec.encode(id, command, force_encrypt)
        };
        let mut writer = self.write.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    pub async fn decode(&self, frame: &[u8]) -> Option<Decoded> {
        self.codec.lock().await.decode(frame)
    }
}

/// Read a single frame off `reader`: accumulate bytes until an
/// unescaped `END`. Returns `Ok(None)` on a clean EOF before any bytes
/// were read.
pub(crate) async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::with_capacity(64);
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ))
            };
        }
        buf.push(byte[0]);
        if codec::is_terminated(&buf) {
            return Ok(Some(buf));
        }
    }
}

/// Like [`read_frame`] but bounded by `timeout`, used during the
/// handshake where an unresponsive panel must not hang `connect`
/// forever.
pub(crate) async fn read_frame_timeout(
    reader: &mut OwnedReadHalf,
    timeout: std::time::Duration,
) -> std::io::Result<Option<Vec<u8>>> {
    match tokio::time::timeout(timeout, read_frame(reader)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "handshake read timed out",
        )),
    }
}
