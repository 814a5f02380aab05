//! Newline-delimited JSON framing over a TCP stream, with optional per-line
//! encryption.
//!
//! Wire format (plaintext):     `<json>\n`
//! Wire format (encrypted):     `<base64(nonce + ciphertext)>\n`
//!
//! The encrypted form is a base64 blob on the wire so the framing logic is
//! identical either way: every line is exactly one message.

use crate::crypto::WireCipher;
use crate::protocol::{Message, MAX_MESSAGE_SIZE};
use crate::{ImbueError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Splits a TCP stream into framed reader/writer halves sharing one cipher.
pub fn split(
    stream: TcpStream,
    cipher: Option<Arc<WireCipher>>,
) -> (WireReader<OwnedReadHalf>, WireWriter<OwnedWriteHalf>) {
    let (read_half, write_half) = stream.into_split();
    (
        WireReader::new(read_half, cipher.clone()),
        WireWriter::new(write_half, cipher),
    )
}

pub struct WireReader<R> {
    reader: BufReader<R>,
    cipher: Option<Arc<WireCipher>>,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(inner: R, cipher: Option<Arc<WireCipher>>) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, inner),
            cipher,
        }
    }

    /// Reads one message. Returns `None` on a clean EOF.
    pub async fn read_msg(&mut self) -> Result<Option<Message>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ImbueError::Protocol(format!(
                "Message too large ({} bytes)",
                line.len()
            )));
        }
        let line = line.trim_end_matches('\n');

        let msg = match &self.cipher {
            Some(cipher) => {
                let sealed = STANDARD
                    .decode(line.as_bytes())
                    .map_err(|e| ImbueError::Protocol(format!("Base64 decode: {}", e)))?;
                let raw = cipher.open(&sealed)?;
                serde_json::from_slice(&raw)?
            }
            None => serde_json::from_str(line)?,
        };
        Ok(Some(msg))
    }
}

pub struct WireWriter<W> {
    writer: W,
    cipher: Option<Arc<WireCipher>>,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(writer: W, cipher: Option<Arc<WireCipher>>) -> Self {
        Self { writer, cipher }
    }

    /// Serializes `msg`, optionally encrypts it, and writes it followed by a
    /// newline. A write stalling past the deadline counts as a dead
    /// transport.
    pub async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        let raw = serde_json::to_vec(msg)?;
        let mut line = match &self.cipher {
            Some(cipher) => {
                let sealed = cipher.seal(&raw)?;
                STANDARD.encode(sealed).into_bytes()
            }
            None => raw,
        };
        line.push(b'\n');

        tokio::time::timeout(WRITE_DEADLINE, self.writer.write_all(&line))
            .await
            .map_err(|_| ImbueError::Network("Write deadline exceeded".to_string()))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Item;

    #[tokio::test]
    async fn plaintext_round_trip() {
        let msg = Message::Publish {
            source: "alice".into(),
            namespace: "default".into(),
            items: vec![Item::text("hi")],
        };

        let mut buf = Vec::new();
        let mut writer = WireWriter::new(&mut buf, None);
        writer.write_msg(&msg).await.expect("write");
        assert!(buf.ends_with(b"\n"));

        let mut reader = WireReader::new(buf.as_slice(), None);
        let read = reader.read_msg().await.expect("read");
        assert_eq!(read, Some(msg));
        assert_eq!(reader.read_msg().await.expect("eof"), None);
    }

    #[tokio::test]
    async fn encrypted_round_trip() {
        let cipher = Arc::new(WireCipher::from_token("tok").expect("cipher"));
        let msg = Message::Ping;

        let mut buf = Vec::new();
        let mut writer = WireWriter::new(&mut buf, Some(cipher.clone()));
        writer.write_msg(&msg).await.expect("write");
        assert!(!String::from_utf8_lossy(&buf).contains("PING"));

        let mut reader = WireReader::new(buf.as_slice(), Some(cipher));
        assert_eq!(reader.read_msg().await.expect("read"), Some(Message::Ping));
    }

    #[tokio::test]
    async fn wrong_key_fails_to_read() {
        let cipher = Arc::new(WireCipher::from_token("tok").expect("cipher"));
        let other = Arc::new(WireCipher::from_token("other").expect("cipher"));

        let mut buf = Vec::new();
        let mut writer = WireWriter::new(&mut buf, Some(cipher));
        writer.write_msg(&Message::Ping).await.expect("write");

        let mut reader = WireReader::new(buf.as_slice(), Some(other));
        assert!(reader.read_msg().await.is_err());
    }

    #[tokio::test]
    async fn garbage_line_is_a_protocol_error() {
        let mut reader = WireReader::new(&b"not json\n"[..], None);
        assert!(reader.read_msg().await.is_err());
    }
}
