//! Wire protocol codec
//!
//! The engine frames every packet as HTTP-style headers followed by a JSON
//! body:
//! ```text
//! Content-Length: <byte-length>\r\n
//! \r\n
//! <JSON body>
//! ```
//! The very first packet after the TCP connection is a handshake that carries
//! a `Type: connect` header and an empty body, so the reader keeps all headers
//! around instead of only the length.

use std::collections::HashMap;
use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::Error;

/// Sanity cap - 100MB should be plenty for any packet
const MAX_BODY_LEN: usize = 100 * 1024 * 1024;

/// A decoded wire packet: headers plus the raw JSON body
#[derive(Debug, Clone)]
pub struct Packet {
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl Packet {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The initial handshake is a header-only packet with a `Type` header;
    /// whatever body it claims to carry is ignored.
    pub fn is_handshake(&self) -> bool {
        self.header("Type").is_some() && self.body.trim().is_empty()
    }
}

/// Read one packet from the stream
///
/// Parses headers until the blank line, then reads `Content-Length` bytes of
/// body. EOF is reported as a closed connection.
pub async fn read_packet<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Packet, Error> {
    let mut headers = HashMap::new();
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::ConnectionClosed
            } else {
                Error::Io(e)
            }
        })?;

        if bytes_read == 0 {
            return Err(Error::ConnectionClosed);
        }

        // Empty line (just \r\n) signals end of headers
        if line == "\r\n" || line == "\n" {
            break;
        }

        let line = line.trim_end();
        let Some((name, value)) = line.split_once(':') else {
            // Lines without a colon are not headers; skip them.
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("Content-Length") {
            content_length = Some(value.parse().map_err(|_| {
                Error::Protocol(format!("invalid Content-Length: {value}"))
            })?);
        }
        headers.insert(name.to_string(), value.to_string());
    }

    let len = content_length
        .ok_or_else(|| Error::Protocol("missing Content-Length header".to_string()))?;

    if len > MAX_BODY_LEN {
        return Err(Error::Protocol(format!("Content-Length too large: {len} bytes")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::ConnectionClosed
        } else {
            Error::Io(e)
        }
    })?;

    let body =
        String::from_utf8(body).map_err(|e| Error::Protocol(format!("invalid UTF-8: {e}")))?;

    Ok(Packet { headers, body })
}

/// Write one packet to the stream
///
/// Adds the Content-Length header and writes the JSON body
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<(), Error> {
    let header = format!("Content-Length: {}\r\n\r\n", json.len());

    writer.write_all(header.as_bytes()).await?;
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_packet() {
        let data = b"Content-Length: 13\r\n\r\n{\"test\":true}";
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));

        let packet = read_packet(&mut reader).await.unwrap();
        assert_eq!(packet.body, "{\"test\":true}");
        assert!(!packet.is_handshake());
    }

    #[tokio::test]
    async fn test_read_handshake_packet() {
        let data = b"Type: connect\r\nV8-Version: 3.14.5\r\nProtocol-Version: 1\r\nEmbedding-Host: node v0.10.0\r\nContent-Length: 0\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));

        let packet = read_packet(&mut reader).await.unwrap();
        assert!(packet.is_handshake());
        assert_eq!(packet.header("type"), Some("connect"));
        assert_eq!(packet.header("Embedding-Host"), Some("node v0.10.0"));
    }

    #[tokio::test]
    async fn test_read_packet_missing_length() {
        let data = b"Content-Type: application/json\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));

        assert!(matches!(
            read_packet(&mut reader).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_read_packet_eof() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_packet() {
        let mut output = Vec::new();
        write_packet(&mut output, "{\"test\":true}").await.unwrap();

        let expected = "Content-Length: 13\r\n\r\n{\"test\":true}";
        assert_eq!(String::from_utf8(output).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let mut output = Vec::new();
        write_packet(&mut output, "{\"seq\":1,\"type\":\"request\",\"command\":\"scripts\"}")
            .await
            .unwrap();

        let mut reader = BufReader::new(Cursor::new(output));
        let packet = read_packet(&mut reader).await.unwrap();
        assert_eq!(
            packet.body,
            "{\"seq\":1,\"type\":\"request\",\"command\":\"scripts\"}"
        );
    }
}
