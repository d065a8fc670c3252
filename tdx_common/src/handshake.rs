//! TDX setup handshake used to tell a quote server from any other TCP listener.
//!
//! The client sends the fixed `SETUP_COMMAND`; a TDX server replies with a
//! 16-byte little-endian `ResponseHeader` followed by `zip_size` body bytes.
//! The body is never decoded here: receiving a sane header and the complete
//! body is proof enough that the peer speaks the protocol.
use std::io::{ErrorKind, Read, Write};

use crate::error::TdxError;
use crate::result::Result;

/// First setup command of a TDX session.
pub const SETUP_COMMAND: [u8; 13] = [
    0x0c, 0x02, 0x18, 0x93, 0x00, 0x01, 0x03, 0x00, 0x03, 0x00, 0x0d, 0x00, 0x01,
];
/// Length of every TDX response header.
pub const RESPONSE_HEADER_LEN: usize = 16;

/// Decoded TDX response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Leading header words, opaque to this crate.
    pub words: [u32; 3],
    /// Body length on the wire.
    pub zip_size: u16,
    /// Body length after decompression.
    pub unzip_size: u16,
}

impl ResponseHeader {
    /// Decodes and sanity-checks a header.
    pub fn parse(buf: &[u8; RESPONSE_HEADER_LEN]) -> Result<Self> {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let header = ResponseHeader {
            words: [word(0), word(4), word(8)],
            zip_size: u16::from_le_bytes([buf[12], buf[13]]),
            unzip_size: u16::from_le_bytes([buf[14], buf[15]]),
        };

        if header.zip_size == 0 {
            return Err(TdxError::Format("empty handshake reply body".into()));
        }
        if header.zip_size > header.unzip_size {
            return Err(TdxError::Format(format!(
                "compressed size {} exceeds uncompressed size {}",
                header.zip_size, header.unzip_size
            )));
        }
        Ok(header)
    }

    /// Encodes the header, mainly for fake servers in tests.
    pub fn to_bytes(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        for (i, w) in self.words.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        buf[12..14].copy_from_slice(&self.zip_size.to_le_bytes());
        buf[14..16].copy_from_slice(&self.unzip_size.to_le_bytes());
        buf
    }
}

/// Sends the setup command and reads one complete reply from `stream`.
///
/// Read/write deadlines are the caller's responsibility (socket timeouts).
/// Returns the decoded header on success.
pub fn exchange<S: Read + Write>(stream: &mut S) -> Result<ResponseHeader> {
    stream.write_all(&SETUP_COMMAND)?;
    stream.flush()?;

    let mut head = [0u8; RESPONSE_HEADER_LEN];
    read_full(stream, &mut head, "header")?;
    let header = ResponseHeader::parse(&head)?;

    let mut body = vec![0u8; usize::from(header.zip_size)];
    read_full(stream, &mut body, "body")?;
    Ok(header)
}

fn read_full<S: Read>(stream: &mut S, buf: &mut [u8], what: &str) -> Result<()> {
    stream.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            TdxError::Format(format!("connection closed before the reply {} was complete", what))
        }
        _ => TdxError::Io(e),
    })
}
