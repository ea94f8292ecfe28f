//! PROXY Protocol Header Classifier
//!
//! Detects whether a connection starts with a v1 (text) or v2 (binary)
//! PROXY protocol header, parses it, and hands back any payload bytes that
//! were read along with it.

mod encode;
mod v1;
mod v2;

use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::error::Error;

pub use encode::{encode_v1, encode_v2};

/// V1 line prefix
pub const V1_PREFIX: &[u8] = b"PROXY";

/// V2 signature (12 bytes)
pub const V2_SIGNATURE: &[u8; 12] = b"\r\n\r\n\x00\r\nQUIT\n";

/// Longest v1 line, CRLF included
pub const V1_MAX_LENGTH: usize = 107;

/// Signature, version/command, family/transport and length
pub const V2_FIXED_LENGTH: usize = 16;

/// Largest header accepted in either format
pub const MAX_HEADER_SIZE: usize = 536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    None,
    V1,
    V2,
}

/// Original source and destination carried by a PROXY header.
///
/// Both ends always share an address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginalEndpoint {
    source: SocketAddr,
    destination: SocketAddr,
}

impl OriginalEndpoint {
    /// Returns `None` when the two addresses belong to different families.
    #[must_use]
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Option<Self> {
        (source.is_ipv4() == destination.is_ipv4()).then_some(Self {
            source,
            destination,
        })
    }

    #[must_use]
    pub const fn source(&self) -> SocketAddr {
        self.source
    }

    #[must_use]
    pub const fn destination(&self) -> SocketAddr {
        self.destination
    }
}

/// Outcome of classifying the front of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// A header asserted the original endpoints
    Proxied {
        version: ProtocolVersion,
        endpoint: OriginalEndpoint,
    },
    /// `PROXY UNKNOWN`, v2 LOCAL, or a v2 address family without IP endpoints
    Local { version: ProtocolVersion },
    /// No header was present, or the peer was not trusted to send one
    Absent,
}

impl Header {
    #[must_use]
    pub const fn version(&self) -> ProtocolVersion {
        match self {
            Self::Proxied { version, .. } | Self::Local { version } => *version,
            Self::Absent => ProtocolVersion::None,
        }
    }

    #[must_use]
    pub const fn endpoint(&self) -> Option<&OriginalEndpoint> {
        match self {
            Self::Proxied { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }
}

/// Result of inspecting the bytes staged so far.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// The bytes are still a prefix of a possible header
    Incomplete,
    /// A complete header occupying the first `len` bytes
    Complete { header: Header, len: usize },
    /// The bytes can never become a header
    NotProxy,
}

/// Classifies the leading bytes of a stream without consuming anything.
///
/// Only the first complete header is inspected; bytes after it are ignored.
pub fn decode(buf: &[u8]) -> Result<Decoded, Error> {
    if starts_like(buf, V2_SIGNATURE) {
        if buf.len() < V2_FIXED_LENGTH {
            return Ok(Decoded::Incomplete);
        }
        let block_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
        let len = V2_FIXED_LENGTH + block_len;
        if len > MAX_HEADER_SIZE {
            return Err(Error::HeaderTooLarge(len));
        }
        if buf.len() < len {
            return Ok(Decoded::Incomplete);
        }
        let header = v2::parse(&buf[..len])?;
        return Ok(Decoded::Complete { header, len });
    }

    if starts_like(buf, V1_PREFIX) {
        let window = &buf[..buf.len().min(V1_MAX_LENGTH)];
        if let Some(end) = window.windows(2).position(|w| w == b"\r\n") {
            let header = v1::parse(&buf[..end])?;
            return Ok(Decoded::Complete {
                header,
                len: end + 2,
            });
        }
        if buf.len() >= V1_MAX_LENGTH {
            return Err(Error::malformed(format!(
                "v1 line exceeds {V1_MAX_LENGTH} bytes without CRLF"
            )));
        }
        return Ok(Decoded::Incomplete);
    }

    Ok(Decoded::NotProxy)
}

/// True when `buf` and `signature` agree on their common prefix.
fn starts_like(buf: &[u8], signature: &[u8]) -> bool {
    let n = buf.len().min(signature.len());
    buf[..n] == signature[..n]
}

/// Reads from `stream` until the header is classified.
///
/// Returns the header and every byte read past it, which the caller must
/// replay before reading from `stream` again. For a headerless stream that
/// is everything read so far. With `require_header`, a headerless stream is
/// `Error::UnsupportedVersion` instead.
pub async fn read_header<S>(stream: &mut S, require_header: bool) -> Result<(Header, BytesMut), Error>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(MAX_HEADER_SIZE);

    loop {
        match decode(&buf)? {
            Decoded::Complete { header, len } => {
                buf.advance(len);
                debug!(
                    version = ?header.version(),
                    header_len = len,
                    leftover = buf.len(),
                    "PROXY header parsed"
                );
                return Ok((header, buf));
            }
            Decoded::NotProxy => return headerless(buf, require_header),
            Decoded::Incomplete => {}
        }

        if buf.len() >= MAX_HEADER_SIZE {
            return Err(Error::HeaderTooLarge(buf.len()));
        }
        buf.reserve(MAX_HEADER_SIZE - buf.len());

        let n = stream.read_buf(&mut buf).await?;
        trace!(bytes = n, staged = buf.len(), "read while sniffing header");
        if n == 0 {
            if buf.is_empty() {
                return headerless(buf, require_header);
            }
            return Err(Error::malformed(format!(
                "connection closed after {} bytes of an incomplete header",
                buf.len()
            )));
        }
    }
}

fn headerless(buf: BytesMut, require_header: bool) -> Result<(Header, BytesMut), Error> {
    if require_header {
        return Err(Error::UnsupportedVersion);
    }
    debug!(leftover = buf.len(), "no PROXY header, passing stream through");
    Ok((Header::Absent, buf))
}
