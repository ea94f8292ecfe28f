//! PROXY protocol v2 (binary) parser

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use super::{Header, OriginalEndpoint, ProtocolVersion, V2_FIXED_LENGTH};
use crate::error::Error;

const VERSION: u8 = 0x2;

const CMD_LOCAL: u8 = 0x0;
const CMD_PROXY: u8 = 0x1;

const AF_UNSPEC: u8 = 0x0;
const AF_INET: u8 = 0x1;
const AF_INET6: u8 = 0x2;
const AF_UNIX: u8 = 0x3;

/// Highest transport nibble (`DGRAM`)
const MAX_TRANSPORT: u8 = 0x2;

enum Family {
    Inet,
    Inet6,
    Other,
}

const INET_BLOCK_LEN: usize = 12;
const INET6_BLOCK_LEN: usize = 36;

/// Parses a complete v2 header: fixed part plus the declared address block.
///
/// Bytes in the block past the fixed address fields are TLVs and are skipped.
pub(super) fn parse(header: &[u8]) -> Result<Header, Error> {
    let version_command = header[12];
    let family_transport = header[13];
    let block = &header[V2_FIXED_LENGTH..];

    if version_command >> 4 != VERSION {
        return Err(Error::malformed(format!(
            "unsupported v2 version nibble {:#x}",
            version_command >> 4
        )));
    }

    let invalid = || {
        Error::malformed(format!(
            "invalid v2 family/transport byte {family_transport:#04x}"
        ))
    };
    if family_transport & 0x0f > MAX_TRANSPORT {
        return Err(invalid());
    }
    let family = match family_transport >> 4 {
        AF_INET => Family::Inet,
        AF_INET6 => Family::Inet6,
        AF_UNSPEC | AF_UNIX => Family::Other,
        _ => return Err(invalid()),
    };

    let local = Header::Local {
        version: ProtocolVersion::V2,
    };
    match version_command & 0x0f {
        CMD_LOCAL => return Ok(local),
        CMD_PROXY => {}
        other => return Err(Error::malformed(format!("invalid v2 command {other:#x}"))),
    }

    let endpoint = match family {
        Family::Inet => parse_inet(block)?,
        Family::Inet6 => parse_inet6(block)?,
        // No IP endpoints to report, fall back to the transport peer
        Family::Other => return Ok(local),
    };

    Ok(Header::Proxied {
        version: ProtocolVersion::V2,
        endpoint,
    })
}

fn parse_inet(block: &[u8]) -> Result<OriginalEndpoint, Error> {
    let Some(fields) = block.get(..INET_BLOCK_LEN) else {
        return Err(short_block("IPv4", block.len(), INET_BLOCK_LEN));
    };
    let src = Ipv4Addr::new(fields[0], fields[1], fields[2], fields[3]);
    let dst = Ipv4Addr::new(fields[4], fields[5], fields[6], fields[7]);
    let (src_port, dst_port) = ports(&fields[8..12]);

    Ok(endpoint(
        SocketAddr::from((src, src_port)),
        SocketAddr::from((dst, dst_port)),
    ))
}

fn parse_inet6(block: &[u8]) -> Result<OriginalEndpoint, Error> {
    let Some(fields) = block.get(..INET6_BLOCK_LEN) else {
        return Err(short_block("IPv6", block.len(), INET6_BLOCK_LEN));
    };
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&fields[..16]);
    dst.copy_from_slice(&fields[16..32]);
    let (src_port, dst_port) = ports(&fields[32..36]);

    Ok(endpoint(
        SocketAddr::from((Ipv6Addr::from(src), src_port)),
        SocketAddr::from((Ipv6Addr::from(dst), dst_port)),
    ))
}

fn ports(fields: &[u8]) -> (u16, u16) {
    (
        u16::from_be_bytes([fields[0], fields[1]]),
        u16::from_be_bytes([fields[2], fields[3]]),
    )
}

fn endpoint(source: SocketAddr, destination: SocketAddr) -> OriginalEndpoint {
    OriginalEndpoint { source, destination }
}

fn short_block(family: &str, len: usize, needed: usize) -> Error {
    Error::malformed(format!(
        "v2 {family} address block is {len} bytes, need at least {needed}"
    ))
}
