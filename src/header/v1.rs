//! PROXY protocol v1 (text) parser
//!
//! `PROXY <TCP4|TCP6|UNKNOWN> [<src ip> <dst ip> <src port> <dst port>]`

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use super::{Header, OriginalEndpoint, ProtocolVersion};
use crate::error::Error;

/// Parses one header line with its CRLF already stripped.
pub(super) fn parse(line: &[u8]) -> Result<Header, Error> {
    let line = std::str::from_utf8(line).map_err(|_| Error::malformed("v1 line is not ASCII"))?;
    let fields: Vec<&str> = line.split_ascii_whitespace().collect();

    if fields.first() != Some(&"PROXY") {
        return Err(Error::malformed("v1 line does not start with PROXY"));
    }

    let endpoint = match fields.get(1).copied() {
        // Anything after UNKNOWN is ignored
        Some("UNKNOWN") => {
            return Ok(Header::Local {
                version: ProtocolVersion::V1,
            });
        }
        Some("TCP4") => parse_addresses::<Ipv4Addr>(&fields[2..])?,
        Some("TCP6") => parse_addresses::<Ipv6Addr>(&fields[2..])?,
        Some(other) => {
            return Err(Error::malformed(format!("unknown v1 protocol family {other:?}")));
        }
        None => return Err(Error::malformed("missing v1 protocol family")),
    };

    Ok(Header::Proxied {
        version: ProtocolVersion::V1,
        endpoint,
    })
}

fn parse_addresses<A>(fields: &[&str]) -> Result<OriginalEndpoint, Error>
where
    A: FromStr + Into<IpAddr>,
{
    let [src_ip, dst_ip, src_port, dst_port] = fields else {
        return Err(Error::malformed(format!(
            "expected 4 v1 address fields, got {}",
            fields.len()
        )));
    };

    let source = SocketAddr::new(parse_ip::<A>(src_ip)?, parse_port(src_port)?);
    let destination = SocketAddr::new(parse_ip::<A>(dst_ip)?, parse_port(dst_port)?);
    OriginalEndpoint::new(source, destination)
        .ok_or_else(|| Error::malformed("v1 address families differ"))
}

fn parse_ip<A>(field: &str) -> Result<IpAddr, Error>
where
    A: FromStr + Into<IpAddr>,
{
    field
        .parse::<A>()
        .map(Into::into)
        .map_err(|_| Error::malformed(format!("invalid v1 address {field:?}")))
}

fn parse_port(field: &str) -> Result<u16, Error> {
    // u16::from_str would also take a leading '+'
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::malformed(format!("invalid v1 port {field:?}")));
    }
    field
        .parse()
        .map_err(|_| Error::malformed(format!("v1 port out of range {field:?}")))
}
