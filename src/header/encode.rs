//! PROXY protocol header encoders, for forwarding an endpoint upstream.

use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use super::{OriginalEndpoint, V2_SIGNATURE};

/// Encodes a v1 line; `None` encodes `PROXY UNKNOWN`.
#[must_use]
pub fn encode_v1(endpoint: Option<&OriginalEndpoint>) -> Bytes {
    let line = match endpoint {
        Some(endpoint) => {
            let (src, dst) = (endpoint.source(), endpoint.destination());
            let family = if src.is_ipv4() { "TCP4" } else { "TCP6" };
            format!(
                "PROXY {family} {} {} {} {}\r\n",
                src.ip(),
                dst.ip(),
                src.port(),
                dst.port()
            )
        }
        None => "PROXY UNKNOWN\r\n".to_string(),
    };
    Bytes::from(line)
}

/// Encodes a v2 header with the PROXY command; `None` encodes LOCAL.
#[must_use]
pub fn encode_v2(endpoint: Option<&OriginalEndpoint>) -> Bytes {
    let mut buf = BytesMut::with_capacity(52);
    buf.put_slice(V2_SIGNATURE);

    let Some(endpoint) = endpoint else {
        buf.put_u8(0x20);
        buf.put_u8(0x00);
        buf.put_u16(0);
        return buf.freeze();
    };

    let (src, dst) = (endpoint.source(), endpoint.destination());
    buf.put_u8(0x21);
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            buf.put_u8(0x11);
            buf.put_u16(12);
            buf.put_slice(&src_ip.octets());
            buf.put_slice(&dst_ip.octets());
        }
        (src_ip, dst_ip) => {
            buf.put_u8(0x21);
            buf.put_u16(36);
            buf.put_slice(&to_v6(src_ip).octets());
            buf.put_slice(&to_v6(dst_ip).octets());
        }
    }
    put_ports(&mut buf, src, dst);
    buf.freeze()
}

fn to_v6(ip: IpAddr) -> std::net::Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn put_ports(buf: &mut BytesMut, src: SocketAddr, dst: SocketAddr) {
    buf.put_u16(src.port());
    buf.put_u16(dst.port());
}
