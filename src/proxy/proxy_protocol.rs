//! PROXY protocol header emission (v1 and v2).
//!
//! Emitted to the backend before any relayed bytes so the backend learns the
//! original client address across the proxy hop.

use std::net::{IpAddr, SocketAddr};

use crate::config::ProxyHeaderVersion;

const V2_SIGNATURE: [u8; 12] =
    [0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A];

/// Version 2, PROXY command (high nibble version, low nibble command).
const V2_CMD_PROXY: u8 = 0x21;
const V2_AF_INET: u8 = 0x10;
const V2_AF_INET6: u8 = 0x20;
const V2_TRANSPORT_STREAM: u8 = 0x01;

/// Encode the header for a client `src` reaching the relay at `dst`.
pub fn encode(version: ProxyHeaderVersion, src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    match version {
        ProxyHeaderVersion::V1 => encode_v1(src, dst),
        ProxyHeaderVersion::V2 => encode_v2(src, dst),
    }
}

/// v1 is a single ASCII line, `PROXY TCP4 ...\r\n`. Mismatched address
/// families degrade to `PROXY UNKNOWN\r\n` per the haproxy spec.
pub fn encode_v1(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let line = match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            format!("PROXY TCP4 {s} {d} {} {}\r\n", src.port(), dst.port())
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            format!("PROXY TCP6 {s} {d} {} {}\r\n", src.port(), dst.port())
        }
        _ => "PROXY UNKNOWN\r\n".to_string(),
    };
    line.into_bytes()
}

/// v2 is a fixed 16-byte header followed by a family-dependent address block.
pub fn encode_v2(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let mut buf = Vec::with_capacity(16 + 12);
            buf.extend_from_slice(&V2_SIGNATURE);
            buf.push(V2_CMD_PROXY);
            buf.push(V2_AF_INET | V2_TRANSPORT_STREAM);
            buf.extend_from_slice(&12u16.to_be_bytes());
            buf.extend_from_slice(&s.octets());
            buf.extend_from_slice(&d.octets());
            buf.extend_from_slice(&src.port().to_be_bytes());
            buf.extend_from_slice(&dst.port().to_be_bytes());
            buf
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let mut buf = Vec::with_capacity(16 + 36);
            buf.extend_from_slice(&V2_SIGNATURE);
            buf.push(V2_CMD_PROXY);
            buf.push(V2_AF_INET6 | V2_TRANSPORT_STREAM);
            buf.extend_from_slice(&36u16.to_be_bytes());
            buf.extend_from_slice(&s.octets());
            buf.extend_from_slice(&d.octets());
            buf.extend_from_slice(&src.port().to_be_bytes());
            buf.extend_from_slice(&dst.port().to_be_bytes());
            buf
        }
        // Mixed families carry no address block.
        _ => {
            let mut buf = Vec::with_capacity(16);
            buf.extend_from_slice(&V2_SIGNATURE);
            buf.push(V2_CMD_PROXY);
            buf.push(0x00);
            buf.extend_from_slice(&0u16.to_be_bytes());
            buf
        }
    }
}
