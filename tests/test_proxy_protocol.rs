//! Tests for PROXY protocol header emission

use janus::config::ProxyHeaderVersion;
use janus::proxy::proxy_protocol::{encode, encode_v1, encode_v2};

#[test]
fn test_v1_header_exact_bytes() {
    let header = encode(
        ProxyHeaderVersion::V1,
        "198.51.100.7:54321".parse().unwrap(),
        "203.0.113.1:443".parse().unwrap(),
    );
    assert_eq!(header, b"PROXY TCP4 198.51.100.7 203.0.113.1 54321 443\r\n");
}

#[test]
fn test_v1_ipv6() {
    let header = encode_v1(
        "[2001:db8::1]:1000".parse().unwrap(),
        "[2001:db8::2]:443".parse().unwrap(),
    );
    let line = String::from_utf8(header).unwrap();
    assert!(line.starts_with("PROXY TCP6 2001:db8::1 2001:db8::2 1000 443"));
    assert!(line.ends_with("\r\n"));
}

#[test]
fn test_v2_signature_and_lengths() {
    let v4 = encode_v2("192.0.2.10:4000".parse().unwrap(), "192.0.2.20:443".parse().unwrap());
    assert_eq!(v4.len(), 28);
    assert_eq!(&v4[..12], &[0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A]);

    let v6 = encode_v2("[2001:db8::1]:1234".parse().unwrap(), "[2001:db8::2]:443".parse().unwrap());
    assert_eq!(v6.len(), 52);
}
