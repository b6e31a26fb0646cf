//! VLESS request/response header codec (version 0).
//!
//! Grounded on the teacher's `protocol.rs` `VlessRequest`/`VlessResponse`
//! decode/encode shape, generalized so addons travel as an opaque,
//! protobuf-tolerant blob (see [`Addons`]) instead of a fixed struct,
//! and so address parsing is reusable from the XUDP codec (`xudp.rs`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::error::{Fallback, VlessError};

pub const VLESS_VERSION: u8 = 0;

/// VLESS command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp = 0x01,
    Udp = 0x02,
    Mux = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = VlessError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Tcp),
            0x02 => Ok(Command::Udp),
            0x03 => Ok(Command::Mux),
            _ => Err(VlessError::ProtocolFraming {
                message: format!("invalid command: {value}"),
                fallback: Fallback::NotPossible,
            }),
        }
    }
}

/// Destination address, one of the three VLESS address encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(a) => write!(f, "{a}"),
            Address::Domain(d) => write!(f, "{d}"),
            Address::Ipv6(a) => write!(f, "{a}"),
        }
    }
}

/// A cursor over bytes that may already be buffered (peeked ahead by
/// the driver) before the rest must be pulled from the live stream.
/// Factored once so VLESS header decoding and XUDP metadata decoding
/// share the same "port-then-address" reader (Design Note: Address
/// parser).
pub struct HeaderReader<'a, R> {
    prefix: Bytes,
    stream: &'a mut R,
}

impl<'a, R: AsyncRead + Unpin> HeaderReader<'a, R> {
    pub fn new(stream: &'a mut R) -> Self {
        Self {
            prefix: Bytes::new(),
            stream,
        }
    }

    pub fn with_prefix(stream: &'a mut R, prefix: Bytes) -> Self {
        Self { prefix, stream }
    }

    /// Bytes left over in the prefix once header decoding is done; the
    /// driver forwards these to the body pump as already-read payload.
    pub fn into_leftover_prefix(self) -> Bytes {
        self.prefix
    }

    pub async fn read_exact(&mut self, n: usize) -> std::io::Result<Bytes> {
        if self.prefix.len() >= n {
            return Ok(self.prefix.split_to(n));
        }
        let mut out = BytesMut::with_capacity(n);
        out.extend_from_slice(&self.prefix);
        self.prefix.clear();
        let remaining = n - out.len();
        let mut tail = vec![0u8; remaining];
        self.stream.read_exact(&mut tail).await?;
        out.extend_from_slice(&tail);
        Ok(out.freeze())
    }

    pub async fn read_u8(&mut self) -> std::io::Result<u8> {
        Ok(self.read_exact(1).await?[0])
    }

    pub async fn read_u16(&mut self) -> std::io::Result<u16> {
        let b = self.read_exact(2).await?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}

/// Reads `port` then `address` from a header reader, the VLESS and
/// XUDP wire order.
pub async fn decode_port_then_address<R: AsyncRead + Unpin>(
    reader: &mut HeaderReader<'_, R>,
) -> Result<(u16, Address), VlessError> {
    let port = reader
        .read_u16()
        .await
        .map_err(|_| VlessError::invalid_address())?;
    let addr_type = reader
        .read_u8()
        .await
        .map_err(|_| VlessError::invalid_address())?;
    let address = match addr_type {
        0x01 => {
            let b = reader
                .read_exact(4)
                .await
                .map_err(|_| VlessError::invalid_address())?;
            Address::Ipv4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        }
        0x02 => {
            let len = reader
                .read_u8()
                .await
                .map_err(|_| VlessError::invalid_address())? as usize;
            let b = reader
                .read_exact(len)
                .await
                .map_err(|_| VlessError::invalid_address())?;
            let domain = String::from_utf8(b.to_vec()).map_err(|_| VlessError::invalid_address())?;
            Address::Domain(domain)
        }
        0x03 => {
            let b = reader
                .read_exact(16)
                .await
                .map_err(|_| VlessError::invalid_address())?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b);
            Address::Ipv6(Ipv6Addr::from(octets))
        }
        _ => return Err(VlessError::invalid_address()),
    };
    Ok((port, address))
}

pub fn encode_address_port(buf: &mut BytesMut, port: u16, address: &Address) {
    buf.put_u16(port);
    match address {
        Address::Ipv4(a) => {
            buf.put_u8(0x01);
            buf.put_slice(&a.octets());
        }
        Address::Domain(d) => {
            buf.put_u8(0x02);
            buf.put_u8(d.len() as u8);
            buf.put_slice(d.as_bytes());
        }
        Address::Ipv6(a) => {
            buf.put_u8(0x03);
            buf.put_slice(&a.octets());
        }
    }
}

/// Opaque addons blob: a minimal protobuf-lite reader/writer that
/// tolerates unknown fields and only interprets field 1 (`flow`,
/// string) per spec §3/§4.1. Grounded on the tag/varint shape in
/// `un5af3-kapibara-service`'s `Addons::parse`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addons {
    pub flow: Option<String>,
    pub raw: Bytes,
}

const FLOW_FIELD_TAG: u8 = (1 << 3) | 2; // field 1, wire type 2 (length-delimited)

fn read_varint(buf: &mut Bytes) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        if buf.is_empty() {
            return None;
        }
        let byte = buf[0];
        buf.advance(1);
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

fn write_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

impl Addons {
    pub fn decode(mut raw: Bytes) -> Result<Self, VlessError> {
        let original = raw.clone();
        let mut flow = None;
        while !raw.is_empty() {
            let tag = raw[0];
            raw.advance(1);
            let wire_type = tag & 0x07;
            let field_num = tag >> 3;
            match wire_type {
                0 => {
                    read_varint(&mut raw).ok_or_else(Addons::truncated)?;
                }
                1 => {
                    if raw.len() < 8 {
                        return Err(Addons::truncated());
                    }
                    raw.advance(8);
                }
                2 => {
                    let len = read_varint(&mut raw).ok_or_else(Addons::truncated)? as usize;
                    if raw.len() < len {
                        return Err(Addons::truncated());
                    }
                    let field_bytes = raw.split_to(len);
                    if field_num == 1 && flow.is_none() {
                        flow = Some(
                            String::from_utf8(field_bytes.to_vec())
                                .map_err(|_| Addons::truncated())?,
                        );
                    }
                }
                5 => {
                    if raw.len() < 4 {
                        return Err(Addons::truncated());
                    }
                    raw.advance(4);
                }
                other => {
                    return Err(VlessError::malformed_addons(format!(
                        "unsupported wire type {other}"
                    )));
                }
            }
        }
        Ok(Addons {
            flow,
            raw: original,
        })
    }

    fn truncated() -> VlessError {
        VlessError::malformed_addons("truncated field")
    }

    pub fn encode(flow: &str) -> Bytes {
        if flow.is_empty() {
            return Bytes::new();
        }
        let mut buf = BytesMut::new();
        buf.put_u8(FLOW_FIELD_TAG);
        write_varint(&mut buf, flow.len() as u64);
        buf.put_slice(flow.as_bytes());
        buf.freeze()
    }
}

/// A decoded VLESS request header, prior to user lookup (`uuid` is the
/// raw wire value; the driver normalizes it for validator lookup).
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub version: u8,
    pub uuid: Uuid,
    pub addons: Addons,
    pub command: Command,
    pub port: u16,
    pub address: Address,
}

/// Synthetic address xray uses for Mux sessions (spec §4.1).
pub const MUX_COOL_DOMAIN: &str = "v1.mux.cool";

impl RequestHeader {
    /// Decodes a request, in normal mode (nothing pre-read) or
    /// first-byte-ahead mode (`prefix` holds bytes already read by the
    /// driver while peeking the connection).
    pub async fn decode<R: AsyncRead + Unpin>(
        stream: &mut R,
        prefix: Bytes,
    ) -> Result<(Self, Bytes), VlessError> {
        let first_byte_ahead = !prefix.is_empty();
        let mut reader = HeaderReader::with_prefix(stream, prefix);

        let version = reader
            .read_u8()
            .await
            .map_err(|_| VlessError::invalid_version(Fallback::NotPossible))?;
        if version != VLESS_VERSION {
            let fallback = if first_byte_ahead {
                Fallback::Possible
            } else {
                Fallback::NotPossible
            };
            return Err(VlessError::invalid_version(fallback));
        }

        let uuid_bytes = reader
            .read_exact(16)
            .await
            .map_err(|_| VlessError::invalid_version(Fallback::NotPossible))?;
        let mut raw_uuid = [0u8; 16];
        raw_uuid.copy_from_slice(&uuid_bytes);
        let uuid = Uuid::from_bytes(raw_uuid);

        let addons_len = reader
            .read_u8()
            .await
            .map_err(|_| VlessError::invalid_user(Fallback::Possible))? as usize;
        let addons_bytes = reader
            .read_exact(addons_len)
            .await
            .map_err(|_| VlessError::invalid_user(Fallback::Possible))?;
        let addons = Addons::decode(addons_bytes)?;

        let command_byte = reader
            .read_u8()
            .await
            .map_err(|_| VlessError::invalid_user(Fallback::Possible))?;
        let command = Command::try_from(command_byte)?;

        let (port, address) = match command {
            Command::Mux => (0, Address::Domain(MUX_COOL_DOMAIN.to_string())),
            Command::Tcp | Command::Udp => decode_port_then_address(&mut reader).await?,
        };

        let header = RequestHeader {
            version,
            uuid,
            addons,
            command,
            port,
            address,
        };
        Ok((header, reader.into_leftover_prefix()))
    }

    /// Encodes a request header; `flow` is embedded as the addons
    /// blob. The whole header is returned as one buffer so the caller
    /// can flush it in a single write (spec §4.1).
    pub fn encode(uuid: &Uuid, flow: &str, command: Command, port: u16, address: &Address) -> Bytes {
        let addons = Addons::encode(flow);
        let mut buf = BytesMut::with_capacity(18 + addons.len() + 19);
        buf.put_u8(VLESS_VERSION);
        buf.put_slice(uuid.as_bytes());
        buf.put_u8(addons.len() as u8);
        buf.put_slice(&addons);
        buf.put_u8(command as u8);
        if !matches!(command, Command::Mux) {
            encode_address_port(&mut buf, port, address);
        }
        buf.freeze()
    }
}

/// A decoded VLESS response header.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub version: u8,
    pub addons: Addons,
}

impl ResponseHeader {
    pub fn encode(version: u8, flow: &str) -> Bytes {
        let addons = Addons::encode(flow);
        let mut buf = BytesMut::with_capacity(2 + addons.len());
        buf.put_u8(version);
        buf.put_u8(addons.len() as u8);
        buf.put_slice(&addons);
        buf.freeze()
    }

    /// Decodes a response, verifying the echoed version matches what
    /// the client originally sent.
    pub async fn decode<R: AsyncRead + Unpin>(
        stream: &mut R,
        expected_version: u8,
    ) -> Result<Self, VlessError> {
        let mut reader = HeaderReader::new(stream);
        let version = reader
            .read_u8()
            .await
            .map_err(|_| VlessError::invalid_version(Fallback::NotPossible))?;
        if version != expected_version {
            return Err(VlessError::invalid_version(Fallback::NotPossible));
        }
        let addons_len = reader
            .read_u8()
            .await
            .map_err(|_| VlessError::invalid_version(Fallback::NotPossible))? as usize;
        let addons_bytes = reader
            .read_exact(addons_len)
            .await
            .map_err(|_| VlessError::invalid_version(Fallback::NotPossible))?;
        let addons = Addons::decode(addons_bytes)?;
        Ok(ResponseHeader { version, addons })
    }
}

/// Normalizes a wire UUID for validator lookup by zeroing bytes 6-7
/// (spec §3: two users whose raw UUIDs differ only in those bytes
/// collide silently — Design Note Open Question #1, preserved).
pub fn normalize_uuid(uuid: &Uuid) -> [u8; 16] {
    let mut bytes = *uuid.as_bytes();
    bytes[6] = 0;
    bytes[7] = 0;
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn request_roundtrip_tcp_ipv4() {
        let uuid = Uuid::new_v4();
        let addr = Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1));
        let encoded = RequestHeader::encode(&uuid, "", Command::Tcp, 9000, &addr);

        let mut cursor = Cursor::new(encoded.to_vec());
        let (decoded, leftover) = RequestHeader::decode(&mut cursor, Bytes::new()).await.unwrap();

        assert_eq!(decoded.version, VLESS_VERSION);
        assert_eq!(decoded.uuid, uuid);
        assert_eq!(decoded.command, Command::Tcp);
        assert_eq!(decoded.port, 9000);
        assert_eq!(decoded.address, addr);
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn request_roundtrip_vision_flow_domain() {
        let uuid = Uuid::new_v4();
        let addr = Address::Domain("example.com".to_string());
        let encoded = RequestHeader::encode(&uuid, "xtls-rprx-vision", Command::Udp, 443, &addr);

        let mut cursor = Cursor::new(encoded.to_vec());
        let (decoded, _) = RequestHeader::decode(&mut cursor, Bytes::new()).await.unwrap();

        assert_eq!(decoded.addons.flow.as_deref(), Some("xtls-rprx-vision"));
        assert_eq!(decoded.command, Command::Udp);
        assert_eq!(decoded.address, addr);
    }

    #[tokio::test]
    async fn request_mux_has_synthetic_address() {
        let uuid = Uuid::new_v4();
        let encoded = RequestHeader::encode(
            &uuid,
            "",
            Command::Mux,
            0,
            &Address::Ipv4(Ipv4Addr::UNSPECIFIED),
        );
        let mut cursor = Cursor::new(encoded.to_vec());
        let (decoded, _) = RequestHeader::decode(&mut cursor, Bytes::new()).await.unwrap();

        assert_eq!(decoded.command, Command::Mux);
        assert_eq!(decoded.address, Address::Domain(MUX_COOL_DOMAIN.to_string()));
        assert_eq!(decoded.port, 0);
    }

    #[tokio::test]
    async fn first_byte_ahead_invalid_version_signals_fallback() {
        let mut bogus = vec![7u8]; // invalid version
        bogus.extend(std::iter::repeat(0u8).take(17));
        let prefix = Bytes::from(bogus);
        let mut empty = Cursor::new(Vec::<u8>::new());

        let err = RequestHeader::decode(&mut empty, prefix).await.unwrap_err();
        assert!(err.fallback_possible());
    }

    #[tokio::test]
    async fn normal_mode_invalid_version_no_fallback() {
        let mut stream = Cursor::new(vec![7u8]);
        let err = RequestHeader::decode(&mut stream, Bytes::new()).await.unwrap_err();
        assert!(!err.fallback_possible());
    }

    #[test]
    fn uuid_normalization_zeroes_bytes_6_and_7() {
        let uuid = Uuid::from_bytes([0xFF; 16]);
        let normalized = normalize_uuid(&uuid);
        assert_eq!(normalized[6], 0);
        assert_eq!(normalized[7], 0);
        for (i, b) in normalized.iter().enumerate() {
            if i != 6 && i != 7 {
                assert_eq!(*b, 0xFF);
            }
        }
    }

    #[test]
    fn addons_roundtrip_with_flow() {
        let encoded = Addons::encode("xtls-rprx-vision");
        let decoded = Addons::decode(encoded).unwrap();
        assert_eq!(decoded.flow.as_deref(), Some("xtls-rprx-vision"));
    }

    #[test]
    fn addons_empty_when_no_flow() {
        let encoded = Addons::encode("");
        assert!(encoded.is_empty());
        let decoded = Addons::decode(encoded).unwrap();
        assert_eq!(decoded.flow, None);
    }

    #[tokio::test]
    async fn response_roundtrip() {
        let encoded = ResponseHeader::encode(0, "");
        let mut cursor = Cursor::new(encoded.to_vec());
        let decoded = ResponseHeader::decode(&mut cursor, 0).await.unwrap();
        assert_eq!(decoded.version, 0);
    }
}
