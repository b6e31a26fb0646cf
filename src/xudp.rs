//! XUDP packet codec: frames multiple UDP flows over a single Mux
//! stream (spec §4.5, §6). No teacher module covers this; grounded on
//! the `decode_port_then_address`/`encode_address_port`/`HeaderReader`
//! helpers factored out in `protocol.rs` so address parsing isn't
//! duplicated here.

use std::env;
use std::io::Cursor;
use std::sync::OnceLock;

use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buffers::buf;
use crate::error::VlessError;
use crate::protocol::{decode_port_then_address, encode_address_port, Address, HeaderReader};

const STATUS_NEW: u8 = 0x01;
const STATUS_KEEP: u8 = 0x02;
const STATUS_DISCARD: u8 = 0x04;
const HAS_OPT: u8 = 0x01;
const NETWORK_UDP: u8 = 0x02;
const OPT_ADDRESS: u8 = 0x02;
const GLOBAL_ID_SIZE: usize = 8;

/// Safety margin for metadata + length prefixes (spec §4.5: "refuse to
/// emit packets where `payload_len + 666 > buf::Size`").
const METADATA_SAFETY_MARGIN: usize = 666;

/// Inbound protocols eligible for a derived `global_id` (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundProtocol {
    DokodemoDoor,
    Socks,
    Shadowsocks,
    Other,
}

fn base_key() -> &'static [u8; 32] {
    static KEY: OnceLock<[u8; 32]> = OnceLock::new();
    KEY.get_or_init(|| {
        if let Ok(encoded) = env::var("XUDP_BASE_KEY") {
            if let Ok(decoded) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(&encoded)
            {
                if decoded.len() == 32 {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(&decoded);
                    return key;
                }
            }
        }
        let mut key = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut key);
        key
    })
}

/// Derives the 8-byte `global_id` for one inbound source, or all zeroes
/// when the session doesn't qualify (spec §4.5).
pub fn derive_global_id(cone: bool, protocol: InboundProtocol, inbound_source: &str) -> [u8; 8] {
    let eligible = cone
        && matches!(
            protocol,
            InboundProtocol::DokodemoDoor | InboundProtocol::Socks | InboundProtocol::Shadowsocks
        );
    if !eligible {
        return [0u8; 8];
    }
    let hash = blake3::keyed_hash(base_key(), inbound_source.as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&hash.as_bytes()[..GLOBAL_ID_SIZE]);
    id
}

/// One decoded XUDP record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XudpPacket {
    /// First packet seen for this Mux stream: always carries a
    /// destination and a `global_id`.
    New {
        destination: (Address, u16),
        global_id: [u8; 8],
        payload: Bytes,
    },
    /// Continuation packet; `destination` is only set when it differs
    /// from the previous packet on this stream.
    Keep {
        destination: Option<(Address, u16)>,
        payload: Bytes,
    },
    /// End-of-session marker; no payload follows.
    Discard,
}

/// Per-Mux-stream XUDP writer: tracks whether the first packet has
/// been emitted yet and the last destination written, so repeat writes
/// to the same destination omit the address (spec §4.5 "Subsequent").
pub struct XudpWriter {
    cone: bool,
    protocol: InboundProtocol,
    inbound_source: String,
    first_written: bool,
    last_destination: Option<(Address, u16)>,
}

impl XudpWriter {
    pub fn new(cone: bool, protocol: InboundProtocol, inbound_source: impl Into<String>) -> Self {
        Self {
            cone,
            protocol,
            inbound_source: inbound_source.into(),
            first_written: false,
            last_destination: None,
        }
    }

    /// Appends one framed XUDP record (metadata + payload) to `out`.
    pub fn write_packet(
        &mut self,
        out: &mut BytesMut,
        destination: &(Address, u16),
        payload: &[u8],
    ) -> Result<(), VlessError> {
        if payload.len() + METADATA_SAFETY_MARGIN > buf::SIZE {
            return Err(VlessError::Fatal(format!(
                "xudp payload too large: {} bytes",
                payload.len()
            )));
        }

        let mut metadata = BytesMut::new();
        metadata.put_u16(0); // mux id, always 0 for a single-flow session
        if !self.first_written {
            self.first_written = true;
            self.last_destination = Some(destination.clone());
            let global_id = derive_global_id(self.cone, self.protocol, &self.inbound_source);
            metadata.put_u8(STATUS_NEW);
            metadata.put_u8(HAS_OPT);
            metadata.put_u8(NETWORK_UDP);
            encode_address_port(&mut metadata, destination.1, &destination.0);
            metadata.put_slice(&global_id);
        } else {
            metadata.put_u8(STATUS_KEEP);
            metadata.put_u8(HAS_OPT);
            if self.last_destination.as_ref() != Some(destination) {
                self.last_destination = Some(destination.clone());
                metadata.put_u8(OPT_ADDRESS);
                encode_address_port(&mut metadata, destination.1, &destination.0);
            }
        }

        out.put_u16(metadata.len() as u16);
        out.put_slice(&metadata);
        out.put_u16(payload.len() as u16);
        out.put_slice(payload);
        Ok(())
    }

    /// Appends the end-of-session marker.
    pub fn write_discard(&self, out: &mut BytesMut) {
        let mut metadata = BytesMut::new();
        metadata.put_u16(0);
        metadata.put_u8(STATUS_DISCARD);
        out.put_u16(metadata.len() as u16);
        out.put_slice(&metadata);
    }
}

/// Reads one framed XUDP record from `stream`.
pub async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R) -> Result<XudpPacket, VlessError> {
    let malformed = |reason: &str| VlessError::malformed_addons(format!("xudp: {reason}"));

    let mut len_bytes = [0u8; 2];
    stream
        .read_exact(&mut len_bytes)
        .await
        .map_err(|_| malformed("truncated metadata length"))?;
    let metadata_len = u16::from_be_bytes(len_bytes) as usize;
    if metadata_len < 3 {
        return Err(malformed("metadata shorter than status header"));
    }
    let mut metadata = vec![0u8; metadata_len];
    stream
        .read_exact(&mut metadata)
        .await
        .map_err(|_| malformed("truncated metadata"))?;

    let status = metadata[2];
    let packet = match status {
        STATUS_DISCARD => return Ok(XudpPacket::Discard),
        STATUS_NEW => {
            if metadata.len() < 5 || metadata[3] != HAS_OPT || metadata[4] != NETWORK_UDP {
                return Err(malformed("malformed new-packet header"));
            }
            let mut cursor = Cursor::new(metadata[5..].to_vec());
            let (port, address) = {
                let mut reader = HeaderReader::new(&mut cursor);
                decode_port_then_address(&mut reader).await?
            };
            let mut global_id = [0u8; 8];
            cursor
                .read_exact(&mut global_id)
                .await
                .map_err(|_| malformed("missing global_id"))?;
            Some((Some((address, port)), Some(global_id)))
        }
        STATUS_KEEP => {
            if metadata.len() < 4 || metadata[3] != HAS_OPT {
                return Err(malformed("malformed keep-packet header"));
            }
            if metadata.len() > 4 && metadata[4] == OPT_ADDRESS {
                let mut cursor = Cursor::new(metadata[5..].to_vec());
                let mut reader = HeaderReader::new(&mut cursor);
                let (port, address) = decode_port_then_address(&mut reader).await?;
                Some((Some((address, port)), None))
            } else {
                Some((None, None))
            }
        }
        _ => return Err(malformed("unexpected status byte, end of session")),
    };

    let (destination, global_id) = packet.expect("matched above");

    let mut payload_len_bytes = [0u8; 2];
    stream
        .read_exact(&mut payload_len_bytes)
        .await
        .map_err(|_| malformed("truncated payload length"))?;
    let payload_len = u16::from_be_bytes(payload_len_bytes) as usize;
    let mut payload = vec![0u8; payload_len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|_| malformed("truncated payload"))?;

    Ok(match (status, destination, global_id) {
        (STATUS_NEW, Some(dest), Some(global_id)) => XudpPacket::New {
            destination: dest,
            global_id,
            payload: Bytes::from(payload),
        },
        _ => XudpPacket::Keep {
            destination,
            payload: Bytes::from(payload),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn new_packet_roundtrips_with_destination_and_payload() {
        let dest = (Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), 53u16);
        let mut writer = XudpWriter::new(false, InboundProtocol::Other, "");
        let mut out = BytesMut::new();
        writer.write_packet(&mut out, &dest, b"ping").unwrap();

        let mut cursor = Cursor::new(out.to_vec());
        let packet = read_packet(&mut cursor).await.unwrap();
        match packet {
            XudpPacket::New {
                destination,
                payload,
                global_id,
            } => {
                assert_eq!(destination, dest);
                assert_eq!(&payload[..], b"ping");
                assert_eq!(global_id, [0u8; 8]);
            }
            other => panic!("expected New, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_write_same_destination_omits_address() {
        let dest = (Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), 53u16);
        let mut writer = XudpWriter::new(false, InboundProtocol::Other, "");
        let mut first = BytesMut::new();
        writer.write_packet(&mut first, &dest, b"ping").unwrap();
        let mut second = BytesMut::new();
        writer.write_packet(&mut second, &dest, b"pong").unwrap();

        // metadata starts with mux-id [0,0] then status=keep(2), has-opt(1)
        assert_eq!(&second[2..6], &[0, 0, STATUS_KEEP, HAS_OPT]);

        let mut cursor = Cursor::new(second.to_vec());
        let packet = read_packet(&mut cursor).await.unwrap();
        match packet {
            XudpPacket::Keep {
                destination,
                payload,
            } => {
                assert_eq!(destination, None);
                assert_eq!(&payload[..], b"pong");
            }
            other => panic!("expected Keep, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_to_new_destination_after_first_carries_address() {
        let dest_a = (Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), 53u16);
        let dest_b = (Address::Ipv4(Ipv4Addr::new(10, 0, 0, 2)), 80u16);
        let mut writer = XudpWriter::new(false, InboundProtocol::Other, "");
        let mut first = BytesMut::new();
        writer.write_packet(&mut first, &dest_a, b"a").unwrap();
        let mut second = BytesMut::new();
        writer.write_packet(&mut second, &dest_b, b"b").unwrap();

        let mut cursor = Cursor::new(second.to_vec());
        let packet = read_packet(&mut cursor).await.unwrap();
        match packet {
            XudpPacket::Keep {
                destination: Some(dest),
                payload,
            } => {
                assert_eq!(dest, dest_b);
                assert_eq!(&payload[..], b"b");
            }
            other => panic!("expected Keep with destination, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn discard_marker_roundtrips() {
        let writer = XudpWriter::new(false, InboundProtocol::Other, "");
        let mut out = BytesMut::new();
        writer.write_discard(&mut out);
        let mut cursor = Cursor::new(out.to_vec());
        let packet = read_packet(&mut cursor).await.unwrap();
        assert_eq!(packet, XudpPacket::Discard);
    }

    #[test]
    fn global_id_is_zero_unless_cone_and_eligible_protocol() {
        assert_eq!(
            derive_global_id(false, InboundProtocol::Socks, "1.2.3.4:1"),
            [0u8; 8]
        );
        assert_eq!(
            derive_global_id(true, InboundProtocol::Other, "1.2.3.4:1"),
            [0u8; 8]
        );
        let id = derive_global_id(true, InboundProtocol::Socks, "1.2.3.4:1");
        assert_ne!(id, [0u8; 8]);
    }

    #[test]
    fn global_id_is_deterministic_for_same_source() {
        let a = derive_global_id(true, InboundProtocol::Shadowsocks, "1.2.3.4:1");
        let b = derive_global_id(true, InboundProtocol::Shadowsocks, "1.2.3.4:1");
        assert_eq!(a, b);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let dest = (Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), 53u16);
        let mut writer = XudpWriter::new(false, InboundProtocol::Other, "");
        let payload = vec![0u8; buf::SIZE];
        let mut out = BytesMut::new();
        assert!(writer.write_packet(&mut out, &dest, &payload).is_err());
    }
}
