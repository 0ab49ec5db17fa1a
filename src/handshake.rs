//! Stream preamble exchanged on every dialed stream.
//!
//! The first byte of a dialed stream names its kind. Handshake streams follow
//! it with a 2-byte big-endian length and a bincode-encoded [`DialPacket`]
//! that tells the listener which overlay address is calling and over which
//! path.

use bincode::{Decode, Encode};

use crate::addr::{Address, Path};
use crate::error::{Error, Result};
use crate::transport::{Stream, read_full};

/// Default upper bound for an encoded handshake packet.
pub const PACKET_SIZE: usize = 1400;

const LEN_SIZE: usize = 2;

/// Kind tag carried by the first byte of every dialed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    /// Plain data, no packet follows.
    Data = 0x00,
    /// A [`DialPacket`] follows.
    Handshake = 0x01,
}

impl TryFrom<u8> for StreamKind {
    type Error = Error;

    fn try_from(tag: u8) -> Result<StreamKind> {
        match tag {
            0x00 => Ok(StreamKind::Data),
            0x01 => Ok(StreamKind::Handshake),
            other => Err(Error::Handshake(format!("unknown stream kind {other:#04x}"))),
        }
    }
}

/// Announces the dialer's address and the path it dialed over.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DialPacket {
    /// Overlay address of the announcing endpoint.
    pub addr: Address,
    /// Path the announcing endpoint dialed over.
    pub path: Path,
}

impl DialPacket {
    /// Serializes the packet.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Deserializes a packet that must span all of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<DialPacket> {
        let (packet, used): (DialPacket, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())?;
        if used != bytes.len() {
            return Err(Error::Serialization(format!(
                "{} trailing bytes after dial packet",
                bytes.len() - used
            )));
        }
        Ok(packet)
    }
}

/// Decoded start of an incoming stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    /// Kind announced by the dialer.
    pub kind: StreamKind,
    /// Present for handshake streams.
    pub packet: Option<DialPacket>,
}

/// Builds the bytes a dialer sends first on a new stream.
pub fn encode_preamble(packet: Option<&DialPacket>, max_size: usize) -> Result<Vec<u8>> {
    let Some(packet) = packet else {
        return Ok(vec![StreamKind::Data as u8]);
    };

    let body = packet.encode()?;
    if body.len() > max_size || body.len() > u16::MAX as usize {
        return Err(Error::Serialization(format!(
            "dial packet of {} bytes exceeds limit of {max_size}",
            body.len()
        )));
    }
    let mut out = Vec::with_capacity(1 + LEN_SIZE + body.len());
    out.push(StreamKind::Handshake as u8);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reads and checks the preamble of a freshly accepted stream, consuming
/// exactly its bytes.
pub fn read_preamble(stream: &dyn Stream, max_size: usize) -> Result<Preamble> {
    let mut tag = [0u8; 1];
    read_full(stream, &mut tag)
        .map_err(|e| Error::Handshake(format!("failed to read stream kind: {e}")))?;
    let kind = StreamKind::try_from(tag[0])?;
    if kind == StreamKind::Data {
        return Ok(Preamble { kind, packet: None });
    }

    let mut len = [0u8; LEN_SIZE];
    read_full(stream, &mut len)
        .map_err(|e| Error::Serialization(format!("truncated dial packet length: {e}")))?;
    let len = u16::from_be_bytes(len) as usize;
    if len == 0 || len > max_size {
        return Err(Error::Serialization(format!(
            "dial packet length {len} outside 1..={max_size}"
        )));
    }

    let mut body = vec![0u8; len];
    read_full(stream, &mut body)
        .map_err(|e| Error::Serialization(format!("truncated dial packet: {e}")))?;
    let packet = DialPacket::decode(&body)?;
    log::debug!("Decoded dial packet from {}", packet.addr);
    Ok(Preamble {
        kind,
        packet: Some(packet),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedStream;

    fn packet() -> DialPacket {
        DialPacket {
            addr: "192.168.1.7:31000".parse().unwrap(),
            path: Path::new("1-ff00:0:110>1-ff00:0:111")
                .with_hops(["1-ff00:0:110#2", "1-ff00:0:111#5"])
                .with_mtu(1472),
        }
    }

    #[test]
    fn test_handshake_preamble_consumes_only_its_bytes() {
        let mut wire = encode_preamble(Some(&packet()), PACKET_SIZE).unwrap();
        assert_eq!(wire[0], StreamKind::Handshake as u8);
        wire.extend_from_slice(b"app data");

        let stream = ScriptedStream::new(&wire).with_chunking(3);
        let preamble = read_preamble(&stream, PACKET_SIZE).unwrap();
        assert_eq!(preamble.kind, StreamKind::Handshake);
        assert_eq!(preamble.packet, Some(packet()));

        let mut rest = [0u8; 8];
        crate::transport::read_full(&stream, &mut rest).unwrap();
        assert_eq!(&rest, b"app data");
    }

    #[test]
    fn test_data_preamble() {
        let wire = encode_preamble(None, PACKET_SIZE).unwrap();
        assert_eq!(wire, vec![0x00]);
        let preamble = read_preamble(&ScriptedStream::new(&wire), PACKET_SIZE).unwrap();
        assert_eq!(preamble.kind, StreamKind::Data);
        assert!(preamble.packet.is_none());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = read_preamble(&ScriptedStream::new(&[0x7f, 0, 1]), PACKET_SIZE).unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[test]
    fn test_empty_stream_is_rejected() {
        let err = read_preamble(&ScriptedStream::new(b""), PACKET_SIZE).unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[test]
    fn test_packet_size_limits() {
        assert!(matches!(
            encode_preamble(Some(&packet()), 8),
            Err(Error::Serialization(_))
        ));

        let mut wire = vec![StreamKind::Handshake as u8];
        wire.extend_from_slice(&(PACKET_SIZE as u16 + 1).to_be_bytes());
        assert!(matches!(
            read_preamble(&ScriptedStream::new(&wire), PACKET_SIZE),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_truncated_and_garbled_packets() {
        let full = encode_preamble(Some(&packet()), PACKET_SIZE).unwrap();
        let cut = &full[..full.len() - 4];
        assert!(matches!(
            read_preamble(&ScriptedStream::new(cut), PACKET_SIZE),
            Err(Error::Serialization(_))
        ));

        let garbled = [StreamKind::Handshake as u8, 0, 3, 0xff, 0xff, 0xff];
        assert!(matches!(
            read_preamble(&ScriptedStream::new(&garbled), PACKET_SIZE),
            Err(Error::Serialization(_))
        ));
    }
}
