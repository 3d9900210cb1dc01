//! The core session protocol: fixed message IDs, handshake frame
//! layouts, and the marshalling helpers they share.

use crate::error::{ErrorKind, NetError, NetResult};
use crate::wire::cursor::{MessageWriter, WireRead};
use crate::wire::MessageBuffer;
use crate::MessageId;

/// First word of the handshake, written in the sender's native order.
pub const ENDIANNESS_MARKER: u32 = 0x12345678;
/// What the marker looks like when the peer's byte order differs.
pub const ENDIANNESS_MARKER_SWAPPED: u32 = 0x78563412;

/// Core protocol version: major in the upper 16 bits.
pub const PROTOCOL_VERSION: u32 = 1 << 16;

pub const DEFAULT_PORT: u16 = 26000;

/// Fixed width of name fields on the wire (NUL-padded).
pub const NAME_LEN: usize = 32;
/// Width of the authentication nonce.
pub const NONCE_LEN: usize = 16;
/// Width of the session-password hash.
pub const HASH_LEN: usize = 16;

/// Message IDs reserved for the core. Plug-in ranges start at
/// [`NUM_CORE_MESSAGES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreMessage {
    PasswordRequest = 0,
    ConnectRequest = 1,
    ConnectReply = 2,
    ConnectReject = 3,
    UdpConnectRequest = 4,
    UdpConnectReply = 5,
    PingRequest = 6,
    PingReply = 7,
    DisconnectRequest = 8,
    NameChangeRequest = 9,
    NameChangeReply = 10,
    NameChangeNotification = 11,
    ClientConnectNotification = 12,
    ClientDisconnectNotification = 13,
}

pub const NUM_CORE_MESSAGES: MessageId = 14;

impl CoreMessage {
    pub fn id(self) -> MessageId {
        self as MessageId
    }
}

/// Status of one protocol negotiation sub-record in a `ConnectReply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    Success = 0,
    UnknownProtocol = 1,
    WrongVersion = 2,
}

impl ProtocolStatus {
    pub fn from_u8(value: u8) -> Option<ProtocolStatus> {
        match value {
            0 => Some(ProtocolStatus::Success),
            1 => Some(ProtocolStatus::UnknownProtocol),
            2 => Some(ProtocolStatus::WrongVersion),
            _ => None,
        }
    }
}

// Fixed message and prefix sizes, header excluded.
pub const PASSWORD_REQUEST_SIZE: usize = 4 + 4 + NONCE_LEN;
pub const CONNECT_REQUEST_PREFIX_SIZE: usize = 4 + 4 + HASH_LEN + NAME_LEN + 2;
pub const PROTOCOL_REQUEST_SIZE: usize = NAME_LEN + 4;
pub const CONNECT_REPLY_PREFIX_SIZE: usize = NAME_LEN + 2 + NAME_LEN + 4 + 2;
pub const PROTOCOL_REPLY_SIZE: usize = 1 + 4 + 2 + 2 + 2;
pub const UDP_CONNECT_REQUEST_SIZE: usize = 2 + 4;
pub const UDP_CONNECT_REPLY_SIZE: usize = 4;
pub const PING_SIZE: usize = 2 + 8 + 8;
pub const NAME_CHANGE_REQUEST_SIZE: usize = NAME_LEN;
pub const NAME_CHANGE_REPLY_SIZE: usize = 1 + NAME_LEN;
pub const NAME_CHANGE_NOTIFICATION_SIZE: usize = 2 + NAME_LEN;
pub const CLIENT_CONNECT_NOTIFICATION_PREFIX_SIZE: usize = 2 + NAME_LEN + 2;
pub const CLIENT_DISCONNECT_NOTIFICATION_SIZE: usize = 2;

/// Writes a fixed-width NUL-padded name field, truncating over-long
/// names at a character boundary.
pub fn write_name_field(writer: &mut MessageWriter, name: &str) -> NetResult<()> {
    let mut end = NAME_LEN.min(name.len());
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut field = [0u8; NAME_LEN];
    field[..end].copy_from_slice(&name.as_bytes()[..end]);
    writer.write_bytes(&field)
}

/// Reads a fixed-width name field.
pub fn read_name_field<R: WireRead>(reader: &mut R) -> NetResult<[u8; NAME_LEN]> {
    let mut field = [0u8; NAME_LEN];
    reader.fetch(&mut field)?;
    Ok(field)
}

/// Decodes a name field: NUL padding stripped, `None` if the content is
/// not valid UTF-8.
pub fn decode_name(field: &[u8; NAME_LEN]) -> Option<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    std::str::from_utf8(&field[..end]).ok().map(str::to_owned)
}

/// Builds a ping request or reply stamped with the local wall clock.
pub fn create_ping(message_id: MessageId, sequence: i16) -> MessageBuffer {
    let (sec, nsec) = keel::time::wallclock();
    let mut writer = MessageWriter::with_capacity(message_id, PING_SIZE);
    writer.write_i16(sequence).expect("Ping body size mismatch");
    writer.write_i64(sec).expect("Ping body size mismatch");
    writer.write_i64(nsec).expect("Ping body size mismatch");
    writer.into_buffer()
}

/// Reads the body of a ping message: (sequence, seconds, nanoseconds).
pub fn read_ping<R: WireRead>(reader: &mut R) -> NetResult<(i16, i64, i64)> {
    if reader.unread() < PING_SIZE {
        return Err(NetError::Fatal(ErrorKind::Truncated));
    }
    Ok((reader.read_i16()?, reader.read_i64()?, reader.read_i64()?))
}

/// A parsed `vci://host[:port][/password]` server URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    pub host: String,
    pub port: u16,
    pub password: String,
}

/// True if the string looks like a server URI.
pub fn is_uri(string: &str) -> bool {
    string.starts_with("vci://")
}

/// Parses a server URI; `None` if the format is wrong after all.
pub fn parse_uri(string: &str) -> Option<ServerUri> {
    let rest = string.strip_prefix("vci://")?;

    let (authority, password) = match rest.find('/') {
        Some(slash) => (&rest[..slash], &rest[slash + 1..]),
        None => (rest, ""),
    };
    if authority.is_empty() {
        return None;
    }

    let (host, port) = match authority.rfind(':') {
        Some(colon) => {
            let port = authority[colon + 1..].parse::<u16>().ok()?;
            (&authority[..colon], port)
        }
        None => (authority, DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }

    Some(ServerUri {
        host: host.to_owned(),
        port,
        password: password.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::cursor::MessageReader;

    #[test]
    fn test_name_field_roundtrip() {
        let mut writer = MessageWriter::with_capacity(1, NAME_LEN);
        write_name_field(&mut writer, "alice").unwrap();
        let buffer = writer.into_buffer();

        let mut reader = MessageReader::over_body(&buffer, false);
        let field = read_name_field(&mut reader).unwrap();
        assert_eq!(decode_name(&field).unwrap(), "alice");
    }

    #[test]
    fn test_name_field_truncates_at_char_boundary() {
        // 31 ASCII bytes followed by a two-byte character that would
        // straddle the field boundary.
        let name = format!("{}é", "x".repeat(31));

        let mut writer = MessageWriter::with_capacity(1, NAME_LEN);
        write_name_field(&mut writer, &name).unwrap();
        let buffer = writer.into_buffer();

        let mut reader = MessageReader::over_body(&buffer, false);
        let field = read_name_field(&mut reader).unwrap();
        assert_eq!(decode_name(&field).unwrap(), "x".repeat(31));
    }

    #[test]
    fn test_decode_name_rejects_invalid_utf8() {
        let mut field = [0u8; NAME_LEN];
        field[0] = 0xFF;
        field[1] = 0xFE;
        assert_eq!(decode_name(&field), None);
    }

    #[test]
    fn test_ping_roundtrip() {
        let ping = create_ping(CoreMessage::PingRequest.id(), -7);
        let mut reader = MessageReader::over_body(&ping, false);

        let (sequence, sec, nsec) = read_ping(&mut reader).unwrap();
        assert_eq!(sequence, -7);
        assert!(sec > 0);
        assert!((0..1_000_000_000).contains(&nsec));
    }

    #[test]
    fn test_parse_uri_variants() {
        assert_eq!(
            parse_uri("vci://example.org:4711/sesame").unwrap(),
            ServerUri {
                host: "example.org".to_owned(),
                port: 4711,
                password: "sesame".to_owned(),
            }
        );
        assert_eq!(
            parse_uri("vci://localhost:26000/").unwrap(),
            ServerUri {
                host: "localhost".to_owned(),
                port: 26000,
                password: String::new(),
            }
        );
        assert_eq!(parse_uri("vci://host").unwrap().port, DEFAULT_PORT);
        assert_eq!(parse_uri("http://host"), None);
        assert_eq!(parse_uri("vci://"), None);
        assert_eq!(parse_uri("vci://:123"), None);
    }

    #[test]
    fn test_core_message_ids_are_stable() {
        assert_eq!(CoreMessage::PasswordRequest.id(), 0);
        assert_eq!(CoreMessage::ClientDisconnectNotification.id(), 13);
        assert_eq!(NUM_CORE_MESSAGES, 14);
    }
}
