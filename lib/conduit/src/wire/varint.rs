//! Variable-width encoding of unsigned 32-bit integers in 1..5 bytes.
//!
//! The number of leading one bits in the first byte is the number of
//! trailing bytes; the remaining bits of the first byte are the most
//! significant payload bits, and trailing bytes follow most significant
//! first. A first byte with five or more leading ones is malformed.

use crate::error::{ErrorKind, NetError, NetResult};
use crate::wire::cursor::{MessageWriter, WireRead};

/// Encoded size of `value` in bytes.
pub fn size(value: u32) -> usize {
    if value < 1 << 7 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 21 {
        3
    } else if value < 1 << 28 {
        4
    } else {
        5
    }
}

const PREFIX: [u8; 5] = [0x00, 0x80, 0xC0, 0xE0, 0xF0];

/// Writes `value` in variable-width form.
pub fn write(writer: &mut MessageWriter, value: u32) -> NetResult<()> {
    let trailing = size(value) - 1;
    let payload = ((value as u64) >> (8 * trailing)) as u8;
    writer.write_u8(PREFIX[trailing] | (payload & (0x7F >> trailing)))?;
    for i in (0..trailing).rev() {
        writer.write_u8((value >> (8 * i)) as u8)?;
    }
    Ok(())
}

/// Number of trailing bytes announced by a first byte.
pub fn trailing_count(first: u8) -> NetResult<usize> {
    let count = first.leading_ones() as usize;
    if count >= 5 {
        return Err(NetError::Fatal(ErrorKind::MalformedVarInt));
    }
    Ok(count)
}

/// Payload bits carried by the first byte itself.
pub fn first_payload(first: u8, trailing: usize) -> u32 {
    (first & (0x7F >> trailing)) as u32
}

/// Folds one trailing byte into a partially-accumulated value.
pub fn accumulate(value: u64, byte: u8) -> u64 {
    (value << 8) | byte as u64
}

/// Reads a complete variable-width integer from a fully-buffered
/// message. A sequence that ends mid-way is malformed.
pub fn read<R: WireRead>(reader: &mut R) -> NetResult<u32> {
    let first = reader.read_u8().map_err(malformed_if_truncated)?;
    let trailing = trailing_count(first)?;

    let mut value = first_payload(first, trailing) as u64;
    for _ in 0..trailing {
        let byte = reader.read_u8().map_err(malformed_if_truncated)?;
        value = accumulate(value, byte);
    }

    if value > u32::MAX as u64 {
        return Err(NetError::Fatal(ErrorKind::MalformedVarInt));
    }
    Ok(value as u32)
}

fn malformed_if_truncated(error: NetError) -> NetError {
    match error {
        NetError::Fatal(ErrorKind::Truncated) => NetError::Fatal(ErrorKind::MalformedVarInt),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::cursor::MessageReader;
    use crate::wire::MessageBuffer;

    fn roundtrip(value: u32) -> usize {
        let mut writer = MessageWriter::with_capacity(1, 5);
        write(&mut writer, value).unwrap();
        let written = writer.body_pos();
        let buffer = writer.into_buffer();

        let mut reader = MessageReader::over_body(&buffer, false);
        assert_eq!(read(&mut reader).unwrap(), value, "value {:#x}", value);
        written
    }

    #[test]
    fn test_roundtrip_at_width_boundaries() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(127), 1);
        assert_eq!(roundtrip(128), 2);
        assert_eq!(roundtrip((1 << 14) - 1), 2);
        assert_eq!(roundtrip(1 << 14), 3);
        assert_eq!(roundtrip((1 << 21) - 1), 3);
        assert_eq!(roundtrip(1 << 21), 4);
        assert_eq!(roundtrip((1 << 28) - 1), 4);
        assert_eq!(roundtrip(1 << 28), 5);
        assert_eq!(roundtrip(u32::MAX), 5);
    }

    #[test]
    fn test_size_matches_written_length() {
        for &value in &[0u32, 1, 200, 40000, 3_000_000, 500_000_000, u32::MAX] {
            assert_eq!(roundtrip(value), size(value));
        }
    }

    #[test]
    fn test_overlong_first_byte_is_malformed() {
        let mut buffer = MessageBuffer::create(1, 5);
        buffer.body_mut()[0] = 0xF8;

        let mut reader = MessageReader::over_body(&buffer, false);
        assert_eq!(
            read(&mut reader),
            Err(NetError::Fatal(ErrorKind::MalformedVarInt))
        );
    }

    #[test]
    fn test_truncated_sequence_is_malformed() {
        let mut writer = MessageWriter::with_capacity(1, 1);
        // First byte of a three-byte sequence, with no room for the rest.
        writer.write_u8(0xC1).unwrap();
        let buffer = writer.into_buffer();

        let mut reader = MessageReader::over_body(&buffer, false);
        assert_eq!(
            read(&mut reader),
            Err(NetError::Fatal(ErrorKind::MalformedVarInt))
        );
    }

    #[test]
    fn test_five_byte_overflow_is_malformed() {
        // 0xF7 announces four trailing bytes with payload bits 0x7,
        // encoding a 35-bit value beyond u32 range.
        let mut buffer = MessageBuffer::create(1, 5);
        buffer.body_mut().copy_from_slice(&[0xF7, 0xFF, 0xFF, 0xFF, 0xFF]);

        let mut reader = MessageReader::over_body(&buffer, false);
        assert_eq!(
            read(&mut reader),
            Err(NetError::Fatal(ErrorKind::MalformedVarInt))
        );
    }
}
