use crate::error::{ErrorKind, NetError, NetResult};
use crate::wire::buffer::{BufferRef, MessageBuffer, HEADER_SIZE};
use crate::MessageId;
use byteorder::{ByteOrder, NativeEndian};

/// Sequential scalar reads with per-session endianness handling.
///
/// Scalars are written to the wire in the sender's native byte order;
/// a reader whose `swap_on_read` flag is set (established from the
/// handshake endianness marker) byte-swaps every scalar it reads. The
/// trait is implemented by [`MessageReader`] for fully-buffered messages
/// and by the non-blocking TCP socket for streaming reads.
pub trait WireRead {
    /// Number of unread bytes available.
    fn unread(&self) -> usize;

    /// Whether scalars must be byte-swapped after reading.
    fn swap_on_read(&self) -> bool;

    /// Copies exactly `out.len()` raw bytes, advancing the cursor.
    fn fetch(&mut self, out: &mut [u8]) -> NetResult<()>;

    /// Discards `count` bytes.
    fn skip(&mut self, count: usize) -> NetResult<()>;

    fn read_u8(&mut self) -> NetResult<u8> {
        let mut b = [0u8; 1];
        self.fetch(&mut b)?;
        Ok(b[0])
    }

    fn read_i8(&mut self) -> NetResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    fn read_u16(&mut self) -> NetResult<u16> {
        let mut b = [0u8; 2];
        self.fetch(&mut b)?;
        let value = NativeEndian::read_u16(&b);
        Ok(if self.swap_on_read() { value.swap_bytes() } else { value })
    }

    fn read_i16(&mut self) -> NetResult<i16> {
        Ok(self.read_u16()? as i16)
    }

    fn read_u32(&mut self) -> NetResult<u32> {
        let mut b = [0u8; 4];
        self.fetch(&mut b)?;
        let value = NativeEndian::read_u32(&b);
        Ok(if self.swap_on_read() { value.swap_bytes() } else { value })
    }

    fn read_i32(&mut self) -> NetResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    fn read_u64(&mut self) -> NetResult<u64> {
        let mut b = [0u8; 8];
        self.fetch(&mut b)?;
        let value = NativeEndian::read_u64(&b);
        Ok(if self.swap_on_read() { value.swap_bytes() } else { value })
    }

    fn read_i64(&mut self) -> NetResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    fn read_f32(&mut self) -> NetResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    fn read_f64(&mut self) -> NetResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }
}

/// Reader over a fully-received message body or datagram.
pub struct MessageReader<'a> {
    data: &'a [u8],
    pos: usize,
    swap_on_read: bool,
}

impl<'a> MessageReader<'a> {
    /// Reads the body of a message buffer.
    pub fn over_body(buffer: &'a MessageBuffer, swap_on_read: bool) -> MessageReader<'a> {
        MessageReader {
            data: buffer.body(),
            pos: 0,
            swap_on_read,
        }
    }

    /// Reads raw wire bytes, e.g. a UDP datagram including its header.
    pub fn over_bytes(data: &'a [u8], swap_on_read: bool) -> MessageReader<'a> {
        MessageReader {
            data,
            pos: 0,
            swap_on_read,
        }
    }

    pub fn set_swap_on_read(&mut self, swap_on_read: bool) {
        self.swap_on_read = swap_on_read;
    }

    /// The unread remainder of the message.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

impl<'a> WireRead for MessageReader<'a> {
    fn unread(&self) -> usize {
        self.data.len() - self.pos
    }

    fn swap_on_read(&self) -> bool {
        self.swap_on_read
    }

    fn fetch(&mut self, out: &mut [u8]) -> NetResult<()> {
        if self.unread() < out.len() {
            return Err(NetError::Fatal(ErrorKind::Truncated));
        }
        out.copy_from_slice(&self.data[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Ok(())
    }

    fn skip(&mut self, count: usize) -> NetResult<()> {
        if self.unread() < count {
            return Err(NetError::Fatal(ErrorKind::Truncated));
        }
        self.pos += count;
        Ok(())
    }
}

/// Sequential writer filling a message buffer's body. Writes are in
/// native byte order and refuse to exceed the capacity fixed at
/// allocation.
pub struct MessageWriter {
    buffer: MessageBuffer,
    pos: usize,
}

impl MessageWriter {
    /// Starts writing the body of a freshly allocated message.
    pub fn new(buffer: MessageBuffer) -> MessageWriter {
        MessageWriter {
            buffer,
            pos: HEADER_SIZE,
        }
    }

    /// Allocates a buffer for the given ID and body size and starts
    /// writing it.
    pub fn with_capacity(message_id: MessageId, body_size: usize) -> MessageWriter {
        MessageWriter::new(MessageBuffer::create(message_id, body_size))
    }

    /// Remaining body capacity.
    pub fn space(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// True once the body has been filled completely.
    pub fn eof(&self) -> bool {
        self.space() == 0
    }

    fn slot(&mut self, count: usize) -> NetResult<&mut [u8]> {
        if self.space() < count {
            return Err(NetError::Fatal(ErrorKind::BufferOverflow));
        }
        let start = self.pos;
        self.pos += count;
        Ok(&mut self.buffer.bytes_mut()[start..start + count])
    }

    pub fn write_u8(&mut self, value: u8) -> NetResult<()> {
        self.slot(1)?[0] = value;
        Ok(())
    }

    pub fn write_i8(&mut self, value: i8) -> NetResult<()> {
        self.write_u8(value as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> NetResult<()> {
        NativeEndian::write_u16(self.slot(2)?, value);
        Ok(())
    }

    pub fn write_i16(&mut self, value: i16) -> NetResult<()> {
        self.write_u16(value as u16)
    }

    pub fn write_u32(&mut self, value: u32) -> NetResult<()> {
        NativeEndian::write_u32(self.slot(4)?, value);
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> NetResult<()> {
        self.write_u32(value as u32)
    }

    pub fn write_u64(&mut self, value: u64) -> NetResult<()> {
        NativeEndian::write_u64(self.slot(8)?, value);
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> NetResult<()> {
        self.write_u64(value as u64)
    }

    pub fn write_f32(&mut self, value: f32) -> NetResult<()> {
        self.write_u32(value.to_bits())
    }

    pub fn write_f64(&mut self, value: f64) -> NetResult<()> {
        self.write_u64(value.to_bits())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> NetResult<()> {
        self.slot(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Skips `count` body bytes, leaving them zeroed. Used to reserve
    /// room that a later in-place edit fills in.
    pub fn advance(&mut self, count: usize) -> NetResult<()> {
        self.slot(count)?;
        Ok(())
    }

    /// Current write position within the body.
    pub fn body_pos(&self) -> usize {
        self.pos - HEADER_SIZE
    }

    /// Finishes writing and returns the uniquely-owned buffer.
    pub fn into_buffer(self) -> MessageBuffer {
        self.buffer
    }

    /// Finishes writing and wraps the buffer for sharing.
    pub fn into_shared(self) -> BufferRef {
        self.buffer.into_shared()
    }

    /// Access to the partially-written buffer, e.g. to re-stamp the ID.
    pub fn buffer_mut(&mut self) -> &mut MessageBuffer {
        &mut self.buffer
    }
}

/// In-place editor over an already-built message. Used to fix headers
/// after deferred ID assignment and to rewrite forwarded payload
/// prefixes. Positions are body-relative; scalars are native byte order.
pub struct MessageEditor<'a> {
    buffer: &'a mut MessageBuffer,
    pos: usize,
}

impl<'a> MessageEditor<'a> {
    pub fn new(buffer: &'a mut MessageBuffer) -> MessageEditor<'a> {
        MessageEditor {
            buffer,
            pos: HEADER_SIZE,
        }
    }

    pub fn seek(&mut self, body_pos: usize) {
        self.pos = HEADER_SIZE + body_pos;
    }

    fn slot(&mut self, count: usize) -> NetResult<&mut [u8]> {
        if self.buffer.len() - self.pos < count {
            return Err(NetError::Fatal(ErrorKind::BufferOverflow));
        }
        let start = self.pos;
        self.pos += count;
        Ok(&mut self.buffer.bytes_mut()[start..start + count])
    }

    pub fn write_u8(&mut self, value: u8) -> NetResult<()> {
        self.slot(1)?[0] = value;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> NetResult<()> {
        NativeEndian::write_u16(self.slot(2)?, value);
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> NetResult<()> {
        NativeEndian::write_u32(self.slot(4)?, value);
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> NetResult<()> {
        self.slot(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_roundtrip() {
        let mut writer = MessageWriter::with_capacity(7, 2 + 4 + 8 + 4 + 3);
        writer.write_u16(0xBEEF).unwrap();
        writer.write_u32(0xDEADBEEF).unwrap();
        writer.write_i64(-17).unwrap();
        writer.write_f32(1.5).unwrap();
        writer.write_bytes(&[1, 2, 3]).unwrap();
        assert!(writer.eof());

        let buffer = writer.into_buffer();
        let mut reader = MessageReader::over_body(&buffer, false);

        assert_eq!(reader.read_u16().unwrap(), 0xBEEF);
        assert_eq!(reader.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.read_i64().unwrap(), -17);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        let mut tail = [0u8; 3];
        reader.fetch(&mut tail).unwrap();
        assert_eq!(tail, [1, 2, 3]);
        assert_eq!(reader.unread(), 0);
    }

    #[test]
    fn test_writer_refuses_overflow() {
        let mut writer = MessageWriter::with_capacity(1, 3);
        writer.write_u16(1).unwrap();

        assert_eq!(
            writer.write_u16(2),
            Err(NetError::Fatal(ErrorKind::BufferOverflow))
        );
    }

    #[test]
    fn test_reader_reports_truncation() {
        let buffer = MessageBuffer::create(1, 2);
        let mut reader = MessageReader::over_body(&buffer, false);

        assert_eq!(
            reader.read_u32(),
            Err(NetError::Fatal(ErrorKind::Truncated))
        );
    }

    #[test]
    fn test_swap_on_read_inverts_writer_order() {
        let mut writer = MessageWriter::with_capacity(1, 6);
        writer.write_u16(0x1234).unwrap();
        writer.write_u32(0xAABBCCDD).unwrap();

        let buffer = writer.into_buffer();
        let mut reader = MessageReader::over_body(&buffer, true);

        assert_eq!(reader.read_u16().unwrap(), 0x3412);
        assert_eq!(reader.read_u32().unwrap(), 0xDDCCBBAA);
    }

    #[test]
    fn test_double_swap_restores_value() {
        let mut writer = MessageWriter::with_capacity(1, 8);
        writer.write_u64(0x0102030405060708).unwrap();
        let buffer = writer.into_buffer();

        let mut swapped = MessageReader::over_body(&buffer, true);
        let once = swapped.read_u64().unwrap();
        assert_eq!(once.swap_bytes(), 0x0102030405060708);
    }

    #[test]
    fn test_editor_rewrites_in_place() {
        let mut writer = MessageWriter::with_capacity(1, 6);
        writer.write_u16(0).unwrap();
        writer.write_u32(0).unwrap();
        let mut buffer = writer.into_buffer();

        let mut editor = MessageEditor::new(&mut buffer);
        editor.write_u16(77).unwrap();
        editor.seek(2);
        editor.write_u32(88).unwrap();

        let mut reader = MessageReader::over_body(&buffer, false);
        assert_eq!(reader.read_u16().unwrap(), 77);
        assert_eq!(reader.read_u32().unwrap(), 88);
    }
}
