use crate::MessageId;
use byteorder::{ByteOrder, NativeEndian};
use std::rc::Rc;

/// Size of the message header: the message ID in wire form.
pub const HEADER_SIZE: usize = 2;

/// A message as a single contiguous allocation: a two-byte header
/// holding the message ID in native byte order, followed by the body.
/// The length is fixed at creation; the ID may be re-stamped in place
/// while the buffer is still uniquely held.
///
/// Buffers are shared between holders (send queues, readers, the
/// front-end pipe) as [`BufferRef`]s; the allocation is freed when the
/// last reference drops. Reference counting is single-threaded; the only
/// thread crossing is the back-end→front-end pipe, which transfers the
/// unshared buffer by value.
pub struct MessageBuffer {
    data: Box<[u8]>,
}

/// A shared reference to a message buffer.
pub type BufferRef = Rc<MessageBuffer>;

impl MessageBuffer {
    /// Allocates a buffer for a message with the given ID and body
    /// capacity. The body is zero-initialized.
    pub fn create(message_id: MessageId, body_size: usize) -> MessageBuffer {
        let mut data = vec![0u8; HEADER_SIZE + body_size].into_boxed_slice();
        NativeEndian::write_u16(&mut data[..HEADER_SIZE], message_id);
        MessageBuffer { data }
    }

    /// The message ID stored in the header, in native byte order.
    pub fn message_id(&self) -> MessageId {
        NativeEndian::read_u16(&self.data[..HEADER_SIZE])
    }

    /// Re-stamps the message ID in place. Used by the server to fix up
    /// forwarded messages and by plug-ins whose message base was not yet
    /// known when the buffer was built.
    pub fn set_message_id(&mut self, message_id: MessageId) {
        NativeEndian::write_u16(&mut self.data[..HEADER_SIZE], message_id);
    }

    /// Total wire length: header plus body.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Body length.
    pub fn body_len(&self) -> usize {
        self.data.len() - HEADER_SIZE
    }

    /// The whole message in wire form.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn body(&self) -> &[u8] {
        &self.data[HEADER_SIZE..]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data[HEADER_SIZE..]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Wraps the buffer for sharing between holders.
    pub fn into_shared(self) -> BufferRef {
        Rc::new(self)
    }

    /// Builds a buffer directly from received wire bytes (header
    /// included), e.g. a UDP datagram about to be forwarded.
    pub fn from_wire_bytes(bytes: &[u8]) -> MessageBuffer {
        debug_assert!(bytes.len() >= HEADER_SIZE);
        MessageBuffer {
            data: bytes.to_vec().into_boxed_slice(),
        }
    }
}

/// Number of live references to a shared buffer. Exposed for leak tests.
pub fn ref_count(buffer: &BufferRef) -> usize {
    Rc::strong_count(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_stamps_id_and_zeroes_body() {
        let buffer = MessageBuffer::create(42, 5);

        assert_eq!(buffer.message_id(), 42);
        assert_eq!(buffer.len(), HEADER_SIZE + 5);
        assert_eq!(buffer.body(), &[0u8; 5]);
    }

    #[test]
    fn test_restamp_changes_only_header() {
        let mut buffer = MessageBuffer::create(1, 3);
        buffer.body_mut().copy_from_slice(&[9, 8, 7]);

        buffer.set_message_id(700);

        assert_eq!(buffer.message_id(), 700);
        assert_eq!(buffer.body(), &[9, 8, 7]);
    }

    #[test]
    fn test_from_wire_bytes_roundtrip() {
        let original = MessageBuffer::create(3, 4);
        let copy = MessageBuffer::from_wire_bytes(original.as_bytes());

        assert_eq!(copy.message_id(), 3);
        assert_eq!(copy.as_bytes(), original.as_bytes());
    }

    #[test]
    fn test_ref_count_lifecycle() {
        let shared = MessageBuffer::create(1, 0).into_shared();
        assert_eq!(ref_count(&shared), 1);

        let queue_ref = shared.clone();
        let pipe_ref = shared.clone();
        assert_eq!(ref_count(&shared), 3);

        drop(queue_ref);
        drop(pipe_ref);
        assert_eq!(ref_count(&shared), 1);
    }
}
