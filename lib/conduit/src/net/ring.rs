use std::io;

/// A fixed-capacity byte FIFO between a kernel socket and the message
/// parser. Data is appended at the tail and consumed from the head; the
/// readable region is always contiguous, and free space is made
/// contiguous by compacting in place before a write.
pub struct RingBuffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// The number of buffered, unconsumed bytes.
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Remaining free capacity.
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.len()
    }

    /// Slice containing buffered data.
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Consumes `count` bytes from the head.
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.head += count;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Slice containing free capacity to be written. Compacts buffered
    /// data to the front when the tail has hit the end.
    pub fn write_slice(&mut self) -> &mut [u8] {
        if self.tail == self.data.len() && self.head > 0 {
            self.data.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
        &mut self.data[self.tail..]
    }

    /// Marks `count` bytes of the write slice as filled.
    pub fn advance(&mut self, count: usize) {
        debug_assert!(count <= self.data.len() - self.tail);
        self.tail += count;
    }

    /// Reads from the supplied reader until it would block, the buffer
    /// is full, or end-of-stream. Returns the bytes ingested and whether
    /// end-of-stream was observed.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<(usize, bool)> {
        let mut total = 0;
        loop {
            if self.free_capacity() == 0 {
                return Ok((total, false));
            }
            match reader.read(self.write_slice()) {
                Ok(0) => return Ok((total, true)),
                Ok(count) => {
                    self.advance(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((total, false))
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockStream {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        eof_at_end: bool,
    }

    impl io::Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                if self.eof_at_end {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    #[test]
    fn test_ingress_until_would_block() {
        let data: Vec<u8> = (0..1000).map(|i| i as u8).collect();
        let mut stream = MockStream {
            data: data.clone(),
            cursor: 0,
            chunk: 117,
            eof_at_end: false,
        };

        let mut ring = RingBuffer::new(4096);
        let (count, eof) = ring.ingress(&mut stream).unwrap();

        assert_eq!(count, 1000);
        assert!(!eof);
        assert_eq!(ring.read_slice(), &data[..]);
    }

    #[test]
    fn test_ingress_reports_eof() {
        let mut stream = MockStream {
            data: vec![1, 2, 3],
            cursor: 0,
            chunk: 64,
            eof_at_end: true,
        };

        let mut ring = RingBuffer::new(64);
        let (count, eof) = ring.ingress(&mut stream).unwrap();

        assert_eq!(count, 3);
        assert!(eof);
    }

    #[test]
    fn test_ingress_stops_when_full() {
        let mut stream = MockStream {
            data: vec![0xAA; 100],
            cursor: 0,
            chunk: 64,
            eof_at_end: false,
        };

        let mut ring = RingBuffer::new(32);
        let (count, eof) = ring.ingress(&mut stream).unwrap();

        assert_eq!(count, 32);
        assert!(!eof);
        assert_eq!(ring.free_capacity(), 0);
    }

    #[test]
    fn test_consume_and_compact() {
        let mut ring = RingBuffer::new(8);
        ring.write_slice()[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        ring.advance(8);

        ring.consume(6);
        assert_eq!(ring.read_slice(), &[7, 8]);

        // Tail is at capacity; the next write must compact first.
        let free = ring.write_slice();
        assert_eq!(free.len(), 6);
        free[..2].copy_from_slice(&[9, 10]);
        ring.advance(2);

        assert_eq!(ring.read_slice(), &[7, 8, 9, 10]);
    }

    #[test]
    fn test_full_consume_resets_offsets() {
        let mut ring = RingBuffer::new(4);
        ring.write_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        ring.advance(4);

        ring.consume(4);
        assert!(ring.is_empty());
        assert_eq!(ring.write_slice().len(), 4);
    }
}
