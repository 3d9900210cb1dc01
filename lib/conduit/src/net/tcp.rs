use crate::error::{ErrorKind, NetError, NetResult};
use crate::net::ring::RingBuffer;
use crate::wire::buffer::BufferRef;
use crate::wire::cursor::WireRead;
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

const READ_BUF_SIZE: usize = 65536;

/// A non-blocking TCP socket carrying framed messages.
///
/// The receive path drains the kernel buffer into a ring and exposes
/// sequential scalar reads over it; the send path is a queue of shared
/// message buffers drained on write readiness. `queue_message` returns
/// the number of bytes that were already pending so the caller can arm
/// write dispatching when the socket was idle, and `write_to_socket`
/// returns the remainder so the caller can disarm it again.
pub struct TcpMessageSocket {
    stream: TcpStream,
    read_buffer: RingBuffer,
    send_queue: VecDeque<BufferRef>,
    send_offset: usize,
    unsent: usize,
    eof: bool,
    swap_on_read: bool,
}

impl TcpMessageSocket {
    /// Wraps an accepted non-blocking stream.
    pub fn from_stream(stream: TcpStream) -> TcpMessageSocket {
        TcpMessageSocket {
            stream,
            read_buffer: RingBuffer::new(READ_BUF_SIZE),
            send_queue: VecDeque::new(),
            send_offset: 0,
            unsent: 0,
            eof: false,
            swap_on_read: false,
        }
    }

    /// Connects to the given address and switches the stream to
    /// non-blocking mode.
    pub fn connect(address: SocketAddr) -> std::io::Result<TcpMessageSocket> {
        let stream = std::net::TcpStream::connect(address)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(TcpMessageSocket::from_stream(TcpStream::from_std(stream)))
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer_address(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// True after the peer's orderly close has been observed.
    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn set_swap_on_read(&mut self, swap_on_read: bool) {
        self.swap_on_read = swap_on_read;
    }

    /// Drains the kernel receive buffer into the ring and returns the
    /// number of buffered, unconsumed bytes. Never blocks.
    pub fn read_from_socket(&mut self) -> NetResult<usize> {
        let (_, eof) = self.read_buffer.ingress(&mut self.stream)?;
        if eof {
            self.eof = true;
        }
        Ok(self.read_buffer.len())
    }

    /// Appends a message to the send queue and returns the number of
    /// bytes that were pending before the append (0 means the socket was
    /// idle and write dispatching should be armed).
    pub fn queue_message(&mut self, message: BufferRef) -> usize {
        let prior = self.unsent;
        self.unsent += message.len();
        self.send_queue.push_back(message);
        prior
    }

    /// Writes as much of the send queue as the kernel accepts and
    /// returns the number of bytes still unsent.
    pub fn write_to_socket(&mut self) -> NetResult<usize> {
        loop {
            let (written, finished) = {
                let front = match self.send_queue.front() {
                    Some(front) => front,
                    None => break,
                };
                let bytes = &front.as_bytes()[self.send_offset..];
                match self.stream.write(bytes) {
                    Ok(0) => return Err(NetError::Fatal(ErrorKind::WriteZero)),
                    Ok(count) => (count, count == bytes.len()),
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            };

            self.unsent -= written;
            if finished {
                self.send_queue.pop_front();
                self.send_offset = 0;
            } else {
                self.send_offset += written;
            }
        }
        Ok(self.unsent)
    }

    /// True if there is queued outgoing data.
    pub fn has_egress(&self) -> bool {
        self.unsent > 0
    }

    /// Number of bytes queued but not yet handed to the kernel.
    pub fn unsent(&self) -> usize {
        self.unsent
    }
}

impl WireRead for TcpMessageSocket {
    fn unread(&self) -> usize {
        self.read_buffer.len()
    }

    fn swap_on_read(&self) -> bool {
        self.swap_on_read
    }

    fn fetch(&mut self, out: &mut [u8]) -> NetResult<()> {
        if self.read_buffer.len() < out.len() {
            return Err(NetError::Wait);
        }
        out.copy_from_slice(&self.read_buffer.read_slice()[..out.len()]);
        self.read_buffer.consume(out.len());
        Ok(())
    }

    fn skip(&mut self, count: usize) -> NetResult<()> {
        if self.read_buffer.len() < count {
            return Err(NetError::Wait);
        }
        self.read_buffer.consume(count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageBuffer;
    use std::io::Read;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};

    fn socket_pair() -> (TcpMessageSocket, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let socket = TcpMessageSocket::connect(address).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (socket, peer)
    }

    #[test]
    fn test_queue_message_reports_prior_unsent() {
        let (mut socket, _peer) = socket_pair();

        let first = MessageBuffer::create(1, 4).into_shared();
        let second = MessageBuffer::create(2, 4).into_shared();

        assert_eq!(socket.queue_message(first), 0);
        assert_eq!(socket.queue_message(second), 6);
        assert_eq!(socket.unsent(), 12);
    }

    #[test]
    fn test_write_drains_queue() {
        let (mut socket, mut peer) = socket_pair();

        let mut message = MessageBuffer::create(5, 3);
        message.body_mut().copy_from_slice(&[10, 20, 30]);
        socket.queue_message(message.into_shared());

        assert_eq!(socket.write_to_socket().unwrap(), 0);
        assert!(!socket.has_egress());

        let mut received = [0u8; 5];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(&received[2..], &[10, 20, 30]);
    }

    #[test]
    fn test_read_buffers_peer_bytes_and_eof() {
        let (mut socket, mut peer) = socket_pair();

        peer.write_all(&[1, 2, 3, 4]).unwrap();
        drop(peer);

        // Poll until the kernel has delivered both the data and the FIN.
        let mut unread = 0;
        for _ in 0..100 {
            socket.read_from_socket().unwrap();
            unread = socket.unread();
            if socket.eof() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert_eq!(unread, 4);
        assert!(socket.eof());
        assert_eq!(socket.read_u16().unwrap(), u16::from_ne_bytes([1, 2]));
    }

    #[test]
    fn test_fetch_underrun_waits() {
        let (mut socket, _peer) = socket_pair();
        assert_eq!(socket.read_u32(), Err(NetError::Wait));
    }
}
