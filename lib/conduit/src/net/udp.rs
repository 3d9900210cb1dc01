use crate::error::NetResult;
use crate::wire::buffer::BufferRef;
use mio::net::UdpSocket;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// A non-blocking UDP socket carrying framed datagrams. One datagram is
/// one message; sends are queued per destination address and drained on
/// write readiness.
pub struct UdpMessageSocket {
    socket: UdpSocket,
    send_queue: VecDeque<(SocketAddr, BufferRef)>,
}

impl UdpMessageSocket {
    pub fn bind(address: SocketAddr) -> std::io::Result<UdpMessageSocket> {
        Ok(UdpMessageSocket {
            socket: UdpSocket::bind(address)?,
            send_queue: VecDeque::new(),
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn local_address(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives one datagram if available, returning its length and the
    /// sender's address. `None` means nothing is queued in the kernel.
    pub fn read_datagram(&mut self, buffer: &mut [u8]) -> NetResult<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buffer) {
            Ok((count, sender)) => Ok(Some((count, sender))),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Appends a datagram to the send queue and returns the number of
    /// datagrams that were pending before the append (0 means write
    /// dispatching should be armed).
    pub fn queue_datagram(&mut self, destination: SocketAddr, message: BufferRef) -> usize {
        let prior = self.send_queue.len();
        self.send_queue.push_back((destination, message));
        prior
    }

    /// Sends queued datagrams until the kernel pushes back; returns the
    /// number still pending. A datagram the kernel rejects outright is
    /// dropped — datagram errors never terminate a session.
    pub fn write_to_socket(&mut self) -> NetResult<usize> {
        while let Some((destination, message)) = self.send_queue.front() {
            match self.socket.send_to(message.as_bytes(), *destination) {
                Ok(_) => {
                    self.send_queue.pop_front();
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.send_queue.pop_front();
                }
            }
        }
        Ok(self.send_queue.len())
    }

    pub fn has_egress(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Number of datagrams queued but not yet handed to the kernel.
    pub fn queued(&self) -> usize {
        self.send_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageBuffer;

    fn local(port_socket: &UdpMessageSocket) -> SocketAddr {
        port_socket.local_address().unwrap()
    }

    #[test]
    fn test_datagram_roundtrip() {
        let mut sender = UdpMessageSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut receiver = UdpMessageSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut message = MessageBuffer::create(9, 3);
        message.body_mut().copy_from_slice(&[5, 6, 7]);

        assert_eq!(sender.queue_datagram(local(&receiver), message.into_shared()), 0);
        assert_eq!(sender.write_to_socket().unwrap(), 0);

        let mut buffer = [0u8; 64];
        let mut received = None;
        for _ in 0..100 {
            if let Some((count, from)) = receiver.read_datagram(&mut buffer).unwrap() {
                received = Some((count, from));
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let (count, from) = received.expect("datagram never arrived");
        assert_eq!(count, 5);
        assert_eq!(from, local(&sender));
        assert_eq!(&buffer[2..5], &[5, 6, 7]);
    }

    #[test]
    fn test_empty_socket_reads_none() {
        let mut socket = UdpMessageSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut buffer = [0u8; 16];
        assert_eq!(socket.read_datagram(&mut buffer).unwrap(), None);
    }
}
