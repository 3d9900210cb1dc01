//! Non-blocking message transport: the receive ring, the TCP message
//! socket and the UDP datagram socket.

pub mod ring;
pub mod tcp;
pub mod udp;

pub use ring::RingBuffer;
pub use tcp::TcpMessageSocket;
pub use udp::UdpMessageSocket;
