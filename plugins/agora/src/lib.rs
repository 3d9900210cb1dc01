//! Agora, the real-time audio chat plug-in protocol.
//!
//! Audio packets travel unreliably when both ends have UDP
//! connectivity and fall back to the TCP stream otherwise; per-peer
//! sequence numbers are the only ordering authority. The codec and the
//! playback device are external collaborators reached through the
//! traits in this crate, so the plug-in itself carries no audio
//! dependency.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod client;
pub mod jitter;
pub mod server;

pub const PROTOCOL_NAME: &str = "Agora";
pub const PROTOCOL_VERSION: u32 = 1 << 16;

/// Audio packet sequence number, wrapping.
pub type Sequence = u16;

// Client-originated message indices.
pub const CONNECT_REQUEST: u16 = 0;
pub const AUDIO_PACKET_REQUEST: u16 = 1;
pub const NUM_CLIENT_MESSAGES: u16 = 2;

// Server-originated message indices.
pub const CONNECT_NOTIFICATION: u16 = 0;
pub const AUDIO_PACKET_REPLY: u16 = 1;
pub const NUM_SERVER_MESSAGES: u16 = 2;

/// ConnectRequest: sampleRate u32, packetFrames u32.
pub const CONNECT_REQUEST_SIZE: usize = 4 + 4;
/// ConnectNotification: clientId u16, sampleRate u32, packetFrames u32.
pub const CONNECT_NOTIFICATION_SIZE: usize = 2 + 4 + 4;
/// Audio packet prefix: destination/source u16, sequence u16, length
/// u16; the encoded packet follows.
pub const AUDIO_PACKET_PREFIX: usize = 2 + 2 + 2;

/// Decoder side of the external audio codec.
pub trait AudioDecoder: Send {
    /// Decodes one packet into interleaved 16-bit samples; returns the
    /// number of frames produced.
    fn decode(&mut self, packet: &[u8], output: &mut [i16]) -> usize;

    /// Produces one packet worth of concealed audio for a lost packet.
    fn conceal(&mut self, output: &mut [i16]) -> usize;
}

/// Playback device the decoded audio is handed to.
pub trait AudioSink: Send {
    /// Number of packets the device currently holds queued.
    fn queued_packets(&self) -> usize;

    /// Queues decoded frames for playback.
    fn play(&mut self, samples: &[i16]);

    /// Stops the output during long packet droughts.
    fn pause(&mut self);

    /// Restarts the output when packets flow again.
    fn resume(&mut self);
}

/// Creates the decoder/sink pair for one remote peer, given the peer's
/// sample rate and packet size in frames.
pub type AudioBackendFactory =
    Box<dyn FnMut(u32, u32) -> (Box<dyn AudioDecoder>, Box<dyn AudioSink>) + Send>;
