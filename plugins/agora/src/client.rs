//! Client half of the audio chat protocol: one decode/playback worker
//! per remote peer, fed through a jitter buffer under a mutex and woken
//! through a condition variable. Workers never touch socket state; all
//! sending goes through the client's thread-safe queue primitives.

use crate::jitter::{
    ArrivalFilter, Conditioning, Enqueue, JitterBuffer, SourceLatencyFilter, DEFAULT_NUM_SLOTS,
};
use crate::*;
use conduit::client::{ClientCore, ClientHandle};
use conduit::error::{ErrorKind, NetError, NetResult};
use conduit::plugin::{ClientPlugin, Continuation, HandlerAction};
use conduit::wire::cursor::{MessageReader, MessageWriter, WireRead};
use conduit::wire::MessageBuffer;
use conduit::{ClientId, MessageId};
use hashbrown::HashMap;
use keel::logging::{self, Logger};
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Consecutive concealed packets before the output is parked.
const CONCEALMENT_LIMIT: usize = 20;
/// Packets the playback device should keep queued.
const MIN_QUEUED_PACKETS: usize = 1;

enum WorkerCommand {
    Run,
    Exit,
}

struct PeerState {
    jitter: JitterBuffer,
    arrival: ArrivalFilter,
    command: WorkerCommand,
    parked: bool,
    target_latency_us: i64,
}

struct PeerShared {
    state: Mutex<PeerState>,
    wakeup: Condvar,
}

struct RemotePeer {
    shared: Arc<PeerShared>,
    worker: Option<JoinHandle<()>>,
}

/// Continuation for an audio packet arriving over TCP (the fallback
/// path for peers without UDP connectivity).
struct AudioPacketCont {
    source: ClientId,
    sequence: Sequence,
    remaining: usize,
    payload: Vec<u8>,
}

/// Thread-safe audio packet source for a capture/encoder thread: owns
/// its own sequence counter and sends through the sanctioned
/// cross-thread queue.
pub struct AudioPacketSender {
    client_base: MessageId,
    sequence: Sequence,
    handle: ClientHandle,
}

impl AudioPacketSender {
    /// Sends one encoded packet; destination 0 broadcasts to every
    /// other participant.
    pub fn send(&mut self, destination: ClientId, payload: &[u8], use_udp: bool) {
        let message = build_audio_packet(
            self.client_base + AUDIO_PACKET_REQUEST,
            destination,
            self.sequence,
            payload,
        );
        self.sequence = self.sequence.wrapping_add(1);
        if use_udp {
            self.handle.queue_server_udp_message(message);
        } else {
            self.handle.queue_server_message(message);
        }
    }
}

fn build_audio_packet(
    message_id: MessageId,
    destination: ClientId,
    sequence: Sequence,
    payload: &[u8],
) -> MessageBuffer {
    let mut writer =
        MessageWriter::with_capacity(message_id, AUDIO_PACKET_PREFIX + payload.len());
    writer
        .write_u16(destination)
        .and_then(|_| writer.write_u16(sequence))
        .and_then(|_| writer.write_u16(payload.len() as u16))
        .and_then(|_| writer.write_bytes(payload))
        .expect("Audio packet size mismatch");
    writer.into_buffer()
}

pub struct AgoraClient {
    log: Logger,
    client_base: MessageId,
    server_base: MessageId,
    sample_rate: u32,
    packet_frames: u32,
    jitter_slots: usize,
    factory: AudioBackendFactory,
    peers: HashMap<ClientId, RemotePeer>,
    capture_sequence: Sequence,
}

impl AgoraClient {
    pub fn new(
        log: &Logger,
        sample_rate: u32,
        packet_frames: u32,
        factory: AudioBackendFactory,
    ) -> AgoraClient {
        AgoraClient {
            log: log.new(logging::o!("plugin" => PROTOCOL_NAME)),
            client_base: 0,
            server_base: 0,
            sample_rate,
            packet_frames,
            jitter_slots: DEFAULT_NUM_SLOTS,
            factory,
            peers: HashMap::new(),
            capture_sequence: 0,
        }
    }

    /// Adjusts the jitter window used for peers joining from now on.
    pub fn set_jitter_slots(&mut self, slots: usize) {
        self.jitter_slots = slots.max(1);
    }

    /// Number of remote peers with live playback workers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Builds a packet source for a capture thread.
    pub fn packet_sender(&self, handle: ClientHandle) -> AudioPacketSender {
        AudioPacketSender {
            client_base: self.client_base,
            sequence: 0,
            handle,
        }
    }

    /// Sends one encoded packet from the back-end thread.
    pub fn send_audio_packet(
        &mut self,
        core: &mut ClientCore,
        destination: ClientId,
        payload: &[u8],
    ) {
        let message = build_audio_packet(
            self.client_base + AUDIO_PACKET_REQUEST,
            destination,
            self.capture_sequence,
            payload,
        );
        self.capture_sequence = self.capture_sequence.wrapping_add(1);
        if core.have_udp() {
            core.queue_server_udp_message(message.into_shared());
        } else {
            core.queue_server_message(message.into_shared());
        }
    }

    fn spawn_peer(&mut self, client_id: ClientId, sample_rate: u32, packet_frames: u32) {
        if self.peers.contains_key(&client_id) {
            return;
        }

        let period_us = packet_frames as i64 * 1_000_000 / sample_rate.max(1) as i64;
        let target_latency_us = self.jitter_slots as i64 * period_us / 2;

        let shared = Arc::new(PeerShared {
            state: Mutex::new(PeerState {
                jitter: JitterBuffer::new(self.jitter_slots),
                arrival: ArrivalFilter::new(period_us),
                command: WorkerCommand::Run,
                // Parked until the first packet arrives.
                parked: true,
                target_latency_us,
            }),
            wakeup: Condvar::new(),
        });

        let (decoder, sink) = (self.factory)(sample_rate, packet_frames);
        let worker_shared = shared.clone();
        let frames = packet_frames as usize;
        let worker = std::thread::spawn(move || {
            run_worker(worker_shared, decoder, sink, frames);
        });

        logging::info!(self.log, "remote audio peer added";
                       "client_id" => client_id,
                       "sample_rate" => sample_rate,
                       "packet_frames" => packet_frames);
        self.peers.insert(
            client_id,
            RemotePeer {
                shared,
                worker: Some(worker),
            },
        );
    }

    fn stop_peer(&mut self, client_id: ClientId) {
        if let Some(mut peer) = self.peers.remove(&client_id) {
            {
                let mut state = peer.shared.state.lock().unwrap();
                state.command = WorkerCommand::Exit;
                state.parked = false;
                peer.shared.wakeup.notify_all();
            }
            if let Some(worker) = peer.worker.take() {
                let _ = worker.join();
            }
            logging::info!(self.log, "remote audio peer removed"; "client_id" => client_id);
        }
    }

    fn enqueue_packet(&mut self, source: ClientId, sequence: Sequence, payload: Vec<u8>) {
        let peer = match self.peers.get(&source) {
            Some(peer) => peer,
            None => return,
        };
        let arrival = keel::time::monotonic_micros();

        let mut state = peer.shared.state.lock().unwrap();
        if !state.jitter.is_initialized() {
            state.jitter.init(sequence, payload);
            state.arrival.init(arrival);
        } else {
            match state.jitter.enqueue(sequence, payload) {
                Enqueue::Stored { .. } => {
                    let slots_ahead =
                        sequence.wrapping_sub(state.jitter.head_sequence()) as i16 as i64;
                    state.arrival.observe(slots_ahead, arrival);
                }
                Enqueue::Stale => return,
            }
        }
        state.parked = false;
        peer.shared.wakeup.notify_one();
    }

    fn handle_connect_notification(&mut self, core: &mut ClientCore) -> NetResult<HandlerAction> {
        let (client_id, sample_rate, packet_frames) = {
            let socket = core.socket_mut();
            (socket.read_u16()?, socket.read_u32()?, socket.read_u32()?)
        };
        self.spawn_peer(client_id, sample_rate, packet_frames);
        Ok(HandlerAction::Done)
    }

    fn handle_audio_packet_tcp(
        &mut self,
        core: &mut ClientCore,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        let mut cont = match cont {
            Some(boxed) => *boxed
                .downcast::<AudioPacketCont>()
                .map_err(|_| NetError::Fatal(ErrorKind::TypeMismatch))?,
            None => {
                let (source, sequence, length) = {
                    let socket = core.socket_mut();
                    (socket.read_u16()?, socket.read_u16()?, socket.read_u16()?)
                };
                AudioPacketCont {
                    source,
                    sequence,
                    remaining: length as usize,
                    payload: Vec::with_capacity(length as usize),
                }
            }
        };

        loop {
            let socket = core.socket_mut();
            let chunk = socket.unread().min(cont.remaining);
            if chunk == 0 {
                break;
            }
            let start = cont.payload.len();
            cont.payload.resize(start + chunk, 0);
            socket.fetch(&mut cont.payload[start..])?;
            cont.remaining -= chunk;
        }

        if cont.remaining > 0 {
            return Ok(HandlerAction::NeedMore {
                min_unread: 1,
                cont: Box::new(cont),
            });
        }

        let AudioPacketCont {
            source,
            sequence,
            payload,
            ..
        } = cont;
        self.enqueue_packet(source, sequence, payload);
        Ok(HandlerAction::Done)
    }
}

fn run_worker(
    shared: Arc<PeerShared>,
    mut decoder: Box<dyn AudioDecoder>,
    mut sink: Box<dyn AudioSink>,
    packet_frames: usize,
) {
    let mut latency_filter = SourceLatencyFilter::new(MIN_QUEUED_PACKETS);
    let mut samples = vec![0i16; packet_frames];
    let mut consecutive_empty = 0usize;
    let mut paused = false;

    loop {
        // Wait until the head packet's conditioned playback time.
        let packet = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let WorkerCommand::Exit = state.command {
                    return;
                }
                if state.parked {
                    state = shared.wakeup.wait(state).unwrap();
                    continue;
                }
                let now = keel::time::monotonic_micros();
                let due = state.arrival.head_arrival_us() + state.target_latency_us;
                if now >= due {
                    let packet = state.jitter.dequeue();
                    state.arrival.advance();
                    break packet;
                }
                let (guard, _) = shared
                    .wakeup
                    .wait_timeout(state, Duration::from_micros((due - now) as u64))
                    .unwrap();
                state = guard;
            }
        };

        // Decode and play outside the lock.
        match packet {
            Some(bytes) => {
                if paused {
                    sink.resume();
                    paused = false;
                }
                consecutive_empty = 0;
                let frames = decoder.decode(&bytes, &mut samples);

                let conditioning = latency_filter.observe(sink.queued_packets());
                match conditioning {
                    Conditioning::Compress => {
                        // Shorten the frame to drain the playback queue.
                        let keep = frames.saturating_sub(frames / 8);
                        sink.play(&samples[..keep]);
                        latency_filter.corrected(conditioning);
                    }
                    Conditioning::InjectSilence => {
                        let silence = vec![0i16; frames];
                        sink.play(&silence);
                        sink.play(&samples[..frames]);
                        latency_filter.corrected(conditioning);
                    }
                    Conditioning::None => sink.play(&samples[..frames]),
                }
            }
            None => {
                consecutive_empty += 1;
                if consecutive_empty >= CONCEALMENT_LIMIT {
                    if !paused {
                        sink.pause();
                        paused = true;
                    }
                    let mut state = shared.state.lock().unwrap();
                    if !state.jitter.has_pending() {
                        state.parked = true;
                    }
                } else {
                    let frames = decoder.conceal(&mut samples);
                    sink.play(&samples[..frames]);
                }
            }
        }
    }
}

impl Drop for AgoraClient {
    fn drop(&mut self) {
        let peers: Vec<ClientId> = self.peers.keys().copied().collect();
        for client_id in peers {
            self.stop_peer(client_id);
        }
    }
}

impl ClientPlugin for AgoraClient {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    fn num_client_messages(&self) -> u16 {
        NUM_CLIENT_MESSAGES
    }

    fn num_server_messages(&self) -> u16 {
        NUM_SERVER_MESSAGES
    }

    fn set_message_bases(&mut self, client_base: MessageId, server_base: MessageId) {
        self.client_base = client_base;
        self.server_base = server_base;
    }

    fn start(&mut self, core: &mut ClientCore) {
        let mut request = MessageWriter::with_capacity(
            self.client_base + CONNECT_REQUEST,
            CONNECT_REQUEST_SIZE,
        );
        request
            .write_u32(self.sample_rate)
            .and_then(|_| request.write_u32(self.packet_frames))
            .expect("Request size mismatch");
        core.queue_server_message(request.into_shared());
    }

    fn remote_client_connected(&mut self, _core: &mut ClientCore, _client_id: ClientId) {
        // A peer joins the audio session when its encoder parameters
        // arrive in a ConnectNotification.
    }

    fn remote_client_disconnected(&mut self, _core: &mut ClientCore, client_id: ClientId) {
        self.stop_peer(client_id);
    }

    fn tcp_min_unread(&self, message_index: u16) -> usize {
        match message_index {
            CONNECT_NOTIFICATION => CONNECT_NOTIFICATION_SIZE,
            AUDIO_PACKET_REPLY => AUDIO_PACKET_PREFIX,
            _ => 0,
        }
    }

    fn handle_tcp_message(
        &mut self,
        core: &mut ClientCore,
        message_index: u16,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        match message_index {
            CONNECT_NOTIFICATION => self.handle_connect_notification(core),
            AUDIO_PACKET_REPLY => self.handle_audio_packet_tcp(core, cont),
            _ => Err(NetError::Fatal(ErrorKind::UnknownMessage(
                self.server_base + message_index,
            ))),
        }
    }

    fn handle_udp_message(
        &mut self,
        _core: &mut ClientCore,
        message_index: u16,
        reader: &mut MessageReader,
    ) -> NetResult<()> {
        if message_index != AUDIO_PACKET_REPLY {
            return Err(NetError::Fatal(ErrorKind::UnknownMessage(
                self.server_base + message_index,
            )));
        }
        if reader.unread() < AUDIO_PACKET_PREFIX {
            return Err(NetError::Fatal(ErrorKind::Truncated));
        }
        let source = reader.read_u16()?;
        let sequence = reader.read_u16()?;
        let length = reader.read_u16()? as usize;
        if reader.unread() != length {
            return Err(NetError::Fatal(ErrorKind::Truncated));
        }
        let payload = reader.remaining().to_vec();
        self.enqueue_packet(source, sequence, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullDecoder;
    impl AudioDecoder for NullDecoder {
        fn decode(&mut self, _packet: &[u8], output: &mut [i16]) -> usize {
            output.len()
        }
        fn conceal(&mut self, output: &mut [i16]) -> usize {
            output.len()
        }
    }

    struct CountingSink {
        played: Arc<AtomicUsize>,
    }
    impl AudioSink for CountingSink {
        fn queued_packets(&self) -> usize {
            MIN_QUEUED_PACKETS
        }
        fn play(&mut self, samples: &[i16]) {
            self.played.fetch_add(samples.len(), Ordering::SeqCst);
        }
        fn pause(&mut self) {}
        fn resume(&mut self) {}
    }

    #[test]
    fn test_peer_worker_plays_enqueued_packets() {
        let log = keel::logging::null();
        let played = Arc::new(AtomicUsize::new(0));
        let played_probe = played.clone();

        let factory: AudioBackendFactory = Box::new(move |_rate, _frames| {
            (
                Box::new(NullDecoder) as Box<dyn AudioDecoder>,
                Box::new(CountingSink {
                    played: played_probe.clone(),
                }) as Box<dyn AudioSink>,
            )
        });

        // Tiny packets at a high rate so the test finishes quickly.
        let mut plugin = AgoraClient::new(&log, 48000, 48, factory);
        plugin.spawn_peer(9, 48000, 48);

        for sequence in 0..5u16 {
            plugin.enqueue_packet(9, sequence, vec![0u8; 4]);
            std::thread::sleep(Duration::from_millis(2));
        }

        // Wait for the worker to drain the ring.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while played.load(Ordering::SeqCst) < 5 * 48 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        plugin.stop_peer(9);

        assert!(played.load(Ordering::SeqCst) >= 5 * 48);
    }

    #[test]
    fn test_audio_packet_layout() {
        let message = build_audio_packet(30, 0, 17, &[1, 2, 3]);
        assert_eq!(message.message_id(), 30);

        let mut reader = MessageReader::over_body(&message, false);
        assert_eq!(reader.read_u16().unwrap(), 0);
        assert_eq!(reader.read_u16().unwrap(), 17);
        assert_eq!(reader.read_u16().unwrap(), 3);
        assert_eq!(reader.remaining(), &[1, 2, 3]);
    }
}
