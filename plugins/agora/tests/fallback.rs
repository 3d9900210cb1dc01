//! Audio routing over a loopback session where neither client has UDP
//! connectivity: packets must reach the peer through the TCP fallback
//! with the header re-stamped to carry the source client.

use agora::client::AgoraClient;
use agora::server::AgoraServer;
use agora::{AudioBackendFactory, AudioDecoder, AudioSink};
use conduit::client::{Client, ClientConfig};
use conduit::dispatch::Dispatcher;
use conduit::plugin::ServerPlugin;
use conduit::server::{Server, ServerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

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
        1
    }
    fn play(&mut self, samples: &[i16]) {
        self.played.fetch_add(samples.len(), Ordering::SeqCst);
    }
    fn pause(&mut self) {}
    fn resume(&mut self) {}
}

fn counting_factory(played: Arc<AtomicUsize>) -> AudioBackendFactory {
    Box::new(move |_rate, _frames| {
        (
            Box::new(NullDecoder) as Box<dyn AudioDecoder>,
            Box::new(CountingSink {
                played: played.clone(),
            }) as Box<dyn AudioSink>,
        )
    })
}

fn start_server() -> (u16, conduit::dispatch::Stopper, std::thread::JoinHandle<Server>) {
    let log = keel::logging::null();
    let mut server = Server::new(
        ServerConfig {
            name: "testhub".to_owned(),
            port: 0,
            password: String::new(),
        },
        &log,
    )
    .expect("cannot bind loopback server");
    let port = server.core().local_port();

    let factory_log = log.clone();
    server.registry_mut().add_factory(move |name, _version| {
        if name == agora::PROTOCOL_NAME {
            Some(Box::new(AgoraServer::new(&factory_log)) as Box<dyn ServerPlugin>)
        } else {
            None
        }
    });

    let mut dispatcher: Dispatcher<Server> = Dispatcher::new().unwrap();
    let stopper = dispatcher.stopper();
    let handle = std::thread::spawn(move || {
        server.attach(&mut dispatcher);
        dispatcher.run(&mut server);
        server
    });
    (port, stopper, handle)
}

fn make_session(port: u16, name: &str, played: Arc<AtomicUsize>) -> (Client, Dispatcher<Client>) {
    let log = keel::logging::null();
    let plugin = AgoraClient::new(&log, 48000, 480, counting_factory(played));

    let mut client = Client::new(
        ClientConfig {
            server_host: "127.0.0.1".to_owned(),
            server_port: port,
            session_password: String::new(),
            client_name: name.to_owned(),
        },
        &log,
    )
    .expect("cannot connect");
    client.add_plugin(Box::new(plugin));

    let dispatcher: Dispatcher<Client> = Dispatcher::new().unwrap();
    (client, dispatcher)
}

#[test]
fn test_broadcast_packets_fall_back_to_tcp() {
    let (port, stopper, handle) = start_server();

    let sender_played = Arc::new(AtomicUsize::new(0));
    let receiver_played = Arc::new(AtomicUsize::new(0));

    let (mut sender, mut sender_dispatcher) = make_session(port, "sender", sender_played);
    let (mut receiver, mut receiver_dispatcher) =
        make_session(port, "receiver", receiver_played.clone());

    sender.attach(&mut sender_dispatcher);
    receiver.attach(&mut receiver_dispatcher);

    // Wait until both ends know each other's encoder parameters.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        sender_dispatcher.run_once(&mut sender, Some(Duration::from_millis(10)));
        receiver_dispatcher.run_once(&mut receiver, Some(Duration::from_millis(10)));

        let sender_ready = sender
            .with_plugin::<AgoraClient, _>(agora::PROTOCOL_NAME, |plugin, _| plugin.peer_count())
            .unwrap_or(0)
            == 1;
        let receiver_ready = receiver
            .with_plugin::<AgoraClient, _>(agora::PROTOCOL_NAME, |plugin, _| plugin.peer_count())
            .unwrap_or(0)
            == 1;
        if sender_ready && receiver_ready {
            break;
        }
        assert!(Instant::now() < deadline, "audio peers never paired");
    }

    // Neither client completed the UDP handshake, so every packet must
    // arrive through the stream socket.
    assert!(!sender.core().have_udp());

    for _ in 0..10 {
        sender
            .with_plugin::<AgoraClient, _>(agora::PROTOCOL_NAME, |plugin, core| {
                plugin.send_audio_packet(core, 0, &[0xAB; 40]);
            })
            .unwrap();
        sender.flush_pending_masks(&mut sender_dispatcher);

        sender_dispatcher.run_once(&mut sender, Some(Duration::from_millis(5)));
        receiver_dispatcher.run_once(&mut receiver, Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(10));
    }

    // The receiver's playback worker wakes on its own clock; give it a
    // moment to drain the jitter ring.
    let deadline = Instant::now() + Duration::from_secs(3);
    while receiver_played.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        receiver_dispatcher.run_once(&mut receiver, Some(Duration::from_millis(10)));
    }

    assert!(receiver_played.load(Ordering::SeqCst) > 0);

    stopper.stop();
    handle.join().unwrap();
}
