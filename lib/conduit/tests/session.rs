//! Loopback sessions: handshake ordering, authentication, name
//! uniquification, presence fan-out, and plug-in negotiation between a
//! real server and real clients.

use conduit::client::{Client, ClientConfig, ClientCore};
use conduit::dispatch::{Dispatcher, Stopper};
use conduit::error::NetResult;
use conduit::plugin::{
    ClientPlugin, Continuation, HandlerAction, ServerPlugin,
};
use conduit::server::{Server, ServerConfig, ServerCore};
use conduit::wire::cursor::{MessageReader, MessageWriter, WireRead};
use conduit::{ClientId, MessageId};
use std::any::Any;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// A trivial plug-in protocol: the client sends a u32, the server
// replies with the value plus one.
const PARROT: &str = "Parrot";
const PARROT_VERSION: u32 = 1 << 16;

struct ParrotServer {
    client_base: MessageId,
    server_base: MessageId,
}

impl ServerPlugin for ParrotServer {
    fn name(&self) -> &str {
        PARROT
    }
    fn version(&self) -> u32 {
        PARROT_VERSION
    }
    fn num_client_messages(&self) -> u16 {
        1
    }
    fn num_server_messages(&self) -> u16 {
        1
    }
    fn set_message_bases(&mut self, client_base: MessageId, server_base: MessageId) {
        self.client_base = client_base;
        self.server_base = server_base;
    }
    fn start(&mut self, _core: &mut ServerCore) {}
    fn client_connected(&mut self, _core: &mut ServerCore, _client_id: ClientId) {}
    fn client_disconnected(&mut self, _core: &mut ServerCore, _client_id: ClientId) {}
    fn tcp_min_unread(&self, _message_index: u16) -> usize {
        4
    }
    fn handle_tcp_message(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        _message_index: u16,
        _cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        let value = core.socket_mut(client_id)?.read_u32()?;
        let mut reply = MessageWriter::with_capacity(self.server_base, 4);
        reply.write_u32(value + 1)?;
        core.queue_message(client_id, reply.into_shared());
        Ok(HandlerAction::Done)
    }
    fn handle_udp_message(
        &mut self,
        _core: &mut ServerCore,
        _client_id: ClientId,
        _message_index: u16,
        _reader: &mut MessageReader,
    ) -> NetResult<()> {
        Ok(())
    }
}

struct ParrotClient {
    client_base: MessageId,
    server_base: MessageId,
    replies: Vec<u32>,
}

impl ParrotClient {
    fn send(&mut self, core: &mut ClientCore, value: u32) {
        let mut message = MessageWriter::with_capacity(self.client_base, 4);
        message.write_u32(value).unwrap();
        core.queue_server_message(message.into_shared());
    }
}

impl ClientPlugin for ParrotClient {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn name(&self) -> &str {
        PARROT
    }
    fn version(&self) -> u32 {
        PARROT_VERSION
    }
    fn num_client_messages(&self) -> u16 {
        1
    }
    fn num_server_messages(&self) -> u16 {
        1
    }
    fn set_message_bases(&mut self, client_base: MessageId, server_base: MessageId) {
        self.client_base = client_base;
        self.server_base = server_base;
    }
    fn start(&mut self, _core: &mut ClientCore) {}
    fn remote_client_connected(&mut self, _core: &mut ClientCore, _client_id: ClientId) {}
    fn remote_client_disconnected(&mut self, _core: &mut ClientCore, _client_id: ClientId) {}
    fn tcp_min_unread(&self, _message_index: u16) -> usize {
        4
    }
    fn handle_tcp_message(
        &mut self,
        core: &mut ClientCore,
        _message_index: u16,
        _cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        let value = core.socket_mut().read_u32()?;
        self.replies.push(value);
        Ok(HandlerAction::Done)
    }
    fn handle_udp_message(
        &mut self,
        _core: &mut ClientCore,
        _message_index: u16,
        _reader: &mut MessageReader,
    ) -> NetResult<()> {
        Ok(())
    }
}

// A client-side plug-in the server never heard of.
struct NoSuchClient;

impl ClientPlugin for NoSuchClient {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn name(&self) -> &str {
        "NoSuch"
    }
    fn version(&self) -> u32 {
        1 << 16
    }
    fn num_client_messages(&self) -> u16 {
        1
    }
    fn num_server_messages(&self) -> u16 {
        1
    }
    fn set_message_bases(&mut self, _client_base: MessageId, _server_base: MessageId) {}
    fn start(&mut self, _core: &mut ClientCore) {}
    fn remote_client_connected(&mut self, _core: &mut ClientCore, _client_id: ClientId) {}
    fn remote_client_disconnected(&mut self, _core: &mut ClientCore, _client_id: ClientId) {}
    fn tcp_min_unread(&self, _message_index: u16) -> usize {
        0
    }
    fn handle_tcp_message(
        &mut self,
        _core: &mut ClientCore,
        _message_index: u16,
        _cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        Ok(HandlerAction::Done)
    }
    fn handle_udp_message(
        &mut self,
        _core: &mut ClientCore,
        _message_index: u16,
        _reader: &mut MessageReader,
    ) -> NetResult<()> {
        Ok(())
    }
}

struct TestServer {
    port: u16,
    stopper: Stopper,
    handle: JoinHandle<Server>,
}

fn start_server(password: &str, with_parrot: bool) -> TestServer {
    let log = keel::logging::null();
    let mut server = Server::new(
        ServerConfig {
            name: "testhub".to_owned(),
            port: 0,
            password: password.to_owned(),
        },
        &log,
    )
    .expect("cannot bind loopback server");
    let port = server.core().local_port();

    if with_parrot {
        server.registry_mut().add_factory(|name, _version| {
            if name == PARROT {
                Some(Box::new(ParrotServer {
                    client_base: 0,
                    server_base: 0,
                }) as Box<dyn ServerPlugin>)
            } else {
                None
            }
        });
    }

    let mut dispatcher: Dispatcher<Server> = Dispatcher::new().unwrap();
    let stopper = dispatcher.stopper();
    let handle = std::thread::spawn(move || {
        server.attach(&mut dispatcher);
        dispatcher.run(&mut server);
        server
    });

    TestServer {
        port,
        stopper,
        handle,
    }
}

fn make_client(port: u16, password: &str, name: &str) -> (Client, Dispatcher<Client>) {
    let log = keel::logging::null();
    let client = Client::new(
        ClientConfig {
            server_host: "127.0.0.1".to_owned(),
            server_port: port,
            session_password: password.to_owned(),
            client_name: name.to_owned(),
        },
        &log,
    )
    .expect("cannot connect to loopback server");
    let dispatcher: Dispatcher<Client> = Dispatcher::new().unwrap();
    (client, dispatcher)
}

fn pump_until(
    client: &mut Client,
    dispatcher: &mut Dispatcher<Client>,
    timeout: Duration,
    mut done: impl FnMut(&Client) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        dispatcher.run_once(client, Some(Duration::from_millis(20)));
        if done(client) {
            return true;
        }
        if client.was_disconnected() {
            return done(client);
        }
    }
    false
}

fn connect(client: &mut Client, dispatcher: &mut Dispatcher<Client>) -> bool {
    client.attach(dispatcher);
    pump_until(client, dispatcher, Duration::from_secs(5), |client| {
        client.core().client_id() != 0
    })
}

#[test]
fn test_empty_password_session() {
    let server = start_server("", false);

    let (mut client, mut dispatcher) = make_client(server.port, "", "solo");
    assert!(connect(&mut client, &mut dispatcher));
    assert!(!client.was_disconnected());
    assert_eq!(client.core().server_name(), "testhub");
    assert_eq!(client.core().client_name(), "solo");

    server.stopper.stop();
    server.handle.join().unwrap();
}

#[test]
fn test_wrong_password_is_rejected() {
    let server = start_server("swordfish", false);

    let (mut client, mut dispatcher) = make_client(server.port, "tuna", "intruder");
    client.attach(&mut dispatcher);
    let disconnected = pump_until(
        &mut client,
        &mut dispatcher,
        Duration::from_secs(5),
        |client| client.was_disconnected(),
    );

    assert!(disconnected);
    assert_eq!(client.core().client_id(), 0);

    server.stopper.stop();
    server.handle.join().unwrap();
}

#[test]
fn test_name_uniquification_across_clients() {
    let server = start_server("", false);

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let (mut client, mut dispatcher) = make_client(server.port, "", "alice");
        assert!(connect(&mut client, &mut dispatcher));
        sessions.push((client, dispatcher));
    }

    let names: Vec<String> = sessions
        .iter()
        .map(|(client, _)| client.core().client_name().to_owned())
        .collect();

    assert_eq!(names[0], "alice");
    assert_eq!(names[1], "alice_0001");
    assert_eq!(names[2], "alice_0002");

    server.stopper.stop();
    server.handle.join().unwrap();
}

#[test]
fn test_presence_roster_and_disconnect_fanout() {
    let server = start_server("", false);

    let (mut alpha, mut alpha_dispatcher) = make_client(server.port, "", "alpha");
    assert!(connect(&mut alpha, &mut alpha_dispatcher));

    let (mut beta, mut beta_dispatcher) = make_client(server.port, "", "beta");
    assert!(connect(&mut beta, &mut beta_dispatcher));

    // The later client learns about the pre-existing peer right after
    // its ConnectReply; the earlier one is notified asynchronously.
    assert!(pump_until(
        &mut beta,
        &mut beta_dispatcher,
        Duration::from_secs(5),
        |client| client.core().remote_clients().count() == 1,
    ));
    assert!(pump_until(
        &mut alpha,
        &mut alpha_dispatcher,
        Duration::from_secs(5),
        |client| client.core().remote_clients().count() == 1,
    ));
    assert_eq!(
        alpha.core().remote_clients().next().unwrap().name,
        "beta"
    );
    assert_eq!(
        beta.core().remote_clients().next().unwrap().name,
        "alpha"
    );

    // Closing beta's connection must produce exactly one disconnect
    // notification for every remaining client.
    drop(beta_dispatcher);
    drop(beta);
    assert!(pump_until(
        &mut alpha,
        &mut alpha_dispatcher,
        Duration::from_secs(5),
        |client| client.core().remote_clients().count() == 0,
    ));

    server.stopper.stop();
    server.handle.join().unwrap();
}

#[test]
fn test_plugin_negotiation_and_roundtrip() {
    let server = start_server("", true);

    let (mut client, mut dispatcher) = make_client(server.port, "", "plugger");
    client.add_plugin(Box::new(ParrotClient {
        client_base: 0,
        server_base: 0,
        replies: Vec::new(),
    }));
    client.add_plugin(Box::new(NoSuchClient));

    assert!(connect(&mut client, &mut dispatcher));

    // The unknown protocol was dropped; the known one is bound above
    // the core ID range.
    assert_eq!(client.registry().len(), 1);
    let entry = client.registry().entry(0);
    assert_eq!(entry.plugin.name(), PARROT);
    assert!(entry.confirmed);
    assert!(entry.client_base >= conduit::protocol::NUM_CORE_MESSAGES);
    assert!(entry.server_base >= conduit::protocol::NUM_CORE_MESSAGES);

    client.with_plugin::<ParrotClient, _>(PARROT, |plugin, core| {
        plugin.send(core, 41);
    });
    client.flush_pending_masks(&mut dispatcher);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = Vec::new();
    while Instant::now() < deadline && received.is_empty() {
        dispatcher.run_once(&mut client, Some(Duration::from_millis(20)));
        client.with_plugin::<ParrotClient, _>(PARROT, |plugin, _| {
            received = plugin.replies.clone();
        });
    }
    assert_eq!(received, vec![42]);

    // Installing a forwarder re-routes the reply into the front-end
    // pipe instead of the back-end handler.
    let server_base = client.registry().entry(0).server_base;
    let mut frontend = client.enable_frontend();
    client.core_mut().set_message_forwarder(server_base, 4);

    let forwarded = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = forwarded.clone();
    frontend.set_handler(server_base, move |_, reader| {
        sink.borrow_mut().push(reader.read_u32().unwrap());
    });

    client.with_plugin::<ParrotClient, _>(PARROT, |plugin, core| {
        plugin.send(core, 10);
    });
    client.flush_pending_masks(&mut dispatcher);

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && forwarded.borrow().is_empty() {
        dispatcher.run_once(&mut client, Some(Duration::from_millis(20)));
        frontend.dispatch();
    }
    assert_eq!(*forwarded.borrow(), vec![11]);

    // The back-end handler saw only the first exchange.
    client.with_plugin::<ParrotClient, _>(PARROT, |plugin, _| {
        assert_eq!(plugin.replies, vec![42]);
    });

    server.stopper.stop();
    server.handle.join().unwrap();
}
