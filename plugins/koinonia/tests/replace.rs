//! Replace-wins semantics over a real loopback session: two clients
//! share one globally named object, race their replaces, and converge
//! on the winner's value.

use conduit::client::{Client, ClientConfig};
use conduit::datatype::{AtomicType, Value};
use conduit::dispatch::Dispatcher;
use conduit::plugin::ServerPlugin;
use conduit::server::{Server, ServerConfig};
use koinonia::client::KoinoniaClient;
use koinonia::server::KoinoniaServer;
use std::time::{Duration, Instant};

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
        if name == koinonia::PROTOCOL_NAME {
            Some(Box::new(KoinoniaServer::new(&factory_log)) as Box<dyn ServerPlugin>)
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

struct Session {
    client: Client,
    dispatcher: Dispatcher<Client>,
}

impl Session {
    fn new(port: u16, name: &str, initial: u32) -> Session {
        let log = keel::logging::null();
        let mut plugin = KoinoniaClient::new(&log);
        // Shared before the connection exists; flushed once the bases
        // are negotiated.
        let object_id = plugin
            .share_object(
                None,
                "X",
                conduit::datatype::DataType::new(),
                AtomicType::UInt32.id(),
                Value::UInt32(initial),
                None,
            )
            .unwrap();
        assert_eq!(object_id, 1);

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
        Session { client, dispatcher }
    }

    fn attach(&mut self) {
        let Session { client, dispatcher } = self;
        client.attach(dispatcher);
    }

    fn pump(&mut self) {
        let Session { client, dispatcher } = self;
        dispatcher.run_once(client, Some(Duration::from_millis(10)));
    }

    fn server_object_id(&mut self) -> u16 {
        self.client
            .with_plugin::<KoinoniaClient, _>(koinonia::PROTOCOL_NAME, |plugin, _| {
                plugin.object_server_id(1).unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn value(&mut self) -> Option<Value> {
        self.client
            .with_plugin::<KoinoniaClient, _>(koinonia::PROTOCOL_NAME, |plugin, _| {
                plugin.object_value(1).cloned()
            })
            .flatten()
    }

    fn version(&mut self) -> u8 {
        self.client
            .with_plugin::<KoinoniaClient, _>(koinonia::PROTOCOL_NAME, |plugin, _| {
                plugin.object_version(1).unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn replace(&mut self, value: u32) {
        let Session { client, dispatcher } = self;
        client
            .with_plugin::<KoinoniaClient, _>(koinonia::PROTOCOL_NAME, |plugin, core| {
                plugin.replace_object(core, 1, Value::UInt32(value)).unwrap();
            })
            .unwrap();
        client.flush_pending_masks(dispatcher);
    }
}

fn pump_both_until(
    first: &mut Session,
    second: &mut Session,
    timeout: Duration,
    mut done: impl FnMut(&mut Session, &mut Session) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        first.pump();
        second.pump();
        if done(first, second) {
            return true;
        }
    }
    false
}

#[test]
fn test_join_receives_current_value_and_replace_conflict_resolves() {
    let (port, stopper, handle) = start_server();

    // Alpha creates the object first; beta joins it afterwards so the
    // authoritative initial value is deterministic.
    let mut alpha = Session::new(port, "alpha", 5);
    alpha.attach();
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while alpha.server_object_id() == 0 {
            assert!(Instant::now() < deadline, "alpha's create went unanswered");
            alpha.pump();
        }
    }

    let mut beta = Session::new(port, "beta", 9);
    beta.attach();
    assert!(pump_both_until(
        &mut alpha,
        &mut beta,
        Duration::from_secs(5),
        |alpha, beta| alpha.server_object_id() != 0 && beta.server_object_id() != 0,
    ));
    assert_eq!(alpha.server_object_id(), beta.server_object_id());
    assert!(pump_both_until(
        &mut alpha,
        &mut beta,
        Duration::from_secs(5),
        |_, beta| beta.value() == Some(Value::UInt32(5)),
    ));

    // Both race a replace from version 0; exactly one wins and both
    // converge on the winner's value at version 1.
    alpha.replace(7);
    beta.replace(8);

    assert!(pump_both_until(
        &mut alpha,
        &mut beta,
        Duration::from_secs(5),
        |alpha, beta| {
            alpha.version() == 1
                && beta.version() == 1
                && alpha.value() == beta.value()
        },
    ));

    let winner = alpha.value().unwrap();
    assert!(winner == Value::UInt32(7) || winner == Value::UInt32(8));

    stopper.stop();
    handle.join().unwrap();
}
