//! The collaboration server: accepts connections, authenticates them
//! against the session password, negotiates plug-in protocols, forwards
//! presence notifications, and routes plug-in messages.

pub mod console;

use crate::dispatch::{Api, Dispatcher, Event, ListenerKey, Mask};
use crate::error::{ErrorKind, NetError, NetResult};
use crate::net::{TcpMessageSocket, UdpMessageSocket};
use crate::plugin::{
    Continuation, HandlerAction, PluginRequest, ServerPluginRegistry,
};
use crate::protocol::{self, CoreMessage, ProtocolStatus};
use crate::wire::buffer::BufferRef;
use crate::wire::cursor::{MessageReader, MessageWriter, WireRead};
use crate::ClientId;
use byteorder::{ByteOrder, NativeEndian};
use hashbrown::{HashMap, HashSet};
use indexmap::IndexSet;
use keel::logging::{self, Logger};
use mio::net::TcpListener;
use std::any::Any;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

const MAX_DATAGRAM_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SessionState {
    ReadingConnectRequest,
    ReadingProtocolRequests,
    ReadingMessageId,
    ReadingMessageBody,
    HandlingPluginMessage,
    Drain,
    Disconnect,
}

enum PendingBody {
    None,
    Core {
        message: CoreMessage,
        min_unread: usize,
    },
    Plugin {
        plugin_index: usize,
        message_index: u16,
        min_unread: usize,
        cont: Option<Continuation>,
    },
}

/// State of one connected client.
pub struct Session {
    id: ClientId,
    socket: TcpMessageSocket,
    socket_key: ListenerKey,
    address: String,
    nonce: [u8; protocol::NONCE_LEN],
    udp_ticket: u32,
    udp_address: Option<SocketAddr>,
    state: SessionState,
    name: String,
    connected: bool,
    plugin_indices: Vec<usize>,
    plugin_states: Vec<Option<Box<dyn Any>>>,
    reply: Option<MessageWriter>,
    protocols_remaining: u16,
    body: PendingBody,
}

/// Everything plug-ins are allowed to touch: session sockets, send
/// queues, per-client plug-in state. Handed to every plug-in callback
/// instead of a global server object.
pub struct ServerCore {
    log: Logger,
    name: String,
    session_password: String,
    listener: TcpListener,
    udp: UdpMessageSocket,
    udp_key: ListenerKey,
    sessions: HashMap<ClientId, Session>,
    session_order: IndexSet<ClientId>,
    udp_address_map: HashMap<SocketAddr, ClientId>,
    next_client_id: ClientId,
    mask_dirty: Vec<(ListenerKey, Mask)>,
}

pub struct ServerConfig {
    pub name: String,
    pub port: u16,
    pub password: String,
}

/// The collaboration server. Owns the core state and the plug-in
/// registry as sibling fields so plug-in dispatch can borrow both.
pub struct Server {
    core: ServerCore,
    plugins: ServerPluginRegistry,
    console: console::Console,
}

impl Server {
    /// Binds the listening TCP socket and the shared UDP socket.
    pub fn new(config: ServerConfig, log: &Logger) -> std::io::Result<Server> {
        let bind_address: SocketAddr = format!("0.0.0.0:{}", config.port)
            .parse()
            .expect("Malformed bind address");
        let listener = TcpListener::bind(bind_address)?;
        let udp = UdpMessageSocket::bind(bind_address)?;

        Ok(Server {
            core: ServerCore {
                log: log.new(logging::o!()),
                name: config.name,
                session_password: config.password,
                listener,
                udp,
                udp_key: 0,
                sessions: HashMap::new(),
                session_order: IndexSet::new(),
                udp_address_map: HashMap::new(),
                next_client_id: 1,
                mask_dirty: Vec::new(),
            },
            plugins: ServerPluginRegistry::new(),
            console: console::Console::new(),
        })
    }

    pub fn core(&self) -> &ServerCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ServerCore {
        &mut self.core
    }

    pub fn registry_mut(&mut self) -> &mut ServerPluginRegistry {
        &mut self.plugins
    }

    /// Loads a plug-in ahead of any client request (config preload or
    /// console `loadPlugin`).
    pub fn load_plugin(&mut self, name: &str, version: u32) -> bool {
        matches!(
            self.plugins.request(&mut self.core, name, version),
            PluginRequest::Granted(_)
        )
    }

    /// Registers the listening and UDP sockets on the dispatcher.
    pub fn attach(&mut self, dispatcher: &mut Dispatcher<Server>) {
        let listener_fd = self.core.listener.as_raw_fd();
        dispatcher.add_io_listener(listener_fd, Mask::READ, |server, api, event| {
            if let Event::Io(mask) = event {
                if mask.readable() {
                    server.accept_io(api);
                }
            }
            false
        });

        let udp_fd = self.core.udp.raw_fd();
        self.core.udp_key = dispatcher.add_io_listener(udp_fd, Mask::READ, |server, api, event| {
            if let Event::Io(mask) = event {
                server.udp_io(api, mask);
            }
            false
        });
    }

    fn flush_masks(&mut self, api: &mut Api<Server>) {
        for (key, mask) in self.core.mask_dirty.drain(..) {
            api.set_io_mask(key, mask);
        }
    }

    fn accept_io(&mut self, api: &mut Api<Server>) {
        loop {
            match self.core.listener.accept() {
                Ok((stream, address)) => self.admit(api, stream, address),
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.core.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
        self.flush_masks(api);
    }

    fn admit(&mut self, api: &mut Api<Server>, stream: mio::net::TcpStream, address: SocketAddr) {
        // Nonce and UDP ticket come from the OS CSPRNG; a client whose
        // nonce cannot be generated is refused outright.
        let mut entropy = [0u8; protocol::NONCE_LEN + 4];
        if !keel::entropy::try_random_bytes(&mut entropy) {
            logging::error!(self.core.log, "no entropy for nonce, refusing connection";
                            "peer" => %address);
            return;
        }
        let mut nonce = [0u8; protocol::NONCE_LEN];
        nonce.copy_from_slice(&entropy[..protocol::NONCE_LEN]);
        let mut ticket_bytes = [0u8; 4];
        ticket_bytes.copy_from_slice(&entropy[protocol::NONCE_LEN..]);
        let udp_ticket = u32::from_ne_bytes(ticket_bytes);

        let id = self.core.allocate_client_id();
        let mut socket = TcpMessageSocket::from_stream(stream);

        let mut password_request = MessageWriter::with_capacity(
            CoreMessage::PasswordRequest.id(),
            protocol::PASSWORD_REQUEST_SIZE,
        );
        password_request
            .write_u32(protocol::ENDIANNESS_MARKER)
            .and_then(|_| password_request.write_u32(protocol::PROTOCOL_VERSION))
            .and_then(|_| password_request.write_bytes(&nonce))
            .expect("Password request size mismatch");
        socket.queue_message(password_request.into_shared());

        let fd = socket.raw_fd();
        let socket_key = api.add_io_listener(fd, Mask::READ_WRITE, move |server, api, event| {
            if let Event::Io(mask) = event {
                server.session_io(api, id, mask);
            }
            false
        });

        logging::debug!(self.core.log, "client accepted";
                        "client_id" => id, "peer" => %address);

        self.core.sessions.insert(
            id,
            Session {
                id,
                socket,
                socket_key,
                address: address.to_string(),
                nonce,
                udp_ticket,
                udp_address: None,
                state: SessionState::ReadingConnectRequest,
                name: String::new(),
                connected: false,
                plugin_indices: Vec::new(),
                plugin_states: Vec::new(),
                reply: None,
                protocols_remaining: 0,
                body: PendingBody::None,
            },
        );
        self.core.session_order.insert(id);
    }

    fn session_io(&mut self, api: &mut Api<Server>, id: ClientId, ready: Mask) {
        if !self.core.sessions.contains_key(&id) {
            return;
        }

        if ready.readable() {
            if let Err(NetError::Fatal(kind)) = self.session_read(id) {
                let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
                logging::warn!(self.core.log, "disconnecting client";
                               "client" => &sess.name,
                               "peer" => &sess.address,
                               "error" => %kind);
                if sess.state < SessionState::Drain {
                    sess.state = SessionState::Disconnect;
                }
            }

            let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
            if sess.state < SessionState::Drain && sess.socket.eof() {
                logging::info!(self.core.log, "client closed connection";
                               "client" => &sess.name, "peer" => &sess.address);
                sess.state = SessionState::Disconnect;
            }
        }

        if ready.writable() {
            let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
            if sess.state != SessionState::Disconnect {
                match sess.socket.write_to_socket() {
                    Ok(0) => {
                        if sess.state == SessionState::Drain {
                            sess.state = SessionState::Disconnect;
                        } else {
                            let key = sess.socket_key;
                            self.core.mask_dirty.push((key, Mask::READ));
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        logging::warn!(self.core.log, "write error, disconnecting client";
                                       "client" => &sess.name, "error" => %err);
                        sess.state = SessionState::Disconnect;
                    }
                }
            }
        }

        if self
            .core
            .sessions
            .get(&id)
            .map(|sess| sess.state == SessionState::Disconnect)
            .unwrap_or(false)
        {
            self.teardown_session(api, id);
        }
        self.flush_masks(api);
    }

    fn session_read(&mut self, id: ClientId) -> NetResult<()> {
        loop {
            let newly = {
                let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
                if sess.state >= SessionState::Drain {
                    return Ok(());
                }
                let before = sess.socket.unread();
                sess.socket.read_from_socket()? - before
            };

            loop {
                match self.process_step(id) {
                    Ok(true) => {}
                    Ok(false) | Err(NetError::Wait) => break,
                    Err(fatal) => return Err(fatal),
                }
                let state = self
                    .core
                    .sessions
                    .get(&id)
                    .map(|sess| sess.state)
                    .unwrap_or(SessionState::Disconnect);
                if state >= SessionState::Drain {
                    return Ok(());
                }
            }

            if newly == 0 {
                return Ok(());
            }
        }
    }

    fn process_step(&mut self, id: ClientId) -> NetResult<bool> {
        let state = match self.core.sessions.get(&id) {
            Some(sess) => sess.state,
            None => return Ok(false),
        };
        match state {
            SessionState::ReadingConnectRequest => self.step_connect_request(id),
            SessionState::ReadingProtocolRequests => self.step_protocol_requests(id),
            SessionState::ReadingMessageId => self.step_message_id(id),
            SessionState::ReadingMessageBody | SessionState::HandlingPluginMessage => {
                self.step_message_body(id)
            }
            SessionState::Drain | SessionState::Disconnect => Ok(false),
        }
    }

    fn reject_and_drain(&mut self, id: ClientId, kind: ErrorKind) -> NetResult<bool> {
        let reject =
            crate::wire::MessageBuffer::create(CoreMessage::ConnectReject.id(), 0).into_shared();
        self.core.queue_message(id, reject);
        let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
        sess.state = SessionState::Drain;
        let key = sess.socket_key;
        self.core.mask_dirty.push((key, Mask::WRITE));
        Err(NetError::Fatal(kind))
    }

    fn step_connect_request(&mut self, id: ClientId) -> NetResult<bool> {
        let other_names: Vec<String> = self
            .core
            .sessions
            .iter()
            .filter(|(&other, _)| other != id)
            .map(|(_, sess)| sess.name.clone())
            .collect();

        enum Verdict {
            NotYet,
            BadVersion,
            BadPassword,
            Proceed,
        }

        let verdict = {
            let password = self.core.session_password.clone();
            let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
            if sess.socket.unread() < protocol::CONNECT_REQUEST_PREFIX_SIZE {
                Verdict::NotYet
            } else {
                let marker = sess.socket.read_u32()?;
                if marker == protocol::ENDIANNESS_MARKER_SWAPPED {
                    sess.socket.set_swap_on_read(true);
                } else if marker != protocol::ENDIANNESS_MARKER {
                    return Err(NetError::Fatal(ErrorKind::MalformedHandshake));
                }

                let version = sess.socket.read_u32()?;
                if version != protocol::PROTOCOL_VERSION {
                    Verdict::BadVersion
                } else {
                    let mut hash = [0u8; protocol::HASH_LEN];
                    sess.socket.fetch(&mut hash)?;
                    let expected = keel::digest::session_hash(&sess.nonce, &password);
                    if hash != expected {
                        Verdict::BadPassword
                    } else {
                        Verdict::Proceed
                    }
                }
            }
        };

        match verdict {
            Verdict::NotYet => return Ok(false),
            Verdict::BadVersion => return self.reject_and_drain(id, ErrorKind::WrongVersion),
            Verdict::BadPassword => return self.reject_and_drain(id, ErrorKind::WrongPassword),
            Verdict::Proceed => {}
        }

        let server_name = self.core.name.clone();
        let sess = self.core.sessions.get_mut(&id).expect("Session vanished");

        let name_field = protocol::read_name_field(&mut sess.socket)?;
        let requested = protocol::decode_name(&name_field)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "Client".to_owned());
        let assigned = uniquify_name(&requested, other_names.iter().map(String::as_str));

        let num_protocols = sess.socket.read_u16()?;

        let mut reply = MessageWriter::with_capacity(
            CoreMessage::ConnectReply.id(),
            protocol::CONNECT_REPLY_PREFIX_SIZE
                + num_protocols as usize * protocol::PROTOCOL_REPLY_SIZE,
        );
        protocol::write_name_field(&mut reply, &server_name)?;
        reply.write_u16(id)?;
        protocol::write_name_field(&mut reply, &assigned)?;
        reply.write_u32(sess.udp_ticket)?;
        reply.write_u16(num_protocols)?;

        sess.name = assigned;
        sess.reply = Some(reply);
        sess.protocols_remaining = num_protocols;
        sess.state = SessionState::ReadingProtocolRequests;
        Ok(true)
    }

    fn step_protocol_requests(&mut self, id: ClientId) -> NetResult<bool> {
        let mut progressed = false;
        loop {
            let request = {
                let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
                if sess.protocols_remaining == 0 {
                    break;
                }
                if sess.socket.unread() < protocol::PROTOCOL_REQUEST_SIZE {
                    return Ok(progressed);
                }
                let name_field = protocol::read_name_field(&mut sess.socket)?;
                let version = sess.socket.read_u32()?;
                (protocol::decode_name(&name_field), version)
            };

            let outcome = match request {
                (Some(name), version) if !name.is_empty() => {
                    self.plugins.request(&mut self.core, &name, version)
                }
                _ => PluginRequest::Unknown,
            };

            let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
            let reply = sess.reply.as_mut().expect("Negotiation without reply");
            match outcome {
                PluginRequest::Granted(index) => {
                    let entry = self.plugins.entry(index);
                    reply.write_u8(ProtocolStatus::Success as u8)?;
                    reply.write_u32(entry.plugin.version())?;
                    reply.write_u16(index as u16)?;
                    reply.write_u16(entry.client_base)?;
                    reply.write_u16(entry.server_base)?;
                    sess.plugin_indices.push(index);
                }
                PluginRequest::WrongVersion => {
                    reply.write_u8(ProtocolStatus::WrongVersion as u8)?;
                    reply.write_u32(0)?;
                    reply.write_u16(0)?;
                    reply.write_u16(0)?;
                    reply.write_u16(0)?;
                }
                PluginRequest::Unknown => {
                    reply.write_u8(ProtocolStatus::UnknownProtocol as u8)?;
                    reply.write_u32(0)?;
                    reply.write_u16(0)?;
                    reply.write_u16(0)?;
                    reply.write_u16(0)?;
                }
            }
            sess.protocols_remaining -= 1;
            progressed = true;
        }

        self.finish_negotiation(id)?;
        Ok(true)
    }

    fn finish_negotiation(&mut self, id: ClientId) -> NetResult<()> {
        let (reply, name, address, indices) = {
            let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
            let reply = sess.reply.take().expect("Negotiation without reply");
            sess.connected = true;
            sess.state = SessionState::ReadingMessageId;
            (
                reply.into_shared(),
                sess.name.clone(),
                sess.address.clone(),
                sess.plugin_indices.clone(),
            )
        };

        // The reply must precede every plug-in and presence message to
        // this client.
        self.core.queue_message(id, reply);

        let my_notification = build_connect_notification(id, &name, &indices);
        for other in self.core.connected_clients() {
            if other == id {
                continue;
            }
            self.core.queue_message(other, my_notification.clone());

            let other_notification = {
                let other_sess = self.core.sessions.get(&other).expect("Session vanished");
                build_connect_notification(other, &other_sess.name, &other_sess.plugin_indices)
            };
            self.core.queue_message(id, other_notification);
        }

        for &index in &indices {
            self.plugins
                .entry_mut(index)
                .plugin
                .client_connected(&mut self.core, id);
        }

        logging::info!(self.core.log, "serving client";
                       "client" => &name, "peer" => &address, "client_id" => id);
        Ok(())
    }

    fn step_message_id(&mut self, id: ClientId) -> NetResult<bool> {
        let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
        if sess.socket.unread() < 2 {
            return Ok(false);
        }
        let message_id = sess.socket.read_u16()?;

        if message_id < protocol::NUM_CORE_MESSAGES {
            match message_id {
                id_val if id_val == CoreMessage::DisconnectRequest.id() => {
                    if sess.socket.has_egress() {
                        sess.state = SessionState::Drain;
                        let key = sess.socket_key;
                        self.core.mask_dirty.push((key, Mask::WRITE));
                    } else {
                        sess.state = SessionState::Disconnect;
                    }
                }
                id_val if id_val == CoreMessage::PingRequest.id() => {
                    sess.body = PendingBody::Core {
                        message: CoreMessage::PingRequest,
                        min_unread: protocol::PING_SIZE,
                    };
                    sess.state = SessionState::ReadingMessageBody;
                }
                id_val if id_val == CoreMessage::NameChangeRequest.id() => {
                    sess.body = PendingBody::Core {
                        message: CoreMessage::NameChangeRequest,
                        min_unread: protocol::NAME_CHANGE_REQUEST_SIZE,
                    };
                    sess.state = SessionState::ReadingMessageBody;
                }
                _ => return Err(NetError::Fatal(ErrorKind::UnknownMessage(message_id))),
            }
            return Ok(true);
        }

        match self.plugins.route_client_message(message_id) {
            Some((plugin_index, message_index)) => {
                let min_unread = self
                    .plugins
                    .entry(plugin_index)
                    .plugin
                    .tcp_min_unread(message_index);
                let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
                sess.body = PendingBody::Plugin {
                    plugin_index,
                    message_index,
                    min_unread,
                    cont: None,
                };
                sess.state = SessionState::ReadingMessageBody;
                Ok(true)
            }
            None => Err(NetError::Fatal(ErrorKind::UnknownMessage(message_id))),
        }
    }

    fn step_message_body(&mut self, id: ClientId) -> NetResult<bool> {
        enum Dispatch {
            NotYet,
            Core(CoreMessage),
            Plugin {
                plugin_index: usize,
                message_index: u16,
                cont: Option<Continuation>,
            },
        }

        let dispatch = {
            let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
            let unread = sess.socket.unread();
            match &mut sess.body {
                PendingBody::None => return Err(NetError::Fatal(ErrorKind::Truncated)),
                PendingBody::Core {
                    message,
                    min_unread,
                } => {
                    if unread < *min_unread {
                        Dispatch::NotYet
                    } else {
                        Dispatch::Core(*message)
                    }
                }
                PendingBody::Plugin { min_unread, .. } if unread < *min_unread => Dispatch::NotYet,
                PendingBody::Plugin { .. } => {
                    match std::mem::replace(&mut sess.body, PendingBody::None) {
                        PendingBody::Plugin {
                            plugin_index,
                            message_index,
                            cont,
                            ..
                        } => Dispatch::Plugin {
                            plugin_index,
                            message_index,
                            cont,
                        },
                        _ => unreachable!(),
                    }
                }
            }
        };

        match dispatch {
            Dispatch::NotYet => Ok(false),
            Dispatch::Core(message) => {
                match message {
                    CoreMessage::PingRequest => self.handle_ping(id)?,
                    CoreMessage::NameChangeRequest => self.handle_name_change(id)?,
                    _ => return Err(NetError::Fatal(ErrorKind::UnknownMessage(message.id()))),
                }
                let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
                sess.body = PendingBody::None;
                sess.state = SessionState::ReadingMessageId;
                Ok(true)
            }
            Dispatch::Plugin {
                plugin_index,
                message_index,
                cont,
            } => {
                let action = self
                    .plugins
                    .entry_mut(plugin_index)
                    .plugin
                    .handle_tcp_message(&mut self.core, id, message_index, cont)
                    .map_err(|err| match err {
                        NetError::Wait => NetError::Fatal(ErrorKind::Truncated),
                        fatal => fatal,
                    })?;
                let sess = match self.core.sessions.get_mut(&id) {
                    Some(sess) => sess,
                    None => return Ok(false),
                };
                match action {
                    HandlerAction::Done => {
                        sess.state = SessionState::ReadingMessageId;
                    }
                    HandlerAction::NeedMore { min_unread, cont } => {
                        sess.body = PendingBody::Plugin {
                            plugin_index,
                            message_index,
                            min_unread,
                            cont: Some(cont),
                        };
                        sess.state = SessionState::HandlingPluginMessage;
                    }
                }
                Ok(true)
            }
        }
    }

    fn handle_ping(&mut self, id: ClientId) -> NetResult<()> {
        let sequence = {
            let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
            let (sequence, _sec, _nsec) = protocol::read_ping(&mut sess.socket)?;
            sequence
        };
        let reply = protocol::create_ping(CoreMessage::PingReply.id(), sequence).into_shared();
        self.core.queue_message(id, reply);
        Ok(())
    }

    fn handle_name_change(&mut self, id: ClientId) -> NetResult<()> {
        let other_names: Vec<String> = self
            .core
            .sessions
            .iter()
            .filter(|(&other, _)| other != id)
            .map(|(_, sess)| sess.name.clone())
            .collect();

        let (requested, old_name) = {
            let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
            let field = protocol::read_name_field(&mut sess.socket)?;
            (protocol::decode_name(&field), sess.name.clone())
        };

        let (granted, new_name) = match requested.filter(|name| !name.is_empty()) {
            Some(name) => (
                true,
                uniquify_name(&name, other_names.iter().map(String::as_str)),
            ),
            None => (false, old_name),
        };

        {
            let sess = self.core.sessions.get_mut(&id).expect("Session vanished");
            sess.name = new_name.clone();
        }

        let mut reply = MessageWriter::with_capacity(
            CoreMessage::NameChangeReply.id(),
            protocol::NAME_CHANGE_REPLY_SIZE,
        );
        reply.write_u8(granted as u8)?;
        protocol::write_name_field(&mut reply, &new_name)?;
        self.core.queue_message(id, reply.into_shared());

        if granted {
            let mut notification = MessageWriter::with_capacity(
                CoreMessage::NameChangeNotification.id(),
                protocol::NAME_CHANGE_NOTIFICATION_SIZE,
            );
            notification.write_u16(id)?;
            protocol::write_name_field(&mut notification, &new_name)?;
            let notification = notification.into_shared();
            for other in self.core.connected_clients() {
                if other != id {
                    self.core.queue_message(other, notification.clone());
                }
            }
        }
        Ok(())
    }

    /// Force-closes a session (console command or fatal policy error).
    pub fn force_disconnect(&mut self, api: &mut Api<Server>, id: ClientId) {
        if self.core.sessions.contains_key(&id) {
            self.teardown_session(api, id);
            self.flush_masks(api);
        }
    }

    fn teardown_session(&mut self, api: &mut Api<Server>, id: ClientId) {
        let (connected, indices, socket_key, name, address) = {
            let sess = match self.core.sessions.get(&id) {
                Some(sess) => sess,
                None => return,
            };
            (
                sess.connected,
                sess.plugin_indices.clone(),
                sess.socket_key,
                sess.name.clone(),
                sess.address.clone(),
            )
        };

        // Plug-ins observe the disconnect in reverse registration order
        // while the session state is still reachable.
        if connected {
            for &index in indices.iter().rev() {
                self.plugins
                    .entry_mut(index)
                    .plugin
                    .client_disconnected(&mut self.core, id);
            }
        }

        let sess = self.core.sessions.remove(&id).expect("Session vanished");
        self.core.session_order.shift_remove(&id);
        if let Some(udp_address) = sess.udp_address {
            self.core.udp_address_map.remove(&udp_address);
        }
        api.remove_listener(socket_key);
        drop(sess);

        if connected {
            let mut notification = MessageWriter::with_capacity(
                CoreMessage::ClientDisconnectNotification.id(),
                protocol::CLIENT_DISCONNECT_NOTIFICATION_SIZE,
            );
            notification
                .write_u16(id)
                .expect("Notification size mismatch");
            let notification = notification.into_shared();
            for other in self.core.connected_clients() {
                self.core.queue_message(other, notification.clone());
            }
            logging::info!(self.core.log, "client disconnected";
                           "client" => &name, "peer" => &address);
        }
    }

    fn udp_io(&mut self, api: &mut Api<Server>, ready: Mask) {
        if ready.readable() {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                match self.core.udp.read_datagram(&mut buffer) {
                    Ok(Some((length, sender))) => {
                        self.handle_datagram(&buffer[..length], sender);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        // Datagram errors never terminate anything.
                        logging::debug!(self.core.log, "UDP read error"; "error" => %err);
                        break;
                    }
                }
            }
        }

        if ready.writable() {
            match self.core.udp.write_to_socket() {
                Ok(0) => {
                    let key = self.core.udp_key;
                    self.core.mask_dirty.push((key, Mask::READ));
                }
                Ok(_) => {}
                Err(err) => {
                    logging::debug!(self.core.log, "UDP write error"; "error" => %err);
                }
            }
        }
        self.flush_masks(api);
    }

    fn handle_datagram(&mut self, bytes: &[u8], sender: SocketAddr) {
        if bytes.len() < 2 {
            return;
        }
        let native_id = NativeEndian::read_u16(&bytes[..2]);
        let connect_id = CoreMessage::UdpConnectRequest.id();

        // The first handshake datagram arrives before the sender's
        // endianness is known; accept the ID in either byte order and
        // infer the swap flag from which one matched.
        if (native_id == connect_id || native_id.swap_bytes() == connect_id)
            && bytes.len() == 2 + protocol::UDP_CONNECT_REQUEST_SIZE
        {
            let swap = native_id != connect_id;
            let mut reader = MessageReader::over_bytes(&bytes[2..], swap);
            let client_id = match reader.read_u16() {
                Ok(client_id) => client_id,
                Err(_) => return,
            };
            let ticket = match reader.read_u32() {
                Ok(ticket) => ticket,
                Err(_) => return,
            };

            let reply_ticket = {
                let sess = match self.core.sessions.get_mut(&client_id) {
                    Some(sess) => sess,
                    None => return,
                };
                if sess.udp_ticket != ticket {
                    logging::warn!(self.core.log, "UDP connect ticket mismatch";
                                   "client_id" => client_id, "peer" => %sender);
                    return;
                }
                if sess.udp_address.is_none() {
                    sess.udp_address = Some(sender);
                    logging::info!(self.core.log, "UDP connection established";
                                   "client" => &sess.name, "peer" => %sender);
                }
                sess.udp_ticket
            };
            self.core.udp_address_map.entry(sender).or_insert(client_id);

            // Duplicates are answered idempotently.
            let mut reply = MessageWriter::with_capacity(
                CoreMessage::UdpConnectReply.id(),
                protocol::UDP_CONNECT_REPLY_SIZE,
            );
            reply
                .write_u32(reply_ticket)
                .expect("Reply size mismatch");
            self.core.queue_udp_datagram(sender, reply.into_shared());
            return;
        }

        let client_id = match self.core.udp_address_map.get(&sender) {
            Some(&client_id) => client_id,
            None => return,
        };
        let swap = match self.core.sessions.get(&client_id) {
            Some(sess) => sess.socket.swap_on_read(),
            None => return,
        };

        let mut reader = MessageReader::over_bytes(bytes, swap);
        let message_id = match reader.read_u16() {
            Ok(message_id) => message_id,
            Err(_) => return,
        };

        if message_id == CoreMessage::PingRequest.id() {
            if let Ok((sequence, _, _)) = protocol::read_ping(&mut reader) {
                let reply =
                    protocol::create_ping(CoreMessage::PingReply.id(), sequence).into_shared();
                self.core.queue_udp_datagram(sender, reply);
            }
            return;
        }

        if let Some((plugin_index, message_index)) = self.plugins.route_client_message(message_id) {
            let result = self.plugins.entry_mut(plugin_index).plugin.handle_udp_message(
                &mut self.core,
                client_id,
                message_index,
                &mut reader,
            );
            if let Err(err) = result {
                logging::debug!(self.core.log, "dropping bad datagram";
                                "client_id" => client_id, "error" => %err);
            }
        }
        // Unknown IDs are dropped.
    }
}

impl ServerCore {
    fn allocate_client_id(&mut self) -> ClientId {
        loop {
            let id = self.next_client_id;
            self.next_client_id = self.next_client_id.wrapping_add(1);
            if id != 0 && !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn server_name(&self) -> &str {
        &self.name
    }

    /// Actual TCP listening port (differs from the configured one when
    /// binding to port 0).
    pub fn local_port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|address| address.port())
            .unwrap_or(0)
    }

    pub fn set_password(&mut self, password: String) {
        self.session_password = password;
    }

    /// IDs of fully-connected clients, in connection order.
    pub fn connected_clients(&self) -> Vec<ClientId> {
        self.session_order
            .iter()
            .copied()
            .filter(|id| {
                self.sessions
                    .get(id)
                    .map(|sess| sess.connected && sess.state < SessionState::Drain)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn client_name(&self, id: ClientId) -> Option<&str> {
        self.sessions.get(&id).map(|sess| sess.name.as_str())
    }

    pub fn client_address(&self, id: ClientId) -> Option<&str> {
        self.sessions.get(&id).map(|sess| sess.address.as_str())
    }

    pub fn have_udp(&self, id: ClientId) -> bool {
        self.sessions
            .get(&id)
            .map(|sess| sess.udp_address.is_some())
            .unwrap_or(false)
    }

    pub fn swap_on_read(&self, id: ClientId) -> bool {
        self.sessions
            .get(&id)
            .map(|sess| sess.socket.swap_on_read())
            .unwrap_or(false)
    }

    /// The client's TCP socket, for message-handler reads.
    pub fn socket_mut(&mut self, id: ClientId) -> NetResult<&mut TcpMessageSocket> {
        self.sessions
            .get_mut(&id)
            .map(|sess| &mut sess.socket)
            .ok_or(NetError::Fatal(ErrorKind::PeerClosed))
    }

    /// Queues a message on the client's TCP socket, arming write
    /// dispatching if the socket was idle.
    pub fn queue_message(&mut self, id: ClientId, message: BufferRef) {
        if let Some(sess) = self.sessions.get_mut(&id) {
            if sess.socket.queue_message(message) == 0 {
                let mask = if sess.state >= SessionState::Drain {
                    Mask::WRITE
                } else {
                    Mask::READ_WRITE
                };
                self.mask_dirty.push((sess.socket_key, mask));
            }
        }
    }

    /// Queues a datagram to an explicit address.
    pub fn queue_udp_datagram(&mut self, destination: SocketAddr, message: BufferRef) {
        if self.udp.queue_datagram(destination, message) == 0 {
            self.mask_dirty.push((self.udp_key, Mask::READ_WRITE));
        }
    }

    /// Queues a datagram to a client with UDP connectivity; silently
    /// drops it otherwise.
    pub fn queue_udp_message(&mut self, id: ClientId, message: BufferRef) {
        if let Some(destination) = self.sessions.get(&id).and_then(|sess| sess.udp_address) {
            self.queue_udp_datagram(destination, message);
        }
    }

    /// Queues a datagram to a client, falling back to its TCP socket
    /// when the client lacks UDP connectivity.
    pub fn queue_udp_message_fallback(&mut self, id: ClientId, message: BufferRef) {
        match self.sessions.get(&id).and_then(|sess| sess.udp_address) {
            Some(destination) => self.queue_udp_datagram(destination, message),
            None => self.queue_message(id, message),
        }
    }

    /// Per-client opaque plug-in state.
    pub fn plugin_state_mut(
        &mut self,
        id: ClientId,
        plugin_index: usize,
    ) -> Option<&mut Box<dyn Any>> {
        self.sessions
            .get_mut(&id)
            .and_then(|sess| sess.plugin_states.get_mut(plugin_index))
            .and_then(|slot| slot.as_mut())
    }

    pub fn set_plugin_state(&mut self, id: ClientId, plugin_index: usize, state: Box<dyn Any>) {
        if let Some(sess) = self.sessions.get_mut(&id) {
            if sess.plugin_states.len() <= plugin_index {
                sess.plugin_states.resize_with(plugin_index + 1, || None);
            }
            sess.plugin_states[plugin_index] = Some(state);
        }
    }

    pub fn take_plugin_state(
        &mut self,
        id: ClientId,
        plugin_index: usize,
    ) -> Option<Box<dyn Any>> {
        self.sessions
            .get_mut(&id)
            .and_then(|sess| sess.plugin_states.get_mut(plugin_index))
            .and_then(|slot| slot.take())
    }

    /// Queue statistics for the operator console: (id, name, unsent TCP
    /// bytes, unread TCP bytes).
    pub fn netstat(&self) -> Vec<(ClientId, String, usize, usize)> {
        self.session_order
            .iter()
            .filter_map(|id| {
                self.sessions.get(id).map(|sess| {
                    (
                        *id,
                        sess.name.clone(),
                        sess.socket.unsent(),
                        sess.socket.unread(),
                    )
                })
            })
            .collect()
    }

    pub fn udp_queued(&self) -> usize {
        self.udp.queued()
    }
}

fn build_connect_notification(id: ClientId, name: &str, indices: &[usize]) -> BufferRef {
    let mut writer = MessageWriter::with_capacity(
        CoreMessage::ClientConnectNotification.id(),
        protocol::CLIENT_CONNECT_NOTIFICATION_PREFIX_SIZE + indices.len() * 2,
    );
    writer.write_u16(id).expect("Notification size mismatch");
    protocol::write_name_field(&mut writer, name).expect("Notification size mismatch");
    writer
        .write_u16(indices.len() as u16)
        .expect("Notification size mismatch");
    for &index in indices {
        writer
            .write_u16(index as u16)
            .expect("Notification size mismatch");
    }
    writer.into_shared()
}

/// Ensures a requested client name is unique among the given existing
/// names. A colliding name is trimmed to leave room for a uniquifying
/// suffix, then given the smallest unused four-digit decimal suffix.
pub fn uniquify_name<'a, I>(requested: &str, existing: I) -> String
where
    I: Iterator<Item = &'a str>,
{
    let names: Vec<&str> = existing.collect();
    if !names.iter().any(|&name| name == requested) {
        return requested.to_owned();
    }

    let mut base = requested.to_owned();
    while base.len() > protocol::NAME_LEN - 5 {
        base.pop();
    }
    base.push('_');

    let mut used: HashSet<u32> = HashSet::new();
    for &name in &names {
        if name.len() == base.len() + 4 && name.starts_with(&base) {
            let suffix = &name[base.len()..];
            if suffix.bytes().all(|b| b.is_ascii_digit()) {
                used.insert(suffix.parse().expect("Digits always parse"));
            }
        }
    }

    let mut suffix = 1u32;
    while used.contains(&suffix) {
        suffix += 1;
    }
    format!("{}{:04}", base, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name_passes_through() {
        assert_eq!(uniquify_name("alice", ["bob"].iter().copied()), "alice");
    }

    #[test]
    fn test_collision_gets_smallest_suffix() {
        assert_eq!(
            uniquify_name("alice", ["alice"].iter().copied()),
            "alice_0001"
        );
        assert_eq!(
            uniquify_name("alice", ["alice", "alice_0001"].iter().copied()),
            "alice_0002"
        );
        assert_eq!(
            uniquify_name(
                "alice",
                ["alice", "alice_0001", "alice_0003"].iter().copied()
            ),
            "alice_0002"
        );
    }

    #[test]
    fn test_gap_in_suffixes_is_reused() {
        assert_eq!(
            uniquify_name("bot", ["bot", "bot_0002", "bot_0003"].iter().copied()),
            "bot_0001"
        );
    }

    #[test]
    fn test_long_names_are_trimmed_for_suffix() {
        let long = "x".repeat(40);
        let existing = long.clone();
        let result = uniquify_name(&long, [existing.as_str()].iter().copied());

        assert_eq!(result.len(), 27 + 5);
        assert!(result.starts_with(&"x".repeat(27)));
        assert!(result.ends_with("_0001"));
    }

    #[test]
    fn test_multibyte_names_trim_at_char_boundary() {
        let name = "é".repeat(20); // 40 bytes
        let result = uniquify_name(&name, [name.as_str()].iter().copied());

        // 13 two-byte characters fit in 27 bytes.
        assert!(result.starts_with(&"é".repeat(13)));
        assert!(result.ends_with("_0001"));
        assert_eq!(result.len(), 26 + 5);
    }

    #[test]
    fn test_non_digit_suffixes_are_ignored() {
        assert_eq!(
            uniquify_name("bot", ["bot", "bot_abcd"].iter().copied()),
            "bot_0001"
        );
    }
}
