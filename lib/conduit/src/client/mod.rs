//! The collaboration client: connects and authenticates, tracks the
//! remote-client roster, binds plug-in protocols, and forwards selected
//! messages to an optional interactive front end.

pub mod frontend;

use crate::dispatch::{
    Api, Dispatcher, Event, ListenerKey, Mask, SignalSender, Stopper,
};
use crate::error::{ErrorKind, NetError, NetResult};
use crate::net::{TcpMessageSocket, UdpMessageSocket};
use crate::plugin::{ClientPluginRegistry, Continuation, HandlerAction};
use crate::protocol::{self, CoreMessage, ProtocolStatus};
use crate::wire::buffer::BufferRef;
use crate::wire::cursor::{MessageWriter, WireRead};
use crate::wire::MessageBuffer;
use crate::{ClientId, MessageId};
use self::frontend::{frontend_pipe, FrontendEnvelope, FrontendReceiver, FrontendSender};
use hashbrown::HashMap;
use keel::logging::{self, Logger};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

const UDP_CONNECT_INTERVAL: Duration = Duration::from_millis(100);
const MAX_UDP_CONNECT_ATTEMPTS: u32 = 10;
const PING_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ClientState {
    ReadingPasswordRequest,
    ReadingMessageId,
    ReadingMessageBody,
    HandlingPluginMessage,
    Disconnected,
}

enum PendingBody {
    None,
    Core {
        message: CoreMessage,
        min_unread: usize,
    },
    ConnectNotificationTail {
        id: ClientId,
        name: String,
        count: usize,
    },
    Plugin {
        plugin_index: usize,
        message_index: u16,
        min_unread: usize,
        cont: Option<Continuation>,
    },
    Forward {
        message_id: MessageId,
        size: usize,
    },
}

/// Another client connected to the same server.
pub struct RemoteClient {
    pub id: ClientId,
    pub name: String,
    /// Local indices of the plug-ins this remote participates in.
    pub plugin_indices: Vec<usize>,
    plugin_states: Vec<Option<Box<dyn std::any::Any>>>,
}

/// Thread-safe send surface handed to plug-in worker threads and the
/// front end. Messages queued here hop into the dispatcher thread via a
/// signal and onto the socket's send queue there.
#[derive(Clone)]
pub struct ClientHandle {
    sender: SignalSender,
    message_key: ListenerKey,
    udp_message_key: ListenerKey,
    stopper: Stopper,
}

impl ClientHandle {
    pub fn queue_server_message(&self, message: MessageBuffer) {
        self.sender.signal(self.message_key, Box::new(message));
    }

    pub fn queue_server_udp_message(&self, message: MessageBuffer) {
        self.sender.signal(self.udp_message_key, Box::new(message));
    }

    /// Stops the client's dispatcher from any thread.
    pub fn stop(&self) {
        self.stopper.stop();
    }
}

pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub session_password: String,
    pub client_name: String,
}

/// The back-end state plug-ins operate on.
pub struct ClientCore {
    log: Logger,
    state: ClientState,
    socket: TcpMessageSocket,
    socket_key: ListenerKey,
    udp: UdpMessageSocket,
    udp_key: ListenerKey,
    udp_server_address: SocketAddr,
    udp_ticket: u32,
    udp_connected: bool,
    udp_attempts: u32,
    want_udp_handshake: bool,
    server_address: String,
    server_name: String,
    session_password: String,
    client_name: String,
    id: ClientId,
    remote_clients: HashMap<ClientId, RemoteClient>,
    remote_order: Vec<ClientId>,
    body: PendingBody,
    frontend: Option<FrontendSender>,
    forwarders: HashMap<MessageId, usize>,
    handle: Option<ClientHandle>,
    mask_dirty: Vec<(ListenerKey, Mask)>,
    disconnected: bool,
    last_ping_sequence: i16,
    last_ping_time: Option<Instant>,
}

pub struct Client {
    core: ClientCore,
    plugins: ClientPluginRegistry,
}

impl Client {
    /// Resolves the server address, opens the TCP connection and binds
    /// the UDP socket.
    pub fn new(config: ClientConfig, log: &Logger) -> std::io::Result<Client> {
        let server_address = (config.server_host.as_str(), config.server_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "cannot resolve server host")
            })?;

        let socket = TcpMessageSocket::connect(server_address)?;
        let udp = UdpMessageSocket::bind("0.0.0.0:0".parse().expect("Malformed bind address"))?;

        Ok(Client {
            core: ClientCore {
                log: log.new(logging::o!()),
                state: ClientState::ReadingPasswordRequest,
                socket,
                socket_key: 0,
                udp,
                udp_key: 0,
                udp_server_address: server_address,
                udp_ticket: 0,
                udp_connected: false,
                udp_attempts: 0,
                want_udp_handshake: false,
                server_address: server_address.to_string(),
                server_name: String::new(),
                session_password: config.session_password,
                client_name: config.client_name,
                id: 0,
                remote_clients: HashMap::new(),
                remote_order: Vec::new(),
                body: PendingBody::None,
                frontend: None,
                forwarders: HashMap::new(),
                handle: None,
                mask_dirty: Vec::new(),
                disconnected: false,
                last_ping_sequence: 0,
                last_ping_time: None,
            },
            plugins: ClientPluginRegistry::new(),
        })
    }

    /// Adds a plug-in to be requested during the handshake. Must be
    /// called before the dispatcher runs.
    pub fn add_plugin(&mut self, plugin: Box<dyn crate::plugin::ClientPlugin>) -> usize {
        self.plugins.add(plugin)
    }

    pub fn core(&self) -> &ClientCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ClientCore {
        &mut self.core
    }

    pub fn registry(&self) -> &ClientPluginRegistry {
        &self.plugins
    }

    pub fn registry_mut(&mut self) -> &mut ClientPluginRegistry {
        &mut self.plugins
    }

    /// Downcast access to an installed plug-in by name.
    pub fn plugin_mut<T: 'static>(&mut self, name: &str) -> Option<&mut T> {
        let index = self
            .plugins
            .iter()
            .position(|entry| entry.plugin.name() == name)?;
        self.plugins
            .entry_mut(index)
            .plugin
            .as_any_mut()
            .downcast_mut::<T>()
    }

    /// Runs a closure with both a plug-in and the core borrowed, for
    /// callers outside the dispatcher's callbacks.
    pub fn with_plugin<T: 'static, R>(
        &mut self,
        name: &str,
        operation: impl FnOnce(&mut T, &mut ClientCore) -> R,
    ) -> Option<R> {
        let index = self
            .plugins
            .iter()
            .position(|entry| entry.plugin.name() == name)?;
        let plugin = self
            .plugins
            .entry_mut(index)
            .plugin
            .as_any_mut()
            .downcast_mut::<T>()?;
        Some(operation(plugin, &mut self.core))
    }

    /// Applies send-queue interest changes requested outside a
    /// dispatcher callback (callbacks flush these automatically).
    pub fn flush_pending_masks(&mut self, dispatcher: &mut Dispatcher<Client>) {
        for (key, mask) in self.core.mask_dirty.drain(..) {
            dispatcher.set_io_mask(key, mask);
        }
    }

    /// True once the connection has been lost or rejected.
    pub fn was_disconnected(&self) -> bool {
        self.core.disconnected
    }

    /// Establishes the front-end pipe and returns its receiving end.
    pub fn enable_frontend(&mut self) -> FrontendReceiver {
        let (sender, receiver) = frontend_pipe();
        self.core.frontend = Some(sender);
        receiver
    }

    /// The thread-safe send handle. Available after `attach`.
    pub fn handle(&self) -> ClientHandle {
        self.core
            .handle
            .clone()
            .expect("Client handle requested before attach")
    }

    /// Registers sockets, signal listeners and the ping timer.
    pub fn attach(&mut self, dispatcher: &mut Dispatcher<Client>) {
        let socket_fd = self.core.socket.raw_fd();
        self.core.socket_key =
            dispatcher.add_io_listener(socket_fd, Mask::READ, |client, api, event| {
                if let Event::Io(mask) = event {
                    client.session_io(api, mask);
                }
                false
            });

        let udp_fd = self.core.udp.raw_fd();
        self.core.udp_key = dispatcher.add_io_listener(udp_fd, Mask::READ, |client, api, event| {
            if let Event::Io(mask) = event {
                client.udp_io(api, mask);
            }
            false
        });

        let message_key = dispatcher.add_signal_listener(|client, api, event| {
            if let Event::Signal(payload) = event {
                if let Ok(message) = payload.downcast::<MessageBuffer>() {
                    client.core.queue_server_message((*message).into_shared());
                }
            }
            client.flush_masks(api);
            false
        });

        let udp_message_key = dispatcher.add_signal_listener(|client, api, event| {
            if let Event::Signal(payload) = event {
                if let Ok(message) = payload.downcast::<MessageBuffer>() {
                    client.core.queue_server_udp_message((*message).into_shared());
                }
            }
            client.flush_masks(api);
            false
        });

        dispatcher.add_timer(PING_INTERVAL, PING_INTERVAL, |client, api, _| {
            if client.core.state == ClientState::Disconnected {
                return true;
            }
            if client.core.state == ClientState::ReadingPasswordRequest {
                return false;
            }
            client.core.last_ping_sequence = client.core.last_ping_sequence.wrapping_add(1);
            client.core.last_ping_time = Some(Instant::now());
            let ping = protocol::create_ping(
                CoreMessage::PingRequest.id(),
                client.core.last_ping_sequence,
            );
            client.core.queue_server_message(ping.into_shared());
            client.flush_masks(api);
            false
        });

        self.core.handle = Some(ClientHandle {
            sender: dispatcher.signal_sender(),
            message_key,
            udp_message_key,
            stopper: dispatcher.stopper(),
        });
    }

    /// Queues an orderly disconnect request to the server.
    pub fn queue_disconnect_request(&mut self) {
        let request =
            MessageBuffer::create(CoreMessage::DisconnectRequest.id(), 0).into_shared();
        self.core.queue_server_message(request);
    }

    fn flush_masks(&mut self, api: &mut Api<Client>) {
        for (key, mask) in self.core.mask_dirty.drain(..) {
            api.set_io_mask(key, mask);
        }
    }

    fn fail(&mut self, api: &mut Api<Client>, kind: ErrorKind) {
        if self.core.state == ClientState::Disconnected {
            return;
        }
        logging::error!(self.core.log, "disconnected from server";
                        "server" => &self.core.server_address,
                        "error" => %kind);
        self.core.state = ClientState::Disconnected;
        self.core.disconnected = true;
        api.stop();
    }

    fn session_io(&mut self, api: &mut Api<Client>, ready: Mask) {
        if self.core.state == ClientState::Disconnected {
            return;
        }

        if ready.readable() {
            match self.session_read() {
                Err(NetError::Fatal(kind)) => {
                    self.fail(api, kind);
                }
                _ => {
                    if self.core.state != ClientState::Disconnected && self.core.socket.eof() {
                        self.fail(api, ErrorKind::PeerClosed);
                    }
                }
            }
        }

        if ready.writable() && self.core.state != ClientState::Disconnected {
            match self.core.socket.write_to_socket() {
                Ok(0) => {
                    let key = self.core.socket_key;
                    self.core.mask_dirty.push((key, Mask::READ));
                }
                Ok(_) => {}
                Err(NetError::Fatal(kind)) => self.fail(api, kind),
                Err(NetError::Wait) => {}
            }
        }

        if self.core.want_udp_handshake {
            self.core.want_udp_handshake = false;
            self.start_udp_handshake(api);
        }
        self.flush_masks(api);
    }

    fn session_read(&mut self) -> NetResult<()> {
        loop {
            let before = self.core.socket.unread();
            let newly = self.core.socket.read_from_socket()? - before;
            loop {
                match self.process_step() {
                    Ok(true) => {}
                    Ok(false) | Err(NetError::Wait) => break,
                    Err(fatal) => return Err(fatal),
                }
                if self.core.state == ClientState::Disconnected {
                    return Ok(());
                }
            }
            if newly == 0 {
                return Ok(());
            }
        }
    }

    fn process_step(&mut self) -> NetResult<bool> {
        match self.core.state {
            ClientState::ReadingPasswordRequest => self.step_password_request(),
            ClientState::ReadingMessageId => self.step_message_id(),
            ClientState::ReadingMessageBody | ClientState::HandlingPluginMessage => {
                self.step_message_body()
            }
            ClientState::Disconnected => Ok(false),
        }
    }

    fn step_password_request(&mut self) -> NetResult<bool> {
        // The password request is the only message expected before the
        // message-ID loop starts, so the header is part of the check.
        if self.core.socket.unread() < 2 + protocol::PASSWORD_REQUEST_SIZE {
            return Ok(false);
        }

        let raw_id = self.core.socket.read_u16()?;
        let marker = self.core.socket.read_u32()?;
        if marker == protocol::ENDIANNESS_MARKER_SWAPPED {
            self.core.socket.set_swap_on_read(true);
        } else if marker != protocol::ENDIANNESS_MARKER {
            return Err(NetError::Fatal(ErrorKind::MalformedHandshake));
        }
        let expected_id = if self.core.socket.swap_on_read() {
            CoreMessage::PasswordRequest.id().swap_bytes()
        } else {
            CoreMessage::PasswordRequest.id()
        };
        if raw_id != expected_id {
            return Err(NetError::Fatal(ErrorKind::MalformedHandshake));
        }

        let version = self.core.socket.read_u32()?;
        if version != protocol::PROTOCOL_VERSION {
            return Err(NetError::Fatal(ErrorKind::WrongVersion));
        }
        let mut nonce = [0u8; protocol::NONCE_LEN];
        self.core.socket.fetch(&mut nonce)?;

        let hash = keel::digest::session_hash(&nonce, &self.core.session_password);

        let num_protocols = self.plugins.len();
        let mut request = MessageWriter::with_capacity(
            CoreMessage::ConnectRequest.id(),
            protocol::CONNECT_REQUEST_PREFIX_SIZE
                + num_protocols * protocol::PROTOCOL_REQUEST_SIZE,
        );
        request.write_u32(protocol::ENDIANNESS_MARKER)?;
        request.write_u32(protocol::PROTOCOL_VERSION)?;
        request.write_bytes(&hash)?;
        protocol::write_name_field(&mut request, &self.core.client_name)?;
        request.write_u16(num_protocols as u16)?;
        for entry in self.plugins.iter() {
            protocol::write_name_field(&mut request, entry.plugin.name())?;
            request.write_u32(entry.plugin.version())?;
        }
        self.core.queue_server_message(request.into_shared());

        self.core.state = ClientState::ReadingMessageId;
        Ok(true)
    }

    fn step_message_id(&mut self) -> NetResult<bool> {
        if self.core.socket.unread() < 2 {
            return Ok(false);
        }
        let message_id = self.core.socket.read_u16()?;

        if message_id < protocol::NUM_CORE_MESSAGES {
            let (message, min_unread) = match message_id {
                id if id == CoreMessage::ConnectReply.id() => (
                    CoreMessage::ConnectReply,
                    protocol::CONNECT_REPLY_PREFIX_SIZE
                        + self.plugins.len() * protocol::PROTOCOL_REPLY_SIZE,
                ),
                id if id == CoreMessage::ConnectReject.id() => {
                    logging::error!(self.core.log, "connection rejected by server";
                                    "server" => &self.core.server_address);
                    return Err(NetError::Fatal(ErrorKind::WrongPassword));
                }
                id if id == CoreMessage::PingRequest.id() => {
                    (CoreMessage::PingRequest, protocol::PING_SIZE)
                }
                id if id == CoreMessage::PingReply.id() => {
                    (CoreMessage::PingReply, protocol::PING_SIZE)
                }
                id if id == CoreMessage::NameChangeReply.id() => (
                    CoreMessage::NameChangeReply,
                    protocol::NAME_CHANGE_REPLY_SIZE,
                ),
                id if id == CoreMessage::NameChangeNotification.id() => (
                    CoreMessage::NameChangeNotification,
                    protocol::NAME_CHANGE_NOTIFICATION_SIZE,
                ),
                id if id == CoreMessage::ClientConnectNotification.id() => (
                    CoreMessage::ClientConnectNotification,
                    protocol::CLIENT_CONNECT_NOTIFICATION_PREFIX_SIZE,
                ),
                id if id == CoreMessage::ClientDisconnectNotification.id() => (
                    CoreMessage::ClientDisconnectNotification,
                    protocol::CLIENT_DISCONNECT_NOTIFICATION_SIZE,
                ),
                _ => return Err(NetError::Fatal(ErrorKind::UnknownMessage(message_id))),
            };
            self.core.body = PendingBody::Core { message, min_unread };
            self.core.state = ClientState::ReadingMessageBody;
            return Ok(true);
        }

        if let Some(&size) = self.core.forwarders.get(&message_id) {
            self.core.body = PendingBody::Forward { message_id, size };
            self.core.state = ClientState::ReadingMessageBody;
            return Ok(true);
        }

        match self.plugins.route_server_message(message_id) {
            Some((plugin_index, message_index)) => {
                let min_unread = self
                    .plugins
                    .entry(plugin_index)
                    .plugin
                    .tcp_min_unread(message_index);
                self.core.body = PendingBody::Plugin {
                    plugin_index,
                    message_index,
                    min_unread,
                    cont: None,
                };
                self.core.state = ClientState::ReadingMessageBody;
                Ok(true)
            }
            None => Err(NetError::Fatal(ErrorKind::UnknownMessage(message_id))),
        }
    }

    fn step_message_body(&mut self) -> NetResult<bool> {
        let unread = self.core.socket.unread();

        enum Dispatch {
            NotYet,
            Core(CoreMessage),
            Tail {
                id: ClientId,
                name: String,
                count: usize,
            },
            Plugin {
                plugin_index: usize,
                message_index: u16,
                cont: Option<Continuation>,
            },
            Forward {
                message_id: MessageId,
                size: usize,
            },
        }

        let dispatch = match &mut self.core.body {
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
            PendingBody::ConnectNotificationTail { count, .. } if unread < *count * 2 => {
                Dispatch::NotYet
            }
            PendingBody::ConnectNotificationTail { .. } => {
                match std::mem::replace(&mut self.core.body, PendingBody::None) {
                    PendingBody::ConnectNotificationTail { id, name, count } => {
                        Dispatch::Tail { id, name, count }
                    }
                    _ => unreachable!(),
                }
            }
            PendingBody::Plugin { min_unread, .. } if unread < *min_unread => Dispatch::NotYet,
            PendingBody::Plugin { .. } => {
                match std::mem::replace(&mut self.core.body, PendingBody::None) {
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
            PendingBody::Forward { message_id, size } => {
                if unread < *size {
                    Dispatch::NotYet
                } else {
                    Dispatch::Forward {
                        message_id: *message_id,
                        size: *size,
                    }
                }
            }
        };

        match dispatch {
            Dispatch::NotYet => Ok(false),
            Dispatch::Core(message) => {
                self.handle_core_body(message)?;
                if self.core.state == ClientState::ReadingMessageBody {
                    // Unless a handler installed a follow-up body, the
                    // next thing on the stream is a message ID.
                    if matches!(self.core.body, PendingBody::None) {
                        self.core.state = ClientState::ReadingMessageId;
                    }
                }
                Ok(true)
            }
            Dispatch::Tail { id, name, count } => {
                let mut server_indices = Vec::with_capacity(count);
                for _ in 0..count {
                    server_indices.push(self.core.socket.read_u16()?);
                }
                self.finish_client_connect(id, name, &server_indices)?;
                self.core.state = ClientState::ReadingMessageId;
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
                    .handle_tcp_message(&mut self.core, message_index, cont)
                    .map_err(|err| match err {
                        NetError::Wait => NetError::Fatal(ErrorKind::Truncated),
                        fatal => fatal,
                    })?;
                match action {
                    HandlerAction::Done => {
                        self.core.state = ClientState::ReadingMessageId;
                    }
                    HandlerAction::NeedMore { min_unread, cont } => {
                        self.core.body = PendingBody::Plugin {
                            plugin_index,
                            message_index,
                            min_unread,
                            cont: Some(cont),
                        };
                        self.core.state = ClientState::HandlingPluginMessage;
                    }
                }
                Ok(true)
            }
            Dispatch::Forward { message_id, size } => {
                let mut buffer = MessageBuffer::create(message_id, size);
                self.core.socket.fetch(buffer.body_mut())?;
                let swap = self.core.socket.swap_on_read();
                self.core.queue_frontend_message(buffer, swap);
                self.core.state = ClientState::ReadingMessageId;
                Ok(true)
            }
        }
    }

    fn handle_core_body(&mut self, message: CoreMessage) -> NetResult<()> {
        self.core.body = PendingBody::None;
        match message {
            CoreMessage::ConnectReply => self.handle_connect_reply(),
            CoreMessage::PingRequest => {
                let (sequence, _, _) = protocol::read_ping(&mut self.core.socket)?;
                let reply =
                    protocol::create_ping(CoreMessage::PingReply.id(), sequence).into_shared();
                self.core.queue_server_message(reply);
                Ok(())
            }
            CoreMessage::PingReply => {
                let (sequence, _, _) = protocol::read_ping(&mut self.core.socket)?;
                if sequence == self.core.last_ping_sequence {
                    if let Some(sent) = self.core.last_ping_time.take() {
                        logging::debug!(self.core.log, "ping";
                                        "rtt_us" => sent.elapsed().as_micros() as u64);
                    }
                }
                Ok(())
            }
            CoreMessage::NameChangeReply => {
                let granted = self.core.socket.read_u8()? != 0;
                let field = protocol::read_name_field(&mut self.core.socket)?;
                if let Some(name) = protocol::decode_name(&field) {
                    if granted {
                        logging::info!(self.core.log, "name changed";
                                       "old" => &self.core.client_name, "new" => &name);
                        self.core.client_name = name;
                    } else {
                        logging::warn!(self.core.log, "name change denied");
                    }
                }
                Ok(())
            }
            CoreMessage::NameChangeNotification => {
                let id = self.core.socket.read_u16()?;
                let field = protocol::read_name_field(&mut self.core.socket)?;
                if let (Some(name), Some(remote)) = (
                    protocol::decode_name(&field),
                    self.core.remote_clients.get_mut(&id),
                ) {
                    logging::info!(self.core.log, "remote client renamed";
                                   "old" => &remote.name, "new" => &name);
                    remote.name = name;
                }
                Ok(())
            }
            CoreMessage::ClientConnectNotification => {
                let id = self.core.socket.read_u16()?;
                let field = protocol::read_name_field(&mut self.core.socket)?;
                let name = protocol::decode_name(&field).unwrap_or_default();
                let count = self.core.socket.read_u16()? as usize;
                if count > 0 {
                    self.core.body = PendingBody::ConnectNotificationTail { id, name, count };
                } else {
                    self.finish_client_connect(id, name, &[])?;
                }
                Ok(())
            }
            CoreMessage::ClientDisconnectNotification => {
                let id = self.core.socket.read_u16()?;
                self.finish_client_disconnect(id)
            }
            _ => Err(NetError::Fatal(ErrorKind::UnknownMessage(message.id()))),
        }
    }

    fn handle_connect_reply(&mut self) -> NetResult<()> {
        let server_name_field = protocol::read_name_field(&mut self.core.socket)?;
        self.core.server_name = protocol::decode_name(&server_name_field).unwrap_or_default();
        self.core.id = self.core.socket.read_u16()?;
        let my_name_field = protocol::read_name_field(&mut self.core.socket)?;
        if let Some(name) = protocol::decode_name(&my_name_field) {
            self.core.client_name = name;
        }
        self.core.udp_ticket = self.core.socket.read_u32()?;
        let num_replies = self.core.socket.read_u16()? as usize;
        if num_replies != self.plugins.len() {
            return Err(NetError::Fatal(ErrorKind::MalformedHandshake));
        }

        for index in 0..num_replies {
            let status = self.core.socket.read_u8()?;
            let _version = self.core.socket.read_u32()?;
            let server_index = self.core.socket.read_u16()?;
            let client_base = self.core.socket.read_u16()?;
            let server_base = self.core.socket.read_u16()?;

            match ProtocolStatus::from_u8(status) {
                Some(ProtocolStatus::Success) => {
                    let entry = self.plugins.entry_mut(index);
                    entry.confirmed = true;
                    entry.client_base = client_base;
                    entry.server_base = server_base;
                    entry.server_index = server_index;
                    entry.plugin.set_message_bases(client_base, server_base);
                }
                Some(ProtocolStatus::UnknownProtocol) => {
                    logging::warn!(self.core.log, "server does not know protocol";
                                   "protocol" => self.plugins.entry(index).plugin.name());
                }
                Some(ProtocolStatus::WrongVersion) => {
                    logging::warn!(self.core.log, "server rejected protocol version";
                                   "protocol" => self.plugins.entry(index).plugin.name());
                }
                None => return Err(NetError::Fatal(ErrorKind::MalformedHandshake)),
            }
        }
        self.plugins.prune_unconfirmed();

        for index in 0..self.plugins.len() {
            self.plugins
                .entry_mut(index)
                .plugin
                .start(&mut self.core);
        }

        logging::info!(self.core.log, "connected";
                       "server" => &self.core.server_name,
                       "client_id" => self.core.id,
                       "client_name" => &self.core.client_name);

        self.core.want_udp_handshake = true;
        Ok(())
    }

    fn finish_client_connect(
        &mut self,
        id: ClientId,
        name: String,
        server_indices: &[u16],
    ) -> NetResult<()> {
        let local_indices: Vec<usize> = server_indices
            .iter()
            .filter_map(|&server_index| self.plugins.local_index_for_server(server_index))
            .collect();

        logging::info!(self.core.log, "remote client connected";
                       "client_id" => id, "name" => &name);

        self.core.remote_clients.insert(
            id,
            RemoteClient {
                id,
                name,
                plugin_indices: local_indices.clone(),
                plugin_states: Vec::new(),
            },
        );
        self.core.remote_order.push(id);

        for index in local_indices {
            self.plugins
                .entry_mut(index)
                .plugin
                .remote_client_connected(&mut self.core, id);
        }
        Ok(())
    }

    fn finish_client_disconnect(&mut self, id: ClientId) -> NetResult<()> {
        let local_indices = self
            .core
            .remote_clients
            .get(&id)
            .map(|remote| remote.plugin_indices.clone())
            .unwrap_or_default();

        for &index in local_indices.iter().rev() {
            self.plugins
                .entry_mut(index)
                .plugin
                .remote_client_disconnected(&mut self.core, id);
        }

        if let Some(remote) = self.core.remote_clients.remove(&id) {
            logging::info!(self.core.log, "remote client disconnected";
                           "client_id" => id, "name" => &remote.name);
        }
        self.core.remote_order.retain(|&other| other != id);
        Ok(())
    }

    fn start_udp_handshake(&mut self, api: &mut Api<Client>) {
        self.core.udp_attempts = 0;
        api.add_timer(Duration::ZERO, UDP_CONNECT_INTERVAL, |client, api, _| {
            if client.core.udp_connected || client.core.state == ClientState::Disconnected {
                return true;
            }
            if client.core.udp_attempts >= MAX_UDP_CONNECT_ATTEMPTS {
                logging::warn!(client.core.log,
                               "no UDP connectivity, falling back to TCP only");
                return true;
            }
            client.core.udp_attempts += 1;

            let mut request = MessageWriter::with_capacity(
                CoreMessage::UdpConnectRequest.id(),
                protocol::UDP_CONNECT_REQUEST_SIZE,
            );
            request
                .write_u16(client.core.id)
                .and_then(|_| request.write_u32(client.core.udp_ticket))
                .expect("Request size mismatch");
            client.core.queue_server_udp_message(request.into_shared());
            client.flush_masks(api);
            false
        });
    }

    fn udp_io(&mut self, api: &mut Api<Client>, ready: Mask) {
        if ready.readable() {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                match self.core.udp.read_datagram(&mut buffer) {
                    Ok(Some((length, sender))) => {
                        if sender == self.core.udp_server_address {
                            self.handle_datagram(&buffer[..length]);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
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

    fn handle_datagram(&mut self, bytes: &[u8]) {
        if bytes.len() < 2 {
            logging::debug!(self.core.log, "dropping short datagram");
            return;
        }
        let swap = self.core.socket.swap_on_read();
        let mut reader = crate::wire::cursor::MessageReader::over_bytes(bytes, swap);
        let message_id = match reader.read_u16() {
            Ok(message_id) => message_id,
            Err(_) => return,
        };

        if message_id == CoreMessage::UdpConnectReply.id() {
            if let Ok(ticket) = reader.read_u32() {
                if ticket == self.core.udp_ticket && !self.core.udp_connected {
                    self.core.udp_connected = true;
                    logging::info!(self.core.log, "UDP connection established");
                }
            }
            return;
        }
        if message_id == CoreMessage::PingReply.id() {
            if let Ok((sequence, _, _)) = protocol::read_ping(&mut reader) {
                logging::debug!(self.core.log, "UDP ping reply"; "sequence" => sequence);
            }
            return;
        }

        match self.plugins.route_server_message(message_id) {
            Some((plugin_index, message_index)) => {
                let result = self
                    .plugins
                    .entry_mut(plugin_index)
                    .plugin
                    .handle_udp_message(&mut self.core, message_index, &mut reader);
                if let Err(err) = result {
                    logging::warn!(self.core.log, "bad datagram"; "error" => %err);
                }
            }
            None => {
                logging::warn!(self.core.log, "datagram with unknown message ID";
                               "message_id" => message_id);
            }
        }
    }
}

impl ClientCore {
    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn client_id(&self) -> ClientId {
        self.id
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn swap_on_read(&self) -> bool {
        self.socket.swap_on_read()
    }

    pub fn have_udp(&self) -> bool {
        self.udp_connected
    }

    pub fn have_frontend(&self) -> bool {
        self.frontend.is_some()
    }

    /// The client's TCP socket, for message-handler reads.
    pub fn socket_mut(&mut self) -> &mut TcpMessageSocket {
        &mut self.socket
    }

    /// Queues a message for the server on the TCP socket.
    pub fn queue_server_message(&mut self, message: BufferRef) {
        if self.socket.queue_message(message) == 0 {
            self.mask_dirty.push((self.socket_key, Mask::READ_WRITE));
        }
    }

    /// Queues a datagram for the server.
    pub fn queue_server_udp_message(&mut self, message: BufferRef) {
        if self.udp.queue_datagram(self.udp_server_address, message) == 0 {
            self.mask_dirty.push((self.udp_key, Mask::READ_WRITE));
        }
    }

    /// Installs a fixed-size front-end forwarder for a message ID: the
    /// back end reads the body into a fresh buffer and ships it through
    /// the pipe.
    pub fn set_message_forwarder(&mut self, message_id: MessageId, fixed_size: usize) {
        self.forwarders.insert(message_id, fixed_size);
    }

    /// Sends a buffer to the front end, transferring ownership.
    pub fn queue_frontend_message(&mut self, buffer: MessageBuffer, swap_on_read: bool) {
        if let Some(frontend) = &self.frontend {
            frontend.send(FrontendEnvelope {
                buffer,
                swap_on_read,
            });
        }
    }

    /// Requests a different client name from the server.
    pub fn request_name_change(&mut self, name: &str) -> NetResult<()> {
        let mut request = MessageWriter::with_capacity(
            CoreMessage::NameChangeRequest.id(),
            protocol::NAME_CHANGE_REQUEST_SIZE,
        );
        protocol::write_name_field(&mut request, name)?;
        self.queue_server_message(request.into_shared());
        Ok(())
    }

    /// The thread-safe send handle.
    pub fn handle(&self) -> ClientHandle {
        self.handle
            .clone()
            .expect("Client handle requested before attach")
    }

    pub fn remote_clients(&self) -> impl Iterator<Item = &RemoteClient> {
        self.remote_order
            .iter()
            .filter_map(move |id| self.remote_clients.get(id))
    }

    pub fn remote_client(&self, id: ClientId) -> Option<&RemoteClient> {
        self.remote_clients.get(&id)
    }

    /// Per-remote opaque plug-in state.
    pub fn remote_plugin_state_mut(
        &mut self,
        id: ClientId,
        plugin_index: usize,
    ) -> Option<&mut Box<dyn std::any::Any>> {
        self.remote_clients
            .get_mut(&id)
            .and_then(|remote| remote.plugin_states.get_mut(plugin_index))
            .and_then(|slot| slot.as_mut())
    }

    pub fn set_remote_plugin_state(
        &mut self,
        id: ClientId,
        plugin_index: usize,
        state: Box<dyn std::any::Any>,
    ) {
        if let Some(remote) = self.remote_clients.get_mut(&id) {
            if remote.plugin_states.len() <= plugin_index {
                remote.plugin_states.resize_with(plugin_index + 1, || None);
            }
            remote.plugin_states[plugin_index] = Some(state);
        }
    }

    pub fn take_remote_plugin_state(
        &mut self,
        id: ClientId,
        plugin_index: usize,
    ) -> Option<Box<dyn std::any::Any>> {
        self.remote_clients
            .get_mut(&id)
            .and_then(|remote| remote.plugin_states.get_mut(plugin_index))
            .and_then(|slot| slot.take())
    }
}
