//! Plug-in protocol registration and message-ID range allocation.
//!
//! A plug-in protocol is identified by `(name, major version)`; minor
//! versions must be accepted. Each side keeps its own registry of
//! singleton plug-in instances; the server allocates the client- and
//! server-originated message-ID ranges and reports them during
//! negotiation. The framework talks to plug-ins exclusively through the
//! capability traits below and never reaches into their state.

use crate::client::ClientCore;
use crate::error::NetResult;
use crate::protocol::NUM_CORE_MESSAGES;
use crate::server::ServerCore;
use crate::wire::cursor::MessageReader;
use crate::{ClientId, MessageId};
use std::any::Any;

/// Major half of a plug-in protocol version.
pub fn version_major(version: u32) -> u16 {
    (version >> 16) as u16
}

pub fn make_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

/// Opaque state carried across invocations of a partially-processed
/// message handler.
pub type Continuation = Box<dyn Any>;

/// Outcome of a TCP message handler invocation.
pub enum HandlerAction {
    /// The message has been consumed completely.
    Done,
    /// The handler needs at least `min_unread` more buffered bytes; it
    /// will be re-invoked with `cont` once they are available.
    NeedMore {
        min_unread: usize,
        cont: Continuation,
    },
}

/// Server half of a plug-in protocol.
pub trait ServerPlugin {
    fn name(&self) -> &str;
    fn version(&self) -> u32;
    fn num_client_messages(&self) -> u16;
    fn num_server_messages(&self) -> u16;

    /// Informs the plug-in of its negotiated message-ID ranges.
    fn set_message_bases(&mut self, client_base: MessageId, server_base: MessageId);

    /// Informs the plug-in of its registry index, which also keys the
    /// per-client plug-in state slots.
    fn set_index(&mut self, index: usize) {
        let _ = index;
    }

    /// Called once, after the plug-in has been loaded and its bases
    /// assigned.
    fn start(&mut self, core: &mut ServerCore);

    /// Called when a client participating in this protocol has
    /// completed its connection handshake.
    fn client_connected(&mut self, core: &mut ServerCore, client_id: ClientId);

    /// Called exactly once per participating client, in reverse
    /// registration order, before the client's session state is freed.
    fn client_disconnected(&mut self, core: &mut ServerCore, client_id: ClientId);

    /// Minimum buffered body bytes before the TCP handler for the given
    /// message index is first invoked.
    fn tcp_min_unread(&self, message_index: u16) -> usize;

    /// Handles a client-originated TCP message. The body is read from
    /// the client's socket via `core`.
    fn handle_tcp_message(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        message_index: u16,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction>;

    /// Handles a client-originated datagram, fully available up front.
    fn handle_udp_message(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        message_index: u16,
        reader: &mut MessageReader,
    ) -> NetResult<()>;

    /// Offers a console command to the plug-in; returns true if it was
    /// handled.
    fn console_command(&mut self, core: &mut ServerCore, command: &str, args: &[&str]) -> bool {
        let _ = (core, command, args);
        false
    }
}

/// Client half of a plug-in protocol.
pub trait ClientPlugin {
    /// Downcast access for the application that installed the plug-in.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn name(&self) -> &str;
    fn version(&self) -> u32;
    fn num_client_messages(&self) -> u16;
    fn num_server_messages(&self) -> u16;

    fn set_message_bases(&mut self, client_base: MessageId, server_base: MessageId);

    /// Called when the server denied the protocol request; the plug-in
    /// is dropped from the client's list afterwards.
    fn rejected(&mut self) {}

    /// Called after a successful negotiation, with the bases assigned.
    fn start(&mut self, core: &mut ClientCore);

    fn remote_client_connected(&mut self, core: &mut ClientCore, client_id: ClientId);
    fn remote_client_disconnected(&mut self, core: &mut ClientCore, client_id: ClientId);

    fn tcp_min_unread(&self, message_index: u16) -> usize;

    /// Handles a server-originated TCP message read from the client's
    /// socket.
    fn handle_tcp_message(
        &mut self,
        core: &mut ClientCore,
        message_index: u16,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction>;

    /// Handles a server-originated datagram.
    fn handle_udp_message(
        &mut self,
        core: &mut ClientCore,
        message_index: u16,
        reader: &mut MessageReader,
    ) -> NetResult<()>;
}

/// One admitted server-side plug-in with its allocated ID ranges. An
/// unloaded plug-in keeps its slot (indices and ID ranges stay stable)
/// but no longer matches requests or routes messages.
pub struct ServerPluginEntry {
    pub plugin: Box<dyn ServerPlugin>,
    pub client_base: MessageId,
    pub server_base: MessageId,
    pub active: bool,
}

type ServerPluginFactory = Box<dyn Fn(&str, u32) -> Option<Box<dyn ServerPlugin>>>;

/// Outcome of a server-side protocol request.
pub enum PluginRequest {
    Granted(usize),
    WrongVersion,
    Unknown,
}

/// The server's process-wide plug-in registry. Loading is expressed as
/// factory probing: each registered factory may construct a plug-in for
/// a `(name, version)` pair it recognizes. Subsequent requests reuse the
/// already-loaded instance.
pub struct ServerPluginRegistry {
    entries: Vec<ServerPluginEntry>,
    factories: Vec<ServerPluginFactory>,
    next_client_base: MessageId,
    next_server_base: MessageId,
}

impl ServerPluginRegistry {
    pub fn new() -> ServerPluginRegistry {
        ServerPluginRegistry {
            entries: Vec::new(),
            factories: Vec::new(),
            next_client_base: NUM_CORE_MESSAGES,
            next_server_base: NUM_CORE_MESSAGES,
        }
    }

    pub fn add_factory<F>(&mut self, factory: F)
    where
        F: Fn(&str, u32) -> Option<Box<dyn ServerPlugin>> + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: usize) -> &ServerPluginEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut ServerPluginEntry {
        &mut self.entries[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerPluginEntry> {
        self.entries.iter()
    }

    /// Finds a loaded plug-in matching `(name, major)`.
    pub fn find(&self, name: &str, version: u32) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.active
                && entry.plugin.name() == name
                && version_major(entry.plugin.version()) == version_major(version)
        })
    }

    /// Finds a loaded plug-in by name alone.
    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.active && entry.plugin.name() == name)
    }

    /// Marks a plug-in unloaded; its slot and ID ranges remain
    /// reserved.
    pub fn unload(&mut self, index: usize) {
        self.entries[index].active = false;
    }

    /// Installs an already-constructed plug-in, allocating its ID
    /// ranges and starting it.
    pub fn add(&mut self, core: &mut ServerCore, mut plugin: Box<dyn ServerPlugin>) -> usize {
        let client_base = self.next_client_base;
        let server_base = self.next_server_base;
        self.next_client_base += plugin.num_client_messages();
        self.next_server_base += plugin.num_server_messages();
        plugin.set_message_bases(client_base, server_base);
        plugin.set_index(self.entries.len());

        self.entries.push(ServerPluginEntry {
            plugin,
            client_base,
            server_base,
            active: true,
        });
        let index = self.entries.len() - 1;
        // Plugin call re-borrows through the entry to keep the registry
        // consistent if start() itself requests plug-ins some day.
        self.entries[index].plugin.start(core);
        index
    }

    /// Resolves a protocol request: reuse a loaded instance, probe the
    /// factories, or deny.
    pub fn request(&mut self, core: &mut ServerCore, name: &str, version: u32) -> PluginRequest {
        if let Some(index) = self.find(name, version) {
            return PluginRequest::Granted(index);
        }
        if self
            .entries
            .iter()
            .any(|entry| entry.active && entry.plugin.name() == name)
        {
            return PluginRequest::WrongVersion;
        }

        for i in 0..self.factories.len() {
            if let Some(plugin) = self.factories[i](name, version) {
                return PluginRequest::Granted(self.add(core, plugin));
            }
        }
        PluginRequest::Unknown
    }

    /// Maps a client-originated message ID to `(plugin index, message
    /// index within the plug-in's range)`.
    pub fn route_client_message(&self, id: MessageId) -> Option<(usize, u16)> {
        self.entries.iter().enumerate().find_map(|(index, entry)| {
            let base = entry.client_base;
            if entry.active && id >= base && id < base + entry.plugin.num_client_messages() {
                Some((index, id - base))
            } else {
                None
            }
        })
    }
}

/// One requested or confirmed client-side plug-in. `server_index` is
/// the plug-in's index on the server, used to translate the
/// participation lists carried by presence notifications.
pub struct ClientPluginEntry {
    pub plugin: Box<dyn ClientPlugin>,
    pub client_base: MessageId,
    pub server_base: MessageId,
    pub server_index: u16,
    pub confirmed: bool,
}

/// The client's plug-in list: populated before connecting, bound or
/// pruned while the `ConnectReply` is processed.
pub struct ClientPluginRegistry {
    entries: Vec<ClientPluginEntry>,
}

impl ClientPluginRegistry {
    pub fn new() -> ClientPluginRegistry {
        ClientPluginRegistry {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: usize) -> &ClientPluginEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut ClientPluginEntry {
        &mut self.entries[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientPluginEntry> {
        self.entries.iter()
    }

    pub fn add(&mut self, plugin: Box<dyn ClientPlugin>) -> usize {
        self.entries.push(ClientPluginEntry {
            plugin,
            client_base: 0,
            server_base: 0,
            server_index: 0,
            confirmed: false,
        });
        self.entries.len() - 1
    }

    /// Translates a server-side plug-in index into the local index.
    pub fn local_index_for_server(&self, server_index: u16) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.confirmed && entry.server_index == server_index)
    }

    pub fn find(&self, name: &str, version: u32) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.plugin.name() == name
                && version_major(entry.plugin.version()) == version_major(version)
        })
    }

    /// Removes plug-ins the server denied, preserving order of the
    /// surviving ones.
    pub fn prune_unconfirmed(&mut self) {
        for entry in &mut self.entries {
            if !entry.confirmed {
                entry.plugin.rejected();
            }
        }
        self.entries.retain(|entry| entry.confirmed);
    }

    /// Maps a server-originated message ID to `(plugin index, message
    /// index)`.
    pub fn route_server_message(&self, id: MessageId) -> Option<(usize, u16)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.confirmed)
            .find_map(|(index, entry)| {
                let base = entry.server_base;
                if id >= base && id < base + entry.plugin.num_server_messages() {
                    Some((index, id - base))
                } else {
                    None
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_split() {
        let version = make_version(3, 7);
        assert_eq!(version, (3 << 16) | 7);
        assert_eq!(version_major(version), 3);
    }

    #[test]
    fn test_client_registry_routing_and_pruning() {
        struct Dummy {
            version: u32,
            server_base: MessageId,
        }
        impl ClientPlugin for Dummy {
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
            fn name(&self) -> &str {
                "Dummy"
            }
            fn version(&self) -> u32 {
                self.version
            }
            fn num_client_messages(&self) -> u16 {
                2
            }
            fn num_server_messages(&self) -> u16 {
                3
            }
            fn set_message_bases(&mut self, _client_base: MessageId, server_base: MessageId) {
                self.server_base = server_base;
            }
            fn start(&mut self, _core: &mut ClientCore) {}
            fn remote_client_connected(&mut self, _core: &mut ClientCore, _id: ClientId) {}
            fn remote_client_disconnected(&mut self, _core: &mut ClientCore, _id: ClientId) {}
            fn tcp_min_unread(&self, _index: u16) -> usize {
                0
            }
            fn handle_tcp_message(
                &mut self,
                _core: &mut ClientCore,
                _index: u16,
                _cont: Option<Continuation>,
            ) -> NetResult<HandlerAction> {
                Ok(HandlerAction::Done)
            }
            fn handle_udp_message(
                &mut self,
                _core: &mut ClientCore,
                _index: u16,
                _reader: &mut MessageReader,
            ) -> NetResult<()> {
                Ok(())
            }
        }

        let mut registry = ClientPluginRegistry::new();
        let confirmed = registry.add(Box::new(Dummy {
            version: make_version(1, 0),
            server_base: 0,
        }));
        registry.add(Box::new(Dummy {
            version: make_version(2, 0),
            server_base: 0,
        }));

        assert_eq!(registry.find("Dummy", make_version(1, 5)), Some(0));
        assert_eq!(registry.find("Dummy", make_version(3, 0)), None);

        {
            let entry = registry.entry_mut(confirmed);
            entry.confirmed = true;
            entry.server_base = 20;
            entry.plugin.set_message_bases(14, 20);
        }
        registry.prune_unconfirmed();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.route_server_message(21), Some((0, 1)));
        assert_eq!(registry.route_server_message(23), None);
        assert_eq!(registry.route_server_message(5), None);
    }
}
