//! Client half of the data-sharing protocol.
//!
//! Objects and namespaces may be requested before the connection
//! handshake has finished; those requests are held back and sent once
//! the negotiated message bases are known.

use crate::valuestream::{Progress, ValueBytesReader};
use crate::*;
use conduit::client::ClientCore;
use conduit::datatype::{DataType, TypeId, Value};
use conduit::error::{ErrorKind, NetError, NetResult};
use conduit::plugin::{ClientPlugin, Continuation, HandlerAction};
use conduit::wire::cursor::{MessageReader, MessageWriter, WireRead};
use conduit::wire::varint;
use conduit::wire::MessageBuffer;
use conduit::{ClientId, MessageId};
use hashbrown::HashMap;
use keel::logging::{self, Logger};
use std::any::Any;

/// Callback invoked when a remote replace lands on a shared object.
pub type UpdateCallback = Box<dyn FnMut(&Value)>;

/// Namespace activity reported to the application.
pub enum NamespaceEvent<'a> {
    ObjectCreated {
        object_id: ObjectId,
        type_id: TypeId,
        value: &'a Value,
    },
    ObjectReplaced {
        object_id: ObjectId,
        version: VersionNumber,
        value: &'a Value,
    },
    ObjectDestroyed {
        object_id: ObjectId,
    },
}

pub type NamespaceCallback = Box<dyn FnMut(NamespaceEvent)>;

struct ObjectSlot {
    name: String,
    dict: DataType,
    type_id: TypeId,
    server_id: ObjectId,
    version: VersionNumber,
    value: Value,
    proposed: Option<Value>,
    on_update: Option<UpdateCallback>,
}

struct NsObjectSlot {
    type_id: TypeId,
    version: VersionNumber,
    value: Value,
    proposed: Option<Value>,
}

struct NamespaceSlot {
    name: String,
    dict: DataType,
    server_id: NamespaceId,
    objects: HashMap<ObjectId, NsObjectSlot>,
    pending_creates: HashMap<ObjectId, NsObjectSlot>,
    next_client_object_id: ObjectId,
    on_event: Option<NamespaceCallback>,
}

enum PendingRequest {
    CreateObject(usize),
    CreateNamespace(usize),
    CreateNsObject {
        ns_slot: usize,
        client_object_id: ObjectId,
    },
}

enum ClientCont {
    ObjectValue {
        object_slot: usize,
        version: VersionNumber,
        reader: ValueBytesReader,
    },
    NsCreateValue {
        ns_slot: usize,
        object_id: ObjectId,
        type_id: TypeId,
        reader: ValueBytesReader,
    },
    NsReplaceValue {
        ns_slot: usize,
        object_id: ObjectId,
        version: VersionNumber,
        reader: ValueBytesReader,
    },
}

pub struct KoinoniaClient {
    log: Logger,
    client_base: MessageId,
    server_base: MessageId,
    bound: bool,
    objects: Vec<ObjectSlot>,
    by_server_id: HashMap<ObjectId, usize>,
    namespaces: Vec<NamespaceSlot>,
    ns_by_server_id: HashMap<NamespaceId, usize>,
    pending: Vec<PendingRequest>,
}

impl KoinoniaClient {
    pub fn new(log: &Logger) -> KoinoniaClient {
        KoinoniaClient {
            log: log.new(logging::o!("plugin" => PROTOCOL_NAME)),
            client_base: 0,
            server_base: 0,
            bound: false,
            objects: Vec::new(),
            by_server_id: HashMap::new(),
            namespaces: Vec::new(),
            ns_by_server_id: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Requests sharing of a globally named object. The object's client
    /// ID is returned immediately; the server binding arrives with the
    /// `CreateObjectReply`.
    pub fn share_object(
        &mut self,
        core: Option<&mut ClientCore>,
        name: &str,
        dict: DataType,
        type_id: TypeId,
        initial: Value,
        on_update: Option<UpdateCallback>,
    ) -> NetResult<ObjectId> {
        dict.check_complete()?;
        dict.check_value(type_id, &initial)?;

        self.objects.push(ObjectSlot {
            name: name.to_owned(),
            dict,
            type_id,
            server_id: 0,
            version: 0,
            value: initial,
            proposed: None,
            on_update,
        });
        let slot_index = self.objects.len() - 1;

        match (core, self.bound) {
            (Some(core), true) => {
                let message = self.build_create_object(slot_index)?;
                core.queue_server_message(message.into_shared());
            }
            _ => self.pending.push(PendingRequest::CreateObject(slot_index)),
        }
        Ok(slot_index as ObjectId + 1)
    }

    /// Proposes a new value for a shared object. Wins if no other
    /// replace with the same base version arrives at the server first.
    pub fn replace_object(
        &mut self,
        core: &mut ClientCore,
        client_object_id: ObjectId,
        value: Value,
    ) -> NetResult<()> {
        let slot_index = client_object_id
            .checked_sub(1)
            .map(|index| index as usize)
            .filter(|&index| index < self.objects.len())
            .ok_or(NetError::Fatal(ErrorKind::TypeMismatch))?;

        let slot = &mut self.objects[slot_index];
        slot.dict.check_value(slot.type_id, &value)?;
        if !self.bound || slot.server_id == 0 {
            // The create has not been answered yet; fold the new value
            // into the initial one.
            slot.value = value;
            return Ok(());
        }

        let bytes = serialize_value(&slot.dict, slot.type_id, &value)?;
        let explicit = slot.dict.fixed_size(slot.type_id)?.is_none();
        let size_field = if explicit {
            varint::size(bytes.len() as u32)
        } else {
            0
        };
        let mut writer = MessageWriter::with_capacity(
            self.client_base + REPLACE_OBJECT_REQUEST,
            REPLACE_OBJECT_REQUEST_PREFIX + size_field + bytes.len(),
        );
        writer.write_u16(slot.server_id)?;
        writer.write_u8(slot.version)?;
        if explicit {
            varint::write(&mut writer, bytes.len() as u32)?;
        }
        writer.write_bytes(&bytes)?;

        slot.proposed = Some(value);
        core.queue_server_message(writer.into_shared());
        Ok(())
    }

    /// Current local value of a shared object.
    pub fn object_value(&self, client_object_id: ObjectId) -> Option<&Value> {
        self.objects
            .get((client_object_id as usize).checked_sub(1)?)
            .map(|slot| &slot.value)
    }

    pub fn object_version(&self, client_object_id: ObjectId) -> Option<VersionNumber> {
        self.objects
            .get((client_object_id as usize).checked_sub(1)?)
            .map(|slot| slot.version)
    }

    /// Server-side ID of a shared object; 0 while the create request is
    /// unanswered.
    pub fn object_server_id(&self, client_object_id: ObjectId) -> Option<ObjectId> {
        self.objects
            .get((client_object_id as usize).checked_sub(1)?)
            .map(|slot| slot.server_id)
    }

    /// Requests a shared namespace. Returns the namespace's client ID.
    pub fn request_namespace(
        &mut self,
        core: Option<&mut ClientCore>,
        name: &str,
        dict: DataType,
        on_event: Option<NamespaceCallback>,
    ) -> NetResult<NamespaceId> {
        dict.check_complete()?;

        self.namespaces.push(NamespaceSlot {
            name: name.to_owned(),
            dict,
            server_id: 0,
            objects: HashMap::new(),
            pending_creates: HashMap::new(),
            next_client_object_id: 1,
            on_event,
        });
        let slot_index = self.namespaces.len() - 1;

        match (core, self.bound) {
            (Some(core), true) => {
                let message = self.build_create_namespace(slot_index)?;
                core.queue_server_message(message.into_shared());
            }
            _ => self
                .pending
                .push(PendingRequest::CreateNamespace(slot_index)),
        }
        Ok(slot_index as NamespaceId + 1)
    }

    /// Creates an object in a namespace. Returns the object's client
    /// ID, replaced by a server ID once the reply arrives.
    pub fn create_ns_object(
        &mut self,
        core: Option<&mut ClientCore>,
        client_namespace_id: NamespaceId,
        type_id: TypeId,
        value: Value,
    ) -> NetResult<ObjectId> {
        let ns_slot = self.namespace_slot(client_namespace_id)?;
        {
            let namespace = &self.namespaces[ns_slot];
            namespace.dict.check_value(type_id, &value)?;
        }

        let namespace = &mut self.namespaces[ns_slot];
        let client_object_id = namespace.next_client_object_id;
        namespace.next_client_object_id = namespace.next_client_object_id.wrapping_add(1);
        namespace.pending_creates.insert(
            client_object_id,
            NsObjectSlot {
                type_id,
                version: 0,
                value,
                proposed: None,
            },
        );

        let ready = self.bound && self.namespaces[ns_slot].server_id != 0;
        match (core, ready) {
            (Some(core), true) => {
                let message = self.build_create_ns_object(ns_slot, client_object_id)?;
                core.queue_server_message(message.into_shared());
            }
            _ => self.pending.push(PendingRequest::CreateNsObject {
                ns_slot,
                client_object_id,
            }),
        }
        Ok(client_object_id)
    }

    /// Proposes a new value for a namespace object (by server object
    /// ID).
    pub fn replace_ns_object(
        &mut self,
        core: &mut ClientCore,
        client_namespace_id: NamespaceId,
        object_id: ObjectId,
        value: Value,
    ) -> NetResult<()> {
        let ns_slot = self.namespace_slot(client_namespace_id)?;
        let client_base = self.client_base;
        let namespace = &mut self.namespaces[ns_slot];
        if namespace.server_id == 0 {
            return Err(NetError::Wait);
        }
        let object = namespace
            .objects
            .get_mut(&object_id)
            .ok_or(NetError::Fatal(ErrorKind::TypeMismatch))?;
        namespace.dict.check_value(object.type_id, &value)?;

        let bytes = serialize_value(&namespace.dict, object.type_id, &value)?;
        let explicit = namespace.dict.fixed_size(object.type_id)?.is_none();
        let size_field = if explicit {
            varint::size(bytes.len() as u32)
        } else {
            0
        };
        let mut writer = MessageWriter::with_capacity(
            client_base + REPLACE_NS_OBJECT_REQUEST,
            REPLACE_NS_OBJECT_REQUEST_PREFIX + size_field + bytes.len(),
        );
        writer.write_u8(namespace.server_id)?;
        writer.write_u16(object_id)?;
        writer.write_u8(object.version)?;
        if explicit {
            varint::write(&mut writer, bytes.len() as u32)?;
        }
        writer.write_bytes(&bytes)?;

        object.proposed = Some(value);
        core.queue_server_message(writer.into_shared());
        Ok(())
    }

    /// Destroys a namespace object (by server object ID).
    pub fn destroy_ns_object(
        &mut self,
        core: &mut ClientCore,
        client_namespace_id: NamespaceId,
        object_id: ObjectId,
    ) -> NetResult<()> {
        let ns_slot = self.namespace_slot(client_namespace_id)?;
        let namespace = &mut self.namespaces[ns_slot];
        if namespace.server_id == 0 {
            return Err(NetError::Wait);
        }
        namespace.objects.remove(&object_id);

        let mut writer = MessageWriter::with_capacity(
            self.client_base + DESTROY_NS_OBJECT_REQUEST,
            DESTROY_NS_OBJECT_REQUEST_SIZE,
        );
        writer.write_u8(self.namespaces[ns_slot].server_id)?;
        writer.write_u16(object_id)?;
        core.queue_server_message(writer.into_shared());
        Ok(())
    }

    pub fn ns_object_value(
        &self,
        client_namespace_id: NamespaceId,
        object_id: ObjectId,
    ) -> Option<&Value> {
        let ns_slot = (client_namespace_id as usize).checked_sub(1)?;
        self.namespaces
            .get(ns_slot)?
            .objects
            .get(&object_id)
            .map(|object| &object.value)
    }

    fn namespace_slot(&self, client_namespace_id: NamespaceId) -> NetResult<usize> {
        (client_namespace_id as usize)
            .checked_sub(1)
            .filter(|&index| index < self.namespaces.len())
            .ok_or(NetError::Fatal(ErrorKind::TypeMismatch))
    }

    // --- request building ---

    fn build_create_object(&self, slot_index: usize) -> NetResult<MessageBuffer> {
        let slot = &self.objects[slot_index];
        let bytes = serialize_value(&slot.dict, slot.type_id, &slot.value)?;
        let explicit = slot.dict.fixed_size(slot.type_id)?.is_none();
        let size_field = if explicit {
            varint::size(bytes.len() as u32)
        } else {
            0
        };
        let mut writer = MessageWriter::with_capacity(
            self.client_base + CREATE_OBJECT_REQUEST,
            CREATE_OBJECT_REQUEST_PREFIX
                + slot.name.len()
                + slot.dict.calc_dict_size()
                + size_field
                + bytes.len(),
        );
        writer.write_u16(slot_index as ObjectId + 1)?;
        writer.write_u16(slot.type_id)?;
        writer.write_u16(slot.name.len() as u16)?;
        writer.write_bytes(slot.name.as_bytes())?;
        slot.dict.write_dict(&mut writer)?;
        if explicit {
            varint::write(&mut writer, bytes.len() as u32)?;
        }
        writer.write_bytes(&bytes)?;
        Ok(writer.into_buffer())
    }

    fn build_create_namespace(&self, slot_index: usize) -> NetResult<MessageBuffer> {
        let slot = &self.namespaces[slot_index];
        let mut writer = MessageWriter::with_capacity(
            self.client_base + CREATE_NAMESPACE_REQUEST,
            CREATE_NAMESPACE_REQUEST_PREFIX + slot.name.len() + slot.dict.calc_dict_size(),
        );
        writer.write_u8(slot_index as NamespaceId + 1)?;
        writer.write_u16(slot.name.len() as u16)?;
        writer.write_bytes(slot.name.as_bytes())?;
        slot.dict.write_dict(&mut writer)?;
        Ok(writer.into_buffer())
    }

    fn build_create_ns_object(
        &self,
        ns_slot: usize,
        client_object_id: ObjectId,
    ) -> NetResult<MessageBuffer> {
        let namespace = &self.namespaces[ns_slot];
        let object = namespace
            .pending_creates
            .get(&client_object_id)
            .ok_or(NetError::Fatal(ErrorKind::TypeMismatch))?;
        let bytes = serialize_value(&namespace.dict, object.type_id, &object.value)?;
        let explicit = namespace.dict.fixed_size(object.type_id)?.is_none();
        let size_field = if explicit {
            varint::size(bytes.len() as u32)
        } else {
            0
        };
        let mut writer = MessageWriter::with_capacity(
            self.client_base + CREATE_NS_OBJECT_REQUEST,
            CREATE_NS_OBJECT_REQUEST_PREFIX + size_field + bytes.len(),
        );
        writer.write_u8(namespace.server_id)?;
        writer.write_u16(client_object_id)?;
        writer.write_u16(object.type_id)?;
        if explicit {
            varint::write(&mut writer, bytes.len() as u32)?;
        }
        writer.write_bytes(&bytes)?;
        Ok(writer.into_buffer())
    }

    fn flush_pending(&mut self, core: &mut ClientCore) -> NetResult<()> {
        let pending = std::mem::take(&mut self.pending);
        for request in pending {
            match request {
                PendingRequest::CreateObject(slot_index) => {
                    let message = self.build_create_object(slot_index)?;
                    core.queue_server_message(message.into_shared());
                }
                PendingRequest::CreateNamespace(slot_index) => {
                    let message = self.build_create_namespace(slot_index)?;
                    core.queue_server_message(message.into_shared());
                }
                PendingRequest::CreateNsObject {
                    ns_slot,
                    client_object_id,
                } => {
                    // Held until the namespace itself is bound.
                    if self.namespaces[ns_slot].server_id == 0 {
                        self.pending.push(PendingRequest::CreateNsObject {
                            ns_slot,
                            client_object_id,
                        });
                    } else {
                        let message = self.build_create_ns_object(ns_slot, client_object_id)?;
                        core.queue_server_message(message.into_shared());
                    }
                }
            }
        }
        Ok(())
    }

    // --- reply and notification handling ---

    fn handle_fixed_reply(
        &mut self,
        core: &mut ClientCore,
        message_index: u16,
    ) -> NetResult<HandlerAction> {
        match message_index {
            CREATE_OBJECT_REPLY => {
                let (client_object_id, server_object_id) = {
                    let socket = core.socket_mut();
                    (socket.read_u16()?, socket.read_u16()?)
                };
                let slot_index = (client_object_id as usize)
                    .checked_sub(1)
                    .filter(|&index| index < self.objects.len())
                    .ok_or(NetError::Fatal(ErrorKind::TypeMismatch))?;
                if server_object_id == 0 {
                    logging::warn!(self.log, "shared object refused by server";
                                   "object" => &self.objects[slot_index].name);
                } else {
                    self.objects[slot_index].server_id = server_object_id;
                    self.by_server_id.insert(server_object_id, slot_index);
                }
                Ok(HandlerAction::Done)
            }
            REPLACE_OBJECT_REPLY => {
                let (object_id, version, granted) = {
                    let socket = core.socket_mut();
                    (socket.read_u16()?, socket.read_u8()?, socket.read_u8()? != 0)
                };
                if let Some(&slot_index) = self.by_server_id.get(&object_id) {
                    let slot = &mut self.objects[slot_index];
                    if granted {
                        slot.version = version.wrapping_add(1);
                        if let Some(proposed) = slot.proposed.take() {
                            slot.value = proposed;
                        }
                    } else {
                        // The authoritative value follows as a
                        // notification.
                        slot.proposed = None;
                    }
                }
                Ok(HandlerAction::Done)
            }
            CREATE_NAMESPACE_REPLY => {
                let (client_namespace_id, server_namespace_id) = {
                    let socket = core.socket_mut();
                    (socket.read_u8()?, socket.read_u8()?)
                };
                let slot_index = (client_namespace_id as usize)
                    .checked_sub(1)
                    .filter(|&index| index < self.namespaces.len())
                    .ok_or(NetError::Fatal(ErrorKind::TypeMismatch))?;
                if server_namespace_id == 0 {
                    logging::warn!(self.log, "namespace refused by server";
                                   "namespace" => &self.namespaces[slot_index].name);
                } else {
                    self.namespaces[slot_index].server_id = server_namespace_id;
                    self.ns_by_server_id.insert(server_namespace_id, slot_index);
                    self.flush_pending(core)?;
                }
                Ok(HandlerAction::Done)
            }
            CREATE_NS_OBJECT_REPLY => {
                let (server_namespace_id, client_object_id, server_object_id) = {
                    let socket = core.socket_mut();
                    (socket.read_u8()?, socket.read_u16()?, socket.read_u16()?)
                };
                if let Some(&ns_slot) = self.ns_by_server_id.get(&server_namespace_id) {
                    let namespace = &mut self.namespaces[ns_slot];
                    if let Some(object) = namespace.pending_creates.remove(&client_object_id) {
                        namespace.objects.insert(server_object_id, object);
                    }
                }
                Ok(HandlerAction::Done)
            }
            REPLACE_NS_OBJECT_REPLY => {
                let (server_namespace_id, object_id, version, granted) = {
                    let socket = core.socket_mut();
                    (
                        socket.read_u8()?,
                        socket.read_u16()?,
                        socket.read_u8()?,
                        socket.read_u8()? != 0,
                    )
                };
                if let Some(&ns_slot) = self.ns_by_server_id.get(&server_namespace_id) {
                    if let Some(object) = self.namespaces[ns_slot].objects.get_mut(&object_id) {
                        if granted {
                            object.version = version.wrapping_add(1);
                            if let Some(proposed) = object.proposed.take() {
                                object.value = proposed;
                            }
                        } else {
                            object.proposed = None;
                        }
                    }
                }
                Ok(HandlerAction::Done)
            }
            DESTROY_NS_OBJECT_NOTIFICATION => {
                let (server_namespace_id, object_id) = {
                    let socket = core.socket_mut();
                    (socket.read_u8()?, socket.read_u16()?)
                };
                if let Some(&ns_slot) = self.ns_by_server_id.get(&server_namespace_id) {
                    let namespace = &mut self.namespaces[ns_slot];
                    if namespace.objects.remove(&object_id).is_some() {
                        if let Some(on_event) = namespace.on_event.as_mut() {
                            on_event(NamespaceEvent::ObjectDestroyed { object_id });
                        }
                    }
                }
                Ok(HandlerAction::Done)
            }
            _ => Err(NetError::Fatal(ErrorKind::UnknownMessage(
                self.server_base + message_index,
            ))),
        }
    }

    fn continue_value(
        &mut self,
        core: &mut ClientCore,
        cont: ClientCont,
    ) -> NetResult<HandlerAction> {
        match cont {
            ClientCont::ObjectValue {
                object_slot,
                version,
                mut reader,
            } => {
                let socket = core.socket_mut();
                match reader.step(socket)? {
                    Progress::NeedBytes(needed) => Ok(HandlerAction::NeedMore {
                        min_unread: needed,
                        cont: Box::new(ClientCont::ObjectValue {
                            object_slot,
                            version,
                            reader,
                        }),
                    }),
                    Progress::Done(bytes) => {
                        let slot = &mut self.objects[object_slot];
                        let value = parse_value(&slot.dict, slot.type_id, &bytes)?;
                        slot.version = version;
                        slot.value = value;
                        slot.proposed = None;
                        if let Some(on_update) = slot.on_update.as_mut() {
                            on_update(&slot.value);
                        }
                        Ok(HandlerAction::Done)
                    }
                }
            }
            ClientCont::NsCreateValue {
                ns_slot,
                object_id,
                type_id,
                mut reader,
            } => {
                let socket = core.socket_mut();
                match reader.step(socket)? {
                    Progress::NeedBytes(needed) => Ok(HandlerAction::NeedMore {
                        min_unread: needed,
                        cont: Box::new(ClientCont::NsCreateValue {
                            ns_slot,
                            object_id,
                            type_id,
                            reader,
                        }),
                    }),
                    Progress::Done(bytes) => {
                        let namespace = &mut self.namespaces[ns_slot];
                        let value = parse_value(&namespace.dict, type_id, &bytes)?;
                        namespace.objects.insert(
                            object_id,
                            NsObjectSlot {
                                type_id,
                                version: 0,
                                value,
                                proposed: None,
                            },
                        );
                        if let Some(on_event) = namespace.on_event.as_mut() {
                            let value = &namespace.objects[&object_id].value;
                            on_event(NamespaceEvent::ObjectCreated {
                                object_id,
                                type_id,
                                value,
                            });
                        }
                        Ok(HandlerAction::Done)
                    }
                }
            }
            ClientCont::NsReplaceValue {
                ns_slot,
                object_id,
                version,
                mut reader,
            } => {
                let socket = core.socket_mut();
                match reader.step(socket)? {
                    Progress::NeedBytes(needed) => Ok(HandlerAction::NeedMore {
                        min_unread: needed,
                        cont: Box::new(ClientCont::NsReplaceValue {
                            ns_slot,
                            object_id,
                            version,
                            reader,
                        }),
                    }),
                    Progress::Done(bytes) => {
                        let namespace = &mut self.namespaces[ns_slot];
                        let type_id = namespace
                            .objects
                            .get(&object_id)
                            .map(|object| object.type_id)
                            .ok_or(NetError::Fatal(ErrorKind::TypeMismatch))?;
                        let value = parse_value(&namespace.dict, type_id, &bytes)?;
                        {
                            let object = namespace
                                .objects
                                .get_mut(&object_id)
                                .expect("Object vanished");
                            object.version = version;
                            object.value = value;
                            object.proposed = None;
                        }
                        if let Some(on_event) = namespace.on_event.as_mut() {
                            let value = &namespace.objects[&object_id].value;
                            on_event(NamespaceEvent::ObjectReplaced {
                                object_id,
                                version,
                                value,
                            });
                        }
                        Ok(HandlerAction::Done)
                    }
                }
            }
        }
    }

    fn start_value_message(
        &mut self,
        core: &mut ClientCore,
        message_index: u16,
    ) -> NetResult<ClientCont> {
        match message_index {
            REPLACE_OBJECT_NOTIFICATION => {
                let (object_id, version) = {
                    let socket = core.socket_mut();
                    (socket.read_u16()?, socket.read_u8()?)
                };
                let object_slot = *self
                    .by_server_id
                    .get(&object_id)
                    .ok_or(NetError::Fatal(ErrorKind::TypeMismatch))?;
                let slot = &self.objects[object_slot];
                let reader = value_reader_for(&slot.dict, slot.type_id)?;
                Ok(ClientCont::ObjectValue {
                    object_slot,
                    version,
                    reader,
                })
            }
            CREATE_NS_OBJECT_NOTIFICATION => {
                let (server_namespace_id, object_id, type_id) = {
                    let socket = core.socket_mut();
                    (socket.read_u8()?, socket.read_u16()?, socket.read_u16()?)
                };
                let ns_slot = *self
                    .ns_by_server_id
                    .get(&server_namespace_id)
                    .ok_or(NetError::Fatal(ErrorKind::TypeMismatch))?;
                let namespace = &self.namespaces[ns_slot];
                if !namespace.dict.is_defined(type_id) {
                    return Err(NetError::Fatal(ErrorKind::UndefinedType(type_id)));
                }
                let reader = value_reader_for(&namespace.dict, type_id)?;
                Ok(ClientCont::NsCreateValue {
                    ns_slot,
                    object_id,
                    type_id,
                    reader,
                })
            }
            REPLACE_NS_OBJECT_NOTIFICATION => {
                let (server_namespace_id, object_id, version) = {
                    let socket = core.socket_mut();
                    (socket.read_u8()?, socket.read_u16()?, socket.read_u8()?)
                };
                let ns_slot = *self
                    .ns_by_server_id
                    .get(&server_namespace_id)
                    .ok_or(NetError::Fatal(ErrorKind::TypeMismatch))?;
                let namespace = &self.namespaces[ns_slot];
                let type_id = namespace
                    .objects
                    .get(&object_id)
                    .map(|object| object.type_id)
                    .ok_or(NetError::Fatal(ErrorKind::TypeMismatch))?;
                let reader = value_reader_for(&namespace.dict, type_id)?;
                Ok(ClientCont::NsReplaceValue {
                    ns_slot,
                    object_id,
                    version,
                    reader,
                })
            }
            _ => Err(NetError::Fatal(ErrorKind::UnknownMessage(
                self.server_base + message_index,
            ))),
        }
    }
}

fn serialize_value(dict: &DataType, type_id: TypeId, value: &Value) -> NetResult<Vec<u8>> {
    let size = dict.calc_value_size(type_id, value)?;
    let mut writer = MessageWriter::with_capacity(0, size);
    dict.write_value(type_id, value, &mut writer)?;
    Ok(writer.into_buffer().body().to_vec())
}

fn parse_value(dict: &DataType, type_id: TypeId, bytes: &[u8]) -> NetResult<Value> {
    let mut reader = MessageReader::over_bytes(bytes, false);
    let value = dict.read_value(type_id, &mut reader)?;
    if reader.unread() != 0 {
        return Err(NetError::Fatal(ErrorKind::TypeMismatch));
    }
    Ok(value)
}

fn value_reader_for(dict: &DataType, type_id: TypeId) -> NetResult<ValueBytesReader> {
    Ok(match dict.fixed_size(type_id)? {
        Some(size) => ValueBytesReader::fixed(size),
        None => ValueBytesReader::explicit(),
    })
}

impl ClientPlugin for KoinoniaClient {
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
        self.bound = true;
    }

    fn start(&mut self, core: &mut ClientCore) {
        if let Err(err) = self.flush_pending(core) {
            logging::warn!(self.log, "cannot flush pending requests"; "error" => %err);
        }
    }

    fn remote_client_connected(&mut self, _core: &mut ClientCore, _client_id: ClientId) {}

    fn remote_client_disconnected(&mut self, _core: &mut ClientCore, _client_id: ClientId) {}

    fn tcp_min_unread(&self, message_index: u16) -> usize {
        match message_index {
            CREATE_OBJECT_REPLY => CREATE_OBJECT_REPLY_SIZE,
            REPLACE_OBJECT_REPLY => REPLACE_OBJECT_REPLY_SIZE,
            REPLACE_OBJECT_NOTIFICATION => REPLACE_OBJECT_NOTIFICATION_PREFIX,
            CREATE_NAMESPACE_REPLY => CREATE_NAMESPACE_REPLY_SIZE,
            CREATE_NS_OBJECT_REPLY => CREATE_NS_OBJECT_REPLY_SIZE,
            CREATE_NS_OBJECT_NOTIFICATION => CREATE_NS_OBJECT_NOTIFICATION_PREFIX,
            REPLACE_NS_OBJECT_REPLY => REPLACE_NS_OBJECT_REPLY_SIZE,
            REPLACE_NS_OBJECT_NOTIFICATION => REPLACE_NS_OBJECT_NOTIFICATION_PREFIX,
            DESTROY_NS_OBJECT_NOTIFICATION => DESTROY_NS_OBJECT_NOTIFICATION_SIZE,
            _ => 0,
        }
    }

    fn handle_tcp_message(
        &mut self,
        core: &mut ClientCore,
        message_index: u16,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        if let Some(boxed) = cont {
            let cont = *boxed
                .downcast::<ClientCont>()
                .map_err(|_| NetError::Fatal(ErrorKind::TypeMismatch))?;
            return self.continue_value(core, cont);
        }

        match message_index {
            REPLACE_OBJECT_NOTIFICATION
            | CREATE_NS_OBJECT_NOTIFICATION
            | REPLACE_NS_OBJECT_NOTIFICATION => {
                let cont = self.start_value_message(core, message_index)?;
                self.continue_value(core, cont)
            }
            _ => self.handle_fixed_reply(core, message_index),
        }
    }

    fn handle_udp_message(
        &mut self,
        _core: &mut ClientCore,
        message_index: u16,
        _reader: &mut MessageReader,
    ) -> NetResult<()> {
        Err(NetError::Fatal(ErrorKind::UnknownMessage(
            self.server_base + message_index,
        )))
    }
}
