//! Server half of the data-sharing protocol.

use crate::persist::{self, NamespaceRecord, NamespaceSnapshot, ObjectSnapshot};
use crate::valuestream::{Progress, ValueBytesReader};
use crate::*;
use conduit::datatype::{DataType, DictReader, ReadProgress, TypeId, Value};
use conduit::error::{ErrorKind, NetError, NetResult};
use conduit::plugin::{Continuation, HandlerAction, ServerPlugin};
use conduit::server::ServerCore;
use conduit::wire::cursor::{MessageReader, MessageWriter, WireRead};
use conduit::wire::varint;
use conduit::wire::BufferRef;
use conduit::{ClientId, MessageId};
use hashbrown::HashMap;
use keel::logging::{self, Logger};
use std::path::Path;

/// A globally named shared object. The current value is kept both as a
/// parsed tree (console, persistence) and as a ready-to-send
/// replace notification whose header is stamped when it is rebuilt.
struct SharedObject {
    id: ObjectId,
    name: String,
    dict: DataType,
    type_id: TypeId,
    version: VersionNumber,
    value: Value,
    cached_notification: BufferRef,
    sharers: Vec<ClientId>,
}

struct NsObject {
    type_id: TypeId,
    version: VersionNumber,
    value: Value,
}

struct Namespace {
    id: NamespaceId,
    name: String,
    dict: DataType,
    objects: HashMap<ObjectId, NsObject>,
    next_object_id: ObjectId,
    clients: Vec<ClientId>,
}

enum CreateObjectCont {
    Name {
        client_object_id: ObjectId,
        type_id: TypeId,
        remaining: usize,
        bytes: Vec<u8>,
    },
    Dict {
        client_object_id: ObjectId,
        type_id: TypeId,
        name: String,
        reader: DictReader,
    },
    Value {
        client_object_id: ObjectId,
        type_id: TypeId,
        name: String,
        dict: DataType,
        reader: ValueBytesReader,
    },
}

enum ReplaceObjectCont {
    Value {
        object_id: ObjectId,
        version: VersionNumber,
        reader: ValueBytesReader,
    },
}

enum CreateNamespaceCont {
    Name {
        client_namespace_id: NamespaceId,
        remaining: usize,
        bytes: Vec<u8>,
    },
    Dict {
        client_namespace_id: NamespaceId,
        name: String,
        reader: DictReader,
    },
}

enum NsObjectCont {
    Create {
        namespace_id: NamespaceId,
        client_object_id: ObjectId,
        type_id: TypeId,
        reader: ValueBytesReader,
    },
    Replace {
        namespace_id: NamespaceId,
        object_id: ObjectId,
        version: VersionNumber,
        reader: ValueBytesReader,
    },
}

pub struct KoinoniaServer {
    log: Logger,
    client_base: MessageId,
    server_base: MessageId,
    objects: HashMap<ObjectId, SharedObject>,
    objects_by_name: HashMap<String, ObjectId>,
    next_object_id: ObjectId,
    namespaces: HashMap<NamespaceId, Namespace>,
    namespaces_by_name: HashMap<String, NamespaceId>,
    next_namespace_id: NamespaceId,
}

impl KoinoniaServer {
    pub fn new(log: &Logger) -> KoinoniaServer {
        KoinoniaServer {
            log: log.new(logging::o!("plugin" => PROTOCOL_NAME)),
            client_base: 0,
            server_base: 0,
            objects: HashMap::new(),
            objects_by_name: HashMap::new(),
            next_object_id: 1,
            namespaces: HashMap::new(),
            namespaces_by_name: HashMap::new(),
            next_namespace_id: 1,
        }
    }

    fn allocate_object_id(&mut self) -> ObjectId {
        loop {
            let id = self.next_object_id;
            self.next_object_id = self.next_object_id.wrapping_add(1);
            if id != 0 && !self.objects.contains_key(&id) {
                return id;
            }
        }
    }

    fn allocate_namespace_id(&mut self) -> Option<NamespaceId> {
        for _ in 0..=NamespaceId::MAX {
            let id = self.next_namespace_id;
            self.next_namespace_id = self.next_namespace_id.wrapping_add(1);
            if id != 0 && !self.namespaces.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Parses and validates a value's captured wire bytes.
    fn parse_value(dict: &DataType, type_id: TypeId, bytes: &[u8]) -> NetResult<Value> {
        let mut reader = MessageReader::over_bytes(bytes, false);
        let value = dict.read_value(type_id, &mut reader)?;
        if reader.unread() != 0 {
            return Err(NetError::Fatal(ErrorKind::TypeMismatch));
        }
        Ok(value)
    }

    /// Builds a `ReplaceObjectNotification` carrying the given value
    /// bytes, header stamped with the current server base.
    fn build_object_notification(
        server_base: MessageId,
        object: ObjectId,
        version: VersionNumber,
        explicit_size: bool,
        value_bytes: &[u8],
    ) -> BufferRef {
        let size_field = if explicit_size {
            varint::size(value_bytes.len() as u32)
        } else {
            0
        };
        let mut writer = MessageWriter::with_capacity(
            server_base + REPLACE_OBJECT_NOTIFICATION,
            REPLACE_OBJECT_NOTIFICATION_PREFIX + size_field + value_bytes.len(),
        );
        writer.write_u16(object).expect("Notification size mismatch");
        writer.write_u8(version).expect("Notification size mismatch");
        if explicit_size {
            varint::write(&mut writer, value_bytes.len() as u32)
                .expect("Notification size mismatch");
        }
        writer
            .write_bytes(value_bytes)
            .expect("Notification size mismatch");
        writer.into_shared()
    }

    fn value_reader_for(dict: &DataType, type_id: TypeId) -> NetResult<ValueBytesReader> {
        Ok(match dict.fixed_size(type_id)? {
            Some(size) => ValueBytesReader::fixed(size),
            None => ValueBytesReader::explicit(),
        })
    }

    fn serialized_value(dict: &DataType, type_id: TypeId, value: &Value) -> NetResult<Vec<u8>> {
        let size = dict.calc_value_size(type_id, value)?;
        let mut writer = MessageWriter::with_capacity(0, size);
        dict.write_value(type_id, value, &mut writer)?;
        Ok(writer.into_buffer().body().to_vec())
    }

    // --- globally named objects ---

    fn handle_create_object(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        let mut state = match cont {
            Some(boxed) => *boxed
                .downcast::<CreateObjectCont>()
                .map_err(|_| NetError::Fatal(ErrorKind::TypeMismatch))?,
            None => {
                let socket = core.socket_mut(client_id)?;
                let client_object_id = socket.read_u16()?;
                let type_id = socket.read_u16()?;
                let name_len = socket.read_u16()? as usize;
                CreateObjectCont::Name {
                    client_object_id,
                    type_id,
                    remaining: name_len,
                    bytes: Vec::new(),
                }
            }
        };

        loop {
            match state {
                CreateObjectCont::Name {
                    client_object_id,
                    type_id,
                    mut remaining,
                    mut bytes,
                } => {
                    let socket = core.socket_mut(client_id)?;
                    let available = socket.unread().min(remaining);
                    if available == 0 && remaining > 0 {
                        return Ok(HandlerAction::NeedMore {
                            min_unread: 1,
                            cont: Box::new(CreateObjectCont::Name {
                                client_object_id,
                                type_id,
                                remaining,
                                bytes,
                            }),
                        });
                    }
                    let start = bytes.len();
                    bytes.resize(start + available, 0);
                    socket.fetch(&mut bytes[start..])?;
                    remaining -= available;
                    if remaining > 0 {
                        return Ok(HandlerAction::NeedMore {
                            min_unread: 1,
                            cont: Box::new(CreateObjectCont::Name {
                                client_object_id,
                                type_id,
                                remaining,
                                bytes,
                            }),
                        });
                    }
                    let name = String::from_utf8(bytes)
                        .map_err(|_| NetError::Fatal(ErrorKind::TypeMismatch))?;
                    state = CreateObjectCont::Dict {
                        client_object_id,
                        type_id,
                        name,
                        reader: DictReader::new(),
                    };
                }
                CreateObjectCont::Dict {
                    client_object_id,
                    type_id,
                    name,
                    mut reader,
                } => {
                    let socket = core.socket_mut(client_id)?;
                    match reader.step(socket)? {
                        ReadProgress::NeedBytes(needed) => {
                            return Ok(HandlerAction::NeedMore {
                                min_unread: needed,
                                cont: Box::new(CreateObjectCont::Dict {
                                    client_object_id,
                                    type_id,
                                    name,
                                    reader,
                                }),
                            });
                        }
                        ReadProgress::Done(dict) => {
                            if !dict.is_defined(type_id) {
                                return Err(NetError::Fatal(ErrorKind::UndefinedType(type_id)));
                            }
                            let value_reader = Self::value_reader_for(&dict, type_id)?;
                            state = CreateObjectCont::Value {
                                client_object_id,
                                type_id,
                                name,
                                dict,
                                reader: value_reader,
                            };
                        }
                    }
                }
                CreateObjectCont::Value {
                    client_object_id,
                    type_id,
                    name,
                    dict,
                    mut reader,
                } => {
                    let socket = core.socket_mut(client_id)?;
                    match reader.step(socket)? {
                        Progress::NeedBytes(needed) => {
                            return Ok(HandlerAction::NeedMore {
                                min_unread: needed,
                                cont: Box::new(CreateObjectCont::Value {
                                    client_object_id,
                                    type_id,
                                    name,
                                    dict,
                                    reader,
                                }),
                            });
                        }
                        Progress::Done(bytes) => {
                            self.finish_create_object(
                                core,
                                client_id,
                                client_object_id,
                                name,
                                dict,
                                type_id,
                                bytes,
                            )?;
                            return Ok(HandlerAction::Done);
                        }
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_create_object(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        client_object_id: ObjectId,
        name: String,
        dict: DataType,
        type_id: TypeId,
        value_bytes: Vec<u8>,
    ) -> NetResult<()> {
        let value = Self::parse_value(&dict, type_id, &value_bytes)?;

        let server_object_id = match self.objects_by_name.get(&name).copied() {
            Some(existing_id) => {
                let matches = {
                    let existing = self.objects.get(&existing_id).expect("Object vanished");
                    existing.dict == dict && existing.type_id == type_id
                };
                if matches {
                    let existing = self.objects.get_mut(&existing_id).expect("Object vanished");
                    if !existing.sharers.contains(&client_id) {
                        existing.sharers.push(client_id);
                    }
                    let notification = existing.cached_notification.clone();
                    core.queue_message(client_id, notification);
                    existing_id
                } else {
                    logging::warn!(self.log, "shared object type mismatch";
                                   "object" => &name, "client_id" => client_id);
                    0
                }
            }
            None => {
                let id = self.allocate_object_id();
                let explicit = dict.fixed_size(type_id)?.is_none();
                let cached = Self::build_object_notification(
                    self.server_base,
                    id,
                    0,
                    explicit,
                    &value_bytes,
                );
                logging::info!(self.log, "shared object created";
                               "object" => &name, "object_id" => id, "client_id" => client_id);
                self.objects_by_name.insert(name.clone(), id);
                self.objects.insert(
                    id,
                    SharedObject {
                        id,
                        name,
                        dict,
                        type_id,
                        version: 0,
                        value,
                        cached_notification: cached,
                        sharers: vec![client_id],
                    },
                );
                id
            }
        };

        let mut reply = MessageWriter::with_capacity(
            self.server_base + CREATE_OBJECT_REPLY,
            CREATE_OBJECT_REPLY_SIZE,
        );
        reply.write_u16(client_object_id)?;
        reply.write_u16(server_object_id)?;
        core.queue_message(client_id, reply.into_shared());
        Ok(())
    }

    fn handle_replace_object(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        let state = match cont {
            Some(boxed) => *boxed
                .downcast::<ReplaceObjectCont>()
                .map_err(|_| NetError::Fatal(ErrorKind::TypeMismatch))?,
            None => {
                let socket = core.socket_mut(client_id)?;
                let object_id = socket.read_u16()?;
                let version = socket.read_u8()?;
                let reader = match self.objects.get(&object_id) {
                    Some(object) => Self::value_reader_for(&object.dict, object.type_id)?,
                    // The object is gone; the size prefix still frames
                    // the message, so consume it as variable-size.
                    None => ValueBytesReader::explicit(),
                };
                ReplaceObjectCont::Value {
                    object_id,
                    version,
                    reader,
                }
            }
        };

        let ReplaceObjectCont::Value {
            object_id,
            version,
            mut reader,
        } = state;
        let socket = core.socket_mut(client_id)?;
        match reader.step(socket)? {
            Progress::NeedBytes(needed) => Ok(HandlerAction::NeedMore {
                min_unread: needed,
                cont: Box::new(ReplaceObjectCont::Value {
                    object_id,
                    version,
                    reader,
                }),
            }),
            Progress::Done(bytes) => {
                self.finish_replace_object(core, client_id, object_id, version, bytes)?;
                Ok(HandlerAction::Done)
            }
        }
    }

    fn finish_replace_object(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        object_id: ObjectId,
        version: VersionNumber,
        value_bytes: Vec<u8>,
    ) -> NetResult<()> {
        let granted = match self.objects.get(&object_id) {
            Some(object) => object.version == version,
            None => {
                logging::warn!(self.log, "replace request for unknown object";
                               "object_id" => object_id, "client_id" => client_id);
                return Ok(());
            }
        };

        let mut reply = MessageWriter::with_capacity(
            self.server_base + REPLACE_OBJECT_REPLY,
            REPLACE_OBJECT_REPLY_SIZE,
        );
        reply.write_u16(object_id)?;
        reply.write_u8(version)?;
        reply.write_u8(granted as u8)?;
        core.queue_message(client_id, reply.into_shared());

        if granted {
            let (value, explicit) = {
                let object = self.objects.get(&object_id).expect("Object vanished");
                (
                    Self::parse_value(&object.dict, object.type_id, &value_bytes)?,
                    object.dict.fixed_size(object.type_id)?.is_none(),
                )
            };
            let new_version = version.wrapping_add(1);
            let cached = Self::build_object_notification(
                self.server_base,
                object_id,
                new_version,
                explicit,
                &value_bytes,
            );
            let sharers = {
                let object = self.objects.get_mut(&object_id).expect("Object vanished");
                object.version = new_version;
                object.value = value;
                object.cached_notification = cached.clone();
                object.sharers.clone()
            };
            for sharer in sharers {
                if sharer != client_id {
                    core.queue_message(sharer, cached.clone());
                }
            }
        } else {
            // The loser learns the authoritative value right away.
            let notification = self
                .objects
                .get(&object_id)
                .expect("Object vanished")
                .cached_notification
                .clone();
            core.queue_message(client_id, notification);
        }
        Ok(())
    }

    // --- namespaces ---

    fn handle_create_namespace(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        let mut state = match cont {
            Some(boxed) => *boxed
                .downcast::<CreateNamespaceCont>()
                .map_err(|_| NetError::Fatal(ErrorKind::TypeMismatch))?,
            None => {
                let socket = core.socket_mut(client_id)?;
                let client_namespace_id = socket.read_u8()?;
                let name_len = socket.read_u16()? as usize;
                CreateNamespaceCont::Name {
                    client_namespace_id,
                    remaining: name_len,
                    bytes: Vec::new(),
                }
            }
        };

        loop {
            match state {
                CreateNamespaceCont::Name {
                    client_namespace_id,
                    mut remaining,
                    mut bytes,
                } => {
                    let socket = core.socket_mut(client_id)?;
                    let available = socket.unread().min(remaining);
                    if available == 0 && remaining > 0 {
                        return Ok(HandlerAction::NeedMore {
                            min_unread: 1,
                            cont: Box::new(CreateNamespaceCont::Name {
                                client_namespace_id,
                                remaining,
                                bytes,
                            }),
                        });
                    }
                    let start = bytes.len();
                    bytes.resize(start + available, 0);
                    socket.fetch(&mut bytes[start..])?;
                    remaining -= available;
                    if remaining > 0 {
                        return Ok(HandlerAction::NeedMore {
                            min_unread: 1,
                            cont: Box::new(CreateNamespaceCont::Name {
                                client_namespace_id,
                                remaining,
                                bytes,
                            }),
                        });
                    }
                    let name = String::from_utf8(bytes)
                        .map_err(|_| NetError::Fatal(ErrorKind::TypeMismatch))?;
                    state = CreateNamespaceCont::Dict {
                        client_namespace_id,
                        name,
                        reader: DictReader::new(),
                    };
                }
                CreateNamespaceCont::Dict {
                    client_namespace_id,
                    name,
                    mut reader,
                } => {
                    let socket = core.socket_mut(client_id)?;
                    match reader.step(socket)? {
                        ReadProgress::NeedBytes(needed) => {
                            return Ok(HandlerAction::NeedMore {
                                min_unread: needed,
                                cont: Box::new(CreateNamespaceCont::Dict {
                                    client_namespace_id,
                                    name,
                                    reader,
                                }),
                            });
                        }
                        ReadProgress::Done(dict) => {
                            self.finish_create_namespace(
                                core,
                                client_id,
                                client_namespace_id,
                                name,
                                dict,
                            )?;
                            return Ok(HandlerAction::Done);
                        }
                    }
                }
            }
        }
    }

    fn finish_create_namespace(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        client_namespace_id: NamespaceId,
        name: String,
        dict: DataType,
    ) -> NetResult<()> {
        let server_namespace_id = match self.namespaces_by_name.get(&name).copied() {
            Some(existing_id) => {
                let namespace = self
                    .namespaces
                    .get_mut(&existing_id)
                    .expect("Namespace vanished");
                if namespace.dict == dict {
                    if !namespace.clients.contains(&client_id) {
                        namespace.clients.push(client_id);
                    }
                    existing_id
                } else {
                    logging::warn!(self.log, "namespace dictionary mismatch";
                                   "namespace" => &name, "client_id" => client_id);
                    0
                }
            }
            None => match self.allocate_namespace_id() {
                Some(id) => {
                    logging::info!(self.log, "namespace created";
                                   "namespace" => &name, "namespace_id" => id);
                    self.namespaces_by_name.insert(name.clone(), id);
                    self.namespaces.insert(
                        id,
                        Namespace {
                            id,
                            name,
                            dict,
                            objects: HashMap::new(),
                            next_object_id: 1,
                            clients: vec![client_id],
                        },
                    );
                    id
                }
                None => 0,
            },
        };

        let mut reply = MessageWriter::with_capacity(
            self.server_base + CREATE_NAMESPACE_REPLY,
            CREATE_NAMESPACE_REPLY_SIZE,
        );
        reply.write_u8(client_namespace_id)?;
        reply.write_u8(server_namespace_id)?;
        core.queue_message(client_id, reply.into_shared());

        // Bring the joiner up to date with the namespace's objects.
        if server_namespace_id != 0 {
            let notifications: Vec<BufferRef> = {
                let namespace = self
                    .namespaces
                    .get(&server_namespace_id)
                    .expect("Namespace vanished");
                let mut notifications = Vec::with_capacity(namespace.objects.len());
                for (&object_id, object) in &namespace.objects {
                    notifications.push(self.build_ns_create_notification(
                        namespace,
                        object_id,
                        object,
                    )?);
                }
                notifications
            };
            for notification in notifications {
                core.queue_message(client_id, notification);
            }
        }
        Ok(())
    }

    fn build_ns_create_notification(
        &self,
        namespace: &Namespace,
        object_id: ObjectId,
        object: &NsObject,
    ) -> NetResult<BufferRef> {
        let bytes = Self::serialized_value(&namespace.dict, object.type_id, &object.value)?;
        let explicit = namespace.dict.fixed_size(object.type_id)?.is_none();
        let size_field = if explicit {
            varint::size(bytes.len() as u32)
        } else {
            0
        };
        let mut writer = MessageWriter::with_capacity(
            self.server_base + CREATE_NS_OBJECT_NOTIFICATION,
            CREATE_NS_OBJECT_NOTIFICATION_PREFIX + size_field + bytes.len(),
        );
        writer.write_u8(namespace.id)?;
        writer.write_u16(object_id)?;
        writer.write_u16(object.type_id)?;
        if explicit {
            varint::write(&mut writer, bytes.len() as u32)?;
        }
        writer.write_bytes(&bytes)?;
        Ok(writer.into_shared())
    }

    fn start_ns_value_reader(
        &self,
        namespace_id: NamespaceId,
        type_id: TypeId,
    ) -> NetResult<ValueBytesReader> {
        match self.namespaces.get(&namespace_id) {
            Some(namespace) if namespace.dict.is_defined(type_id) => {
                Self::value_reader_for(&namespace.dict, type_id)
            }
            Some(_) => Err(NetError::Fatal(ErrorKind::UndefinedType(type_id))),
            None => Ok(ValueBytesReader::explicit()),
        }
    }

    fn handle_ns_object_message(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        message_index: u16,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        let state = match cont {
            Some(boxed) => *boxed
                .downcast::<NsObjectCont>()
                .map_err(|_| NetError::Fatal(ErrorKind::TypeMismatch))?,
            None => {
                if message_index == CREATE_NS_OBJECT_REQUEST {
                    let (namespace_id, client_object_id, type_id) = {
                        let socket = core.socket_mut(client_id)?;
                        (socket.read_u8()?, socket.read_u16()?, socket.read_u16()?)
                    };
                    NsObjectCont::Create {
                        namespace_id,
                        client_object_id,
                        type_id,
                        reader: self.start_ns_value_reader(namespace_id, type_id)?,
                    }
                } else {
                    let (namespace_id, object_id, version) = {
                        let socket = core.socket_mut(client_id)?;
                        (socket.read_u8()?, socket.read_u16()?, socket.read_u8()?)
                    };
                    let reader = match self
                        .namespaces
                        .get(&namespace_id)
                        .and_then(|namespace| namespace.objects.get(&object_id))
                    {
                        Some(object) => {
                            let namespace =
                                self.namespaces.get(&namespace_id).expect("Namespace vanished");
                            Self::value_reader_for(&namespace.dict, object.type_id)?
                        }
                        None => ValueBytesReader::explicit(),
                    };
                    NsObjectCont::Replace {
                        namespace_id,
                        object_id,
                        version,
                        reader,
                    }
                }
            }
        };

        match state {
            NsObjectCont::Create {
                namespace_id,
                client_object_id,
                type_id,
                mut reader,
            } => {
                let socket = core.socket_mut(client_id)?;
                match reader.step(socket)? {
                    Progress::NeedBytes(needed) => Ok(HandlerAction::NeedMore {
                        min_unread: needed,
                        cont: Box::new(NsObjectCont::Create {
                            namespace_id,
                            client_object_id,
                            type_id,
                            reader,
                        }),
                    }),
                    Progress::Done(bytes) => {
                        self.finish_create_ns_object(
                            core,
                            client_id,
                            namespace_id,
                            client_object_id,
                            type_id,
                            bytes,
                        )?;
                        Ok(HandlerAction::Done)
                    }
                }
            }
            NsObjectCont::Replace {
                namespace_id,
                object_id,
                version,
                mut reader,
            } => {
                let socket = core.socket_mut(client_id)?;
                match reader.step(socket)? {
                    Progress::NeedBytes(needed) => Ok(HandlerAction::NeedMore {
                        min_unread: needed,
                        cont: Box::new(NsObjectCont::Replace {
                            namespace_id,
                            object_id,
                            version,
                            reader,
                        }),
                    }),
                    Progress::Done(bytes) => {
                        self.finish_replace_ns_object(
                            core,
                            client_id,
                            namespace_id,
                            object_id,
                            version,
                            bytes,
                        )?;
                        Ok(HandlerAction::Done)
                    }
                }
            }
        }
    }

    fn finish_create_ns_object(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        namespace_id: NamespaceId,
        client_object_id: ObjectId,
        type_id: TypeId,
        value_bytes: Vec<u8>,
    ) -> NetResult<()> {
        let object_id = {
            let namespace = match self.namespaces.get_mut(&namespace_id) {
                Some(namespace) => namespace,
                None => {
                    logging::warn!(self.log, "object created in unknown namespace";
                                   "namespace_id" => namespace_id, "client_id" => client_id);
                    return Ok(());
                }
            };
            let value = Self::parse_value(&namespace.dict, type_id, &value_bytes)?;
            let object_id = loop {
                let id = namespace.next_object_id;
                namespace.next_object_id = namespace.next_object_id.wrapping_add(1);
                if id != 0 && !namespace.objects.contains_key(&id) {
                    break id;
                }
            };
            namespace.objects.insert(
                object_id,
                NsObject {
                    type_id,
                    version: 0,
                    value,
                },
            );
            object_id
        };

        let mut reply = MessageWriter::with_capacity(
            self.server_base + CREATE_NS_OBJECT_REPLY,
            CREATE_NS_OBJECT_REPLY_SIZE,
        );
        reply.write_u8(namespace_id)?;
        reply.write_u16(client_object_id)?;
        reply.write_u16(object_id)?;
        core.queue_message(client_id, reply.into_shared());

        let (notification, receivers) = {
            let namespace = self.namespaces.get(&namespace_id).expect("Namespace vanished");
            let object = namespace.objects.get(&object_id).expect("Object vanished");
            (
                self.build_ns_create_notification(namespace, object_id, object)?,
                namespace.clients.clone(),
            )
        };
        for receiver in receivers {
            if receiver != client_id {
                core.queue_message(receiver, notification.clone());
            }
        }
        Ok(())
    }

    fn finish_replace_ns_object(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        namespace_id: NamespaceId,
        object_id: ObjectId,
        version: VersionNumber,
        value_bytes: Vec<u8>,
    ) -> NetResult<()> {
        let granted = match self
            .namespaces
            .get(&namespace_id)
            .and_then(|namespace| namespace.objects.get(&object_id))
        {
            Some(object) => object.version == version,
            None => {
                logging::warn!(self.log, "replace request for unknown namespace object";
                               "namespace_id" => namespace_id, "object_id" => object_id);
                return Ok(());
            }
        };

        let mut reply = MessageWriter::with_capacity(
            self.server_base + REPLACE_NS_OBJECT_REPLY,
            REPLACE_NS_OBJECT_REPLY_SIZE,
        );
        reply.write_u8(namespace_id)?;
        reply.write_u16(object_id)?;
        reply.write_u8(version)?;
        reply.write_u8(granted as u8)?;
        core.queue_message(client_id, reply.into_shared());

        let namespace = self.namespaces.get_mut(&namespace_id).expect("Namespace vanished");
        if granted {
            let value = Self::parse_value(
                &namespace.dict,
                namespace.objects.get(&object_id).expect("Object vanished").type_id,
                &value_bytes,
            )?;
            let new_version = version.wrapping_add(1);
            {
                let object = namespace.objects.get_mut(&object_id).expect("Object vanished");
                object.version = new_version;
                object.value = value;
            }

            let explicit = {
                let object = namespace.objects.get(&object_id).expect("Object vanished");
                namespace.dict.fixed_size(object.type_id)?.is_none()
            };
            let size_field = if explicit {
                varint::size(value_bytes.len() as u32)
            } else {
                0
            };
            let mut writer = MessageWriter::with_capacity(
                self.server_base + REPLACE_NS_OBJECT_NOTIFICATION,
                REPLACE_NS_OBJECT_NOTIFICATION_PREFIX + size_field + value_bytes.len(),
            );
            writer.write_u8(namespace_id)?;
            writer.write_u16(object_id)?;
            writer.write_u8(new_version)?;
            if explicit {
                varint::write(&mut writer, value_bytes.len() as u32)?;
            }
            writer.write_bytes(&value_bytes)?;
            let notification = writer.into_shared();

            let receivers = namespace.clients.clone();
            for receiver in receivers {
                if receiver != client_id {
                    core.queue_message(receiver, notification.clone());
                }
            }
        } else {
            // Send the authoritative value back to the loser.
            let object = namespace.objects.get(&object_id).expect("Object vanished");
            let bytes = Self::serialized_value(&namespace.dict, object.type_id, &object.value)?;
            let explicit = namespace.dict.fixed_size(object.type_id)?.is_none();
            let size_field = if explicit {
                varint::size(bytes.len() as u32)
            } else {
                0
            };
            let mut writer = MessageWriter::with_capacity(
                self.server_base + REPLACE_NS_OBJECT_NOTIFICATION,
                REPLACE_NS_OBJECT_NOTIFICATION_PREFIX + size_field + bytes.len(),
            );
            writer.write_u8(namespace_id)?;
            writer.write_u16(object_id)?;
            writer.write_u8(object.version)?;
            if explicit {
                varint::write(&mut writer, bytes.len() as u32)?;
            }
            writer.write_bytes(&bytes)?;
            core.queue_message(client_id, writer.into_shared());
        }
        Ok(())
    }

    fn handle_destroy_ns_object(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
    ) -> NetResult<HandlerAction> {
        let (namespace_id, object_id) = {
            let socket = core.socket_mut(client_id)?;
            (socket.read_u8()?, socket.read_u16()?)
        };

        let receivers = match self.namespaces.get_mut(&namespace_id) {
            Some(namespace) => {
                if namespace.objects.remove(&object_id).is_none() {
                    return Ok(HandlerAction::Done);
                }
                namespace.clients.clone()
            }
            None => return Ok(HandlerAction::Done),
        };

        let mut notification = MessageWriter::with_capacity(
            self.server_base + DESTROY_NS_OBJECT_NOTIFICATION,
            DESTROY_NS_OBJECT_NOTIFICATION_SIZE,
        );
        notification.write_u8(namespace_id)?;
        notification.write_u16(object_id)?;
        let notification = notification.into_shared();
        for receiver in receivers {
            if receiver != client_id {
                core.queue_message(receiver, notification.clone());
            }
        }
        Ok(HandlerAction::Done)
    }

    // --- console ---

    fn console_list_objects(&self) {
        for object in self.objects.values() {
            println!(
                "object {:5}  {:<24}  type {:3}  version {:3}  sharers {}",
                object.id,
                object.name,
                object.type_id,
                object.version,
                object.sharers.len()
            );
        }
    }

    fn console_print_object(&self, name: &str) {
        match self
            .objects_by_name
            .get(name)
            .and_then(|id| self.objects.get(id))
        {
            Some(object) => println!(
                "{} = {}",
                object.name,
                conduit::datatype::format_value(&object.value)
            ),
            None => println!("No shared object named {}", name),
        }
    }

    fn console_save_object(&self, name: &str, path: &str) {
        let object = match self
            .objects_by_name
            .get(name)
            .and_then(|id| self.objects.get(id))
        {
            Some(object) => object,
            None => {
                println!("No shared object named {}", name);
                return;
            }
        };
        let snapshot = ObjectSnapshot {
            name: object.name.clone(),
            dict: object.dict.clone(),
            type_id: object.type_id,
            value: object.value.clone(),
        };
        match persist::save_object(Path::new(path), &snapshot) {
            Ok(()) => println!("Saved object {} to {}", name, path),
            Err(err) => println!("Cannot save object {}: {}", name, err),
        }
    }

    fn console_load_object(&mut self, path: &str) {
        let snapshot = match persist::load_object(Path::new(path)) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                println!("Cannot load object from {}: {}", path, err);
                return;
            }
        };
        if self.objects_by_name.contains_key(&snapshot.name) {
            println!("Shared object {} already exists", snapshot.name);
            return;
        }
        let id = self.allocate_object_id();
        let cached = match Self::serialized_value(&snapshot.dict, snapshot.type_id, &snapshot.value)
            .and_then(|bytes| {
                Ok(Self::build_object_notification(
                    self.server_base,
                    id,
                    0,
                    snapshot.dict.fixed_size(snapshot.type_id)?.is_none(),
                    &bytes,
                ))
            }) {
            Ok(cached) => cached,
            Err(err) => {
                println!("Cannot load object from {}: {}", path, err);
                return;
            }
        };
        println!("Loaded object {} as ID {}", snapshot.name, id);
        self.objects_by_name.insert(snapshot.name.clone(), id);
        self.objects.insert(
            id,
            SharedObject {
                id,
                name: snapshot.name,
                dict: snapshot.dict,
                type_id: snapshot.type_id,
                version: 0,
                value: snapshot.value,
                cached_notification: cached,
                sharers: Vec::new(),
            },
        );
    }

    fn console_delete_object(&mut self, name: &str) {
        match self.objects_by_name.get(name).copied() {
            Some(id) => {
                let sharers = self.objects.get(&id).map(|o| o.sharers.len()).unwrap_or(0);
                if sharers > 0 {
                    println!("Shared object {} is in use by {} clients", name, sharers);
                } else {
                    self.objects.remove(&id);
                    self.objects_by_name.remove(name);
                    println!("Deleted object {}", name);
                }
            }
            None => println!("No shared object named {}", name),
        }
    }

    fn console_list_namespaces(&self) {
        for namespace in self.namespaces.values() {
            println!(
                "namespace {:3}  {:<24}  objects {:5}  clients {}",
                namespace.id,
                namespace.name,
                namespace.objects.len(),
                namespace.clients.len()
            );
        }
    }

    fn console_save_namespace(&self, name: &str, path: &str) {
        let namespace = match self
            .namespaces_by_name
            .get(name)
            .and_then(|id| self.namespaces.get(id))
        {
            Some(namespace) => namespace,
            None => {
                println!("No namespace named {}", name);
                return;
            }
        };
        let snapshot = NamespaceSnapshot {
            name: namespace.name.clone(),
            dict: namespace.dict.clone(),
            records: namespace
                .objects
                .iter()
                .map(|(&object_id, object)| NamespaceRecord {
                    object_id,
                    type_id: object.type_id,
                    version: object.version,
                    value: object.value.clone(),
                })
                .collect(),
        };
        match persist::save_namespace(Path::new(path), &snapshot) {
            Ok(()) => println!("Saved namespace {} to {}", name, path),
            Err(err) => println!("Cannot save namespace {}: {}", name, err),
        }
    }

    fn console_load_namespace(&mut self, path: &str) {
        let snapshot = match persist::load_namespace(Path::new(path)) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                println!("Cannot load namespace from {}: {}", path, err);
                return;
            }
        };
        if self.namespaces_by_name.contains_key(&snapshot.name) {
            println!("Namespace {} already exists", snapshot.name);
            return;
        }
        let id = match self.allocate_namespace_id() {
            Some(id) => id,
            None => {
                println!("No free namespace IDs");
                return;
            }
        };
        let mut objects = HashMap::new();
        let mut next_object_id = 1;
        for record in snapshot.records {
            objects.insert(
                record.object_id,
                NsObject {
                    type_id: record.type_id,
                    version: record.version,
                    value: record.value,
                },
            );
            next_object_id = next_object_id.max(record.object_id.wrapping_add(1));
        }
        println!("Loaded namespace {} as ID {}", snapshot.name, id);
        self.namespaces_by_name.insert(snapshot.name.clone(), id);
        self.namespaces.insert(
            id,
            Namespace {
                id,
                name: snapshot.name,
                dict: snapshot.dict,
                objects,
                next_object_id,
                clients: Vec::new(),
            },
        );
    }
}

impl ServerPlugin for KoinoniaServer {
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

    fn start(&mut self, _core: &mut ServerCore) {}

    fn client_connected(&mut self, _core: &mut ServerCore, _client_id: ClientId) {}

    fn client_disconnected(&mut self, _core: &mut ServerCore, client_id: ClientId) {
        for object in self.objects.values_mut() {
            object.sharers.retain(|&sharer| sharer != client_id);
        }
        for namespace in self.namespaces.values_mut() {
            namespace.clients.retain(|&client| client != client_id);
        }
    }

    fn tcp_min_unread(&self, message_index: u16) -> usize {
        match message_index {
            CREATE_OBJECT_REQUEST => CREATE_OBJECT_REQUEST_PREFIX,
            REPLACE_OBJECT_REQUEST => REPLACE_OBJECT_REQUEST_PREFIX,
            CREATE_NAMESPACE_REQUEST => CREATE_NAMESPACE_REQUEST_PREFIX,
            CREATE_NS_OBJECT_REQUEST => CREATE_NS_OBJECT_REQUEST_PREFIX,
            REPLACE_NS_OBJECT_REQUEST => REPLACE_NS_OBJECT_REQUEST_PREFIX,
            DESTROY_NS_OBJECT_REQUEST => DESTROY_NS_OBJECT_REQUEST_SIZE,
            _ => 0,
        }
    }

    fn handle_tcp_message(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        message_index: u16,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        match message_index {
            CREATE_OBJECT_REQUEST => self.handle_create_object(core, client_id, cont),
            REPLACE_OBJECT_REQUEST => self.handle_replace_object(core, client_id, cont),
            CREATE_NAMESPACE_REQUEST => self.handle_create_namespace(core, client_id, cont),
            CREATE_NS_OBJECT_REQUEST | REPLACE_NS_OBJECT_REQUEST => {
                self.handle_ns_object_message(core, client_id, message_index, cont)
            }
            DESTROY_NS_OBJECT_REQUEST => self.handle_destroy_ns_object(core, client_id),
            _ => Err(NetError::Fatal(ErrorKind::UnknownMessage(
                self.client_base + message_index,
            ))),
        }
    }

    fn handle_udp_message(
        &mut self,
        _core: &mut ServerCore,
        _client_id: ClientId,
        message_index: u16,
        _reader: &mut MessageReader,
    ) -> NetResult<()> {
        // Shared state travels reliably; datagrams are not expected.
        Err(NetError::Fatal(ErrorKind::UnknownMessage(
            self.client_base + message_index,
        )))
    }

    fn console_command(&mut self, _core: &mut ServerCore, command: &str, args: &[&str]) -> bool {
        match command {
            "listObjects" => self.console_list_objects(),
            "printObject" => match args.first() {
                Some(name) => self.console_print_object(name),
                None => println!("Usage: printObject <name>"),
            },
            "saveObject" => match (args.first(), args.get(1)) {
                (Some(name), Some(path)) => self.console_save_object(name, path),
                _ => println!("Usage: saveObject <name> <file>"),
            },
            "loadObject" => match args.first() {
                Some(path) => self.console_load_object(path),
                None => println!("Usage: loadObject <file>"),
            },
            "deleteObject" => match args.first() {
                Some(name) => self.console_delete_object(name),
                None => println!("Usage: deleteObject <name>"),
            },
            "listNamespaces" => self.console_list_namespaces(),
            "saveNamespace" => match (args.first(), args.get(1)) {
                (Some(name), Some(path)) => self.console_save_namespace(name, path),
                _ => println!("Usage: saveNamespace <name> <file>"),
            },
            "loadNamespace" => match args.first() {
                Some(path) => self.console_load_namespace(path),
                None => println!("Usage: loadNamespace <file>"),
            },
            _ => return false,
        }
        true
    }
}
