//! Wire I/O for dictionaries and values: size computation, writing,
//! recursive and streaming reads, and in-place endianness swapping.

use crate::datatype::{
    AtomicType, CompoundType, DataType, TypeId, Value, MAX_COMPOUND_TYPES, MAX_READ_DEPTH,
};
use crate::error::{ErrorKind, NetError, NetResult};
use crate::wire::cursor::{MessageWriter, WireRead};
use crate::wire::varint;

const TAG_POINTER: u8 = 0;
const TAG_FIXED_ARRAY: u8 = 1;
const TAG_VECTOR: u8 = 2;
const TAG_STRUCTURE: u8 = 3;

impl DataType {
    /// Wire size of the dictionary itself.
    pub fn calc_dict_size(&self) -> usize {
        let mut size = 1;
        for id in 0..self.num_compound_types() {
            size += match self
                .compound(crate::datatype::NUM_ATOMIC_TYPES + id as TypeId)
                .expect("Compound index out of range")
            {
                CompoundType::Pointer { .. } => 1 + 2,
                CompoundType::FixedArray { .. } => 1 + 2 + 2,
                CompoundType::Vector { .. } => 1 + 2,
                CompoundType::Structure { elements } => 1 + 1 + 2 * elements.len(),
            };
        }
        size
    }

    /// Writes the dictionary in wire form. Fails if a pointer target is
    /// still unset.
    pub fn write_dict(&self, writer: &mut MessageWriter) -> NetResult<()> {
        self.check_complete()?;
        writer.write_u8(self.num_compound_types() as u8)?;
        for id in 0..self.num_compound_types() {
            match self.compound(crate::datatype::NUM_ATOMIC_TYPES + id as TypeId)? {
                CompoundType::Pointer { element_type } => {
                    writer.write_u8(TAG_POINTER)?;
                    writer.write_u16(*element_type)?;
                }
                CompoundType::FixedArray {
                    num_elements,
                    element_type,
                } => {
                    writer.write_u8(TAG_FIXED_ARRAY)?;
                    writer.write_u16((num_elements - 1) as u16)?;
                    writer.write_u16(*element_type)?;
                }
                CompoundType::Vector { element_type } => {
                    writer.write_u8(TAG_VECTOR)?;
                    writer.write_u16(*element_type)?;
                }
                CompoundType::Structure { elements } => {
                    writer.write_u8(TAG_STRUCTURE)?;
                    writer.write_u8((elements.len() - 1) as u8)?;
                    for element in elements {
                        writer.write_u16(element.element_type)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Reads a dictionary from a fully-buffered source.
    pub fn read_dict<R: WireRead>(reader: &mut R) -> NetResult<DataType> {
        let mut dict_reader = DictReader::new();
        loop {
            match dict_reader.step(reader)? {
                ReadProgress::Done(dict) => return Ok(dict),
                ReadProgress::NeedBytes(needed) => {
                    if reader.unread() < needed {
                        return Err(NetError::Fatal(ErrorKind::Truncated));
                    }
                }
            }
        }
    }

    /// Wire size of a value of the given type.
    pub fn calc_value_size(&self, id: TypeId, value: &Value) -> NetResult<usize> {
        self.calc_value_size_depth(id, value, 0)
    }

    fn calc_value_size_depth(&self, id: TypeId, value: &Value, depth: usize) -> NetResult<usize> {
        if depth > MAX_READ_DEPTH {
            return Err(NetError::Fatal(ErrorKind::DepthOverflow));
        }
        let mismatch = || NetError::Fatal(ErrorKind::TypeMismatch);
        if let Some(atomic) = AtomicType::from_id(id) {
            return Ok(match (atomic, value) {
                (AtomicType::Bool, Value::Bool(_)) => 1,
                (AtomicType::Char, Value::Char(_)) => 1,
                (AtomicType::SInt8, Value::SInt8(_)) => 1,
                (AtomicType::SInt16, Value::SInt16(_)) => 2,
                (AtomicType::SInt32, Value::SInt32(_)) => 4,
                (AtomicType::SInt64, Value::SInt64(_)) => 8,
                (AtomicType::UInt8, Value::UInt8(_)) => 1,
                (AtomicType::UInt16, Value::UInt16(_)) => 2,
                (AtomicType::UInt32, Value::UInt32(_)) => 4,
                (AtomicType::UInt64, Value::UInt64(_)) => 8,
                (AtomicType::Float32, Value::Float32(_)) => 4,
                (AtomicType::Float64, Value::Float64(_)) => 8,
                (AtomicType::VarInt, Value::VarInt(v)) => varint::size(*v),
                (AtomicType::String, Value::String(s)) => {
                    varint::size(s.len() as u32) + s.len()
                }
                _ => return Err(mismatch()),
            });
        }
        match (self.compound(id)?, value) {
            (CompoundType::Pointer { .. }, Value::Pointer(None)) => Ok(1),
            (CompoundType::Pointer { element_type }, Value::Pointer(Some(target))) => {
                Ok(1 + self.calc_value_size_depth(*element_type, target, depth + 1)?)
            }
            (
                CompoundType::FixedArray {
                    num_elements,
                    element_type,
                },
                Value::FixedArray(values),
            ) => {
                if values.len() != *num_elements {
                    return Err(mismatch());
                }
                let mut size = 0;
                for element in values {
                    size += self.calc_value_size_depth(*element_type, element, depth + 1)?;
                }
                Ok(size)
            }
            (CompoundType::Vector { element_type }, Value::Vector(values)) => {
                let mut size = varint::size(values.len() as u32);
                for element in values {
                    size += self.calc_value_size_depth(*element_type, element, depth + 1)?;
                }
                Ok(size)
            }
            (CompoundType::Structure { elements }, Value::Structure(values)) => {
                if values.len() != elements.len() {
                    return Err(mismatch());
                }
                let element_types: Vec<TypeId> =
                    elements.iter().map(|element| element.element_type).collect();
                let mut size = 0;
                for (element_type, element) in element_types.iter().zip(values) {
                    size += self.calc_value_size_depth(*element_type, element, depth + 1)?;
                }
                Ok(size)
            }
            _ => Err(mismatch()),
        }
    }

    /// Writes a value in wire form.
    pub fn write_value(
        &self,
        id: TypeId,
        value: &Value,
        writer: &mut MessageWriter,
    ) -> NetResult<()> {
        self.write_value_depth(id, value, writer, 0)
    }

    fn write_value_depth(
        &self,
        id: TypeId,
        value: &Value,
        writer: &mut MessageWriter,
        depth: usize,
    ) -> NetResult<()> {
        if depth > MAX_READ_DEPTH {
            return Err(NetError::Fatal(ErrorKind::DepthOverflow));
        }
        let mismatch = || NetError::Fatal(ErrorKind::TypeMismatch);
        if let Some(atomic) = AtomicType::from_id(id) {
            return match (atomic, value) {
                (AtomicType::Bool, Value::Bool(v)) => writer.write_u8(*v as u8),
                (AtomicType::Char, Value::Char(v)) => writer.write_u8(*v),
                (AtomicType::SInt8, Value::SInt8(v)) => writer.write_i8(*v),
                (AtomicType::SInt16, Value::SInt16(v)) => writer.write_i16(*v),
                (AtomicType::SInt32, Value::SInt32(v)) => writer.write_i32(*v),
                (AtomicType::SInt64, Value::SInt64(v)) => writer.write_i64(*v),
                (AtomicType::UInt8, Value::UInt8(v)) => writer.write_u8(*v),
                (AtomicType::UInt16, Value::UInt16(v)) => writer.write_u16(*v),
                (AtomicType::UInt32, Value::UInt32(v)) => writer.write_u32(*v),
                (AtomicType::UInt64, Value::UInt64(v)) => writer.write_u64(*v),
                (AtomicType::Float32, Value::Float32(v)) => writer.write_f32(*v),
                (AtomicType::Float64, Value::Float64(v)) => writer.write_f64(*v),
                (AtomicType::VarInt, Value::VarInt(v)) => varint::write(writer, *v),
                (AtomicType::String, Value::String(s)) => {
                    varint::write(writer, s.len() as u32)?;
                    writer.write_bytes(s.as_bytes())
                }
                _ => Err(mismatch()),
            };
        }
        match (self.compound(id)?, value) {
            (CompoundType::Pointer { .. }, Value::Pointer(None)) => writer.write_u8(0),
            (CompoundType::Pointer { element_type }, Value::Pointer(Some(target))) => {
                let element = *element_type;
                writer.write_u8(1)?;
                self.write_value_depth(element, target, writer, depth + 1)
            }
            (
                CompoundType::FixedArray {
                    num_elements,
                    element_type,
                },
                Value::FixedArray(values),
            ) => {
                if values.len() != *num_elements {
                    return Err(mismatch());
                }
                let element = *element_type;
                for value in values {
                    self.write_value_depth(element, value, writer, depth + 1)?;
                }
                Ok(())
            }
            (CompoundType::Vector { element_type }, Value::Vector(values)) => {
                let element = *element_type;
                varint::write(writer, values.len() as u32)?;
                for value in values {
                    self.write_value_depth(element, value, writer, depth + 1)?;
                }
                Ok(())
            }
            (CompoundType::Structure { elements }, Value::Structure(values)) => {
                if values.len() != elements.len() {
                    return Err(mismatch());
                }
                let element_types: Vec<TypeId> =
                    elements.iter().map(|element| element.element_type).collect();
                for (element_type, value) in element_types.iter().zip(values) {
                    self.write_value_depth(*element_type, value, writer, depth + 1)?;
                }
                Ok(())
            }
            _ => Err(mismatch()),
        }
    }

    /// Reads a value from a fully-buffered source; running out of bytes
    /// is a truncation error.
    pub fn read_value<R: WireRead>(&self, id: TypeId, reader: &mut R) -> NetResult<Value> {
        let mut value_reader = ValueReader::new(self.clone(), id);
        loop {
            match value_reader.step(reader)? {
                ReadProgress::Done(value) => return Ok(value),
                ReadProgress::NeedBytes(needed) => {
                    if reader.unread() < needed {
                        return Err(NetError::Fatal(ErrorKind::Truncated));
                    }
                }
            }
        }
    }

    /// True if `bytes` is exactly one well-formed serialization of a
    /// value of the given type.
    pub fn check_serialization(&self, id: TypeId, bytes: &[u8]) -> bool {
        let mut reader = crate::wire::cursor::MessageReader::over_bytes(bytes, false);
        match self.read_value(id, &mut reader) {
            Ok(_) => reader.unread() == 0,
            Err(_) => false,
        }
    }

    /// Swaps the endianness of a serialized value in place, returning
    /// the number of bytes the value occupies. Swapping twice restores
    /// the original bytes.
    pub fn swap_value_endianness(&self, id: TypeId, bytes: &mut [u8]) -> NetResult<usize> {
        self.swap_walk(id, bytes, 0, 0)
    }

    fn swap_walk(
        &self,
        id: TypeId,
        bytes: &mut [u8],
        pos: usize,
        depth: usize,
    ) -> NetResult<usize> {
        if depth > MAX_READ_DEPTH {
            return Err(NetError::Fatal(ErrorKind::DepthOverflow));
        }
        let truncated = || NetError::Fatal(ErrorKind::Truncated);

        let take = |pos: usize, count: usize| {
            if pos + count > bytes.len() {
                Err(truncated())
            } else {
                Ok(pos + count)
            }
        };

        if let Some(atomic) = AtomicType::from_id(id) {
            return match atomic {
                AtomicType::Bool
                | AtomicType::Char
                | AtomicType::SInt8
                | AtomicType::UInt8 => take(pos, 1),
                AtomicType::SInt16 | AtomicType::UInt16 => {
                    let end = take(pos, 2)?;
                    bytes[pos..end].reverse();
                    Ok(end)
                }
                AtomicType::SInt32 | AtomicType::UInt32 | AtomicType::Float32 => {
                    let end = take(pos, 4)?;
                    bytes[pos..end].reverse();
                    Ok(end)
                }
                AtomicType::SInt64 | AtomicType::UInt64 | AtomicType::Float64 => {
                    let end = take(pos, 8)?;
                    bytes[pos..end].reverse();
                    Ok(end)
                }
                // Variable-width integers and string bytes are byte
                // sequences; only the length needs parsing.
                AtomicType::VarInt => {
                    let (_, end) = read_varint_at(bytes, pos)?;
                    Ok(end)
                }
                AtomicType::String => {
                    let (length, end) = read_varint_at(bytes, pos)?;
                    take(end, length as usize)
                }
            };
        }

        match self.compound(id)? {
            CompoundType::Pointer { element_type } => {
                let element = *element_type;
                let end = take(pos, 1)?;
                if bytes[pos] != 0 {
                    self.swap_walk(element, bytes, end, depth + 1)
                } else {
                    Ok(end)
                }
            }
            CompoundType::FixedArray {
                num_elements,
                element_type,
            } => {
                let (count, element) = (*num_elements, *element_type);
                let mut cursor = pos;
                for _ in 0..count {
                    cursor = self.swap_walk(element, bytes, cursor, depth + 1)?;
                }
                Ok(cursor)
            }
            CompoundType::Vector { element_type } => {
                let element = *element_type;
                let (count, mut cursor) = read_varint_at(bytes, pos)?;
                for _ in 0..count {
                    cursor = self.swap_walk(element, bytes, cursor, depth + 1)?;
                }
                Ok(cursor)
            }
            CompoundType::Structure { elements } => {
                let element_types: Vec<TypeId> =
                    elements.iter().map(|element| element.element_type).collect();
                let mut cursor = pos;
                for element in element_types {
                    cursor = self.swap_walk(element, bytes, cursor, depth + 1)?;
                }
                Ok(cursor)
            }
        }
    }
}

fn read_varint_at(bytes: &[u8], pos: usize) -> NetResult<(u32, usize)> {
    let first = *bytes
        .get(pos)
        .ok_or(NetError::Fatal(ErrorKind::Truncated))?;
    let trailing = varint::trailing_count(first)?;
    if pos + 1 + trailing > bytes.len() {
        return Err(NetError::Fatal(ErrorKind::Truncated));
    }
    let mut value = varint::first_payload(first, trailing) as u64;
    for i in 0..trailing {
        value = varint::accumulate(value, bytes[pos + 1 + i]);
    }
    if value > u32::MAX as u64 {
        return Err(NetError::Fatal(ErrorKind::MalformedVarInt));
    }
    Ok((value as u32, pos + 1 + trailing))
}

/// Progress report from a streaming reader: either the number of
/// buffered bytes required before the next step can make progress, or
/// the completed result.
pub enum ReadProgress<T> {
    NeedBytes(usize),
    Done(T),
}

enum VarIntDest {
    Value,
    StringLength,
    VectorCount(TypeId),
}

enum Task {
    ReadValue(TypeId),
    AtomicBytes(AtomicType),
    VarIntFirst(VarIntDest),
    VarIntRest {
        dest: VarIntDest,
        remaining: usize,
        acc: u64,
    },
    StringBytes {
        remaining: usize,
        bytes: Vec<u8>,
    },
    PointerFlag {
        element: TypeId,
    },
    CollectPointer,
    CollectArray {
        element: TypeId,
        remaining: usize,
        values: Vec<Value>,
        vector: bool,
    },
    CollectStructure {
        elements: Vec<TypeId>,
        index: usize,
        values: Vec<Value>,
    },
}

/// Streaming reader for one value, driven by socket readiness. Uses an
/// explicit work stack so arbitrarily large values never block the
/// event loop; between invocations it reports how many buffered bytes
/// it needs to take the next step.
pub struct ValueReader {
    dict: DataType,
    stack: Vec<Task>,
    completed: Option<Value>,
}

impl ValueReader {
    pub fn new(dict: DataType, root: TypeId) -> ValueReader {
        ValueReader {
            dict,
            stack: vec![Task::ReadValue(root)],
            completed: None,
        }
    }

    pub fn step<R: WireRead>(&mut self, reader: &mut R) -> NetResult<ReadProgress<Value>> {
        loop {
            let task = match self.stack.pop() {
                Some(task) => task,
                None => {
                    let value = self
                        .completed
                        .take()
                        .ok_or(NetError::Fatal(ErrorKind::Truncated))?;
                    return Ok(ReadProgress::Done(value));
                }
            };

            match task {
                Task::ReadValue(id) => {
                    if self.stack.len() >= MAX_READ_DEPTH {
                        return Err(NetError::Fatal(ErrorKind::DepthOverflow));
                    }
                    if let Some(atomic) = AtomicType::from_id(id) {
                        match atomic {
                            AtomicType::VarInt => {
                                self.stack.push(Task::VarIntFirst(VarIntDest::Value))
                            }
                            AtomicType::String => {
                                self.stack.push(Task::VarIntFirst(VarIntDest::StringLength))
                            }
                            _ => self.stack.push(Task::AtomicBytes(atomic)),
                        }
                        continue;
                    }
                    match self.dict.compound(id)? {
                        CompoundType::Pointer { element_type } => {
                            let element = *element_type;
                            self.stack.push(Task::PointerFlag { element });
                        }
                        CompoundType::FixedArray {
                            num_elements,
                            element_type,
                        } => {
                            let (remaining, element) = (*num_elements, *element_type);
                            self.stack.push(Task::CollectArray {
                                element,
                                remaining,
                                values: Vec::new(),
                                vector: false,
                            });
                        }
                        CompoundType::Vector { element_type } => {
                            let element = *element_type;
                            self.stack
                                .push(Task::VarIntFirst(VarIntDest::VectorCount(element)));
                        }
                        CompoundType::Structure { elements } => {
                            let element_types: Vec<TypeId> =
                                elements.iter().map(|element| element.element_type).collect();
                            self.stack.push(Task::CollectStructure {
                                elements: element_types,
                                index: 0,
                                values: Vec::new(),
                            });
                        }
                    }
                }

                Task::AtomicBytes(atomic) => {
                    let size = match atomic {
                        AtomicType::Bool | AtomicType::Char | AtomicType::SInt8 | AtomicType::UInt8 => 1,
                        AtomicType::SInt16 | AtomicType::UInt16 => 2,
                        AtomicType::SInt32 | AtomicType::UInt32 | AtomicType::Float32 => 4,
                        AtomicType::SInt64 | AtomicType::UInt64 | AtomicType::Float64 => 8,
                        AtomicType::VarInt | AtomicType::String => unreachable!(),
                    };
                    if reader.unread() < size {
                        self.stack.push(Task::AtomicBytes(atomic));
                        return Ok(ReadProgress::NeedBytes(size));
                    }
                    self.completed = Some(match atomic {
                        AtomicType::Bool => Value::Bool(reader.read_u8()? != 0),
                        AtomicType::Char => Value::Char(reader.read_u8()?),
                        AtomicType::SInt8 => Value::SInt8(reader.read_i8()?),
                        AtomicType::SInt16 => Value::SInt16(reader.read_i16()?),
                        AtomicType::SInt32 => Value::SInt32(reader.read_i32()?),
                        AtomicType::SInt64 => Value::SInt64(reader.read_i64()?),
                        AtomicType::UInt8 => Value::UInt8(reader.read_u8()?),
                        AtomicType::UInt16 => Value::UInt16(reader.read_u16()?),
                        AtomicType::UInt32 => Value::UInt32(reader.read_u32()?),
                        AtomicType::UInt64 => Value::UInt64(reader.read_u64()?),
                        AtomicType::Float32 => Value::Float32(reader.read_f32()?),
                        AtomicType::Float64 => Value::Float64(reader.read_f64()?),
                        AtomicType::VarInt | AtomicType::String => unreachable!(),
                    });
                }

                Task::VarIntFirst(dest) => {
                    if reader.unread() < 1 {
                        self.stack.push(Task::VarIntFirst(dest));
                        return Ok(ReadProgress::NeedBytes(1));
                    }
                    let first = reader.read_u8()?;
                    let trailing = varint::trailing_count(first)?;
                    let acc = varint::first_payload(first, trailing) as u64;
                    if trailing == 0 {
                        self.finish_varint(dest, acc)?;
                    } else {
                        self.stack.push(Task::VarIntRest {
                            dest,
                            remaining: trailing,
                            acc,
                        });
                    }
                }

                Task::VarIntRest {
                    dest,
                    remaining,
                    acc,
                } => {
                    if reader.unread() < remaining {
                        let needed = remaining;
                        self.stack.push(Task::VarIntRest {
                            dest,
                            remaining,
                            acc,
                        });
                        return Ok(ReadProgress::NeedBytes(needed));
                    }
                    let mut value = acc;
                    for _ in 0..remaining {
                        value = varint::accumulate(value, reader.read_u8()?);
                    }
                    if value > u32::MAX as u64 {
                        return Err(NetError::Fatal(ErrorKind::MalformedVarInt));
                    }
                    self.finish_varint(dest, value)?;
                }

                Task::StringBytes {
                    mut remaining,
                    mut bytes,
                } => {
                    let available = reader.unread().min(remaining);
                    if available == 0 {
                        self.stack.push(Task::StringBytes { remaining, bytes });
                        return Ok(ReadProgress::NeedBytes(1));
                    }
                    let start = bytes.len();
                    bytes.resize(start + available, 0);
                    reader.fetch(&mut bytes[start..])?;
                    remaining -= available;
                    if remaining > 0 {
                        self.stack.push(Task::StringBytes { remaining, bytes });
                        return Ok(ReadProgress::NeedBytes(1));
                    }
                    let string = String::from_utf8(bytes)
                        .map_err(|_| NetError::Fatal(ErrorKind::TypeMismatch))?;
                    self.completed = Some(Value::String(string));
                }

                Task::PointerFlag { element } => {
                    if reader.unread() < 1 {
                        self.stack.push(Task::PointerFlag { element });
                        return Ok(ReadProgress::NeedBytes(1));
                    }
                    if reader.read_u8()? != 0 {
                        self.stack.push(Task::CollectPointer);
                        self.stack.push(Task::ReadValue(element));
                    } else {
                        self.completed = Some(Value::Pointer(None));
                    }
                }

                Task::CollectPointer => {
                    let value = self
                        .completed
                        .take()
                        .ok_or(NetError::Fatal(ErrorKind::Truncated))?;
                    self.completed = Some(Value::Pointer(Some(Box::new(value))));
                }

                Task::CollectArray {
                    element,
                    mut remaining,
                    mut values,
                    vector,
                } => {
                    if let Some(value) = self.completed.take() {
                        values.push(value);
                    }
                    if remaining == 0 {
                        self.completed = Some(if vector {
                            Value::Vector(values)
                        } else {
                            Value::FixedArray(values)
                        });
                    } else {
                        remaining -= 1;
                        self.stack.push(Task::CollectArray {
                            element,
                            remaining,
                            values,
                            vector,
                        });
                        self.stack.push(Task::ReadValue(element));
                    }
                }

                Task::CollectStructure {
                    elements,
                    mut index,
                    mut values,
                } => {
                    if let Some(value) = self.completed.take() {
                        values.push(value);
                    }
                    if index == elements.len() {
                        self.completed = Some(Value::Structure(values));
                    } else {
                        let element = elements[index];
                        index += 1;
                        self.stack.push(Task::CollectStructure {
                            elements,
                            index,
                            values,
                        });
                        self.stack.push(Task::ReadValue(element));
                    }
                }
            }
        }
    }

    fn finish_varint(&mut self, dest: VarIntDest, value: u64) -> NetResult<()> {
        match dest {
            VarIntDest::Value => {
                self.completed = Some(Value::VarInt(value as u32));
            }
            VarIntDest::StringLength => {
                if value == 0 {
                    self.completed = Some(Value::String(String::new()));
                } else {
                    self.stack.push(Task::StringBytes {
                        remaining: value as usize,
                        bytes: Vec::new(),
                    });
                }
            }
            VarIntDest::VectorCount(element) => {
                self.stack.push(Task::CollectArray {
                    element,
                    remaining: value as usize,
                    values: Vec::new(),
                    vector: true,
                });
            }
        }
        Ok(())
    }
}

enum DictState {
    Count,
    Tag,
    PointerTarget,
    ArrayParams,
    VectorElement,
    StructureCount,
    StructureElements { types: Vec<TypeId>, total: usize },
}

/// Streaming reader for a dictionary arriving on a socket.
pub struct DictReader {
    dict: DataType,
    pointer_fixups: Vec<(TypeId, TypeId)>,
    expected: usize,
    read: usize,
    state: DictState,
}

impl DictReader {
    pub fn new() -> DictReader {
        DictReader {
            dict: DataType::new(),
            pointer_fixups: Vec::new(),
            expected: 0,
            read: 0,
            state: DictState::Count,
        }
    }

    pub fn step<R: WireRead>(&mut self, reader: &mut R) -> NetResult<ReadProgress<DataType>> {
        loop {
            match &mut self.state {
                DictState::Count => {
                    if reader.unread() < 1 {
                        return Ok(ReadProgress::NeedBytes(1));
                    }
                    self.expected = reader.read_u8()? as usize;
                    if self.expected > MAX_COMPOUND_TYPES {
                        return Err(NetError::Fatal(ErrorKind::SizeOverflow));
                    }
                    self.state = DictState::Tag;
                }
                DictState::Tag => {
                    if self.read == self.expected {
                        return self.finish();
                    }
                    if reader.unread() < 1 {
                        return Ok(ReadProgress::NeedBytes(1));
                    }
                    self.state = match reader.read_u8()? {
                        TAG_POINTER => DictState::PointerTarget,
                        TAG_FIXED_ARRAY => DictState::ArrayParams,
                        TAG_VECTOR => DictState::VectorElement,
                        TAG_STRUCTURE => DictState::StructureCount,
                        _ => return Err(NetError::Fatal(ErrorKind::MalformedHandshake)),
                    };
                }
                DictState::PointerTarget => {
                    if reader.unread() < 2 {
                        return Ok(ReadProgress::NeedBytes(2));
                    }
                    let target = reader.read_u16()?;
                    let pointer = self.dict.create_pointer()?;
                    self.pointer_fixups.push((pointer, target));
                    self.entry_done();
                }
                DictState::ArrayParams => {
                    if reader.unread() < 4 {
                        return Ok(ReadProgress::NeedBytes(4));
                    }
                    let num_elements = reader.read_u16()? as usize + 1;
                    let element = reader.read_u16()?;
                    self.dict.add_fixed_array(num_elements, element)?;
                    self.entry_done();
                }
                DictState::VectorElement => {
                    if reader.unread() < 2 {
                        return Ok(ReadProgress::NeedBytes(2));
                    }
                    let element = reader.read_u16()?;
                    self.dict.add_vector(element)?;
                    self.entry_done();
                }
                DictState::StructureCount => {
                    if reader.unread() < 1 {
                        return Ok(ReadProgress::NeedBytes(1));
                    }
                    let total = reader.read_u8()? as usize + 1;
                    self.state = DictState::StructureElements {
                        types: Vec::with_capacity(total),
                        total,
                    };
                }
                DictState::StructureElements { types, total } => {
                    while types.len() < *total {
                        if reader.unread() < 2 {
                            return Ok(ReadProgress::NeedBytes(2));
                        }
                        types.push(reader.read_u16()?);
                    }
                    let element_types = std::mem::take(types);
                    self.dict.add_structure(&element_types)?;
                    self.entry_done();
                }
            }
        }
    }

    fn entry_done(&mut self) {
        self.read += 1;
        self.state = DictState::Tag;
    }

    fn finish(&mut self) -> NetResult<ReadProgress<DataType>> {
        let mut dict = std::mem::replace(&mut self.dict, DataType::new());
        // Targets are applied against the completed dictionary, so
        // recursive pointer types resolve.
        for (pointer, target) in self.pointer_fixups.drain(..) {
            dict.set_pointer_target(pointer, target)?;
        }
        dict.check_complete()?;
        Ok(ReadProgress::Done(dict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::cursor::{MessageReader, MessageWriter};

    fn sample_dict() -> (DataType, TypeId) {
        let mut dict = DataType::new();
        let array = dict.add_fixed_array(2, AtomicType::UInt16.id()).unwrap();
        let vector = dict.add_vector(AtomicType::Float64.id()).unwrap();
        let pointer = dict.create_pointer().unwrap();
        let root = dict
            .add_structure(&[
                AtomicType::Bool.id(),
                array,
                vector,
                AtomicType::VarInt.id(),
                AtomicType::String.id(),
                pointer,
            ])
            .unwrap();
        dict.set_pointer_target(pointer, root).unwrap();
        (dict, root)
    }

    fn sample_value() -> Value {
        Value::Structure(vec![
            Value::Bool(true),
            Value::FixedArray(vec![Value::UInt16(17), Value::UInt16(40000)]),
            Value::Vector(vec![Value::Float64(-2.25), Value::Float64(1e300)]),
            Value::VarInt(200_000),
            Value::String("shared state".to_owned()),
            Value::Pointer(Some(Box::new(Value::Structure(vec![
                Value::Bool(false),
                Value::FixedArray(vec![Value::UInt16(0), Value::UInt16(1)]),
                Value::Vector(vec![]),
                Value::VarInt(3),
                Value::String(String::new()),
                Value::Pointer(None),
            ])))),
        ])
    }

    #[test]
    fn test_value_roundtrip_and_size() {
        let (dict, root) = sample_dict();
        let value = sample_value();

        let size = dict.calc_value_size(root, &value).unwrap();
        let mut writer = MessageWriter::with_capacity(1, size);
        dict.write_value(root, &value, &mut writer).unwrap();
        assert!(writer.eof());

        let buffer = writer.into_buffer();
        assert_eq!(buffer.body_len(), size);

        let mut reader = MessageReader::over_body(&buffer, false);
        let read_back = dict.read_value(root, &mut reader).unwrap();
        assert_eq!(read_back, value);
        assert_eq!(reader.unread(), 0);
    }

    #[test]
    fn test_dict_roundtrip() {
        let (dict, _) = sample_dict();

        let size = dict.calc_dict_size();
        let mut writer = MessageWriter::with_capacity(1, size);
        dict.write_dict(&mut writer).unwrap();
        assert!(writer.eof());

        let buffer = writer.into_buffer();
        let mut reader = MessageReader::over_body(&buffer, false);
        let read_back = DataType::read_dict(&mut reader).unwrap();

        assert_eq!(read_back, dict);
        assert_eq!(reader.unread(), 0);
    }

    #[test]
    fn test_double_endian_swap_is_identity() {
        let (dict, root) = sample_dict();
        let value = sample_value();

        let size = dict.calc_value_size(root, &value).unwrap();
        let mut writer = MessageWriter::with_capacity(1, size);
        dict.write_value(root, &value, &mut writer).unwrap();
        let mut buffer = writer.into_buffer();

        let original = buffer.body().to_vec();
        let consumed = dict
            .swap_value_endianness(root, buffer.body_mut())
            .unwrap();
        assert_eq!(consumed, size);
        assert_ne!(buffer.body(), &original[..]);

        dict.swap_value_endianness(root, buffer.body_mut()).unwrap();
        assert_eq!(buffer.body(), &original[..]);
    }

    #[test]
    fn test_swapped_bytes_parse_with_swapping_reader() {
        let (dict, root) = sample_dict();
        let value = sample_value();

        let size = dict.calc_value_size(root, &value).unwrap();
        let mut writer = MessageWriter::with_capacity(1, size);
        dict.write_value(root, &value, &mut writer).unwrap();
        let mut buffer = writer.into_buffer();

        dict.swap_value_endianness(root, buffer.body_mut()).unwrap();
        let mut reader = MessageReader::over_body(&buffer, true);
        assert_eq!(dict.read_value(root, &mut reader).unwrap(), value);
    }

    #[test]
    fn test_streaming_reader_makes_progress_in_fragments() {
        let (dict, root) = sample_dict();
        let value = sample_value();

        let size = dict.calc_value_size(root, &value).unwrap();
        let mut writer = MessageWriter::with_capacity(1, size);
        dict.write_value(root, &value, &mut writer).unwrap();
        let buffer = writer.into_buffer();
        let body = buffer.body();

        // Feed the reader one byte at a time through a growing window.
        let mut value_reader = ValueReader::new(dict.clone(), root);
        let mut available = 0usize;
        let mut consumed = 0usize;
        loop {
            let mut window = MessageReader::over_bytes(&body[consumed..available], false);
            match value_reader.step(&mut window).unwrap() {
                ReadProgress::Done(result) => {
                    assert_eq!(result, value);
                    break;
                }
                ReadProgress::NeedBytes(needed) => {
                    consumed += (available - consumed) - window.unread();
                    let target = consumed + needed;
                    available = target.max(available).min(body.len());
                    assert!(
                        available >= target || available == body.len(),
                        "reader demanded bytes past the end"
                    );
                }
            }
        }
    }

    #[test]
    fn test_check_serialization_flags_trailing_garbage() {
        let (dict, root) = sample_dict();
        let value = sample_value();

        let size = dict.calc_value_size(root, &value).unwrap();
        let mut writer = MessageWriter::with_capacity(1, size);
        dict.write_value(root, &value, &mut writer).unwrap();
        let buffer = writer.into_buffer();

        assert!(dict.check_serialization(root, buffer.body()));

        let mut longer = buffer.body().to_vec();
        longer.push(0);
        assert!(!dict.check_serialization(root, &longer));
        assert!(!dict.check_serialization(root, &buffer.body()[..size - 1]));
    }

    #[test]
    fn test_write_value_rejects_type_mismatch() {
        let (dict, root) = sample_dict();
        let mut writer = MessageWriter::with_capacity(1, 64);
        assert!(dict
            .write_value(root, &Value::UInt8(1), &mut writer)
            .is_err());
    }
}
