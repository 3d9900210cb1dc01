//! Opt-in file snapshots of shared objects and namespaces, invoked from
//! the operator console.
//!
//! Layout: a fixed 32-byte zero-padded magic, the VarInt-length-prefixed
//! name, the type dictionary in wire form, then either `type, value`
//! (object files) or a VarInt record count followed by
//! `(objectId, type, value)` records (namespace files). No checksum.

use crate::{ObjectId, VersionNumber};
use conduit::datatype::{DataType, TypeId, Value};
use conduit::error::{ErrorKind, NetError, NetResult};
use conduit::wire::cursor::{MessageReader, MessageWriter, WireRead};
use conduit::wire::varint;
use std::io::{Read, Write};
use std::path::Path;

pub const OBJECT_MAGIC: &str = "Koinonia Object v1.0";
pub const NAMESPACE_MAGIC: &str = "Koinonia Namespace v1.0";
const MAGIC_LEN: usize = 32;

fn magic_field(magic: &str) -> [u8; MAGIC_LEN] {
    let mut field = [0u8; MAGIC_LEN];
    field[..magic.len()].copy_from_slice(magic.as_bytes());
    field
}

fn string_size(string: &str) -> usize {
    varint::size(string.len() as u32) + string.len()
}

fn write_string(writer: &mut MessageWriter, string: &str) -> NetResult<()> {
    varint::write(writer, string.len() as u32)?;
    writer.write_bytes(string.as_bytes())
}

fn read_string<R: WireRead>(reader: &mut R) -> NetResult<String> {
    let length = varint::read(reader)? as usize;
    let mut bytes = vec![0u8; length];
    reader.fetch(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| NetError::Fatal(ErrorKind::TypeMismatch))
}

/// A shared object loaded from or about to be written to a file.
pub struct ObjectSnapshot {
    pub name: String,
    pub dict: DataType,
    pub type_id: TypeId,
    pub value: Value,
}

/// One namespace object record.
pub struct NamespaceRecord {
    pub object_id: ObjectId,
    pub type_id: TypeId,
    pub version: VersionNumber,
    pub value: Value,
}

/// A namespace loaded from or about to be written to a file.
pub struct NamespaceSnapshot {
    pub name: String,
    pub dict: DataType,
    pub records: Vec<NamespaceRecord>,
}

pub fn save_object(path: &Path, snapshot: &ObjectSnapshot) -> NetResult<()> {
    let value_size = snapshot.dict.calc_value_size(snapshot.type_id, &snapshot.value)?;
    let total = MAGIC_LEN
        + string_size(&snapshot.name)
        + snapshot.dict.calc_dict_size()
        + 2
        + value_size;

    let mut writer = MessageWriter::with_capacity(0, total);
    writer.write_bytes(&magic_field(OBJECT_MAGIC))?;
    write_string(&mut writer, &snapshot.name)?;
    snapshot.dict.write_dict(&mut writer)?;
    writer.write_u16(snapshot.type_id)?;
    snapshot
        .dict
        .write_value(snapshot.type_id, &snapshot.value, &mut writer)?;

    write_file(path, writer.into_buffer().body())
}

pub fn load_object(path: &Path) -> NetResult<ObjectSnapshot> {
    let bytes = read_file(path)?;
    let mut reader = MessageReader::over_bytes(&bytes, false);

    let mut magic = [0u8; MAGIC_LEN];
    reader.fetch(&mut magic)?;
    if magic != magic_field(OBJECT_MAGIC) {
        return Err(NetError::Fatal(ErrorKind::MalformedHandshake));
    }

    let name = read_string(&mut reader)?;
    let dict = DataType::read_dict(&mut reader)?;
    let type_id = reader.read_u16()?;
    if !dict.is_defined(type_id) {
        return Err(NetError::Fatal(ErrorKind::UndefinedType(type_id)));
    }
    let value = dict.read_value(type_id, &mut reader)?;

    Ok(ObjectSnapshot {
        name,
        dict,
        type_id,
        value,
    })
}

pub fn save_namespace(path: &Path, snapshot: &NamespaceSnapshot) -> NetResult<()> {
    let mut total = MAGIC_LEN
        + string_size(&snapshot.name)
        + snapshot.dict.calc_dict_size()
        + varint::size(snapshot.records.len() as u32);
    for record in &snapshot.records {
        total += 2 + 2 + 1 + snapshot.dict.calc_value_size(record.type_id, &record.value)?;
    }

    let mut writer = MessageWriter::with_capacity(0, total);
    writer.write_bytes(&magic_field(NAMESPACE_MAGIC))?;
    write_string(&mut writer, &snapshot.name)?;
    snapshot.dict.write_dict(&mut writer)?;
    varint::write(&mut writer, snapshot.records.len() as u32)?;
    for record in &snapshot.records {
        writer.write_u16(record.object_id)?;
        writer.write_u16(record.type_id)?;
        writer.write_u8(record.version)?;
        snapshot
            .dict
            .write_value(record.type_id, &record.value, &mut writer)?;
    }

    write_file(path, writer.into_buffer().body())
}

pub fn load_namespace(path: &Path) -> NetResult<NamespaceSnapshot> {
    let bytes = read_file(path)?;
    let mut reader = MessageReader::over_bytes(&bytes, false);

    let mut magic = [0u8; MAGIC_LEN];
    reader.fetch(&mut magic)?;
    if magic != magic_field(NAMESPACE_MAGIC) {
        return Err(NetError::Fatal(ErrorKind::MalformedHandshake));
    }

    let name = read_string(&mut reader)?;
    let dict = DataType::read_dict(&mut reader)?;
    let count = varint::read(&mut reader)? as usize;

    let mut records = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let object_id = reader.read_u16()?;
        let type_id = reader.read_u16()?;
        let version = reader.read_u8()?;
        if !dict.is_defined(type_id) {
            return Err(NetError::Fatal(ErrorKind::UndefinedType(type_id)));
        }
        let value = dict.read_value(type_id, &mut reader)?;
        records.push(NamespaceRecord {
            object_id,
            type_id,
            version,
            value,
        });
    }

    Ok(NamespaceSnapshot {
        name,
        dict,
        records,
    })
}

fn write_file(path: &Path, bytes: &[u8]) -> NetResult<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    Ok(())
}

fn read_file(path: &Path) -> NetResult<Vec<u8>> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit::datatype::AtomicType;

    fn sample() -> ObjectSnapshot {
        let mut dict = DataType::new();
        let vector = dict.add_vector(AtomicType::Float32.id()).unwrap();
        let root = dict
            .add_structure(&[AtomicType::String.id(), vector])
            .unwrap();
        ObjectSnapshot {
            name: "cursor".to_owned(),
            dict,
            type_id: root,
            value: Value::Structure(vec![
                Value::String("marker".to_owned()),
                Value::Vector(vec![Value::Float32(1.0), Value::Float32(-0.5)]),
            ]),
        }
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("koinonia-test-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn test_object_snapshot_roundtrip() {
        let path = temp_path("object");
        let snapshot = sample();
        save_object(&path, &snapshot).unwrap();

        let loaded = load_object(&path).unwrap();
        assert_eq!(loaded.name, snapshot.name);
        assert_eq!(loaded.dict, snapshot.dict);
        assert_eq!(loaded.type_id, snapshot.type_id);
        assert_eq!(loaded.value, snapshot.value);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_namespace_snapshot_roundtrip() {
        let path = temp_path("namespace");
        let object = sample();
        let snapshot = NamespaceSnapshot {
            name: "scene".to_owned(),
            dict: object.dict.clone(),
            records: vec![
                NamespaceRecord {
                    object_id: 1,
                    type_id: object.type_id,
                    version: 3,
                    value: object.value.clone(),
                },
                NamespaceRecord {
                    object_id: 2,
                    type_id: AtomicType::UInt32.id(),
                    version: 0,
                    value: Value::UInt32(99),
                },
            ],
        };
        save_namespace(&path, &snapshot).unwrap();

        let loaded = load_namespace(&path).unwrap();
        assert_eq!(loaded.name, snapshot.name);
        assert_eq!(loaded.dict, snapshot.dict);
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.records[0].value, snapshot.records[0].value);
        assert_eq!(loaded.records[1].version, 0);
        assert_eq!(loaded.records[1].value, Value::UInt32(99));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_wrong_magic_is_rejected() {
        let path = temp_path("magic");
        let snapshot = sample();
        save_object(&path, &snapshot).unwrap();

        assert!(load_namespace(&path).is_err());
        std::fs::remove_file(path).ok();
    }
}
