//! Self-describing composite data types.
//!
//! A [`DataType`] is an ordered dictionary of compound type definitions
//! over a fixed set of atomic types. Plug-ins describe their values
//! once; the framework computes sizes and memory layout, serializes and
//! deserializes values, and swaps endianness of forwarded buffers.

mod io;
mod value;

pub use io::{DictReader, ReadProgress, ValueReader};
pub use value::{format_value, Value};

use crate::error::{ErrorKind, NetError, NetResult};

/// Index into the type dictionary. IDs below [`NUM_ATOMIC_TYPES`] are
/// atomic; compound types follow in definition order.
pub type TypeId = u16;

pub const NUM_ATOMIC_TYPES: TypeId = 14;

/// Placeholder target of a pointer type created by
/// [`DataType::create_pointer`] before `set_pointer_target` runs.
pub const UNSET_POINTER_TARGET: TypeId = TypeId::MAX;

/// Largest number of compound entries one dictionary can carry (the
/// wire form counts them in one byte).
pub const MAX_COMPOUND_TYPES: usize = 255;

/// Deepest nesting the streaming reader supports.
pub const MAX_READ_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicType {
    Bool = 0,
    Char = 1,
    SInt8 = 2,
    SInt16 = 3,
    SInt32 = 4,
    SInt64 = 5,
    UInt8 = 6,
    UInt16 = 7,
    UInt32 = 8,
    UInt64 = 9,
    Float32 = 10,
    Float64 = 11,
    VarInt = 12,
    String = 13,
}

impl AtomicType {
    pub fn from_id(id: TypeId) -> Option<AtomicType> {
        use AtomicType::*;
        const TABLE: [AtomicType; NUM_ATOMIC_TYPES as usize] = [
            Bool, Char, SInt8, SInt16, SInt32, SInt64, UInt8, UInt16, UInt32, UInt64, Float32,
            Float64, VarInt, String,
        ];
        TABLE.get(id as usize).copied()
    }

    pub fn id(self) -> TypeId {
        self as TypeId
    }
}

// Per-atomic minimum wire sizes, alignments and memory sizes, indexed by
// atomic ID. VarInt occupies four bytes in memory; String, Vector and
// Pointer are heap handles.
const ATOMIC_MIN_SIZES: [usize; NUM_ATOMIC_TYPES as usize] =
    [1, 1, 1, 2, 4, 8, 1, 2, 4, 8, 4, 8, 1, 1];
const ATOMIC_ALIGNMENTS: [usize; NUM_ATOMIC_TYPES as usize] =
    [1, 1, 1, 2, 4, 8, 1, 2, 4, 8, 4, 8, 4, 8];
const ATOMIC_MEM_SIZES: [usize; NUM_ATOMIC_TYPES as usize] =
    [1, 1, 1, 2, 4, 8, 1, 2, 4, 8, 4, 8, 4, 24];

const HANDLE_ALIGNMENT: usize = 8;
const POINTER_MEM_SIZE: usize = 8;
const VECTOR_MEM_SIZE: usize = 24;

/// One element of a structure: its type and its offset in the packed
/// memory layout, assigned at natural alignment as elements are
/// appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureElement {
    pub element_type: TypeId,
    pub mem_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompoundType {
    Pointer { element_type: TypeId },
    FixedArray { num_elements: usize, element_type: TypeId },
    Vector { element_type: TypeId },
    Structure { elements: Vec<StructureElement> },
}

#[derive(Debug, Clone, PartialEq)]
struct CompoundEntry {
    compound: CompoundType,
    min_size: usize,
    fixed_size: Option<usize>,
    alignment: usize,
    mem_size: usize,
}

/// An ordered dictionary of compound type definitions. Equality is
/// structural.
#[derive(Debug, Clone, PartialEq)]
pub struct DataType {
    compound_types: Vec<CompoundEntry>,
}

impl DataType {
    pub fn new() -> DataType {
        DataType {
            compound_types: Vec::new(),
        }
    }

    pub fn num_compound_types(&self) -> usize {
        self.compound_types.len()
    }

    /// True if `id` names an atomic or defined compound type.
    pub fn is_defined(&self, id: TypeId) -> bool {
        (id as usize) < NUM_ATOMIC_TYPES as usize + self.compound_types.len()
    }

    pub fn compound(&self, id: TypeId) -> NetResult<&CompoundType> {
        self.compound_types
            .get((id as usize).wrapping_sub(NUM_ATOMIC_TYPES as usize))
            .map(|entry| &entry.compound)
            .ok_or(NetError::Fatal(ErrorKind::UndefinedType(id)))
    }

    fn entry(&self, id: TypeId) -> NetResult<&CompoundEntry> {
        self.compound_types
            .get((id as usize).wrapping_sub(NUM_ATOMIC_TYPES as usize))
            .ok_or(NetError::Fatal(ErrorKind::UndefinedType(id)))
    }

    fn check_element(&self, id: TypeId) -> NetResult<()> {
        if self.is_defined(id) {
            Ok(())
        } else {
            Err(NetError::Fatal(ErrorKind::UndefinedType(id)))
        }
    }

    fn allocate(&mut self, entry: CompoundEntry) -> NetResult<TypeId> {
        if self.compound_types.len() >= MAX_COMPOUND_TYPES {
            return Err(NetError::Fatal(ErrorKind::SizeOverflow));
        }
        self.compound_types.push(entry);
        Ok(NUM_ATOMIC_TYPES + self.compound_types.len() as TypeId - 1)
    }

    /// Declares a pointer type whose target is fixed later with
    /// [`set_pointer_target`](DataType::set_pointer_target), permitting
    /// recursive types.
    pub fn create_pointer(&mut self) -> NetResult<TypeId> {
        self.allocate(CompoundEntry {
            compound: CompoundType::Pointer {
                element_type: UNSET_POINTER_TARGET,
            },
            min_size: 1,
            fixed_size: None,
            alignment: HANDLE_ALIGNMENT,
            mem_size: POINTER_MEM_SIZE,
        })
    }

    /// Fixes the target of a previously declared pointer type. The
    /// target may be any type defined by then, including higher-indexed
    /// ones — this is the only sanctioned forward reference.
    pub fn set_pointer_target(&mut self, pointer: TypeId, element: TypeId) -> NetResult<()> {
        self.check_element(element)?;
        let index = (pointer as usize).wrapping_sub(NUM_ATOMIC_TYPES as usize);
        match self.compound_types.get_mut(index) {
            Some(CompoundEntry {
                compound: CompoundType::Pointer { element_type },
                ..
            }) => {
                *element_type = element;
                Ok(())
            }
            _ => Err(NetError::Fatal(ErrorKind::UndefinedType(pointer))),
        }
    }

    pub fn add_pointer(&mut self, element: TypeId) -> NetResult<TypeId> {
        let pointer = self.create_pointer()?;
        self.set_pointer_target(pointer, element)?;
        Ok(pointer)
    }

    pub fn add_fixed_array(&mut self, num_elements: usize, element: TypeId) -> NetResult<TypeId> {
        if num_elements == 0 || num_elements > 65536 {
            return Err(NetError::Fatal(ErrorKind::SizeOverflow));
        }
        self.check_element(element)?;

        let element_entry = self.layout(element)?;
        self.allocate(CompoundEntry {
            compound: CompoundType::FixedArray {
                num_elements,
                element_type: element,
            },
            min_size: num_elements * element_entry.min_size,
            fixed_size: element_entry.fixed_size.map(|size| num_elements * size),
            alignment: element_entry.alignment,
            mem_size: num_elements * element_entry.mem_size,
        })
    }

    pub fn add_vector(&mut self, element: TypeId) -> NetResult<TypeId> {
        self.check_element(element)?;
        self.allocate(CompoundEntry {
            compound: CompoundType::Vector {
                element_type: element,
            },
            min_size: 1,
            fixed_size: None,
            alignment: HANDLE_ALIGNMENT,
            mem_size: VECTOR_MEM_SIZE,
        })
    }

    pub fn add_structure(&mut self, element_types: &[TypeId]) -> NetResult<TypeId> {
        if element_types.is_empty() || element_types.len() > 256 {
            return Err(NetError::Fatal(ErrorKind::ArityOverflow));
        }

        let mut elements = Vec::with_capacity(element_types.len());
        let mut offset = 0usize;
        let mut alignment = 1usize;
        let mut min_size = 0usize;
        let mut fixed_size = Some(0usize);
        for &element_type in element_types {
            self.check_element(element_type)?;
            let layout = self.layout(element_type)?;

            offset = align_up(offset, layout.alignment);
            elements.push(StructureElement {
                element_type,
                mem_offset: offset,
            });
            offset += layout.mem_size;
            alignment = alignment.max(layout.alignment);
            min_size += layout.min_size;
            fixed_size = match (fixed_size, layout.fixed_size) {
                (Some(total), Some(size)) => Some(total + size),
                _ => None,
            };
        }

        self.allocate(CompoundEntry {
            compound: CompoundType::Structure { elements },
            min_size,
            fixed_size,
            alignment,
            mem_size: align_up(offset, alignment),
        })
    }

    /// Verifies that every declared pointer has a target. Must pass
    /// before the dictionary is serialized or used for values.
    pub fn check_complete(&self) -> NetResult<()> {
        for (index, entry) in self.compound_types.iter().enumerate() {
            if let CompoundType::Pointer { element_type } = entry.compound {
                if element_type == UNSET_POINTER_TARGET {
                    return Err(NetError::Fatal(ErrorKind::UndefinedType(
                        NUM_ATOMIC_TYPES + index as TypeId,
                    )));
                }
                self.check_element(element_type)?;
            }
        }
        Ok(())
    }

    /// Minimum wire size of a value of type `id`.
    pub fn min_size(&self, id: TypeId) -> NetResult<usize> {
        Ok(self.layout(id)?.min_size)
    }

    /// Wire size of a value of type `id` if every value of the type
    /// serializes to the same length.
    pub fn fixed_size(&self, id: TypeId) -> NetResult<Option<usize>> {
        Ok(self.layout(id)?.fixed_size)
    }

    pub fn alignment(&self, id: TypeId) -> NetResult<usize> {
        Ok(self.layout(id)?.alignment)
    }

    pub fn mem_size(&self, id: TypeId) -> NetResult<usize> {
        Ok(self.layout(id)?.mem_size)
    }

    fn layout(&self, id: TypeId) -> NetResult<Layout> {
        if let Some(atomic) = AtomicType::from_id(id) {
            let index = atomic.id() as usize;
            let fixed = !matches!(atomic, AtomicType::VarInt | AtomicType::String);
            return Ok(Layout {
                min_size: ATOMIC_MIN_SIZES[index],
                fixed_size: if fixed {
                    Some(ATOMIC_MIN_SIZES[index])
                } else {
                    None
                },
                alignment: ATOMIC_ALIGNMENTS[index],
                mem_size: ATOMIC_MEM_SIZES[index],
            });
        }
        let entry = self.entry(id)?;
        Ok(Layout {
            min_size: entry.min_size,
            fixed_size: entry.fixed_size,
            alignment: entry.alignment,
            mem_size: entry.mem_size,
        })
    }
}

#[derive(Clone, Copy)]
struct Layout {
    min_size: usize,
    fixed_size: Option<usize>,
    alignment: usize,
    mem_size: usize,
}

fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) / alignment * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_layouts() {
        let dict = DataType::new();
        assert_eq!(dict.min_size(AtomicType::UInt32.id()).unwrap(), 4);
        assert_eq!(dict.fixed_size(AtomicType::UInt32.id()).unwrap(), Some(4));
        assert_eq!(dict.fixed_size(AtomicType::VarInt.id()).unwrap(), None);
        assert_eq!(dict.fixed_size(AtomicType::String.id()).unwrap(), None);
        assert_eq!(dict.min_size(AtomicType::String.id()).unwrap(), 1);
    }

    #[test]
    fn test_structure_offsets_use_natural_alignment() {
        let mut dict = DataType::new();
        let id = dict
            .add_structure(&[
                AtomicType::UInt8.id(),
                AtomicType::UInt32.id(),
                AtomicType::UInt16.id(),
            ])
            .unwrap();

        match dict.compound(id).unwrap() {
            CompoundType::Structure { elements } => {
                assert_eq!(elements[0].mem_offset, 0);
                assert_eq!(elements[1].mem_offset, 4);
                assert_eq!(elements[2].mem_offset, 8);
            }
            other => panic!("Unexpected compound {:?}", other),
        }
        assert_eq!(dict.mem_size(id).unwrap(), 12);
        assert_eq!(dict.alignment(id).unwrap(), 4);
        assert_eq!(dict.fixed_size(id).unwrap(), Some(7));
    }

    #[test]
    fn test_fixed_array_of_fixed_elements_is_fixed() {
        let mut dict = DataType::new();
        let id = dict.add_fixed_array(3, AtomicType::Float32.id()).unwrap();
        assert_eq!(dict.fixed_size(id).unwrap(), Some(12));
        assert_eq!(dict.min_size(id).unwrap(), 12);
    }

    #[test]
    fn test_vector_and_string_are_variable() {
        let mut dict = DataType::new();
        let vec_id = dict.add_vector(AtomicType::UInt64.id()).unwrap();
        assert_eq!(dict.fixed_size(vec_id).unwrap(), None);
        assert_eq!(dict.min_size(vec_id).unwrap(), 1);

        let struct_id = dict
            .add_structure(&[vec_id, AtomicType::UInt8.id()])
            .unwrap();
        assert_eq!(dict.fixed_size(struct_id).unwrap(), None);
        assert_eq!(dict.min_size(struct_id).unwrap(), 2);
    }

    #[test]
    fn test_recursive_type_via_two_phase_pointer() {
        // A linked list: node = { value: u32, next: *node }.
        let mut dict = DataType::new();
        let next = dict.create_pointer().unwrap();
        let node = dict
            .add_structure(&[AtomicType::UInt32.id(), next])
            .unwrap();

        assert!(dict.check_complete().is_err());
        dict.set_pointer_target(next, node).unwrap();
        assert!(dict.check_complete().is_ok());
    }

    #[test]
    fn test_undefined_references_are_rejected() {
        let mut dict = DataType::new();
        assert!(dict.add_vector(200).is_err());
        assert!(dict.add_fixed_array(4, 99).is_err());
        assert!(dict.add_structure(&[77]).is_err());
    }

    #[test]
    fn test_arity_and_size_limits() {
        let mut dict = DataType::new();
        assert_eq!(
            dict.add_fixed_array(0, AtomicType::UInt8.id()),
            Err(NetError::Fatal(ErrorKind::SizeOverflow))
        );
        assert_eq!(
            dict.add_fixed_array(65537, AtomicType::UInt8.id()),
            Err(NetError::Fatal(ErrorKind::SizeOverflow))
        );
        assert_eq!(
            dict.add_structure(&[]),
            Err(NetError::Fatal(ErrorKind::ArityOverflow))
        );
        let too_many = vec![AtomicType::UInt8.id(); 257];
        assert_eq!(
            dict.add_structure(&too_many),
            Err(NetError::Fatal(ErrorKind::ArityOverflow))
        );
    }

    #[test]
    fn test_structural_equality() {
        let mut a = DataType::new();
        a.add_structure(&[AtomicType::UInt8.id(), AtomicType::Float32.id()])
            .unwrap();
        let mut b = DataType::new();
        b.add_structure(&[AtomicType::UInt8.id(), AtomicType::Float32.id()])
            .unwrap();
        let mut c = DataType::new();
        c.add_structure(&[AtomicType::Float32.id(), AtomicType::UInt8.id()])
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
