//! Runtime message descriptors. A descriptor carries everything the decoder
//! needs to lay a message out in memory: field ids, declared types, storage
//! offsets and flags. Descriptors are long-lived, read-only values, normally
//! produced by a generator or loader and referenced as statics.

use core::alloc::Layout;
use core::mem::{align_of, size_of};

use bitflags::bitflags;

use crate::base::Message;
use crate::containers::{Bytes, RepeatedField, String};
use crate::error::DecodeError;

/// Sentinel stamped into every descriptor; a mismatch means the caller
/// handed something that is not a descriptor at all.
pub const MESSAGE_DESCRIPTOR_MAGIC: u32 = 0x4D44_5950;

/// Declared type of a field's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Int32,
    Sint32,
    Uint32,
    Sfixed32,
    Fixed32,
    Float,
    Int64,
    Sint64,
    Uint64,
    Sfixed64,
    Fixed64,
    Double,
    Bool,
    Enum,
    String,
    Bytes,
    Message,
    // Never produced by a valid descriptor.
    Error,
    Group,
}

/// Field cardinality. `Error` is a leftover sentinel from descriptor
/// evolution and is treated as optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Label {
    Error,
    Required,
    Optional,
    Repeated,
}

bitflags! {
    /// Per-field attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u32 {
        /// Repeated scalar encoded as one length-delimited record.
        const PACKED = 1 << 0;
        /// Member of a oneof group; `quantifier_offset` locates the
        /// group's discriminator.
        const ONEOF = 1 << 1;
    }
}

/// Descriptor-declared default for a non-repeated field, copied into the
/// message at init time. String and message defaults have no
/// representation here; absent fields of those types stay empty/unset.
#[derive(Debug, Clone, Copy)]
pub enum DefaultValue {
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Enum(i32),
    F32(f32),
    F64(f64),
    Bytes(&'static [u8]),
}

/// Child descriptor of a message- or enum-typed field.
#[derive(Clone, Copy)]
pub enum FieldRef {
    Message(&'static MessageDescriptor),
    Enum(&'static EnumDescriptor),
}

pub struct EnumValue {
    pub name: &'static str,
    pub number: i32,
}

pub struct EnumDescriptor {
    pub name: &'static str,
    pub values: &'static [EnumValue],
}

impl EnumDescriptor {
    /// Resolve a wire number to its canonical value: the first declared
    /// value with that number. Aliased numbers all map to the same entry;
    /// the decoder itself stores the wire number verbatim.
    pub fn canonical(&self, number: i32) -> Option<&EnumValue> {
        self.values.iter().find(|v| v.number == number)
    }
}

/// Custom initializer: zero, stamp the descriptor and apply defaults in one
/// descriptor-supplied callback instead of the generic path.
pub type MessageInit = unsafe fn(&mut [u8]);

pub struct FieldDescriptor {
    pub name: &'static str,
    pub id: u32,
    pub label: Label,
    pub kind: FieldType,
    /// Byte offset of the field's storage from the start of the message.
    pub offset: usize,
    /// For oneof members, the offset of the group's u32 discriminator
    /// (selected field id, 0 = unset). Repeated counts live inside the
    /// list header, so no separate count slot exists.
    pub quantifier_offset: usize,
    pub default_value: Option<DefaultValue>,
    pub reference: Option<FieldRef>,
    pub flags: FieldFlags,
}

impl FieldDescriptor {
    pub fn is_repeated(&self) -> bool {
        matches!(self.label, Label::Repeated)
    }

    pub fn is_packed(&self) -> bool {
        self.flags.contains(FieldFlags::PACKED)
    }

    pub fn is_oneof(&self) -> bool {
        self.flags.contains(FieldFlags::ONEOF)
    }

    pub fn message_descriptor(&self) -> Result<&'static MessageDescriptor, DecodeError> {
        match self.reference {
            Some(FieldRef::Message(desc)) => Ok(desc),
            _ => Err(DecodeError::DescriptorMissing),
        }
    }

    pub fn enum_descriptor(&self) -> Result<&'static EnumDescriptor, DecodeError> {
        match self.reference {
            Some(FieldRef::Enum(desc)) => Ok(desc),
            _ => Err(DecodeError::DescriptorMissing),
        }
    }
}

pub struct MessageDescriptor {
    pub magic: u32,
    pub name: &'static str,
    /// Full size of a message region: header plus field storage.
    pub sizeof_message: usize,
    pub fields: &'static [FieldDescriptor],
    /// Parallel to `fields`, sorted ascending for binary search.
    pub field_ids: &'static [u32],
    pub message_init: Option<MessageInit>,
}

impl MessageDescriptor {
    /// Index of the field with the given id, if any.
    pub fn field_index(&self, id: u32) -> Option<usize> {
        int_range_lookup(self.field_ids, id)
    }

    /// Load-time checks: the layout invariants every decode relies on.
    /// Structural violations are descriptor-author bugs and panic; a
    /// message- or enum-typed field without a child descriptor is reported
    /// as `DescriptorMissing`.
    pub fn verify(&self) -> Result<(), DecodeError> {
        assert_eq!(
            self.magic, MESSAGE_DESCRIPTOR_MAGIC,
            "corrupt message descriptor"
        );
        assert_eq!(self.fields.len(), self.field_ids.len());
        assert!(self.fields.len() <= 64, "too many fields for the has-word");
        assert!(self.sizeof_message >= size_of::<Message>());
        assert!(self
            .field_ids
            .windows(2)
            .all(|w| w[0] < w[1]));

        for (field, &id) in self.fields.iter().zip(self.field_ids) {
            assert_eq!(field.id, id);
            assert!(!matches!(field.kind, FieldType::Error | FieldType::Group));

            if matches!(field.kind, FieldType::Message | FieldType::Enum)
                && field.reference.is_none()
            {
                return Err(DecodeError::DescriptorMissing);
            }

            let (size, align) = if field.is_repeated() {
                (size_of::<RepeatedField<u8>>(), align_of::<RepeatedField<u8>>())
            } else if matches!(field.kind, FieldType::Message) {
                // singular sub-messages are stored inline
                let child = field.message_descriptor()?;
                (child.sizeof_message, align_of::<u64>())
            } else {
                let layout = element_layout(field.kind);
                (layout.size(), layout.align())
            };
            assert!(field.offset >= size_of::<Message>());
            assert!(field.offset + size <= self.sizeof_message);
            assert_eq!(field.offset % align, 0, "misaligned field offset");

            if field.is_oneof() {
                assert!(field.quantifier_offset >= size_of::<Message>());
                assert!(field.quantifier_offset + size_of::<u32>() <= self.sizeof_message);
                assert_eq!(field.quantifier_offset % align_of::<u32>(), 0);
            }
        }
        Ok(())
    }
}

/// Find `value` in a sorted id sequence.
pub fn int_range_lookup(ids: &[u32], value: u32) -> Option<usize> {
    ids.binary_search(&value).ok()
}

/// Element layout for repeated-field storage of the given type.
pub fn element_layout(kind: FieldType) -> Layout {
    match kind {
        FieldType::Int32 | FieldType::Sint32 | FieldType::Sfixed32 | FieldType::Enum => {
            Layout::new::<i32>()
        }
        FieldType::Uint32 | FieldType::Fixed32 => Layout::new::<u32>(),
        FieldType::Float => Layout::new::<f32>(),
        FieldType::Int64 | FieldType::Sint64 | FieldType::Sfixed64 => Layout::new::<i64>(),
        FieldType::Uint64 | FieldType::Fixed64 => Layout::new::<u64>(),
        FieldType::Double => Layout::new::<f64>(),
        FieldType::Bool => Layout::new::<bool>(),
        FieldType::String => Layout::new::<String>(),
        FieldType::Bytes => Layout::new::<Bytes>(),
        FieldType::Message => Layout::new::<*mut Message>(),
        FieldType::Error | FieldType::Group => unreachable!("unsupported field type"),
    }
}

/// Per-type element width for list allocation.
pub fn repeated_ele_size(kind: FieldType) -> usize {
    element_layout(kind).size()
}

/// True for every type that may appear in a packed record.
pub fn is_packable_type(kind: FieldType) -> bool {
    !matches!(
        kind,
        FieldType::String
            | FieldType::Bytes
            | FieldType::Message
            | FieldType::Error
            | FieldType::Group
    )
}

/// Bytes occupied by a singular field's storage; sub-messages count their
/// whole inline region.
pub(crate) fn singular_storage_size(field: &FieldDescriptor) -> usize {
    match field.kind {
        FieldType::Message => match field.reference {
            Some(FieldRef::Message(desc)) => desc.sizeof_message,
            _ => 0,
        },
        _ => element_layout(field.kind).size(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_lookup() {
        let ids = [1, 3, 7, 200];
        assert_eq!(int_range_lookup(&ids, 1), Some(0));
        assert_eq!(int_range_lookup(&ids, 7), Some(2));
        assert_eq!(int_range_lookup(&ids, 200), Some(3));
        assert_eq!(int_range_lookup(&ids, 2), None);
        assert_eq!(int_range_lookup(&[], 1), None);
    }

    #[test]
    fn element_sizes() {
        assert_eq!(repeated_ele_size(FieldType::Int32), 4);
        assert_eq!(repeated_ele_size(FieldType::Enum), 4);
        assert_eq!(repeated_ele_size(FieldType::Float), 4);
        assert_eq!(repeated_ele_size(FieldType::Double), 8);
        assert_eq!(repeated_ele_size(FieldType::Fixed64), 8);
        assert_eq!(repeated_ele_size(FieldType::Bool), size_of::<bool>());
        assert_eq!(repeated_ele_size(FieldType::String), size_of::<String>());
        assert_eq!(repeated_ele_size(FieldType::Bytes), size_of::<Bytes>());
        assert_eq!(
            repeated_ele_size(FieldType::Message),
            size_of::<*mut Message>()
        );
    }

    #[test]
    fn packable_types() {
        assert!(is_packable_type(FieldType::Int32));
        assert!(is_packable_type(FieldType::Bool));
        assert!(is_packable_type(FieldType::Enum));
        assert!(is_packable_type(FieldType::Double));
        assert!(!is_packable_type(FieldType::String));
        assert!(!is_packable_type(FieldType::Bytes));
        assert!(!is_packable_type(FieldType::Message));
    }

    #[test]
    fn enum_alias_canonicalization() {
        static VALUES: [EnumValue; 3] = [
            EnumValue {
                name: "FIRST",
                number: 1,
            },
            EnumValue {
                name: "ALIAS_OF_FIRST",
                number: 1,
            },
            EnumValue {
                name: "SECOND",
                number: 2,
            },
        ];
        static DESC: EnumDescriptor = EnumDescriptor {
            name: "Aliased",
            values: &VALUES,
        };
        assert_eq!(DESC.canonical(1).unwrap().name, "FIRST");
        assert_eq!(DESC.canonical(2).unwrap().name, "SECOND");
        assert!(DESC.canonical(3).is_none());
    }
}
