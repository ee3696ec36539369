//! The decode pipeline: scan the buffer once to match fields and tally
//! repeated-element counts, size every list exactly, then parse the scanned
//! records into the message. Two passes keep repeated storage at one
//! allocation per list.

use core::ptr::NonNull;

use log::trace;

use crate::arena::Arena;
use crate::base::{alloc_message_region, init_message, Message, UnknownField};
use crate::containers::{Bytes, RepeatedField, String};
use crate::descriptor::{is_packable_type, FieldDescriptor, FieldType, Label, MessageDescriptor};
use crate::error::DecodeError;
use crate::wire::{zigzag_decode32, zigzag_decode64, Key, ReadCursor, WireType};

/// Nesting bound for hostile inputs.
pub(crate) const MAX_RECURSION_DEPTH: usize = 100;

/// One record matched during the scan pass. `data` is the payload without
/// the key; for length-delimited records it still carries the length
/// prefix, with `prefix_len` telling downstream parsers where the payload
/// proper starts.
struct ScannedMember<'a> {
    key: Key,
    field: Option<(usize, &'static FieldDescriptor)>,
    prefix_len: usize,
    data: &'a [u8],
}

impl ScannedMember<'_> {
    fn payload(&self) -> &[u8] {
        &self.data[self.prefix_len..]
    }
}

struct ScanOutcome<'a> {
    members: Vec<ScannedMember<'a>>,
    /// Repeated-element tallies, indexed like `desc.fields`.
    counts: Vec<usize>,
    unknown: usize,
}

/// First pass: walk the whole buffer, matching keys against the descriptor
/// and framing each record's payload by wire type.
fn scan_members<'a>(
    desc: &'static MessageDescriptor,
    cursor: &mut ReadCursor<'a>,
) -> Result<ScanOutcome<'a>, DecodeError> {
    let mut members = Vec::new();
    let mut counts = vec![0usize; desc.fields.len()];
    let mut unknown = 0usize;
    // Encoders typically emit fields in declaration order, so the previous
    // match usually answers the next key too.
    let mut last_field: Option<(usize, &'static FieldDescriptor)> = None;

    while cursor.remaining() > 0 {
        let key = cursor.read_key()?;

        let matched = match last_field {
            Some((idx, field)) if field.id == key.field_id => Some((idx, field)),
            _ => desc
                .field_index(key.field_id)
                .map(|idx| (idx, &desc.fields[idx])),
        };
        last_field = matched;
        if matched.is_none() {
            unknown += 1;
            trace!(
                "unknown field {} ({:?}) in {}",
                key.field_id,
                key.wire_type,
                desc.name
            );
        }

        let (prefix_len, data) = match key.wire_type {
            WireType::Varint => {
                let rest = cursor.rest();
                let before = cursor.remaining();
                cursor.read_varint()?;
                (0, &rest[..before - cursor.remaining()])
            }
            WireType::I64 => (0, cursor.read_slice(8).map_err(|_| DecodeError::InvalidData)?),
            WireType::I32 => (0, cursor.read_slice(4).map_err(|_| DecodeError::InvalidData)?),
            WireType::Len => {
                let rest = cursor.rest();
                let (prefix_len, payload_len) = cursor.read_length_prefix()?;
                cursor.skip(payload_len)?;
                (prefix_len, &rest[..prefix_len + payload_len])
            }
            WireType::SGroup | WireType::EGroup => return Err(DecodeError::InvalidType),
        };

        if let Some((idx, field)) = matched {
            if field.is_repeated() {
                counts[idx] += if key.wire_type == WireType::Len
                    && (field.is_packed() || is_packable_type(field.kind))
                {
                    count_packed_elements(&data[prefix_len..], field.kind)?
                } else {
                    1
                };
            }
        }

        members.push(ScannedMember {
            key,
            field: matched,
            prefix_len,
            data,
        });
    }
    debug_assert_eq!(cursor.remaining(), 0);

    Ok(ScanOutcome {
        members,
        counts,
        unknown,
    })
}

/// Elements in a packed payload, without decoding them.
fn count_packed_elements(payload: &[u8], kind: FieldType) -> Result<usize, DecodeError> {
    match kind {
        FieldType::Sfixed32 | FieldType::Fixed32 | FieldType::Float => {
            if payload.len() % 4 != 0 {
                return Err(DecodeError::InvalidType);
            }
            Ok(payload.len() / 4)
        }
        FieldType::Sfixed64 | FieldType::Fixed64 | FieldType::Double => {
            if payload.len() % 8 != 0 {
                return Err(DecodeError::InvalidType);
            }
            Ok(payload.len() / 8)
        }
        FieldType::Bool => Ok(payload.len()),
        FieldType::Int32
        | FieldType::Sint32
        | FieldType::Uint32
        | FieldType::Int64
        | FieldType::Sint64
        | FieldType::Uint64
        | FieldType::Enum => Ok(payload.iter().filter(|&&b| b < 0x80).count()),
        FieldType::String
        | FieldType::Bytes
        | FieldType::Message
        | FieldType::Error
        | FieldType::Group => Err(DecodeError::InvalidType),
    }
}

/// Size every repeated field's backing storage exactly once from the scan
/// tallies, and reserve the unknown list.
fn reserve_storage(
    msg: &mut Message,
    desc: &'static MessageDescriptor,
    counts: &[usize],
    unknown: usize,
    arena: &mut Arena,
) {
    for (field, &count) in desc.fields.iter().zip(counts) {
        if count == 0 || !field.is_repeated() {
            continue;
        }
        unsafe {
            match field.kind {
                FieldType::Int32 | FieldType::Sint32 | FieldType::Sfixed32 | FieldType::Enum => {
                    msg.ref_mut::<RepeatedField<i32>>(field.offset)
                        .reserve(count, arena)
                }
                FieldType::Uint32 | FieldType::Fixed32 => msg
                    .ref_mut::<RepeatedField<u32>>(field.offset)
                    .reserve(count, arena),
                FieldType::Float => msg
                    .ref_mut::<RepeatedField<f32>>(field.offset)
                    .reserve(count, arena),
                FieldType::Int64 | FieldType::Sint64 | FieldType::Sfixed64 => msg
                    .ref_mut::<RepeatedField<i64>>(field.offset)
                    .reserve(count, arena),
                FieldType::Uint64 | FieldType::Fixed64 => msg
                    .ref_mut::<RepeatedField<u64>>(field.offset)
                    .reserve(count, arena),
                FieldType::Double => msg
                    .ref_mut::<RepeatedField<f64>>(field.offset)
                    .reserve(count, arena),
                FieldType::Bool => msg
                    .ref_mut::<RepeatedField<bool>>(field.offset)
                    .reserve(count, arena),
                FieldType::String => msg
                    .ref_mut::<RepeatedField<String>>(field.offset)
                    .reserve(count, arena),
                FieldType::Bytes => msg
                    .ref_mut::<RepeatedField<Bytes>>(field.offset)
                    .reserve(count, arena),
                FieldType::Message => msg
                    .ref_mut::<RepeatedField<*mut Message>>(field.offset)
                    .reserve(count, arena),
                FieldType::Error | FieldType::Group => unreachable!(),
            }
        }
    }
    if unknown > 0 {
        msg.unknown_fields_mut().reserve(unknown, arena);
    }
}

fn expect_wire(member: &ScannedMember<'_>, want: WireType) -> Result<(), DecodeError> {
    if member.key.wire_type == want {
        Ok(())
    } else {
        Err(DecodeError::InvalidType)
    }
}

/// Second pass: dispatch every scanned record to its writer.
fn parse_members(
    msg: &mut Message,
    desc: &'static MessageDescriptor,
    members: &[ScannedMember<'_>],
    arena: &mut Arena,
    depth: usize,
) -> Result<(), DecodeError> {
    // Bit per required field, checked once the whole buffer is parsed.
    let mut required_seen: u64 = 0;

    for member in members {
        let Some((idx, field)) = member.field else {
            let data = Bytes::from_slice(member.data, arena);
            msg.unknown_fields_mut().push(
                UnknownField {
                    key: member.key,
                    data,
                },
                arena,
            );
            continue;
        };

        match field.label {
            Label::Required => {
                required_seen |= 1 << idx;
                parse_singular_value(msg, field, member, arena, depth)?;
            }
            Label::Optional | Label::Error => {
                if field.is_oneof() {
                    msg.take_oneof(desc, field);
                    parse_singular_value(msg, field, member, arena, depth)?;
                } else {
                    parse_singular_value(msg, field, member, arena, depth)?;
                    msg.set_has_bit(idx);
                }
            }
            Label::Repeated => {
                if member.key.wire_type == WireType::Len
                    && (field.is_packed() || is_packable_type(field.kind))
                {
                    parse_packed_elements(msg, field, member.payload(), arena)?;
                } else {
                    parse_repeated_element(msg, field, member, arena, depth)?;
                }
            }
        }
    }

    for (idx, field) in desc.fields.iter().enumerate() {
        if matches!(field.label, Label::Required) && required_seen & (1 << idx) == 0 {
            return Err(DecodeError::FieldMissing(field.name));
        }
    }
    Ok(())
}

/// Store one value at the field's offset.
fn parse_singular_value(
    msg: &mut Message,
    field: &'static FieldDescriptor,
    member: &ScannedMember<'_>,
    arena: &mut Arena,
    depth: usize,
) -> Result<(), DecodeError> {
    let mut cursor = ReadCursor::new(member.data);
    unsafe {
        match field.kind {
            FieldType::Int32 | FieldType::Enum => {
                expect_wire(member, WireType::Varint)?;
                *msg.ref_mut::<i32>(field.offset) = cursor.read_varint()? as i32;
            }
            FieldType::Sint32 => {
                expect_wire(member, WireType::Varint)?;
                *msg.ref_mut::<i32>(field.offset) = zigzag_decode32(cursor.read_varint()? as u32);
            }
            FieldType::Uint32 => {
                expect_wire(member, WireType::Varint)?;
                *msg.ref_mut::<u32>(field.offset) = cursor.read_varint()? as u32;
            }
            FieldType::Int64 => {
                expect_wire(member, WireType::Varint)?;
                *msg.ref_mut::<i64>(field.offset) = cursor.read_varint()? as i64;
            }
            FieldType::Sint64 => {
                expect_wire(member, WireType::Varint)?;
                *msg.ref_mut::<i64>(field.offset) = zigzag_decode64(cursor.read_varint()?);
            }
            FieldType::Uint64 => {
                expect_wire(member, WireType::Varint)?;
                *msg.ref_mut::<u64>(field.offset) = cursor.read_varint()?;
            }
            FieldType::Bool => {
                expect_wire(member, WireType::Varint)?;
                *msg.ref_mut::<bool>(field.offset) = cursor.read_bool()?;
            }
            FieldType::Sfixed32 => {
                expect_wire(member, WireType::I32)?;
                *msg.ref_mut::<i32>(field.offset) = cursor.read_fixed32()? as i32;
            }
            FieldType::Fixed32 => {
                expect_wire(member, WireType::I32)?;
                *msg.ref_mut::<u32>(field.offset) = cursor.read_fixed32()?;
            }
            FieldType::Float => {
                expect_wire(member, WireType::I32)?;
                *msg.ref_mut::<f32>(field.offset) = f32::from_bits(cursor.read_fixed32()?);
            }
            FieldType::Sfixed64 => {
                expect_wire(member, WireType::I64)?;
                *msg.ref_mut::<i64>(field.offset) = cursor.read_fixed64()? as i64;
            }
            FieldType::Fixed64 => {
                expect_wire(member, WireType::I64)?;
                *msg.ref_mut::<u64>(field.offset) = cursor.read_fixed64()?;
            }
            FieldType::Double => {
                expect_wire(member, WireType::I64)?;
                *msg.ref_mut::<f64>(field.offset) = f64::from_bits(cursor.read_fixed64()?);
            }
            FieldType::String => {
                expect_wire(member, WireType::Len)?;
                *msg.ref_mut::<String>(field.offset) =
                    String::copy_nul_terminated(member.payload(), arena);
            }
            FieldType::Bytes => {
                expect_wire(member, WireType::Len)?;
                *msg.ref_mut::<Bytes>(field.offset) = Bytes::from_slice(member.payload(), arena);
            }
            FieldType::Message => {
                expect_wire(member, WireType::Len)?;
                if depth >= MAX_RECURSION_DEPTH {
                    return Err(DecodeError::InvalidData);
                }
                let child_desc = field.message_descriptor()?;
                let base = msg as *mut Message as *mut u8;
                let buf = core::slice::from_raw_parts_mut(
                    base.add(field.offset),
                    child_desc.sizeof_message,
                );
                deserialize_to(child_desc, member.payload(), buf, arena, depth + 1)?;
            }
            FieldType::Error | FieldType::Group => return Err(DecodeError::InvalidType),
        }
    }
    Ok(())
}

/// Append one element to a repeated field's preallocated list.
fn parse_repeated_element(
    msg: &mut Message,
    field: &'static FieldDescriptor,
    member: &ScannedMember<'_>,
    arena: &mut Arena,
    depth: usize,
) -> Result<(), DecodeError> {
    let mut cursor = ReadCursor::new(member.data);
    unsafe {
        match field.kind {
            FieldType::Int32 | FieldType::Enum => {
                expect_wire(member, WireType::Varint)?;
                let v = cursor.read_varint()? as i32;
                msg.ref_mut::<RepeatedField<i32>>(field.offset).push(v, arena);
            }
            FieldType::Sint32 => {
                expect_wire(member, WireType::Varint)?;
                let v = zigzag_decode32(cursor.read_varint()? as u32);
                msg.ref_mut::<RepeatedField<i32>>(field.offset).push(v, arena);
            }
            FieldType::Uint32 => {
                expect_wire(member, WireType::Varint)?;
                let v = cursor.read_varint()? as u32;
                msg.ref_mut::<RepeatedField<u32>>(field.offset).push(v, arena);
            }
            FieldType::Int64 => {
                expect_wire(member, WireType::Varint)?;
                let v = cursor.read_varint()? as i64;
                msg.ref_mut::<RepeatedField<i64>>(field.offset).push(v, arena);
            }
            FieldType::Sint64 => {
                expect_wire(member, WireType::Varint)?;
                let v = zigzag_decode64(cursor.read_varint()?);
                msg.ref_mut::<RepeatedField<i64>>(field.offset).push(v, arena);
            }
            FieldType::Uint64 => {
                expect_wire(member, WireType::Varint)?;
                let v = cursor.read_varint()?;
                msg.ref_mut::<RepeatedField<u64>>(field.offset).push(v, arena);
            }
            FieldType::Bool => {
                expect_wire(member, WireType::Varint)?;
                let v = cursor.read_bool()?;
                msg.ref_mut::<RepeatedField<bool>>(field.offset).push(v, arena);
            }
            FieldType::Sfixed32 => {
                expect_wire(member, WireType::I32)?;
                let v = cursor.read_fixed32()? as i32;
                msg.ref_mut::<RepeatedField<i32>>(field.offset).push(v, arena);
            }
            FieldType::Fixed32 => {
                expect_wire(member, WireType::I32)?;
                let v = cursor.read_fixed32()?;
                msg.ref_mut::<RepeatedField<u32>>(field.offset).push(v, arena);
            }
            FieldType::Float => {
                expect_wire(member, WireType::I32)?;
                let v = f32::from_bits(cursor.read_fixed32()?);
                msg.ref_mut::<RepeatedField<f32>>(field.offset).push(v, arena);
            }
            FieldType::Sfixed64 => {
                expect_wire(member, WireType::I64)?;
                let v = cursor.read_fixed64()? as i64;
                msg.ref_mut::<RepeatedField<i64>>(field.offset).push(v, arena);
            }
            FieldType::Fixed64 => {
                expect_wire(member, WireType::I64)?;
                let v = cursor.read_fixed64()?;
                msg.ref_mut::<RepeatedField<u64>>(field.offset).push(v, arena);
            }
            FieldType::Double => {
                expect_wire(member, WireType::I64)?;
                let v = f64::from_bits(cursor.read_fixed64()?);
                msg.ref_mut::<RepeatedField<f64>>(field.offset).push(v, arena);
            }
            FieldType::String => {
                expect_wire(member, WireType::Len)?;
                let v = String::copy_nul_terminated(member.payload(), arena);
                msg.ref_mut::<RepeatedField<String>>(field.offset).push(v, arena);
            }
            FieldType::Bytes => {
                expect_wire(member, WireType::Len)?;
                let v = Bytes::from_slice(member.payload(), arena);
                msg.ref_mut::<RepeatedField<Bytes>>(field.offset).push(v, arena);
            }
            FieldType::Message => {
                expect_wire(member, WireType::Len)?;
                if depth >= MAX_RECURSION_DEPTH {
                    return Err(DecodeError::InvalidData);
                }
                let child_desc = field.message_descriptor()?;
                let child = deserialize(child_desc, member.payload(), arena, depth + 1)?;
                msg.ref_mut::<RepeatedField<*mut Message>>(field.offset)
                    .push(child.as_ptr(), arena);
            }
            FieldType::Error | FieldType::Group => return Err(DecodeError::InvalidType),
        }
    }
    Ok(())
}

/// Decode a packed payload: elements of the field's scalar type until the
/// payload is exhausted, appended to the preallocated list.
fn parse_packed_elements(
    msg: &mut Message,
    field: &'static FieldDescriptor,
    payload: &[u8],
    arena: &mut Arena,
) -> Result<(), DecodeError> {
    let mut cursor = ReadCursor::new(payload);
    unsafe {
        match field.kind {
            FieldType::Int32 | FieldType::Enum => {
                let list = msg.ref_mut::<RepeatedField<i32>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(cursor.read_varint()? as i32, arena);
                }
            }
            FieldType::Sint32 => {
                let list = msg.ref_mut::<RepeatedField<i32>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(zigzag_decode32(cursor.read_varint()? as u32), arena);
                }
            }
            FieldType::Uint32 => {
                let list = msg.ref_mut::<RepeatedField<u32>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(cursor.read_varint()? as u32, arena);
                }
            }
            FieldType::Int64 => {
                let list = msg.ref_mut::<RepeatedField<i64>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(cursor.read_varint()? as i64, arena);
                }
            }
            FieldType::Sint64 => {
                let list = msg.ref_mut::<RepeatedField<i64>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(zigzag_decode64(cursor.read_varint()?), arena);
                }
            }
            FieldType::Uint64 => {
                let list = msg.ref_mut::<RepeatedField<u64>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(cursor.read_varint()?, arena);
                }
            }
            FieldType::Bool => {
                let list = msg.ref_mut::<RepeatedField<bool>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(cursor.read_bool()?, arena);
                }
            }
            FieldType::Sfixed32 => {
                let list = msg.ref_mut::<RepeatedField<i32>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(cursor.read_fixed32()? as i32, arena);
                }
            }
            FieldType::Fixed32 => {
                let list = msg.ref_mut::<RepeatedField<u32>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(cursor.read_fixed32()?, arena);
                }
            }
            FieldType::Float => {
                let list = msg.ref_mut::<RepeatedField<f32>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(f32::from_bits(cursor.read_fixed32()?), arena);
                }
            }
            FieldType::Sfixed64 => {
                let list = msg.ref_mut::<RepeatedField<i64>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(cursor.read_fixed64()? as i64, arena);
                }
            }
            FieldType::Fixed64 => {
                let list = msg.ref_mut::<RepeatedField<u64>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(cursor.read_fixed64()?, arena);
                }
            }
            FieldType::Double => {
                let list = msg.ref_mut::<RepeatedField<f64>>(field.offset);
                while cursor.remaining() > 0 {
                    list.push(f64::from_bits(cursor.read_fixed64()?), arena);
                }
            }
            FieldType::String
            | FieldType::Bytes
            | FieldType::Message
            | FieldType::Error
            | FieldType::Group => return Err(DecodeError::InvalidType),
        }
    }
    Ok(())
}

/// Decode `data` into `buf`, a region of exactly `desc.sizeof_message`
/// bytes. The region is initialized first unless it already holds a message
/// of this type, in which case the records merge into it.
pub(crate) fn deserialize_to(
    desc: &'static MessageDescriptor,
    data: &[u8],
    buf: &mut [u8],
    arena: &mut Arena,
    depth: usize,
) -> Result<(), DecodeError> {
    desc.verify()?;
    trace!("decoding {} ({} bytes)", desc.name, data.len());

    let msg = init_message(buf, desc);
    let mut cursor = ReadCursor::new(data);
    let scan = scan_members(desc, &mut cursor)?;
    reserve_storage(msg, desc, &scan.counts, scan.unknown, arena);
    parse_members(msg, desc, &scan.members, arena, depth)
}

/// Allocate a fresh message region from the arena and decode into it.
pub(crate) fn deserialize(
    desc: &'static MessageDescriptor,
    data: &[u8],
    arena: &mut Arena,
    depth: usize,
) -> Result<NonNull<Message>, DecodeError> {
    let region = alloc_message_region(desc, arena);
    let buf =
        unsafe { core::slice::from_raw_parts_mut(region.as_ptr(), desc.sizeof_message) };
    deserialize_to(desc, data, buf, arena, depth)?;
    Ok(region.cast())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_counts_by_width() {
        assert_eq!(
            count_packed_elements(&[0; 12], FieldType::Fixed32).unwrap(),
            3
        );
        assert_eq!(
            count_packed_elements(&[0; 16], FieldType::Double).unwrap(),
            2
        );
        assert_eq!(
            count_packed_elements(&[1, 1, 0], FieldType::Bool).unwrap(),
            3
        );
        // one varint per byte with the continuation bit clear
        assert_eq!(
            count_packed_elements(&[0x03, 0x8E, 0x02, 0x9E, 0xA7, 0x05], FieldType::Int32)
                .unwrap(),
            3
        );
    }

    #[test]
    fn packed_rejects_ragged_fixed_payloads() {
        assert_eq!(
            count_packed_elements(&[0; 6], FieldType::Fixed32),
            Err(DecodeError::InvalidType)
        );
        assert_eq!(
            count_packed_elements(&[0; 12], FieldType::Fixed64),
            Err(DecodeError::InvalidType)
        );
    }

    #[test]
    fn packed_rejects_unpackable_types() {
        assert_eq!(
            count_packed_elements(b"abc", FieldType::String),
            Err(DecodeError::InvalidType)
        );
    }
}
