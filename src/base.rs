//! The in-memory message representation: a caller-allocated byte region of
//! `sizeof_message` bytes whose first bytes are this header, with field
//! storage behind it at descriptor-declared offsets.

use core::alloc::Layout;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::arena::Arena;
use crate::containers::{Bytes, RepeatedField};
use crate::descriptor::{
    singular_storage_size, DefaultValue, FieldDescriptor, Label, MessageDescriptor,
    MESSAGE_DESCRIPTOR_MAGIC,
};
use crate::error::DecodeError;
use crate::wire::Key;

/// A wire record whose field id is absent from the descriptor, retained
/// verbatim (length prefix included) so it round-trips on re-encode.
#[repr(C)]
#[derive(Debug)]
pub struct UnknownField {
    pub key: Key,
    pub data: Bytes,
}

/// Message header. Every decoded message region starts with one; field
/// storage follows at the offsets its descriptor declares.
#[repr(C)]
pub struct Message {
    descriptor: *const MessageDescriptor,
    /// Presence bitmap for optional fields, bit index = field index.
    has_bits: u64,
    unknown_fields: RepeatedField<UnknownField>,
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("descriptor", &self.descriptor)
            .field("has_bits", &self.has_bits)
            .field("unknown_fields_len", &self.unknown_fields.len())
            .finish()
    }
}

impl Message {
    pub fn is_init(&self) -> bool {
        !self.descriptor.is_null()
    }

    pub fn descriptor(&self) -> Option<&'static MessageDescriptor> {
        unsafe { self.descriptor.as_ref() }
    }

    /// Presence bit for the field at `field_index` in the descriptor.
    pub fn has(&self, field_index: usize) -> bool {
        debug_assert!(field_index < 64);
        self.has_bits & (1 << field_index) != 0
    }

    pub(crate) fn set_has_bit(&mut self, field_index: usize) {
        debug_assert!(field_index < 64);
        self.has_bits |= 1 << field_index;
    }

    pub fn unknown_fields(&self) -> &[UnknownField] {
        &self.unknown_fields
    }

    pub(crate) fn unknown_fields_mut(&mut self) -> &mut RepeatedField<UnknownField> {
        &mut self.unknown_fields
    }

    /// Borrow the field storage at `offset` as a `T`.
    ///
    /// # Safety
    /// `offset` must come from this message's descriptor and `T` must match
    /// the field's storage type.
    pub unsafe fn ref_at<T>(&self, offset: usize) -> &T {
        unsafe { &*((self as *const Message as *const u8).add(offset) as *const T) }
    }

    /// Mutable variant of [`ref_at`](Self::ref_at).
    ///
    /// # Safety
    /// Same contract as `ref_at`.
    pub unsafe fn ref_mut<T>(&mut self, offset: usize) -> &mut T {
        unsafe { &mut *((self as *mut Message as *mut u8).add(offset) as *mut T) }
    }

    /// Ok when the optional field at `field_index` was seen on the wire.
    pub fn expect_present(&self, field_index: usize) -> Result<(), DecodeError> {
        if self.has(field_index) {
            Ok(())
        } else {
            Err(DecodeError::OptionalFieldMissing)
        }
    }

    /// Selected field id of the oneof group `field` belongs to, 0 if unset.
    pub fn oneof_case(&self, field: &FieldDescriptor) -> u32 {
        debug_assert!(field.is_oneof());
        unsafe { *self.ref_at::<u32>(field.quantifier_offset) }
    }

    /// Checked access to a singular sub-message field.
    pub fn submessage(&self, field: &FieldDescriptor) -> Result<&Message, DecodeError> {
        debug_assert!(!field.is_repeated());
        field.message_descriptor()?;
        let sub = unsafe { self.ref_at::<Message>(field.offset) };
        if sub.is_init() {
            Ok(sub)
        } else {
            Err(DecodeError::SubMessageMissing)
        }
    }

    /// Flip a oneof group to `field`: release any previously selected
    /// sibling's storage and record the new discriminator.
    pub(crate) fn take_oneof(&mut self, desc: &MessageDescriptor, field: &FieldDescriptor) {
        let case_offset = field.quantifier_offset;
        let current = unsafe { *self.ref_at::<u32>(case_offset) };
        if current != 0 && current != field.id {
            if let Some(idx) = desc.field_index(current) {
                let sibling = &desc.fields[idx];
                if sibling.is_oneof() && sibling.quantifier_offset == case_offset {
                    let size = singular_storage_size(sibling);
                    unsafe {
                        let base = self as *mut Message as *mut u8;
                        core::ptr::write_bytes(base.add(sibling.offset), 0, size);
                    }
                }
            }
        }
        unsafe { *self.ref_mut::<u32>(case_offset) = field.id };
    }
}

/// Allocate a fresh zeroed message region for `desc` from the arena.
pub(crate) fn alloc_message_region(
    desc: &'static MessageDescriptor,
    arena: &mut Arena,
) -> NonNull<u8> {
    let layout = Layout::from_size_align(desc.sizeof_message, align_of::<u64>())
        .expect("message size overflow");
    arena.alloc_zeroed(layout)
}

/// View `buf` as a message of type `desc`, initializing it first if it is
/// not one already. Initialization zeroes the region, stamps the descriptor
/// and applies non-repeated defaults; a descriptor-supplied `message_init`
/// callback replaces that sequence wholesale. An already initialized
/// message is left untouched so repeated records merge.
pub(crate) fn init_message<'a>(
    buf: &'a mut [u8],
    desc: &'static MessageDescriptor,
) -> &'a mut Message {
    assert_eq!(desc.magic, MESSAGE_DESCRIPTOR_MAGIC, "corrupt message descriptor");
    assert_eq!(buf.len(), desc.sizeof_message, "message buffer size mismatch");
    assert_eq!(
        buf.as_ptr() as usize % align_of::<u64>(),
        0,
        "message buffer misaligned"
    );

    let msg_ptr = buf.as_mut_ptr() as *mut Message;
    if unsafe { (*msg_ptr).descriptor } == desc as *const MessageDescriptor {
        return unsafe { &mut *msg_ptr };
    }

    if let Some(init) = desc.message_init {
        unsafe { init(buf) };
    } else {
        unsafe { raw_init(buf, desc) };
        let msg = unsafe { &mut *msg_ptr };
        for field in desc.fields {
            apply_default(msg, field);
        }
    }
    unsafe { &mut *msg_ptr }
}

/// Zero `buf` and stamp `desc`, leaving every field in its zero state.
/// Custom `message_init` callbacks call this before laying in their own
/// defaults.
///
/// # Safety
/// `buf` must be `desc.sizeof_message` bytes, aligned like a u64.
pub unsafe fn raw_init(buf: &mut [u8], desc: &'static MessageDescriptor) {
    buf.fill(0);
    let msg = unsafe { &mut *(buf.as_mut_ptr() as *mut Message) };
    msg.descriptor = desc;
}

fn apply_default(msg: &mut Message, field: &FieldDescriptor) {
    let Some(default) = field.default_value else {
        return;
    };
    if matches!(field.label, Label::Repeated) {
        return;
    }
    unsafe {
        match default {
            DefaultValue::Bool(v) => *msg.ref_mut::<bool>(field.offset) = v,
            DefaultValue::I32(v) | DefaultValue::Enum(v) => {
                *msg.ref_mut::<i32>(field.offset) = v
            }
            DefaultValue::U32(v) => *msg.ref_mut::<u32>(field.offset) = v,
            DefaultValue::I64(v) => *msg.ref_mut::<i64>(field.offset) = v,
            DefaultValue::U64(v) => *msg.ref_mut::<u64>(field.offset) = v,
            DefaultValue::F32(v) => *msg.ref_mut::<f32>(field.offset) = v,
            DefaultValue::F64(v) => *msg.ref_mut::<f64>(field.offset) = v,
            DefaultValue::Bytes(b) => {
                *msg.ref_mut::<Bytes>(field.offset) = Bytes::from_static(b)
            }
        }
    }
}

// The descriptor pointer is only ever a &'static.
unsafe impl Send for Message {}
unsafe impl Sync for Message {}

const _: () = assert!(size_of::<Message>() % align_of::<u64>() == 0);
