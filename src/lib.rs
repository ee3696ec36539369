//! Descriptor-driven protobuf wire-format decoder.
//!
//! Instead of statically generated message types, a [`MessageDescriptor`]
//! value dictates the full memory layout of a message: field storage lives
//! at descriptor-declared offsets behind a fixed [`Message`] header. Given
//! a descriptor and a byte buffer, the decoder materializes a message in
//! two passes: a scan that frames every record and tallies repeated-field
//! element counts, then a parse that writes values into storage sized
//! exactly once. All decoded storage comes from a caller-provided
//! [`Arena`], which owns the resulting message tree.
//!
//! ```no_run
//! # use protodyn::{Arena, DecodeContext};
//! # fn demo(desc: &'static protodyn::MessageDescriptor, wire: &[u8]) {
//! let mut arena = Arena::new();
//! let msg = DecodeContext::new(wire, &mut arena).deserialize(desc).unwrap();
//! # }
//! ```

pub mod arena;
pub mod base;
pub mod containers;
pub mod descriptor;
pub mod error;
pub mod wire;

mod decoding;

use core::ptr::NonNull;

pub use crate::arena::Arena;
pub use crate::base::Message;
pub use crate::descriptor::MessageDescriptor;
pub use crate::error::DecodeError;

/// A single decode over one contiguous buffer.
pub struct DecodeContext<'buf, 'arena> {
    data: &'buf [u8],
    arena: &'arena mut Arena,
}

impl<'buf, 'arena> DecodeContext<'buf, 'arena> {
    pub fn new(data: &'buf [u8], arena: &'arena mut Arena) -> Self {
        Self { data, arena }
    }

    /// Allocate a fresh message region from the arena and decode into it.
    ///
    /// The returned message and everything it owns live inside the arena;
    /// the pointer stays valid until the arena is dropped.
    pub fn deserialize(
        self,
        desc: &'static MessageDescriptor,
    ) -> Result<NonNull<Message>, DecodeError> {
        decoding::deserialize(desc, self.data, self.arena, 0)
    }

    /// Decode into caller storage of exactly `desc.sizeof_message` bytes,
    /// aligned like a u64. A buffer already holding a message of this type
    /// is merged into rather than reset.
    pub fn deserialize_to(
        self,
        desc: &'static MessageDescriptor,
        buf: &mut [u8],
    ) -> Result<(), DecodeError> {
        decoding::deserialize_to(desc, self.data, buf, self.arena, 0)
    }
}

/// Slurp a reader to its end and decode the bytes.
pub fn decode_from_read(
    desc: &'static MessageDescriptor,
    reader: &mut impl std::io::Read,
    arena: &mut Arena,
) -> anyhow::Result<NonNull<Message>> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(DecodeContext::new(&data, arena).deserialize(desc)?)
}
