use thiserror::Error;

/// Everything that can go wrong while decoding a wire buffer.
///
/// The decoder never recovers internally; the first error aborts the parse
/// and the partially built message stays owned by the caller's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A field key carried wire-type bits outside the wire alphabet.
    #[error("field key carries an invalid wire type")]
    InvalidKey,
    /// The buffer ended in the middle of a value.
    #[error("ran out of bytes mid-value")]
    NotEnoughBytesRead,
    /// A varint does not fit the width of its target type.
    #[error("varint overflows the target width")]
    Overflow,
    /// A required field never appeared on the wire.
    #[error("required field `{0}` missing from the wire")]
    FieldMissing(&'static str),
    /// Checked access to an optional field that was not present.
    #[error("optional field not present")]
    OptionalFieldMissing,
    /// Checked access to a sub-message that was never decoded.
    #[error("sub-message not present")]
    SubMessageMissing,
    /// A message- or enum-typed field has no descriptor attached.
    #[error("message or enum field lacks a descriptor")]
    DescriptorMissing,
    /// Wire type incompatible with the declared field type, or a packed
    /// payload whose length is not a multiple of the element size.
    #[error("wire type incompatible with the declared field type")]
    InvalidType,
    /// Truncated fixed-width or length-prefixed payload, or nesting past
    /// the recursion limit.
    #[error("truncated or malformed payload")]
    InvalidData,
}
