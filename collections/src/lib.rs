/// Cursor-based and reference-counted byte buffers used by the wire codecs.
pub mod bytes;
