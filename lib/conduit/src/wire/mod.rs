//! Wire primitives: single-allocation message buffers, sequential
//! cursors with endianness handling, and the VarInt codec.

pub mod buffer;
pub mod cursor;
pub mod varint;

pub use buffer::{BufferRef, MessageBuffer, HEADER_SIZE};
pub use cursor::{MessageEditor, MessageReader, MessageWriter, WireRead};
