//! The VCI network framework: wire primitives, non-blocking message
//! sockets, the event dispatcher, the core session protocol, the plug-in
//! registry, and the self-describing DataType serialization layer.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Unique ID of a connected client. Zero is reserved: it means
/// "broadcast" in request messages and "unassigned" in replies.
pub type ClientId = u16;

/// Wire message ID. IDs below `protocol::NUM_CORE_MESSAGES` belong to the
/// core; plug-in protocols are assigned contiguous ranges above.
pub type MessageId = u16;

pub mod client;
pub mod datatype;
pub mod dispatch;
pub mod error;
pub mod net;
pub mod plugin;
pub mod protocol;
pub mod server;
pub mod wire;
