//! Koinonia, the data-sharing plug-in protocol: globally named objects
//! and dynamically populated namespaces with replace-wins versioning.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod client;
pub mod persist;
pub mod server;
mod valuestream;

pub const PROTOCOL_NAME: &str = "Koinonia";
pub const PROTOCOL_VERSION: u32 = 1 << 16;

/// ID of a shared namespace; 0 means "could not be created".
pub type NamespaceId = u8;
/// ID of a shared object; 0 means "could not be created".
pub type ObjectId = u16;
/// Object version, compared for replace-wins and wrapping mod 256.
pub type VersionNumber = u8;

// Client-originated message indices.
pub const CREATE_OBJECT_REQUEST: u16 = 0;
pub const REPLACE_OBJECT_REQUEST: u16 = 1;
pub const CREATE_NAMESPACE_REQUEST: u16 = 2;
pub const CREATE_NS_OBJECT_REQUEST: u16 = 3;
pub const REPLACE_NS_OBJECT_REQUEST: u16 = 4;
pub const DESTROY_NS_OBJECT_REQUEST: u16 = 5;
pub const NUM_CLIENT_MESSAGES: u16 = 6;

// Server-originated message indices.
pub const CREATE_OBJECT_REPLY: u16 = 0;
pub const REPLACE_OBJECT_REPLY: u16 = 1;
pub const REPLACE_OBJECT_NOTIFICATION: u16 = 2;
pub const CREATE_NAMESPACE_REPLY: u16 = 3;
pub const CREATE_NS_OBJECT_REPLY: u16 = 4;
pub const CREATE_NS_OBJECT_NOTIFICATION: u16 = 5;
pub const REPLACE_NS_OBJECT_REPLY: u16 = 6;
pub const REPLACE_NS_OBJECT_NOTIFICATION: u16 = 7;
pub const DESTROY_NS_OBJECT_NOTIFICATION: u16 = 8;
pub const NUM_SERVER_MESSAGES: u16 = 9;

// Fixed message prefix sizes (bytes after the message header).
pub const CREATE_OBJECT_REQUEST_PREFIX: usize = 2 + 2 + 2;
pub const REPLACE_OBJECT_REQUEST_PREFIX: usize = 2 + 1;
pub const CREATE_NAMESPACE_REQUEST_PREFIX: usize = 1 + 2;
pub const CREATE_NS_OBJECT_REQUEST_PREFIX: usize = 1 + 2 + 2;
pub const REPLACE_NS_OBJECT_REQUEST_PREFIX: usize = 1 + 2 + 1;
pub const DESTROY_NS_OBJECT_REQUEST_SIZE: usize = 1 + 2;

pub const CREATE_OBJECT_REPLY_SIZE: usize = 2 + 2;
pub const REPLACE_OBJECT_REPLY_SIZE: usize = 2 + 1 + 1;
pub const REPLACE_OBJECT_NOTIFICATION_PREFIX: usize = 2 + 1;
pub const CREATE_NAMESPACE_REPLY_SIZE: usize = 1 + 1;
pub const CREATE_NS_OBJECT_REPLY_SIZE: usize = 1 + 2 + 2;
pub const CREATE_NS_OBJECT_NOTIFICATION_PREFIX: usize = 1 + 2 + 2;
pub const REPLACE_NS_OBJECT_REPLY_SIZE: usize = 1 + 2 + 1 + 1;
pub const REPLACE_NS_OBJECT_NOTIFICATION_PREFIX: usize = 1 + 2 + 1;
pub const DESTROY_NS_OBJECT_NOTIFICATION_SIZE: usize = 1 + 2;
