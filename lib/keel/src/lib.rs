#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod digest;
pub mod entropy;
pub mod logging;
pub mod time;
