// cmh-aio/src/lib.rs
//! IO operations for the CMakeHub cache (filesystem, json, checksums)

pub mod checksum;
pub mod fs;
pub mod json_io;

pub use checksum::tree_digest;
pub use fs::*;
pub use json_io::{read_json_sync, write_json_sync};
