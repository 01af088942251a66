//! Low-level protocol plumbing: the wire ABI, response decomposition and
//! the errno map.

pub(crate) mod argument;
pub mod errno;
pub mod fuse_abi;

pub use errno::Errno;
pub use errno::Status;
