//! FUSE kernel interface.
//!
//! Types and definitions for the wire traffic between this core and the
//! user-space daemon. The ABI is versioned and capabilities are exchanged
//! during the INIT handshake; this core negotiates protocol 7.18 and only
//! speaks the opcode subset a metadata bridge needs.
//!
//! libfuse reference: <https://github.com/libfuse/libfuse/blob/master/include/fuse_kernel.h>

#![allow(missing_docs)]

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const FUSE_KERNEL_VERSION: u32 = 7;
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 18;

/// BATCH_FORGET is available from this minor version on.
pub const FUSE_BATCH_FORGET_MINOR_VERSION: u32 = 16;

pub const FUSE_ROOT_ID: u64 = 1;

/// The smallest request buffer the daemon may hand us. Every request this
/// core emits, including a LOOKUP with a maximal name and a full
/// BATCH_FORGET payload, fits in a buffer of this size.
pub const FUSE_MIN_READ_BUFFER: usize = 8192;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[allow(non_camel_case_types)]
pub enum fuse_opcode {
    FUSE_LOOKUP = 1,
    FUSE_FORGET = 2, // no reply
    FUSE_GETATTR = 3,
    FUSE_OPEN = 14,
    FUSE_INIT = 26,
    FUSE_OPENDIR = 27,
    FUSE_BATCH_FORGET = 42, // no reply
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    // NOTE: defined as u64 in fuse_kernel.h; treated as signed to match stat.st_atime
    pub atime: i64,
    // NOTE: defined as u64 in fuse_kernel.h; treated as signed to match stat.st_mtime
    pub mtime: i64,
    // NOTE: defined as u64 in fuse_kernel.h; treated as signed to match stat.st_ctime
    pub ctime: i64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_in_header {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_out_header {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_init_in {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_init_out {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_entry_out {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: fuse_attr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_getattr_in {
    pub getattr_flags: u32,
    pub dummy: u32,
    pub fh: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_attr_out {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub dummy: u32,
    pub attr: fuse_attr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_open_in {
    // NOTE: defined as u32 in fuse_kernel.h; kept signed to match the open() syscall
    pub flags: i32,
    pub unused: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_open_out {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_forget_in {
    pub nlookup: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_forget_one {
    pub nodeid: u64,
    pub nlookup: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct fuse_batch_forget_in {
    pub count: u32,
    pub dummy: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes() {
        assert_eq!(size_of::<fuse_in_header>(), 40);
        assert_eq!(size_of::<fuse_out_header>(), 16);
    }

    #[test]
    fn init_layout() {
        assert_eq!(size_of::<fuse_init_in>(), 16);
        assert_eq!(size_of::<fuse_init_out>(), 24);
    }

    #[test]
    fn opcode_round_trip() {
        for opcode in [
            fuse_opcode::FUSE_LOOKUP,
            fuse_opcode::FUSE_FORGET,
            fuse_opcode::FUSE_GETATTR,
            fuse_opcode::FUSE_OPEN,
            fuse_opcode::FUSE_INIT,
            fuse_opcode::FUSE_OPENDIR,
            fuse_opcode::FUSE_BATCH_FORGET,
        ] {
            let raw: u32 = opcode.into();
            assert_eq!(fuse_opcode::try_from(raw).unwrap(), opcode);
        }
        assert!(fuse_opcode::try_from(7u32).is_err());
    }

    #[test]
    fn entry_out_embeds_attr() {
        assert_eq!(
            size_of::<fuse_entry_out>(),
            40 + size_of::<fuse_attr>()
        );
    }
}
