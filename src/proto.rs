//! Protocol encoders.
//!
//! Stateless fill routines, one per opcode this core sends. Each writes a
//! request header plus payload into a caller-supplied buffer and stamps the
//! correlation ID. Buffer size rules are enforced by the transact loop, not
//! here; every fill assumes the buffer holds at least [`REQ_SIZEMIN`] bytes.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use zerocopy::IntoBytes;

use crate::ll::Status;
use crate::ll::fuse_abi as abi;
use crate::provider::Origin;

/// Size of the FUSE request header.
pub const REQ_HEADER_SIZE: usize = size_of::<abi::fuse_in_header>();
/// Size of the FUSE response header; also the smallest valid response.
pub const RSP_HEADER_SIZE: usize = size_of::<abi::fuse_out_header>();
/// The smallest output buffer a transact call may carry.
pub const REQ_SIZEMIN: usize = abi::FUSE_MIN_READ_BUFFER;

/// How many forget tuples fit in one BATCH_FORGET request.
pub const fn batch_forget_capacity() -> usize {
    (REQ_SIZEMIN - REQ_HEADER_SIZE - size_of::<abi::fuse_batch_forget_in>())
        / size_of::<abi::fuse_forget_one>()
}

fn emit(
    buf: &mut [u8],
    opcode: abi::fuse_opcode,
    unique: u64,
    nodeid: u64,
    origin: Origin,
    payload: &[&[u8]],
) -> usize {
    let mut len = REQ_HEADER_SIZE;
    for part in payload {
        len += part.len();
    }
    let header = abi::fuse_in_header {
        len: len as u32,
        opcode: opcode.into(),
        unique,
        nodeid,
        uid: origin.uid,
        gid: origin.gid,
        pid: origin.pid,
        padding: 0,
    };
    buf[..REQ_HEADER_SIZE].copy_from_slice(header.as_bytes());
    let mut at = REQ_HEADER_SIZE;
    for part in payload {
        buf[at..at + part.len()].copy_from_slice(part);
        at += part.len();
    }
    len
}

/// Fill an INIT request. `max_readahead` and `flags` stay zero until
/// capability negotiation lands.
pub fn fill_init(buf: &mut [u8], unique: u64) -> usize {
    let arg = abi::fuse_init_in {
        major: abi::FUSE_KERNEL_VERSION,
        minor: abi::FUSE_KERNEL_MINOR_VERSION,
        max_readahead: 0,
        flags: 0,
    };
    emit(
        buf,
        abi::fuse_opcode::FUSE_INIT,
        unique,
        0,
        Origin::KERNEL,
        &[arg.as_bytes()],
    )
}

/// Fill a LOOKUP request: header plus the null-terminated name.
///
/// Fails with `ObjectNameInvalid` when the message would not fit in the
/// minimum request buffer.
pub fn fill_lookup(
    buf: &mut [u8],
    unique: u64,
    parent: u64,
    name: &OsStr,
    origin: Origin,
) -> Result<usize, Status> {
    let bytes = name.as_bytes();
    if REQ_HEADER_SIZE + bytes.len() + 1 > REQ_SIZEMIN {
        return Err(Status::ObjectNameInvalid);
    }
    Ok(emit(
        buf,
        abi::fuse_opcode::FUSE_LOOKUP,
        unique,
        parent,
        origin,
        &[bytes, &[0]],
    ))
}

/// Fill a GETATTR request.
pub fn fill_getattr(buf: &mut [u8], unique: u64, ino: u64, origin: Origin) -> usize {
    let arg = abi::fuse_getattr_in {
        getattr_flags: 0,
        dummy: 0,
        fh: 0,
    };
    emit(
        buf,
        abi::fuse_opcode::FUSE_GETATTR,
        unique,
        ino,
        origin,
        &[arg.as_bytes()],
    )
}

/// Fill an OPEN request with POSIX open flags.
pub fn fill_open(buf: &mut [u8], unique: u64, ino: u64, flags: i32, origin: Origin) -> usize {
    let arg = abi::fuse_open_in { flags, unused: 0 };
    emit(
        buf,
        abi::fuse_opcode::FUSE_OPEN,
        unique,
        ino,
        origin,
        &[arg.as_bytes()],
    )
}

/// Fill an OPENDIR request.
pub fn fill_opendir(buf: &mut [u8], unique: u64, ino: u64, origin: Origin) -> usize {
    let arg = abi::fuse_open_in {
        flags: libc::O_RDONLY,
        unused: 0,
    };
    emit(
        buf,
        abi::fuse_opcode::FUSE_OPENDIR,
        unique,
        ino,
        origin,
        &[arg.as_bytes()],
    )
}

/// Fill a FORGET request for a single inode, one lookup reference.
pub fn fill_forget(buf: &mut [u8], unique: u64, ino: u64) -> usize {
    let arg = abi::fuse_forget_in { nlookup: 1 };
    emit(
        buf,
        abi::fuse_opcode::FUSE_FORGET,
        unique,
        ino,
        Origin::KERNEL,
        &[arg.as_bytes()],
    )
}

/// Fill a BATCH_FORGET request from a slice of inodes, one lookup
/// reference each. Returns the message length and how many inodes were
/// packed (bounded by [`batch_forget_capacity`]).
pub fn fill_batch_forget(buf: &mut [u8], unique: u64, inodes: &[u64]) -> (usize, usize) {
    let count = inodes.len().min(batch_forget_capacity());
    let arg = abi::fuse_batch_forget_in {
        count: count as u32,
        dummy: 0,
    };
    let mut len = emit(
        buf,
        abi::fuse_opcode::FUSE_BATCH_FORGET,
        unique,
        0,
        Origin::KERNEL,
        &[arg.as_bytes()],
    );
    for ino in &inodes[..count] {
        let one = abi::fuse_forget_one {
            nodeid: *ino,
            nlookup: 1,
        };
        buf[len..len + size_of::<abi::fuse_forget_one>()].copy_from_slice(one.as_bytes());
        len += size_of::<abi::fuse_forget_one>();
    }
    buf[..4].copy_from_slice((len as u32).as_bytes());
    (len, count)
}
