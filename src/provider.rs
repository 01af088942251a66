//! Host framework seam.
//!
//! The host filesystem framework ("fsext provider") originates internal
//! requests and consumes internal responses; this module defines both
//! shapes, the [`Provider`] collaborator trait the core calls back into,
//! and the static provider record the host uses to locate the device
//! callbacks.

use std::ffi::OsString;
use std::fmt;
use std::time::SystemTime;

use crate::attr::FileInfo;
use crate::instance::Instance;
use crate::ll::Status;

/// Identity of the thread that originated an internal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    /// Originating user id.
    pub uid: u32,
    /// Originating group id.
    pub gid: u32,
    /// Originating process id.
    pub pid: u32,
}

impl Origin {
    /// Origin of self-generated requests (INIT, FORGET).
    pub(crate) const KERNEL: Origin = Origin {
        uid: 0,
        gid: 0,
        pid: 0,
    };
}

/// The operation an internal request asks for.
#[derive(Debug, Clone)]
pub enum RequestKind {
    /// Resolve `name` under the directory inode `parent`.
    Lookup {
        /// Parent directory inode.
        parent: u64,
        /// Name to resolve, not yet normalized.
        name: OsString,
    },
    /// Fetch attributes of `ino`.
    GetAttr {
        /// Target inode.
        ino: u64,
    },
    /// Open `ino` with POSIX open flags.
    Open {
        /// Target inode.
        ino: u64,
        /// POSIX open flags the host derived from the granted access.
        flags: i32,
    },
    /// Open the directory `ino` for enumeration.
    OpenDir {
        /// Target inode.
        ino: u64,
    },
}

impl RequestKind {
    /// The bare operation tag, used to pair responses with requests.
    pub fn op(&self) -> RequestOp {
        match self {
            RequestKind::Lookup { .. } => RequestOp::Lookup,
            RequestKind::GetAttr { .. } => RequestOp::GetAttr,
            RequestKind::Open { .. } => RequestOp::Open,
            RequestKind::OpenDir { .. } => RequestOp::OpenDir,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Lookup { parent, name } => {
                write!(f, "LOOKUP parent {:#x} name {:?}", parent, name)
            }
            RequestKind::GetAttr { ino } => write!(f, "GETATTR ino {:#x}", ino),
            RequestKind::Open { ino, flags } => {
                write!(f, "OPEN ino {:#x} flags {:#x}", ino, flags)
            }
            RequestKind::OpenDir { ino } => write!(f, "OPENDIR ino {:#x}", ino),
        }
    }
}

/// Operation tag of an internal request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOp {
    /// Name resolution.
    Lookup,
    /// Attribute fetch.
    GetAttr,
    /// File open.
    Open,
    /// Directory open.
    OpenDir,
}

/// An in-kernel request admitted from the host framework.
///
/// Distinct from the FUSE wire request the core derives from it. The
/// context owns the request until its internal response is forwarded.
#[derive(Debug, Clone)]
pub struct InternalRequest {
    /// What to do.
    pub kind: RequestKind,
    /// Host-side correlation value, echoed in the response.
    pub hint: u64,
    /// Originating identity, stamped into the FUSE request header.
    pub origin: Origin,
}

/// The in-kernel completion forwarded back to the host framework.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalResponse {
    /// Operation tag matching the request's [`RequestKind::op`].
    pub op: RequestOp,
    /// The request's correlation value.
    pub hint: u64,
    /// Outcome; [`Status::Success`] or the errno-mapped daemon failure.
    pub status: Status,
    /// File information for LOOKUP/GETATTR successes.
    pub file_info: Option<FileInfo>,
    /// Host-visible file handle for OPEN/OPENDIR successes.
    pub handle: Option<u64>,
}

/// The host framework collaborator.
///
/// The two methods are the two forms of the host's transact call: forward
/// a completion upward, or pull the next internal request downward.
pub trait Provider: Send + Sync {
    /// Forward a finished internal response to the host framework.
    fn complete(&self, response: InternalResponse) -> Result<(), Status>;

    /// Pull the next internal request. `Ok(None)` means no work is
    /// available right now.
    fn next_request(&self) -> Result<Option<InternalRequest>, Status>;
}

const FILE_DEVICE_FILE_SYSTEM: u32 = 0x0000_0009;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// The device-transact control code.
pub const FUSE_FSCTL_TRANSACT: u32 = ctl_code(
    FILE_DEVICE_FILE_SYSTEM,
    0xC00 + b'F' as u32,
    METHOD_BUFFERED,
    FILE_ANY_ACCESS,
);

/// Major function code of a transact request packet.
pub const IRP_MJ_FILE_SYSTEM_CONTROL: u8 = 13;
/// Minor function code of a transact request packet.
pub const IRP_MN_USER_FS_REQUEST: u8 = 0;

/// A buffered file-system-control request packet.
///
/// An empty `input` means no FUSE response is being delivered; an empty
/// `output` means no FUSE request is wanted. `information` reports the
/// emitted request's `len`, or zero.
#[derive(Debug)]
pub struct Irp<'a> {
    /// Major function; must be [`IRP_MJ_FILE_SYSTEM_CONTROL`].
    pub major_function: u8,
    /// Minor function; must be [`IRP_MN_USER_FS_REQUEST`].
    pub minor_function: u8,
    /// Control code; must be [`FUSE_FSCTL_TRANSACT`].
    pub control_code: u32,
    /// FUSE response buffer from the daemon, possibly empty.
    pub input: &'a [u8],
    /// FUSE request buffer to the daemon, possibly empty.
    pub output: &'a mut [u8],
    /// Bytes of `output` filled by the call.
    pub information: usize,
}

/// The device callbacks the provider record points at.
///
/// Device init is the [`Instance::init`] constructor; the remaining three
/// callbacks operate on the live instance.
pub trait DeviceOps {
    /// Tear the device down; see the fini ordering contract.
    fn device_fini(&self);
    /// Periodic expiration callback with the current time.
    fn device_expire(&self, now: SystemTime);
    /// One daemon transact exchange.
    fn device_transact(&self, irp: &mut Irp<'_>) -> Status;
}

/// The static provider record the host framework reads at registration.
#[derive(Debug)]
pub struct ProviderDesc {
    /// Size of this record, a version guard.
    pub struct_size: usize,
    /// Provider interface version.
    pub version: u32,
    /// Control code the transact path answers to.
    pub transact_code: u32,
    /// Bytes the host must reserve per device for the instance.
    pub device_extension_size: usize,
}

/// The provider record. Initialized once, read-only thereafter.
pub static PROVIDER: ProviderDesc = ProviderDesc {
    struct_size: size_of::<ProviderDesc>(),
    version: 1,
    transact_code: FUSE_FSCTL_TRANSACT,
    device_extension_size: size_of::<Instance>(),
};
