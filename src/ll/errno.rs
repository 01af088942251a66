//! Errno map.
//!
//! The daemon reports failures as POSIX error numbers in the response
//! header; the host framework thinks in its own status taxonomy. The
//! translation is a pure function and lives here, next to the [`Errno`]
//! newtype that carries the wire value.

use std::fmt;

/// A POSIX error number as reported by the daemon.
///
/// The wire carries the negated errno in the response header's `error`
/// field; [`Errno::from_wire`] normalizes either sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    /// Build an errno from the response header's `error` field.
    pub fn from_wire(raw: i32) -> Errno {
        Errno(raw.wrapping_abs())
    }

    /// The raw error number.
    pub fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// The host framework's native status taxonomy.
///
/// `Success` means success; everything else is a failure the host framework
/// knows how to surface. The set covers what this core itself produces plus
/// the errno-mapped daemon failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation completed.
    Success,
    /// The name does not exist in the parent directory.
    ObjectNameNotFound,
    /// The name already exists.
    ObjectNameCollision,
    /// The name is malformed or too long for the protocol.
    ObjectNameInvalid,
    /// Permission denied.
    AccessDenied,
    /// A transact call carried malformed parameters.
    InvalidParameter,
    /// The output buffer is below the protocol minimum.
    BufferTooSmall,
    /// The request was not a transact request at all.
    InvalidDeviceRequest,
    /// The wait for INIT completion was cancelled.
    Cancelled,
    /// The daemon does not implement the operation.
    NotImplemented,
    /// Out of memory or handles.
    InsufficientResources,
    /// The file handle is stale or bogus.
    InvalidHandle,
    /// The object is in use.
    DeviceBusy,
    /// Path component is not a directory.
    NotADirectory,
    /// The file is a directory.
    FileIsADirectory,
    /// Too many open files.
    TooManyOpenedFiles,
    /// The volume is out of space.
    DiskFull,
    /// The volume is write protected.
    MediaWriteProtected,
    /// The directory is not empty.
    DirectoryNotEmpty,
    /// The user's quota is exhausted.
    QuotaExceeded,
    /// No such device.
    NoSuchDevice,
    /// Link across volumes.
    NotSameDevice,
    /// The operation timed out.
    IoTimeout,
    /// The device is not ready; retry later.
    DeviceNotReady,
    /// Generic I/O failure, also the fallback for unmapped errnos.
    IoDeviceError,
}

impl Status {
    /// Whether this status reports success.
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Map a POSIX error number to a native status. Zero maps to success.
    pub fn from_errno(errno: Errno) -> Status {
        match errno.code() {
            0 => Status::Success,
            libc::EPERM | libc::EACCES => Status::AccessDenied,
            libc::ENOENT => Status::ObjectNameNotFound,
            libc::EIO => Status::IoDeviceError,
            libc::EBADF => Status::InvalidHandle,
            libc::EAGAIN => Status::DeviceNotReady,
            libc::ENOMEM => Status::InsufficientResources,
            libc::EBUSY | libc::ETXTBSY => Status::DeviceBusy,
            libc::EEXIST => Status::ObjectNameCollision,
            libc::EXDEV => Status::NotSameDevice,
            libc::ENODEV | libc::ENXIO => Status::NoSuchDevice,
            libc::ENOTDIR => Status::NotADirectory,
            libc::EISDIR => Status::FileIsADirectory,
            libc::EINVAL => Status::InvalidParameter,
            libc::ENFILE | libc::EMFILE => Status::TooManyOpenedFiles,
            libc::EFBIG | libc::ENOSPC => Status::DiskFull,
            libc::EROFS => Status::MediaWriteProtected,
            libc::ENAMETOOLONG => Status::ObjectNameInvalid,
            libc::ENOSYS | libc::EOPNOTSUPP => Status::NotImplemented,
            libc::ENOTEMPTY => Status::DirectoryNotEmpty,
            libc::EDQUOT => Status::QuotaExceeded,
            libc::ETIMEDOUT => Status::IoTimeout,
            libc::EINTR | libc::ECANCELED => Status::Cancelled,
            _ => Status::IoDeviceError,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
