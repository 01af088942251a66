//! Kernel-side FUSE request multiplexer.
//!
//! This crate is the core of a user-space filesystem bridge: it sits
//! between an in-kernel filesystem framework (the "fsext provider", which
//! dispatches file-system control requests) and a user-space daemon that
//! speaks the FUSE wire protocol. Each in-kernel operation is translated
//! into one or more FUSE exchanges, many concurrent operations are
//! multiplexed over a single bidirectional transact channel, and an
//! inode/name metadata cache suppresses redundant user-space round trips.
//!
//! The host framework implements [`Provider`] and drives an [`Instance`]:
//! one [`Instance::transact`] call per daemon worker invocation, each
//! delivering at most one FUSE response and extracting at most one FUSE
//! request. Contexts are resumable state machines driven step by step by
//! those calls; there is no scheduler and no heap-allocated future.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::attr::FileAttributes;
pub use crate::attr::FileInfo;
pub use crate::attr::IO_REPARSE_TAG_NFS;
pub use crate::attr::IO_REPARSE_TAG_SYMLINK;
pub use crate::attr::VolumeParams;
pub use crate::attr::fuse_attr_to_file_info;
pub use crate::file::OpenFile;
pub use crate::instance::Instance;
pub use crate::ll::Errno;
pub use crate::ll::Status;
pub use crate::ll::fuse_abi as abi;
pub use crate::provider::DeviceOps;
pub use crate::provider::FUSE_FSCTL_TRANSACT;
pub use crate::provider::IRP_MJ_FILE_SYSTEM_CONTROL;
pub use crate::provider::IRP_MN_USER_FS_REQUEST;
pub use crate::provider::InternalRequest;
pub use crate::provider::InternalResponse;
pub use crate::provider::Irp;
pub use crate::provider::Origin;
pub use crate::provider::PROVIDER;
pub use crate::provider::Provider;
pub use crate::provider::ProviderDesc;
pub use crate::provider::RequestKind;
pub use crate::provider::RequestOp;

mod attr;
mod cache;
mod context;
mod file;
mod instance;
mod ioq;
mod ll;
pub mod proto;
mod provider;
mod time;
mod transact;
