//! Attribute mapping between the POSIX attributes the daemon reports and
//! the file information the host framework consumes.

use std::time::Duration;
use std::time::SystemTime;

use bitflags::bitflags;
#[cfg(feature = "serializable")]
use serde::Deserialize;
#[cfg(feature = "serializable")]
use serde::Serialize;

use crate::ll::fuse_abi as abi;
use crate::time::system_time_from_time;

/// Reparse tag for NFS special files (FIFOs, sockets, device nodes).
pub const IO_REPARSE_TAG_NFS: u32 = 0x8000_0014;
/// Reparse tag for symbolic links.
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

bitflags! {
    /// Host file attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
    pub struct FileAttributes: u32 {
        /// The file may not be written.
        const READONLY = 0x0001;
        /// The file is a directory.
        const DIRECTORY = 0x0010;
        /// The file has no other attributes.
        const NORMAL = 0x0080;
        /// The file is a reparse point; see the reparse tag for its flavor.
        const REPARSE_POINT = 0x0400;
    }
}

/// Volume parameters fixed at instance init.
///
/// The host hands these in at device init; [`VolumeParams::normalize`]
/// forces the handful of values this core depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct VolumeParams {
    /// Bytes per sector.
    pub sector_size: u16,
    /// Sectors per allocation unit; allocation sizes are rounded up to
    /// `sector_size * sectors_per_allocation_unit`.
    pub sectors_per_allocation_unit: u16,
    /// Whether name lookup distinguishes case. When false, the metadata
    /// cache folds names at insert and lookup.
    pub case_sensitive_search: bool,
    /// Names keep the case they were created with.
    pub case_preserved_names: bool,
    /// ACLs survive across mounts.
    pub persistent_acls: bool,
    /// Reparse points are surfaced.
    pub reparse_points: bool,
    /// Reparse point traversal performs an access check.
    pub reparse_points_access_check: bool,
    /// Named streams (fixed off).
    pub named_streams: bool,
    /// The volume rejects writes (fixed off).
    pub read_only_volume: bool,
    /// Post cleanup only when the file was modified.
    pub post_cleanup_when_modified_only: bool,
    /// Directory queries carry the filename pattern.
    pub pass_query_directory_file_name: bool,
    /// Device control requests are routed to the volume.
    pub device_control: bool,
    /// Directory enumeration markers are next-entry offsets.
    pub directory_marker_as_next_offset: bool,
    /// How long cached name/attribute entries stay valid.
    pub entry_timeout: Duration,
}

impl Default for VolumeParams {
    fn default() -> Self {
        VolumeParams {
            sector_size: 512,
            sectors_per_allocation_unit: 1,
            case_sensitive_search: true,
            case_preserved_names: false,
            persistent_acls: false,
            reparse_points: false,
            reparse_points_access_check: true,
            named_streams: false,
            read_only_volume: false,
            post_cleanup_when_modified_only: false,
            pass_query_directory_file_name: false,
            device_control: false,
            directory_marker_as_next_offset: false,
            entry_timeout: Duration::from_secs(1),
        }
    }
}

impl VolumeParams {
    /// Force the parameter values this core depends on. Case sensitivity
    /// is the caller's choice; everything else is fixed.
    pub fn normalize(&mut self) {
        self.case_preserved_names = true;
        self.persistent_acls = true;
        self.reparse_points = true;
        self.reparse_points_access_check = false;
        self.named_streams = false;
        self.read_only_volume = false;
        self.post_cleanup_when_modified_only = true;
        self.pass_query_directory_file_name = true;
        self.device_control = true;
        self.directory_marker_as_next_offset = true;
    }

    /// Bytes per allocation unit.
    pub fn allocation_unit(&self) -> u64 {
        u64::from(self.sector_size) * u64::from(self.sectors_per_allocation_unit)
    }
}

/// File information as the host framework consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FileInfo {
    /// Host attribute bits.
    pub file_attributes: FileAttributes,
    /// Reparse tag, zero unless `REPARSE_POINT` is set.
    pub reparse_tag: u32,
    /// File size in bytes.
    pub file_size: u64,
    /// Allocated size, rounded up to the volume's allocation unit.
    pub allocation_size: u64,
    /// Creation time; POSIX has none, ctime stands in.
    pub creation_time: SystemTime,
    /// Time of last access.
    pub last_access_time: SystemTime,
    /// Time of last modification.
    pub last_write_time: SystemTime,
    /// Time of last attribute change.
    pub change_time: SystemTime,
    /// The inode number.
    pub index_number: u64,
}

/// Translate POSIX attributes to host file information.
///
/// Directories get the directory attribute; FIFOs, sockets and device
/// nodes become NFS-tagged reparse points; symlinks become symlink-tagged
/// reparse points. A symlink whose target is a directory does not get the
/// directory attribute here (unresolved upstream).
pub fn fuse_attr_to_file_info(attr: &abi::fuse_attr, params: &VolumeParams) -> FileInfo {
    let (file_attributes, reparse_tag) = match attr.mode & libc::S_IFMT {
        libc::S_IFDIR => (FileAttributes::DIRECTORY, 0),
        libc::S_IFLNK => (FileAttributes::REPARSE_POINT, IO_REPARSE_TAG_SYMLINK),
        libc::S_IFIFO | libc::S_IFCHR | libc::S_IFBLK | libc::S_IFSOCK => {
            (FileAttributes::REPARSE_POINT, IO_REPARSE_TAG_NFS)
        }
        _ => (FileAttributes::empty(), 0),
    };

    let unit = params.allocation_unit().max(1);
    let allocation_size = attr.size.div_ceil(unit) * unit;

    FileInfo {
        file_attributes,
        reparse_tag,
        file_size: attr.size,
        allocation_size,
        creation_time: system_time_from_time(attr.ctime, attr.ctimensec),
        last_access_time: system_time_from_time(attr.atime, attr.atimensec),
        last_write_time: system_time_from_time(attr.mtime, attr.mtimensec),
        change_time: system_time_from_time(attr.ctime, attr.ctimensec),
        index_number: attr.ino,
    }
}
