//! Open-file bookkeeping.
//!
//! The minimum the core needs: a host-visible handle per successful
//! OPEN/OPENDIR, remembering the inode, the daemon's file handle and what
//! was granted. Richer file-object state belongs to the host framework.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

/// One open file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    /// Inode of the opened object.
    pub ino: u64,
    /// The daemon's file handle, echoed on subsequent I/O.
    pub fh: u64,
    /// POSIX open flags the open was granted with.
    pub flags: i32,
    /// Whether this is a directory handle.
    pub is_dir: bool,
}

pub(crate) struct FileTable {
    files: Mutex<HashMap<u64, OpenFile>>,
    next: AtomicU64,
}

impl FileTable {
    pub(crate) fn new() -> FileTable {
        FileTable {
            files: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Record an open and allocate its host-visible handle.
    pub(crate) fn open(&self, ino: u64, fh: u64, flags: i32, is_dir: bool) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.files.lock().insert(
            handle,
            OpenFile {
                ino,
                fh,
                flags,
                is_dir,
            },
        );
        handle
    }

    /// Look up an open file by host handle.
    pub(crate) fn get(&self, handle: u64) -> Option<OpenFile> {
        self.files.lock().get(&handle).copied()
    }

    /// Remove an open file, returning its record.
    pub(crate) fn close(&self, handle: u64) -> Option<OpenFile> {
        self.files.lock().remove(&handle)
    }

    /// Drop every record. Teardown only.
    pub(crate) fn clear(&self) {
        self.files.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.files.lock().len()
    }
}

impl std::fmt::Debug for FileTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTable")
            .field("open", &self.files.lock().len())
            .finish()
    }
}
