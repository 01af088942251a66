//! Instance lifecycle.
//!
//! One instance per mounted volume. Init normalizes the volume parameters,
//! brings up the IOQ, cache and file table, and posts the internal INIT
//! context; fini tears the same things down in a fixed order. The host
//! framework's periodic expiration callback lands here too.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use log::debug;
use parking_lot::RwLock;

use crate::attr::VolumeParams;
use crate::cache::Cache;
use crate::context::Context;
use crate::file::FileTable;
use crate::ioq::InitGate;
use crate::ioq::Ioq;
use crate::ioq::VERSION_DENIED;
use crate::ll::Status;
use crate::provider::DeviceOps;
use crate::provider::FUSE_FSCTL_TRANSACT;
use crate::provider::IRP_MJ_FILE_SYSTEM_CONTROL;
use crate::provider::IRP_MN_USER_FS_REQUEST;
use crate::provider::Irp;
use crate::provider::Provider;

/// Everything a resumed context may touch.
pub(crate) struct Shared {
    pub(crate) params: VolumeParams,
    pub(crate) ioq: Ioq,
    pub(crate) cache: Cache,
    pub(crate) files: FileTable,
    pub(crate) gate: InitGate,
}

impl Shared {
    pub(crate) fn new(params: VolumeParams) -> Shared {
        let cache = Cache::new(!params.case_sensitive_search, params.entry_timeout);
        Shared {
            params,
            ioq: Ioq::new(),
            cache,
            files: FileTable::new(),
            gate: InitGate::new(),
        }
    }
}

/// One mounted volume's worth of bridge state.
pub struct Instance {
    pub(crate) shared: Shared,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) op_guard: RwLock<()>,
    finished: AtomicBool,
}

impl Instance {
    /// Bring up an instance: normalize the volume parameters, construct
    /// the IOQ, cache and file table, and post the INIT handshake context.
    pub fn init(mut params: VolumeParams, provider: Arc<dyn Provider>) -> Result<Instance, Status> {
        if params.sector_size == 0 || params.sectors_per_allocation_unit == 0 {
            return Err(Status::InvalidParameter);
        }
        params.normalize();
        let instance = Instance {
            shared: Shared::new(params),
            provider,
            op_guard: RwLock::new(()),
            finished: AtomicBool::new(false),
        };
        let unique = instance.shared.ioq.next_unique();
        instance.shared.ioq.post_pending(Context::new_init(unique));
        debug!("instance up, INIT posted as unique {unique:#x}");
        Ok(instance)
    }

    /// The negotiated protocol version pair. Major is zero until the INIT
    /// exchange completes.
    pub fn version(&self) -> (u32, u32) {
        (self.shared.gate.major(), self.shared.gate.minor())
    }

    /// The normalized volume parameters.
    pub fn volume_params(&self) -> &VolumeParams {
        &self.shared.params
    }

    /// Cancel blocked transact calls without tearing anything down.
    pub fn shutdown(&self) {
        self.shared.gate.shutdown();
    }

    /// Look up an open file by the handle a completed OPEN/OPENDIR
    /// returned.
    pub fn open_file(&self, handle: u64) -> Option<crate::file::OpenFile> {
        self.shared.files.get(handle)
    }

    /// Drop an open-file record. The daemon's file handle is the host's to
    /// release through its own channels.
    pub fn close_file(&self, handle: u64) -> Option<crate::file::OpenFile> {
        self.shared.files.close(handle)
    }

    /// Drop a cached name binding, e.g. after the host renamed or removed
    /// the name through another path.
    pub fn invalidate_name(&self, parent: u64, name: &std::ffi::OsStr) {
        self.shared.cache.invalidate(parent, name);
    }

    pub(crate) fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Tear the instance down. Idempotent. The order is load-bearing:
    /// queued contexts may still hold file objects and cache items, so the
    /// IOQ drains first, then the file table, then the cache.
    pub fn fini(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        // wake any transact thread parked on the init gate so the write
        // guard below can be acquired
        self.shared.gate.shutdown();
        let _write = self.op_guard.write();
        self.shared.ioq.drain();
        let open = self.shared.files.len();
        self.shared.files.clear();
        self.shared.cache.clear();
        debug!("instance down, {open} open files dropped");
    }

    /// Periodic expiration callback. Sweeps the cache; a non-empty sweep
    /// posts a self-generated forget context to drain back to the daemon.
    pub fn expire(&self, now: SystemTime) {
        if self.finished() {
            return;
        }
        let _write = self.op_guard.write();
        let list = self.shared.cache.expiration_sweep(now);
        if list.is_empty() {
            return;
        }
        if self.shared.gate.major() == VERSION_DENIED {
            // no daemon to notify
            self.shared.cache.delete_items(list);
            return;
        }
        let unique = self.shared.ioq.next_unique();
        self.shared.ioq.post_pending(Context::new_forget(unique, list));
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.fini();
    }
}

impl DeviceOps for Instance {
    fn device_fini(&self) {
        self.fini();
    }

    fn device_expire(&self, now: SystemTime) {
        self.expire(now);
    }

    fn device_transact(&self, irp: &mut Irp<'_>) -> Status {
        if irp.major_function != IRP_MJ_FILE_SYSTEM_CONTROL
            || irp.minor_function != IRP_MN_USER_FS_REQUEST
            || irp.control_code != FUSE_FSCTL_TRANSACT
        {
            return Status::InvalidDeviceRequest;
        }
        let input = if irp.input.is_empty() {
            None
        } else {
            Some(irp.input)
        };
        let output = if irp.output.is_empty() {
            None
        } else {
            Some(&mut *irp.output)
        };
        match self.transact(input, output) {
            Ok(information) => {
                irp.information = information;
                Status::Success
            }
            Err(status) => {
                irp.information = 0;
                status
            }
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("params", &self.shared.params)
            .field("ioq", &self.shared.ioq)
            .field("cache", &self.shared.cache)
            .field("files", &self.shared.files)
            .field("gate", &self.shared.gate)
            .field("finished", &self.finished)
            .finish()
    }
}
