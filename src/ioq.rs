//! The I/O queue.
//!
//! Two linked structures pair outstanding FUSE requests with their
//! responses: a pending FIFO of contexts waiting to emit, and a processing
//! map keyed by correlation ID of contexts awaiting a response. A context
//! sits in at most one of the two at any time, which is what makes each
//! context single-threaded even though many host threads run the transact
//! loop concurrently.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use log::debug;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::context::Context;
use crate::ll::Status;

/// Sentinel stored in the version word when the daemon's INIT reply was
/// unusable; waiters fail with access denied.
pub(crate) const VERSION_DENIED: u32 = u32::MAX;

/// The I/O queue. All locking is internal.
pub(crate) struct Ioq {
    pending: Mutex<VecDeque<Box<Context>>>,
    processing: Mutex<HashMap<u64, Box<Context>>>,
    ticket: AtomicU64,
}

impl Ioq {
    pub(crate) fn new() -> Ioq {
        Ioq {
            pending: Mutex::new(VecDeque::new()),
            processing: Mutex::new(HashMap::new()),
            ticket: AtomicU64::new(1),
        }
    }

    /// Allocate a correlation ID. Tickets are never reused, so no two live
    /// contexts can share one.
    pub(crate) fn next_unique(&self) -> u64 {
        self.ticket.fetch_add(1, Ordering::Relaxed)
    }

    /// Append a context to the pending FIFO.
    pub(crate) fn post_pending(&self, ctx: Box<Context>) {
        self.pending.lock().push_back(ctx);
    }

    /// Pop the head of the pending FIFO.
    pub(crate) fn next_pending(&self) -> Option<Box<Context>> {
        self.pending.lock().pop_front()
    }

    /// Move a context that just emitted a request into the processing map.
    pub(crate) fn start_processing(&self, ctx: Box<Context>) {
        let prev = self.processing.lock().insert(ctx.unique(), ctx);
        debug_assert!(prev.is_none(), "correlation ID reused");
    }

    /// Remove and return the context a response belongs to. `None` means
    /// the daemon sent a spurious or late response.
    pub(crate) fn end_processing(&self, unique: u64) -> Option<Box<Context>> {
        self.processing.lock().remove(&unique)
    }

    /// Drop every queued context. Context teardown runs their release
    /// hooks (cache pins, forget lists).
    pub(crate) fn drain(&self) {
        let pending: Vec<_> = self.pending.lock().drain(..).collect();
        let processing: Vec<_> = {
            let mut map = self.processing.lock();
            map.drain().map(|(_, ctx)| ctx).collect()
        };
        if !pending.is_empty() || !processing.is_empty() {
            debug!(
                "draining ioq: {} pending, {} processing",
                pending.len(),
                processing.len()
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn processing_len(&self) -> usize {
        self.processing.lock().len()
    }
}

impl std::fmt::Debug for Ioq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ioq")
            .field("pending", &self.pending.lock().len())
            .field("processing", &self.processing.lock().len())
            .finish()
    }
}

/// The init event plus the negotiated protocol version words.
///
/// Request half-steps that find nothing pending before the INIT exchange
/// has completed wait here; the wait is cancellable by instance shutdown.
/// The version major is read with acquire ordering before any wait so a
/// completion racing with a fresh request cannot be lost.
pub(crate) struct InitGate {
    major: AtomicU32,
    minor: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
    shutdown: AtomicBool,
}

impl InitGate {
    pub(crate) fn new() -> InitGate {
        InitGate {
            major: AtomicU32::new(0),
            minor: AtomicU32::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Negotiated major version; zero until INIT completes,
    /// [`VERSION_DENIED`] after a failed handshake.
    pub(crate) fn major(&self) -> u32 {
        self.major.load(Ordering::Acquire)
    }

    /// Negotiated minor version; meaningful once `major` is non-zero.
    pub(crate) fn minor(&self) -> u32 {
        self.minor.load(Ordering::Acquire)
    }

    /// Record a completed handshake and wake all waiters.
    pub(crate) fn complete(&self, major: u32, minor: u32) {
        self.minor.store(minor, Ordering::Release);
        self.major.store(major, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Record a failed handshake; waiters observe access denied.
    pub(crate) fn deny(&self) {
        self.complete(VERSION_DENIED, 0);
    }

    /// Cancel every current and future wait.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Block until the handshake completes. Errors: access denied after a
    /// failed handshake, cancelled after shutdown.
    pub(crate) fn wait(&self) -> Result<(), Status> {
        let mut guard = self.lock.lock();
        loop {
            match self.major.load(Ordering::Acquire) {
                VERSION_DENIED => return Err(Status::AccessDenied),
                0 => {}
                _ => return Ok(()),
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Status::Cancelled);
            }
            self.cond.wait(&mut guard);
        }
    }
}

impl std::fmt::Debug for InitGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitGate")
            .field("major", &self.major)
            .field("minor", &self.minor)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}
