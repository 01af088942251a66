//! Operation contexts.
//!
//! A context drives one in-kernel request through one or more FUSE wire
//! exchanges. Each per-opcode routine is a resumable state machine with a
//! single suspension point between filling the outbound request and
//! inspecting the inbound response; the resume label lives in the context
//! and the whole thing is driven step by step by external transact calls.
//! There is no scheduler and no heap-allocated future.

use std::fmt;
use std::ops::ControlFlow;
use std::os::unix::ffi::OsStrExt;

use log::debug;
use log::warn;

use crate::attr::fuse_attr_to_file_info;
use crate::cache::ForgetList;
use crate::instance::Shared;
use crate::ll::Errno;
use crate::ll::Status;
use crate::ll::argument::ArgumentIterator;
use crate::ll::fuse_abi as abi;
use crate::proto;
use crate::provider::InternalRequest;
use crate::provider::InternalResponse;
use crate::provider::RequestKind;

/// `Continue` means the context wants another scheduling cycle; `Break`
/// means it reached a terminal state for this exchange.
pub(crate) type Flow = ControlFlow<()>;

/// A validated daemon response, header already stripped.
pub(crate) struct WireResponse<'a> {
    pub(crate) error: i32,
    pub(crate) data: &'a [u8],
}

enum Stage {
    Send,
    Recv,
}

enum Coro {
    /// Early failure carrying a native status in place of a state machine.
    Failed(Status),
    Init(Stage),
    Lookup(Stage),
    GetAttr(Stage),
    Open(Stage),
    OpenDir(Stage),
    /// No suspension point: FORGET and BATCH_FORGET get no reply, the
    /// context re-enters only to drain the rest of its list.
    Forget(ForgetList),
}

/// The per-operation unit of work.
pub(crate) struct Context {
    unique: u64,
    coro: Coro,
    request: Option<InternalRequest>,
    response: Option<InternalResponse>,
}

impl Context {
    /// Bind a context to an internal request admitted from the host.
    /// Construction validates what it can up front; a failed validation
    /// yields a status-only context the engine short-circuits.
    pub(crate) fn new(request: InternalRequest, unique: u64) -> Box<Context> {
        let coro = match &request.kind {
            RequestKind::Lookup { name, .. } => {
                let bytes = name.as_bytes();
                if bytes.is_empty()
                    || bytes.contains(&b'/')
                    || proto::REQ_HEADER_SIZE + bytes.len() + 1 > proto::REQ_SIZEMIN
                {
                    Coro::Failed(Status::ObjectNameInvalid)
                } else {
                    Coro::Lookup(Stage::Send)
                }
            }
            RequestKind::GetAttr { .. } => Coro::GetAttr(Stage::Send),
            RequestKind::Open { .. } => Coro::Open(Stage::Send),
            RequestKind::OpenDir { .. } => Coro::OpenDir(Stage::Send),
        };
        Box::new(Context {
            unique,
            coro,
            request: Some(request),
            response: None,
        })
    }

    /// The self-generated INIT handshake context.
    pub(crate) fn new_init(unique: u64) -> Box<Context> {
        Box::new(Context {
            unique,
            coro: Coro::Init(Stage::Send),
            request: None,
            response: None,
        })
    }

    /// A self-generated forget context owning a swept list.
    pub(crate) fn new_forget(unique: u64, list: ForgetList) -> Box<Context> {
        Box::new(Context {
            unique,
            coro: Coro::Forget(list),
            request: None,
            response: None,
        })
    }

    /// The correlation ID stamped into every request this context emits.
    pub(crate) fn unique(&self) -> u64 {
        self.unique
    }

    /// Non-`None` for a status-only context.
    pub(crate) fn failed_status(&self) -> Option<Status> {
        match &self.coro {
            Coro::Failed(status) => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn has_request(&self) -> bool {
        self.request.is_some()
    }

    /// Forget entries still to drain; drives re-posting after a batch.
    pub(crate) fn forget_remaining(&self) -> usize {
        match &self.coro {
            Coro::Forget(list) => list.len(),
            _ => 0,
        }
    }

    /// The assembled internal response of a terminal context.
    pub(crate) fn take_response(&mut self) -> Option<InternalResponse> {
        self.response.take()
    }

    /// Synthesize the internal response of a status-only context.
    pub(crate) fn failure_response(&self) -> Option<InternalResponse> {
        let status = self.failed_status()?;
        let request = self.request.as_ref()?;
        Some(InternalResponse {
            op: request.kind.op(),
            hint: request.hint,
            status,
            file_info: None,
            handle: None,
        })
    }

    fn complete(&mut self, status: Status, file_info: Option<crate::attr::FileInfo>, handle: Option<u64>) {
        self.response = self.request.as_ref().map(|request| InternalResponse {
            op: request.kind.op(),
            hint: request.hint,
            status,
            file_info,
            handle,
        });
    }

    /// Resume the state machine. On the request half the engine passes the
    /// output buffer; on the response half it passes the parsed response.
    /// Both buffers are transient, valid only for this call.
    pub(crate) fn process(
        &mut self,
        shared: &Shared,
        rsp: Option<&WireResponse<'_>>,
        out: Option<&mut [u8]>,
    ) -> Flow {
        match &mut self.coro {
            Coro::Failed(_) => Flow::Break(()),

            Coro::Init(Stage::Send) => {
                let Some(out) = out else {
                    return Flow::Break(());
                };
                proto::fill_init(out, self.unique);
                self.coro = Coro::Init(Stage::Recv);
                Flow::Continue(())
            }
            Coro::Init(Stage::Recv) => {
                let Some(rsp) = rsp else {
                    return Flow::Break(());
                };
                complete_init(shared, rsp);
                Flow::Break(())
            }

            Coro::Lookup(Stage::Send) => {
                let Some(out) = out else {
                    return Flow::Break(());
                };
                let Some(RequestKind::Lookup { parent, name }) =
                    self.request.as_ref().map(|r| &r.kind)
                else {
                    return Flow::Break(());
                };
                let (parent, name) = (*parent, name.clone());
                if let Some(item) = shared.cache.lookup(parent, &name) {
                    shared.cache.reference(&item);
                    let info = fuse_attr_to_file_info(item.attr(), &shared.params);
                    shared.cache.release(&item);
                    debug!(
                        "lookup hit: parent {:#x} name {:?} ino {:#x} gen {}",
                        parent,
                        name,
                        item.ino(),
                        item.generation()
                    );
                    self.complete(Status::Success, Some(info), None);
                    return Flow::Break(());
                }
                let origin = match self.request.as_ref() {
                    Some(request) => request.origin,
                    None => return Flow::Break(()),
                };
                match proto::fill_lookup(out, self.unique, parent, &name, origin) {
                    Ok(_) => {
                        self.coro = Coro::Lookup(Stage::Recv);
                        Flow::Continue(())
                    }
                    Err(status) => {
                        self.complete(status, None, None);
                        Flow::Break(())
                    }
                }
            }
            Coro::Lookup(Stage::Recv) => {
                let Some(rsp) = rsp else {
                    return Flow::Break(());
                };
                if rsp.error != 0 {
                    let status = Status::from_errno(Errno::from_wire(rsp.error));
                    self.complete(status, None, None);
                    return Flow::Break(());
                }
                let mut it = ArgumentIterator::new(rsp.data);
                match it.fetch::<abi::fuse_entry_out>() {
                    Some(entry) if entry.nodeid != 0 => {
                        if let Some(RequestKind::Lookup { parent, name }) =
                            self.request.as_ref().map(|r| &r.kind)
                        {
                            shared
                                .cache
                                .insert(*parent, name, &entry.attr, entry.generation);
                        }
                        let info = fuse_attr_to_file_info(&entry.attr, &shared.params);
                        self.complete(Status::Success, Some(info), None);
                    }
                    // a zero node id is a negative entry
                    Some(_) => self.complete(Status::ObjectNameNotFound, None, None),
                    None => {
                        warn!("short LOOKUP response for unique {}", self.unique);
                        self.complete(Status::IoDeviceError, None, None);
                    }
                }
                Flow::Break(())
            }

            Coro::GetAttr(Stage::Send) => {
                let Some(out) = out else {
                    return Flow::Break(());
                };
                let Some(request) = self.request.as_ref() else {
                    return Flow::Break(());
                };
                let RequestKind::GetAttr { ino } = &request.kind else {
                    return Flow::Break(());
                };
                proto::fill_getattr(out, self.unique, *ino, request.origin);
                self.coro = Coro::GetAttr(Stage::Recv);
                Flow::Continue(())
            }
            Coro::GetAttr(Stage::Recv) => {
                let Some(rsp) = rsp else {
                    return Flow::Break(());
                };
                if rsp.error != 0 {
                    let status = Status::from_errno(Errno::from_wire(rsp.error));
                    self.complete(status, None, None);
                    return Flow::Break(());
                }
                let mut it = ArgumentIterator::new(rsp.data);
                match it.fetch::<abi::fuse_attr_out>() {
                    Some(arg) => {
                        let info = fuse_attr_to_file_info(&arg.attr, &shared.params);
                        self.complete(Status::Success, Some(info), None);
                    }
                    None => {
                        warn!("short GETATTR response for unique {}", self.unique);
                        self.complete(Status::IoDeviceError, None, None);
                    }
                }
                Flow::Break(())
            }

            Coro::Open(Stage::Send) => {
                let Some(out) = out else {
                    return Flow::Break(());
                };
                let Some(request) = self.request.as_ref() else {
                    return Flow::Break(());
                };
                let RequestKind::Open { ino, flags } = &request.kind else {
                    return Flow::Break(());
                };
                proto::fill_open(out, self.unique, *ino, *flags, request.origin);
                self.coro = Coro::Open(Stage::Recv);
                Flow::Continue(())
            }
            Coro::Open(Stage::Recv) => {
                let Some(rsp) = rsp else {
                    return Flow::Break(());
                };
                self.finish_open(shared, rsp, false);
                Flow::Break(())
            }

            Coro::OpenDir(Stage::Send) => {
                let Some(out) = out else {
                    return Flow::Break(());
                };
                let Some(request) = self.request.as_ref() else {
                    return Flow::Break(());
                };
                let RequestKind::OpenDir { ino } = &request.kind else {
                    return Flow::Break(());
                };
                proto::fill_opendir(out, self.unique, *ino, request.origin);
                self.coro = Coro::OpenDir(Stage::Recv);
                Flow::Continue(())
            }
            Coro::OpenDir(Stage::Recv) => {
                let Some(rsp) = rsp else {
                    return Flow::Break(());
                };
                self.finish_open(shared, rsp, true);
                Flow::Break(())
            }

            Coro::Forget(list) => {
                let Some(out) = out else {
                    return Flow::Break(());
                };
                if shared.gate.minor() >= abi::FUSE_BATCH_FORGET_MINOR_VERSION {
                    let chunk = list.next_chunk(proto::batch_forget_capacity());
                    if !chunk.is_empty() {
                        let (_, count) = proto::fill_batch_forget(out, self.unique, &chunk);
                        debug!("batch forget: {} inodes", count);
                    }
                } else if let Some(ino) = list.next_inode() {
                    proto::fill_forget(out, self.unique, ino);
                    debug!("forget: inode {:#x}", ino);
                }
                Flow::Break(())
            }
        }
    }

    fn finish_open(&mut self, shared: &Shared, rsp: &WireResponse<'_>, is_dir: bool) {
        if rsp.error != 0 {
            let status = Status::from_errno(Errno::from_wire(rsp.error));
            self.complete(status, None, None);
            return;
        }
        let (ino, flags) = match self.request.as_ref().map(|r| &r.kind) {
            Some(RequestKind::Open { ino, flags }) => (*ino, *flags),
            Some(RequestKind::OpenDir { ino }) => (*ino, libc::O_RDONLY),
            _ => return,
        };
        let mut it = ArgumentIterator::new(rsp.data);
        match it.fetch::<abi::fuse_open_out>() {
            Some(arg) => {
                let handle = shared.files.open(ino, arg.fh, flags, is_dir);
                self.complete(Status::Success, None, Some(handle));
            }
            None => {
                warn!("short OPEN response for unique {}", self.unique);
                self.complete(Status::IoDeviceError, None, None);
            }
        }
    }
}

fn complete_init(shared: &Shared, rsp: &WireResponse<'_>) {
    if rsp.error != 0 {
        warn!("INIT failed with {}", Errno::from_wire(rsp.error));
        shared.gate.deny();
        return;
    }
    let mut it = ArgumentIterator::new(rsp.data);
    match it.fetch::<abi::fuse_init_out>() {
        Some(arg) if arg.major == abi::FUSE_KERNEL_VERSION => {
            let minor = arg.minor.min(abi::FUSE_KERNEL_MINOR_VERSION);
            debug!("INIT complete: protocol {}.{}", arg.major, minor);
            shared.gate.complete(arg.major, minor);
        }
        Some(arg) => {
            warn!("unsupported protocol major {}", arg.major);
            shared.gate.deny();
        }
        None => {
            warn!("short INIT response");
            shared.gate.deny();
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context {:#x}: ", self.unique)?;
        match (&self.coro, &self.request) {
            (Coro::Failed(status), _) => write!(f, "failed {status}"),
            (Coro::Init(_), _) => write!(f, "INIT"),
            (Coro::Forget(list), _) => write!(f, "FORGET {} entries", list.len()),
            (_, Some(request)) => write!(f, "{}", request.kind),
            (_, None) => write!(f, "orphan"),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
