//! The transact loop.
//!
//! The single engine entry point. One daemon invocation delivers at most
//! one FUSE response (input buffer) and extracts at most one FUSE request
//! (output buffer); the two half-steps run in that fixed order. Many host
//! threads may be in here concurrently; the IOQ contract guarantees each
//! context is resumed by one thread at a time.

use std::ops::ControlFlow;

use log::debug;
use log::error;
use zerocopy::FromBytes;

use crate::context::Context;
use crate::context::WireResponse;
use crate::instance::Instance;
use crate::ioq::VERSION_DENIED;
use crate::ll::Status;
use crate::ll::fuse_abi as abi;
use crate::proto::REQ_HEADER_SIZE;
use crate::proto::REQ_SIZEMIN;
use crate::proto::RSP_HEADER_SIZE;

impl Instance {
    /// One transact exchange.
    ///
    /// `input`, when present, carries a FUSE response from the daemon;
    /// `output`, when present, receives the next FUSE request. Returns the
    /// emitted request's `len`, or zero when no request was produced.
    ///
    /// Validation errors (`InvalidParameter` for a response with a bad
    /// `len`, `BufferTooSmall` for an undersized output buffer) return
    /// before the IOQ or cache is touched.
    ///
    /// Both buffers follow the buffered-I/O contract and must be 8-byte
    /// aligned.
    pub fn transact(&self, input: Option<&[u8]>, output: Option<&mut [u8]>) -> Result<usize, Status> {
        if self.finished() {
            return Err(Status::Cancelled);
        }
        if let Some(out) = &output {
            if out.len() < REQ_SIZEMIN {
                return Err(Status::BufferTooSmall);
            }
        }
        let header = match input {
            Some(buf) => Some(self.validate_response(buf)?),
            None => None,
        };

        let _read = self.op_guard.read();

        if let (Some(buf), Some(header)) = (input, header) {
            self.transact_response(buf, header)?;
        }
        match output {
            Some(out) => self.transact_request(out),
            None => Ok(0),
        }
    }

    fn validate_response(&self, buf: &[u8]) -> Result<abi::fuse_out_header, Status> {
        let Ok((header, _)) = abi::fuse_out_header::read_from_prefix(buf) else {
            return Err(Status::InvalidParameter);
        };
        let len = header.len as usize;
        if len < RSP_HEADER_SIZE || len > buf.len() {
            return Err(Status::InvalidParameter);
        }
        Ok(header)
    }

    /// Response half-step: pair the response with its context and resume
    /// it. A `unique` with no processing entry is a late or spurious
    /// response and is ignored.
    fn transact_response(&self, buf: &[u8], header: abi::fuse_out_header) -> Result<(), Status> {
        let Some(mut ctx) = self.shared.ioq.end_processing(header.unique) else {
            debug!("spurious response for unique {:#x}", header.unique);
            return Ok(());
        };
        let rsp = WireResponse {
            error: header.error,
            data: &buf[RSP_HEADER_SIZE..header.len as usize],
        };
        match ctx.process(&self.shared, Some(&rsp), None) {
            ControlFlow::Continue(()) => {
                // needs another wire exchange; back to pending
                self.shared.ioq.post_pending(ctx);
            }
            ControlFlow::Break(()) => {
                if let Some(response) = ctx.take_response() {
                    self.provider.complete(response).map_err(|status| {
                        error!("forwarding completion failed: {status}");
                        status
                    })?;
                }
                // self-generated contexts (INIT) just go away
            }
        }
        Ok(())
    }

    /// Request half-step: emit the next request from an already-pending
    /// context or a freshly admitted internal request.
    fn transact_request(&self, out: &mut [u8]) -> Result<usize, Status> {
        out[..REQ_HEADER_SIZE].fill(0);

        let mut ctx = match self.shared.ioq.next_pending() {
            Some(ctx) => ctx,
            None => {
                match self.shared.gate.major() {
                    0 => self.shared.gate.wait()?,
                    VERSION_DENIED => return Err(Status::AccessDenied),
                    _ => {}
                }
                let Some(request) = self.provider.next_request()? else {
                    return Ok(0);
                };
                debug!("admitted {}", request.kind);
                Context::new(request, self.shared.ioq.next_unique())
            }
        };

        if ctx.failed_status().is_some() {
            // status-only context: emit the internal response directly
            if let Some(response) = ctx.failure_response() {
                self.provider.complete(response)?;
            }
            return Ok(0);
        }

        let flow = ctx.process(&self.shared, None, Some(out));
        let written = u32::from_le_bytes([out[0], out[1], out[2], out[3]]) as usize;
        match flow {
            ControlFlow::Continue(()) => {
                self.shared.ioq.start_processing(ctx);
            }
            ControlFlow::Break(()) => {
                if !ctx.has_request() {
                    if ctx.forget_remaining() > 0 {
                        // more forget entries than fit in one message
                        self.shared.ioq.post_pending(ctx);
                    }
                } else if let Some(response) = ctx.take_response() {
                    self.provider.complete(response)?;
                }
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::ffi::OsStr;
    use std::sync::Arc;
    use std::time::Duration;
    use std::time::SystemTime;

    use parking_lot::Mutex;
    use zerocopy::IntoBytes;

    use super::*;
    use crate::attr::VolumeParams;
    use crate::attr::fuse_attr_to_file_info;
    use crate::proto;
    use crate::provider::InternalRequest;
    use crate::provider::InternalResponse;
    use crate::provider::Origin;
    use crate::provider::Provider;
    use crate::provider::RequestKind;

    #[derive(Default)]
    struct MockProvider {
        requests: Mutex<VecDeque<InternalRequest>>,
        completions: Mutex<Vec<InternalResponse>>,
    }

    impl MockProvider {
        fn push(&self, request: InternalRequest) {
            self.requests.lock().push_back(request);
        }

        fn completions(&self) -> Vec<InternalResponse> {
            self.completions.lock().clone()
        }
    }

    impl Provider for MockProvider {
        fn complete(&self, response: InternalResponse) -> Result<(), Status> {
            self.completions.lock().push(response);
            Ok(())
        }

        fn next_request(&self) -> Result<Option<InternalRequest>, Status> {
            Ok(self.requests.lock().pop_front())
        }
    }

    fn origin() -> Origin {
        Origin {
            uid: 501,
            gid: 20,
            pid: 4242,
        }
    }

    fn lookup_request(name: &str, hint: u64) -> InternalRequest {
        InternalRequest {
            kind: RequestKind::Lookup {
                parent: abi::FUSE_ROOT_ID,
                name: name.into(),
            },
            hint,
            origin: origin(),
        }
    }

    fn instance() -> (Arc<MockProvider>, Instance) {
        let provider = Arc::new(MockProvider::default());
        let instance = Instance::init(VolumeParams::default(), provider.clone()).unwrap();
        (provider, instance)
    }

    struct Buf(Vec<u64>);

    impl Buf {
        fn request() -> Buf {
            Buf(vec![0u64; REQ_SIZEMIN / 8])
        }

        fn bytes(&self) -> &[u8] {
            self.0.as_bytes()
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            self.0.as_mut_bytes()
        }

        fn header(&self) -> abi::fuse_in_header {
            abi::fuse_in_header::read_from_prefix(self.bytes()).unwrap().0
        }

        fn payload(&self) -> &[u8] {
            &self.bytes()[REQ_HEADER_SIZE..self.header().len as usize]
        }
    }

    fn response_bytes(unique: u64, error: i32, payload: &[u8]) -> Vec<u64> {
        let header = abi::fuse_out_header {
            len: (RSP_HEADER_SIZE + payload.len()) as u32,
            error,
            unique,
        };
        let mut backing = vec![0u64; (RSP_HEADER_SIZE + payload.len()).div_ceil(8)];
        let bytes = backing.as_mut_bytes();
        bytes[..RSP_HEADER_SIZE].copy_from_slice(header.as_bytes());
        bytes[RSP_HEADER_SIZE..RSP_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        backing
    }

    fn init_out(minor: u32) -> abi::fuse_init_out {
        abi::fuse_init_out {
            major: abi::FUSE_KERNEL_VERSION,
            minor,
            max_readahead: 0,
            flags: 0,
            max_background: 16,
            congestion_threshold: 12,
            max_write: 128 * 1024,
        }
    }

    fn complete_init(instance: &Instance, minor: u32) {
        let mut buf = Buf::request();
        instance.transact(None, Some(buf.bytes_mut())).unwrap();
        let unique = buf.header().unique;
        let response = response_bytes(unique, 0, init_out(minor).as_bytes());
        instance.transact(Some(response.as_bytes()), None).unwrap();
        assert_eq!(instance.version().0, abi::FUSE_KERNEL_VERSION);
    }

    fn sample_attr(ino: u64) -> abi::fuse_attr {
        abi::fuse_attr {
            ino,
            size: 5000,
            blocks: 10,
            atime: 100,
            mtime: 200,
            ctime: 300,
            atimensec: 0,
            mtimensec: 0,
            ctimensec: 0,
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            uid: 501,
            gid: 20,
            rdev: 0,
            blksize: 4096,
            padding: 0,
        }
    }

    fn entry_out(ino: u64) -> abi::fuse_entry_out {
        abi::fuse_entry_out {
            nodeid: ino,
            generation: 3,
            entry_valid: 1,
            attr_valid: 1,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr: sample_attr(ino),
        }
    }

    #[test]
    fn cold_init_emits_init_request() {
        let (_, instance) = instance();
        let mut buf = Buf::request();
        let information = instance.transact(None, Some(buf.bytes_mut())).unwrap();

        let header = buf.header();
        assert_eq!(information, header.len as usize);
        assert_eq!(header.opcode, u32::from(abi::fuse_opcode::FUSE_INIT));
        assert_ne!(header.unique, 0);
        assert_eq!(instance.shared.ioq.processing_len(), 1);
        assert_eq!(instance.shared.ioq.pending_len(), 0);

        let arg = abi::fuse_init_in::read_from_prefix(buf.payload()).unwrap().0;
        assert_eq!(arg.major, abi::FUSE_KERNEL_VERSION);
    }

    #[test]
    fn init_completion_signals_the_gate() {
        let (_, instance) = instance();
        let mut buf = Buf::request();
        instance.transact(None, Some(buf.bytes_mut())).unwrap();
        let unique = buf.header().unique;

        let response = response_bytes(unique, 0, init_out(31).as_bytes());
        let information = instance.transact(Some(response.as_bytes()), None).unwrap();
        assert_eq!(information, 0);
        assert_eq!(instance.shared.ioq.processing_len(), 0);
        // daemon offered 7.31; we clamp to our own minor
        assert_eq!(
            instance.version(),
            (abi::FUSE_KERNEL_VERSION, abi::FUSE_KERNEL_MINOR_VERSION)
        );
    }

    #[test]
    fn init_failure_denies_subsequent_requests() {
        let (_, instance) = instance();
        let mut buf = Buf::request();
        instance.transact(None, Some(buf.bytes_mut())).unwrap();
        let unique = buf.header().unique;

        let response = response_bytes(unique, -libc::EPERM, &[]);
        instance.transact(Some(response.as_bytes()), None).unwrap();

        let err = instance.transact(None, Some(buf.bytes_mut())).unwrap_err();
        assert_eq!(err, Status::AccessDenied);
    }

    #[test]
    fn lookup_round_trip_matches_direct_attr_mapping() {
        let (provider, instance) = instance();
        complete_init(&instance, 31);

        provider.push(lookup_request("foo", 9000));
        let mut buf = Buf::request();
        let information = instance.transact(None, Some(buf.bytes_mut())).unwrap();
        let header = buf.header();
        assert_eq!(information, header.len as usize);
        assert_eq!(header.opcode, u32::from(abi::fuse_opcode::FUSE_LOOKUP));
        assert_eq!(header.nodeid, abi::FUSE_ROOT_ID);
        assert_eq!(header.uid, 501);
        assert_eq!(buf.payload(), b"foo\0");

        let response = response_bytes(header.unique, 0, entry_out(42).as_bytes());
        instance.transact(Some(response.as_bytes()), None).unwrap();

        let completions = provider.completions();
        assert_eq!(completions.len(), 1);
        let completion = &completions[0];
        assert_eq!(completion.hint, 9000);
        assert_eq!(completion.status, Status::Success);
        let expected = fuse_attr_to_file_info(&sample_attr(42), instance.volume_params());
        assert_eq!(completion.file_info, Some(expected));
    }

    #[test]
    fn second_lookup_is_served_from_the_cache() {
        let (provider, instance) = instance();
        complete_init(&instance, 31);

        provider.push(lookup_request("foo", 1));
        let mut buf = Buf::request();
        instance.transact(None, Some(buf.bytes_mut())).unwrap();
        let response = response_bytes(buf.header().unique, 0, entry_out(42).as_bytes());
        instance.transact(Some(response.as_bytes()), None).unwrap();
        assert_eq!(instance.shared.cache.len(), 1);

        // same name again: completes on the request half with no wire exchange
        provider.push(lookup_request("foo", 2));
        let information = instance.transact(None, Some(buf.bytes_mut())).unwrap();
        assert_eq!(information, 0);
        assert_eq!(instance.shared.ioq.processing_len(), 0);
        let completions = provider.completions();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[1].hint, 2);
        assert_eq!(completions[1].status, Status::Success);
        assert_eq!(completions[0].file_info, completions[1].file_info);
    }

    #[test]
    fn lookup_enoent_maps_to_name_not_found_and_caches_nothing() {
        let (provider, instance) = instance();
        complete_init(&instance, 31);

        provider.push(lookup_request("missing", 5));
        let mut buf = Buf::request();
        instance.transact(None, Some(buf.bytes_mut())).unwrap();

        let response = response_bytes(buf.header().unique, -libc::ENOENT, &[]);
        instance.transact(Some(response.as_bytes()), None).unwrap();

        let completions = provider.completions();
        assert_eq!(completions[0].status, Status::ObjectNameNotFound);
        assert!(completions[0].file_info.is_none());
        assert_eq!(instance.shared.cache.len(), 0);
        assert_eq!(instance.shared.ioq.processing_len(), 0);
    }

    #[test]
    fn open_allocates_a_host_handle() {
        let (provider, instance) = instance();
        complete_init(&instance, 31);

        provider.push(InternalRequest {
            kind: RequestKind::Open {
                ino: 42,
                flags: libc::O_RDWR,
            },
            hint: 7,
            origin: origin(),
        });
        let mut buf = Buf::request();
        instance.transact(None, Some(buf.bytes_mut())).unwrap();
        let header = buf.header();
        assert_eq!(header.opcode, u32::from(abi::fuse_opcode::FUSE_OPEN));

        let open_out = abi::fuse_open_out {
            fh: 0xfeed,
            open_flags: 0,
            padding: 0,
        };
        let response = response_bytes(header.unique, 0, open_out.as_bytes());
        instance.transact(Some(response.as_bytes()), None).unwrap();

        let completions = provider.completions();
        let handle = completions[0].handle.unwrap();
        let file = instance.shared.files.get(handle).unwrap();
        assert_eq!(file.ino, 42);
        assert_eq!(file.fh, 0xfeed);
        assert!(!file.is_dir);
    }

    #[test]
    fn batched_forget_drains_the_sweep_in_chunks() {
        let (_, instance) = instance();
        complete_init(&instance, 31);

        let total = proto::batch_forget_capacity() + 91;
        for i in 0..total as u64 {
            let name = format!("f{i}");
            instance
                .shared
                .cache
                .insert(abi::FUSE_ROOT_ID, OsStr::new(&name), &sample_attr(100 + i), 1);
        }
        instance.expire(SystemTime::now() + Duration::from_secs(3600));
        assert_eq!(instance.shared.ioq.pending_len(), 1);

        let mut buf = Buf::request();
        instance.transact(None, Some(buf.bytes_mut())).unwrap();
        let header = buf.header();
        assert_eq!(header.opcode, u32::from(abi::fuse_opcode::FUSE_BATCH_FORGET));
        let arg = abi::fuse_batch_forget_in::read_from_prefix(buf.payload()).unwrap().0;
        assert_eq!(arg.count as usize, proto::batch_forget_capacity());
        // more entries than fit: context re-posted pending
        assert_eq!(instance.shared.ioq.pending_len(), 1);
        assert_eq!(instance.shared.ioq.processing_len(), 0);

        instance.transact(None, Some(buf.bytes_mut())).unwrap();
        let arg = abi::fuse_batch_forget_in::read_from_prefix(buf.payload()).unwrap().0;
        assert_eq!(arg.count, 91);
        assert_eq!(instance.shared.ioq.pending_len(), 0);
    }

    #[test]
    fn old_daemons_get_single_forgets() {
        let (_, instance) = instance();
        complete_init(&instance, 15);

        for i in 0..3u64 {
            let name = format!("f{i}");
            instance
                .shared
                .cache
                .insert(abi::FUSE_ROOT_ID, OsStr::new(&name), &sample_attr(100 + i), 1);
        }
        instance.expire(SystemTime::now() + Duration::from_secs(3600));

        let mut buf = Buf::request();
        for _ in 0..3 {
            instance.transact(None, Some(buf.bytes_mut())).unwrap();
            let header = buf.header();
            assert_eq!(header.opcode, u32::from(abi::fuse_opcode::FUSE_FORGET));
            let arg = abi::fuse_forget_in::read_from_prefix(buf.payload()).unwrap().0;
            assert_eq!(arg.nlookup, 1);
        }
        // list drained; context destroyed
        assert_eq!(instance.shared.ioq.pending_len(), 0);
        let information = instance.transact(None, Some(buf.bytes_mut())).unwrap();
        assert_eq!(information, 0);
    }

    #[test]
    fn spurious_response_is_ignored_and_request_half_still_runs() {
        let (provider, instance) = instance();
        complete_init(&instance, 31);

        provider.push(lookup_request("foo", 1));
        let response = response_bytes(0xdead_beef, 0, entry_out(1).as_bytes());
        let mut buf = Buf::request();
        let information = instance
            .transact(Some(response.as_bytes()), Some(buf.bytes_mut()))
            .unwrap();
        assert_eq!(buf.header().opcode, u32::from(abi::fuse_opcode::FUSE_LOOKUP));
        assert_eq!(information, buf.header().len as usize);
        assert_eq!(instance.shared.ioq.processing_len(), 1);
    }

    #[test]
    fn status_only_context_short_circuits() {
        let (provider, instance) = instance();
        complete_init(&instance, 31);

        provider.push(lookup_request("bad/name", 13));
        let mut buf = Buf::request();
        let information = instance.transact(None, Some(buf.bytes_mut())).unwrap();
        assert_eq!(information, 0);

        let completions = provider.completions();
        assert_eq!(completions[0].hint, 13);
        assert_eq!(completions[0].status, Status::ObjectNameInvalid);
        assert_eq!(instance.shared.ioq.processing_len(), 0);
        assert_eq!(instance.shared.ioq.pending_len(), 0);
    }

    #[test]
    fn undersized_output_buffer_is_rejected() {
        let (_, instance) = instance();
        let mut small = vec![0u64; (REQ_SIZEMIN - 8) / 8];
        let err = instance
            .transact(None, Some(small.as_mut_bytes()))
            .unwrap_err();
        assert_eq!(err, Status::BufferTooSmall);
        // exactly REQ_SIZEMIN is accepted
        let mut exact = Buf::request();
        assert!(instance.transact(None, Some(exact.bytes_mut())).is_ok());
    }

    #[test]
    fn bad_response_len_is_rejected_before_the_ioq() {
        let (_, instance) = instance();
        let mut buf = Buf::request();
        instance.transact(None, Some(buf.bytes_mut())).unwrap();
        let unique = buf.header().unique;

        // len below the header size
        let mut short = response_bytes(unique, 0, &[]);
        short.as_mut_bytes()[..4].copy_from_slice(&8u32.to_le_bytes());
        let err = instance.transact(Some(short.as_bytes()), None).unwrap_err();
        assert_eq!(err, Status::InvalidParameter);

        // len beyond the input buffer
        let mut long = response_bytes(unique, 0, &[]);
        long.as_mut_bytes()[..4].copy_from_slice(&1024u32.to_le_bytes());
        let err = instance.transact(Some(long.as_bytes()), None).unwrap_err();
        assert_eq!(err, Status::InvalidParameter);

        // the INIT context is still in processing, untouched
        assert_eq!(instance.shared.ioq.processing_len(), 1);

        // a bare header is a valid response
        let bare = response_bytes(unique, -libc::EPERM, &[]);
        assert!(instance.transact(Some(bare.as_bytes()), None).is_ok());
    }

    #[test]
    fn fini_drains_everything_in_order() {
        let (provider, instance) = instance();
        complete_init(&instance, 31);

        provider.push(lookup_request("foo", 1));
        let mut buf = Buf::request();
        instance.transact(None, Some(buf.bytes_mut())).unwrap();
        assert_eq!(instance.shared.ioq.processing_len(), 1);

        instance.fini();
        assert_eq!(instance.shared.ioq.processing_len(), 0);
        assert_eq!(instance.shared.files.len(), 0);
        assert_eq!(instance.shared.cache.len(), 0);

        let err = instance.transact(None, Some(buf.bytes_mut())).unwrap_err();
        assert_eq!(err, Status::Cancelled);
    }
}
