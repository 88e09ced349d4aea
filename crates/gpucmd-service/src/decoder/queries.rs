use gpucmd_protocol::cmd::QUERY_SYNC_SIZE_BYTES;

use super::{CmdResult, GpuDecoder};
use crate::backend::BackendError;
use crate::error::{ExecError, GlError};
use crate::query_manager::{QueryError, QueryTarget};

impl GpuDecoder {
    fn query_failed(&mut self, function: &'static str, err: QueryError) -> CmdResult {
        match err {
            QueryError::Backend(BackendError::ContextLost) => Err(ExecError::LostContext),
            QueryError::ReservedId | QueryError::IdInUse(_) => Err(ExecError::InvalidArguments),
            err => self.fail(err.gl_error(), function, &err.to_string()),
        }
    }

    pub(super) fn exec_gen_queries(&mut self, ids: &[u32]) -> CmdResult {
        match self.queries.gen_queries(ids) {
            Ok(()) => Ok(()),
            Err(err) => self.query_failed("glGenQueriesEXT", err),
        }
    }

    pub(super) fn exec_begin_query(&mut self, target: u32, id: u32, sync_shm_id: u32, sync_shm_offset: u32) -> CmdResult {
        const FN: &str = "glBeginQueryEXT";
        let sync = self.resolve(sync_shm_id, sync_shm_offset, QUERY_SYNC_SIZE_BYTES)?;
        let Some(target) = QueryTarget::from_gl(target, self.config.features) else {
            return self.fail(GlError::InvalidEnum, FN, "invalid target");
        };
        if id == 0 {
            return self.fail(GlError::InvalidOperation, FN, "query id 0");
        }
        match self.queries.begin_query(target, id, sync, self.transfers.as_mut()) {
            Ok(()) => Ok(()),
            Err(err) => self.query_failed(FN, err),
        }
    }

    pub(super) fn exec_end_query(&mut self, target: u32, submit_count: u32) -> CmdResult {
        const FN: &str = "glEndQueryEXT";
        let Some(target) = QueryTarget::from_gl(target, self.config.features) else {
            return self.fail(GlError::InvalidEnum, FN, "invalid target");
        };
        match self.queries.end_query(target, submit_count, self.transfers.as_mut()) {
            Ok(()) => Ok(()),
            Err(err) => self.query_failed(FN, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use gpucmd_protocol::{gl, CmdWriter, CommandStatus};

    use crate::backend::SoftBackend;
    use crate::config::ServiceConfig;
    use crate::decoder::GpuDecoder;
    use crate::device::{ContextGroup, GpuDevice};
    use crate::shared_memory::SharedMemory;

    fn decoder() -> (Rc<RefCell<SoftBackend>>, GpuDecoder) {
        let soft = Rc::new(RefCell::new(SoftBackend::new()));
        let device = GpuDevice::new(soft.clone());
        let group = ContextGroup::new(&device, ServiceConfig::default()).unwrap();
        (soft, GpuDecoder::new(&group))
    }

    #[test]
    fn commands_completed_resolves_after_the_fence() {
        let (soft, mut dec) = decoder();
        soft.borrow_mut().set_fence_latency(1);
        let mem = SharedMemory::new(16);
        let shm = dec.shared_memory().register(mem.clone());
        let mut w = CmdWriter::new();
        w.gen_queries(&[4]);
        w.begin_query(gl::COMMANDS_COMPLETED_CHROMIUM, 4, shm, 0);
        w.end_query(gl::COMMANDS_COMPLETED_CHROMIUM, 12);
        assert_eq!(dec.execute(w.as_words()).status, CommandStatus::NoError);
        assert!(dec.has_pending_queries());

        assert!(!dec.process_pending_queries(false));
        assert!(dec.process_pending_queries(false));
        assert_eq!(mem.read_u32(0), Some(12));
        assert_eq!(dec.query(4).map(|q| q.pending), Some(false));
    }

    #[test]
    fn begin_errors() {
        let (_, mut dec) = decoder();
        let shm = dec.shared_memory().register(SharedMemory::new(16));
        let mut w = CmdWriter::new();
        w.begin_query(gl::COMMANDS_COMPLETED_CHROMIUM, 0, shm, 0);
        w.begin_query(0x1234, 1, shm, 0);
        w.end_query(gl::COMMANDS_COMPLETED_CHROMIUM, 1);
        assert_eq!(dec.execute(w.as_words()).status, CommandStatus::NoError);
        assert_eq!(dec.get_error(), gl::INVALID_ENUM);
        assert_eq!(dec.get_error(), gl::INVALID_OPERATION);

        let mut w = CmdWriter::new();
        w.gen_queries(&[1]);
        w.begin_query(gl::COMMANDS_COMPLETED_CHROMIUM, 1, shm, 8);
        let r = dec.execute(w.as_words());
        assert_eq!(r.status, CommandStatus::OutOfBounds);
        assert_eq!(r.commands_processed, 1);
    }
}
