//! Asynchronous queries.
//!
//! A query exists (as far as [`QueryManager::query`] is concerned) only once it has been begun.
//! `EndQuery` moves it to the pending queue; [`QueryManager::process_pending_queries`] resolves
//! pending queries strictly in submission order and publishes each result into the client's
//! `QuerySync` block, writing the result before the `process_count` the client polls on.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use gpucmd_protocol::{gl, QUERY_SYNC_RESULT_OFFSET};
use thiserror::Error;
use tracing::{trace, warn};

use crate::backend::{BackendError, FenceStatus, FenceToken, FenceWait, Region, ResourceKind, ServiceId, SharedBackend};
use crate::config::FeatureSet;
use crate::error::GlError;
use crate::id_allocator::{IdAllocator, INVALID_ID};
use crate::pixel_transfer::AsyncPixelTransferManager;
use crate::resource_manager::ClientId;
use crate::shared_memory::MemoryRange;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryTarget {
    AnySamplesPassed,
    AnySamplesPassedConservative,
    CommandsIssued,
    CommandsCompleted,
    AsyncPixelUnpackCompleted,
}

impl QueryTarget {
    /// Parse `target`, honoring feature gating.
    pub fn from_gl(target: u32, features: FeatureSet) -> Option<Self> {
        let (query, feature) = match target {
            gl::ANY_SAMPLES_PASSED => (Self::AnySamplesPassed, FeatureSet::OCCLUSION_QUERY),
            gl::ANY_SAMPLES_PASSED_CONSERVATIVE => (Self::AnySamplesPassedConservative, FeatureSet::OCCLUSION_QUERY),
            gl::COMMANDS_ISSUED_CHROMIUM => (Self::CommandsIssued, FeatureSet::COMMANDS_ISSUED_QUERY),
            gl::COMMANDS_COMPLETED_CHROMIUM => (Self::CommandsCompleted, FeatureSet::COMMANDS_COMPLETED_QUERY),
            gl::ASYNC_PIXEL_UNPACK_COMPLETED_CHROMIUM => {
                (Self::AsyncPixelUnpackCompleted, FeatureSet::ASYNC_PIXEL_TRANSFERS)
            }
            _ => return None,
        };
        features.contains(feature).then_some(query)
    }

    pub const fn gl_enum(self) -> u32 {
        match self {
            Self::AnySamplesPassed => gl::ANY_SAMPLES_PASSED,
            Self::AnySamplesPassedConservative => gl::ANY_SAMPLES_PASSED_CONSERVATIVE,
            Self::CommandsIssued => gl::COMMANDS_ISSUED_CHROMIUM,
            Self::CommandsCompleted => gl::COMMANDS_COMPLETED_CHROMIUM,
            Self::AsyncPixelUnpackCompleted => gl::ASYNC_PIXEL_UNPACK_COMPLETED_CHROMIUM,
        }
    }

    const fn is_occlusion(self) -> bool {
        matches!(self, Self::AnySamplesPassed | Self::AnySamplesPassedConservative)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query id 0 is reserved")]
    ReservedId,
    #[error("query id {0} is already in use")]
    IdInUse(ClientId),
    #[error("query id {0} was not generated")]
    NotGenerated(ClientId),
    #[error("a query is already active for target 0x{0:04x}")]
    TargetActive(u32),
    #[error("query {0} is already active")]
    QueryActive(ClientId),
    #[error("query {id} was begun with target 0x{existing:04x}")]
    TargetMismatch { id: ClientId, existing: u32 },
    #[error("no query is active for target 0x{0:04x}")]
    NotActive(u32),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl QueryError {
    pub fn gl_error(&self) -> GlError {
        match self {
            Self::Backend(BackendError::OutOfMemory { .. }) => GlError::OutOfMemory,
            Self::Backend(BackendError::ContextLost) => GlError::ContextLost,
            _ => GlError::InvalidOperation,
        }
    }
}

#[derive(Debug)]
enum Completion {
    /// Active, or resolved.
    Idle,
    Fence(FenceToken),
    Flag(Arc<AtomicBool>),
}

#[derive(Debug)]
struct Query {
    client_id: ClientId,
    target: QueryTarget,
    service_id: Option<ServiceId>,
    sync: Option<MemoryRange>,
    submit_count: u32,
    begin_time: Option<Instant>,
    completion: Completion,
    pending: bool,
    result: Option<u64>,
    deleted: bool,
}

/// Client-visible state of a begun query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryStatus {
    pub target: QueryTarget,
    pub pending: bool,
    pub result: Option<u64>,
    pub submit_count: u32,
}

pub struct QueryManager {
    backend: SharedBackend,
    features: FeatureSet,
    generated: IdAllocator,
    queries: HashMap<ClientId, Rc<RefCell<Query>>>,
    active: HashMap<QueryTarget, ClientId>,
    pending: VecDeque<Rc<RefCell<Query>>>,
}

impl QueryManager {
    pub fn new(backend: SharedBackend, features: FeatureSet) -> Self {
        Self {
            backend,
            features,
            generated: IdAllocator::new(),
            queries: HashMap::new(),
            active: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    /// Reserve ids, all or nothing. Queries themselves are created on first begin.
    pub fn gen_queries(&mut self, ids: &[ClientId]) -> Result<(), QueryError> {
        let mut seen = IdAllocator::new();
        for &id in ids {
            if id == INVALID_ID {
                return Err(QueryError::ReservedId);
            }
            if self.generated.in_use(id) || !seen.mark_as_used(id) {
                return Err(QueryError::IdInUse(id));
            }
        }
        for &id in ids {
            self.generated.mark_as_used(id);
        }
        Ok(())
    }

    pub fn is_generated(&self, id: ClientId) -> bool {
        id != INVALID_ID && self.generated.in_use(id)
    }

    pub fn query(&self, id: ClientId) -> Option<QueryStatus> {
        let query = self.queries.get(&id)?.borrow();
        Some(QueryStatus {
            target: query.target,
            pending: query.pending,
            result: query.result,
            submit_count: query.submit_count,
        })
    }

    pub fn active_query(&self, target: QueryTarget) -> Option<ClientId> {
        self.active.get(&target).copied()
    }

    pub fn has_pending_queries(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn delete_queries(&mut self, ids: &[ClientId]) {
        for &id in ids {
            if !self.is_generated(id) {
                continue;
            }
            self.generated.free_id(id);
            let Some(query) = self.queries.remove(&id) else {
                continue;
            };
            let mut q = query.borrow_mut();
            if self.active.get(&q.target) == Some(&id) {
                self.active.remove(&q.target);
                if q.target.is_occlusion() {
                    let result = self.backend.borrow_mut().bind(ResourceKind::Query, q.target.gl_enum(), None);
                    if let Err(err) = result {
                        warn!(%err, id, "failed to unbind deleted query");
                    }
                }
            }
            q.deleted = true;
            if !q.pending {
                self.free_backend_object(&mut q);
            }
        }
    }

    fn free_backend_object(&self, query: &mut Query) {
        let Some(sid) = query.service_id.take() else {
            return;
        };
        let mut backend = self.backend.borrow_mut();
        if !backend.context_lost() {
            if let Err(err) = backend.delete(ResourceKind::Query, sid) {
                warn!(%err, sid, "failed to delete query object");
            }
        }
    }

    pub fn begin_query(
        &mut self,
        target: QueryTarget,
        id: ClientId,
        sync: MemoryRange,
        transfers: &mut dyn AsyncPixelTransferManager,
    ) -> Result<(), QueryError> {
        if !self.is_generated(id) {
            return Err(QueryError::NotGenerated(id));
        }
        if self.active.contains_key(&target) {
            return Err(QueryError::TargetActive(target.gl_enum()));
        }
        if self.active.values().any(|&active| active == id) {
            return Err(QueryError::QueryActive(id));
        }
        if let Some(existing) = self.queries.get(&id) {
            let existing_target = existing.borrow().target;
            if existing_target != target {
                return Err(QueryError::TargetMismatch {
                    id,
                    existing: existing_target.gl_enum(),
                });
            }
            if existing.borrow().pending {
                // Never drop a result the client may still be waiting for.
                let query = Rc::clone(existing);
                self.resolve_blocking(&query, transfers);
            }
        }

        let existing = self.queries.get(&id).cloned();
        let mut service_id = existing.as_ref().and_then(|q| q.borrow().service_id);
        if target.is_occlusion() {
            let mut backend = self.backend.borrow_mut();
            let sid = match service_id {
                Some(sid) => sid,
                None => backend.create(ResourceKind::Query)?,
            };
            if let Err(err) = backend.bind(ResourceKind::Query, target.gl_enum(), Some(sid)) {
                if service_id.is_none() && !backend.context_lost() {
                    if let Err(delete_err) = backend.delete(ResourceKind::Query, sid) {
                        warn!(err = %delete_err, sid, "failed to delete query object");
                    }
                }
                return Err(err.into());
            }
            service_id = Some(sid);
        }

        // The backend accepted the query; only now does it become visible.
        let query = match existing {
            Some(q) => q,
            None => {
                let q = Rc::new(RefCell::new(Query {
                    client_id: id,
                    target,
                    service_id: None,
                    sync: None,
                    submit_count: 0,
                    begin_time: None,
                    completion: Completion::Idle,
                    pending: false,
                    result: None,
                    deleted: false,
                }));
                self.queries.insert(id, Rc::clone(&q));
                q
            }
        };
        let mut q = query.borrow_mut();
        q.service_id = service_id;
        q.sync = Some(sync);
        q.result = None;
        q.begin_time = Some(Instant::now());
        self.active.insert(target, id);
        Ok(())
    }

    pub fn end_query(
        &mut self,
        target: QueryTarget,
        submit_count: u32,
        transfers: &mut dyn AsyncPixelTransferManager,
    ) -> Result<(), QueryError> {
        let id = *self
            .active
            .get(&target)
            .ok_or(QueryError::NotActive(target.gl_enum()))?;
        let Some(query) = self.queries.get(&id).cloned() else {
            self.active.remove(&target);
            return Ok(());
        };
        // Backend work first: a failure leaves the query active rather than half pending.
        let (completion, result) = match target {
            QueryTarget::AnySamplesPassed | QueryTarget::AnySamplesPassedConservative => {
                let mut backend = self.backend.borrow_mut();
                backend.bind(ResourceKind::Query, target.gl_enum(), None)?;
                (Completion::Fence(backend.fence()), None)
            }
            QueryTarget::CommandsCompleted => (Completion::Fence(self.backend.borrow_mut().fence()), None),
            QueryTarget::CommandsIssued => {
                let elapsed = query.borrow().begin_time.map_or(0, |t| t.elapsed().as_micros() as u64);
                (Completion::Idle, Some(elapsed))
            }
            QueryTarget::AsyncPixelUnpackCompleted => {
                let flag = Arc::new(AtomicBool::new(false));
                let signal = Arc::clone(&flag);
                transfers.async_notify_completion(Box::new(move || signal.store(true, Ordering::Release)));
                (Completion::Flag(flag), None)
            }
        };
        self.active.remove(&target);
        {
            let mut q = query.borrow_mut();
            q.submit_count = submit_count;
            q.pending = true;
            q.completion = completion;
            q.result = result;
        }
        self.pending.push_back(query);
        Ok(())
    }

    /// Resolve pending queries in order.
    ///
    /// Without `blocking`, stops at the first query that is not complete yet and returns `false`.
    /// Returns `true` once nothing is pending.
    pub fn process_pending_queries(&mut self, blocking: bool, transfers: &mut dyn AsyncPixelTransferManager) -> bool {
        while let Some(query) = self.pending.front().cloned() {
            let done = if blocking {
                self.resolve_blocking(&query, transfers);
                true
            } else {
                self.try_resolve(&query)
            };
            if !done {
                return false;
            }
        }
        true
    }

    fn try_resolve(&mut self, query: &Rc<RefCell<Query>>) -> bool {
        let ready = {
            let q = query.borrow();
            match &q.completion {
                Completion::Idle => true,
                Completion::Fence(token) => {
                    self.backend.borrow_mut().wait_fence(*token, FenceWait::Poll) == FenceStatus::Signaled
                }
                Completion::Flag(flag) => flag.load(Ordering::Acquire),
            }
        };
        if ready {
            self.complete(query);
        }
        ready
    }

    fn resolve_blocking(&mut self, query: &Rc<RefCell<Query>>, transfers: &mut dyn AsyncPixelTransferManager) {
        let flag = match &query.borrow().completion {
            Completion::Fence(token) => {
                self.backend.borrow_mut().wait_fence(*token, FenceWait::Block);
                None
            }
            Completion::Flag(flag) => Some(Arc::clone(flag)),
            Completion::Idle => None,
        };
        if let Some(flag) = flag {
            while !flag.load(Ordering::Acquire) {
                if transfers.needs_process_more_pending_transfers() {
                    transfers.process_more_pending_transfers();
                } else {
                    std::thread::yield_now();
                }
            }
        }
        self.complete(query);
    }

    /// Publish the result and drop the query from the pending queue.
    fn complete(&mut self, query: &Rc<RefCell<Query>>) {
        let mut q = query.borrow_mut();
        let result = match q.completion {
            Completion::Fence(_) if q.target.is_occlusion() => {
                let samples = q.service_id.and_then(|sid| {
                    let bytes = self
                        .backend
                        .borrow()
                        .read(ResourceKind::Query, sid, &Region::Linear { offset: 0, len: 8 })
                        .ok()?;
                    Some(u64::from_le_bytes(bytes.try_into().ok()?))
                });
                u64::from(samples.unwrap_or(0) > 0)
            }
            Completion::Idle => q.result.unwrap_or(0),
            _ => 0,
        };
        q.completion = Completion::Idle;
        q.result = Some(result);
        q.pending = false;
        if let Some(sync) = &q.sync {
            sync.write_u64(QUERY_SYNC_RESULT_OFFSET, result);
            sync.write_u32(0, q.submit_count);
        }
        trace!(id = q.client_id, result, "query resolved");
        if q.deleted {
            self.free_backend_object(&mut q);
        }
        drop(q);
        self.pending.retain(|p| !Rc::ptr_eq(p, query));
    }
}

impl Drop for QueryManager {
    fn drop(&mut self) {
        let queries: Vec<_> = self.queries.drain().map(|(_, q)| q).collect();
        for query in queries.iter().chain(self.pending.iter()) {
            self.free_backend_object(&mut query.borrow_mut());
        }
    }
}
