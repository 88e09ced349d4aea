use std::collections::HashMap;

use thiserror::Error;

use crate::backend::{BackendError, ServiceId};
use crate::id_allocator::{IdAllocator, INVALID_ID};
use crate::resource::{Resource, ResourceRef, SharedPool};

pub type ClientId = u32;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("client id 0 is reserved")]
    ReservedId,
    #[error("client id {0} is already in use")]
    IdInUse(ClientId),
    #[error("client id {0} was never generated")]
    NotGenerated(ClientId),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Maps client ids to resources for one resource type within a context group.
///
/// The manager holds one reference per mapped id. Deleting an id drops that mapping
/// immediately; the resource itself lives on while anything else (another context group, a
/// binding, a framebuffer attachment) still references it.
pub struct ResourceManager<T: Resource> {
    pool: SharedPool<T>,
    ids: IdAllocator,
    resources: HashMap<ClientId, ResourceRef<T>>,
    bind_generates_resource: bool,
}

impl<T: Resource> ResourceManager<T> {
    pub fn new(pool: SharedPool<T>, bind_generates_resource: bool) -> Self {
        Self {
            pool,
            ids: IdAllocator::new(),
            resources: HashMap::new(),
            bind_generates_resource,
        }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.resources.contains_key(&client_id)
    }

    /// Create a fresh resource under `client_id`.
    pub fn create(
        &mut self,
        client_id: ClientId,
        build: impl FnOnce(ServiceId) -> T,
    ) -> Result<ResourceRef<T>, ResourceError> {
        if client_id == INVALID_ID {
            return Err(ResourceError::ReservedId);
        }
        if self.ids.in_use(client_id) {
            return Err(ResourceError::IdInUse(client_id));
        }
        let resource = ResourceRef::create(&self.pool, build)?;
        self.ids.mark_as_used(client_id);
        self.resources.insert(client_id, resource.clone());
        Ok(resource)
    }

    /// Create one resource per id, all or nothing.
    pub fn gen(&mut self, client_ids: &[ClientId], mut build: impl FnMut(ServiceId) -> T) -> Result<(), ResourceError> {
        let mut seen = IdAllocator::new();
        for &id in client_ids {
            if id == INVALID_ID {
                return Err(ResourceError::ReservedId);
            }
            if self.ids.in_use(id) || !seen.mark_as_used(id) {
                return Err(ResourceError::IdInUse(id));
            }
        }
        let mut created = Vec::with_capacity(client_ids.len());
        for &id in client_ids {
            match self.create(id, &mut build) {
                Ok(r) => created.push((id, r)),
                Err(err) => {
                    for (id, _) in &created {
                        self.delete(*id);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ResourceRef<T>> {
        self.resources.get(&client_id)
    }

    /// Resolve `client_id` for a bind.
    ///
    /// Id 0 resolves to `None` (the caller's default). An id with no resource is created on the
    /// spot when `bind_generates_resource` is set, otherwise it is an error.
    pub fn bind_lookup(
        &mut self,
        client_id: ClientId,
        build: impl FnOnce(ServiceId) -> T,
    ) -> Result<Option<ResourceRef<T>>, ResourceError> {
        if client_id == INVALID_ID {
            return Ok(None);
        }
        if let Some(r) = self.resources.get(&client_id) {
            return Ok(Some(r.clone()));
        }
        if !self.bind_generates_resource {
            return Err(ResourceError::NotGenerated(client_id));
        }
        self.create(client_id, build).map(Some)
    }

    /// Remove the mapping for `client_id`, returning the reference it held.
    pub fn delete(&mut self, client_id: ClientId) -> Option<ResourceRef<T>> {
        let removed = self.resources.remove(&client_id)?;
        self.ids.free_id(client_id);
        Some(removed)
    }

    /// Point `client_id` at a different resource. The previous reference, if any, is returned.
    pub fn replace(&mut self, client_id: ClientId, resource: ResourceRef<T>) -> Option<ResourceRef<T>> {
        self.ids.mark_as_used(client_id);
        self.resources.insert(client_id, resource)
    }

    /// Reverse lookup: the client id under which this manager maps `resource`.
    pub fn client_id_of(&self, resource: &ResourceRef<T>) -> Option<ClientId> {
        self.resources
            .iter()
            .find(|(_, r)| r.ptr_eq(resource))
            .map(|(&id, _)| id)
    }
}
