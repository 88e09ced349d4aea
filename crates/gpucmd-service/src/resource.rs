//! Reference-counted backend resources.
//!
//! Resources of one type live in a [`ResourcePool`], an arena keyed by generation-checked
//! [`ResourceKey`]s. A [`ResourceRef`] is one counted reference; the resource (and its backend
//! object) is destroyed exactly when the last ref drops. Anything that only needs to *find* a
//! resource (mailboxes, in-flight transfers) holds a [`WeakResource`] or a bare key, so a
//! destroyed resource resolves to "not found" rather than dangling.
//!
//! Interested parties subscribe with [`ResourceRef::observe`] and are told the key after the
//! resource is gone.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use slotmap::{new_key_type, SlotMap};
use tracing::warn;

use crate::backend::{BackendError, ResourceKind, ServiceId, SharedBackend};

new_key_type! {
    pub struct ResourceKey;
}

pub trait Resource: Sized + 'static {
    const KIND: ResourceKind;

    fn service_id(&self) -> ServiceId;
}

pub type Observer = Rc<dyn Fn(ResourceKey)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Entry<T> {
    resource: RefCell<T>,
    refs: Cell<usize>,
    observers: RefCell<Vec<(ObserverId, Observer)>>,
}

pub struct ResourcePool<T: Resource> {
    backend: SharedBackend,
    entries: SlotMap<ResourceKey, Entry<T>>,
    next_observer: Cell<u64>,
}

pub type SharedPool<T> = Rc<RefCell<ResourcePool<T>>>;

impl<T: Resource> ResourcePool<T> {
    pub fn new_shared(backend: SharedBackend) -> SharedPool<T> {
        Rc::new(RefCell::new(Self {
            backend,
            entries: SlotMap::with_key(),
            next_observer: Cell::new(0),
        }))
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: ResourceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn refs(&self, key: ResourceKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.refs.get())
    }

    /// Read a live resource without taking a reference.
    pub fn with<R>(&self, key: ResourceKey, f: impl FnOnce(&T) -> R) -> Option<R> {
        let entry = self.entries.get(key)?;
        let resource = entry.resource.borrow();
        Some(f(&resource))
    }

    pub fn with_mut<R>(&self, key: ResourceKey, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let entry = self.entries.get(key)?;
        let mut resource = entry.resource.borrow_mut();
        Some(f(&mut resource))
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.entries.keys().collect()
    }
}

impl<T: Resource> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("kind", &T::KIND)
            .field("live", &self.entries.len())
            .finish()
    }
}

/// One counted reference to a pooled resource.
pub struct ResourceRef<T: Resource> {
    pool: SharedPool<T>,
    key: ResourceKey,
}

impl<T: Resource> ResourceRef<T> {
    /// Create a backend object and wrap it in a new resource holding one reference.
    pub fn create(pool: &SharedPool<T>, build: impl FnOnce(ServiceId) -> T) -> Result<Self, BackendError> {
        let backend = Rc::clone(pool.borrow().backend());
        let service_id = backend.borrow_mut().create(T::KIND)?;
        Ok(Self::adopt(pool, build(service_id)))
    }

    /// Insert an already-created resource.
    pub fn adopt(pool: &SharedPool<T>, resource: T) -> Self {
        let key = pool.borrow_mut().entries.insert(Entry {
            resource: RefCell::new(resource),
            refs: Cell::new(1),
            observers: RefCell::new(Vec::new()),
        });
        Self {
            pool: Rc::clone(pool),
            key,
        }
    }

    pub fn key(&self) -> ResourceKey {
        self.key
    }

    pub fn pool(&self) -> &SharedPool<T> {
        &self.pool
    }

    pub fn belongs_to(&self, pool: &SharedPool<T>) -> bool {
        Rc::ptr_eq(&self.pool, pool)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.belongs_to(&other.pool) && self.key == other.key
    }

    pub fn refs(&self) -> usize {
        self.pool.borrow().refs(self.key)
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let pool = self.pool.borrow();
        // A live ref keeps its entry in the pool.
        let entry = &pool.entries[self.key];
        let resource = entry.resource.borrow();
        f(&resource)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let pool = self.pool.borrow();
        let entry = &pool.entries[self.key];
        let mut resource = entry.resource.borrow_mut();
        f(&mut resource)
    }

    pub fn service_id(&self) -> ServiceId {
        self.with(T::service_id)
    }

    pub fn downgrade(&self) -> WeakResource<T> {
        WeakResource {
            pool: Rc::downgrade(&self.pool),
            key: self.key,
        }
    }

    /// Get `observer(key)` called once the resource is destroyed.
    pub fn observe(&self, observer: Observer) -> ObserverId {
        let pool = self.pool.borrow();
        let id = ObserverId(pool.next_observer.get());
        pool.next_observer.set(id.0 + 1);
        pool.entries[self.key].observers.borrow_mut().push((id, observer));
        id
    }

    pub fn unobserve(&self, id: ObserverId) {
        let pool = self.pool.borrow();
        pool.entries[self.key]
            .observers
            .borrow_mut()
            .retain(|(oid, _)| *oid != id);
    }
}

impl<T: Resource> Clone for ResourceRef<T> {
    fn clone(&self) -> Self {
        {
            let pool = self.pool.borrow();
            let entry = &pool.entries[self.key];
            entry.refs.set(entry.refs.get() + 1);
        }
        Self {
            pool: Rc::clone(&self.pool),
            key: self.key,
        }
    }
}

impl<T: Resource> Drop for ResourceRef<T> {
    fn drop(&mut self) {
        let last = {
            let pool = self.pool.borrow();
            match pool.entries.get(self.key) {
                Some(entry) => {
                    let refs = entry.refs.get().saturating_sub(1);
                    entry.refs.set(refs);
                    refs == 0
                }
                None => false,
            }
        };
        if !last {
            return;
        }

        // Take the entry out before running any destruction side effects so they may freely
        // touch this pool again.
        let (entry, backend) = {
            let mut pool = self.pool.borrow_mut();
            let backend = Rc::clone(&pool.backend);
            (pool.entries.remove(self.key), backend)
        };
        let Some(entry) = entry else {
            return;
        };
        let resource = entry.resource.into_inner();
        let service_id = resource.service_id();
        {
            let mut backend = backend.borrow_mut();
            if !backend.context_lost() {
                if let Err(err) = backend.delete(T::KIND, service_id) {
                    warn!(kind = ?T::KIND, service_id, %err, "failed to delete backend resource");
                }
            }
        }
        // May release references this resource held on other pools.
        drop(resource);
        for (_, observer) in entry.observers.into_inner() {
            observer(self.key);
        }
    }
}

impl<T: Resource> fmt::Debug for ResourceRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRef")
            .field("kind", &T::KIND)
            .field("key", &self.key)
            .finish()
    }
}

/// Non-owning handle. Upgrading fails once the resource is destroyed.
pub struct WeakResource<T: Resource> {
    pool: Weak<RefCell<ResourcePool<T>>>,
    key: ResourceKey,
}

impl<T: Resource> WeakResource<T> {
    pub fn key(&self) -> ResourceKey {
        self.key
    }

    pub fn upgrade(&self) -> Option<ResourceRef<T>> {
        let pool = self.pool.upgrade()?;
        upgrade(&pool, self.key)
    }

    pub fn is_alive(&self) -> bool {
        self.pool
            .upgrade()
            .is_some_and(|pool| pool.borrow().contains(self.key))
    }
}

impl<T: Resource> Clone for WeakResource<T> {
    fn clone(&self) -> Self {
        Self {
            pool: Weak::clone(&self.pool),
            key: self.key,
        }
    }
}

impl<T: Resource> fmt::Debug for WeakResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakResource")
            .field("kind", &T::KIND)
            .field("key", &self.key)
            .finish()
    }
}

/// Take a new reference to the resource at `key`, if it is still alive.
pub fn upgrade<T: Resource>(pool: &SharedPool<T>, key: ResourceKey) -> Option<ResourceRef<T>> {
    {
        let guard = pool.borrow();
        let entry = guard.entries.get(key)?;
        entry.refs.set(entry.refs.get() + 1);
    }
    Some(ResourceRef {
        pool: Rc::clone(pool),
        key,
    })
}
