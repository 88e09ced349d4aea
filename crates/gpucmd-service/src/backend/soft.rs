use std::collections::{BTreeMap, HashMap, HashSet};

use super::{
    AllocParams, AttachTarget, Backend, BackendError, FenceStatus, FenceToken, FenceWait, Region, ResourceKind,
    ServiceId,
};

/// Fill byte for storage allocated without data. Anything reading it back was never cleared.
pub const GARBAGE_BYTE: u8 = 0xCD;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftBackendStats {
    pub creates: u64,
    pub deletes: u64,
    pub allocations: u64,
    pub writes: u64,
    pub reads: u64,
    pub draws: u64,
    pub fences: u64,
}

#[derive(Debug)]
struct SoftImage {
    width: u32,
    height: u32,
    bytes_per_pixel: u32,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct SoftObject {
    kind: Option<ResourceKind>,
    images: BTreeMap<(u32, u32), SoftImage>,
    linear: Vec<u8>,
    samples: u64,
    attachments: BTreeMap<u32, AttachTarget>,
}

impl SoftObject {
    fn bytes(&self) -> usize {
        self.linear.len() + self.images.values().map(|img| img.data.len()).sum::<usize>()
    }
}

/// Deterministic in-memory backend.
///
/// - New storage is filled with [`GARBAGE_BYTE`].
/// - An optional memory budget and a one-shot failure injector simulate exhaustion.
/// - Fences signal after `fence_latency` polls; a blocking wait signals immediately.
/// - Draws add `count` samples to every active query.
#[derive(Debug)]
pub struct SoftBackend {
    objects: HashMap<ServiceId, SoftObject>,
    next_id: ServiceId,
    bindings: HashMap<(ResourceKind, u32), ServiceId>,
    active_queries: HashSet<ServiceId>,
    memory_used: usize,
    memory_budget: Option<usize>,
    fail_next_allocations: u32,
    fence_latency: u32,
    next_fence: u64,
    fences: HashMap<u64, u32>,
    lost: bool,
    stats: SoftBackendStats,
}

impl Default for SoftBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftBackend {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_id: 1,
            bindings: HashMap::new(),
            active_queries: HashSet::new(),
            memory_used: 0,
            memory_budget: None,
            fail_next_allocations: 0,
            fence_latency: 1,
            next_fence: 1,
            fences: HashMap::new(),
            lost: false,
            stats: SoftBackendStats::default(),
        }
    }

    pub fn set_memory_budget(&mut self, budget: Option<usize>) {
        self.memory_budget = budget;
    }

    /// Make the next `count` allocations fail with `OutOfMemory`.
    pub fn fail_next_allocations(&mut self, count: u32) {
        self.fail_next_allocations = count;
    }

    /// Number of polls a fence stays pending. Zero signals on the first poll.
    pub fn set_fence_latency(&mut self, polls: u32) {
        self.fence_latency = polls;
    }

    pub fn lose_context(&mut self) {
        self.lost = true;
    }

    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    pub fn live_objects(&self, kind: ResourceKind) -> usize {
        self.objects.values().filter(|o| o.kind == Some(kind)).count()
    }

    pub fn is_live(&self, id: ServiceId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn bound(&self, kind: ResourceKind, target: u32) -> Option<ServiceId> {
        self.bindings.get(&(kind, target)).copied()
    }

    pub fn attachment(&self, framebuffer: ServiceId, attachment: u32) -> Option<AttachTarget> {
        self.objects
            .get(&framebuffer)
            .and_then(|fb| fb.attachments.get(&attachment).copied())
    }

    pub fn image_size(&self, id: ServiceId, face: u32, level: u32) -> Option<(u32, u32)> {
        let img = self.objects.get(&id)?.images.get(&(face, level))?;
        Some((img.width, img.height))
    }

    pub fn stats(&self) -> SoftBackendStats {
        self.stats
    }

    fn object(&self, kind: ResourceKind, id: ServiceId) -> Result<&SoftObject, BackendError> {
        self.objects
            .get(&id)
            .filter(|o| o.kind == Some(kind))
            .ok_or(BackendError::InvalidResource { kind, id })
    }

    fn object_mut(&mut self, kind: ResourceKind, id: ServiceId) -> Result<&mut SoftObject, BackendError> {
        self.objects
            .get_mut(&id)
            .filter(|o| o.kind == Some(kind))
            .ok_or(BackendError::InvalidResource { kind, id })
    }

    fn check_lost(&self) -> Result<(), BackendError> {
        if self.lost {
            Err(BackendError::ContextLost)
        } else {
            Ok(())
        }
    }
}

fn image_span(img: &SoftImage, x: u32, y: u32, width: u32, height: u32) -> Result<(), BackendError> {
    let x_end = x.checked_add(width).ok_or(BackendError::OutOfBounds)?;
    let y_end = y.checked_add(height).ok_or(BackendError::OutOfBounds)?;
    if x_end > img.width || y_end > img.height {
        return Err(BackendError::OutOfBounds);
    }
    Ok(())
}

impl Backend for SoftBackend {
    fn create(&mut self, kind: ResourceKind) -> Result<ServiceId, BackendError> {
        self.check_lost()?;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.objects.insert(
            id,
            SoftObject {
                kind: Some(kind),
                ..SoftObject::default()
            },
        );
        self.stats.creates += 1;
        Ok(id)
    }

    fn delete(&mut self, kind: ResourceKind, id: ServiceId) -> Result<(), BackendError> {
        self.check_lost()?;
        self.object(kind, id)?;
        if let Some(obj) = self.objects.remove(&id) {
            self.memory_used -= obj.bytes();
        }
        self.bindings.retain(|_, bound| *bound != id);
        self.active_queries.remove(&id);
        self.stats.deletes += 1;
        Ok(())
    }

    fn bind(&mut self, kind: ResourceKind, target: u32, id: Option<ServiceId>) -> Result<(), BackendError> {
        self.check_lost()?;
        if let Some(id) = id {
            self.object(kind, id)?;
        }
        let previous = match id {
            Some(id) => self.bindings.insert((kind, target), id),
            None => self.bindings.remove(&(kind, target)),
        };
        if kind == ResourceKind::Query {
            if let Some(prev) = previous {
                self.active_queries.remove(&prev);
            }
            if let Some(id) = id {
                self.object_mut(kind, id)?.samples = 0;
                self.active_queries.insert(id);
            }
        }
        Ok(())
    }

    fn allocate(&mut self, kind: ResourceKind, id: ServiceId, params: &AllocParams) -> Result<(), BackendError> {
        self.check_lost()?;
        let requested = params.byte_size();
        let old = {
            let obj = self.object(kind, id)?;
            match *params {
                AllocParams::Image { face, level, .. } => {
                    obj.images.get(&(face, level)).map_or(0, |img| img.data.len())
                }
                AllocParams::Linear { .. } => obj.linear.len(),
            }
        };
        let available = self
            .memory_budget
            .map_or(usize::MAX, |budget| budget.saturating_sub(self.memory_used - old));
        if self.fail_next_allocations > 0 {
            self.fail_next_allocations -= 1;
            return Err(BackendError::OutOfMemory { requested, available });
        }
        if requested > available {
            return Err(BackendError::OutOfMemory { requested, available });
        }

        let obj = self.object_mut(kind, id)?;
        match *params {
            AllocParams::Image {
                face,
                level,
                width,
                height,
                bytes_per_pixel,
            } => {
                obj.images.insert(
                    (face, level),
                    SoftImage {
                        width,
                        height,
                        bytes_per_pixel,
                        data: vec![GARBAGE_BYTE; requested],
                    },
                );
            }
            AllocParams::Linear { .. } => obj.linear = vec![GARBAGE_BYTE; requested],
        }
        self.memory_used = self.memory_used - old + requested;
        self.stats.allocations += 1;
        Ok(())
    }

    fn write(&mut self, kind: ResourceKind, id: ServiceId, region: &Region, data: &[u8]) -> Result<(), BackendError> {
        self.check_lost()?;
        let obj = self.object_mut(kind, id)?;
        match *region {
            Region::Image {
                face,
                level,
                x,
                y,
                width,
                height,
            } => {
                let img = obj.images.get_mut(&(face, level)).ok_or(BackendError::OutOfBounds)?;
                image_span(img, x, y, width, height)?;
                let bpp = img.bytes_per_pixel as usize;
                let row_len = width as usize * bpp;
                if data.len() != row_len * height as usize {
                    return Err(BackendError::OutOfBounds);
                }
                for (row, src) in data.chunks_exact(row_len.max(1)).enumerate().take(height as usize) {
                    let start = ((y as usize + row) * img.width as usize + x as usize) * bpp;
                    img.data[start..start + row_len].copy_from_slice(src);
                }
            }
            Region::Linear { offset, len } => {
                let start = offset as usize;
                let end = start + len as usize;
                if end > obj.linear.len() || data.len() != len as usize {
                    return Err(BackendError::OutOfBounds);
                }
                obj.linear[start..end].copy_from_slice(data);
            }
        }
        self.stats.writes += 1;
        Ok(())
    }

    fn read(&self, kind: ResourceKind, id: ServiceId, region: &Region) -> Result<Vec<u8>, BackendError> {
        self.check_lost()?;
        let obj = self.object(kind, id)?;
        match *region {
            Region::Image {
                face,
                level,
                x,
                y,
                width,
                height,
            } => {
                let img = obj.images.get(&(face, level)).ok_or(BackendError::OutOfBounds)?;
                image_span(img, x, y, width, height)?;
                let bpp = img.bytes_per_pixel as usize;
                let row_len = width as usize * bpp;
                let mut out = Vec::with_capacity(row_len * height as usize);
                for row in 0..height as usize {
                    let start = ((y as usize + row) * img.width as usize + x as usize) * bpp;
                    out.extend_from_slice(&img.data[start..start + row_len]);
                }
                Ok(out)
            }
            Region::Linear { offset, len } if kind == ResourceKind::Query => {
                // Query objects expose their sample counter as a little-endian u64.
                let bytes = obj.samples.to_le_bytes();
                let start = offset as usize;
                bytes
                    .get(start..start + len as usize)
                    .map(<[u8]>::to_vec)
                    .ok_or(BackendError::OutOfBounds)
            }
            Region::Linear { offset, len } => {
                let start = offset as usize;
                obj.linear
                    .get(start..start + len as usize)
                    .map(<[u8]>::to_vec)
                    .ok_or(BackendError::OutOfBounds)
            }
        }
    }

    fn attach(
        &mut self,
        framebuffer: ServiceId,
        attachment: u32,
        target: Option<AttachTarget>,
    ) -> Result<(), BackendError> {
        self.check_lost()?;
        if let Some(target) = target {
            self.object(target.kind, target.id)?;
        }
        let fb = self.object_mut(ResourceKind::Framebuffer, framebuffer)?;
        match target {
            Some(target) => fb.attachments.insert(attachment, target),
            None => fb.attachments.remove(&attachment),
        };
        Ok(())
    }

    fn draw(&mut self, _mode: u32, _first: u32, count: u32) -> Result<(), BackendError> {
        self.check_lost()?;
        for id in &self.active_queries {
            if let Some(obj) = self.objects.get_mut(id) {
                obj.samples += u64::from(count);
            }
        }
        self.stats.draws += 1;
        Ok(())
    }

    fn fence(&mut self) -> FenceToken {
        let token = self.next_fence;
        self.next_fence += 1;
        self.fences.insert(token, self.fence_latency);
        self.stats.fences += 1;
        FenceToken(token)
    }

    fn wait_fence(&mut self, token: FenceToken, wait: FenceWait) -> FenceStatus {
        // A lost device never completes work, but nothing should hang on it either.
        if self.lost {
            return FenceStatus::Signaled;
        }
        let Some(remaining) = self.fences.get_mut(&token.0) else {
            return FenceStatus::Signaled;
        };
        if wait == FenceWait::Block || *remaining == 0 {
            self.fences.remove(&token.0);
            return FenceStatus::Signaled;
        }
        *remaining -= 1;
        FenceStatus::Pending
    }

    fn context_lost(&self) -> bool {
        self.lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(width: u32, height: u32) -> AllocParams {
        AllocParams::Image {
            face: 0,
            level: 0,
            width,
            height,
            bytes_per_pixel: 4,
        }
    }

    #[test]
    fn new_storage_is_garbage_until_written() {
        let mut b = SoftBackend::new();
        let id = b.create(ResourceKind::Texture).unwrap();
        b.allocate(ResourceKind::Texture, id, &image(2, 2)).unwrap();

        let full = Region::Image {
            face: 0,
            level: 0,
            x: 0,
            y: 0,
            width: 2,
            height: 2,
        };
        assert!(b.read(ResourceKind::Texture, id, &full).unwrap().iter().all(|&v| v == GARBAGE_BYTE));

        let px = Region::Image {
            face: 0,
            level: 0,
            x: 1,
            y: 1,
            width: 1,
            height: 1,
        };
        b.write(ResourceKind::Texture, id, &px, &[1, 2, 3, 4]).unwrap();
        let data = b.read(ResourceKind::Texture, id, &full).unwrap();
        assert_eq!(&data[12..16], &[1, 2, 3, 4]);
        assert_eq!(data[0], GARBAGE_BYTE);
    }

    #[test]
    fn failed_allocation_keeps_previous_storage() {
        let mut b = SoftBackend::new();
        let id = b.create(ResourceKind::Texture).unwrap();
        b.allocate(ResourceKind::Texture, id, &image(2, 2)).unwrap();
        b.set_memory_budget(Some(32));

        let err = b.allocate(ResourceKind::Texture, id, &image(4, 4)).unwrap_err();
        assert!(matches!(err, BackendError::OutOfMemory { requested: 64, .. }));
        assert_eq!(b.image_size(id, 0, 0), Some((2, 2)));
        assert_eq!(b.memory_used(), 16);

        b.fail_next_allocations(1);
        assert!(b.allocate(ResourceKind::Texture, id, &image(1, 1)).is_err());
        b.allocate(ResourceKind::Texture, id, &image(1, 1)).unwrap();
        assert_eq!(b.memory_used(), 4);
    }

    #[test]
    fn fences_signal_after_latency_polls() {
        let mut b = SoftBackend::new();
        b.set_fence_latency(2);
        let f = b.fence();
        assert_eq!(b.wait_fence(f, FenceWait::Poll), FenceStatus::Pending);
        assert_eq!(b.wait_fence(f, FenceWait::Poll), FenceStatus::Pending);
        assert_eq!(b.wait_fence(f, FenceWait::Poll), FenceStatus::Signaled);

        let f = b.fence();
        assert_eq!(b.wait_fence(f, FenceWait::Block), FenceStatus::Signaled);
    }

    #[test]
    fn draws_count_samples_for_active_queries() {
        let mut b = SoftBackend::new();
        let q = b.create(ResourceKind::Query).unwrap();
        b.draw(4, 0, 3).unwrap();
        b.bind(ResourceKind::Query, 1, Some(q)).unwrap();
        b.draw(4, 0, 6).unwrap();
        b.bind(ResourceKind::Query, 1, None).unwrap();
        b.draw(4, 0, 9).unwrap();

        let bytes = b
            .read(ResourceKind::Query, q, &Region::Linear { offset: 0, len: 8 })
            .unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 6);
    }

    #[test]
    fn lost_context_rejects_calls() {
        let mut b = SoftBackend::new();
        b.lose_context();
        assert!(b.context_lost());
        assert_eq!(b.create(ResourceKind::Buffer), Err(BackendError::ContextLost));
    }
}
