use gpucmd_protocol::gl;

use crate::backend::{AllocParams, Backend, BackendError, Region, ResourceKind, ServiceId};
use crate::error::GlError;
use crate::resource::Resource;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferTarget {
    Array,
    ElementArray,
}

impl BufferTarget {
    pub fn from_gl(target: u32) -> Option<Self> {
        match target {
            gl::ARRAY_BUFFER => Some(Self::Array),
            gl::ELEMENT_ARRAY_BUFFER => Some(Self::ElementArray),
            _ => None,
        }
    }

    pub const fn gl_enum(self) -> u32 {
        match self {
            Self::Array => gl::ARRAY_BUFFER,
            Self::ElementArray => gl::ELEMENT_ARRAY_BUFFER,
        }
    }
}

pub fn valid_usage(usage: u32) -> bool {
    matches!(usage, gl::STREAM_DRAW | gl::STATIC_DRAW | gl::DYNAMIC_DRAW)
}

#[derive(Debug)]
pub struct Buffer {
    service_id: ServiceId,
    target: Option<BufferTarget>,
    size: u32,
    usage: u32,
}

impl Resource for Buffer {
    const KIND: ResourceKind = ResourceKind::Buffer;

    fn service_id(&self) -> ServiceId {
        self.service_id
    }
}

impl Buffer {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            target: None,
            size: 0,
            usage: gl::STATIC_DRAW,
        }
    }

    pub fn target(&self) -> Option<BufferTarget> {
        self.target
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn usage(&self) -> u32 {
        self.usage
    }

    /// Array and element-array data never share a buffer.
    pub fn set_target(&mut self, target: BufferTarget) -> Result<(), GlError> {
        match self.target {
            None => {
                self.target = Some(target);
                Ok(())
            }
            Some(t) if t == target => Ok(()),
            Some(_) => Err(GlError::InvalidOperation),
        }
    }

    /// Replace the data store. Without `data` the new store is zero-filled.
    ///
    /// A failed allocation leaves size, usage and contents as they were.
    pub fn set_data(
        &mut self,
        backend: &mut dyn Backend,
        size: u32,
        data: Option<&[u8]>,
        usage: u32,
    ) -> Result<(), BackendError> {
        backend.allocate(ResourceKind::Buffer, self.service_id, &AllocParams::Linear { size })?;
        self.size = size;
        self.usage = usage;
        let zeros;
        let contents = match data {
            Some(data) => data,
            None => {
                zeros = vec![0; size as usize];
                &zeros
            }
        };
        backend.write(
            ResourceKind::Buffer,
            self.service_id,
            &Region::Linear { offset: 0, len: size },
            contents,
        )
    }

    pub fn set_sub_data(&mut self, backend: &mut dyn Backend, offset: u32, data: &[u8]) -> Result<(), GlError> {
        let len = u32::try_from(data.len()).map_err(|_| GlError::InvalidValue)?;
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(GlError::InvalidValue);
        }
        backend
            .write(ResourceKind::Buffer, self.service_id, &Region::Linear { offset, len }, data)
            .map_err(|_| GlError::InvalidOperation)
    }
}
