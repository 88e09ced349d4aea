use crate::buffer::{Buffer, BufferTarget};
use crate::error::GlError;
use crate::framebuffer::{ClearValues, Framebuffer, Renderbuffer};
use crate::program::Program;
use crate::resource::{Resource, ResourceRef};
use crate::resource_manager::ClientId;
use crate::texture::{Texture, TextureTarget};

/// One binding point.
#[derive(Debug)]
pub(crate) enum Slot<T: Resource> {
    /// Nothing bound, or the target's default object.
    None,
    Bound(ResourceRef<T>),
    /// A bind named an id that was never generated. Every use is `GL_INVALID_OPERATION`.
    Invalid(ClientId),
}

impl<T: Resource> Default for Slot<T> {
    fn default() -> Self {
        Self::None
    }
}

impl<T: Resource> Slot<T> {
    pub fn bound(&self) -> Option<&ResourceRef<T>> {
        match self {
            Self::Bound(r) => Some(r),
            _ => None,
        }
    }

    /// The bound object, `Ok(None)` for the default, or an error for an invalid binding.
    pub fn resolve(&self) -> Result<Option<&ResourceRef<T>>, GlError> {
        match self {
            Self::None => Ok(None),
            Self::Bound(r) => Ok(Some(r)),
            Self::Invalid(_) => Err(GlError::InvalidOperation),
        }
    }

    pub fn holds(&self, resource: &ResourceRef<T>) -> bool {
        self.bound().is_some_and(|r| r.ptr_eq(resource))
    }

    /// Replace the binding, returning the previous one for the caller to drop.
    pub fn replace(&mut self, slot: Slot<T>) -> Slot<T> {
        std::mem::replace(self, slot)
    }
}

#[derive(Debug, Default)]
pub(crate) struct TextureUnit {
    bindings: [Slot<Texture>; 4],
}

impl TextureUnit {
    const fn index(target: TextureTarget) -> usize {
        match target {
            TextureTarget::Texture2D => 0,
            TextureTarget::CubeMap => 1,
            TextureTarget::External => 2,
            TextureTarget::Rectangle => 3,
        }
    }

    pub fn get(&self, target: TextureTarget) -> &Slot<Texture> {
        &self.bindings[Self::index(target)]
    }

    pub fn get_mut(&mut self, target: TextureTarget) -> &mut Slot<Texture> {
        &mut self.bindings[Self::index(target)]
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut Slot<Texture>> {
        self.bindings.iter_mut()
    }

    pub fn bound(&self) -> impl Iterator<Item = &ResourceRef<Texture>> {
        self.bindings.iter().filter_map(Slot::bound)
    }
}

/// Per-context binding state.
#[derive(Debug)]
pub(crate) struct ContextState {
    pub active_unit: usize,
    pub units: Vec<TextureUnit>,
    pub array_buffer: Slot<Buffer>,
    pub element_array_buffer: Slot<Buffer>,
    pub framebuffer: Slot<Framebuffer>,
    pub renderbuffer: Slot<Renderbuffer>,
    pub program: Option<ResourceRef<Program>>,
    pub clear: ClearValues,
}

impl ContextState {
    pub fn new(texture_units: u32) -> Self {
        Self {
            active_unit: 0,
            units: (0..texture_units).map(|_| TextureUnit::default()).collect(),
            array_buffer: Slot::None,
            element_array_buffer: Slot::None,
            framebuffer: Slot::None,
            renderbuffer: Slot::None,
            program: None,
            clear: ClearValues::default(),
        }
    }

    pub fn unit(&self) -> &TextureUnit {
        &self.units[self.active_unit]
    }

    pub fn unit_mut(&mut self) -> &mut TextureUnit {
        &mut self.units[self.active_unit]
    }

    pub fn buffer(&self, target: BufferTarget) -> &Slot<Buffer> {
        match target {
            BufferTarget::Array => &self.array_buffer,
            BufferTarget::ElementArray => &self.element_array_buffer,
        }
    }

    pub fn buffer_mut(&mut self, target: BufferTarget) -> &mut Slot<Buffer> {
        match target {
            BufferTarget::Array => &mut self.array_buffer,
            BufferTarget::ElementArray => &mut self.element_array_buffer,
        }
    }

    /// Unbind `texture` from every unit. Returns the released bindings.
    pub fn unbind_texture(&mut self, texture: &ResourceRef<Texture>) -> Vec<Slot<Texture>> {
        self.units
            .iter_mut()
            .flat_map(TextureUnit::slots_mut)
            .filter(|slot| slot.holds(texture))
            .map(|slot| slot.replace(Slot::None))
            .collect()
    }

    /// Every texture bound on any unit.
    pub fn bound_textures(&self) -> Vec<ResourceRef<Texture>> {
        self.units.iter().flat_map(TextureUnit::bound).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::backend::{SharedBackend, SoftBackend};
    use crate::resource::ResourcePool;

    #[test]
    fn unbinding_a_texture_clears_every_unit() {
        let backend: SharedBackend = Rc::new(RefCell::new(SoftBackend::new()));
        let pool = ResourcePool::new_shared(backend);
        let t = ResourceRef::create(&pool, Texture::new).unwrap();
        let mut state = ContextState::new(4);
        *state.unit_mut().get_mut(TextureTarget::Texture2D) = Slot::Bound(t.clone());
        state.active_unit = 3;
        *state.unit_mut().get_mut(TextureTarget::CubeMap) = Slot::Bound(t.clone());
        assert_eq!(state.bound_textures().len(), 2);

        let released = state.unbind_texture(&t);
        assert_eq!(released.len(), 2);
        drop(released);
        assert_eq!(t.refs(), 1);
        assert!(state.bound_textures().is_empty());
        assert!(matches!(state.units[0].get(TextureTarget::Texture2D), Slot::None));
    }

    #[test]
    fn invalid_slots_fail_on_use() {
        let slot: Slot<Texture> = Slot::Invalid(7);
        assert_eq!(slot.resolve().unwrap_err(), GlError::InvalidOperation);
        assert!(Slot::<Texture>::None.resolve().unwrap().is_none());
    }
}
