//! Shaders and programs.
//!
//! Programs hold counted references to their attached shaders, so deleting an attached shader only
//! removes its name. Shader and program names come from one namespace.

use gpucmd_protocol::gl;

use crate::backend::{ResourceKind, ServiceId};
use crate::error::GlError;
use crate::resource::{Resource, ResourceRef, SharedPool};
use crate::resource_manager::{ClientId, ResourceError, ResourceManager};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderType {
    Vertex,
    Fragment,
}

impl ShaderType {
    pub fn from_gl(ty: u32) -> Option<Self> {
        match ty {
            gl::VERTEX_SHADER => Some(Self::Vertex),
            gl::FRAGMENT_SHADER => Some(Self::Fragment),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Shader {
    service_id: ServiceId,
    ty: ShaderType,
}

impl Resource for Shader {
    const KIND: ResourceKind = ResourceKind::Shader;

    fn service_id(&self) -> ServiceId {
        self.service_id
    }
}

impl Shader {
    pub fn new(service_id: ServiceId, ty: ShaderType) -> Self {
        Self { service_id, ty }
    }

    pub fn ty(&self) -> ShaderType {
        self.ty
    }
}

#[derive(Debug)]
pub struct Program {
    service_id: ServiceId,
    vertex: Option<ResourceRef<Shader>>,
    fragment: Option<ResourceRef<Shader>>,
    linked: bool,
}

impl Resource for Program {
    const KIND: ResourceKind = ResourceKind::Program;

    fn service_id(&self) -> ServiceId {
        self.service_id
    }
}

impl Program {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            vertex: None,
            fragment: None,
            linked: false,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// One shader per stage.
    pub fn attach(&mut self, shader: ResourceRef<Shader>) -> Result<(), GlError> {
        let slot = match shader.with(Shader::ty) {
            ShaderType::Vertex => &mut self.vertex,
            ShaderType::Fragment => &mut self.fragment,
        };
        if slot.is_some() {
            return Err(GlError::InvalidOperation);
        }
        *slot = Some(shader);
        Ok(())
    }

    pub fn link(&mut self) -> bool {
        self.linked = self.vertex.is_some() && self.fragment.is_some();
        self.linked
    }
}

pub struct ProgramManager {
    shaders: ResourceManager<Shader>,
    programs: ResourceManager<Program>,
}

impl ProgramManager {
    pub fn new(shaders: SharedPool<Shader>, programs: SharedPool<Program>) -> Self {
        // Shaders and programs are only ever created explicitly.
        Self {
            shaders: ResourceManager::new(shaders, false),
            programs: ResourceManager::new(programs, false),
        }
    }

    fn check_unused(&self, client_id: ClientId) -> Result<(), ResourceError> {
        if self.shaders.contains(client_id) || self.programs.contains(client_id) {
            return Err(ResourceError::IdInUse(client_id));
        }
        Ok(())
    }

    pub fn create_shader(&mut self, client_id: ClientId, ty: ShaderType) -> Result<ResourceRef<Shader>, ResourceError> {
        self.check_unused(client_id)?;
        self.shaders.create(client_id, |sid| Shader::new(sid, ty))
    }

    pub fn create_program(&mut self, client_id: ClientId) -> Result<ResourceRef<Program>, ResourceError> {
        self.check_unused(client_id)?;
        self.programs.create(client_id, Program::new)
    }

    pub fn shader(&self, client_id: ClientId) -> Option<&ResourceRef<Shader>> {
        self.shaders.get(client_id)
    }

    pub fn program(&self, client_id: ClientId) -> Option<&ResourceRef<Program>> {
        self.programs.get(client_id)
    }

    pub fn delete_shader(&mut self, client_id: ClientId) -> Option<ResourceRef<Shader>> {
        self.shaders.delete(client_id)
    }

    pub fn delete_program(&mut self, client_id: ClientId) -> Option<ResourceRef<Program>> {
        self.programs.delete(client_id)
    }

    pub fn is_shader(&self, client_id: ClientId) -> bool {
        self.shaders.contains(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::backend::{SharedBackend, SoftBackend};
    use crate::resource::ResourcePool;

    fn manager() -> (Rc<RefCell<SoftBackend>>, ProgramManager) {
        let soft = Rc::new(RefCell::new(SoftBackend::new()));
        let backend: SharedBackend = soft.clone();
        let m = ProgramManager::new(ResourcePool::new_shared(backend.clone()), ResourcePool::new_shared(backend));
        (soft, m)
    }

    #[test]
    fn shaders_and_programs_share_names() {
        let (_, mut m) = manager();
        m.create_shader(1, ShaderType::Vertex).unwrap();
        assert_eq!(m.create_program(1).unwrap_err(), ResourceError::IdInUse(1));
        m.create_program(2).unwrap();
        assert_eq!(
            m.create_shader(2, ShaderType::Fragment).unwrap_err(),
            ResourceError::IdInUse(2)
        );
    }

    #[test]
    fn attached_shader_outlives_its_name() {
        let (soft, mut m) = manager();
        let vs = m.create_shader(1, ShaderType::Vertex).unwrap();
        let fs = m.create_shader(2, ShaderType::Fragment).unwrap();
        let program = m.create_program(3).unwrap();
        let vs_sid = vs.service_id();

        program.with_mut(|p| p.attach(vs)).unwrap();
        assert!(!program.with_mut(Program::link));
        program.with_mut(|p| p.attach(fs)).unwrap();
        assert!(program.with_mut(Program::link));

        let dup = m.create_shader(4, ShaderType::Vertex).unwrap();
        assert_eq!(program.with_mut(|p| p.attach(dup)), Err(GlError::InvalidOperation));

        drop(m.delete_shader(1));
        assert!(!m.is_shader(1));
        assert!(soft.borrow().is_live(vs_sid));

        drop(m.delete_program(3));
        drop(program);
        assert!(!soft.borrow().is_live(vs_sid));
    }
}
