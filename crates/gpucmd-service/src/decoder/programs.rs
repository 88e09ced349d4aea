use super::{CmdResult, GpuDecoder};
use crate::backend::ResourceKind;
use crate::error::GlError;
use crate::program::{Program, ShaderType};

impl GpuDecoder {
    pub(super) fn exec_create_shader(&mut self, ty: u32, client_id: u32) -> CmdResult {
        const FN: &str = "glCreateShader";
        let Some(ty) = ShaderType::from_gl(ty) else {
            return self.fail(GlError::InvalidEnum, FN, "invalid shader type");
        };
        let result = self.group.borrow_mut().programs.create_shader(client_id, ty);
        match result {
            Ok(_) => Ok(()),
            Err(err) => self.resource_failed(FN, err),
        }
    }

    pub(super) fn exec_create_program(&mut self, client_id: u32) -> CmdResult {
        let result = self.group.borrow_mut().programs.create_program(client_id);
        match result {
            Ok(_) => Ok(()),
            Err(err) => self.resource_failed("glCreateProgram", err),
        }
    }

    pub(super) fn exec_delete_shader(&mut self, id: u32) -> CmdResult {
        const FN: &str = "glDeleteShader";
        if id == 0 {
            return Ok(());
        }
        let deleted = {
            let mut group = self.group.borrow_mut();
            if group.programs.program(id).is_some() {
                Err(GlError::InvalidOperation)
            } else {
                group.programs.delete_shader(id).ok_or(GlError::InvalidValue)
            }
        };
        match deleted {
            // Programs that have it attached keep the shader object alive.
            Ok(shader) => {
                drop(shader);
                Ok(())
            }
            Err(err) => self.fail(err, FN, "not a shader"),
        }
    }

    pub(super) fn exec_delete_program(&mut self, id: u32) -> CmdResult {
        const FN: &str = "glDeleteProgram";
        if id == 0 {
            return Ok(());
        }
        let deleted = {
            let mut group = self.group.borrow_mut();
            if group.programs.is_shader(id) {
                Err(GlError::InvalidOperation)
            } else {
                group.programs.delete_program(id).ok_or(GlError::InvalidValue)
            }
        };
        match deleted {
            // A program in use survives until it is replaced.
            Ok(program) => {
                drop(program);
                Ok(())
            }
            Err(err) => self.fail(err, FN, "not a program"),
        }
    }

    pub(super) fn exec_attach_shader(&mut self, program: u32, shader: u32) -> CmdResult {
        const FN: &str = "glAttachShader";
        let (program, shader) = {
            let group = self.group.borrow();
            (group.programs.program(program).cloned(), group.programs.shader(shader).cloned())
        };
        let (Some(program), Some(shader)) = (program, shader) else {
            return self.fail(GlError::InvalidValue, FN, "unknown program or shader");
        };
        match program.with_mut(|p| p.attach(shader)) {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err, FN, "stage already has a shader"),
        }
    }

    pub(super) fn exec_link_program(&mut self, program: u32) -> CmdResult {
        let program = self.group.borrow().programs.program(program).cloned();
        let Some(program) = program else {
            return self.fail(GlError::InvalidValue, "glLinkProgram", "unknown program");
        };
        // A failed link is reported through the link status, not as an error.
        program.with_mut(Program::link);
        Ok(())
    }

    pub(super) fn exec_use_program(&mut self, id: u32) -> CmdResult {
        const FN: &str = "glUseProgram";
        let program = if id == 0 {
            None
        } else {
            let program = self.group.borrow().programs.program(id).cloned();
            let Some(program) = program else {
                return self.fail(GlError::InvalidValue, FN, "unknown program");
            };
            if !program.with(Program::is_linked) {
                return self.fail(GlError::InvalidOperation, FN, "program is not linked");
            }
            Some(program)
        };
        let service_id = program.as_ref().map(|p| p.service_id());
        let result = self.backend.borrow_mut().bind(ResourceKind::Program, 0, service_id);
        if let Err(err) = result {
            return self.backend_failed(FN, err);
        }
        let old = std::mem::replace(&mut self.state.program, program);
        drop(old);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use gpucmd_protocol::{gl, CmdWriter, CommandStatus};

    use crate::backend::{ResourceKind, SoftBackend};
    use crate::config::ServiceConfig;
    use crate::decoder::GpuDecoder;
    use crate::device::{ContextGroup, GpuDevice};

    fn decoder() -> (Rc<RefCell<SoftBackend>>, GpuDecoder) {
        let soft = Rc::new(RefCell::new(SoftBackend::new()));
        let device = GpuDevice::new(soft.clone());
        let group = ContextGroup::new(&device, ServiceConfig::default()).unwrap();
        (soft, GpuDecoder::new(&group))
    }

    #[test]
    fn only_linked_programs_can_be_used() {
        let (_, mut dec) = decoder();
        let mut w = CmdWriter::new();
        w.create_program(1);
        w.create_shader(gl::VERTEX_SHADER, 2);
        w.create_shader(gl::FRAGMENT_SHADER, 3);
        w.attach_shader(1, 2);
        w.use_program(1);
        assert_eq!(dec.execute(w.as_words()).status, CommandStatus::NoError);
        assert_eq!(dec.get_error(), gl::INVALID_OPERATION);

        let mut w = CmdWriter::new();
        w.attach_shader(1, 3);
        w.link_program(1);
        w.use_program(1);
        dec.execute(w.as_words());
        assert_eq!(dec.get_error(), gl::NO_ERROR);
        assert!(dec.state.program.is_some());
    }

    #[test]
    fn reused_names_are_invalid_arguments() {
        let (_, mut dec) = decoder();
        let mut w = CmdWriter::new();
        w.create_program(1);
        w.create_shader(gl::VERTEX_SHADER, 1);
        let r = dec.execute(w.as_words());
        assert_eq!(r.status, CommandStatus::InvalidArguments);
        assert_eq!(r.commands_processed, 1);
    }

    #[test]
    fn program_in_use_outlives_its_name() {
        let (soft, mut dec) = decoder();
        let mut w = CmdWriter::new();
        w.create_program(1);
        w.create_shader(gl::VERTEX_SHADER, 2);
        w.create_shader(gl::FRAGMENT_SHADER, 3);
        w.attach_shader(1, 2);
        w.attach_shader(1, 3);
        w.link_program(1);
        w.use_program(1);
        w.delete_shader(2);
        w.delete_program(1);
        dec.execute(w.as_words());
        assert_eq!(dec.get_error(), gl::NO_ERROR);
        assert_eq!(soft.borrow().live_objects(ResourceKind::Program), 1);
        assert_eq!(soft.borrow().live_objects(ResourceKind::Shader), 2);

        let mut w = CmdWriter::new();
        w.use_program(0);
        dec.execute(w.as_words());
        assert_eq!(soft.borrow().live_objects(ResourceKind::Program), 0);
        assert_eq!(soft.borrow().live_objects(ResourceKind::Shader), 1);
    }
}
