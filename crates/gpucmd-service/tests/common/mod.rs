//! Shared helpers for `gpucmd-service` integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use gpucmd_protocol::{gl, CmdWriter, CommandStatus};
use gpucmd_service::resource::ResourceRef;
use gpucmd_service::texture::Texture;
use gpucmd_service::{ContextGroup, GpuDecoder, GpuDevice, ServiceConfig, SharedMemory, SoftBackend};
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness. `RUST_LOG=gpucmd_service=debug` shows
/// rejected commands.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One decoder on its own device, plus a scratch shared-memory region.
pub struct Harness {
    pub soft: Rc<RefCell<SoftBackend>>,
    pub device: Rc<GpuDevice>,
    pub dec: GpuDecoder,
    pub scratch: Arc<SharedMemory>,
    pub scratch_id: u32,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        let soft = Rc::new(RefCell::new(SoftBackend::new()));
        let device = GpuDevice::new(soft.clone());
        Self::on_device(soft, device, config)
    }

    /// A decoder in a new context group on `device`, whose backend is `soft`.
    pub fn on_device(soft: Rc<RefCell<SoftBackend>>, device: Rc<GpuDevice>, config: ServiceConfig) -> Self {
        init_tracing();
        let group = ContextGroup::new(&device, config).expect("context group");
        let mut dec = GpuDecoder::new(&group);
        let scratch = SharedMemory::new(4096);
        let scratch_id = dec.shared_memory().register(scratch.clone());
        Self {
            soft,
            device,
            dec,
            scratch,
            scratch_id,
        }
    }

    /// Execute `w` and require every command to pass protocol validation.
    pub fn run(&mut self, w: &CmdWriter) {
        let result = self.dec.execute(w.as_words());
        assert_eq!(result.status, CommandStatus::NoError, "batch failed: {result:?}");
    }

    /// Drain the sticky error queue.
    pub fn errors(&mut self) -> Vec<u32> {
        std::iter::from_fn(|| Some(self.dec.get_error()))
            .take_while(|&e| e != gl::NO_ERROR)
            .collect()
    }

    pub fn texture(&self, client_id: u32) -> Option<ResourceRef<Texture>> {
        self.dec.group().borrow().textures().resources().get(client_id).cloned()
    }

    /// Read `width x height` RGBA pixels from the bound framebuffer via `ReadPixels`.
    pub fn read_pixels(&mut self, width: u32, height: u32) -> Vec<u8> {
        let len = (width * height * 4) as usize;
        self.scratch.write(0, &vec![0xAA; len]);
        let mut w = CmdWriter::new();
        w.read_pixels(0, 0, width, height, gl::RGBA, gl::UNSIGNED_BYTE, self.scratch_id, 0);
        self.run(&w);
        self.scratch.read(0, len).expect("scratch holds the pixels")
    }
}

/// Create texture `texture` as a `width x height` RGBA level and attach it to framebuffer `fb`.
pub fn render_to_texture(w: &mut CmdWriter, fb: u32, texture: u32, width: u32, height: u32) {
    w.gen_framebuffers(&[fb]);
    w.bind_framebuffer(gl::FRAMEBUFFER, fb);
    w.gen_textures(&[texture]);
    w.bind_texture(gl::TEXTURE_2D, texture);
    w.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, width, height, gl::RGBA, gl::UNSIGNED_BYTE, 0, 0);
    w.framebuffer_texture_2d(gl::FRAMEBUFFER, gl::COLOR_ATTACHMENT0, gl::TEXTURE_2D, texture, 0);
}

/// Program `program` built from fresh shaders `program + 1` and `program + 2`, linked and in use.
pub fn use_linked_program(w: &mut CmdWriter, program: u32) {
    w.create_program(program);
    w.create_shader(gl::VERTEX_SHADER, program + 1);
    w.create_shader(gl::FRAGMENT_SHADER, program + 2);
    w.attach_shader(program, program + 1);
    w.attach_shader(program, program + 2);
    w.link_program(program);
    w.use_program(program);
}
