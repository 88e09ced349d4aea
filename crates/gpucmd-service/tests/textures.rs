mod common;

use std::sync::Arc;

use common::{render_to_texture, use_linked_program, Harness};
use gpucmd_protocol::{gl, CmdWriter};
use gpucmd_service::backend::ResourceKind;
use gpucmd_service::image_manager::GpuImage;
use gpucmd_service::GpuDecoder;
use pretty_assertions::assert_eq;

const PIXELS: [u8; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

#[test]
fn uploaded_pixels_read_back() {
    let mut h = Harness::new();
    h.scratch.write(1024, &PIXELS);
    let mut w = CmdWriter::new();
    render_to_texture(&mut w, 1, 2, 2, 2);
    w.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, 2, 2, gl::RGBA, gl::UNSIGNED_BYTE, h.scratch_id, 1024);
    h.run(&w);
    assert_eq!(h.read_pixels(2, 2), PIXELS);
    assert_eq!(h.errors(), Vec::<u32>::new());
}

#[test]
fn partial_upload_clears_the_rest() {
    let mut h = Harness::new();
    h.scratch.write(1024, &[0xff; 4]);
    let mut w = CmdWriter::new();
    render_to_texture(&mut w, 1, 2, 2, 2);
    w.tex_sub_image_2d(gl::TEXTURE_2D, 0, 1, 1, 1, 1, gl::RGBA, gl::UNSIGNED_BYTE, h.scratch_id, 1024);
    h.run(&w);

    let mut expected = vec![0; 16];
    expected[12..].copy_from_slice(&[0xff; 4]);
    assert_eq!(h.read_pixels(2, 2), expected);
}

#[test]
fn sampling_forces_uncleared_levels_to_zero() {
    let mut h = Harness::new();
    let mut w = CmdWriter::new();
    render_to_texture(&mut w, 1, 2, 2, 2);
    w.clear_color([0.0, 0.0, 1.0, 1.0]);
    w.clear(gl::COLOR_BUFFER_BIT);
    w.gen_textures(&[3]);
    w.active_texture(gl::TEXTURE0 + 1);
    w.bind_texture(gl::TEXTURE_2D, 3);
    w.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, 4, 4, gl::RGBA, gl::UNSIGNED_BYTE, 0, 0);
    use_linked_program(&mut w, 10);
    w.draw_arrays(gl::TRIANGLES, 0, 3);
    h.run(&w);
    assert_eq!(h.errors(), Vec::<u32>::new());

    let sampled = h.texture(3).unwrap();
    assert!(!sampled.with(|t| t.has_uncleared_levels()));
    assert_eq!(h.soft.borrow().image_size(sampled.service_id(), 0, 0), Some((4, 4)));
    assert_eq!(h.read_pixels(2, 2), [0, 0, 255, 255].repeat(4));
}

#[test]
fn framebuffer_completeness() {
    let mut h = Harness::new();
    let status_at = 2048;
    let mut w = CmdWriter::new();
    w.gen_framebuffers(&[1]);
    w.bind_framebuffer(gl::FRAMEBUFFER, 1);
    w.check_framebuffer_status(gl::FRAMEBUFFER, h.scratch_id, status_at);
    h.run(&w);
    assert_eq!(h.scratch.read_u32(status_at as usize), Some(gl::FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT));

    let mut w = CmdWriter::new();
    w.gen_renderbuffers(&[2]);
    w.bind_renderbuffer(gl::RENDERBUFFER, 2);
    w.renderbuffer_storage(gl::RENDERBUFFER, gl::RGBA4, 8, 8);
    w.framebuffer_renderbuffer(gl::FRAMEBUFFER, gl::COLOR_ATTACHMENT0, gl::RENDERBUFFER, 2);
    w.check_framebuffer_status(gl::FRAMEBUFFER, h.scratch_id, status_at);
    h.run(&w);
    assert_eq!(h.scratch.read_u32(status_at as usize), Some(gl::FRAMEBUFFER_COMPLETE));

    // Drawing into an incomplete framebuffer is rejected.
    let mut w = CmdWriter::new();
    w.renderbuffer_storage(gl::RENDERBUFFER, gl::RGBA4, 0, 0);
    w.clear(gl::COLOR_BUFFER_BIT);
    h.run(&w);
    assert_eq!(h.errors(), vec![gl::INVALID_FRAMEBUFFER_OPERATION]);
}

#[test]
fn deleted_names_stay_alive_while_bound_elsewhere() {
    let mut a = Harness::new();
    let mut b = GpuDecoder::new(a.dec.group());

    let mut w = CmdWriter::new();
    w.gen_textures(&[1]);
    w.bind_texture(gl::TEXTURE_2D, 1);
    a.run(&w);
    let sid = a.texture(1).unwrap().service_id();

    let mut w = CmdWriter::new();
    w.bind_texture(gl::TEXTURE_2D, 1);
    b.execute(w.as_words());

    let mut w = CmdWriter::new();
    w.delete_textures(&[1]);
    a.run(&w);
    assert!(a.texture(1).is_none());
    assert!(a.soft.borrow().is_live(sid));

    // Unbinding in `b` drops the last reference.
    let mut w = CmdWriter::new();
    w.bind_texture(gl::TEXTURE_2D, 0);
    b.execute(w.as_words());
    assert!(!a.soft.borrow().is_live(sid));
    assert_eq!(b.get_error(), gl::NO_ERROR);
}

#[test]
fn deleting_an_attached_texture_detaches_it() {
    let mut h = Harness::new();
    let before = h.soft.borrow().live_objects(ResourceKind::Texture);
    let mut w = CmdWriter::new();
    render_to_texture(&mut w, 1, 2, 2, 2);
    w.delete_textures(&[2]);
    w.check_framebuffer_status(gl::FRAMEBUFFER, h.scratch_id, 0);
    h.run(&w);
    assert_eq!(h.scratch.read_u32(0), Some(gl::FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT));
    assert_eq!(h.soft.borrow().live_objects(ResourceKind::Texture), before);
}

#[test]
fn bound_images_back_level_zero() {
    let mut h = Harness::new();
    h.dec
        .group()
        .borrow_mut()
        .images_mut()
        .register(5, Arc::new(GpuImage::solid(2, 2, [9, 8, 7, 6])));

    let mut w = CmdWriter::new();
    render_to_texture(&mut w, 1, 2, 1, 1);
    w.bind_tex_image_2d(gl::TEXTURE_2D, 5);
    h.run(&w);
    assert_eq!(h.read_pixels(2, 2), [9, 8, 7, 6].repeat(4));

    let mut w = CmdWriter::new();
    w.release_tex_image_2d(gl::TEXTURE_2D, 5);
    w.bind_tex_image_2d(gl::TEXTURE_2D, 6);
    w.bind_tex_image_2d(gl::TEXTURE_CUBE_MAP, 5);
    h.run(&w);
    assert_eq!(h.errors(), vec![gl::INVALID_ENUM, gl::INVALID_OPERATION]);
    assert_eq!(h.texture(2).unwrap().with(|t| t.size()), None);
}
