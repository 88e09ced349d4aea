mod common;

use common::{render_to_texture, Harness};
use gpucmd_protocol::{gl, CmdWriter};
use gpucmd_service::backend::ResourceKind;
use gpucmd_service::{ServiceConfig, TransferMode};
use pretty_assertions::assert_eq;

const PIXELS: [u8; 16] = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120, 130, 140, 150, 160];
const DATA: u32 = 1024;

fn upload_into_render_target(h: &mut Harness) {
    h.scratch.write(DATA as usize, &PIXELS);
    let mut w = CmdWriter::new();
    render_to_texture(&mut w, 1, 2, 2, 2);
    w.async_tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, 2, 2, gl::RGBA, gl::UNSIGNED_BYTE, h.scratch_id, DATA);
    h.run(&w);
}

#[test]
fn idle_uploads_land_on_the_next_read() {
    let mut h = Harness::new();
    upload_into_render_target(&mut h);
    assert!(h.dec.has_more_idle_work());
    assert_eq!(h.read_pixels(2, 2), vec![0; 16]);

    h.dec.perform_idle_work();
    assert!(!h.dec.has_more_idle_work());
    assert_eq!(h.dec.transfer_stats().texture_uploads, 1);
    assert_eq!(h.read_pixels(2, 2), PIXELS);
    assert_eq!(h.errors(), Vec::<u32>::new());
}

#[test]
fn wait_completes_and_binds_the_upload() {
    let mut h = Harness::new();
    upload_into_render_target(&mut h);
    let mut w = CmdWriter::new();
    w.wait_async_tex_image_2d(gl::TEXTURE_2D);
    h.run(&w);
    assert!(!h.dec.has_more_idle_work());
    assert_eq!(h.read_pixels(2, 2), PIXELS);
}

#[test]
fn threaded_uploads() {
    let mut h = Harness::with_config(ServiceConfig {
        transfer_mode: TransferMode::Threaded,
        ..ServiceConfig::default()
    });
    upload_into_render_target(&mut h);
    let mut w = CmdWriter::new();
    w.wait_async_tex_image_2d(gl::TEXTURE_2D);
    h.run(&w);
    assert_eq!(h.read_pixels(2, 2), PIXELS);
    assert_eq!(h.dec.transfer_stats().texture_uploads, 1);
}

#[test]
fn texture_is_locked_until_the_upload_is_bound() {
    let mut h = Harness::new();
    upload_into_render_target(&mut h);
    let mut w = CmdWriter::new();
    w.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, 2, 2, gl::RGBA, gl::UNSIGNED_BYTE, 0, 0);
    w.tex_sub_image_2d(gl::TEXTURE_2D, 0, 0, 0, 1, 1, gl::RGBA, gl::UNSIGNED_BYTE, h.scratch_id, DATA);
    w.async_tex_sub_image_2d(gl::TEXTURE_2D, 0, 0, 0, 1, 1, gl::RGBA, gl::UNSIGNED_BYTE, h.scratch_id, DATA);
    h.run(&w);
    assert_eq!(h.errors(), vec![gl::INVALID_OPERATION]);

    // Completed but unbound still counts as in progress.
    h.dec.perform_idle_work();
    let mut w = CmdWriter::new();
    w.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, 2, 2, gl::RGBA, gl::UNSIGNED_BYTE, 0, 0);
    h.run(&w);
    assert_eq!(h.errors(), vec![gl::INVALID_OPERATION]);

    h.read_pixels(2, 2);
    h.run(&w);
    assert_eq!(h.errors(), Vec::<u32>::new());
}

#[test]
fn deleting_the_texture_discards_its_upload() {
    let mut h = Harness::new();
    let before = h.soft.borrow().live_objects(ResourceKind::Texture);
    h.scratch.write(DATA as usize, &PIXELS);
    let mut w = CmdWriter::new();
    w.gen_textures(&[1]);
    w.bind_texture(gl::TEXTURE_2D, 1);
    w.async_tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, 2, 2, gl::RGBA, gl::UNSIGNED_BYTE, h.scratch_id, DATA);
    w.delete_textures(&[1]);
    h.run(&w);
    assert_eq!(h.soft.borrow().live_objects(ResourceKind::Texture), before);

    h.dec.perform_idle_work();
    let mut w = CmdWriter::new();
    w.gen_sync_point(h.scratch_id, 0);
    h.run(&w);
    assert_eq!(h.dec.transfer_stats().texture_uploads, 1);
    assert_eq!(h.soft.borrow().live_objects(ResourceKind::Texture), before);
    assert_eq!(h.errors(), Vec::<u32>::new());
}
