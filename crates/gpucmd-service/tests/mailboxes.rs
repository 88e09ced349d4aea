mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::Harness;
use gpucmd_protocol::{gl, CmdWriter, Mailbox};
use gpucmd_service::mailbox::ConflictKind;
use gpucmd_service::{generate_mailbox, GpuDevice, MailboxSyncHub, ServiceConfig, SoftBackend};
use pretty_assertions::assert_eq;

/// A second context group on the same device as `h`.
fn sibling(h: &Harness) -> Harness {
    Harness::on_device(h.soft.clone(), h.device.clone(), ServiceConfig::default())
}

/// A context on its own backend, exchanging mailboxes through `hub`.
fn synced(hub: &MailboxSyncHub) -> Harness {
    let soft = Rc::new(RefCell::new(SoftBackend::new()));
    let device = GpuDevice::with_mailbox_sync(soft.clone(), hub);
    Harness::on_device(soft, device, ServiceConfig::default())
}

fn define(w: &mut CmdWriter, id: u32, size: u32) {
    w.gen_textures(&[id]);
    w.bind_texture(gl::TEXTURE_2D, id);
    w.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, size, size, gl::RGBA, gl::UNSIGNED_BYTE, 0, 0);
}

fn resize(w: &mut CmdWriter, size: u32) {
    w.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, size, size, gl::RGBA, gl::UNSIGNED_BYTE, 0, 0);
}

/// Consume `name` into a fresh texture `id` of `h`.
fn consume(h: &mut Harness, id: u32, name: &Mailbox) {
    let mut w = CmdWriter::new();
    define(&mut w, id, 1);
    w.consume_texture(gl::TEXTURE_2D, name);
    h.run(&w);
}

/// Insert a sync point and return its value.
fn sync_point(h: &mut Harness) -> u32 {
    let mut w = CmdWriter::new();
    w.gen_sync_point(h.scratch_id, 4000);
    h.run(&w);
    h.scratch.read_u32(4000).unwrap()
}

fn wait(h: &mut Harness, sync_point: u32) {
    let mut w = CmdWriter::new();
    w.wait_sync_point(sync_point);
    h.run(&w);
}

fn size_of(h: &Harness, id: u32) -> Option<(u32, u32)> {
    h.texture(id).and_then(|t| t.with(|t| t.size()))
}

#[test]
fn immediate_consume_is_identity_preserving() {
    let mut producer = Harness::new();
    let mut consumer = sibling(&producer);
    let name = generate_mailbox();

    let mut w = CmdWriter::new();
    define(&mut w, 1, 4);
    w.produce_texture(gl::TEXTURE_2D, &name);
    producer.run(&w);

    consume(&mut consumer, 7, &name);
    consume(&mut consumer, 8, &name);
    assert_eq!(consumer.errors(), Vec::<u32>::new());
    let source = producer.texture(1).unwrap();
    assert!(consumer.texture(7).unwrap().ptr_eq(&source));
    assert!(consumer.texture(8).unwrap().ptr_eq(&source));
}

#[test]
fn reproducing_a_name_redirects_it() {
    let mut producer = Harness::new();
    let mut consumer = sibling(&producer);
    let name = generate_mailbox();

    let mut w = CmdWriter::new();
    define(&mut w, 1, 4);
    w.produce_texture(gl::TEXTURE_2D, &name);
    define(&mut w, 2, 8);
    w.produce_texture(gl::TEXTURE_2D, &name);
    producer.run(&w);

    consume(&mut consumer, 7, &name);
    assert!(consumer.texture(7).unwrap().ptr_eq(&producer.texture(2).unwrap()));
    assert_eq!(size_of(&producer, 1), Some((4, 4)));
}

#[test]
fn destroying_the_texture_invalidates_every_name() {
    let mut producer = Harness::new();
    let mut consumer = sibling(&producer);
    let (a, b) = (generate_mailbox(), generate_mailbox());

    let mut w = CmdWriter::new();
    define(&mut w, 1, 4);
    w.produce_texture(gl::TEXTURE_2D, &a);
    w.produce_texture(gl::TEXTURE_2D, &b);
    w.delete_textures(&[1]);
    producer.run(&w);

    consume(&mut consumer, 7, &a);
    assert_eq!(consumer.errors(), vec![gl::INVALID_OPERATION]);
    consume(&mut consumer, 8, &b);
    assert_eq!(consumer.errors(), vec![gl::INVALID_OPERATION]);
    assert_eq!(size_of(&consumer, 7), Some((1, 1)));
}

#[test]
fn default_textures_cannot_be_produced() {
    let mut h = Harness::new();
    let mut w = CmdWriter::new();
    w.produce_texture(gl::TEXTURE_2D, &generate_mailbox());
    h.run(&w);
    assert_eq!(h.errors(), vec![gl::INVALID_OPERATION]);
}

#[test]
fn pulled_proxies_follow_pushed_state() {
    let hub = MailboxSyncHub::new(8);
    let mut a = synced(&hub);
    let mut b = synced(&hub);
    let name = generate_mailbox();

    let mut w = CmdWriter::new();
    define(&mut w, 1, 4);
    w.produce_texture(gl::TEXTURE_2D, &name);
    a.run(&w);

    consume(&mut b, 7, &name);
    assert_eq!(b.errors(), Vec::<u32>::new());
    assert_eq!(size_of(&b, 7), Some((4, 4)));
    assert!(!b.texture(7).unwrap().ptr_eq(&a.texture(1).unwrap()));

    let mut w = CmdWriter::new();
    resize(&mut w, 8);
    a.run(&w);
    let sp = sync_point(&mut a);

    // Edits after the push stay local to `a`.
    let mut w = CmdWriter::new();
    resize(&mut w, 16);
    a.run(&w);

    wait(&mut b, sp);
    assert_eq!(size_of(&b, 7), Some((8, 8)));
    assert_eq!(size_of(&a, 1), Some((16, 16)));
    assert!(hub.conflicts().is_empty());
}

#[test]
fn last_pushed_state_outlives_the_source() {
    let hub = MailboxSyncHub::new(8);
    let mut a = synced(&hub);
    let mut b = synced(&hub);
    let name = generate_mailbox();

    let mut w = CmdWriter::new();
    define(&mut w, 1, 4);
    w.produce_texture(gl::TEXTURE_2D, &name);
    a.run(&w);
    consume(&mut b, 7, &name);

    let mut w = CmdWriter::new();
    resize(&mut w, 32);
    a.run(&w);
    let sp = sync_point(&mut a);
    let mut w = CmdWriter::new();
    w.delete_textures(&[1]);
    a.run(&w);
    assert!(a.texture(1).is_none());

    wait(&mut b, sp);
    assert_eq!(size_of(&b, 7), Some((32, 32)));
    wait(&mut b, sp);
    assert_eq!(size_of(&b, 7), Some((32, 32)));

    // The name died with its producer; the proxy alone keeps the group.
    assert_eq!(hub.group_count(), 1);
    assert_eq!(hub.mailbox_count(), 0);
    let mut c = synced(&hub);
    consume(&mut c, 3, &name);
    assert_eq!(c.errors(), vec![gl::INVALID_OPERATION]);
}

#[test]
fn concurrent_edits_are_flagged() {
    let hub = MailboxSyncHub::new(8);
    let mut a = synced(&hub);
    let mut b = synced(&hub);
    let name = generate_mailbox();

    let mut w = CmdWriter::new();
    define(&mut w, 1, 4);
    w.produce_texture(gl::TEXTURE_2D, &name);
    a.run(&w);
    consume(&mut b, 7, &name);

    let mut w = CmdWriter::new();
    resize(&mut w, 8);
    a.run(&w);
    let first = sync_point(&mut a);

    // `b` edits the proxy without pulling `first`.
    let mut w = CmdWriter::new();
    resize(&mut w, 2);
    b.run(&w);
    let second = sync_point(&mut b);
    assert!(second > first);

    let conflicts = hub.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::PushOverUnpulled);
    assert_eq!(conflicts[0].sync_point, second);

    // Last push wins.
    wait(&mut a, second);
    assert_eq!(size_of(&a, 1), Some((2, 2)));
}

#[test]
fn waiting_on_a_future_sync_point_is_an_error() {
    let hub = MailboxSyncHub::new(8);
    let mut a = synced(&hub);
    let sp = sync_point(&mut a);
    wait(&mut a, sp + 1);
    assert_eq!(a.errors(), vec![gl::INVALID_VALUE]);
    assert_eq!(hub.sync_points().last_generated(), sp);
}
