//! Transient heap placement across frame slots.

mod common;

use common::{TestDevice, small_config};
use redlilium_submit::{
    BufferDescriptor, BufferUsage, DummyConfig, GraphicsError, TextureDescriptor, TextureFormat,
    TextureUsage,
};

const REGION: u64 = 2 * 1024 * 1024;

#[test]
fn test_resources_pack_into_current_region() {
    let t = TestDevice::with_depth(2);
    let heap = t.device.transient_heap();
    assert_eq!(heap.per_frame_capacity(), REGION);

    t.device.begin_frame(None).unwrap();

    let (buffer, consumed) = heap
        .create_transient_buffer(
            &BufferDescriptor::new(1000, BufferUsage::STORAGE).with_label("particles"),
            0,
        )
        .unwrap();
    assert_eq!(buffer.offset(), 0);
    assert_eq!(buffer.size(), 1024);
    assert_eq!(consumed, 1024);

    let descriptor = TextureDescriptor::new_2d(
        256,
        256,
        TextureFormat::Rgba8Unorm,
        TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
    );
    let (texture, consumed) = heap.create_transient_texture(&descriptor, 1024).unwrap();
    assert_eq!(texture.offset(), 64 * 1024);
    assert_eq!(texture.size(), 256 * 1024);
    assert_eq!(consumed, 64 * 1024 + 256 * 1024 - 1024);

    let stats = heap.stats();
    assert_eq!(stats.frame_usage, 320 * 1024);
    assert_eq!(stats.peak_usage, 320 * 1024);
    assert_eq!(stats.frame_base, 0);

    t.device.end_frame(None, None).unwrap();
}

#[test]
fn test_next_slot_places_in_next_region() {
    let t = TestDevice::with_depth(2);
    let heap = t.device.transient_heap();
    let descriptor = BufferDescriptor::new(4096, BufferUsage::UNIFORM);

    t.device.begin_frame(None).unwrap();
    let (first, _) = heap.create_transient_buffer(&descriptor, 0).unwrap();
    t.device.end_frame(None, None).unwrap();

    t.device.begin_frame(None).unwrap();
    assert_eq!(heap.frame_base(), REGION);
    assert_eq!(heap.stats().frame_usage, 0);
    let (second, _) = heap.create_transient_buffer(&descriptor, 0).unwrap();
    assert_eq!(second.offset(), REGION);
    assert_ne!(first.raw().id(), second.raw().id());
    t.device.end_frame(None, None).unwrap();
    drop(first);

    // Slot 0 comes around again and its region starts over
    t.device.begin_frame(None).unwrap();
    assert_eq!(heap.frame_base(), 0);
    let (third, _) = heap.create_transient_buffer(&descriptor, 0).unwrap();
    assert_eq!(third.offset(), 0);
    assert_eq!(heap.stats().peak_usage, 4096);
    t.device.end_frame(None, None).unwrap();
}

#[test]
fn test_exhausted_region_names_the_knob() {
    let t = TestDevice::new(
        DummyConfig::default(),
        small_config()
            .with_buffering_depth(2)
            .with_transient_heap_size(256 * 1024),
    );
    let heap = t.device.transient_heap();
    assert_eq!(heap.per_frame_capacity(), 128 * 1024);

    t.device.begin_frame(None).unwrap();
    let descriptor = TextureDescriptor::new_2d(
        256,
        256,
        TextureFormat::Rgba8Unorm,
        TextureUsage::RENDER_ATTACHMENT,
    );
    let err = heap.create_transient_texture(&descriptor, 0).unwrap_err();
    assert!(matches!(
        err,
        GraphicsError::CapacityExceeded {
            resource: "transient_heap_size",
            requested: 262144,
            available: 131072,
        }
    ));
    assert!(err.to_string().contains("increase transient_heap_size"));
    t.device.end_frame(None, None).unwrap();
}

#[test]
fn test_resize_is_unsupported() {
    let t = TestDevice::with_depth(2);
    let heap = t.device.transient_heap();
    assert!(matches!(
        heap.resize(8 * 1024 * 1024),
        Err(GraphicsError::FeatureNotSupported(_))
    ));
    assert_eq!(heap.per_frame_capacity(), REGION);
}
