mod common;

use glam::Vec3;
use gpu_rt_renderer::{Accel, DeviceBuffer, DeviceHeap, GeometryFlags, Model, TriangleBuildInput};

#[test]
fn u32_buffer_round_trip() {
    let Some(context) = common::gpu_context() else { return };
    let heap = DeviceHeap::new(context, 1 << 20).unwrap();

    let data: Vec<u32> = (0..1000u32).map(|i| i.wrapping_mul(2654435761)).collect();
    let buffer = DeviceBuffer::alloc_and_upload(&heap, &data).unwrap();
    assert_ne!(buffer.address(), 0);
    assert_eq!(buffer.to_vec().unwrap(), data);
}

#[test]
fn f32_buffer_round_trip_is_bit_exact() {
    let Some(context) = common::gpu_context() else { return };
    let heap = DeviceHeap::new(context, 1 << 20).unwrap();

    let data = [0.0f32, -0.0, 1.5, f32::MIN_POSITIVE, f32::MAX, f32::INFINITY, f32::NAN, 1.0e-40];
    let buffer = DeviceBuffer::alloc_and_upload(&heap, &data).unwrap();

    let mut out = [0.0f32; 8];
    buffer.download(&mut out).unwrap();
    let bits = |values: &[f32]| values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&out), bits(&data));
}

#[test]
fn partial_download_reads_prefix() {
    let Some(context) = common::gpu_context() else { return };
    let heap = DeviceHeap::new(context, 1 << 20).unwrap();

    let buffer = DeviceBuffer::alloc_and_upload(&heap, &[7u32, 8, 9, 10, 11]).unwrap();
    let mut out = [0u32; 3];
    buffer.download(&mut out).unwrap();
    assert_eq!(out, [7, 8, 9]);
}

#[test]
fn resize_releases_previous_allocation() {
    let Some(context) = common::gpu_context() else { return };
    let heap = DeviceHeap::new(context, 1 << 20).unwrap();

    let mut buffer = DeviceBuffer::<u32>::with_len(&heap, 256).unwrap();
    let used = heap.used_bytes();
    buffer.resize(16).unwrap();
    assert!(heap.used_bytes() < used);
    buffer.free();
    assert_eq!(heap.used_bytes(), 0);
    assert!(!buffer.is_allocated());
}

#[test]
fn compaction_shrinks_and_keeps_handle() {
    let Some(context) = common::gpu_context() else { return };
    let heap = DeviceHeap::new(context, 4 << 20).unwrap();
    let model = Model::demo();

    let uploads: Vec<_> = model
        .meshes()
        .iter()
        .map(|mesh| {
            (
                DeviceBuffer::alloc_and_upload(&heap, &mesh.vertices).unwrap(),
                DeviceBuffer::alloc_and_upload(&heap, &mesh.indices).unwrap(),
            )
        })
        .collect();
    let inputs: Vec<_> = model
        .meshes()
        .iter()
        .zip(&uploads)
        .map(|(mesh, (vertices, indices))| TriangleBuildInput {
            vertices: &mesh.vertices,
            indices: &mesh.indices,
            vertex_buffer: vertices.device_ptr(),
            index_buffer: indices.device_ptr(),
            vertex_stride: std::mem::size_of::<Vec3>() as u32,
            flags: GeometryFlags::NONE,
        })
        .collect();

    let used_before = heap.used_bytes();
    let accel = Accel::build(&heap, &inputs).unwrap();

    assert!(!accel.handle().is_null());
    assert!(accel.compacted_size() > 0);
    assert!(accel.compacted_size() <= accel.uncompacted_size());
    assert_eq!(accel.triangle_count(), model.triangle_count());
    assert_eq!(accel.geometries().len(), model.meshes().len());
    // Only the compacted structure stays resident
    assert!(heap.used_bytes() - used_before <= accel.compacted_size() + 16);
}
