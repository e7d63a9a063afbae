//! Acceleration structure construction.
//!
//! A build gathers every mesh of the scene into one triangle list, builds a
//! BVH over it and lays the result out in the device heap as
//!
//! ```text
//! [AccelHeader][TriangleRecord x T][u32 index x T, padded to 16][BvhNode x capacity]
//! ```
//!
//! The build is two-phase: it first writes into an output buffer sized for the
//! worst-case node count and emits the used size, then compacts into a buffer
//! of exactly that size. Only the compacted buffer survives the build.

use std::sync::Arc;

use glam::Vec3;
use log::{debug, info};
use rt_shared::{AccelHeader, BvhNode, TriangleRecord};

use crate::buffers::{align_up, DeviceBuffer, DeviceHeap, DevicePtr};
use crate::bvh::BvhBuilder;
use crate::error::{RenderError, RenderResult};

/// Per-geometry build flags, stored in every triangle record of the geometry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeometryFlags(u32);

impl GeometryFlags {
    pub const NONE: Self = Self(0);
    /// Traversal skips the any-hit program for this geometry
    pub const DISABLE_ANYHIT: Self = Self(1);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for GeometryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One mesh as seen by the builder. The host slices are what the BVH is built
/// from; the device pointers must describe the same data already uploaded.
#[derive(Clone, Copy, Debug)]
pub struct TriangleBuildInput<'a> {
    pub vertices: &'a [Vec3],
    pub indices: &'a [[u32; 3]],
    pub vertex_buffer: DevicePtr<Vec3>,
    pub index_buffer: DevicePtr<[u32; 3]>,
    pub vertex_stride: u32,
    pub flags: GeometryFlags,
}

impl<'a> TriangleBuildInput<'a> {
    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }
}

/// Which device buffers a geometry was built from, in build order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryBinding {
    pub vertex_address: u32,
    pub index_address: u32,
    pub triangle_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccelBufferSizes {
    pub temp_size_in_bytes: u64,
    pub output_size_in_bytes: u64,
}

/// Byte offsets of the sections of a built structure, relative to its header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccelLayout {
    pub triangles_offset: u64,
    pub indices_offset: u64,
    pub nodes_offset: u64,
    pub total_size: u64,
}

impl AccelLayout {
    pub fn new(triangle_count: usize, node_count: usize) -> Self {
        let header = std::mem::size_of::<AccelHeader>() as u64;
        let triangles_offset = header;
        let indices_offset = triangles_offset + (triangle_count * std::mem::size_of::<TriangleRecord>()) as u64;
        let nodes_offset = align_up(indices_offset + (triangle_count * 4) as u64, 16);
        let total_size = nodes_offset + (node_count * std::mem::size_of::<BvhNode>()) as u64;
        Self { triangles_offset, indices_offset, nodes_offset, total_size }
    }
}

/// Device address of a built acceleration structure's header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraversableHandle(u32);

impl TraversableHandle {
    pub const NULL: Self = Self(0);

    pub fn address(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Query temp and output sizes for building `inputs` as one structure
pub fn compute_memory_usage(inputs: &[TriangleBuildInput]) -> AccelBufferSizes {
    let triangle_count: usize = inputs.iter().map(|input| input.triangle_count()).sum();
    AccelBufferSizes {
        temp_size_in_bytes: (triangle_count * std::mem::size_of::<TriangleRecord>()) as u64,
        output_size_in_bytes: AccelLayout::new(triangle_count, BvhBuilder::max_nodes(triangle_count)).total_size,
    }
}

/// Check the inputs and gather their triangles in build order
fn gather_triangles(inputs: &[TriangleBuildInput]) -> RenderResult<Vec<TriangleRecord>> {
    let mut records = Vec::with_capacity(inputs.iter().map(|input| input.triangle_count()).sum());

    for (geometry_index, input) in inputs.iter().enumerate() {
        if input.vertex_stride as usize != std::mem::size_of::<Vec3>() {
            return Err(RenderError::InvalidBuildInput(format!(
                "geometry {geometry_index}: unsupported vertex stride {}",
                input.vertex_stride
            )));
        }
        if input.vertex_buffer.count() as usize != input.vertices.len()
            || input.index_buffer.count() as usize != input.indices.len()
        {
            return Err(RenderError::InvalidBuildInput(format!(
                "geometry {geometry_index}: device buffers do not match host data"
            )));
        }

        let vertex_count = input.vertices.len();
        for (primitive_index, triangle) in input.indices.iter().enumerate() {
            if let Some(bad) = triangle.iter().find(|&&i| i as usize >= vertex_count) {
                return Err(RenderError::InvalidBuildInput(format!(
                    "geometry {geometry_index}, triangle {primitive_index}: index {bad} out of range for {vertex_count} vertices"
                )));
            }
            records.push(TriangleRecord::new(
                input.vertices[triangle[0] as usize],
                input.vertices[triangle[1] as usize],
                input.vertices[triangle[2] as usize],
                geometry_index as u32,
                primitive_index as u32,
                input.flags.bits(),
            ));
        }
    }

    Ok(records)
}

/// A compacted acceleration structure and the buffer that owns it
pub struct Accel {
    buffer: DeviceBuffer<u8>,
    handle: TraversableHandle,
    geometries: Vec<GeometryBinding>,
    node_count: usize,
    triangle_count: usize,
    uncompacted_size: u64,
}

impl Accel {
    pub fn build(heap: &Arc<DeviceHeap>, inputs: &[TriangleBuildInput]) -> RenderResult<Self> {
        let context = heap.context().clone();
        let records = gather_triangles(inputs)?;
        let sizes = compute_memory_usage(inputs);
        debug!(
            "Accel build: {} geometries, {} triangles, temp {} B, output {} B",
            inputs.len(),
            records.len(),
            sizes.temp_size_in_bytes,
            sizes.output_size_in_bytes
        );

        let temp = DeviceBuffer::alloc_and_upload(heap, &records)?;
        let output = DeviceBuffer::<u8>::with_len(heap, sizes.output_size_in_bytes as usize)?;
        let compacted_size_buffer = DeviceBuffer::<u64>::with_len(heap, 1)?;

        let bvh = BvhBuilder::build(&records);
        let layout = AccelLayout::new(records.len(), bvh.nodes.len());
        let header = AccelHeader {
            node_count: bvh.nodes.len() as u32,
            triangle_count: records.len() as u32,
            triangles_offset: layout.triangles_offset as u32,
            indices_offset: layout.indices_offset as u32,
            nodes_offset: layout.nodes_offset as u32,
            _padding: [0; 3],
        };

        let base = output.address() as u64;
        let ((), error) = context.capture_errors(|| {
            heap.write(base, bytemuck::bytes_of(&header));
            heap.copy(temp.address() as u64, base + layout.triangles_offset, temp.size_in_bytes());
            heap.write(base + layout.indices_offset, bytemuck::cast_slice(&bvh.triangle_indices));
            heap.write(base + layout.nodes_offset, bytemuck::cast_slice(&bvh.nodes));
            compacted_size_buffer.upload(&[layout.total_size]);
        });
        if let Some(error) = error {
            return Err(RenderError::from_wgpu_build(layout.total_size, error));
        }

        context.synchronize();
        let compacted_size = compacted_size_buffer.to_vec()?[0];

        let compacted = DeviceBuffer::<u8>::with_len(heap, compacted_size as usize)?;
        heap.copy(output.address() as u64, compacted.address() as u64, compacted_size);
        context.synchronize();

        let handle = TraversableHandle(compacted.address());
        let uncompacted_size = output.size_in_bytes();
        drop(temp);
        drop(output);
        drop(compacted_size_buffer);

        info!(
            "Acceleration structure: {} triangles, {} nodes, {} B compacted from {} B",
            records.len(),
            bvh.nodes.len(),
            compacted_size,
            uncompacted_size
        );

        Ok(Self {
            buffer: compacted,
            handle,
            geometries: inputs
                .iter()
                .map(|input| GeometryBinding {
                    vertex_address: input.vertex_buffer.address(),
                    index_address: input.index_buffer.address(),
                    triangle_count: input.triangle_count() as u32,
                })
                .collect(),
            node_count: bvh.nodes.len(),
            triangle_count: records.len(),
            uncompacted_size,
        })
    }

    pub fn handle(&self) -> TraversableHandle {
        self.handle
    }

    /// Canonical geometry order; hit-group records must follow it
    pub fn geometries(&self) -> &[GeometryBinding] {
        &self.geometries
    }

    pub fn compacted_size(&self) -> u64 {
        self.buffer.size_in_bytes()
    }

    pub fn uncompacted_size(&self) -> u64 {
        self.uncompacted_size
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn triangle_count(&self) -> usize {
        self.triangle_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(vertices: &'a [Vec3], indices: &'a [[u32; 3]]) -> TriangleBuildInput<'a> {
        TriangleBuildInput {
            vertices,
            indices,
            vertex_buffer: DevicePtr::from_raw(16, vertices.len() as u32),
            index_buffer: DevicePtr::from_raw(64, indices.len() as u32),
            vertex_stride: 12,
            flags: GeometryFlags::NONE,
        }
    }

    #[test]
    fn layout_sections_follow_each_other() {
        let layout = AccelLayout::new(3, 6);
        assert_eq!(layout.triangles_offset, 32);
        assert_eq!(layout.indices_offset, 32 + 3 * 48);
        assert_eq!(layout.nodes_offset, 192);
        assert_eq!(layout.total_size, 192 + 6 * 48);
    }

    #[test]
    fn memory_usage_reserves_worst_case_nodes() {
        let vertices = [Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z];
        let indices = [[0, 1, 2], [0, 2, 3]];
        let sizes = compute_memory_usage(&[input(&vertices, &indices), input(&vertices, &indices[..1])]);

        assert_eq!(sizes.temp_size_in_bytes, 3 * 48);
        assert_eq!(sizes.output_size_in_bytes, AccelLayout::new(3, 6).total_size);
        // A tree over three triangles has five nodes, so compaction always saves a node
        assert!(AccelLayout::new(3, 5).total_size < sizes.output_size_in_bytes);
    }

    #[test]
    fn empty_scene_reserves_one_node() {
        let sizes = compute_memory_usage(&[]);
        assert_eq!(sizes.temp_size_in_bytes, 0);
        assert_eq!(sizes.output_size_in_bytes, 32 + 48);
    }

    #[test]
    fn gathered_triangles_carry_geometry_and_primitive_ids() {
        let vertices = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let indices = [[0, 1, 2]];
        let mut second = input(&vertices, &indices);
        second.flags = GeometryFlags::DISABLE_ANYHIT;

        let records = gather_triangles(&[input(&vertices, &indices), second]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].geometry_index, 1);
        assert_eq!(records[1].primitive_index, 0);
        assert_eq!(records[1].flags, GeometryFlags::DISABLE_ANYHIT.bits());
        assert_eq!(records[0].v1, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let vertices = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let indices = [[0, 1, 3]];
        let err = gather_triangles(&[input(&vertices, &indices)]).unwrap_err();
        assert!(matches!(err, RenderError::InvalidBuildInput(_)));
    }

    #[test]
    fn unsupported_stride_is_rejected() {
        let vertices = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let indices = [[0, 1, 2]];
        let mut bad = input(&vertices, &indices);
        bad.vertex_stride = 16;
        assert!(gather_triangles(&[bad]).is_err());
    }

    #[test]
    fn flags_combine() {
        let flags = GeometryFlags::NONE | GeometryFlags::DISABLE_ANYHIT;
        assert!(flags.contains(GeometryFlags::DISABLE_ANYHIT));
        assert!(!GeometryFlags::NONE.contains(GeometryFlags::DISABLE_ANYHIT));
    }
}
