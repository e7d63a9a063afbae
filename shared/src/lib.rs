#![no_std]

//! Structures mirrored between host memory and the device heap.
//!
//! Every type here is read by the WGSL runtime through raw word offsets, so
//! field order and sizes are part of the device ABI. The offsets the device
//! code relies on are spelled out next to each struct.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Configuration constants for the ray-tracing backend
pub struct RaytracerConfig;

impl RaytracerConfig {
    pub const WORKGROUP_SIZE: (u32, u32) = (8, 8);
    pub const HEAP_ALIGNMENT: u64 = 16;
    /// Bytes at the start of the heap that are never handed out, so address 0 means null.
    pub const HEAP_RESERVED_BYTES: u64 = 16;
    pub const SBT_RECORD_ALIGNMENT: usize = 16;
    pub const SBT_RECORD_HEADER_SIZE: usize = 16;
    /// Scale of the image plane basis; 0.66 matches a ~67 degree vertical field of view.
    pub const COS_FOVY: f32 = 0.66;
    pub const INVALID_INDEX: u32 = 0xFFFF_FFFF;
    pub const NO_TEXTURE: u32 = 0;
}

/// Device view of a typed array: heap byte address plus element count.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BufferView {
    pub address: u32,
    pub count: u32,
}

impl BufferView {
    pub const NULL: Self = Self { address: 0, count: 0 };

    pub fn is_null(&self) -> bool {
        self.address == 0
    }
}

/// Camera as seen by the ray-generation program (48 bytes)
/// position @0, direction @12, horizontal @24, vertical @36
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct LaunchCamera {
    pub position: [f32; 3],
    pub direction: [f32; 3],
    pub horizontal: [f32; 3],
    pub vertical: [f32; 3],
}

impl LaunchCamera {
    pub fn from_basis(position: Vec3, direction: Vec3, horizontal: Vec3, vertical: Vec3) -> Self {
        Self {
            position: position.to_array(),
            direction: direction.to_array(),
            horizontal: horizontal.to_array(),
            vertical: vertical.to_array(),
        }
    }
}

/// Per-frame launch parameters (80 bytes)
/// color_buffer @0, accum_buffer @8, fb_size @16, frame_id @24, traversable @28, camera @32
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct LaunchParams {
    /// Packed RGBA8, one u32 per pixel, rows bottom-up
    pub color_buffer: BufferView,
    /// One [f32; 4] running sum per pixel
    pub accum_buffer: BufferView,
    pub fb_size: [u32; 2],
    pub frame_id: u32,
    pub traversable: u32,
    pub camera: LaunchCamera,
}

/// Uniform block written for every launch: where the parameters live and how
/// the shader binding table is laid out.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LaunchDescriptor {
    pub params: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub raygen_record: u32,
    pub miss_record_base: u32,
    pub miss_record_stride: u32,
    pub miss_record_count: u32,
    pub hitgroup_record_base: u32,
    pub hitgroup_record_stride: u32,
    pub hitgroup_record_count: u32,
    pub _padding: u32,
}

/// Opaque record header identifying the program group a record dispatches to
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SbtRecordHeader {
    pub program_group: u32,
    pub kind: u32,
    pub _reserved: [u32; 2],
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, align(16))]
pub struct RaygenRecord {
    pub header: SbtRecordHeader,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, align(16))]
pub struct MissRecord {
    pub header: SbtRecordHeader,
}

/// Per-mesh payload of a hit-group record (64 bytes)
/// color @0, has_texture @12, texture @16, vertex @24, normal @32, texcoord @40, index @48
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct TriangleMeshSbtData {
    pub color: [f32; 3],
    pub has_texture: u32,
    pub texture: u32,
    pub _padding0: u32,
    pub vertex: BufferView,
    pub normal: BufferView,
    pub texcoord: BufferView,
    pub index: BufferView,
    pub _padding1: [u32; 2],
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C, align(16))]
pub struct HitgroupRecord {
    pub header: SbtRecordHeader,
    pub data: TriangleMeshSbtData,
}

/// Axis-Aligned Bounding Box for BVH
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Aabb {
    pub min: [f32; 3],      // Minimum bounds
    pub _padding0: f32,     // Padding for alignment
    pub max: [f32; 3],      // Maximum bounds
    pub _padding1: f32,     // Padding for alignment
}

impl Aabb {
    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, _padding0: 0.0, max, _padding1: 0.0 }
    }

    /// Inverted box that any union will overwrite
    pub fn empty() -> Self {
        Self::new([f32::MAX; 3], [f32::MIN; 3])
    }

    pub fn is_empty(&self) -> bool {
        self.min[0] > self.max[0] || self.min[1] > self.max[1] || self.min[2] > self.max[2]
    }

    pub fn union(a: &Aabb, b: &Aabb) -> Aabb {
        Aabb::new(
            [a.min[0].min(b.min[0]), a.min[1].min(b.min[1]), a.min[2].min(b.min[2])],
            [a.max[0].max(b.max[0]), a.max[1].max(b.max[1]), a.max[2].max(b.max[2])],
        )
    }

    pub fn contains(&self, other: &Aabb) -> bool {
        (0..3).all(|axis| self.min[axis] <= other.min[axis] && self.max[axis] >= other.max[axis])
    }
}

/// BVH node as stored in the acceleration structure (48 bytes)
/// min @0, max @16, left @32, right @36, first @40, count @44
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct BvhNode {
    pub bounds: Aabb,
    pub left_child: u32,     // INVALID_INDEX for leaves
    pub right_child: u32,    // INVALID_INDEX for leaves
    pub triangle_start: u32, // First slot in the triangle index list (leaves)
    pub triangle_count: u32, // 0 for internal nodes
}

impl BvhNode {
    pub fn leaf(bounds: Aabb, triangle_start: u32, triangle_count: u32) -> Self {
        Self {
            bounds,
            left_child: RaytracerConfig::INVALID_INDEX,
            right_child: RaytracerConfig::INVALID_INDEX,
            triangle_start,
            triangle_count,
        }
    }

    pub fn internal(bounds: Aabb, left_child: u32, right_child: u32) -> Self {
        Self { bounds, left_child, right_child, triangle_start: 0, triangle_count: 0 }
    }

    pub fn is_leaf(&self) -> bool {
        self.left_child == RaytracerConfig::INVALID_INDEX
    }
}

/// Triangle copied into the acceleration structure (48 bytes)
/// v0 @0, geometry_index @12, v1 @16, primitive_index @28, v2 @32, flags @44
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct TriangleRecord {
    pub v0: [f32; 3],
    pub geometry_index: u32,
    pub v1: [f32; 3],
    pub primitive_index: u32,
    pub v2: [f32; 3],
    pub flags: u32,
}

impl TriangleRecord {
    pub fn new(v0: Vec3, v1: Vec3, v2: Vec3, geometry_index: u32, primitive_index: u32, flags: u32) -> Self {
        Self {
            v0: v0.to_array(),
            geometry_index,
            v1: v1.to_array(),
            primitive_index,
            v2: v2.to_array(),
            flags,
        }
    }

    pub fn bounds(&self) -> Aabb {
        let mut min = self.v0;
        let mut max = self.v0;
        for v in [self.v1, self.v2] {
            for axis in 0..3 {
                min[axis] = min[axis].min(v[axis]);
                max[axis] = max[axis].max(v[axis]);
            }
        }
        Aabb::new(min, max)
    }

    pub fn centroid(&self) -> Vec3 {
        (Vec3::from_array(self.v0) + Vec3::from_array(self.v1) + Vec3::from_array(self.v2)) / 3.0
    }
}

/// Header at the traversable handle address (32 bytes). Offsets are relative
/// to the header so a compacted copy stays valid.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AccelHeader {
    pub node_count: u32,
    pub triangle_count: u32,
    pub triangles_offset: u32,
    pub indices_offset: u32,
    pub nodes_offset: u32,
    pub _padding: [u32; 3],
}

/// Texture object header; texels follow in a separate device buffer
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct TextureHeader {
    pub width: u32,
    pub height: u32,
    pub texels: u32,
    pub sampler_flags: u32,
}
