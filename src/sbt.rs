//! Shader binding table construction.
//!
//! Three fixed-stride record arrays live in the device heap: one ray
//! generation record, one record per miss program group and one hit-group
//! record per mesh. Hit-group record `i` belongs to geometry `i` of the
//! acceleration structure, so the mesh list must be in the structure's order.

use std::sync::Arc;

use glam::{Vec2, Vec3};
use log::{debug, info};
use rt_shared::{HitgroupRecord, MissRecord, RaygenRecord, SbtRecordHeader, TriangleMeshSbtData};

use crate::accel::GeometryBinding;
use crate::buffers::{DeviceBuffer, DeviceHeap, DevicePtr};
use crate::error::{RenderError, RenderResult};
use crate::pipeline::{ProgramGroup, ProgramGroupKind, ProgramGroupSet};
use crate::texture::TextureHandle;

/// Per-mesh data bound into a hit-group record
#[derive(Clone, Copy, Debug)]
pub struct MeshBinding {
    pub color: Vec3,
    pub texture: Option<TextureHandle>,
    pub vertex: DevicePtr<Vec3>,
    pub normal: DevicePtr<Vec3>,
    pub texcoord: DevicePtr<Vec2>,
    pub index: DevicePtr<[u32; 3]>,
}

/// Where the tables live, as handed to the launch descriptor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtLayout {
    pub raygen_record: u32,
    pub miss_record_base: u32,
    pub miss_record_stride: u32,
    pub miss_record_count: u32,
    pub hitgroup_record_base: u32,
    pub hitgroup_record_stride: u32,
    pub hitgroup_record_count: u32,
}

fn record_header(group: &ProgramGroup) -> SbtRecordHeader {
    SbtRecordHeader {
        program_group: group.id(),
        kind: group.kind().record_kind(),
        _reserved: [0; 2],
    }
}

fn expect_kind(group: &ProgramGroup, kind: ProgramGroupKind) -> RenderResult<()> {
    if group.kind() != kind {
        return Err(RenderError::InvalidBuildInput(format!(
            "program group {} is a {} group, expected {}",
            group.id(),
            group.kind().as_str(),
            kind.as_str()
        )));
    }
    Ok(())
}

pub fn raygen_record(group: &ProgramGroup) -> RenderResult<RaygenRecord> {
    expect_kind(group, ProgramGroupKind::Raygen)?;
    Ok(RaygenRecord { header: record_header(group) })
}

pub fn miss_record(group: &ProgramGroup) -> RenderResult<MissRecord> {
    expect_kind(group, ProgramGroupKind::Miss)?;
    Ok(MissRecord { header: record_header(group) })
}

/// One hit-group record per mesh, checked against the acceleration
/// structure's geometry order.
pub fn build_hitgroup_records(
    group: &ProgramGroup,
    meshes: &[MeshBinding],
    geometry_order: &[GeometryBinding],
) -> RenderResult<Vec<HitgroupRecord>> {
    expect_kind(group, ProgramGroupKind::Hitgroup)?;

    if meshes.len() != geometry_order.len() {
        return Err(RenderError::InvalidBuildInput(format!(
            "{} meshes for an acceleration structure with {} geometries",
            meshes.len(),
            geometry_order.len()
        )));
    }

    meshes
        .iter()
        .zip(geometry_order)
        .enumerate()
        .map(|(i, (mesh, geometry))| {
            if mesh.vertex.address() != geometry.vertex_address || mesh.index.address() != geometry.index_address {
                return Err(RenderError::InvalidBuildInput(format!(
                    "mesh {i} does not match geometry {i} of the acceleration structure"
                )));
            }
            let texture = mesh.texture.unwrap_or(TextureHandle::NONE);
            Ok(HitgroupRecord {
                header: record_header(group),
                data: TriangleMeshSbtData {
                    color: mesh.color.to_array(),
                    has_texture: u32::from(!texture.is_none()),
                    texture: texture.address(),
                    _padding0: 0,
                    vertex: mesh.vertex.view(),
                    normal: mesh.normal.view(),
                    texcoord: mesh.texcoord.view(),
                    index: mesh.index.view(),
                    _padding1: [0; 2],
                },
            })
        })
        .collect()
}

/// Device-resident raygen, miss and hit-group tables
pub struct ShaderBindingTable {
    raygen: DeviceBuffer<RaygenRecord>,
    miss: DeviceBuffer<MissRecord>,
    hitgroup: DeviceBuffer<HitgroupRecord>,
}

impl ShaderBindingTable {
    pub fn build(
        heap: &Arc<DeviceHeap>,
        groups: &ProgramGroupSet,
        geometry_order: &[GeometryBinding],
        meshes: &[MeshBinding],
    ) -> RenderResult<Self> {
        let raygen_group = groups
            .raygen()
            .first()
            .ok_or_else(|| RenderError::InvalidBuildInput("no ray generation program group".into()))?;
        let hitgroup = groups
            .hitgroup()
            .first()
            .ok_or_else(|| RenderError::InvalidBuildInput("no hit program group".into()))?;

        let raygen_records = [raygen_record(raygen_group)?];
        let miss_records = groups.miss().iter().map(miss_record).collect::<RenderResult<Vec<_>>>()?;
        let hitgroup_records = build_hitgroup_records(hitgroup, meshes, geometry_order)?;
        debug!(
            "SBT records: 1 raygen, {} miss, {} hitgroup",
            miss_records.len(),
            hitgroup_records.len()
        );

        let sbt = Self {
            raygen: DeviceBuffer::alloc_and_upload(heap, &raygen_records)?,
            miss: DeviceBuffer::alloc_and_upload(heap, &miss_records)?,
            hitgroup: DeviceBuffer::alloc_and_upload(heap, &hitgroup_records)?,
        };
        info!("Built shader binding table for {} meshes", hitgroup_records.len());
        Ok(sbt)
    }

    pub fn layout(&self) -> SbtLayout {
        SbtLayout {
            raygen_record: self.raygen.address(),
            miss_record_base: self.miss.address(),
            miss_record_stride: std::mem::size_of::<MissRecord>() as u32,
            miss_record_count: self.miss.len() as u32,
            hitgroup_record_base: self.hitgroup.address(),
            hitgroup_record_stride: std::mem::size_of::<HitgroupRecord>() as u32,
            hitgroup_record_count: self.hitgroup.len() as u32,
        }
    }

    pub fn hitgroup_count(&self) -> usize {
        self.hitgroup.len()
    }

    /// Read the hit-group table back from the device
    pub fn download_hitgroup_records(&self) -> RenderResult<Vec<HitgroupRecord>> {
        self.hitgroup.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgramNames;
    use crate::pipeline::{Module, ModuleSource};
    use rt_shared::RaytracerConfig;

    fn groups() -> ProgramGroupSet {
        let module = Module::create(ModuleSource::default_programs()).unwrap();
        let names = ProgramNames::default();
        let mut groups = ProgramGroupSet::new();
        groups.create_raygen_programs(&module, &names).unwrap();
        groups.create_miss_programs(&module, &names).unwrap();
        groups.create_hitgroup_programs(&module, &names).unwrap();
        groups
    }

    fn mesh(base: u32, triangles: u32, texture: Option<TextureHandle>) -> MeshBinding {
        MeshBinding {
            color: Vec3::new(1.0, 0.5, 0.25),
            texture,
            vertex: DevicePtr::from_raw(base, 3 * triangles),
            normal: DevicePtr::null(),
            texcoord: DevicePtr::from_raw(base + 0x100, 3 * triangles),
            index: DevicePtr::from_raw(base + 0x200, triangles),
        }
    }

    fn geometry(mesh: &MeshBinding) -> GeometryBinding {
        GeometryBinding {
            vertex_address: mesh.vertex.address(),
            index_address: mesh.index.address(),
            triangle_count: mesh.index.count(),
        }
    }

    #[test]
    fn one_record_per_mesh_in_order() {
        let groups = groups();
        let meshes = [mesh(0x1000, 1, None), mesh(0x2000, 4, Some(TextureHandle::from_address(0x40)))];
        let order: Vec<_> = meshes.iter().map(geometry).collect();

        let records = build_hitgroup_records(&groups.hitgroup()[0], &meshes, &order).unwrap();
        assert_eq!(records.len(), 2);
        for (record, mesh) in records.iter().zip(&meshes) {
            assert_eq!(record.header.program_group, groups.hitgroup()[0].id());
            assert_eq!(record.header.kind, ProgramGroupKind::Hitgroup.record_kind());
            assert_eq!(record.data.vertex, mesh.vertex.view());
            assert_eq!(record.data.index, mesh.index.view());
            assert_eq!(record.data.texcoord, mesh.texcoord.view());
            assert!(record.data.normal.is_null());
        }
        assert_eq!(records[0].data.has_texture, 0);
        assert_eq!(records[0].data.texture, 0);
        assert_eq!(records[1].data.has_texture, 1);
        assert_eq!(records[1].data.texture, 0x40);
        assert_eq!(records[1].data.color, [1.0, 0.5, 0.25]);
    }

    #[test]
    fn reordered_meshes_are_rejected() {
        let groups = groups();
        let meshes = [mesh(0x1000, 1, None), mesh(0x2000, 1, None)];
        let order: Vec<_> = meshes.iter().rev().map(geometry).collect();

        let err = build_hitgroup_records(&groups.hitgroup()[0], &meshes, &order).unwrap_err();
        assert!(matches!(err, RenderError::InvalidBuildInput(_)));
    }

    #[test]
    fn mesh_count_must_match_geometry_count() {
        let groups = groups();
        let meshes = [mesh(0x1000, 1, None)];
        assert!(build_hitgroup_records(&groups.hitgroup()[0], &meshes, &[]).is_err());
    }

    #[test]
    fn records_require_matching_group_kind() {
        let groups = groups();
        assert!(raygen_record(&groups.raygen()[0]).is_ok());
        assert!(miss_record(&groups.raygen()[0]).is_err());
        assert!(build_hitgroup_records(&groups.miss()[0], &[], &[]).is_err());
    }

    #[test]
    fn record_strides_are_aligned() {
        assert_eq!(std::mem::size_of::<RaygenRecord>() % RaytracerConfig::SBT_RECORD_ALIGNMENT, 0);
        assert_eq!(std::mem::size_of::<MissRecord>() % RaytracerConfig::SBT_RECORD_ALIGNMENT, 0);
        assert_eq!(std::mem::size_of::<HitgroupRecord>() % RaytracerConfig::SBT_RECORD_ALIGNMENT, 0);
    }
}
