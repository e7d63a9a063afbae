//! Renderer construction and the per-frame protocol.
//!
//! Construction runs context -> module -> program groups -> acceleration
//! structure -> pipeline -> textures -> shader binding table. Each step of
//! [`RendererBuilder`] consumes the previous stage, so the order is fixed at
//! compile time and a failed step leaves nothing usable behind.

use std::sync::Arc;

use glam::{Vec2, Vec3};
use log::{debug, info};
use rt_shared::LaunchParams;

use crate::accel::{Accel, TriangleBuildInput};
use crate::buffers::{DeviceBuffer, DeviceHeap};
use crate::camera::Camera;
use crate::compute::{ComputeLauncher, LaunchRequest};
use crate::config::RendererConfig;
use crate::context::GpuContext;
use crate::error::{RenderError, RenderResult};
use crate::frame::{FrameState, FrameStatus};
use crate::pipeline::{Module, ModuleSource, Pipeline, ProgramGroupSet};
use crate::sbt::{MeshBinding, ShaderBindingTable};
use crate::scene::{Model, TriangleMesh};
use crate::texture::{upload_textures, TextureObject};

/// Device copies of one mesh's arrays
pub struct MeshBuffers {
    pub vertex: DeviceBuffer<Vec3>,
    pub normal: DeviceBuffer<Vec3>,
    pub texcoord: DeviceBuffer<Vec2>,
    pub index: DeviceBuffer<[u32; 3]>,
}

impl MeshBuffers {
    pub fn upload(heap: &Arc<DeviceHeap>, mesh: &TriangleMesh) -> RenderResult<Self> {
        Ok(Self {
            vertex: DeviceBuffer::alloc_and_upload(heap, &mesh.vertices)?,
            normal: DeviceBuffer::alloc_and_upload(heap, &mesh.normals)?,
            texcoord: DeviceBuffer::alloc_and_upload(heap, &mesh.texcoords)?,
            index: DeviceBuffer::alloc_and_upload(heap, &mesh.indices)?,
        })
    }
}

pub struct ContextStage;

pub struct ModuleStage {
    module: Module,
}

pub struct ProgramGroupStage {
    module: Module,
    groups: ProgramGroupSet,
}

pub struct AccelStage<'m> {
    module: Module,
    groups: ProgramGroupSet,
    model: &'m Model,
    meshes: Vec<MeshBuffers>,
    accel: Accel,
}

pub struct PipelineStage<'m> {
    groups: ProgramGroupSet,
    model: &'m Model,
    meshes: Vec<MeshBuffers>,
    accel: Accel,
    pipeline: Pipeline,
}

pub struct TextureStage<'m> {
    groups: ProgramGroupSet,
    model: &'m Model,
    meshes: Vec<MeshBuffers>,
    accel: Accel,
    pipeline: Pipeline,
    textures: Vec<TextureObject>,
}

/// Type-state builder for [`Renderer`]
pub struct RendererBuilder<S> {
    context: Arc<GpuContext>,
    heap: Arc<DeviceHeap>,
    config: RendererConfig,
    stage: S,
}

impl<S> RendererBuilder<S> {
    fn advance<T>(self, stage: T) -> RendererBuilder<T> {
        RendererBuilder { context: self.context, heap: self.heap, config: self.config, stage }
    }

    pub fn heap(&self) -> &Arc<DeviceHeap> {
        &self.heap
    }
}

impl RendererBuilder<ContextStage> {
    /// Reserve the device heap every later allocation comes from
    pub fn new(context: Arc<GpuContext>, config: RendererConfig) -> RenderResult<Self> {
        let heap = DeviceHeap::new(context.clone(), config.heap_size)?;
        Ok(Self { context, heap, config, stage: ContextStage })
    }

    pub fn create_module(self, source: ModuleSource) -> RenderResult<RendererBuilder<ModuleStage>> {
        let module = Module::create(source)?;
        Ok(self.advance(ModuleStage { module }))
    }
}

impl RendererBuilder<ModuleStage> {
    /// One raygen, one miss and one hit group bound to the configured entry points
    pub fn create_program_groups(self) -> RenderResult<RendererBuilder<ProgramGroupStage>> {
        let ModuleStage { module } = &self.stage;
        let names = &self.config.programs;
        let mut groups = ProgramGroupSet::new();
        groups.create_raygen_programs(module, names)?;
        groups.create_miss_programs(module, names)?;
        groups.create_hitgroup_programs(module, names)?;

        let ModuleStage { module } = self.stage;
        let stage = ProgramGroupStage { module, groups };
        Ok(RendererBuilder { context: self.context, heap: self.heap, config: self.config, stage })
    }
}

impl RendererBuilder<ProgramGroupStage> {
    /// Upload every mesh and build one compacted structure over all of them
    pub fn build_accel(self, model: &Model) -> RenderResult<RendererBuilder<AccelStage<'_>>> {
        let meshes = model
            .meshes()
            .iter()
            .map(|mesh| MeshBuffers::upload(&self.heap, mesh))
            .collect::<RenderResult<Vec<_>>>()?;

        let inputs: Vec<TriangleBuildInput> = model
            .meshes()
            .iter()
            .zip(&meshes)
            .map(|(mesh, buffers)| TriangleBuildInput {
                vertices: &mesh.vertices,
                indices: &mesh.indices,
                vertex_buffer: buffers.vertex.device_ptr(),
                index_buffer: buffers.index.device_ptr(),
                vertex_stride: std::mem::size_of::<Vec3>() as u32,
                flags: mesh.flags,
            })
            .collect();
        let accel = Accel::build(&self.heap, &inputs)?;

        let ProgramGroupStage { module, groups } = self.stage;
        let stage = AccelStage { module, groups, model, meshes, accel };
        Ok(RendererBuilder { context: self.context, heap: self.heap, config: self.config, stage })
    }
}

impl<'m> RendererBuilder<AccelStage<'m>> {
    pub fn create_pipeline(self) -> RenderResult<RendererBuilder<PipelineStage<'m>>> {
        let AccelStage { module, groups, model, meshes, accel } = self.stage;
        let pipeline = Pipeline::create(
            &self.heap,
            &module,
            &groups,
            &self.config.stack_sizes,
            &self.config.link_options,
        )?;
        let stage = PipelineStage { groups, model, meshes, accel, pipeline };
        Ok(RendererBuilder { context: self.context, heap: self.heap, config: self.config, stage })
    }
}

impl<'m> RendererBuilder<PipelineStage<'m>> {
    pub fn create_textures(self) -> RenderResult<RendererBuilder<TextureStage<'m>>> {
        let PipelineStage { groups, model, meshes, accel, pipeline } = self.stage;
        let textures = upload_textures(&self.heap, model.textures())?;
        let stage = TextureStage { groups, model, meshes, accel, pipeline, textures };
        Ok(RendererBuilder { context: self.context, heap: self.heap, config: self.config, stage })
    }
}

impl<'m> RendererBuilder<TextureStage<'m>> {
    /// Build the shader binding table and finish construction
    pub fn build_sbt(self) -> RenderResult<Renderer<'m>> {
        let TextureStage { groups, model, meshes, accel, pipeline, textures } = self.stage;

        let bindings = model
            .meshes()
            .iter()
            .zip(&meshes)
            .enumerate()
            .map(|(i, (mesh, buffers))| -> RenderResult<MeshBinding> {
                let texture = match mesh.material.diffuse_texture {
                    Some(id) => Some(
                        textures
                            .get(id.0 as usize)
                            .ok_or_else(|| {
                                RenderError::InvalidBuildInput(format!("mesh {i} references missing texture {}", id.0))
                            })?
                            .handle(),
                    ),
                    None => None,
                };
                Ok(MeshBinding {
                    color: mesh.material.diffuse,
                    texture,
                    vertex: buffers.vertex.device_ptr(),
                    normal: buffers.normal.device_ptr(),
                    texcoord: buffers.texcoord.device_ptr(),
                    index: buffers.index.device_ptr(),
                })
            })
            .collect::<RenderResult<Vec<_>>>()?;

        let sbt = ShaderBindingTable::build(&self.heap, &groups, accel.geometries(), &bindings)?;
        let params = DeviceBuffer::with_len(&self.heap, 1)?;
        let frame = FrameState::new(accel.handle());

        info!(
            "Renderer ready: {} meshes, {} textures, heap {} of {} bytes used",
            meshes.len(),
            textures.len(),
            self.heap.used_bytes(),
            self.heap.capacity()
        );

        Ok(Renderer {
            context: self.context,
            heap: self.heap.clone(),
            model,
            groups,
            meshes,
            accel,
            pipeline,
            textures,
            sbt,
            params,
            color_buffer: DeviceBuffer::new(&self.heap),
            accum_buffer: DeviceBuffer::new(&self.heap),
            frame,
        })
    }
}

/// Owns every device resource of a scene; the model is only borrowed.
pub struct Renderer<'m> {
    context: Arc<GpuContext>,
    heap: Arc<DeviceHeap>,
    model: &'m Model,
    groups: ProgramGroupSet,
    meshes: Vec<MeshBuffers>,
    accel: Accel,
    pipeline: Pipeline,
    textures: Vec<TextureObject>,
    sbt: ShaderBindingTable,
    params: DeviceBuffer<LaunchParams>,
    color_buffer: DeviceBuffer<u32>,
    accum_buffer: DeviceBuffer<[f32; 4]>,
    frame: FrameState,
}

impl<'m> Renderer<'m> {
    /// Full construction sequence with the built-in device programs
    pub fn new(context: Arc<GpuContext>, model: &'m Model, config: RendererConfig) -> RenderResult<Self> {
        Self::with_module_source(context, model, config, ModuleSource::default_programs())
    }

    pub fn with_module_source(
        context: Arc<GpuContext>,
        model: &'m Model,
        config: RendererConfig,
        source: ModuleSource,
    ) -> RenderResult<Self> {
        RendererBuilder::new(context, config)?
            .create_module(source)?
            .create_program_groups()?
            .build_accel(model)?
            .create_pipeline()?
            .create_textures()?
            .build_sbt()
    }

    /// Reallocate the framebuffer; a zero dimension leaves everything unchanged.
    /// Both new buffers are allocated before the old ones are released, so a
    /// failed resize keeps the previous framebuffer and launch parameters.
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let pixels = width as usize * height as usize;
        let color_buffer = DeviceBuffer::with_len(&self.heap, pixels)?;
        let accum_buffer = DeviceBuffer::with_len(&self.heap, pixels)?;

        self.color_buffer = color_buffer;
        self.accum_buffer = accum_buffer;
        self.frame.resize(width, height);
        self.frame
            .set_buffers(self.color_buffer.device_ptr().view(), self.accum_buffer.device_ptr().view());
        debug!("Framebuffer resized to {width}x{height}");
        Ok(())
    }

    pub fn set_camera(&mut self, camera: &Camera) {
        self.frame.set_camera(*camera);
    }

    /// Launch one frame and wait for it; does nothing while no framebuffer exists
    pub fn render(&mut self) -> RenderResult<()> {
        let Some(params) = self.frame.next_launch() else {
            return Ok(());
        };
        self.params.upload(&[params]);

        let (width, height) = self.frame.fb_size();
        let request = LaunchRequest {
            params_address: self.params.address(),
            width,
            height,
            depth: 1,
            sbt: self.sbt.layout(),
        };
        ComputeLauncher::launch(&self.pipeline, &request)?;
        self.frame.finish_frame();
        Ok(())
    }

    /// Copy width x height packed RGBA8 pixels (rows bottom-up) into `pixels`
    pub fn download_pixels(&self, pixels: &mut [u32]) -> RenderResult<()> {
        let count = self.frame.pixel_count();
        assert!(
            pixels.len() >= count,
            "pixel buffer holds {} pixels, framebuffer has {}",
            pixels.len(),
            count
        );
        if count == 0 {
            return Ok(());
        }
        self.color_buffer.download(&mut pixels[..count])
    }

    pub fn frame_id(&self) -> u32 {
        self.frame.frame_id()
    }

    pub fn fb_size(&self) -> (u32, u32) {
        self.frame.fb_size()
    }

    pub fn status(&self) -> FrameStatus {
        self.frame.status()
    }

    pub fn launch_params(&self) -> &LaunchParams {
        self.frame.params()
    }

    pub fn model(&self) -> &'m Model {
        self.model
    }

    pub fn accel(&self) -> &Accel {
        &self.accel
    }

    pub fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }

    pub fn program_groups(&self) -> &ProgramGroupSet {
        &self.groups
    }

    pub fn mesh_buffers(&self) -> &[MeshBuffers] {
        &self.meshes
    }

    pub fn textures(&self) -> &[TextureObject] {
        &self.textures
    }

    pub fn heap(&self) -> &Arc<DeviceHeap> {
        &self.heap
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }
}
