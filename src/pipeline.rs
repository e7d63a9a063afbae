//! Device program modules, program groups and pipeline linking.
//!
//! A pipeline is one compute shader composed from three pieces: the device
//! runtime, the user's program module and a generated link section that
//! routes program-group ids to entry points and defines the launch kernel.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use log::{debug, info};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use rt_shared::{BvhNode, LaunchDescriptor, RaytracerConfig, TriangleRecord};

use crate::accel::GeometryFlags;
use crate::buffers::DeviceHeap;
use crate::config::{PipelineLinkOptions, ProgramNames, StackSizes};
use crate::error::{RenderError, RenderResult};

pub const RUNTIME_SOURCE: &str = include_str!("shaders/runtime.wgsl");
pub const DEFAULT_PROGRAMS_SOURCE: &str = include_str!("shaders/device_programs.wgsl");

/// Name of the compute entry point the link section generates
pub const LAUNCH_KERNEL: &str = "launch_kernel";

/// WGSL source of a device program module
#[derive(Clone, Debug)]
pub struct ModuleSource {
    pub label: String,
    pub wgsl: String,
}

impl ModuleSource {
    pub fn wgsl(label: impl Into<String>, wgsl: impl Into<String>) -> Self {
        Self { label: label.into(), wgsl: wgsl.into() }
    }

    /// The built-in ray generation, miss, closest-hit and any-hit programs
    pub fn default_programs() -> Self {
        Self::wgsl("device_programs.wgsl", DEFAULT_PROGRAMS_SOURCE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResultKind {
    None,
    Bool,
    Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FunctionSignature {
    arguments: usize,
    result: ResultKind,
}

/// Parse and validate a complete WGSL shader
fn validate_wgsl(source: &str) -> RenderResult<naga::Module> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| RenderError::CompileFailure(e.emit_to_string(source)))?;
    Validator::new(ValidationFlags::all(), Capabilities::empty())
        .validate(&module)
        .map_err(|e| RenderError::CompileFailure(format!("{e:?}")))?;
    Ok(module)
}

/// A validated device program module and its function table
#[derive(Debug)]
pub struct Module {
    source: ModuleSource,
    functions: HashMap<String, FunctionSignature>,
}

impl Module {
    /// Compile `source` against the runtime and an empty link section.
    pub fn create(source: ModuleSource) -> RenderResult<Self> {
        let composed = compose(&source.wgsl, &link_source(&ProgramGroupSet::new(), &StackSizes::default()));
        let module = validate_wgsl(&composed)?;

        let functions = module
            .functions
            .iter()
            .filter_map(|(_, function)| {
                let name = function.name.clone()?;
                let result = match &function.result {
                    None => ResultKind::None,
                    Some(result) => match module.types[result.ty].inner {
                        naga::TypeInner::Scalar { kind: naga::ScalarKind::Bool, .. } => ResultKind::Bool,
                        _ => ResultKind::Value,
                    },
                };
                Some((name, FunctionSignature { arguments: function.arguments.len(), result }))
            })
            .collect::<HashMap<_, _>>();

        info!("Created module {} ({} functions)", source.label, functions.len());
        Ok(Self { source, functions })
    }

    pub fn label(&self) -> &str {
        &self.source.label
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn check_entry(&self, name: &str, role: ProgramRole) -> RenderResult<()> {
        let missing = || RenderError::MissingEntryPoint {
            name: name.to_string(),
            kind: role.group_kind().as_str(),
        };
        if !name.starts_with(role.prefix()) {
            return Err(missing());
        }
        let signature = self.functions.get(name).ok_or_else(missing)?;
        if *signature != role.signature() {
            return Err(RenderError::CompileFailure(format!(
                "entry point `{name}` has the wrong signature for a {} program",
                role.prefix().trim_end_matches('_')
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProgramRole {
    Raygen,
    Miss,
    ClosestHit,
    AnyHit,
}

impl ProgramRole {
    fn prefix(self) -> &'static str {
        match self {
            ProgramRole::Raygen => "raygen_",
            ProgramRole::Miss => "miss_",
            ProgramRole::ClosestHit => "closesthit_",
            ProgramRole::AnyHit => "anyhit_",
        }
    }

    fn signature(self) -> FunctionSignature {
        match self {
            ProgramRole::Raygen => FunctionSignature { arguments: 1, result: ResultKind::None },
            ProgramRole::Miss | ProgramRole::ClosestHit => FunctionSignature { arguments: 2, result: ResultKind::Value },
            ProgramRole::AnyHit => FunctionSignature { arguments: 2, result: ResultKind::Bool },
        }
    }

    fn group_kind(self) -> ProgramGroupKind {
        match self {
            ProgramRole::Raygen => ProgramGroupKind::Raygen,
            ProgramRole::Miss => ProgramGroupKind::Miss,
            ProgramRole::ClosestHit | ProgramRole::AnyHit => ProgramGroupKind::Hitgroup,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgramGroupKind {
    Raygen,
    Miss,
    Hitgroup,
}

impl ProgramGroupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgramGroupKind::Raygen => "raygen",
            ProgramGroupKind::Miss => "miss",
            ProgramGroupKind::Hitgroup => "hitgroup",
        }
    }

    /// Value stored in the `kind` field of SBT record headers
    pub fn record_kind(self) -> u32 {
        match self {
            ProgramGroupKind::Raygen => 1,
            ProgramGroupKind::Miss => 2,
            ProgramGroupKind::Hitgroup => 3,
        }
    }
}

/// Entry points bound by one program group
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgramGroupDesc {
    Raygen { entry: String },
    Miss { entry: String },
    Hitgroup { closest_hit: Option<String>, any_hit: Option<String> },
}

impl ProgramGroupDesc {
    pub fn kind(&self) -> ProgramGroupKind {
        match self {
            ProgramGroupDesc::Raygen { .. } => ProgramGroupKind::Raygen,
            ProgramGroupDesc::Miss { .. } => ProgramGroupKind::Miss,
            ProgramGroupDesc::Hitgroup { .. } => ProgramGroupKind::Hitgroup,
        }
    }
}

/// Opaque compiled program handle; the id is what SBT record headers carry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramGroup {
    id: u32,
    desc: ProgramGroupDesc,
}

impl ProgramGroup {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> ProgramGroupKind {
        self.desc.kind()
    }

    pub fn desc(&self) -> &ProgramGroupDesc {
        &self.desc
    }
}

/// The three disjoint program group collections of a pipeline
#[derive(Debug, Default)]
pub struct ProgramGroupSet {
    raygen: Vec<ProgramGroup>,
    miss: Vec<ProgramGroup>,
    hitgroup: Vec<ProgramGroup>,
}

impl ProgramGroupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the entry points of `desc` against `module` and add the group
    pub fn create(&mut self, module: &Module, desc: ProgramGroupDesc) -> RenderResult<&ProgramGroup> {
        match &desc {
            ProgramGroupDesc::Raygen { entry } => module.check_entry(entry, ProgramRole::Raygen)?,
            ProgramGroupDesc::Miss { entry } => module.check_entry(entry, ProgramRole::Miss)?,
            ProgramGroupDesc::Hitgroup { closest_hit, any_hit } => {
                if let Some(entry) = closest_hit {
                    module.check_entry(entry, ProgramRole::ClosestHit)?;
                }
                if let Some(entry) = any_hit {
                    module.check_entry(entry, ProgramRole::AnyHit)?;
                }
            }
        }

        // Ids start at 1 so a zeroed record header never dispatches
        let id = (self.len() + 1) as u32;
        let collection = match desc.kind() {
            ProgramGroupKind::Raygen => &mut self.raygen,
            ProgramGroupKind::Miss => &mut self.miss,
            ProgramGroupKind::Hitgroup => &mut self.hitgroup,
        };
        debug!("Program group {id}: {desc:?}");
        let index = collection.len();
        collection.push(ProgramGroup { id, desc });
        Ok(&collection[index])
    }

    pub fn create_raygen_programs(&mut self, module: &Module, names: &ProgramNames) -> RenderResult<()> {
        self.create(module, ProgramGroupDesc::Raygen { entry: names.raygen.clone() })?;
        Ok(())
    }

    pub fn create_miss_programs(&mut self, module: &Module, names: &ProgramNames) -> RenderResult<()> {
        self.create(module, ProgramGroupDesc::Miss { entry: names.miss.clone() })?;
        Ok(())
    }

    pub fn create_hitgroup_programs(&mut self, module: &Module, names: &ProgramNames) -> RenderResult<()> {
        self.create(
            module,
            ProgramGroupDesc::Hitgroup {
                closest_hit: Some(names.closest_hit.clone()),
                any_hit: Some(names.any_hit.clone()),
            },
        )?;
        Ok(())
    }

    pub fn raygen(&self) -> &[ProgramGroup] {
        &self.raygen
    }

    pub fn miss(&self) -> &[ProgramGroup] {
        &self.miss
    }

    pub fn hitgroup(&self) -> &[ProgramGroup] {
        &self.hitgroup
    }

    /// All groups in pipeline order: raygen, miss, hitgroup
    pub fn iter(&self) -> impl Iterator<Item = &ProgramGroup> {
        self.raygen.iter().chain(self.miss.iter()).chain(self.hitgroup.iter())
    }

    pub fn len(&self) -> usize {
        self.raygen.len() + self.miss.len() + self.hitgroup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn compose(user: &str, link: &str) -> String {
    let mut source = String::with_capacity(RUNTIME_SOURCE.len() + user.len() + link.len() + 64);
    source.push_str(RUNTIME_SOURCE);
    source.push_str("\n// ---- program module ----\n");
    source.push_str(user);
    source.push_str("\n// ---- link section ----\n");
    source.push_str(link);
    source
}

/// Generate layout constants, dispatch functions and the launch kernel
pub fn link_source(groups: &ProgramGroupSet, stack: &StackSizes) -> String {
    let stack_entries = stack.traversal_stack_entries();
    let mut out = String::new();

    out.push_str(&format!(
        "const SBT_RECORD_HEADER_SIZE: u32 = {}u;\n\
         const BVH_NODE_SIZE: u32 = {}u;\n\
         const TRIANGLE_RECORD_SIZE: u32 = {}u;\n\
         const TRAVERSAL_STACK_SIZE: u32 = {stack_entries}u;\n\
         const INVALID_INDEX: u32 = {}u;\n\
         const GEOMETRY_FLAG_DISABLE_ANYHIT: u32 = {}u;\n\n\
         var<private> traversal_stack: array<u32, {stack_entries}>;\n\n",
        RaytracerConfig::SBT_RECORD_HEADER_SIZE,
        std::mem::size_of::<BvhNode>(),
        std::mem::size_of::<TriangleRecord>(),
        RaytracerConfig::INVALID_INDEX,
        GeometryFlags::DISABLE_ANYHIT.bits(),
    ));

    let mut raygen_cases = String::new();
    for group in groups.raygen() {
        if let ProgramGroupDesc::Raygen { entry } = group.desc() {
            raygen_cases.push_str(&format!("        case {}u: {{ {entry}(launch_index); }}\n", group.id()));
        }
    }
    out.push_str(&format!(
        "fn dispatch_raygen(program_group: u32, launch_index: vec2<u32>) {{\n    \
             switch program_group {{\n{raygen_cases}        default: {{}}\n    }}\n}}\n\n"
    ));

    let mut miss_cases = String::new();
    for group in groups.miss() {
        if let ProgramGroupDesc::Miss { entry } = group.desc() {
            miss_cases.push_str(&format!("        case {}u: {{ result = {entry}(ray, payload); }}\n", group.id()));
        }
    }
    out.push_str(&format!(
        "fn dispatch_miss(program_group: u32, ray: Ray, payload: RayPayload) -> RayPayload {{\n    \
             var result = payload;\n    \
             switch program_group {{\n{miss_cases}        default: {{}}\n    }}\n    \
             return result;\n}}\n\n"
    ));

    let mut closest_cases = String::new();
    let mut any_cases = String::new();
    for group in groups.hitgroup() {
        if let ProgramGroupDesc::Hitgroup { closest_hit, any_hit } = group.desc() {
            if let Some(entry) = closest_hit {
                closest_cases.push_str(&format!("        case {}u: {{ result = {entry}(hit, payload); }}\n", group.id()));
            }
            if let Some(entry) = any_hit {
                any_cases.push_str(&format!("        case {}u: {{ accept = {entry}(hit, payload); }}\n", group.id()));
            }
        }
    }
    out.push_str(&format!(
        "fn dispatch_closesthit(program_group: u32, hit: HitInfo, payload: RayPayload) -> RayPayload {{\n    \
             var result = payload;\n    \
             switch program_group {{\n{closest_cases}        default: {{}}\n    }}\n    \
             return result;\n}}\n\n"
    ));
    out.push_str(&format!(
        "fn dispatch_anyhit(program_group: u32, hit: HitInfo, payload: RayPayload) -> bool {{\n    \
             var accept = true;\n    \
             switch program_group {{\n{any_cases}        default: {{}}\n    }}\n    \
             return accept;\n}}\n\n"
    ));

    let (wg_x, wg_y) = RaytracerConfig::WORKGROUP_SIZE;
    out.push_str(&format!(
        "@compute @workgroup_size({wg_x}, {wg_y}, 1)\n\
         fn {LAUNCH_KERNEL}(@builtin(global_invocation_id) id: vec3<u32>) {{\n    \
             if (id.x >= launch.width || id.y >= launch.height) {{\n        return;\n    }}\n    \
             dispatch_raygen(load_u32(launch.raygen_record), id.xy);\n}}\n"
    ));

    out
}

/// Linked compute pipeline plus the bindings every launch uses
pub struct Pipeline {
    heap: Arc<DeviceHeap>,
    compute_pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    launch_buffer: wgpu::Buffer,
}

impl Pipeline {
    pub fn create(
        heap: &Arc<DeviceHeap>,
        module: &Module,
        groups: &ProgramGroupSet,
        stack: &StackSizes,
        link_options: &PipelineLinkOptions,
    ) -> RenderResult<Self> {
        if link_options.max_trace_depth != 1 || stack.max_traversable_graph_depth != 1 {
            return Err(RenderError::CompileFailure(format!(
                "unsupported trace depth {} / traversable graph depth {}: only single-level tracing links",
                link_options.max_trace_depth, stack.max_traversable_graph_depth
            )));
        }
        if groups.raygen().is_empty() {
            return Err(RenderError::CompileFailure("pipeline has no ray generation program group".into()));
        }

        let source = compose(&module.source.wgsl, &link_source(groups, stack));
        validate_wgsl(&source)?;

        let context = heap.context();
        let device = &context.device;

        let ((compute_pipeline, bind_group_layout), error) = context.capture_errors(|| {
            let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Ray Tracing Pipeline Module"),
                source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
            });

            let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Ray Tracing Bind Group Layout"),
                entries: &[
                    // Binding 0: device heap
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: false },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    // Binding 1: launch descriptor
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: NonZeroU64::new(std::mem::size_of::<LaunchDescriptor>() as u64),
                        },
                        count: None,
                    },
                ],
            });

            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Ray Tracing Pipeline Layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

            let compute_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Ray Tracing Pipeline"),
                layout: Some(&pipeline_layout),
                module: &shader_module,
                entry_point: LAUNCH_KERNEL,
            });

            (compute_pipeline, bind_group_layout)
        });
        if let Some(error) = error {
            return Err(RenderError::CompileFailure(format!("pipeline creation failed: {error}")));
        }

        let launch_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Launch Descriptor Buffer"),
            size: std::mem::size_of::<LaunchDescriptor>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Ray Tracing Bind Group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: heap.buffer().as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: launch_buffer.as_entire_binding() },
            ],
        });

        info!(
            "Linked pipeline from {} program groups (traversal stack {} entries, continuation {} B, direct callable {}/{} B)",
            groups.len(),
            stack.traversal_stack_entries(),
            stack.continuation,
            stack.direct_callable_from_traversal,
            stack.direct_callable_from_state
        );

        Ok(Self {
            heap: heap.clone(),
            compute_pipeline,
            bind_group,
            launch_buffer,
        })
    }

    pub fn heap(&self) -> &Arc<DeviceHeap> {
        &self.heap
    }

    pub fn compute_pipeline(&self) -> &wgpu::ComputePipeline {
        &self.compute_pipeline
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }

    pub fn launch_buffer(&self) -> &wgpu::Buffer {
        &self.launch_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_groups(module: &Module) -> ProgramGroupSet {
        let names = ProgramNames::default();
        let mut groups = ProgramGroupSet::new();
        groups.create_raygen_programs(module, &names).unwrap();
        groups.create_miss_programs(module, &names).unwrap();
        groups.create_hitgroup_programs(module, &names).unwrap();
        groups
    }

    #[test]
    fn default_programs_validate() {
        let module = Module::create(ModuleSource::default_programs()).unwrap();
        for name in ["raygen_render_frame", "miss_radiance", "closesthit_radiance", "anyhit_radiance"] {
            assert!(module.has_function(name), "{name} missing");
        }
    }

    #[test]
    fn linked_default_pipeline_validates() {
        let module = Module::create(ModuleSource::default_programs()).unwrap();
        let groups = default_groups(&module);
        assert_eq!(groups.len(), 3);

        let source = compose(DEFAULT_PROGRAMS_SOURCE, &link_source(&groups, &StackSizes::default()));
        let linked = validate_wgsl(&source).unwrap();
        assert!(linked.entry_points.iter().any(|ep| ep.name == LAUNCH_KERNEL));
    }

    #[test]
    fn group_ids_are_unique_and_nonzero() {
        let module = Module::create(ModuleSource::default_programs()).unwrap();
        let groups = default_groups(&module);
        let ids: Vec<u32> = groups.iter().map(|g| g.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(groups.hitgroup()[0].kind(), ProgramGroupKind::Hitgroup);
    }

    #[test]
    fn missing_entry_point_is_reported() {
        let module = Module::create(ModuleSource::default_programs()).unwrap();
        let mut groups = ProgramGroupSet::new();
        let err = groups
            .create(&module, ProgramGroupDesc::Miss { entry: "miss_shadow".into() })
            .unwrap_err();
        assert!(matches!(err, RenderError::MissingEntryPoint { kind: "miss", .. }));
        assert!(groups.is_empty());
    }

    #[test]
    fn entry_without_role_prefix_is_rejected() {
        let module = Module::create(ModuleSource::default_programs()).unwrap();
        let mut groups = ProgramGroupSet::new();
        let err = groups
            .create(&module, ProgramGroupDesc::Raygen { entry: "trace".into() })
            .unwrap_err();
        assert!(matches!(err, RenderError::MissingEntryPoint { .. }));
    }

    #[test]
    fn wrong_signature_is_a_compile_failure() {
        let module = Module::create(ModuleSource::default_programs()).unwrap();
        let mut groups = ProgramGroupSet::new();
        let err = groups
            .create(
                &module,
                ProgramGroupDesc::Hitgroup { closest_hit: None, any_hit: Some("closesthit_radiance".into()) },
            )
            .unwrap_err();
        assert!(matches!(err, RenderError::MissingEntryPoint { .. } | RenderError::CompileFailure(_)));
    }

    #[test]
    fn malformed_module_fails_to_compile() {
        let err = Module::create(ModuleSource::wgsl("broken", "fn raygen_broken( {")).unwrap_err();
        assert!(matches!(err, RenderError::CompileFailure(_)));
    }

    #[test]
    fn recursive_trace_fails_to_link() {
        let recursive = DEFAULT_PROGRAMS_SOURCE.replace(
            "    let facing = abs(dot(normal, hit.ray.direction));",
            "    let again = trace(launch.params, hit.ray, 0u, payload);\n    let facing = abs(dot(normal, hit.ray.direction));",
        );
        assert_ne!(recursive, DEFAULT_PROGRAMS_SOURCE);
        let result = Module::create(ModuleSource::wgsl("recursive", recursive)).and_then(|module| {
            let groups = default_groups(&module);
            validate_wgsl(&compose(&module.source.wgsl, &link_source(&groups, &StackSizes::default())))
        });
        assert!(matches!(result, Err(RenderError::CompileFailure(_))));
    }

    #[test]
    fn link_section_reflects_stack_size() {
        let stack = StackSizes { continuation: 128, ..StackSizes::default() };
        let link = link_source(&ProgramGroupSet::new(), &stack);
        assert!(link.contains("const TRAVERSAL_STACK_SIZE: u32 = 32u;"));
        assert!(link.contains("array<u32, 32>"));
        assert!(link.contains("fn launch_kernel"));
    }
}
