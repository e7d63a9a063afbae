use std::sync::Arc;

use log::{debug, info};

use crate::config::RendererConfig;
use crate::error::{RenderError, RenderResult};

/// Instance, adapter, device and queue shared by every renderer component
pub struct GpuContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Headless context, used by tests and offscreen rendering
    pub fn new(config: &RendererConfig) -> RenderResult<Arc<Self>> {
        let instance = Self::create_instance(config);
        let adapter = Self::request_adapter(&instance, config, None)?;
        Self::finish(instance, adapter).map(Arc::new)
    }

    /// Context plus a surface the adapter is guaranteed to be able to present to
    pub fn with_surface(
        config: &RendererConfig,
        window: &winit::window::Window,
    ) -> RenderResult<(Arc<Self>, wgpu::Surface)> {
        let instance = Self::create_instance(config);
        let surface = unsafe { instance.create_surface(window) }
            .map_err(|e| RenderError::EnvironmentUnavailable(format!("cannot create surface: {e}")))?;
        let adapter = Self::request_adapter(&instance, config, Some(&surface))?;
        let context = Self::finish(instance, adapter)?;
        Ok((Arc::new(context), surface))
    }

    fn create_instance(config: &RendererConfig) -> wgpu::Instance {
        wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: config.backends,
            ..Default::default()
        })
    }

    fn request_adapter(
        instance: &wgpu::Instance,
        config: &RendererConfig,
        surface: Option<&wgpu::Surface>,
    ) -> RenderResult<wgpu::Adapter> {
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: config.power_preference,
            compatible_surface: surface,
            force_fallback_adapter: config.force_fallback_adapter,
        }))
        .ok_or_else(|| RenderError::EnvironmentUnavailable("no compatible GPU adapter found".into()))
    }

    fn finish(instance: wgpu::Instance, adapter: wgpu::Adapter) -> RenderResult<Self> {
        let adapter_info = adapter.get_info();
        info!("Using adapter {} ({:?})", adapter_info.name, adapter_info.backend);

        let downlevel = adapter.get_downlevel_capabilities();
        if !downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            return Err(RenderError::EnvironmentUnavailable(format!(
                "adapter {} does not support compute shaders",
                adapter_info.name
            )));
        }

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Ray Tracing Device"),
                features: wgpu::Features::empty(),
                limits: adapter.limits(),
            },
            None,
        ))
        .map_err(|e| RenderError::EnvironmentUnavailable(format!("device request failed: {e}")))?;

        debug!(
            "Device limits: max_buffer_size={}, max_storage_buffer_binding_size={}",
            device.limits().max_buffer_size,
            device.limits().max_storage_buffer_binding_size
        );

        Ok(Self { instance, adapter, device, queue })
    }

    /// Block until all submitted work has finished
    pub fn synchronize(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    /// Run `f` inside validation and out-of-memory error scopes and return the
    /// first error the device reported for it.
    pub fn capture_errors<R>(&self, f: impl FnOnce() -> R) -> (R, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let result = f();
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        let validation = pollster::block_on(self.device.pop_error_scope());
        (result, out_of_memory.or(validation))
    }
}
