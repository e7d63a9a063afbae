use log::trace;
use rt_shared::{LaunchDescriptor, RaytracerConfig};

use crate::error::{RenderError, RenderResult};
use crate::pipeline::Pipeline;
use crate::sbt::SbtLayout;

/// Launch dimensions and where the parameters and tables live
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchRequest {
    pub params_address: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub sbt: SbtLayout,
}

impl LaunchRequest {
    pub fn descriptor(&self) -> LaunchDescriptor {
        LaunchDescriptor {
            params: self.params_address,
            width: self.width,
            height: self.height,
            depth: self.depth,
            raygen_record: self.sbt.raygen_record,
            miss_record_base: self.sbt.miss_record_base,
            miss_record_stride: self.sbt.miss_record_stride,
            miss_record_count: self.sbt.miss_record_count,
            hitgroup_record_base: self.sbt.hitgroup_record_base,
            hitgroup_record_stride: self.sbt.hitgroup_record_stride,
            hitgroup_record_count: self.sbt.hitgroup_record_count,
            _padding: 0,
        }
    }
}

/// Issues ray-tracing launches on the pipeline's compute kernel
pub struct ComputeLauncher;

impl ComputeLauncher {
    /// Workgroups needed to cover a `width` x `height` launch
    pub fn workgroup_count(width: u32, height: u32) -> (u32, u32) {
        let (group_x, group_y) = RaytracerConfig::WORKGROUP_SIZE;
        ((width + group_x - 1) / group_x, (height + group_y - 1) / group_y)
    }

    /// Run one launch and block until the device has finished it
    pub fn launch(pipeline: &Pipeline, request: &LaunchRequest) -> RenderResult<()> {
        let context = pipeline.heap().context();
        let descriptor = request.descriptor();
        let (workgroup_x, workgroup_y) = Self::workgroup_count(request.width, request.height);
        trace!(
            "Launch {}x{}x{} ({}x{} workgroups), params at {:#x}",
            request.width,
            request.height,
            request.depth,
            workgroup_x,
            workgroup_y,
            request.params_address
        );

        let ((), error) = context.capture_errors(|| {
            context
                .queue
                .write_buffer(pipeline.launch_buffer(), 0, bytemuck::bytes_of(&descriptor));

            let mut encoder = context.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Ray Tracing Launch Encoder"),
            });
            {
                let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Ray Tracing Launch"),
                });
                compute_pass.set_pipeline(pipeline.compute_pipeline());
                compute_pass.set_bind_group(0, pipeline.bind_group(), &[]);
                compute_pass.dispatch_workgroups(workgroup_x, workgroup_y, request.depth.max(1));
            }
            context.queue.submit(std::iter::once(encoder.finish()));
        });

        context.synchronize();

        match error {
            Some(error) => Err(RenderError::LaunchFailure(error.to_string())),
            None => Ok(()),
        }
    }
}
