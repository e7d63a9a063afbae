use rt_shared::{BufferView, LaunchParams};

use crate::accel::TraversableHandle;
use crate::camera::Camera;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// No framebuffer sized yet
    Idle,
    Ready,
}

/// Host mirror of the launch parameters plus the Idle/Ready state machine.
/// It never touches the device; the renderer applies the buffer side of
/// each transition.
#[derive(Clone, Debug)]
pub struct FrameState {
    params: LaunchParams,
    camera: Option<Camera>,
}

impl FrameState {
    pub fn new(traversable: TraversableHandle) -> Self {
        Self {
            params: LaunchParams { traversable: traversable.address(), ..Default::default() },
            camera: None,
        }
    }

    pub fn status(&self) -> FrameStatus {
        if self.params.fb_size[0] == 0 || self.params.fb_size[1] == 0 {
            FrameStatus::Idle
        } else {
            FrameStatus::Ready
        }
    }

    /// Returns false (and changes nothing) when either dimension is zero.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        if width == 0 || height == 0 {
            return false;
        }
        self.params.fb_size = [width, height];
        self.params.frame_id = 0;
        self.update_camera_basis();
        true
    }

    /// Point the parameters at freshly allocated color and accumulation buffers
    pub fn set_buffers(&mut self, color: BufferView, accum: BufferView) {
        self.params.color_buffer = color;
        self.params.accum_buffer = accum;
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = Some(camera);
        self.params.frame_id = 0;
        self.update_camera_basis();
    }

    fn update_camera_basis(&mut self) {
        let [width, height] = self.params.fb_size;
        if let (Some(camera), true) = (self.camera, height > 0) {
            self.params.camera = camera.basis(width as f32 / height as f32);
        }
    }

    /// Parameters for the next launch, or None while Idle
    pub fn next_launch(&self) -> Option<LaunchParams> {
        match self.status() {
            FrameStatus::Idle => None,
            FrameStatus::Ready => Some(self.params),
        }
    }

    pub fn finish_frame(&mut self) {
        self.params.frame_id += 1;
    }

    pub fn frame_id(&self) -> u32 {
        self.params.frame_id
    }

    pub fn fb_size(&self) -> (u32, u32) {
        (self.params.fb_size[0], self.params.fb_size[1])
    }

    pub fn pixel_count(&self) -> usize {
        self.params.fb_size[0] as usize * self.params.fb_size[1] as usize
    }

    pub fn camera(&self) -> Option<Camera> {
        self.camera
    }

    pub fn params(&self) -> &LaunchParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn ready(width: u32, height: u32) -> FrameState {
        let mut state = FrameState::new(TraversableHandle::NULL);
        assert!(state.resize(width, height));
        state
    }

    #[test]
    fn starts_idle_and_refuses_to_launch() {
        let state = FrameState::new(TraversableHandle::NULL);
        assert_eq!(state.status(), FrameStatus::Idle);
        assert!(state.next_launch().is_none());
    }

    #[test]
    fn zero_sized_resize_is_a_noop() {
        let mut state = ready(8, 4);
        state.finish_frame();
        let before = *state.params();

        assert!(!state.resize(0, 4));
        assert!(!state.resize(8, 0));
        assert_eq!(*state.params(), before);
        assert_eq!(state.frame_id(), 1);
    }

    #[test]
    fn resize_resets_accumulation() {
        let mut state = ready(8, 4);
        state.finish_frame();
        state.finish_frame();
        assert!(state.resize(16, 16));
        assert_eq!(state.frame_id(), 0);
        assert_eq!(state.fb_size(), (16, 16));
        assert_eq!(state.status(), FrameStatus::Ready);
    }

    #[test]
    fn set_camera_resets_frame_counter() {
        let mut state = ready(4, 4);
        state.finish_frame();
        state.set_camera(Camera::default());
        assert_eq!(state.frame_id(), 0);
        state.finish_frame();
        state.finish_frame();
        assert_eq!(state.frame_id(), 2);
    }

    #[test]
    fn resize_rederives_camera_for_new_aspect() {
        let mut state = ready(4, 4);
        state.set_camera(Camera::default());
        let square = Vec3::from(state.params().camera.horizontal).length();

        state.resize(8, 4);
        let wide = Vec3::from(state.params().camera.horizontal).length();
        approx::assert_relative_eq!(wide, 2.0 * square, epsilon = 1e-6);
    }

    #[test]
    fn camera_before_resize_is_applied_later() {
        let mut state = FrameState::new(TraversableHandle::NULL);
        state.set_camera(Camera::default());
        assert_eq!(state.params().camera.direction, [0.0, 0.0, 0.0]);
        state.resize(2, 2);
        assert_eq!(state.params().camera.direction, [0.0, 0.0, -1.0]);
    }
}
