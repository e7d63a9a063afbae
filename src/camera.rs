use glam::Vec3;
use rt_shared::{LaunchCamera, RaytracerConfig};

/// Look-at camera as supplied by the application
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub from: Vec3,
    pub at: Vec3,
    pub up: Vec3,
}

impl Camera {
    pub fn new(from: Vec3, at: Vec3, up: Vec3) -> Self {
        Self { from, at, up }
    }

    /// Frame a bounding box from the +z side
    pub fn framing(center: Vec3, span: Vec3) -> Self {
        let distance = span.max_element().max(1.0) * 1.5;
        Self::new(center + Vec3::new(0.0, span.y * 0.25, distance), center, Vec3::Y)
    }

    /// Position, normalized direction and the image-plane basis for `aspect`
    /// (width / height).
    pub fn basis(&self, aspect: f32) -> LaunchCamera {
        let direction = (self.at - self.from).normalize_or_zero();
        let horizontal = RaytracerConfig::COS_FOVY * aspect * direction.cross(self.up).normalize_or_zero();
        let vertical = RaytracerConfig::COS_FOVY * horizontal.cross(direction).normalize_or_zero();
        LaunchCamera::from_basis(self.from, direction, horizontal, vertical)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO, Vec3::Y)
    }
}
