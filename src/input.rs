use glam::Vec3;
use winit::dpi::PhysicalPosition;
use winit::event::{ElementState, KeyboardInput, MouseButton, MouseScrollDelta, VirtualKeyCode, WindowEvent};

use crate::camera::Camera;

const ROTATE_SENSITIVITY: f32 = 0.005;
const PITCH_CLAMP: f32 = 1.5;
const MOVE_STEP: f32 = 0.1;
const DOLLY_STEP: f32 = 0.1;
const MIN_DISTANCE: f32 = 0.05;

/// Mouse button and cursor tracking
#[derive(Default)]
pub struct InputState {
    mouse_pressed: bool,
    last_mouse_pos: Option<(f64, f64)>,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_mouse_input(&mut self, button: MouseButton, button_state: ElementState) {
        if button == MouseButton::Left {
            self.mouse_pressed = button_state == ElementState::Pressed;
        }
    }

    /// Cursor delta since the last move, only while the left button is held
    pub fn handle_cursor_moved(&mut self, position: PhysicalPosition<f64>) -> Option<(f64, f64)> {
        let delta = match (self.mouse_pressed, self.last_mouse_pos) {
            (true, Some((x, y))) => Some((position.x - x, position.y - y)),
            _ => None,
        };
        self.last_mouse_pos = Some((position.x, position.y));
        delta
    }
}

/// Orbits a target point; drag rotates, WASD/QE move the target, the wheel dollies.
#[derive(Clone, Debug, PartialEq)]
pub struct OrbitController {
    target: Vec3,
    distance: f32,
    yaw: f32,
    pitch: f32,
    step: f32,
}

impl OrbitController {
    pub fn from_camera(camera: &Camera) -> Self {
        let offset = camera.from - camera.at;
        let distance = offset.length().max(MIN_DISTANCE);
        Self {
            target: camera.at,
            distance,
            yaw: offset.x.atan2(offset.z),
            pitch: (offset.y / distance).clamp(-1.0, 1.0).asin().clamp(-PITCH_CLAMP, PITCH_CLAMP),
            step: MOVE_STEP * distance,
        }
    }

    pub fn camera(&self) -> Camera {
        let offset = Vec3::new(
            self.pitch.cos() * self.yaw.sin(),
            self.pitch.sin(),
            self.pitch.cos() * self.yaw.cos(),
        ) * self.distance;
        Camera::new(self.target + offset, self.target, Vec3::Y)
    }

    pub fn rotate(&mut self, delta_x: f64, delta_y: f64) {
        self.yaw -= delta_x as f32 * ROTATE_SENSITIVITY;
        self.pitch = (self.pitch + delta_y as f32 * ROTATE_SENSITIVITY).clamp(-PITCH_CLAMP, PITCH_CLAMP);
    }

    /// Positive amounts move toward the target
    pub fn dolly(&mut self, amount: f32) {
        self.distance = (self.distance * (1.0 - amount * DOLLY_STEP)).max(MIN_DISTANCE);
    }

    /// Move the target in the camera's ground plane and along world up
    pub fn translate(&mut self, forward: f32, right: f32, up: f32) {
        let forward_dir = Vec3::new(-self.yaw.sin(), 0.0, -self.yaw.cos());
        let right_dir = forward_dir.cross(Vec3::Y);
        self.target += (forward_dir * forward + right_dir * right + Vec3::Y * up) * self.step;
    }

    fn handle_key(&mut self, key: VirtualKeyCode) -> bool {
        let (forward, right, up) = match key {
            VirtualKeyCode::W => (1.0, 0.0, 0.0),
            VirtualKeyCode::S => (-1.0, 0.0, 0.0),
            VirtualKeyCode::D => (0.0, 1.0, 0.0),
            VirtualKeyCode::A => (0.0, -1.0, 0.0),
            VirtualKeyCode::E => (0.0, 0.0, 1.0),
            VirtualKeyCode::Q => (0.0, 0.0, -1.0),
            _ => return false,
        };
        self.translate(forward, right, up);
        true
    }

    /// Apply a window event; true when the camera changed
    pub fn handle_window_event(&mut self, input: &mut InputState, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::MouseInput { button, state, .. } => {
                input.handle_mouse_input(*button, *state);
                false
            }
            WindowEvent::CursorMoved { position, .. } => match input.handle_cursor_moved(*position) {
                Some((dx, dy)) => {
                    self.rotate(dx, dy);
                    true
                }
                None => false,
            },
            WindowEvent::MouseWheel { delta, .. } => {
                let amount = match delta {
                    MouseScrollDelta::LineDelta(_, y) => *y,
                    MouseScrollDelta::PixelDelta(p) => p.y as f32 / 50.0,
                };
                self.dolly(amount);
                amount != 0.0
            }
            WindowEvent::KeyboardInput {
                input: KeyboardInput { state: ElementState::Pressed, virtual_keycode: Some(key), .. },
                ..
            } => self.handle_key(*key),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn round_trips_the_initial_camera() {
        let camera = Camera::new(Vec3::new(1.0, 2.0, 5.0), Vec3::new(1.0, 0.0, 0.0), Vec3::Y);
        let rebuilt = OrbitController::from_camera(&camera).camera();
        assert_relative_eq!(rebuilt.from.x, camera.from.x, epsilon = 1e-5);
        assert_relative_eq!(rebuilt.from.y, camera.from.y, epsilon = 1e-5);
        assert_relative_eq!(rebuilt.from.z, camera.from.z, epsilon = 1e-5);
        assert_eq!(rebuilt.at, camera.at);
    }

    #[test]
    fn rotation_keeps_distance() {
        let mut controller = OrbitController::from_camera(&Camera::default());
        controller.rotate(120.0, -40.0);
        let camera = controller.camera();
        assert_relative_eq!((camera.from - camera.at).length(), 3.0, epsilon = 1e-5);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut controller = OrbitController::from_camera(&Camera::default());
        controller.rotate(0.0, 1.0e6);
        let camera = controller.camera();
        assert!(camera.from.y < 3.0);
        assert!((camera.from - camera.at).normalize().dot(Vec3::Y) < 1.0);
    }

    #[test]
    fn dolly_never_reaches_target() {
        let mut controller = OrbitController::from_camera(&Camera::default());
        for _ in 0..200 {
            controller.dolly(5.0);
        }
        let camera = controller.camera();
        assert!((camera.from - camera.at).length() >= MIN_DISTANCE);
    }

    #[test]
    fn forward_moves_toward_view_direction() {
        let mut controller = OrbitController::from_camera(&Camera::default());
        assert!(controller.handle_key(VirtualKeyCode::W));
        assert!(controller.camera().at.z < 0.0);
        assert!(!controller.handle_key(VirtualKeyCode::Space));
    }

    #[test]
    fn drag_requires_pressed_button() {
        let mut input = InputState::new();
        assert_eq!(input.handle_cursor_moved(PhysicalPosition::new(10.0, 10.0)), None);
        input.handle_mouse_input(MouseButton::Left, ElementState::Pressed);
        assert_eq!(input.handle_cursor_moved(PhysicalPosition::new(15.0, 7.0)), Some((5.0, -3.0)));
        input.handle_mouse_input(MouseButton::Left, ElementState::Released);
        assert_eq!(input.handle_cursor_moved(PhysicalPosition::new(20.0, 7.0)), None);
    }
}
