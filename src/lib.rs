//! GPU ray-tracing renderer on wgpu compute.
//!
//! Scenes are uploaded into a single device heap, indexed by a compacted BVH
//! and shaded by WGSL program groups dispatched through a shader binding
//! table. [`Renderer`] drives the per-frame protocol: `resize`,
//! `set_camera`, `render` and `download_pixels`.

pub mod accel;
pub mod buffers;
pub mod bvh;
pub mod camera;
pub mod compute;
pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod gltf_loader;
pub mod input;
pub mod pipeline;
pub mod present;
pub mod renderer;
pub mod sbt;
pub mod scene;
pub mod texture;

pub use accel::{Accel, GeometryFlags, TraversableHandle, TriangleBuildInput};
pub use buffers::{DeviceBuffer, DeviceHeap, DevicePtr};
pub use camera::Camera;
pub use config::RendererConfig;
pub use context::GpuContext;
pub use error::{RenderError, RenderResult};
pub use frame::FrameStatus;
pub use gltf_loader::{GltfLoader, SceneError};
pub use input::{InputState, OrbitController};
pub use pipeline::ModuleSource;
pub use present::Presenter;
pub use renderer::{Renderer, RendererBuilder};
pub use scene::{Material, MaterialKind, MeshId, Model, Texture, TextureId, TriangleMesh};
