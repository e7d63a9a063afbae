use glam::{Vec2, Vec3};
use log::info;

use crate::accel::GeometryFlags;
use crate::camera::Camera;
use crate::gltf_loader::{GltfLoader, SceneError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MaterialKind {
    #[default]
    Diffuse,
    Metal,
    Dielectric,
    Emissive,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Material {
    pub diffuse: Vec3,
    pub emissive: Vec3,
    pub specular: Vec3,
    pub shininess: f32,
    pub ior: f32,
    pub kind: MaterialKind,
    pub diffuse_texture: Option<TextureId>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            diffuse: Vec3::splat(0.8),
            emissive: Vec3::ZERO,
            specular: Vec3::ZERO,
            shininess: 0.0,
            ior: 1.5,
            kind: MaterialKind::Diffuse,
            diffuse_texture: None,
        }
    }
}

impl Material {
    pub fn diffuse(color: Vec3) -> Self {
        Self { diffuse: color, ..Default::default() }
    }
}

/// Triangle mesh with optional per-vertex attributes. Normals and texcoords
/// are either empty or exactly as long as `vertices`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriangleMesh {
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub texcoords: Vec<Vec2>,
    pub indices: Vec<[u32; 3]>,
    pub material: Material,
    /// Build flags handed to the acceleration structure for this mesh
    pub flags: GeometryFlags,
}

impl TriangleMesh {
    pub fn new(material: Material) -> Self {
        Self { material, ..Default::default() }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    /// Append a triangle with no attributes beyond positions
    pub fn add_triangle(&mut self, v0: Vec3, v1: Vec3, v2: Vec3) {
        let first = self.vertices.len() as u32;
        self.vertices.extend([v0, v1, v2]);
        self.indices.push([first, first + 1, first + 2]);
    }

    /// Append an axis-aligned quad spanned by `u` and `v` from `origin`,
    /// with texture coordinates scaled by `uv_scale`.
    pub fn add_quad(&mut self, origin: Vec3, u: Vec3, v: Vec3, uv_scale: f32) {
        let first = self.vertices.len() as u32;
        let normal = u.cross(v).normalize_or_zero();
        self.vertices.extend([origin, origin + u, origin + u + v, origin + v]);
        self.normals.extend([normal; 4]);
        self.texcoords.extend([
            Vec2::new(0.0, 0.0),
            Vec2::new(uv_scale, 0.0),
            Vec2::new(uv_scale, uv_scale),
            Vec2::new(0.0, uv_scale),
        ]);
        self.indices.push([first, first + 1, first + 2]);
        self.indices.push([first, first + 2, first + 3]);
    }

    /// Unit-free axis-aligned box of six quads
    pub fn add_cube(&mut self, center: Vec3, size: Vec3) {
        let h = size * 0.5;
        let min = center - h;
        let (x, y, z) = (Vec3::X * size.x, Vec3::Y * size.y, Vec3::Z * size.z);
        self.add_quad(min, y, x, 1.0); // back
        self.add_quad(min + z, x, y, 1.0); // front
        self.add_quad(min, z, y, 1.0); // left
        self.add_quad(min + x, y, z, 1.0); // right
        self.add_quad(min, x, z, 1.0); // bottom
        self.add_quad(min + y, z, x, 1.0); // top
    }

    pub fn is_well_formed(&self) -> bool {
        let n = self.vertices.len();
        (self.normals.is_empty() || self.normals.len() == n)
            && (self.texcoords.is_empty() || self.texcoords.len() == n)
            && self.indices.iter().flatten().all(|&i| (i as usize) < n)
    }
}

/// Decoded RGBA8 image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Texture {
    pub fn checker(size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        let cell = cell.max(1);
        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let color = if ((x / cell) + (y / cell)) % 2 == 0 { a } else { b };
                pixels.extend_from_slice(&color);
            }
        }
        Self { width: size, height: size, pixels }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    pub fn empty() -> Self {
        Self { min: Vec3::splat(f32::MAX), max: Vec3::splat(f32::MIN) }
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    pub fn extend(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn center(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            (self.min + self.max) * 0.5
        }
    }

    pub fn span(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            self.max - self.min
        }
    }
}

/// Arena of meshes and textures addressed by id
#[derive(Clone, Debug)]
pub struct Model {
    meshes: Vec<TriangleMesh>,
    textures: Vec<Texture>,
    bounds: Bounds,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        Self { meshes: Vec::new(), textures: Vec::new(), bounds: Bounds::empty() }
    }

    pub fn add_mesh(&mut self, mesh: TriangleMesh) -> MeshId {
        for v in &mesh.vertices {
            self.bounds.extend(*v);
        }
        self.meshes.push(mesh);
        MeshId(self.meshes.len() as u32 - 1)
    }

    pub fn add_texture(&mut self, texture: Texture) -> TextureId {
        self.textures.push(texture);
        TextureId(self.textures.len() as u32 - 1)
    }

    pub fn mesh(&self, id: MeshId) -> Option<&TriangleMesh> {
        self.meshes.get(id.0 as usize)
    }

    pub fn texture(&self, id: TextureId) -> Option<&Texture> {
        self.textures.get(id.0 as usize)
    }

    /// Meshes in canonical order; mesh `i` has id `MeshId(i)`
    pub fn meshes(&self) -> &[TriangleMesh] {
        &self.meshes
    }

    pub fn textures(&self) -> &[Texture] {
        &self.textures
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn triangle_count(&self) -> usize {
        self.meshes.iter().map(TriangleMesh::triangle_count).sum()
    }

    /// Checker floor, a cube and a triangle
    pub fn demo() -> Self {
        let mut model = Model::new();
        let checker = model.add_texture(Texture::checker(64, 8, [230, 230, 230, 255], [60, 60, 60, 255]));

        let mut floor = TriangleMesh::new(Material {
            diffuse: Vec3::ONE,
            diffuse_texture: Some(checker),
            ..Default::default()
        });
        floor.add_quad(Vec3::new(-5.0, 0.0, 5.0), Vec3::new(10.0, 0.0, 0.0), Vec3::new(0.0, 0.0, -10.0), 4.0);
        model.add_mesh(floor);

        let mut cube = TriangleMesh::new(Material::diffuse(Vec3::new(0.2, 0.5, 0.9)));
        cube.add_cube(Vec3::new(-1.0, 0.75, 0.0), Vec3::splat(1.5));
        model.add_mesh(cube);

        let mut triangle = TriangleMesh::new(Material::diffuse(Vec3::new(0.9, 0.2, 0.1)));
        triangle.add_triangle(Vec3::new(0.5, 0.0, 0.5), Vec3::new(2.5, 0.0, 0.5), Vec3::new(1.5, 2.0, 0.5));
        model.add_mesh(triangle);

        model
    }

    /// Load the default scene of a glTF/GLB file, with its first camera if it has one
    pub fn load_gltf<P: AsRef<std::path::Path>>(path: P) -> Result<(Self, Option<Camera>), SceneError> {
        let loader = GltfLoader::load_from_path(&path)?;
        let model = loader.extract_model(None)?;
        let camera = loader.extract_camera(None)?;
        info!(
            "Loaded {:?}: {} meshes, {} triangles, {} textures, {}",
            path.as_ref(),
            model.meshes.len(),
            model.triangle_count(),
            model.textures.len(),
            if camera.is_some() { "scene camera" } else { "no camera" }
        );
        Ok((model, camera))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_index_the_arena() {
        let mut model = Model::new();
        let a = model.add_mesh(TriangleMesh::default());
        let b = model.add_mesh(TriangleMesh::new(Material::diffuse(Vec3::X)));
        assert_eq!((a, b), (MeshId(0), MeshId(1)));
        assert_eq!(model.mesh(b).unwrap().material.diffuse, Vec3::X);
        assert!(model.mesh(MeshId(2)).is_none());
    }

    #[test]
    fn bounds_track_added_meshes() {
        let mut model = Model::new();
        assert!(model.bounds().is_empty());
        let mut mesh = TriangleMesh::default();
        mesh.add_triangle(Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0), Vec3::new(0.0, 4.0, -2.0));
        model.add_mesh(mesh);

        let bounds = model.bounds();
        assert_eq!(bounds.min, Vec3::new(0.0, 0.0, -2.0));
        assert_eq!(bounds.max, Vec3::new(2.0, 4.0, 0.0));
        assert_eq!(bounds.center(), Vec3::new(1.0, 2.0, -1.0));
        assert_eq!(bounds.span(), Vec3::new(2.0, 4.0, 2.0));
    }

    #[test]
    fn demo_scene_is_well_formed() {
        let model = Model::demo();
        assert_eq!(model.meshes().len(), 3);
        assert!(model.meshes().iter().all(TriangleMesh::is_well_formed));
        assert_eq!(model.meshes()[1].triangle_count(), 12);
        let texture = model.texture(TextureId(0)).unwrap();
        assert_eq!(texture.pixels.len(), (texture.width * texture.height * 4) as usize);
    }
}
