use std::path::Path;

use glam::{Mat3, Mat4, Vec2, Vec3};
use gltf::{Document, Node, Primitive};
use image::DynamicImage;
use log::{debug, warn};
use thiserror::Error;

use crate::camera::Camera;
use crate::scene::{Material, MaterialKind, Model, Texture, TextureId, TriangleMesh};

/// glTF/GLB loader producing a [`Model`]
pub struct GltfLoader {
    document: Document,
    buffers: Vec<gltf::buffer::Data>,
    images: Vec<gltf::image::Data>,
}

#[derive(Error, Debug)]
pub enum SceneError {
    #[error("failed to read scene: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid glTF: {0}")]
    Gltf(#[from] gltf::Error),
    #[error("{0}")]
    Validation(String),
}

impl GltfLoader {
    /// Load a glTF or GLB file from path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, SceneError> {
        let (document, buffers, images) = gltf::import(path)?;
        Ok(Self { document, buffers, images })
    }

    /// Load GLB (or self-contained glTF) from memory
    pub fn load_from_glb(data: &[u8]) -> Result<Self, SceneError> {
        let (document, buffers, images) = gltf::import_slice(data)?;
        Ok(Self { document, buffers, images })
    }

    fn scene(&self, scene_index: Option<usize>) -> Result<gltf::Scene<'_>, SceneError> {
        match scene_index {
            Some(index) => self
                .document
                .scenes()
                .nth(index)
                .ok_or_else(|| SceneError::Validation(format!("scene {index} not found"))),
            None => self
                .document
                .default_scene()
                .or_else(|| self.document.scenes().next())
                .ok_or_else(|| SceneError::Validation("no scenes found in glTF file".into())),
        }
    }

    /// Flatten a scene into one mesh per triangle primitive, with node
    /// transforms baked into the vertices.
    pub fn extract_model(&self, scene_index: Option<usize>) -> Result<Model, SceneError> {
        let scene = self.scene(scene_index)?;
        let mut model = Model::new();
        let textures = self.process_textures(&mut model)?;

        for node in scene.nodes() {
            self.process_node(&node, &Mat4::IDENTITY, &textures, &mut model)?;
        }

        if model.meshes().is_empty() {
            return Err(SceneError::Validation("scene contains no triangle meshes".into()));
        }
        Ok(model)
    }

    /// Camera of the first camera node in the scene, if any
    pub fn extract_camera(&self, scene_index: Option<usize>) -> Result<Option<Camera>, SceneError> {
        fn find(node: &Node, parent: &Mat4) -> Option<Camera> {
            let transform = *parent * Mat4::from_cols_array_2d(&node.transform().matrix());
            if node.camera().is_some() {
                let from = transform.transform_point3(Vec3::ZERO);
                let direction = transform.transform_vector3(-Vec3::Z).normalize_or_zero();
                let up = transform.transform_vector3(Vec3::Y).normalize_or_zero();
                return Some(Camera::new(from, from + direction, up));
            }
            node.children().find_map(|child| find(&child, &transform))
        }

        let scene = self.scene(scene_index)?;
        let camera = scene.nodes().find_map(|node| find(&node, &Mat4::IDENTITY));
        Ok(camera)
    }

    /// Convert every image-backed texture to RGBA8. Entry `i` is the model
    /// texture for glTF texture `i`, or None when its format is unsupported.
    fn process_textures(&self, model: &mut Model) -> Result<Vec<Option<TextureId>>, SceneError> {
        let mut ids = Vec::with_capacity(self.document.textures().len());
        for gltf_texture in self.document.textures() {
            let image_index = gltf_texture.source().index();
            let Some(image_data) = self.images.get(image_index) else {
                ids.push(None);
                continue;
            };
            match to_rgba8(image_data)? {
                Some(pixels) => {
                    let id = model.add_texture(Texture {
                        width: image_data.width,
                        height: image_data.height,
                        pixels,
                    });
                    ids.push(Some(id));
                }
                None => {
                    warn!(
                        "Skipping texture {} with unsupported format {:?}",
                        gltf_texture.index(),
                        image_data.format
                    );
                    ids.push(None);
                }
            }
        }
        Ok(ids)
    }

    fn process_node(
        &self,
        node: &Node,
        parent_transform: &Mat4,
        textures: &[Option<TextureId>],
        model: &mut Model,
    ) -> Result<(), SceneError> {
        let local_transform = Mat4::from_cols_array_2d(&node.transform().matrix());
        let transform = *parent_transform * local_transform;

        if let Some(mesh) = node.mesh() {
            for primitive in mesh.primitives() {
                if let Some(triangle_mesh) = self.process_primitive(&primitive, &transform, textures)? {
                    model.add_mesh(triangle_mesh);
                }
            }
        }

        for child in node.children() {
            self.process_node(&child, &transform, textures, model)?;
        }
        Ok(())
    }

    fn process_primitive(
        &self,
        primitive: &Primitive,
        transform: &Mat4,
        textures: &[Option<TextureId>],
    ) -> Result<Option<TriangleMesh>, SceneError> {
        let reader = primitive.reader(|buffer| self.buffers.get(buffer.index()).map(|data| data.0.as_slice()));

        let positions = reader
            .read_positions()
            .ok_or_else(|| SceneError::Validation("primitive missing position data".into()))?;
        let vertices: Vec<Vec3> = positions.map(|p| transform.transform_point3(Vec3::from(p))).collect();

        let normal_matrix = Mat3::from_mat4(*transform).inverse().transpose();
        let normals: Vec<Vec3> = reader
            .read_normals()
            .map(|normals| normals.map(|n| (normal_matrix * Vec3::from(n)).normalize_or_zero()).collect())
            .unwrap_or_default();
        let texcoords: Vec<Vec2> = reader
            .read_tex_coords(0)
            .map(|uv| uv.into_f32().map(Vec2::from).collect())
            .unwrap_or_default();

        let corners: Vec<u32> = match reader.read_indices() {
            Some(indices) => indices.into_u32().collect(),
            None => (0..vertices.len() as u32).collect(),
        };
        let indices = match triangulate(primitive.mode(), &corners) {
            Some(indices) => indices,
            None => {
                warn!("Skipping primitive with unsupported mode {:?}", primitive.mode());
                return Ok(None);
            }
        };
        if indices.is_empty() {
            return Ok(None);
        }

        let mut mesh = TriangleMesh::new(convert_material(&primitive.material(), textures));
        mesh.vertices = vertices;
        mesh.normals = if normals.len() == mesh.vertices.len() { normals } else { Vec::new() };
        mesh.texcoords = if texcoords.len() == mesh.vertices.len() { texcoords } else { Vec::new() };
        mesh.indices = indices;

        if !mesh.is_well_formed() {
            return Err(SceneError::Validation(format!(
                "primitive {} indexes past its {} vertices",
                primitive.index(),
                mesh.vertices.len()
            )));
        }
        debug!("Primitive {}: {} triangles", primitive.index(), mesh.triangle_count());
        Ok(Some(mesh))
    }

}

/// Triangle list for a primitive's corner indices; None for point and line modes
fn triangulate(mode: gltf::mesh::Mode, corners: &[u32]) -> Option<Vec<[u32; 3]>> {
    use gltf::mesh::Mode;

    let triangles = match mode {
        Mode::Triangles => corners.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect(),
        Mode::TriangleStrip => corners
            .windows(3)
            .enumerate()
            .map(|(i, w)| if i % 2 == 0 { [w[0], w[1], w[2]] } else { [w[0], w[2], w[1]] })
            .collect(),
        Mode::TriangleFan => match corners.split_first() {
            Some((&center, rest)) => rest.windows(2).map(|w| [center, w[0], w[1]]).collect(),
            None => Vec::new(),
        },
        _ => return None,
    };
    Some(triangles)
}

fn convert_material(gltf_material: &gltf::Material, textures: &[Option<TextureId>]) -> Material {
    let pbr = gltf_material.pbr_metallic_roughness();
    let [r, g, b, _] = pbr.base_color_factor();

    let mut material = Material {
        diffuse: Vec3::new(r, g, b),
        emissive: Vec3::from(gltf_material.emissive_factor()),
        shininess: (1.0 - pbr.roughness_factor()).clamp(0.0, 1.0) * 128.0,
        ..Default::default()
    };

    if let Some(ior) = gltf_material.ior() {
        material.ior = ior;
    }
    if let Some(specular) = gltf_material.specular() {
        material.specular = Vec3::from(specular.specular_color_factor()) * specular.specular_factor();
    }

    let transmission = gltf_material.transmission().map_or(0.0, |t| t.transmission_factor());
    material.kind = if material.emissive.max_element() > 0.0 {
        MaterialKind::Emissive
    } else if transmission > 0.0 {
        MaterialKind::Dielectric
    } else if pbr.metallic_factor() > 0.5 {
        MaterialKind::Metal
    } else {
        MaterialKind::Diffuse
    };

    material.diffuse_texture = pbr
        .base_color_texture()
        .and_then(|info| textures.get(info.texture().index()).copied().flatten());
    material
}

fn to_rgba8(image_data: &gltf::image::Data) -> Result<Option<Vec<u8>>, SceneError> {
    use gltf::image::Format;

    let (width, height) = (image_data.width, image_data.height);
    let pixels = image_data.pixels.clone();
    let invalid = || SceneError::Validation(format!("invalid {:?} image data", image_data.format));

    let dynamic_image = match image_data.format {
        Format::R8 => DynamicImage::ImageLuma8(image::ImageBuffer::from_raw(width, height, pixels).ok_or_else(invalid)?),
        Format::R8G8 => {
            DynamicImage::ImageLumaA8(image::ImageBuffer::from_raw(width, height, pixels).ok_or_else(invalid)?)
        }
        Format::R8G8B8 => {
            DynamicImage::ImageRgb8(image::ImageBuffer::from_raw(width, height, pixels).ok_or_else(invalid)?)
        }
        Format::R8G8B8A8 => {
            DynamicImage::ImageRgba8(image::ImageBuffer::from_raw(width, height, pixels).ok_or_else(invalid)?)
        }
        _ => return Ok(None),
    };
    Ok(Some(dynamic_image.to_rgba8().into_raw()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gltf::mesh::Mode;

    const TRIANGLE_JSON: &str = r#"{
        "asset": {"version": "2.0"},
        "scene": 0,
        "scenes": [{"nodes": [0]}],
        "nodes": [
            {"mesh": 0, "translation": [0.0, 0.0, -1.0], "children": [1]},
            {"camera": 0, "translation": [0.0, 0.0, 3.0]}
        ],
        "cameras": [{"type": "perspective", "perspective": {"yfov": 0.8, "znear": 0.1}}],
        "meshes": [{"primitives": [{"attributes": {"POSITION": 0}, "indices": 1, "material": 0}]}],
        "materials": [{"pbrMetallicRoughness": {"baseColorFactor": [1.0, 0.0, 0.0, 1.0], "metallicFactor": 0.0}}],
        "buffers": [{"byteLength": 42}],
        "bufferViews": [
            {"buffer": 0, "byteOffset": 0, "byteLength": 36},
            {"buffer": 0, "byteOffset": 36, "byteLength": 6}
        ],
        "accessors": [
            {"bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
             "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0]},
            {"bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR"}
        ]
    }"#;

    fn pad(mut bytes: Vec<u8>, fill: u8) -> Vec<u8> {
        while bytes.len() % 4 != 0 {
            bytes.push(fill);
        }
        bytes
    }

    fn triangle_glb() -> Vec<u8> {
        let mut bin = Vec::new();
        for p in [[0.0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]] {
            bin.extend_from_slice(bytemuck::cast_slice(&p));
        }
        bin.extend_from_slice(bytemuck::cast_slice(&[0u16, 1, 2]));

        let json = pad(TRIANGLE_JSON.as_bytes().to_vec(), b' ');
        let bin = pad(bin, 0);
        let total = 12 + 8 + json.len() + 8 + bin.len();

        let mut glb = Vec::with_capacity(total);
        glb.extend_from_slice(b"glTF");
        glb.extend_from_slice(&2u32.to_le_bytes());
        glb.extend_from_slice(&(total as u32).to_le_bytes());
        glb.extend_from_slice(&(json.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"JSON");
        glb.extend_from_slice(&json);
        glb.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"BIN\0");
        glb.extend_from_slice(&bin);
        glb
    }

    #[test]
    fn loads_glb_triangle_with_baked_transform() {
        let loader = GltfLoader::load_from_glb(&triangle_glb()).unwrap();
        let model = loader.extract_model(None).unwrap();
        assert_eq!(model.meshes().len(), 1);
        let mesh = &model.meshes()[0];
        assert_eq!(mesh.indices, vec![[0, 1, 2]]);
        assert_eq!(mesh.vertices[1], Vec3::new(1.0, 0.0, -1.0));
        assert_eq!(mesh.material.diffuse, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(mesh.material.kind, MaterialKind::Diffuse);
        assert!(mesh.normals.is_empty());
        assert!(mesh.is_well_formed());
    }

    #[test]
    fn camera_node_inherits_parent_transform() {
        let loader = GltfLoader::load_from_glb(&triangle_glb()).unwrap();
        let camera = loader.extract_camera(None).unwrap().unwrap();
        assert_eq!(camera.from, Vec3::new(0.0, 0.0, 2.0));
        assert_eq!(camera.at, Vec3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn default_gltf_material_is_fully_metallic() {
        let loader =
            GltfLoader::load_from_glb(br#"{"asset": {"version": "2.0"}, "materials": [{}]}"#).unwrap();
        let material = convert_material(&loader.document.materials().next().unwrap(), &[]);
        assert_eq!(material.kind, MaterialKind::Metal);
        assert_eq!(material.diffuse, Vec3::ONE);
        assert_eq!(material.diffuse_texture, None);
    }

    #[test]
    fn model_loads_from_file_with_scene_camera() {
        let path = std::env::temp_dir().join(format!("gpu-rt-triangle-{}.glb", std::process::id()));
        std::fs::write(&path, triangle_glb()).unwrap();
        let loaded = Model::load_gltf(&path);
        std::fs::remove_file(&path).unwrap();

        let (model, camera) = loaded.unwrap();
        assert_eq!(model.triangle_count(), 1);
        assert_eq!(camera.unwrap().from, Vec3::new(0.0, 0.0, 2.0));
    }

    #[test]
    fn missing_scene_is_a_validation_error() {
        let loader = GltfLoader::load_from_glb(&triangle_glb()).unwrap();
        assert!(matches!(loader.extract_model(Some(3)), Err(SceneError::Validation(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(GltfLoader::load_from_glb(b"not a gltf"), Err(SceneError::Gltf(_))));
    }

    #[test]
    fn strips_and_fans_triangulate() {
        assert_eq!(triangulate(Mode::Triangles, &[0, 1, 2, 3]).unwrap(), vec![[0, 1, 2]]);
        assert_eq!(
            triangulate(Mode::TriangleStrip, &[0, 1, 2, 3]).unwrap(),
            vec![[0, 1, 2], [1, 3, 2]]
        );
        assert_eq!(
            triangulate(Mode::TriangleFan, &[0, 1, 2, 3]).unwrap(),
            vec![[0, 1, 2], [0, 2, 3]]
        );
        assert!(triangulate(Mode::Lines, &[0, 1]).is_none());
    }
}
