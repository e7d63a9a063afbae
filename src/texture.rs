use std::sync::Arc;

use log::debug;
use rt_shared::TextureHeader;

use crate::buffers::{DeviceBuffer, DeviceHeap};
use crate::error::{RenderError, RenderResult};
use crate::scene::Texture;

/// Sampler state baked into every texture object: wrap addressing,
/// bilinear filtering, normalized coordinates, normalized-float reads.
pub const SAMPLER_WRAP: u32 = 1 << 0;
pub const SAMPLER_LINEAR: u32 = 1 << 1;
pub const SAMPLER_NORMALIZED_COORDS: u32 = 1 << 2;
pub const SAMPLER_NORMALIZED_FLOAT: u32 = 1 << 3;
pub const DEFAULT_SAMPLER: u32 = SAMPLER_WRAP | SAMPLER_LINEAR | SAMPLER_NORMALIZED_COORDS | SAMPLER_NORMALIZED_FLOAT;

/// Device address of a texture object header; 0 means "no texture"
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextureHandle(u32);

impl TextureHandle {
    pub const NONE: Self = Self(0);

    #[cfg(test)]
    pub(crate) fn from_address(address: u32) -> Self {
        Self(address)
    }

    pub fn address(self) -> u32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// A sampleable texture resident in the device heap
pub struct TextureObject {
    header: DeviceBuffer<TextureHeader>,
    texels: DeviceBuffer<u32>,
    width: u32,
    height: u32,
}

/// Pack RGBA8 bytes into one little-endian u32 per texel (R in the low byte)
fn pack_rgba8(pixels: &[u8]) -> Vec<u32> {
    pixels
        .chunks_exact(4)
        .map(|px| u32::from_le_bytes([px[0], px[1], px[2], px[3]]))
        .collect()
}

impl TextureObject {
    pub fn upload(heap: &Arc<DeviceHeap>, texture: &Texture) -> RenderResult<Self> {
        let expected = texture.width as usize * texture.height as usize * 4;
        if texture.width == 0 || texture.height == 0 || texture.pixels.len() != expected {
            return Err(RenderError::InvalidBuildInput(format!(
                "texture {}x{} has {} bytes of RGBA8 data, expected {}",
                texture.width,
                texture.height,
                texture.pixels.len(),
                expected
            )));
        }

        let texels = DeviceBuffer::alloc_and_upload(heap, &pack_rgba8(&texture.pixels))?;
        let header = DeviceBuffer::alloc_and_upload(
            heap,
            &[TextureHeader {
                width: texture.width,
                height: texture.height,
                texels: texels.address(),
                sampler_flags: DEFAULT_SAMPLER,
            }],
        )?;

        Ok(Self { header, texels, width: texture.width, height: texture.height })
    }

    pub fn handle(&self) -> TextureHandle {
        TextureHandle(self.header.address())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn texel_bytes(&self) -> u64 {
        self.texels.size_in_bytes()
    }
}

/// Upload every texture of a model, preserving texture ids as indices
pub fn upload_textures(heap: &Arc<DeviceHeap>, textures: &[Texture]) -> RenderResult<Vec<TextureObject>> {
    let objects = textures
        .iter()
        .map(|texture| TextureObject::upload(heap, texture))
        .collect::<RenderResult<Vec<_>>>()?;
    debug!(
        "Uploaded {} textures ({} bytes of texels)",
        objects.len(),
        objects.iter().map(TextureObject::texel_bytes).sum::<u64>()
    );
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texels_pack_red_into_low_byte() {
        let packed = pack_rgba8(&[0xFF, 0x00, 0x00, 0xFF, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(packed, vec![0xFF00_00FF, 0x0403_0201]);
    }

    #[test]
    fn default_sampler_sets_every_flag() {
        assert_eq!(DEFAULT_SAMPLER, 0b1111);
        assert!(TextureHandle::NONE.is_none());
    }
}
