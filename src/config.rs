//! Renderer configuration.
//!
//! Layout constants shared with the device live in `rt_shared::RaytracerConfig`;
//! everything here is a host-side knob that can be overridden from the
//! environment.

use log::warn;

/// Default size of the device heap every buffer is carved out of. The heap
/// is clamped to the adapter's storage buffer limits on creation. A resize
/// briefly holds two framebuffers, 20 bytes per pixel each, so this has to
/// cover two 4K frames plus the scene.
pub const DEFAULT_HEAP_BYTES: u64 = 1024 * 1024 * 1024;

/// Stack limits handed to the pipeline linker. They are fixed, not derived
/// from the module, and must cover the deepest call graph a module exercises.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackSizes {
    pub direct_callable_from_traversal: u32,
    pub direct_callable_from_state: u32,
    /// Bytes of continuation stack; the traversal stack gets one u32 entry per 4 bytes
    pub continuation: u32,
    pub max_traversable_graph_depth: u32,
}

impl Default for StackSizes {
    fn default() -> Self {
        Self {
            direct_callable_from_traversal: 2 * 1024,
            direct_callable_from_state: 2 * 1024,
            continuation: 256,
            max_traversable_graph_depth: 1,
        }
    }
}

impl StackSizes {
    pub fn traversal_stack_entries(&self) -> u32 {
        (self.continuation / 4).max(1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineLinkOptions {
    /// Only single-level tracing is supported, so this must stay 1
    pub max_trace_depth: u32,
}

impl Default for PipelineLinkOptions {
    fn default() -> Self {
        Self { max_trace_depth: 1 }
    }
}

/// Entry points the default program groups bind to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramNames {
    pub raygen: String,
    pub miss: String,
    pub closest_hit: String,
    pub any_hit: String,
}

impl Default for ProgramNames {
    fn default() -> Self {
        Self {
            raygen: "raygen_render_frame".to_string(),
            miss: "miss_radiance".to_string(),
            closest_hit: "closesthit_radiance".to_string(),
            any_hit: "anyhit_radiance".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub heap_size: u64,
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
    pub stack_sizes: StackSizes,
    pub link_options: PipelineLinkOptions,
    pub programs: ProgramNames,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_BYTES,
            backends: wgpu::Backends::all(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            stack_sizes: StackSizes::default(),
            link_options: PipelineLinkOptions::default(),
            programs: ProgramNames::default(),
        }
    }
}

impl RendererConfig {
    /// Defaults overridden by `WGPU_BACKEND`, `WGPU_POWER_PREF`, `RT_HEAP_MB`
    /// and `RT_FALLBACK_ADAPTER`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(backends) = wgpu::util::backend_bits_from_env() {
            config.backends = backends;
        }
        if let Some(power) = wgpu::util::power_preference_from_env() {
            config.power_preference = power;
        }
        if let Ok(value) = std::env::var("RT_HEAP_MB") {
            match parse_heap_megabytes(&value) {
                Some(bytes) => config.heap_size = bytes,
                None => warn!("ignoring RT_HEAP_MB={value:?}: expected a positive integer"),
            }
        }
        if let Ok(value) = std::env::var("RT_FALLBACK_ADAPTER") {
            config.force_fallback_adapter = parse_flag(&value);
        }

        config
    }

    pub fn with_heap_size(mut self, bytes: u64) -> Self {
        self.heap_size = bytes;
        self
    }
}

fn parse_heap_megabytes(value: &str) -> Option<u64> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|mb| *mb > 0)
        .map(|mb| mb * 1024 * 1024)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_megabytes_parsing() {
        assert_eq!(parse_heap_megabytes("64"), Some(64 * 1024 * 1024));
        assert_eq!(parse_heap_megabytes(" 1 "), Some(1024 * 1024));
        assert_eq!(parse_heap_megabytes("0"), None);
        assert_eq!(parse_heap_megabytes("lots"), None);
    }

    #[test]
    fn flag_parsing() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn default_heap_fits_4k_resize() {
        use crate::buffers::HeapAllocator;

        let pixels = 3840 * 2160u64;
        let mut allocator = HeapAllocator::new(DEFAULT_HEAP_BYTES);
        for _ in 0..2 {
            assert!(allocator.alloc(pixels * 4).is_some(), "color buffer");
            assert!(allocator.alloc(pixels * 16).is_some(), "accumulation buffer");
        }
        assert!(allocator.free_bytes() > 256 * 1024 * 1024);
    }

    #[test]
    fn defaults_are_single_level() {
        let config = RendererConfig::default();
        assert_eq!(config.link_options.max_trace_depth, 1);
        assert_eq!(config.stack_sizes.max_traversable_graph_depth, 1);
        assert_eq!(config.stack_sizes.traversal_stack_entries(), 64);
        assert_eq!(config.programs.raygen, "raygen_render_frame");
    }
}
