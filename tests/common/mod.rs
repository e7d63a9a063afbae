use std::sync::Arc;

use gpu_rt_renderer::{GpuContext, RendererConfig};

/// Small heap keeps the tests friendly to software adapters
pub fn test_config() -> RendererConfig {
    RendererConfig::from_env().with_heap_size(16 * 1024 * 1024)
}

/// GPU context, or None (with a note on stderr) when no adapter is available
pub fn gpu_context() -> Option<Arc<GpuContext>> {
    let _ = env_logger::builder().is_test(true).try_init();
    match GpuContext::new(&test_config()) {
        Ok(context) => Some(context),
        Err(err) => {
            eprintln!("skipping GPU test: {err}");
            None
        }
    }
}
