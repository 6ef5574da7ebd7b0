use bytemuck::{Pod, Zeroable};
use emberpath_core::{DataType, Extension, Interpolation, ShadingSystem};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// How many decoupled volume step arrays a thread may hold at once,
/// one per nested volume stack entry.
pub const VOLUME_STACK_SIZE: usize = 16;

/// Film configuration consumed by kernels.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct KernelFilm {
    /// Floats per pixel in the render buffer.
    pub pass_stride: i32,
    /// Pass offset the denoiser writes reconstructed color into.
    pub pass_no_denoising: i32,
    /// Pass offset of the denoising feature block.
    pub pass_denoising: i32,
    /// Non-zero when color is split into two independent half images.
    pub denoise_cross: i32,
}

/// Integrator configuration consumed by kernels.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct KernelIntegrator {
    /// Radius of the NLM search window during reconstruction.
    pub half_window: i32,
    /// k² of the NLM weight during reconstruction.
    pub weighting_adjust: f32,
    pub use_gradients: i32,
}

/// The constant area uploaded through `const_copy_to("data", ...)`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct KernelData {
    pub film: KernelFilm,
    pub integrator: KernelIntegrator,
}

/// A named sampler registered through `tex_alloc`.
#[derive(Clone, Debug)]
pub struct TextureBinding {
    pub data: usize,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub data_type: DataType,
    pub interpolation: Interpolation,
    pub extension: Extension,
}

/// Shared kernel globals: constant data and texture bindings.
///
/// The device owns one master instance, mutated only between tasks; every
/// worker thread derives a private copy at thread start and treats it as
/// read-only for the duration of the task.
#[derive(Clone, Default)]
pub struct KernelGlobals {
    pub data: KernelData,
    pub textures: FxHashMap<String, TextureBinding>,
}

impl KernelGlobals {
    pub fn texture(&self, name: &str) -> Option<&TextureBinding> {
        self.textures.get(name)
    }
}

/// Scratch a transparent shadow ray records blocker hits into.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShadowIntersection {
    pub t: f32,
    pub opacity: f32,
}

/// One cached volume integration step.
#[derive(Clone, Copy, Debug, Default)]
pub struct VolumeStep {
    pub t: f32,
    pub sigma: f32,
}

/// Per-thread mutable kernel scratch.
///
/// Starts empty; kernels allocate lazily on first use. Dropped when the
/// worker finishes its task, which releases everything the thread grew.
#[derive(Default)]
pub struct ThreadScratch {
    pub transparent_shadow_intersections: Option<Vec<ShadowIntersection>>,
    pub decoupled_volume_steps: [Option<Vec<VolumeStep>>; VOLUME_STACK_SIZE],
    pub decoupled_volume_steps_index: usize,
}

impl ThreadScratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shadow intersection list, allocated on first use.
    pub fn shadow_intersections(&mut self, capacity: usize) -> &mut Vec<ShadowIntersection> {
        let list = self
            .transparent_shadow_intersections
            .get_or_insert_with(|| Vec::with_capacity(capacity));
        list.clear();
        list
    }
}

/// Everything a worker thread needs to run kernels: a private copy of the
/// shared globals plus owned scratch.
///
/// Construction and drop pair the shading-system per-thread hooks; a value
/// of this type must live exactly as long as the worker's task loop.
pub struct ThreadKernelGlobals {
    pub kg: KernelGlobals,
    pub scratch: ThreadScratch,
    shading: Option<Arc<dyn ShadingSystem>>,
}

impl ThreadKernelGlobals {
    pub fn new(master: &KernelGlobals, shading: Option<Arc<dyn ShadingSystem>>) -> Self {
        if let Some(shading) = &shading {
            shading.thread_init();
        }
        Self {
            kg: master.clone(),
            scratch: ThreadScratch::new(),
            shading,
        }
    }
}

impl Drop for ThreadKernelGlobals {
    fn drop(&mut self) {
        // Scratch vectors free themselves; the hook must still pair with
        // the init that ran at construction.
        if let Some(shading) = &self.shading {
            shading.thread_free();
        }
    }
}
