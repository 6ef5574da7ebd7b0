//! The kernel suite and its six SIMD tiers.
//!
//! One shared implementation lives in [`ops`]; each tier re-exposes it
//! inside a `#[target_feature]` frame so the compiler vectorizes the whole
//! suite per instruction set. The dispatch table binds one tier at device
//! construction and never re-selects.

pub(crate) mod ops;

use crate::globals::{KernelFilm, KernelGlobals, ThreadScratch};
use glam::Vec3;
use half::f16;

/// Number of features the reconstruction regression uses per pixel:
/// screen x/y, normal xyz, depth, shadow, albedo rgb.
pub const DENOISE_FEATURES: usize = 10;

/// Floats in one per-pixel Gramian matrix.
pub const XTWX_SIZE: usize = (DENOISE_FEATURES + 1) * (DENOISE_FEATURES + 1);

/// Entries in one per-pixel normal-equation right-hand side.
pub const XTWY_SIZE: usize = DENOISE_FEATURES + 1;

/// A half-open pixel rectangle `[x0, x1) × [y0, y1)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl Rect {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> i32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> i32 {
        self.y1 - self.y0
    }
}

/// The 3×3 tile neighborhood a denoise pass reads from, index 4 = center.
///
/// `buffers` are host addresses of the neighbor render buffers (0 when the
/// neighbor does not exist); `tile_x`/`tile_y` are the column and row
/// boundaries of the neighborhood.
#[derive(Clone, Copy, Debug, Default)]
pub struct TileNeighbors {
    pub buffers: [usize; 9],
    pub tile_x: [i32; 4],
    pub tile_y: [i32; 4],
    pub offsets: [i32; 9],
    pub strides: [i32; 9],
}

impl TileNeighbors {
    /// Pointer to the denoising feature block of pixel (x, y) inside
    /// whichever neighbor tile contains it.
    ///
    /// # Safety
    /// (x, y) must lie inside the neighborhood and the containing tile's
    /// buffer must be live and sized for `film.pass_stride`.
    pub unsafe fn pixel(&self, film: &KernelFilm, x: i32, y: i32) -> *const f32 {
        let col = if x < self.tile_x[1] {
            0
        } else if x < self.tile_x[2] {
            1
        } else {
            2
        };
        let row = if y < self.tile_y[1] {
            0
        } else if y < self.tile_y[2] {
            1
        } else {
            2
        };
        let tile = row * 3 + col;

        let base = self.buffers[tile] as *const f32;
        let index = self.offsets[tile] + y * self.strides[tile] + x;
        base.offset((index * film.pass_stride + film.pass_denoising) as isize)
    }
}

/// Per-output-pixel reconstruction transform: one inverse scale per
/// regression feature, estimated from the local feature window.
#[derive(Clone, Copy, Debug)]
pub struct FilterStorage {
    pub scale: [f32; DENOISE_FEATURES],
}

impl Default for FilterStorage {
    fn default() -> Self {
        Self {
            scale: [1.0; DENOISE_FEATURES],
        }
    }
}

pub type PathTraceFn = fn(&KernelGlobals, &mut ThreadScratch, *mut f32, *mut u32, i32, i32, i32, i32, i32);
pub type ConvertToHalfFloatFn = fn(&KernelGlobals, *mut f16, *const f32, f32, i32, i32, i32, i32);
pub type ConvertToByteFn = fn(&KernelGlobals, *mut u8, *const f32, f32, i32, i32, i32, i32);
pub type ShaderFn =
    fn(&KernelGlobals, &mut ThreadScratch, *const u32, *mut f32, *mut f32, i32, i32, i32, i32, i32);

pub type FilterDivideShadowFn = fn(
    &KernelGlobals,
    i32,
    &TileNeighbors,
    i32,
    i32,
    *mut f32,
    *mut f32,
    *mut f32,
    *mut f32,
    *mut f32,
    Rect,
);
pub type FilterGetFeatureFn =
    fn(&KernelGlobals, i32, &TileNeighbors, i32, i32, i32, i32, *mut f32, *mut f32, Rect);
pub type FilterCombineHalvesFn = fn(i32, i32, *mut f32, *mut f32, *const f32, *const f32, Rect, i32);
pub type FilterConstructTransformFn =
    fn(&KernelGlobals, i32, *const f32, i32, i32, i32, *mut FilterStorage, Rect);
pub type FilterReconstructFn =
    fn(&KernelGlobals, i32, *const f32, i32, i32, i32, *const FilterStorage, *mut f32, [i32; 4], Rect);
pub type FilterDivideCombinedFn = fn(&KernelGlobals, i32, i32, i32, *mut f32, i32, i32);

pub type NlmCalcDifferenceFn =
    fn(i32, i32, *const f32, *const f32, *mut f32, Rect, i32, i32, f32, f32);
pub type NlmBlurFn = fn(*const f32, *mut f32, Rect, i32, i32);
pub type NlmCalcWeightFn = fn(*const f32, *mut f32, Rect, i32, i32);
pub type NlmUpdateOutputFn =
    fn(i32, i32, *const f32, *const f32, *mut f32, *mut f32, Rect, i32, i32);
pub type NlmNormalizeFn = fn(*mut f32, *const f32, Rect, i32);
pub type NlmConstructGramianFn = fn(
    i32,
    i32,
    *const f32,
    *const f32,
    i32,
    *const FilterStorage,
    *mut f32,
    *mut Vec3,
    Rect,
    Rect,
    i32,
    i32,
    i32,
);
pub type FilterFinalizeFn =
    fn(i32, i32, i32, i32, i32, *mut f32, *const FilterStorage, *mut f32, *mut Vec3, [i32; 4], i32);

/// One bound kernel implementation per abstract slot.
///
/// Built once at device construction from the highest SIMD tier the host
/// supports; copy freely, the fields are plain function pointers.
#[derive(Clone, Copy)]
pub struct KernelTable {
    pub path_trace: PathTraceFn,
    pub convert_to_half_float: ConvertToHalfFloatFn,
    pub convert_to_byte: ConvertToByteFn,
    pub shader: ShaderFn,

    pub filter_divide_shadow: FilterDivideShadowFn,
    pub filter_get_feature: FilterGetFeatureFn,
    pub filter_combine_halves: FilterCombineHalvesFn,
    pub filter_construct_transform: FilterConstructTransformFn,
    pub filter_reconstruct: FilterReconstructFn,
    pub filter_divide_combined: FilterDivideCombinedFn,

    pub filter_nlm_calc_difference: NlmCalcDifferenceFn,
    pub filter_nlm_blur: NlmBlurFn,
    pub filter_nlm_calc_weight: NlmCalcWeightFn,
    pub filter_nlm_update_output: NlmUpdateOutputFn,
    pub filter_nlm_normalize: NlmNormalizeFn,

    pub filter_nlm_construct_gramian: NlmConstructGramianFn,
    pub filter_finalize: FilterFinalizeFn,
}

macro_rules! kernel_tier {
    ($name:ident) => {
        kernel_tier!(@imp $name,);
    };
    ($name:ident, $feature:literal) => {
        kernel_tier!(@imp $name, $feature);
    };
    (@imp $name:ident, $($feature:literal)?) => {
        pub mod $name {
            use super::ops;
            use super::{FilterStorage, Rect, TileNeighbors};
            use crate::globals::{KernelGlobals, ThreadScratch};
            use glam::Vec3;
            use half::f16;

            /// Run `f` inside this tier's instruction-set frame.
            #[allow(unreachable_code)]
            #[inline(always)]
            fn vectorize<R>(f: impl FnOnce() -> R) -> R {
                $(
                    #[cfg(target_arch = "x86_64")]
                    {
                        #[target_feature(enable = $feature)]
                        unsafe fn run<R, F: FnOnce() -> R>(f: F) -> R {
                            f()
                        }
                        // SAFETY: this tier is only bound after the runtime
                        // probe for its feature set succeeded.
                        return unsafe { run(f) };
                    }
                )?
                f()
            }

            pub fn path_trace(
                kg: &KernelGlobals,
                scratch: &mut ThreadScratch,
                buffer: *mut f32,
                rng_state: *mut u32,
                sample: i32,
                x: i32,
                y: i32,
                offset: i32,
                stride: i32,
            ) {
                vectorize(
                    #[inline(always)]
                    || ops::path_trace(kg, scratch, buffer, rng_state, sample, x, y, offset, stride),
                )
            }

            pub fn convert_to_half_float(
                kg: &KernelGlobals,
                rgba: *mut f16,
                buffer: *const f32,
                sample_scale: f32,
                x: i32,
                y: i32,
                offset: i32,
                stride: i32,
            ) {
                vectorize(
                    #[inline(always)]
                    || ops::convert_to_half_float(kg, rgba, buffer, sample_scale, x, y, offset, stride),
                )
            }

            pub fn convert_to_byte(
                kg: &KernelGlobals,
                rgba: *mut u8,
                buffer: *const f32,
                sample_scale: f32,
                x: i32,
                y: i32,
                offset: i32,
                stride: i32,
            ) {
                vectorize(
                    #[inline(always)]
                    || ops::convert_to_byte(kg, rgba, buffer, sample_scale, x, y, offset, stride),
                )
            }

            pub fn shader(
                kg: &KernelGlobals,
                scratch: &mut ThreadScratch,
                input: *const u32,
                output: *mut f32,
                output_luma: *mut f32,
                eval_type: i32,
                filter: i32,
                x: i32,
                offset: i32,
                sample: i32,
            ) {
                vectorize(
                    #[inline(always)]
                    || {
                        ops::shader(
                            kg, scratch, input, output, output_luma, eval_type, filter, x, offset,
                            sample,
                        )
                    },
                )
            }

            pub fn filter_divide_shadow(
                kg: &KernelGlobals,
                sample: i32,
                tiles: &TileNeighbors,
                x: i32,
                y: i32,
                unfiltered_a: *mut f32,
                unfiltered_b: *mut f32,
                sample_v: *mut f32,
                sample_vv: *mut f32,
                buffer_v: *mut f32,
                rect: Rect,
            ) {
                vectorize(
                    #[inline(always)]
                    || {
                        ops::filter_divide_shadow(
                            kg, sample, tiles, x, y, unfiltered_a, unfiltered_b, sample_v,
                            sample_vv, buffer_v, rect,
                        )
                    },
                )
            }

            pub fn filter_get_feature(
                kg: &KernelGlobals,
                sample: i32,
                tiles: &TileNeighbors,
                mean_from: i32,
                variance_from: i32,
                x: i32,
                y: i32,
                mean: *mut f32,
                variance: *mut f32,
                rect: Rect,
            ) {
                vectorize(
                    #[inline(always)]
                    || {
                        ops::filter_get_feature(
                            kg, sample, tiles, mean_from, variance_from, x, y, mean, variance, rect,
                        )
                    },
                )
            }

            pub fn filter_combine_halves(
                x: i32,
                y: i32,
                mean: *mut f32,
                variance: *mut f32,
                a: *const f32,
                b: *const f32,
                rect: Rect,
                r: i32,
            ) {
                vectorize(
                    #[inline(always)]
                    || ops::filter_combine_halves(x, y, mean, variance, a, b, rect, r),
                )
            }

            pub fn filter_construct_transform(
                kg: &KernelGlobals,
                sample: i32,
                filter_buffer: *const f32,
                pass_stride: i32,
                x: i32,
                y: i32,
                storage: *mut FilterStorage,
                rect: Rect,
            ) {
                vectorize(
                    #[inline(always)]
                    || {
                        ops::filter_construct_transform(
                            kg, sample, filter_buffer, pass_stride, x, y, storage, rect,
                        )
                    },
                )
            }

            pub fn filter_reconstruct(
                kg: &KernelGlobals,
                sample: i32,
                filter_buffer: *const f32,
                pass_stride: i32,
                x: i32,
                y: i32,
                storage: *const FilterStorage,
                buffer: *mut f32,
                buffer_params: [i32; 4],
                rect: Rect,
            ) {
                vectorize(
                    #[inline(always)]
                    || {
                        ops::filter_reconstruct(
                            kg, sample, filter_buffer, pass_stride, x, y, storage, buffer,
                            buffer_params, rect,
                        )
                    },
                )
            }

            pub fn filter_divide_combined(
                kg: &KernelGlobals,
                x: i32,
                y: i32,
                sample: i32,
                buffer: *mut f32,
                offset: i32,
                stride: i32,
            ) {
                vectorize(
                    #[inline(always)]
                    || ops::filter_divide_combined(kg, x, y, sample, buffer, offset, stride),
                )
            }

            pub fn filter_nlm_calc_difference(
                dx: i32,
                dy: i32,
                weight_image: *const f32,
                variance: *const f32,
                difference: *mut f32,
                rect: Rect,
                w: i32,
                channel_offset: i32,
                a: f32,
                k_2: f32,
            ) {
                vectorize(
                    #[inline(always)]
                    || {
                        ops::filter_nlm_calc_difference(
                            dx, dy, weight_image, variance, difference, rect, w, channel_offset,
                            a, k_2,
                        )
                    },
                )
            }

            pub fn filter_nlm_blur(difference: *const f32, out: *mut f32, rect: Rect, w: i32, f: i32) {
                vectorize(
                    #[inline(always)]
                    || ops::filter_nlm_blur(difference, out, rect, w, f),
                )
            }

            pub fn filter_nlm_calc_weight(
                difference: *const f32,
                out: *mut f32,
                rect: Rect,
                w: i32,
                f: i32,
            ) {
                vectorize(
                    #[inline(always)]
                    || ops::filter_nlm_calc_weight(difference, out, rect, w, f),
                )
            }

            pub fn filter_nlm_update_output(
                dx: i32,
                dy: i32,
                difference: *const f32,
                image: *const f32,
                out: *mut f32,
                accum: *mut f32,
                rect: Rect,
                w: i32,
                f: i32,
            ) {
                vectorize(
                    #[inline(always)]
                    || ops::filter_nlm_update_output(dx, dy, difference, image, out, accum, rect, w, f),
                )
            }

            pub fn filter_nlm_normalize(out: *mut f32, accum: *const f32, rect: Rect, w: i32) {
                vectorize(
                    #[inline(always)]
                    || ops::filter_nlm_normalize(out, accum, rect, w),
                )
            }

            pub fn filter_nlm_construct_gramian(
                dx: i32,
                dy: i32,
                difference: *const f32,
                filter_buffer: *const f32,
                pass_stride: i32,
                storage: *const FilterStorage,
                xtwx: *mut f32,
                xtwy: *mut Vec3,
                rect: Rect,
                filter_rect: Rect,
                w: i32,
                h: i32,
                f: i32,
            ) {
                vectorize(
                    #[inline(always)]
                    || {
                        ops::filter_nlm_construct_gramian(
                            dx, dy, difference, filter_buffer, pass_stride, storage, xtwx, xtwy,
                            rect, filter_rect, w, h, f,
                        )
                    },
                )
            }

            pub fn filter_finalize(
                x: i32,
                y: i32,
                storage_ofs: i32,
                w: i32,
                h: i32,
                buffer: *mut f32,
                storage: *const FilterStorage,
                xtwx: *mut f32,
                xtwy: *mut Vec3,
                buffer_params: [i32; 4],
                sample: i32,
            ) {
                vectorize(
                    #[inline(always)]
                    || {
                        ops::filter_finalize(
                            x, y, storage_ofs, w, h, buffer, storage, xtwx, xtwy, buffer_params,
                            sample,
                        )
                    },
                )
            }
        }
    };
}

kernel_tier!(default);
kernel_tier!(sse2, "sse2");
kernel_tier!(sse3, "sse3");
kernel_tier!(sse41, "sse4.1");
kernel_tier!(avx, "avx");
kernel_tier!(avx2, "avx2,fma");

/// Build a [`KernelTable`] over one tier module.
macro_rules! kernel_table {
    ($tier:ident) => {
        KernelTable {
            path_trace: $tier::path_trace,
            convert_to_half_float: $tier::convert_to_half_float,
            convert_to_byte: $tier::convert_to_byte,
            shader: $tier::shader,
            filter_divide_shadow: $tier::filter_divide_shadow,
            filter_get_feature: $tier::filter_get_feature,
            filter_combine_halves: $tier::filter_combine_halves,
            filter_construct_transform: $tier::filter_construct_transform,
            filter_reconstruct: $tier::filter_reconstruct,
            filter_divide_combined: $tier::filter_divide_combined,
            filter_nlm_calc_difference: $tier::filter_nlm_calc_difference,
            filter_nlm_blur: $tier::filter_nlm_blur,
            filter_nlm_calc_weight: $tier::filter_nlm_calc_weight,
            filter_nlm_update_output: $tier::filter_nlm_update_output,
            filter_nlm_normalize: $tier::filter_nlm_normalize,
            filter_nlm_construct_gramian: $tier::filter_nlm_construct_gramian,
            filter_finalize: $tier::filter_finalize,
        }
    };
}

pub(crate) use kernel_table;
