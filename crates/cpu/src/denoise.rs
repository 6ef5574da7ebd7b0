//! The denoiser pipeline: prefill of the multi-pass filter buffer from the
//! tile neighborhood, and per-pixel regression reconstruction driven by an
//! NLM-weighted Gramian.

use crate::globals::KernelGlobals;
use crate::kernel::{
    FilterStorage, KernelTable, Rect, TileNeighbors, XTWX_SIZE, XTWY_SIZE,
};
use crate::util::align_up;
use bumpalo::Bump;
use glam::Vec3;
use std::ptr;

/// Pass indices inside the prefilled filter buffer. Means sit on even
/// slots, the matching variance one above.
pub mod pass {
    pub const NORMAL_X: i32 = 0;
    pub const NORMAL_Y: i32 = 2;
    pub const NORMAL_Z: i32 = 4;
    pub const DEPTH: i32 = 6;
    pub const SHADOW: i32 = 8;
    pub const ALBEDO_R: i32 = 10;
    pub const ALBEDO_G: i32 = 12;
    pub const ALBEDO_B: i32 = 14;
    pub const COLOR_R: i32 = 16;
    pub const COLOR_G: i32 = 18;
    pub const COLOR_B: i32 = 20;

    /// Variance plane of a mean plane.
    pub const fn variance(mean: i32) -> i32 {
        mean + 1
    }
}

/// The planar denoise buffer: `passes × frames × (w × h)` floats with a
/// 4-aligned row width, pass `i` starting at `i · pass_stride`.
///
/// The flat layout is what the kernels consume; the typed accessors exist
/// so driver code and tests never hand-compute plane offsets.
pub struct FilterBuffer {
    data: Vec<f32>,
    w: i32,
    h: i32,
    frames: i32,
    passes: i32,
}

impl FilterBuffer {
    pub fn new(rect: Rect, frames: i32, cross: bool) -> Self {
        let w = align_up(rect.width(), 4);
        let h = rect.height();
        let passes = if cross { 28 } else { 22 };
        let frames = frames.max(1);

        Self {
            data: vec![0.0; (passes * w * h * frames) as usize],
            w,
            h,
            frames,
            passes,
        }
    }

    pub fn width(&self) -> i32 {
        self.w
    }

    pub fn height(&self) -> i32 {
        self.h
    }

    pub fn frames(&self) -> i32 {
        self.frames
    }

    pub fn passes(&self) -> i32 {
        self.passes
    }

    /// Elements between the start of consecutive passes.
    pub fn pass_stride(&self) -> i32 {
        self.w * self.h * self.frames
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Base pointer of one temporal frame slice.
    fn frame_base_mut(&mut self, frame: i32) -> *mut f32 {
        debug_assert!(frame < self.frames);
        unsafe { self.data.as_mut_ptr().offset((self.w * self.h * frame) as isize) }
    }

    /// One pass plane of one frame as a slice.
    pub fn pass_plane(&self, frame: i32, pass: i32) -> &[f32] {
        let start = (pass * self.pass_stride() + self.w * self.h * frame) as usize;
        &self.data[start..start + (self.w * self.h) as usize]
    }
}

/// Run the five-stage NLM filter over every offset of a (2r+1)² search
/// window, then normalize.
///
/// `out` and `weight_accum` are zeroed up front; they must not alias any
/// input plane. All planes are `align_up(rect_w, 4) × rect_h`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn non_local_means(
    kernels: &KernelTable,
    rect: Rect,
    image: *const f32,
    weight: *const f32,
    out: *mut f32,
    variance: *const f32,
    difference: *mut f32,
    blur_difference: *mut f32,
    weight_accum: *mut f32,
    r: i32,
    f: i32,
    a: f32,
    k_2: f32,
) {
    let w = align_up(rect.width(), 4);
    let h = rect.height();

    unsafe {
        ptr::write_bytes(weight_accum, 0, (w * h) as usize);
        ptr::write_bytes(out, 0, (w * h) as usize);
    }

    let span = 2 * r + 1;
    for i in 0..span * span {
        let dy = i / span - r;
        let dx = i % span - r;

        let local = Rect::new(
            (-dx).max(0),
            (-dy).max(0),
            rect.width() - dx.max(0),
            rect.height() - dy.max(0),
        );

        (kernels.filter_nlm_calc_difference)(dx, dy, weight, variance, difference, local, w, 0, a, k_2);
        (kernels.filter_nlm_blur)(difference, blur_difference, local, w, f);
        (kernels.filter_nlm_calc_weight)(blur_difference, difference, local, w, f);
        (kernels.filter_nlm_blur)(difference, blur_difference, local, w, f);
        (kernels.filter_nlm_update_output)(dx, dy, blur_difference, image, out, weight_accum, local, w, f);
    }

    (kernels.filter_nlm_normalize)(out, weight_accum, Rect::new(0, 0, rect.width(), rect.height()), w);
}

/// Build the denoise buffer for `rect` from the tile neighborhood: shadow
/// double-filtering, feature prefiltering, color copy, one slice per frame.
///
/// Returns ownership of the buffer to the caller.
#[allow(clippy::too_many_arguments)]
pub(crate) fn denoise_fill_buffer(
    kernels: &KernelTable,
    kg: &KernelGlobals,
    sample: i32,
    rect: Rect,
    tiles: &TileNeighbors,
    frames: i32,
    frame_strides: &[i32; 9],
) -> FilterBuffer {
    let cross = kg.data.film.denoise_cross != 0;
    let mut fb = FilterBuffer::new(rect, frames, cross);
    let ps = fb.pass_stride();

    for frame in 0..fb.frames() {
        let base = fb.frame_base_mut(frame);
        let p = |i: i32| unsafe { base.offset((i * ps) as isize) };

        let mut ftiles = *tiles;
        for i in 0..9 {
            if ftiles.buffers[i] != 0 {
                ftiles.buffers[i] +=
                    (frame_strides[i] * frame) as usize * std::mem::size_of::<f32>();
            }
        }

        // Step 1: prefilter the shadow feature, reusing pass slots as
        // scratch before they hold their final contents.
        {
            let sample_v = p(0);
            let sample_vv = p(1);
            let buffer_v = p(2);
            let clean_v = p(3);
            let unfiltered_a = p(4);
            let unfiltered_b = p(5);
            let t1 = p(10);
            let t2 = p(11);
            let t3 = p(12);

            for y in rect.y0..rect.y1 {
                for x in rect.x0..rect.x1 {
                    (kernels.filter_divide_shadow)(
                        kg, sample, &ftiles, x, y, unfiltered_a, unfiltered_b, sample_v,
                        sample_vv, buffer_v, rect,
                    );
                }
            }

            // Smooth the noisy buffer variance with the sample variance.
            non_local_means(
                kernels, rect, buffer_v, sample_v, clean_v, sample_vv, t1, t2, t3, 6, 3, 4.0, 1.0,
            );

            // Filter each half image using the other for weighting.
            non_local_means(
                kernels, rect, unfiltered_a, unfiltered_b, sample_v, clean_v, t1, t2, t3, 5, 3,
                1.0, 0.25,
            );
            non_local_means(
                kernels, rect, unfiltered_b, unfiltered_a, buffer_v, clean_v, t1, t2, t3, 5, 3,
                1.0, 0.25,
            );

            // Residual variance between the two filtered halves.
            for y in rect.y0..rect.y1 {
                for x in rect.x0..rect.x1 {
                    (kernels.filter_combine_halves)(
                        x,
                        y,
                        ptr::null_mut(),
                        sample_vv,
                        sample_v,
                        buffer_v,
                        rect,
                        2,
                    );
                }
            }

            // Second filter pass driven by the residual variance.
            non_local_means(
                kernels, rect, sample_v, buffer_v, unfiltered_a, sample_vv, t1, t2, t3, 4, 2,
                1.0, 0.5,
            );
            non_local_means(
                kernels, rect, buffer_v, sample_v, unfiltered_b, sample_vv, t1, t2, t3, 4, 2,
                1.0, 0.5,
            );

            // Combine the double-filtered halves into the shadow feature.
            for y in rect.y0..rect.y1 {
                for x in rect.x0..rect.x1 {
                    (kernels.filter_combine_halves)(
                        x,
                        y,
                        p(pass::SHADOW),
                        p(pass::variance(pass::SHADOW)),
                        unfiltered_a,
                        unfiltered_b,
                        rect,
                        0,
                    );
                }
            }
        }

        // Step 2: prefilter normals, albedo and depth.
        {
            let unfiltered = p(16);
            let t1 = p(17);
            let t2 = p(18);
            let t3 = p(19);

            let mean_from = [0, 1, 2, 6, 7, 8, 12];
            let variance_from = [3, 4, 5, 9, 10, 11, 13];
            let offset_to = [0, 2, 4, 10, 12, 14, 6];

            for i in 0..7 {
                for y in rect.y0..rect.y1 {
                    for x in rect.x0..rect.x1 {
                        (kernels.filter_get_feature)(
                            kg,
                            sample,
                            &ftiles,
                            mean_from[i],
                            variance_from[i],
                            x,
                            y,
                            unfiltered,
                            p(offset_to[i] + 1),
                            rect,
                        );
                    }
                }
                non_local_means(
                    kernels,
                    rect,
                    unfiltered,
                    unfiltered,
                    p(offset_to[i]),
                    p(offset_to[i] + 1),
                    t1,
                    t2,
                    t3,
                    2,
                    2,
                    1.0,
                    0.25,
                );
            }
        }

        // Step 3: copy the color passes; reconstruction filters color.
        {
            let (mean_from, variance_from, offset_to): (&[i32], &[i32], &[i32]) = if cross {
                (
                    &[20, 21, 22, 26, 27, 28],
                    &[23, 24, 25, 29, 30, 31],
                    &[16, 18, 20, 22, 24, 26],
                )
            } else {
                (&[20, 21, 22], &[23, 24, 25], &[16, 18, 20])
            };

            for i in 0..mean_from.len() {
                for y in rect.y0..rect.y1 {
                    for x in rect.x0..rect.x1 {
                        (kernels.filter_get_feature)(
                            kg,
                            sample,
                            &ftiles,
                            mean_from[i],
                            variance_from[i],
                            x,
                            y,
                            p(offset_to[i]),
                            p(offset_to[i] + 1),
                            rect,
                        );
                    }
                }
            }
        }
    }

    fb
}

/// Reconstruct `filter_area` from the prefilled buffer and write the result
/// into the film buffer.
#[allow(clippy::too_many_arguments)]
pub(crate) fn denoise_run(
    kernels: &KernelTable,
    kg: &KernelGlobals,
    sample: i32,
    fb: &mut FilterBuffer,
    filter_area: Rect,
    rect: Rect,
    offset: i32,
    stride: i32,
    buffers: *mut f32,
) {
    let hw = kg.data.integrator.half_window;
    let w = align_up(rect.width(), 4);
    let h = rect.height();
    let ps = fb.pass_stride();

    let storage_num = (filter_area.width() * filter_area.height()) as usize;
    let arena = Bump::new();
    let storage = arena.alloc_slice_fill_copy(storage_num, FilterStorage::default());
    let xtwx = arena.alloc_slice_fill_copy(storage_num * XTWX_SIZE, 0.0f32);
    let xtwy = arena.alloc_slice_fill_copy(storage_num * XTWY_SIZE, Vec3::ZERO);

    let base = fb.frame_base_mut(0);

    // Phase A: per-pixel regression transforms.
    for y in 0..filter_area.height() {
        for x in 0..filter_area.width() {
            let sidx = (y * filter_area.width() + x) as usize;
            (kernels.filter_construct_transform)(
                kg,
                sample,
                base,
                ps,
                x + filter_area.x0,
                y + filter_area.y0,
                &mut storage[sidx],
                rect,
            );
        }
    }

    // Phase B: NLM-weighted Gramian accumulation over the search window,
    // using the prefiltered color and its variance for the patch distance.
    {
        let f = 4;
        let a = 1.0;
        let k_2 = kg.data.integrator.weighting_adjust;
        let weight = unsafe { base.offset((pass::COLOR_R * ps) as isize) as *const f32 };
        let variance =
            unsafe { base.offset((pass::variance(pass::COLOR_R) * ps) as isize) as *const f32 };

        let difference = arena.alloc_slice_fill_copy((w * h) as usize, 0.0f32);
        let blur_difference = arena.alloc_slice_fill_copy((w * h) as usize, 0.0f32);

        let filter_rect = Rect::new(
            filter_area.x0 - rect.x0,
            filter_area.y0 - rect.y0,
            filter_area.x1 - rect.x0,
            filter_area.y1 - rect.y0,
        );

        let span = 2 * hw + 1;
        for i in 0..span * span {
            let dy = i / span - hw;
            let dx = i % span - hw;

            let local = Rect::new(
                (-dx).max(0),
                (-dy).max(0),
                rect.width() - dx.max(0),
                rect.height() - dy.max(0),
            );

            (kernels.filter_nlm_calc_difference)(
                dx,
                dy,
                weight,
                variance,
                difference.as_mut_ptr(),
                local,
                w,
                2 * ps,
                a,
                k_2,
            );
            (kernels.filter_nlm_blur)(difference.as_ptr(), blur_difference.as_mut_ptr(), local, w, f);
            (kernels.filter_nlm_calc_weight)(
                blur_difference.as_ptr(),
                difference.as_mut_ptr(),
                local,
                w,
                f,
            );
            (kernels.filter_nlm_blur)(difference.as_ptr(), blur_difference.as_mut_ptr(), local, w, f);
            (kernels.filter_nlm_construct_gramian)(
                dx,
                dy,
                blur_difference.as_ptr(),
                base,
                ps,
                storage.as_ptr(),
                xtwx.as_mut_ptr(),
                xtwy.as_mut_ptr(),
                local,
                filter_rect,
                w,
                h,
                f,
            );
        }
    }

    // Phase C: solve per pixel and write back.
    let buffer_params = [
        offset,
        stride,
        kg.data.film.pass_stride,
        kg.data.film.pass_no_denoising,
    ];
    for y in 0..filter_area.height() {
        for x in 0..filter_area.width() {
            (kernels.filter_finalize)(
                x + filter_area.x0,
                y + filter_area.y0,
                y * filter_area.width() + x,
                w,
                h,
                buffers,
                storage.as_ptr(),
                xtwx.as_mut_ptr(),
                xtwy.as_mut_ptr(),
                buffer_params,
                sample,
            );
        }
    }
}
