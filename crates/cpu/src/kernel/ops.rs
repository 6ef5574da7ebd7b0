//! Shared kernel implementations.
//!
//! Every function here is instantiated once per SIMD tier through the tier
//! modules in the parent; the code is written branch-light and stride-based
//! so the compiler can vectorize the 4-aligned inner loops.
//!
//! Buffers arrive as raw pointers because planes legitimately alias inside
//! one filter buffer (the prefilter reuses pass slots as scratch). Callers
//! guarantee every indexed element is in bounds and that output planes do
//! not overlap input planes within a single call.

use super::{FilterStorage, Rect, TileNeighbors, DENOISE_FEATURES, XTWX_SIZE, XTWY_SIZE};
use crate::globals::{KernelGlobals, ShadowIntersection, ThreadScratch};
use crate::util::align_up;
use glam::Vec3;
use half::f16;

#[inline(always)]
unsafe fn ld(p: *const f32, i: i32) -> f32 {
    *p.offset(i as isize)
}

#[inline(always)]
unsafe fn st(p: *mut f32, i: i32, v: f32) {
    *p.offset(i as isize) = v;
}

#[inline(always)]
unsafe fn acc(p: *mut f32, i: i32, v: f32) {
    *p.offset(i as isize) += v;
}

#[inline(always)]
fn hash_u32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^ (x >> 16)
}

#[inline(always)]
fn rng_next(state: &mut u32) -> f32 {
    *state = hash_u32(*state);
    (*state >> 8) as f32 * (1.0 / 16_777_216.0)
}

#[inline(always)]
fn sphere_hit(origin: Vec3, dir: Vec3, center: Vec3, radius: f32) -> Option<f32> {
    let oc = origin - center;
    let b = oc.dot(dir);
    let c = oc.dot(oc) - radius * radius;
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let t = -b - disc.sqrt();
    (t > 1e-4).then_some(t)
}

const LIGHT_DIR: Vec3 = Vec3::new(0.577_35, 0.577_35, -0.577_35);
const SPHERE_CENTER: Vec3 = Vec3::new(0.0, 0.0, 4.0);
const BLOCKER_CENTER: Vec3 = Vec3::new(1.2, 1.2, 2.6);

/// Accumulate one sample of the built-in procedural scene into the render
/// buffer: combined RGBA plus the denoising feature block when the film
/// carries one.
#[allow(clippy::too_many_arguments)]
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
    let film = &kg.data.film;
    let pass_stride = film.pass_stride.max(4);
    let index = offset + y * stride + x;

    unsafe {
        let pixel = buffer.offset((index * pass_stride) as isize);

        let seed = if rng_state.is_null() {
            hash_u32((x as u32).wrapping_mul(73_856_093) ^ (y as u32).wrapping_mul(19_349_663))
        } else {
            *rng_state.offset(index as isize)
        };
        let mut rng = seed ^ hash_u32(sample as u32 ^ 0x9e37_79b9);
        let ju = rng_next(&mut rng);
        let jv = rng_next(&mut rng);

        let origin = Vec3::ZERO;
        let dir = Vec3::new(
            (x as f32 + ju) * 1e-3 - 0.5,
            (y as f32 + jv) * 1e-3 - 0.5,
            1.0,
        )
        .normalize();

        let (color, normal, depth, albedo, visibility);
        if let Some(t) = sphere_hit(origin, dir, SPHERE_CENTER, 1.0) {
            let p = origin + dir * t;
            let n = (p - SPHERE_CENTER).normalize();

            // Transparent shadow ray toward the light, blockers recorded in
            // the per-thread scratch list.
            let hits = scratch.shadow_intersections(4);
            if let Some(ts) = sphere_hit(p + n * 1e-3, LIGHT_DIR, BLOCKER_CENTER, 0.6) {
                hits.push(ShadowIntersection { t: ts, opacity: 0.6 });
            }
            let mut vis = 1.0;
            for hit in hits.iter() {
                vis *= 1.0 - hit.opacity * (-hit.t * 0.1).exp();
            }

            let checker = (((p.x * 4.0).floor() + (p.y * 4.0).floor()) as i32 & 1) as f32;
            let alb = Vec3::new(0.8, 0.5 + 0.3 * checker, 0.3);
            let diffuse = n.dot(LIGHT_DIR).max(0.0) * vis;

            color = alb * (diffuse + 0.1);
            normal = n;
            depth = t;
            albedo = alb;
            visibility = vis;
        } else {
            let sky = Vec3::new(0.2, 0.35, 0.6).lerp(Vec3::new(0.8, 0.9, 1.0), dir.y * 0.5 + 0.5);
            color = sky;
            normal = -dir;
            depth = 1e3;
            albedo = sky;
            visibility = 1.0;
        }

        acc(pixel, 0, color.x);
        acc(pixel, 1, color.y);
        acc(pixel, 2, color.z);
        acc(pixel, 3, 1.0);

        if film.pass_denoising > 0 {
            let d = pixel.offset(film.pass_denoising as isize);
            for (i, v) in [normal.x, normal.y, normal.z].into_iter().enumerate() {
                acc(d, i as i32, v);
                acc(d, 3 + i as i32, v * v);
            }
            for (i, v) in [albedo.x, albedo.y, albedo.z].into_iter().enumerate() {
                acc(d, 6 + i as i32, v);
                acc(d, 9 + i as i32, v * v);
            }
            acc(d, 12, depth);
            acc(d, 13, depth * depth);

            // Shadow half images split by sample parity.
            let shadow = if sample & 1 == 0 { 14 } else { 16 };
            acc(d, shadow, visibility);
            acc(d, shadow + 1, visibility * visibility);

            let cross = film.denoise_cross != 0 && sample & 1 == 1;
            let color_base = if cross { 26 } else { 20 };
            for (i, v) in [color.x, color.y, color.z].into_iter().enumerate() {
                acc(d, color_base + i as i32, v);
                acc(d, color_base + 3 + i as i32, v * v);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
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
    let pass_stride = kg.data.film.pass_stride.max(4);
    let index = offset + y * stride + x;

    unsafe {
        let pixel = buffer.offset((index * pass_stride) as isize);
        let out = rgba.offset((index * 4) as isize);
        for c in 0..4 {
            *out.offset(c as isize) = f16::from_f32(ld(pixel, c) * sample_scale);
        }
    }
}

#[allow(clippy::too_many_arguments)]
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
    let pass_stride = kg.data.film.pass_stride.max(4);
    let index = offset + y * stride + x;

    unsafe {
        let pixel = buffer.offset((index * pass_stride) as isize);
        let out = rgba.offset((index * 4) as isize);
        for c in 0..4 {
            let v = (ld(pixel, c) * sample_scale).clamp(0.0, 1.0);
            *out.offset(c as isize) = (v * 255.0 + 0.5) as u8;
        }
    }
}

/// Evaluate the built-in shading function for one input element,
/// accumulating across samples.
#[allow(clippy::too_many_arguments)]
pub fn shader(
    _kg: &KernelGlobals,
    _scratch: &mut ThreadScratch,
    input: *const u32,
    output: *mut f32,
    output_luma: *mut f32,
    eval_type: i32,
    _filter: i32,
    x: i32,
    _offset: i32,
    sample: i32,
) {
    unsafe {
        let inp = input.offset((x * 4) as isize);
        let mut rng = hash_u32(*inp ^ (eval_type as u32).wrapping_mul(0x517c_c1b7))
            ^ hash_u32(*inp.offset(1) ^ sample as u32);

        let value = Vec3::new(rng_next(&mut rng), rng_next(&mut rng), rng_next(&mut rng));
        let out = output.offset((x * 4) as isize);
        if sample == 0 {
            st(out, 0, value.x);
            st(out, 1, value.y);
            st(out, 2, value.z);
            st(out, 3, 1.0);
        } else {
            acc(out, 0, value.x);
            acc(out, 1, value.y);
            acc(out, 2, value.z);
            acc(out, 3, 1.0);
        }

        if !output_luma.is_null() {
            let luma = value.dot(Vec3::new(0.2126, 0.7152, 0.0722));
            if sample == 0 {
                st(output_luma, x, luma);
            } else {
                acc(output_luma, x, luma);
            }
        }
    }
}

/// Split the raw shadow passes of pixel (x, y) into the two unfiltered half
/// images and the three variance estimates the shadow prefilter runs on.
///
/// Writes both halves: A and B occupy two contiguous planes.
#[allow(clippy::too_many_arguments)]
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
    let w = align_up(rect.width(), 4);
    let idx = (y - rect.y0) * w + (x - rect.x0);

    // Even samples land in half A, odd samples in half B.
    let n_a = ((sample + 1) / 2).max(1) as f32;
    let n_b = (sample / 2).max(1) as f32;

    unsafe {
        let d = tiles.pixel(&kg.data.film, x, y);

        let a = ld(d, 14) / n_a;
        let b = ld(d, 16) / n_b;
        let var_a = ((ld(d, 15) / n_a - a * a).max(0.0)) / n_a;
        let var_b = ((ld(d, 17) / n_b - b * b).max(0.0)) / n_b;

        st(unfiltered_a, idx, a);
        st(unfiltered_b, idx, b);

        let v = 0.5 * (var_a + var_b);
        st(sample_v, idx, v);
        st(sample_vv, idx, v * v * 2.0 / (n_a - 1.0).max(1.0));
        st(buffer_v, idx, 0.25 * (a - b) * (a - b));
    }
}

/// Extract one feature mean/variance pair from the render buffer into two
/// filter buffer planes.
#[allow(clippy::too_many_arguments)]
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
    let w = align_up(rect.width(), 4);
    let idx = (y - rect.y0) * w + (x - rect.x0);
    let n = sample.max(1) as f32;

    unsafe {
        let d = tiles.pixel(&kg.data.film, x, y);
        let m = ld(d, mean_from) / n;
        st(mean, idx, m);
        st(variance, idx, (ld(d, variance_from) / n - m * m).max(0.0) / n);
    }
}

/// Combine two half images into a mean and a variance estimate. `r == 0`
/// is the pointwise estimate; `r > 0` additionally averages the variance
/// over a (2r+1)² window clipped to the rect.
#[allow(clippy::too_many_arguments)]
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
    let w = align_up(rect.width(), 4);
    let idx = (y - rect.y0) * w + (x - rect.x0);

    unsafe {
        if !mean.is_null() {
            st(mean, idx, 0.5 * (ld(a, idx) + ld(b, idx)));
        }
        if !variance.is_null() {
            if r == 0 {
                let d = ld(a, idx) - ld(b, idx);
                st(variance, idx, 0.25 * d * d);
            } else {
                let mut sum = 0.0;
                let mut count = 0;
                for wy in (y - r).max(rect.y0)..(y + r + 1).min(rect.y1) {
                    for wx in (x - r).max(rect.x0)..(x + r + 1).min(rect.x1) {
                        let widx = (wy - rect.y0) * w + (wx - rect.x0);
                        let d = ld(a, widx) - ld(b, widx);
                        sum += 0.25 * d * d;
                        count += 1;
                    }
                }
                st(variance, idx, sum / count.max(1) as f32);
            }
        }
    }
}

#[inline(always)]
unsafe fn filter_feature(fb: *const f32, ps: i32, idx: i32, which: usize, x: i32, y: i32) -> f32 {
    // Plane offsets follow the prefilled pass layout: means sit on the even
    // slots 0/2/4 (normal), 6 (depth), 8 (shadow), 10/12/14 (albedo).
    match which {
        0 => x as f32,
        1 => y as f32,
        2 => ld(fb, idx),
        3 => ld(fb, 2 * ps + idx),
        4 => ld(fb, 4 * ps + idx),
        5 => ld(fb, 6 * ps + idx),
        6 => ld(fb, 8 * ps + idx),
        7 => ld(fb, 10 * ps + idx),
        8 => ld(fb, 12 * ps + idx),
        _ => ld(fb, 14 * ps + idx),
    }
}

/// Build the per-pixel regression transform: one inverse scale per feature,
/// estimated from the feature spread inside the pixel's search window.
#[allow(clippy::too_many_arguments)]
pub fn filter_construct_transform(
    kg: &KernelGlobals,
    _sample: i32,
    filter_buffer: *const f32,
    pass_stride: i32,
    x: i32,
    y: i32,
    storage: *mut FilterStorage,
    rect: Rect,
) {
    let w = align_up(rect.width(), 4);
    let hw = kg.data.integrator.half_window.max(1);

    let x0 = (x - hw).max(rect.x0);
    let x1 = (x + hw + 1).min(rect.x1);
    let y0 = (y - hw).max(rect.y0);
    let y1 = (y + hw + 1).min(rect.y1);

    unsafe {
        let mut scale = [1.0f32; DENOISE_FEATURES];
        for (which, slot) in scale.iter_mut().enumerate() {
            if which < 2 {
                // Screen position spread is the window radius itself.
                *slot = 1.0 / hw as f32;
                continue;
            }

            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            let mut count = 0;
            for wy in y0..y1 {
                for wx in x0..x1 {
                    let idx = (wy - rect.y0) * w + (wx - rect.x0);
                    let v = filter_feature(filter_buffer, pass_stride, idx, which, wx, wy);
                    sum += v;
                    sum_sq += v * v;
                    count += 1;
                }
            }
            let n = count.max(1) as f32;
            let mean = sum / n;
            let sigma = (sum_sq / n - mean * mean).max(0.0).sqrt();
            *slot = 1.0 / sigma.max(1e-4);
        }

        *storage = FilterStorage { scale };
    }
}

/// Legacy single-pass reconstruction: writes the prefiltered color straight
/// into the film buffer without the regression.
#[allow(clippy::too_many_arguments)]
pub fn filter_reconstruct(
    _kg: &KernelGlobals,
    sample: i32,
    filter_buffer: *const f32,
    pass_stride: i32,
    x: i32,
    y: i32,
    _storage: *const FilterStorage,
    buffer: *mut f32,
    buffer_params: [i32; 4],
    rect: Rect,
) {
    let w = align_up(rect.width(), 4);
    let idx = (y - rect.y0) * w + (x - rect.x0);
    let [offset, stride, film_pass_stride, pass_no_denoising] = buffer_params;

    unsafe {
        let dest = buffer
            .offset(((offset + y * stride + x) * film_pass_stride + pass_no_denoising) as isize);
        for c in 0..3 {
            st(dest, c, ld(filter_buffer, (16 + 2 * c) * pass_stride + idx) * sample as f32);
        }
    }
}

/// Divide the combined color pass of pixel (x, y) by its sample count.
pub fn filter_divide_combined(
    kg: &KernelGlobals,
    x: i32,
    y: i32,
    sample: i32,
    buffer: *mut f32,
    offset: i32,
    stride: i32,
) {
    let pass_stride = kg.data.film.pass_stride.max(4);
    let index = offset + y * stride + x;
    let scale = 1.0 / sample.max(1) as f32;

    unsafe {
        let pixel = buffer.offset((index * pass_stride) as isize);
        for c in 0..4 {
            st(pixel, c, ld(pixel, c) * scale);
        }
    }
}

/// Patch distance between every pixel and its (dx, dy) neighbor, normalized
/// by the pixel variances. Multi-channel images pass the plane distance in
/// `channel_offset` (0 means one channel).
#[allow(clippy::too_many_arguments)]
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
    let channels = if channel_offset > 0 { 3 } else { 1 };

    unsafe {
        for y in rect.y0..rect.y1 {
            for x in rect.x0..rect.x1 {
                let idx = y * w + x;
                let idx2 = (y + dy) * w + (x + dx);

                let mut diff = 0.0;
                for c in 0..channels {
                    let co = c * channel_offset;
                    let cdiff = ld(weight_image, co + idx) - ld(weight_image, co + idx2);
                    let pvar = ld(variance, co + idx);
                    let qvar = ld(variance, co + idx2);
                    diff += (cdiff * cdiff - a * (pvar + pvar.min(qvar)))
                        / (1e-8 + k_2 * (pvar + qvar));
                }
                if channels > 1 {
                    diff *= 1.0 / channels as f32;
                }
                st(difference, idx, diff);
            }
        }
    }
}

/// Vertical box blur of the difference plane, radius `f`, clipped to the rect.
pub fn filter_nlm_blur(difference: *const f32, out: *mut f32, rect: Rect, w: i32, f: i32) {
    unsafe {
        for y in rect.y0..rect.y1 {
            let low = (y - f).max(rect.y0);
            let high = (y + f + 1).min(rect.y1);
            let scale = 1.0 / (high - low) as f32;

            for x in rect.x0..rect.x1 {
                let mut sum = 0.0;
                for y1 in low..high {
                    sum += ld(difference, y1 * w + x);
                }
                st(out, y * w + x, sum * scale);
            }
        }
    }
}

/// Horizontal patch average of the blurred difference, mapped through the
/// exponential weight.
pub fn filter_nlm_calc_weight(difference: *const f32, out: *mut f32, rect: Rect, w: i32, f: i32) {
    unsafe {
        for y in rect.y0..rect.y1 {
            for x in rect.x0..rect.x1 {
                let low = (x - f).max(rect.x0);
                let high = (x + f + 1).min(rect.x1);

                let mut sum = 0.0;
                for x1 in low..high {
                    sum += ld(difference, y * w + x1);
                }
                let avg = sum / (high - low) as f32;
                st(out, y * w + x, (-avg.max(0.0)).exp());
            }
        }
    }
}

/// Accumulate the weighted (dx, dy) neighbor into the output image and the
/// weight accumulator.
#[allow(clippy::too_many_arguments)]
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
    unsafe {
        for y in rect.y0..rect.y1 {
            for x in rect.x0..rect.x1 {
                let low = (x - f).max(rect.x0);
                let high = (x + f + 1).min(rect.x1);

                let mut sum = 0.0;
                for x1 in low..high {
                    sum += ld(difference, y * w + x1);
                }
                let weight = sum / (high - low) as f32;

                let idx = y * w + x;
                acc(accum, idx, weight);
                acc(out, idx, weight * ld(image, (y + dy) * w + (x + dx)));
            }
        }
    }
}

/// Divide the accumulated output by the accumulated weights.
pub fn filter_nlm_normalize(out: *mut f32, accum: *const f32, rect: Rect, w: i32) {
    unsafe {
        for y in rect.y0..rect.y1 {
            for x in rect.x0..rect.x1 {
                let idx = y * w + x;
                st(out, idx, ld(out, idx) / ld(accum, idx).max(1e-10));
            }
        }
    }
}

/// Accumulate the weighted (dx, dy) neighbor into every output pixel's
/// normal-equation Gramian instead of averaging pixels directly.
///
/// The feature vector is relative to the output pixel, so the first basis
/// function is the constant 1 and the regression solution's first component
/// is the reconstructed color.
#[allow(clippy::too_many_arguments)]
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
    _h: i32,
    f: i32,
) {
    let x0 = rect.x0.max(filter_rect.x0);
    let x1 = rect.x1.min(filter_rect.x1);
    let y0 = rect.y0.max(filter_rect.y0);
    let y1 = rect.y1.min(filter_rect.y1);

    unsafe {
        for y in y0..y1 {
            for x in x0..x1 {
                let low = (x - f).max(rect.x0);
                let high = (x + f + 1).min(rect.x1);

                let mut sum = 0.0;
                for sx in low..high {
                    sum += ld(difference, y * w + sx);
                }
                let weight = sum / (high - low) as f32;

                let idx = y * w + x;
                let idx2 = (y + dy) * w + (x + dx);
                let sidx = (y - filter_rect.y0) * filter_rect.width() + (x - filter_rect.x0);
                let scale = &(*storage.offset(sidx as isize)).scale;

                let mut design = [0.0f32; XTWY_SIZE];
                design[0] = 1.0;
                for i in 0..DENOISE_FEATURES {
                    let p = filter_feature(filter_buffer, pass_stride, idx, i, x, y);
                    let q = filter_feature(filter_buffer, pass_stride, idx2, i, x + dx, y + dy);
                    design[i + 1] = (q - p) * scale[i];
                }

                let color = Vec3::new(
                    ld(filter_buffer, 16 * pass_stride + idx2),
                    ld(filter_buffer, 18 * pass_stride + idx2),
                    ld(filter_buffer, 20 * pass_stride + idx2),
                );

                let mat = xtwx.offset((sidx as isize) * XTWX_SIZE as isize);
                let rhs = xtwy.offset((sidx as isize) * XTWY_SIZE as isize);
                for i in 0..XTWY_SIZE {
                    let wi = weight * design[i];
                    for j in 0..XTWY_SIZE {
                        *mat.add(i * XTWY_SIZE + j) += wi * design[j];
                    }
                    *rhs.add(i) += wi * color;
                }
            }
        }
    }
}

/// Solve the accumulated normal equations for pixel (x, y) and write the
/// reconstructed color back into the film buffer.
#[allow(clippy::too_many_arguments)]
pub fn filter_finalize(
    x: i32,
    y: i32,
    storage_ofs: i32,
    _w: i32,
    _h: i32,
    buffer: *mut f32,
    _storage: *const FilterStorage,
    xtwx: *mut f32,
    xtwy: *mut Vec3,
    buffer_params: [i32; 4],
    sample: i32,
) {
    let [offset, stride, film_pass_stride, pass_no_denoising] = buffer_params;

    unsafe {
        let mat_in = xtwx.offset((storage_ofs as isize) * XTWX_SIZE as isize);
        let rhs_in = xtwy.offset((storage_ofs as isize) * XTWY_SIZE as isize);

        let mut mat = [[0.0f32; XTWY_SIZE]; XTWY_SIZE];
        let mut rhs = [Vec3::ZERO; XTWY_SIZE];
        let mut trace = 0.0;
        for i in 0..XTWY_SIZE {
            for j in 0..XTWY_SIZE {
                mat[i][j] = *mat_in.add(i * XTWY_SIZE + j);
            }
            rhs[i] = *rhs_in.add(i);
            trace += mat[i][i];
        }

        // Ridge term keeps near-degenerate feature windows solvable.
        let ridge = 1e-3 * (trace / XTWY_SIZE as f32) + 1e-8;
        for (i, row) in mat.iter_mut().enumerate() {
            row[i] += ridge;
        }

        // Gaussian elimination with partial pivoting, three right-hand
        // sides solved at once.
        for col in 0..XTWY_SIZE {
            let mut pivot = col;
            for row in col + 1..XTWY_SIZE {
                if mat[row][col].abs() > mat[pivot][col].abs() {
                    pivot = row;
                }
            }
            mat.swap(col, pivot);
            rhs.swap(col, pivot);

            let diag = mat[col][col];
            if diag.abs() < 1e-12 {
                continue;
            }
            for row in col + 1..XTWY_SIZE {
                let factor = mat[row][col] / diag;
                for k in col..XTWY_SIZE {
                    mat[row][k] -= factor * mat[col][k];
                }
                rhs[row] = rhs[row] - rhs[col] * factor;
            }
        }
        for col in (0..XTWY_SIZE).rev() {
            let mut value = rhs[col];
            for k in col + 1..XTWY_SIZE {
                value = value - rhs[k] * mat[col][k];
            }
            let diag = mat[col][col];
            rhs[col] = if diag.abs() < 1e-12 {
                Vec3::ZERO
            } else {
                value / diag
            };
        }

        let color = rhs[0].max(Vec3::ZERO) * sample as f32;
        let dest = buffer
            .offset(((offset + y * stride + x) * film_pass_stride + pass_no_denoising) as isize);
        st(dest, 0, color.x);
        st(dest, 1, color.y);
        st(dest, 2, color.z);
    }
}
