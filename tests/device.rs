use emberpath::cpu::{CpuCapabilities, CpuDevice, KernelData, KernelGlobals, KernelTable, ThreadScratch};
use emberpath::{
    BufferParams, Device, DeviceTask, RenderTile, ShadingSystem, TaskType, TileTask,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn base_table() -> KernelTable {
    KernelTable::select_for(&CpuCapabilities::none()).0
}

fn film_data(pass_stride: i32) -> KernelData {
    let mut data = KernelData::default();
    data.film.pass_stride = pass_stride;
    data
}

/// Hand out tiles from a fixed list, one per acquire, then report
/// exhaustion.
fn tile_queue(tiles: Vec<RenderTile>) -> Arc<dyn Fn(&mut RenderTile) -> bool + Send + Sync> {
    let queue = Mutex::new(tiles);
    Arc::new(move |out: &mut RenderTile| {
        let mut queue = queue.lock().unwrap();
        match queue.pop() {
            Some(tile) => {
                *out = tile;
                true
            }
            None => false,
        }
    })
}

fn collect_released() -> (
    Arc<dyn Fn(RenderTile) + Send + Sync>,
    Arc<Mutex<Vec<RenderTile>>>,
) {
    let released = Arc::new(Mutex::new(Vec::new()));
    let sink = released.clone();
    (
        Arc::new(move |tile| sink.lock().unwrap().push(tile)),
        released,
    )
}

fn path_trace_tile(w: i32, h: i32, buffer: usize, samples: i32) -> RenderTile {
    RenderTile {
        x: 0,
        y: 0,
        w,
        h,
        offset: 0,
        stride: w,
        sample: 0,
        start_sample: 0,
        num_samples: samples,
        buffer,
        rng_state: 0,
        task: TileTask::PathTrace,
        params: BufferParams {
            width: w as usize,
            height: h as usize,
            passes_size: 4,
            overscan: 0,
            frames: 1,
        },
    }
}

// -- scenario: one PATH_TRACE sample writes every pixel -----------------

fn gradient_path_trace(
    kg: &KernelGlobals,
    _scratch: &mut ThreadScratch,
    buffer: *mut f32,
    _rng_state: *mut u32,
    _sample: i32,
    x: i32,
    y: i32,
    offset: i32,
    stride: i32,
) {
    let ps = kg.data.film.pass_stride.max(1);
    unsafe {
        *buffer.offset(((offset + y * stride + x) * ps) as isize) = ((x + y) % 256) as f32;
    }
}

#[test]
fn path_trace_fills_the_tile_and_advances_sample() {
    let mut table = base_table();
    table.path_trace = gradient_path_trace;
    let device = CpuDevice::with_kernels(table, 2);
    device
        .const_copy_to("data", bytemuck::bytes_of(&film_data(4)))
        .unwrap();

    let mut buffer = vec![0.0f32; 16 * 16 * 4];
    let buffer_addr = buffer.as_mut_ptr() as usize;

    let mut task = DeviceTask::new(TaskType::Render);
    task.acquire_tile = tile_queue(vec![path_trace_tile(16, 16, buffer_addr, 1)]);
    let (release, released) = collect_released();
    task.release_tile = release;

    device.task_add(task);
    device.task_wait();

    let released = released.lock().unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].sample, 1);

    for y in 0..16i32 {
        for x in 0..16i32 {
            assert_eq!(
                buffer[((y * 16 + x) * 4) as usize],
                ((x + y) % 256) as f32,
                "pixel ({x},{y})"
            );
        }
    }
}

// -- scenario: sample accumulation is linear ----------------------------

fn accumulating_path_trace(
    kg: &KernelGlobals,
    _scratch: &mut ThreadScratch,
    buffer: *mut f32,
    _rng_state: *mut u32,
    sample: i32,
    x: i32,
    y: i32,
    offset: i32,
    stride: i32,
) {
    let ps = kg.data.film.pass_stride.max(1);
    let value = (x * 3 + y * 7 + sample * 11) as f32;
    unsafe {
        *buffer.offset(((offset + y * stride + x) * ps) as isize) += value;
    }
}

#[test]
fn split_sample_ranges_match_one_shot_rendering() {
    let mut table = base_table();
    table.path_trace = accumulating_path_trace;

    let run = |ranges: &[(i32, i32)]| -> Vec<f32> {
        let device = CpuDevice::with_kernels(table, 1);
        device
            .const_copy_to("data", bytemuck::bytes_of(&film_data(4)))
            .unwrap();

        let mut buffer = vec![0.0f32; 8 * 8 * 4];
        let buffer_addr = buffer.as_mut_ptr() as usize;

        for &(start, count) in ranges {
            let mut tile = path_trace_tile(8, 8, buffer_addr, count);
            tile.start_sample = start;

            let mut task = DeviceTask::new(TaskType::Render);
            task.acquire_tile = tile_queue(vec![tile]);
            device.task_add(task);
            device.task_wait();
        }
        buffer
    };

    assert_eq!(run(&[(0, 2), (2, 2)]), run(&[(0, 4)]));
}

// -- scenario: cancellation is live and scratch is paired ---------------

struct HookCounter {
    inits: AtomicUsize,
    frees: AtomicUsize,
}

impl ShadingSystem for HookCounter {
    fn thread_init(&self) {
        self.inits.fetch_add(1, Ordering::SeqCst);
    }
    fn thread_free(&self) {
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn cancel_mid_render_returns_promptly() {
    let mut table = base_table();
    table.path_trace = gradient_path_trace;
    let device = CpuDevice::with_kernels(table, 2);
    device
        .const_copy_to("data", bytemuck::bytes_of(&film_data(4)))
        .unwrap();

    let hooks = Arc::new(HookCounter {
        inits: AtomicUsize::new(0),
        frees: AtomicUsize::new(0),
    });
    device.set_shading_system(Some(hooks.clone() as Arc<dyn ShadingSystem>));

    let mut buffer = vec![0.0f32; 64 * 64 * 4];
    let buffer_addr = buffer.as_mut_ptr() as usize;

    let tiles: Vec<RenderTile> = (0..32)
        .map(|_| path_trace_tile(64, 64, buffer_addr, 64))
        .collect();

    let mut task = DeviceTask::new(TaskType::Render);
    task.acquire_tile = tile_queue(tiles);
    let (release, released) = collect_released();
    task.release_tile = release;

    let cancel_flag = Arc::new(AtomicBool::new(false));
    {
        let cancel_flag = cancel_flag.clone();
        task.get_cancel = Arc::new(move || cancel_flag.load(Ordering::SeqCst));
    }
    {
        let cancel_flag = cancel_flag.clone();
        // Ask for cancellation as soon as the first sample reports in.
        task.update_progress = Arc::new(move |_, _| cancel_flag.store(true, Ordering::SeqCst));
    }

    device.task_add(task);

    // Let at least one tile go through before cancelling.
    while released.lock().unwrap().is_empty() {
        std::thread::sleep(Duration::from_millis(1));
    }

    let start = Instant::now();
    device.task_cancel();
    device.task_wait();
    assert!(start.elapsed() < Duration::from_millis(100));

    assert!(!released.lock().unwrap().is_empty());
    assert_eq!(
        hooks.inits.load(Ordering::SeqCst),
        hooks.frees.load(Ordering::SeqCst),
        "per-thread globals must pair init and free"
    );
}

// -- scenario: film convert matches the kernel contract -----------------

#[test]
fn film_convert_scales_and_quantizes() {
    let device = CpuDevice::with_kernels(base_table(), 1);
    device
        .const_copy_to("data", bytemuck::bytes_of(&film_data(4)))
        .unwrap();

    let mut buffer = vec![0.0f32; 4 * 4 * 4];
    for y in 0..4 {
        for x in 0..4 {
            let p = (y * 4 + x) * 4;
            buffer[p] = x as f32;
            buffer[p + 1] = y as f32;
            buffer[p + 2] = 0.0;
            buffer[p + 3] = 1.0;
        }
    }
    let mut rgba = vec![0u8; 4 * 4 * 4];

    let mut task = DeviceTask::new(TaskType::FilmConvert);
    task.x = 0;
    task.y = 0;
    task.w = 4;
    task.h = 4;
    task.sample = 3;
    task.offset = 0;
    task.stride = 4;
    task.buffer = buffer.as_mut_ptr() as usize;
    task.rgba_byte = rgba.as_mut_ptr() as usize;

    device.task_add(task);
    device.task_wait();

    let expect = |v: f32| ((v * 0.25).clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
    for y in 0..4 {
        for x in 0..4 {
            let p = (y * 4 + x) * 4;
            assert_eq!(rgba[p], expect(x as f32));
            assert_eq!(rgba[p + 1], expect(y as f32));
            assert_eq!(rgba[p + 2], expect(0.0));
            assert_eq!(rgba[p + 3], expect(1.0));
        }
    }
}

// -- scenario: shader splitting and cancellation ------------------------

static SHADER_LOG: Mutex<Vec<(i32, i32)>> = Mutex::new(Vec::new());

fn logging_shader(
    _kg: &KernelGlobals,
    _scratch: &mut ThreadScratch,
    _input: *const u32,
    _output: *mut f32,
    _output_luma: *mut f32,
    _eval_type: i32,
    _filter: i32,
    x: i32,
    _offset: i32,
    sample: i32,
) {
    SHADER_LOG.lock().unwrap().push((x, sample));
}

#[test]
fn shader_task_splits_by_granularity_and_covers_every_index() {
    SHADER_LOG.lock().unwrap().clear();

    let mut table = base_table();
    table.shader = logging_shader;
    let device = CpuDevice::with_kernels(table, 8);

    let mut task = DeviceTask::new(TaskType::Shader);
    task.shader_x = 100;
    task.shader_w = 300;
    task.num_samples = 2;

    assert_eq!(device.get_split_task_count(&task), 3);

    device.task_add(task);
    device.task_wait();

    let log = SHADER_LOG.lock().unwrap();
    let mut counts = std::collections::HashMap::new();
    for &(x, _) in log.iter() {
        *counts.entry(x).or_insert(0usize) += 1;
    }
    for x in 100..400 {
        assert_eq!(counts.get(&x), Some(&2), "index {x}");
    }
    assert_eq!(log.len(), 600);
}

static SHADER_CANCEL_LOG: Mutex<Vec<(i32, i32)>> = Mutex::new(Vec::new());
static SHADER_CANCEL_NOW: AtomicBool = AtomicBool::new(false);

fn cancel_logging_shader(
    _kg: &KernelGlobals,
    _scratch: &mut ThreadScratch,
    _input: *const u32,
    _output: *mut f32,
    _output_luma: *mut f32,
    _eval_type: i32,
    _filter: i32,
    x: i32,
    _offset: i32,
    sample: i32,
) {
    SHADER_CANCEL_LOG.lock().unwrap().push((x, sample));
    SHADER_CANCEL_NOW.store(true, Ordering::SeqCst);
}

#[test]
fn shader_cancel_after_first_sample_halts_later_samples() {
    SHADER_CANCEL_LOG.lock().unwrap().clear();
    SHADER_CANCEL_NOW.store(false, Ordering::SeqCst);

    let mut table = base_table();
    table.shader = cancel_logging_shader;
    let device = CpuDevice::with_kernels(table, 1);

    let mut task = DeviceTask::new(TaskType::Shader);
    task.shader_x = 0;
    task.shader_w = 64;
    task.num_samples = 4;
    task.get_cancel = Arc::new(|| SHADER_CANCEL_NOW.load(Ordering::SeqCst));

    device.task_add(task);
    device.task_wait();

    let log = SHADER_CANCEL_LOG.lock().unwrap();
    assert!(log.iter().all(|&(_, sample)| sample == 0));
    assert_eq!(log.len(), 64);
}

// -- scenario: denoise window and rect clipping -------------------------

static GRAMIAN_OFFSETS: Mutex<Vec<(i32, i32)>> = Mutex::new(Vec::new());
static DENOISE_RECTS: Mutex<Vec<(i32, i32, i32, i32)>> = Mutex::new(Vec::new());

fn noop_table_with_probes() -> KernelTable {
    let mut table = base_table();

    table.filter_divide_shadow = |_kg, _sample, _tiles, x, y, _a, _b, _sv, _svv, _bv, rect| {
        // One record per prefill pass is enough.
        if x == rect.x0 && y == rect.y0 {
            DENOISE_RECTS
                .lock()
                .unwrap()
                .push((rect.x0, rect.y0, rect.x1, rect.y1));
        }
    };
    table.filter_get_feature = |_kg, _sample, _tiles, _mf, _vf, _x, _y, _mean, _var, _rect| {};
    table.filter_combine_halves = |_x, _y, _mean, _var, _a, _b, _rect, _r| {};
    table.filter_construct_transform = |_kg, _sample, _fb, _ps, _x, _y, _storage, _rect| {};
    table.filter_nlm_calc_difference = |_dx, _dy, _w, _v, _d, _rect, _stride, _co, _a, _k| {};
    table.filter_nlm_blur = |_d, _o, _rect, _w, _f| {};
    table.filter_nlm_calc_weight = |_d, _o, _rect, _w, _f| {};
    table.filter_nlm_update_output = |_dx, _dy, _d, _i, _o, _a, _rect, _w, _f| {};
    table.filter_nlm_normalize = |_o, _a, _rect, _w| {};
    table.filter_nlm_construct_gramian =
        |dx, dy, _d, _fb, _ps, _storage, _xtwx, _xtwy, _rect, _frect, _w, _h, _f| {
            GRAMIAN_OFFSETS.lock().unwrap().push((dx, dy));
        };
    table.filter_finalize = |_x, _y, _ofs, _w, _h, _buf, _storage, _xtwx, _xtwy, _params, _s| {};

    table
}

#[test]
fn denoise_visits_the_full_search_window_and_clips_rect() {
    GRAMIAN_OFFSETS.lock().unwrap().clear();
    DENOISE_RECTS.lock().unwrap().clear();

    let device = CpuDevice::with_kernels(noop_table_with_probes(), 1);

    let mut data = film_data(4);
    data.integrator.half_window = 5;
    device.const_copy_to("data", bytemuck::bytes_of(&data)).unwrap();

    // A 3×3 neighborhood of 32×32 tiles covering (0,0)..(96,96); all
    // buffers are zero-filled.
    let params = BufferParams {
        width: 96,
        height: 96,
        passes_size: 4,
        overscan: 0,
        frames: 1,
    };
    let mut neighbor_storage: Vec<Vec<f32>> = (0..9).map(|_| vec![0.0f32; 96 * 96 * 4]).collect();
    let addrs: Vec<usize> = neighbor_storage
        .iter_mut()
        .map(|buffer| buffer.as_mut_ptr() as usize)
        .collect();

    let grid_tile = move |i: usize| -> RenderTile {
        let col = (i % 3) as i32;
        let row = (i / 3) as i32;
        RenderTile {
            x: col * 32,
            y: row * 32,
            w: 32,
            h: 32,
            offset: 0,
            stride: 96,
            sample: 0,
            start_sample: 0,
            num_samples: 4,
            buffer: addrs[i],
            rng_state: 0,
            task: TileTask::Denoise,
            params,
        }
    };

    let center = grid_tile(4);

    let mut task = DeviceTask::new(TaskType::Render);
    task.acquire_tile = tile_queue(vec![center]);
    task.get_neighbor_tiles = Arc::new(move |rtiles: &mut [RenderTile; 9]| {
        for (i, slot) in rtiles.iter_mut().enumerate() {
            *slot = grid_tile(i);
        }
    });

    device.task_add(task);
    device.task_wait();

    let offsets = GRAMIAN_OFFSETS.lock().unwrap();
    assert_eq!(offsets.len(), 121);
    for dy in -5..=5 {
        for dx in -5..=5 {
            assert!(offsets.contains(&(dx, dy)), "offset ({dx},{dy})");
        }
    }

    // filter_area (32,32)..(64,64) expanded by hw=5, clipped to the
    // neighborhood bounds (0,0)..(96,96).
    let rects = DENOISE_RECTS.lock().unwrap();
    assert_eq!(rects.len(), 1);
    assert_eq!(rects[0], (27, 27, 69, 69));
}

// -- show_samples reflects worker count ---------------------------------

#[test]
fn show_samples_only_when_single_threaded() {
    let single = CpuDevice::with_kernels(base_table(), 1);
    let multi = CpuDevice::with_kernels(base_table(), 4);
    assert!(single.show_samples());
    assert!(!multi.show_samples());
}
