use crate::denoise::{denoise_fill_buffer, denoise_run};
use crate::dispatch;
use crate::globals::{KernelGlobals, TextureBinding, ThreadKernelGlobals};
use crate::kernel::{KernelTable, Rect, TileNeighbors};
use crate::pool::{CancelObserver, TaskPool};
use crate::util::{cpu_brand_string, enable_ftz};
use emberpath_core::{
    Device, DeviceError, DeviceInfo, DeviceMemory, DeviceTask, DeviceType, Extension,
    Interpolation, MemoryType, RenderTile, ShadingSystem, Stats, TaskType, TileTask,
};
use half::f16;
use log::debug;
use std::ptr;
use std::sync::{Arc, RwLock};

/// Shared between the host-facing device handle and its worker closures.
struct DeviceState {
    info: DeviceInfo,
    stats: Arc<Stats>,
    background: bool,
    kernels: KernelTable,
    globals: RwLock<KernelGlobals>,
    shading: RwLock<Option<Arc<dyn ShadingSystem>>>,
}

/// The CPU execution backend: splits host tasks across a worker pool and
/// runs path tracing, denoising, film conversion and shader evaluation
/// through the SIMD tier bound at construction.
pub struct CpuDevice {
    state: Arc<DeviceState>,
    pool: TaskPool,
}

impl CpuDevice {
    pub fn new(info: DeviceInfo, stats: Arc<Stats>, background: bool) -> Self {
        Self::build(info, stats, background, KernelTable::select(), TaskPool::new())
    }

    /// Construct with an explicit kernel table and worker count. This is
    /// the seam host test harnesses use to inject deterministic stub
    /// kernels.
    pub fn with_kernels(kernels: KernelTable, threads: usize) -> Self {
        let info = DeviceInfo {
            description: cpu_brand_string(),
            id: "CPU".to_string(),
            advanced_shading: true,
            ..DeviceInfo::default()
        };

        Self::build(
            info,
            Arc::new(Stats::new()),
            false,
            kernels,
            TaskPool::with_threads(threads),
        )
    }

    fn build(
        info: DeviceInfo,
        stats: Arc<Stats>,
        background: bool,
        kernels: KernelTable,
        pool: TaskPool,
    ) -> Self {
        enable_ftz();

        Self {
            state: Arc::new(DeviceState {
                info,
                stats,
                background,
                kernels,
                globals: RwLock::new(KernelGlobals::default()),
                shading: RwLock::new(None),
            }),
            pool,
        }
    }

    pub fn background(&self) -> bool {
        self.state.background
    }

    /// Plug in the embedded shading-language runtime. Must happen before
    /// tasks are added.
    pub fn set_shading_system(&self, shading: Option<Arc<dyn ShadingSystem>>) {
        *self.state.shading.write().unwrap() = shading;
    }

    pub fn num_threads(&self) -> usize {
        self.pool.num_threads()
    }
}

impl Device for CpuDevice {
    fn info(&self) -> &DeviceInfo {
        &self.state.info
    }

    fn stats(&self) -> &Stats {
        &self.state.stats
    }

    fn mem_alloc(&self, mem: &mut DeviceMemory, _mtype: MemoryType) {
        mem.device_pointer = mem.data_pointer;
        mem.device_size = mem.memory_size();
        self.state.stats.mem_alloc(mem.device_size);
    }

    fn mem_copy_to(&self, _mem: &mut DeviceMemory) {
        // Host and device share memory.
    }

    fn mem_copy_from(&self, _mem: &mut DeviceMemory, _y: usize, _w: usize, _h: usize, _elem: usize) {
        // Host and device share memory.
    }

    fn mem_zero(&self, mem: &mut DeviceMemory) {
        if mem.device_pointer != 0 {
            unsafe {
                ptr::write_bytes(mem.device_pointer as *mut u8, 0, mem.memory_size());
            }
        }
    }

    fn mem_free(&self, mem: &mut DeviceMemory) {
        if mem.device_pointer != 0 {
            mem.device_pointer = 0;
            self.state.stats.mem_free(mem.device_size);
            mem.device_size = 0;
        }
    }

    fn const_copy_to(&self, name: &str, data: &[u8]) -> Result<(), DeviceError> {
        match name {
            "data" => {
                let mut globals = self.state.globals.write().unwrap();
                globals.data = bytemuck::pod_read_unaligned(data);
                Ok(())
            }
            _ => Err(DeviceError::UnknownConstant(name.to_string())),
        }
    }

    fn tex_alloc(
        &self,
        name: &str,
        mem: &mut DeviceMemory,
        interpolation: Interpolation,
        extension: Extension,
    ) {
        debug!("Texture allocate: {}, {} bytes", name, mem.memory_size());

        let mut globals = self.state.globals.write().unwrap();
        globals.textures.insert(
            name.to_string(),
            TextureBinding {
                data: mem.data_pointer,
                width: mem.data_width,
                height: mem.data_height,
                depth: mem.data_depth,
                data_type: mem.data_type,
                interpolation,
                extension,
            },
        );

        mem.device_pointer = mem.data_pointer;
        mem.device_size = mem.memory_size();
        self.state.stats.mem_alloc(mem.device_size);
    }

    fn tex_free(&self, mem: &mut DeviceMemory) {
        if mem.device_pointer != 0 {
            let mut globals = self.state.globals.write().unwrap();
            globals
                .textures
                .retain(|_, binding| binding.data != mem.device_pointer);

            mem.device_pointer = 0;
            self.state.stats.mem_free(mem.device_size);
            mem.device_size = 0;
        }
    }

    fn shading_system(&self) -> Option<Arc<dyn ShadingSystem>> {
        self.state.shading.read().unwrap().clone()
    }

    fn task_add(&self, task: DeviceTask) {
        let granularity = if task.task_type == TaskType::Shader { 256 } else { 0 };

        for subtask in task.split(self.pool.num_threads(), granularity) {
            let state = self.state.clone();
            let cancel = self.pool.cancel_observer();
            self.pool.push(move || thread_run(&state, &cancel, &subtask));
        }
    }

    fn task_wait(&self) {
        self.pool.wait_work();
    }

    fn task_cancel(&self) {
        self.pool.cancel();
    }

    fn show_samples(&self) -> bool {
        self.pool.num_threads() == 1
    }

    fn get_split_task_count(&self, task: &DeviceTask) -> usize {
        let granularity = if task.task_type == TaskType::Shader { 256 } else { 0 };
        task.get_subtask_count(self.pool.num_threads(), granularity)
    }
}

fn thread_run(state: &DeviceState, cancel: &CancelObserver, task: &DeviceTask) {
    match task.task_type {
        TaskType::Render => thread_render(state, cancel, task),
        TaskType::FilmConvert => thread_film_convert(state, task),
        TaskType::Shader => thread_shader(state, cancel, task),
    }
}

fn thread_render(state: &DeviceState, cancel: &CancelObserver, task: &DeviceTask) {
    if cancel.canceled() && !task.need_finish_queue {
        return;
    }

    let mut tkg = {
        let globals = state.globals.read().unwrap();
        ThreadKernelGlobals::new(&globals, state.shading.read().unwrap().clone())
    };

    let mut tile = RenderTile::default();
    while (task.acquire_tile)(&mut tile) {
        match tile.task {
            TileTask::PathTrace => render_tile(state, cancel, task, &mut tkg, &mut tile),
            TileTask::Denoise => denoise_tile(state, task, &mut tkg, &mut tile),
        }

        (task.release_tile)(tile);
        tile = RenderTile::default();

        if cancel.canceled() && !task.need_finish_queue {
            break;
        }
    }
}

fn render_tile(
    state: &DeviceState,
    cancel: &CancelObserver,
    task: &DeviceTask,
    tkg: &mut ThreadKernelGlobals,
    tile: &mut RenderTile,
) {
    let buffer = tile.buffer as *mut f32;
    let rng_state = tile.rng_state as *mut u32;
    let end_sample = tile.start_sample + tile.num_samples;

    for sample in tile.start_sample..end_sample {
        #[cfg(feature = "debug-fpe")]
        let _fpe = crate::util::ScopedFpe::enable();

        if ((task.get_cancel)() || cancel.canceled()) && !task.need_finish_queue {
            break;
        }

        for y in tile.y..tile.y + tile.h {
            for x in tile.x..tile.x + tile.w {
                (state.kernels.path_trace)(
                    &tkg.kg,
                    &mut tkg.scratch,
                    buffer,
                    rng_state,
                    sample,
                    x,
                    y,
                    tile.offset,
                    tile.stride,
                );
            }
        }

        tile.sample = sample + 1;
        (task.update_progress)(Some(&*tile), (tile.w * tile.h) as usize);
    }

    // Tiles rendered with overscan denoise their own inset region.
    if tile.params.overscan > 0 && !(task.get_cancel)() {
        let overscan = tile.params.overscan as i32;

        let mut tiles = TileNeighbors {
            tile_x: [tile.x, tile.x, tile.x + tile.w, tile.x + tile.w],
            tile_y: [tile.y, tile.y, tile.y + tile.h, tile.y + tile.h],
            ..TileNeighbors::default()
        };
        tiles.buffers[4] = tile.buffer;
        tiles.offsets[4] = tile.offset;
        tiles.strides[4] = tile.stride;

        let mut frame_strides = [0i32; 9];
        frame_strides[4] = tile.params.frame_stride() as i32;

        let filter_area = Rect::new(
            tile.x + overscan,
            tile.y + overscan,
            tile.x + tile.w - overscan,
            tile.y + tile.h - overscan,
        );
        let rect = Rect::new(tile.x, tile.y, tile.x + tile.w, tile.y + tile.h);

        let mut fb = denoise_fill_buffer(
            &state.kernels,
            &tkg.kg,
            end_sample,
            rect,
            &tiles,
            tile.params.frames.max(1) as i32,
            &frame_strides,
        );
        denoise_run(
            &state.kernels,
            &tkg.kg,
            end_sample,
            &mut fb,
            filter_area,
            rect,
            tile.offset,
            tile.stride,
            buffer,
        );
    }
}

fn denoise_tile(
    state: &DeviceState,
    task: &DeviceTask,
    tkg: &mut ThreadKernelGlobals,
    tile: &mut RenderTile,
) {
    let sample = tile.start_sample + tile.num_samples;

    let mut rtiles: [RenderTile; 9] = std::array::from_fn(|_| RenderTile::default());
    rtiles[4] = tile.clone();
    (task.get_neighbor_tiles)(&mut rtiles);

    let mut tiles = TileNeighbors {
        tile_x: [rtiles[3].x, rtiles[4].x, rtiles[5].x, rtiles[5].x + rtiles[5].w],
        tile_y: [rtiles[1].y, rtiles[4].y, rtiles[7].y, rtiles[7].y + rtiles[7].h],
        ..TileNeighbors::default()
    };
    let mut frame_strides = [0i32; 9];
    for i in 0..9 {
        tiles.buffers[i] = rtiles[i].buffer;
        tiles.offsets[i] = rtiles[i].offset;
        tiles.strides[i] = rtiles[i].stride;
        if rtiles[i].buffer != 0 {
            frame_strides[i] = rtiles[i].params.frame_stride() as i32;
        }
    }

    let hw = tkg.kg.data.integrator.half_window;
    let filter_area = Rect::new(tile.x, tile.y, tile.x + tile.w, tile.y + tile.h);
    let rect = Rect::new(
        (tile.x - hw).max(tiles.tile_x[0]),
        (tile.y - hw).max(tiles.tile_y[0]),
        (tile.x + tile.w + hw).min(tiles.tile_x[3]),
        (tile.y + tile.h + hw).min(tiles.tile_y[3]),
    );

    let mut fb = denoise_fill_buffer(
        &state.kernels,
        &tkg.kg,
        sample,
        rect,
        &tiles,
        tile.params.frames.max(1) as i32,
        &frame_strides,
    );
    denoise_run(
        &state.kernels,
        &tkg.kg,
        sample,
        &mut fb,
        filter_area,
        rect,
        tile.offset,
        tile.stride,
        tile.buffer as *mut f32,
    );

    tile.sample = sample;
    (task.update_progress)(Some(&*tile), (tile.w * tile.h) as usize);
}

fn thread_film_convert(state: &DeviceState, task: &DeviceTask) {
    let sample_scale = 1.0 / (task.sample + 1) as f32;
    let kg = state.globals.read().unwrap().clone();

    if task.rgba_half != 0 {
        let rgba = task.rgba_half as *mut f16;
        for y in task.y..task.y + task.h {
            for x in task.x..task.x + task.w {
                (state.kernels.convert_to_half_float)(
                    &kg,
                    rgba,
                    task.buffer as *const f32,
                    sample_scale,
                    x,
                    y,
                    task.offset,
                    task.stride,
                );
            }
        }
    } else {
        let rgba = task.rgba_byte as *mut u8;
        for y in task.y..task.y + task.h {
            for x in task.x..task.x + task.w {
                (state.kernels.convert_to_byte)(
                    &kg,
                    rgba,
                    task.buffer as *const f32,
                    sample_scale,
                    x,
                    y,
                    task.offset,
                    task.stride,
                );
            }
        }
    }
}

fn thread_shader(state: &DeviceState, cancel: &CancelObserver, task: &DeviceTask) {
    let mut tkg = {
        let globals = state.globals.read().unwrap();
        ThreadKernelGlobals::new(&globals, state.shading.read().unwrap().clone())
    };

    for sample in 0..task.num_samples {
        for x in task.shader_x..task.shader_x + task.shader_w {
            (state.kernels.shader)(
                &tkg.kg,
                &mut tkg.scratch,
                task.shader_input as *const u32,
                task.shader_output as *mut f32,
                task.shader_output_luma as *mut f32,
                task.shader_eval_type,
                task.shader_filter,
                x,
                task.offset,
                sample,
            );
        }

        if (task.get_cancel)() || cancel.canceled() {
            break;
        }

        (task.update_progress)(None, 0);
    }
}

/// Create the CPU device.
pub fn device_cpu_create(info: DeviceInfo, stats: Arc<Stats>, background: bool) -> Arc<dyn Device> {
    Arc::new(CpuDevice::new(info, stats, background))
}

/// Prepend the CPU entry to the host's device list.
pub fn device_cpu_info(devices: &mut Vec<DeviceInfo>) {
    devices.insert(
        0,
        DeviceInfo {
            device_type: DeviceType::Cpu,
            description: cpu_brand_string(),
            id: "CPU".to_string(),
            num: 0,
            advanced_shading: true,
            pack_images: false,
        },
    );
}

/// Space-separated SIMD tiers the host CPU supports.
pub fn device_cpu_capabilities() -> String {
    dispatch::capabilities_string()
}
