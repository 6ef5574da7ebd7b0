use std::sync::Arc;

/// What kind of work a [`DeviceTask`] carries.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum TaskType {
    Render,
    FilmConvert,
    Shader,
}

/// What a worker should do with an acquired tile.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum TileTask {
    PathTrace,
    Denoise,
}

/// Layout of the film accumulation buffer a tile renders into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferParams {
    pub width: usize,
    pub height: usize,
    pub passes_size: usize,
    pub overscan: usize,
    pub frames: usize,
}

impl BufferParams {
    pub fn get_passes_size(&self) -> usize {
        self.passes_size
    }

    /// Element count of one temporal frame slice.
    pub fn frame_stride(&self) -> usize {
        self.width * self.height * self.passes_size
    }
}

/// A rectangular region of the output image processed as a unit.
///
/// `buffer` and `rng_state` are host addresses (0 when absent); the host
/// guarantees the storage outlives the task and that no other worker writes
/// it while this tile is held.
#[derive(Clone, Debug)]
pub struct RenderTile {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,

    pub offset: i32,
    pub stride: i32,

    pub sample: i32,
    pub start_sample: i32,
    pub num_samples: i32,

    pub buffer: usize,
    pub rng_state: usize,

    pub task: TileTask,
    pub params: BufferParams,
}

impl Default for RenderTile {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            w: 0,
            h: 0,
            offset: 0,
            stride: 0,
            sample: 0,
            start_sample: 0,
            num_samples: 0,
            buffer: 0,
            rng_state: 0,
            task: TileTask::PathTrace,
            params: BufferParams::default(),
        }
    }
}

pub type AcquireTileFn = dyn Fn(&mut RenderTile) -> bool + Send + Sync;
pub type ReleaseTileFn = dyn Fn(RenderTile) + Send + Sync;
pub type NeighborTilesFn = dyn Fn(&mut [RenderTile; 9]) + Send + Sync;
pub type CancelFn = dyn Fn() -> bool + Send + Sync;
pub type ProgressFn = dyn Fn(Option<&RenderTile>, usize) + Send + Sync;

/// One unit of work submitted by the host.
///
/// The callbacks connect the device back to the host's tile scheduler and
/// progress reporting; they are shared across the subtasks a split creates
/// and may be called concurrently from several workers.
#[derive(Clone)]
pub struct DeviceTask {
    pub task_type: TaskType,

    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,

    pub rgba_byte: usize,
    pub rgba_half: usize,
    pub buffer: usize,
    pub sample: i32,
    pub num_samples: i32,
    pub offset: i32,
    pub stride: i32,

    pub shader_input: usize,
    pub shader_output: usize,
    pub shader_output_luma: usize,
    pub shader_eval_type: i32,
    pub shader_filter: i32,
    pub shader_x: i32,
    pub shader_w: i32,

    pub need_finish_queue: bool,

    pub acquire_tile: Arc<AcquireTileFn>,
    pub release_tile: Arc<ReleaseTileFn>,
    pub get_neighbor_tiles: Arc<NeighborTilesFn>,
    pub get_cancel: Arc<CancelFn>,
    pub update_progress: Arc<ProgressFn>,
}

impl DeviceTask {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            x: 0,
            y: 0,
            w: 0,
            h: 0,
            rgba_byte: 0,
            rgba_half: 0,
            buffer: 0,
            sample: 0,
            num_samples: 0,
            offset: 0,
            stride: 0,
            shader_input: 0,
            shader_output: 0,
            shader_output_luma: 0,
            shader_eval_type: 0,
            shader_filter: 0,
            shader_x: 0,
            shader_w: 0,
            need_finish_queue: false,
            acquire_tile: Arc::new(|_| false),
            release_tile: Arc::new(|_| {}),
            get_neighbor_tiles: Arc::new(|_| {}),
            get_cancel: Arc::new(|| false),
            update_progress: Arc::new(|_, _| {}),
        }
    }

    /// How many subtasks [`DeviceTask::split`] would produce for `num`
    /// workers. `granularity` bounds the item count per shader subtask
    /// (0 disables the bound).
    pub fn get_subtask_count(&self, num: usize, granularity: usize) -> usize {
        match self.task_type {
            TaskType::Shader => {
                let mut count = num.min(self.shader_w.max(1) as usize);
                if granularity > 0 {
                    let items = (self.shader_w.max(0) as usize) * (self.num_samples.max(1) as usize);
                    count = count.min(items.div_ceil(granularity).max(1));
                }
                count
            }
            TaskType::Render => num,
            TaskType::FilmConvert => num.min(self.h.max(1) as usize),
        }
    }

    /// Split into per-worker subtasks.
    ///
    /// Shader tasks split the evaluation range, film conversion splits
    /// scanline bands, and render tasks are duplicated so every worker
    /// pulls tiles from the host scheduler.
    pub fn split(&self, num: usize, granularity: usize) -> Vec<DeviceTask> {
        let num = self.get_subtask_count(num, granularity);
        let mut tasks = Vec::with_capacity(num);

        match self.task_type {
            TaskType::Shader => {
                for i in 0..num {
                    let x0 = self.shader_x + (self.shader_w * i as i32) / num as i32;
                    let x1 = self.shader_x + (self.shader_w * (i as i32 + 1)) / num as i32;

                    let mut subtask = self.clone();
                    subtask.shader_x = x0;
                    subtask.shader_w = x1 - x0;
                    tasks.push(subtask);
                }
            }
            TaskType::Render => {
                for _ in 0..num {
                    tasks.push(self.clone());
                }
            }
            TaskType::FilmConvert => {
                for i in 0..num {
                    let y0 = self.y + (self.h * i as i32) / num as i32;
                    let y1 = self.y + (self.h * (i as i32 + 1)) / num as i32;

                    let mut subtask = self.clone();
                    subtask.y = y0;
                    subtask.h = y1 - y0;
                    tasks.push(subtask);
                }
            }
        }

        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_split_is_bounded_by_granularity() {
        let mut task = DeviceTask::new(TaskType::Shader);
        task.shader_x = 100;
        task.shader_w = 300;
        task.num_samples = 2;

        assert_eq!(task.get_subtask_count(8, 256), 3);

        let subtasks = task.split(8, 256);
        assert_eq!(subtasks.len(), 3);

        // The ranges tile the input exactly.
        let mut covered = 0;
        let mut next = task.shader_x;
        for sub in &subtasks {
            assert_eq!(sub.shader_x, next);
            next += sub.shader_w;
            covered += sub.shader_w;
        }
        assert_eq!(covered, 300);
    }

    #[test]
    fn render_split_duplicates_per_worker() {
        let task = DeviceTask::new(TaskType::Render);
        assert_eq!(task.split(4, 0).len(), 4);
    }

    #[test]
    fn film_convert_split_tiles_scanlines() {
        let mut task = DeviceTask::new(TaskType::FilmConvert);
        task.y = 8;
        task.h = 30;

        let subtasks = task.split(4, 0);
        assert_eq!(subtasks.len(), 4);
        let total: i32 = subtasks.iter().map(|t| t.h).sum();
        assert_eq!(total, 30);
        assert_eq!(subtasks[0].y, 8);
        assert_eq!(subtasks[3].y + subtasks[3].h, 38);
    }
}
