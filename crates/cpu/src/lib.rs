mod denoise;
mod device;
mod dispatch;
mod globals;
pub mod kernel;
mod pool;
mod util;

pub use denoise::{pass, FilterBuffer};
pub use device::{device_cpu_capabilities, device_cpu_create, device_cpu_info, CpuDevice};
pub use dispatch::CpuCapabilities;
pub use globals::{
    KernelData, KernelFilm, KernelGlobals, KernelIntegrator, TextureBinding, ThreadScratch,
};
pub use kernel::{FilterStorage, KernelTable, Rect, TileNeighbors, DENOISE_FEATURES};
pub use pool::{CancelObserver, TaskPool};
