mod device;
mod error;
mod memory;
mod task;

pub use device::*;
pub use error::DeviceError;
pub use memory::*;
pub use task::*;
