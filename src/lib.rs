#![doc = include_str!("../README.md")]

pub use emberpath_core::*;
#[cfg(feature = "cpu")]
pub use emberpath_cpu as cpu;
