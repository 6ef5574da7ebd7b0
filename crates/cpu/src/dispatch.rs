//! Runtime selection of the kernel tier.
//!
//! A tier is eligible when it was compiled in (cargo feature) and the host
//! CPU reports the matching instruction set. Selection happens once per
//! device construction and the winning tier is logged once per process.

use crate::kernel::{kernel_table, KernelTable};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared across every table instantiation in the process.
static LOGGED_ARCHITECTURE: AtomicBool = AtomicBool::new(false);

/// Instruction sets the host CPU reports at runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuCapabilities {
    pub sse2: bool,
    pub sse3: bool,
    pub sse41: bool,
    pub avx: bool,
    pub avx2: bool,
}

impl CpuCapabilities {
    /// Probe the host.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self {
                sse2: is_x86_feature_detected!("sse2"),
                sse3: is_x86_feature_detected!("sse3"),
                sse41: is_x86_feature_detected!("sse4.1"),
                avx: is_x86_feature_detected!("avx"),
                avx2: is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self::none()
        }
    }

    /// No SIMD support at all; selects the default tier.
    pub fn none() -> Self {
        Self::default()
    }
}

impl KernelTable {
    /// Bind every kernel slot against the host CPU.
    pub fn select() -> KernelTable {
        Self::select_for(&CpuCapabilities::detect()).0
    }

    /// Bind every kernel slot for the given capability set and return the
    /// chosen tier name. The first selection in the process logs the tier.
    pub fn select_for(caps: &CpuCapabilities) -> (KernelTable, &'static str) {
        use crate::kernel::{avx, avx2, default, sse2, sse3, sse41};

        let (table, name) = if cfg!(feature = "avx2") && caps.avx2 {
            (kernel_table!(avx2), "AVX2")
        } else if cfg!(feature = "avx") && caps.avx {
            (kernel_table!(avx), "AVX")
        } else if cfg!(feature = "sse41") && caps.sse41 {
            (kernel_table!(sse41), "SSE4.1")
        } else if cfg!(feature = "sse3") && caps.sse3 {
            (kernel_table!(sse3), "SSE3")
        } else if cfg!(feature = "sse2") && caps.sse2 {
            (kernel_table!(sse2), "SSE2")
        } else {
            (kernel_table!(default), "default")
        };

        if !LOGGED_ARCHITECTURE.swap(true, Ordering::Relaxed) {
            info!("Will be using {name} kernels.");
        }

        (table, name)
    }
}

/// Space-separated list of the SIMD tiers the host supports.
pub fn capabilities_string() -> String {
    let caps = CpuCapabilities::detect();
    let mut tiers = Vec::new();
    if caps.sse2 {
        tiers.push("SSE2");
    }
    if caps.sse3 {
        tiers.push("SSE3");
    }
    if caps.sse41 {
        tiers.push("SSE41");
    }
    if caps.avx {
        tiers.push("AVX");
    }
    if caps.avx2 {
        tiers.push("AVX2");
    }
    tiers.join(" ")
}
