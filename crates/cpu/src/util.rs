/// Round `x` up to a multiple of `align`.
#[inline(always)]
pub fn align_up(x: i32, align: i32) -> i32 {
    (x + align - 1) & !(align - 1)
}

/// Flush denormals to zero for the calling thread.
///
/// Sets the FTZ and DAZ bits in MXCSR; denormal arithmetic on x86 runs
/// through microcode assists that stall path tracing badly.
pub fn enable_ftz() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};
        const FTZ_DAZ: u32 = 0x8040;
        _mm_setcsr(_mm_getcsr() | FTZ_DAZ);
    }
}

/// The processor brand string, used as the device description.
pub fn cpu_brand_string() -> String {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::__cpuid;

        // CPUID leaves 0x80000002..=0x80000004 hold the 48-byte brand string.
        let supported = unsafe { __cpuid(0x8000_0000) }.eax >= 0x8000_0004;
        if supported {
            let mut bytes = Vec::with_capacity(48);
            for leaf in 0x8000_0002u32..=0x8000_0004 {
                let regs = unsafe { __cpuid(leaf) };
                for reg in [regs.eax, regs.ebx, regs.ecx, regs.edx] {
                    bytes.extend_from_slice(&reg.to_le_bytes());
                }
            }
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            if let Ok(name) = std::str::from_utf8(&bytes[..end]) {
                let name = name.trim();
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }

    "CPU".to_string()
}

/// Unmasks SIMD floating-point exceptions for the lifetime of the guard so
/// a math bug traps instead of propagating NaNs. Restores the previous
/// MXCSR state on drop, on every exit path.
#[cfg(feature = "debug-fpe")]
pub struct ScopedFpe {
    #[cfg(target_arch = "x86_64")]
    saved: u32,
}

#[cfg(feature = "debug-fpe")]
impl ScopedFpe {
    pub fn enable() -> Self {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};
            // Exception mask bits for invalid, divide-by-zero and overflow.
            const UNMASK: u32 = (1 << 7) | (1 << 9) | (1 << 10);
            let saved = _mm_getcsr();
            _mm_setcsr(saved & !UNMASK);
            Self { saved }
        }
        #[cfg(not(target_arch = "x86_64"))]
        Self {}
    }
}

#[cfg(feature = "debug-fpe")]
impl Drop for ScopedFpe {
    fn drop(&mut self) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_setcsr(self.saved);
        }
    }
}
