use emberpath::cpu::{kernel, CpuCapabilities, CpuDevice, KernelTable};
use log::{Level, Log, Metadata, Record};
use std::sync::Mutex;

struct CaptureLogger {
    records: Mutex<Vec<String>>,
}

impl Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        self.records.lock().unwrap().push(record.args().to_string());
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger {
    records: Mutex::new(Vec::new()),
};

// One test function: the "logged once per process" guard is process-wide,
// so ordering between selections must be deterministic.
#[test]
fn sse2_host_binds_sse2_everywhere_and_logs_once() {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(log::LevelFilter::Debug);

    let caps = CpuCapabilities {
        sse2: true,
        ..CpuCapabilities::none()
    };

    let (first, name) = KernelTable::select_for(&caps);
    let (second, _) = KernelTable::select_for(&caps);
    assert_eq!(name, "SSE2");

    // Every slot of both instantiations is bound to the SSE2 variant.
    let expected = [
        (first.path_trace as usize, kernel::sse2::path_trace as usize),
        (
            first.convert_to_half_float as usize,
            kernel::sse2::convert_to_half_float as usize,
        ),
        (
            first.convert_to_byte as usize,
            kernel::sse2::convert_to_byte as usize,
        ),
        (first.shader as usize, kernel::sse2::shader as usize),
        (
            first.filter_divide_shadow as usize,
            kernel::sse2::filter_divide_shadow as usize,
        ),
        (
            first.filter_get_feature as usize,
            kernel::sse2::filter_get_feature as usize,
        ),
        (
            first.filter_combine_halves as usize,
            kernel::sse2::filter_combine_halves as usize,
        ),
        (
            first.filter_construct_transform as usize,
            kernel::sse2::filter_construct_transform as usize,
        ),
        (
            first.filter_reconstruct as usize,
            kernel::sse2::filter_reconstruct as usize,
        ),
        (
            first.filter_divide_combined as usize,
            kernel::sse2::filter_divide_combined as usize,
        ),
        (
            first.filter_nlm_calc_difference as usize,
            kernel::sse2::filter_nlm_calc_difference as usize,
        ),
        (
            first.filter_nlm_blur as usize,
            kernel::sse2::filter_nlm_blur as usize,
        ),
        (
            first.filter_nlm_calc_weight as usize,
            kernel::sse2::filter_nlm_calc_weight as usize,
        ),
        (
            first.filter_nlm_update_output as usize,
            kernel::sse2::filter_nlm_update_output as usize,
        ),
        (
            first.filter_nlm_normalize as usize,
            kernel::sse2::filter_nlm_normalize as usize,
        ),
        (
            first.filter_nlm_construct_gramian as usize,
            kernel::sse2::filter_nlm_construct_gramian as usize,
        ),
        (
            first.filter_finalize as usize,
            kernel::sse2::filter_finalize as usize,
        ),
    ];
    for (i, (bound, variant)) in expected.iter().enumerate() {
        assert_eq!(bound, variant, "slot {i}");
    }
    assert_eq!(second.path_trace as usize, first.path_trace as usize);

    // Re-instantiating devices does not log the tier again.
    let _a = CpuDevice::with_kernels(first, 1);
    let _b = CpuDevice::with_kernels(second, 1);
    let _c = KernelTable::select();

    let records = LOGGER.records.lock().unwrap();
    let tier_logs: Vec<&String> = records.iter().filter(|r| r.contains("kernels")).collect();
    assert_eq!(tier_logs.len(), 1);
    assert!(tier_logs[0].contains("SSE2"));

    // The capability report never carries a trailing separator.
    let caps = emberpath::cpu::device_cpu_capabilities();
    assert!(!caps.ends_with(' '));
}
