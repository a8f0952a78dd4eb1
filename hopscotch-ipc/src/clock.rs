//! Monotonic per-core cycle counter and TSC frequency estimation.
//!
//! All timestamps in the profiler are raw cycle counts. The low bit of every
//! returned timestamp is forced to zero: it is used on the wire as the
//! "dynamic function name" flag and must never carry time information.

use std::hint;
use std::time::Instant;

/// Number of busy-loop iterations used by the frequency estimation.
const CALIBRATION_ITERATIONS: u64 = 2_000_000;

/// Whether this build has a serialising cycle counter. When this returns
/// false, profiling is disabled at initialisation; there is no fallback to a
/// coarser clock because durations downstream are compared against
/// cycle-counted heartbeats.
pub fn is_supported() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

/// Current cycle count, low bit cleared.
#[inline]
pub fn now() -> u64 {
    read_cycle_counter().0 & !1
}

/// Current cycle count and the id of the core we are running on.
#[inline]
pub fn now_with_core() -> (u64, u32) {
    let (timestamp, core) = read_cycle_counter();
    (timestamp & !1, core)
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// `rdtscp` waits for all earlier instructions to retire before
        /// sampling, and on Linux the kernel stores the CPU id in the low
        /// bits of `IA32_TSC_AUX`.
        #[inline]
        fn read_cycle_counter() -> (u64, u32) {
            let mut aux = 0u32;
            let timestamp = unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
            (timestamp, aux & 0xfff)
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// The generic timer counter. The `isb` keeps the read from being
        /// hoisted above earlier instructions. There is no counterpart to
        /// `IA32_TSC_AUX`, so the core id comes from the scheduler.
        #[inline]
        fn read_cycle_counter() -> (u64, u32) {
            let timestamp: u64;
            unsafe {
                core::arch::asm!(
                    "isb",
                    "mrs {t}, cntvct_el0",
                    t = out(reg) timestamp,
                    options(nostack, nomem, preserves_flags)
                );
            }
            (timestamp, current_core())
        }

        #[cfg(target_os = "linux")]
        #[inline]
        fn current_core() -> u32 {
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu >= 0 {
                cpu as u32
            } else {
                0
            }
        }

        #[cfg(not(target_os = "linux"))]
        #[inline]
        fn current_core() -> u32 {
            0
        }
    } else {
        #[inline]
        fn read_cycle_counter() -> (u64, u32) {
            (0, 0)
        }
    }
}

/// Estimated TSC frequency in MHz.
///
/// On macOS the exact maximum CPU frequency is available from the OS. On
/// other platforms we time a fixed busy loop against the monotonic wall
/// clock: warm the CPU up with a short burst of counter reads, sample a
/// start cycle count, spin, then divide the elapsed cycles by the elapsed
/// microseconds.
pub fn tsc_frequency_mhz() -> f32 {
    #[cfg(target_os = "macos")]
    if let Some(mhz) = macos_max_frequency_mhz() {
        return mhz;
    }

    estimate_frequency_mhz()
}

fn estimate_frequency_mhz() -> f32 {
    for _ in 0..1000 {
        hint::black_box(now());
    }

    let wall_start = Instant::now();
    let cycles_start = now();

    let mut dummy = 0u64;
    for i in 0..CALIBRATION_ITERATIONS {
        dummy = dummy.wrapping_add(i);
    }
    hint::black_box(dummy);

    let cycles_end = now();
    let micros = wall_start.elapsed().as_micros().max(1) as u64;

    (cycles_end.wrapping_sub(cycles_start)) as f32 / micros as f32
}

#[cfg(target_os = "macos")]
fn macos_max_frequency_mhz() -> Option<f32> {
    let mut freq: u64 = 0;
    let mut len = std::mem::size_of::<u64>();
    let name = b"hw.cpufrequency_max\0";
    let ret = unsafe {
        libc::sysctlbyname(
            name.as_ptr() as *const libc::c_char,
            &mut freq as *mut u64 as *mut libc::c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if ret == 0 && freq != 0 {
        Some(freq as f32 / 1_000_000.0)
    } else {
        None
    }
}

/// Converts a nanosecond interval to cycles for a given TSC frequency.
pub fn nanos_to_cycles(nanos: u64, tsc_mhz: f32) -> u64 {
    (nanos as f64 * tsc_mhz as f64 / 1000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_bit_is_always_clear() {
        for _ in 0..1000 {
            assert_eq!(now() & 1, 0);
            assert_eq!(now_with_core().0 & 1, 0);
        }
    }

    #[test]
    fn is_monotonic() {
        let mut prev = now();
        for _ in 0..10_000 {
            let cur = now();
            assert!(cur >= prev);
            prev = cur;
        }
    }

    #[test]
    fn frequency_is_plausible() {
        let mhz = tsc_frequency_mhz();
        // Anything from an embedded timer (tens of MHz) up to a fast
        // desktop TSC should fall in this range.
        assert!(mhz > 1.0, "estimated {mhz} MHz");
        assert!(mhz < 10_000.0, "estimated {mhz} MHz");
    }

    #[test]
    fn nanos_conversion() {
        // At 1000 MHz one nanosecond is one cycle.
        assert_eq!(nanos_to_cycles(10_000, 1000.0), 10_000);
        assert_eq!(nanos_to_cycles(10_000, 2000.0), 20_000);
    }
}
