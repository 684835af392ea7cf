//! 生产者线程优先级提升
//!
//! best-effort：失败只记日志，不影响播放。
//! 只作用于调用线程（流水线线程），设备通知线程的调度由平台决定。
//!
//! 策略（按顺序尝试）：
//! - macOS：Mach THREAD_TIME_CONSTRAINT_POLICY（不需要 root），period = 块时长
//! - 其他 unix：SCHED_FIFO 最高优先级（通常需要 CAP_SYS_NICE）
//! - 后备：nice -10（仅 macOS 以外的 unix，Linux 上 nice 值按线程计；
//!   macOS 上 setpriority 作用于整个进程，不做后备）

use std::time::Duration;

/// 提升当前线程的调度优先级
///
/// `period` 是生产者的工作周期（一个块的时长），用于实时策略参数。
/// 返回是否获得了实时调度。
pub fn elevate_current_thread(period: Duration) -> bool {
    let elevated = imp::set_realtime(period);
    if !elevated {
        imp::set_nice();
    }
    elevated
}

#[cfg(target_os = "macos")]
mod imp {
    use std::sync::OnceLock;
    use std::time::Duration;

    const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;
    const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 = 4;

    #[repr(C)]
    struct ThreadTimeConstraintPolicy {
        period: u32,
        computation: u32,
        constraint: u32,
        preemptible: u32,
    }

    #[repr(C)]
    struct MachTimebaseInfo {
        numer: u32,
        denom: u32,
    }

    extern "C" {
        fn pthread_mach_thread_np(thread: libc::pthread_t) -> u32;
        fn thread_policy_set(
            thread: u32,
            flavor: u32,
            policy_info: *const std::ffi::c_void,
            count: u32,
        ) -> i32;
        fn mach_timebase_info(info: *mut MachTimebaseInfo) -> i32;
    }

    /// (numer, denom)，只查询一次
    static TIMEBASE: OnceLock<(u32, u32)> = OnceLock::new();

    /// 纳秒 → Mach ticks
    ///
    /// Intel 上 timebase 通常是 1/1，Apple Silicon 上是 125/3（1 tick ≈ 41.67ns）
    fn ns_to_ticks(ns: u64) -> u32 {
        let (numer, denom) = *TIMEBASE.get_or_init(|| {
            let mut info = MachTimebaseInfo { numer: 0, denom: 0 };
            let result = unsafe { mach_timebase_info(&mut info) };
            if result != 0 || info.numer == 0 || info.denom == 0 {
                (1, 1)
            } else {
                (info.numer, info.denom)
            }
        });
        (ns * denom as u64 / numer as u64).min(u32::MAX as u64) as u32
    }

    pub(super) fn set_realtime(period: Duration) -> bool {
        // 周期不低于 1ms，计算时间取周期的一半
        let period_ns = (period.as_nanos() as u64).max(1_000_000);
        let computation_ns = period_ns / 2;

        let policy = ThreadTimeConstraintPolicy {
            period: ns_to_ticks(period_ns),
            computation: ns_to_ticks(computation_ns),
            constraint: ns_to_ticks(period_ns),
            preemptible: 1,
        };

        let result = unsafe {
            let thread = pthread_mach_thread_np(libc::pthread_self());
            thread_policy_set(
                thread,
                THREAD_TIME_CONSTRAINT_POLICY,
                &policy as *const _ as *const std::ffi::c_void,
                THREAD_TIME_CONSTRAINT_POLICY_COUNT,
            )
        };

        if result == 0 {
            log::debug!(
                "Realtime priority set: period={}µs, computation={}µs",
                period_ns / 1000,
                computation_ns / 1000
            );
            true
        } else {
            log::debug!(
                "Failed to set realtime priority (kern_return: {}), falling back to nice",
                result
            );
            false
        }
    }

    pub(super) fn set_nice() {
        log::debug!("Skipping nice fallback, it would renice the whole process");
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
mod imp {
    use std::time::Duration;

    pub(super) fn set_realtime(_period: Duration) -> bool {
        unsafe {
            let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
            if max < 0 {
                return false;
            }
            let param = libc::sched_param { sched_priority: max };
            let result = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
            if result == 0 {
                log::debug!("SCHED_FIFO priority {} set on producer thread", max);
                true
            } else {
                log::debug!(
                    "Failed to set SCHED_FIFO ({}), falling back to nice",
                    std::io::Error::from_raw_os_error(result)
                );
                false
            }
        }
    }

    /// who = 0 在 Linux 上指调用线程本身
    pub(super) fn set_nice() {
        let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) };
        if result == 0 {
            log::debug!("Producer thread nice set to -10");
        } else {
            log::warn!(
                "Could not raise thread priority ({}), continuing with default scheduling",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::time::Duration;

    pub(super) fn set_realtime(_period: Duration) -> bool {
        log::debug!("Thread priority elevation not supported on this platform");
        false
    }

    pub(super) fn set_nice() {}
}
