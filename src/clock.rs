//! Synchronized clock shared by custom sources to stamp pushed media.
//!
//! All readings of one [`SyncClock`] derive from a single monotonic sample, so microsecond,
//! millisecond and NTP values taken in causal order never invert relative to each other.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

#[cfg(target_os = "macos")]
use mach::mach_time::{mach_absolute_time, mach_timebase_info, mach_timebase_info_data_t};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;
const NTP_FRACTIONS_PER_SECOND: u64 = 1 << 32;

#[cfg(target_os = "macos")]
fn timebase() -> (u64, u64) {
    static TIMEBASE: Lazy<(u64, u64)> = Lazy::new(|| unsafe {
        let mut info = mach_timebase_info_data_t::default();
        mach_timebase_info(&mut info);
        (info.numer as u64, info.denom as u64)
    });
    *TIMEBASE
}

/// Convert a mach host time tick count into nanoseconds.
pub fn host_time_to_ns(host_time: u64) -> u64 {
    #[cfg(target_os = "macos")]
    {
        if host_time == 0 {
            return 0;
        }
        let (numer, denom) = timebase();
        ((host_time as u128 * numer as u128) / denom as u128) as u64
    }
    #[cfg(not(target_os = "macos"))]
    {
        host_time
    }
}

/// Monotonic timestamp in nanoseconds since the first call in this process.
pub fn monotonic_timestamp_ns() -> u64 {
    #[cfg(target_os = "macos")]
    {
        let host_time = unsafe { mach_absolute_time() };
        host_time_to_ns(host_time)
    }
    #[cfg(not(target_os = "macos"))]
    {
        static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
        let elapsed = START.elapsed();
        (elapsed.as_secs() * 1_000_000_000) + elapsed.subsec_nanos() as u64
    }
}

/// Source of monotonic time for a [`SyncClock`].
pub trait MonotonicSource: Send + Sync {
    /// Nanoseconds on a monotonic time line. Never decreases.
    fn now_ns(&self) -> u64;
}

/// Process monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMonotonic;

impl MonotonicSource for SystemMonotonic {
    fn now_ns(&self) -> u64 {
        monotonic_timestamp_ns()
    }
}

/// Manually advanced time line, used to drive sources deterministically.
#[derive(Debug, Default)]
pub struct ManualMonotonic {
    now_ns: AtomicU64,
}

impl ManualMonotonic {
    /// Start the time line at `start_ns`.
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    /// Move the time line forward.
    pub fn advance(&self, by: Duration) {
        self.now_ns
            .fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl MonotonicSource for ManualMonotonic {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }
}

/// 64-bit NTP timestamp: seconds since 1900 plus a 32-bit binary fraction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpTimestamp {
    /// Whole seconds since 1900-01-01.
    pub seconds: u32,
    /// Fractional second in units of 2^-32 s.
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Build from microseconds elapsed since the NTP epoch.
    pub fn from_micros(micros: u64) -> Self {
        let seconds = micros / 1_000_000;
        let remainder = micros % 1_000_000;
        let fraction = (remainder * NTP_FRACTIONS_PER_SECOND) / 1_000_000;
        Self {
            seconds: seconds as u32,
            fraction: fraction as u32,
        }
    }

    /// Milliseconds since the NTP epoch, rounded to nearest.
    pub fn to_millis(self) -> i64 {
        let frac_ms = (self.fraction as u64 * 1_000 + NTP_FRACTIONS_PER_SECOND / 2)
            / NTP_FRACTIONS_PER_SECOND;
        (self.seconds as i64) * 1_000 + frac_ms as i64
    }

    /// Packed 64-bit wire representation.
    pub fn to_u64(self) -> u64 {
        ((self.seconds as u64) << 32) | self.fraction as u64
    }
}

/// Clock stamping pushed audio and video consistently with the engine's model.
pub struct SyncClock {
    source: Arc<dyn MonotonicSource>,
    origin_ns: u64,
    ntp_origin_us: u64,
}

impl SyncClock {
    /// Clock on the process monotonic time line.
    pub fn new() -> Self {
        Self::with_source(Arc::new(SystemMonotonic))
    }

    /// Clock on a caller supplied time line. The NTP origin is taken from the wall clock once.
    pub fn with_source(source: Arc<dyn MonotonicSource>) -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let ntp_origin_us = (wall.as_micros() as u64) + NTP_UNIX_OFFSET_SECS * 1_000_000;
        Self::with_origin(source, ntp_origin_us)
    }

    /// Clock with an explicit NTP origin, in microseconds since 1900.
    pub fn with_origin(source: Arc<dyn MonotonicSource>, ntp_origin_us: u64) -> Self {
        let origin_ns = source.now_ns();
        Self {
            source,
            origin_ns,
            ntp_origin_us,
        }
    }

    fn elapsed_us(&self) -> u64 {
        self.source.now_ns().saturating_sub(self.origin_ns) / 1_000
    }

    /// Microseconds elapsed on this clock.
    pub fn now_micros(&self) -> i64 {
        self.elapsed_us() as i64
    }

    /// Milliseconds elapsed on this clock.
    pub fn now_millis(&self) -> i64 {
        (self.elapsed_us() / 1_000) as i64
    }

    /// NTP time corresponding to now.
    pub fn now_ntp(&self) -> NtpTimestamp {
        NtpTimestamp::from_micros(self.ntp_origin_us + self.elapsed_us())
    }

    /// One consistent reading of all three representations.
    pub fn snapshot(&self) -> ClockReading {
        let elapsed = self.elapsed_us();
        ClockReading {
            micros: elapsed as i64,
            millis: (elapsed / 1_000) as i64,
            ntp: NtpTimestamp::from_micros(self.ntp_origin_us + elapsed),
        }
    }
}

impl Default for SyncClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Values derived from a single monotonic sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockReading {
    /// Microseconds on the clock.
    pub micros: i64,
    /// Milliseconds on the clock.
    pub millis: i64,
    /// Matching NTP timestamp.
    pub ntp: NtpTimestamp,
}
