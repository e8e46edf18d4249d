//! C ABI consumed by host runtimes.
//!
//! Objects cross the boundary as opaque `u64` handles. Failing calls return a negative
//! status (see [`BridgeError::status_code`]) or a zero handle, and leave the error text in a
//! per-thread slot read with [`media_bridge_last_error`]. No call unwinds into the host.

use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::slice;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::audio_source::CustomAudioSource;
use crate::clock::{SyncClock, monotonic_timestamp_ns};
use crate::codec::{AudioCodecFactory, SdpAudioFormat};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::handle::{Handle, HandleRegistry};
use crate::logging::{init_tracing, pop_log};
use crate::refcount::{InterfaceKind, RefCountedAdapter};
use crate::video::{FourCC, I420Planes, I420PlanesMut, convert};

/// Returned by entry points that succeed without a count.
pub const MEDIA_BRIDGE_OK: i32 = 0;

const CLOCK_TAG: u8 = 1;
const AUDIO_SOURCE_TAG: u8 = 2;

type AudioSourceAdapter = RefCountedAdapter<CustomAudioSource>;

static CLOCKS: Lazy<HandleRegistry<SyncClock>> =
    Lazy::new(|| HandleRegistry::new(CLOCK_TAG, "sync clock"));
static AUDIO_SOURCES: Lazy<HandleRegistry<AudioSourceAdapter>> =
    Lazy::new(|| HandleRegistry::new(AUDIO_SOURCE_TAG, "custom audio source"));
static CONFIG: Lazy<BridgeConfig> = Lazy::new(BridgeConfig::from_env);
static CODECS: Lazy<AudioCodecFactory> = Lazy::new(|| AudioCodecFactory::from_config(&CONFIG));
static LOG_CACHE: Lazy<Mutex<Option<CString>>> = Lazy::new(|| Mutex::new(None));

const AUDIO_SOURCE_INTERFACES: &[InterfaceKind] = &[InterfaceKind::AudioSource];

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(err: &BridgeError) {
    let text = CString::new(err.to_string()).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(text));
}

/// Run `body`, turning an error or a panic into `failed` plus a recorded last error.
fn guarded<T>(name: &'static str, failed: T, body: impl FnOnce() -> Result<T>) -> T {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            debug!(call = name, %err, "ffi call failed");
            set_last_error(&err);
            failed
        }
        Err(_) => {
            error!(call = name, "panic caught at the C boundary");
            set_last_error(&BridgeError::platform(name, "panicked"));
            failed
        }
    }
}

/// Like [`guarded`], but a failure returns its negative status code.
fn status<T: From<i32>>(name: &'static str, body: impl FnOnce() -> Result<T>) -> T {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            debug!(call = name, %err, "ffi call failed");
            set_last_error(&err);
            err.status_code().into()
        }
        Err(_) => {
            error!(call = name, "panic caught at the C boundary");
            let err = BridgeError::platform(name, "panicked");
            set_last_error(&err);
            err.status_code().into()
        }
    }
}

/// # Safety
/// `ptr` must be valid for `len` bytes or null with `len == 0`.
unsafe fn input<'a>(ptr: *const u8, len: usize, what: &str) -> Result<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(BridgeError::invalid_argument(format!("{what} is null")));
    }
    Ok(unsafe { slice::from_raw_parts(ptr, len) })
}

/// # Safety
/// `ptr` must be valid for writes of `len` bytes or null with `len == 0`.
unsafe fn output<'a>(ptr: *mut u8, len: usize, what: &str) -> Result<&'a mut [u8]> {
    if len == 0 {
        return Ok(&mut []);
    }
    if ptr.is_null() {
        return Err(BridgeError::invalid_argument(format!("{what} is null")));
    }
    Ok(unsafe { slice::from_raw_parts_mut(ptr, len) })
}

fn usize_arg(value: u32) -> usize {
    value as usize
}

/// Registry behind the `media_bridge_sync_clock_*` handles, for in-process bindings that
/// keep the handle in a [`crate::handle::HandleSlot`].
pub fn sync_clocks() -> &'static HandleRegistry<SyncClock> {
    &CLOCKS
}

/// Install logging from `MEDIA_BRIDGE_*` variables. Safe to call repeatedly.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_init() {
    init_tracing(&CONFIG);
}

/// Text of the calling thread's most recent failure, or `NULL`. Valid until the next
/// failing call on the same thread.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(ptr::null(), |text| text.as_ptr()))
}

/// Pop the next native log line. Returns `NULL` when no logs remain. The pointer stays
/// valid until the next call.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_pop_log() -> *const c_char {
    let Some(record) = pop_log() else {
        return ptr::null();
    };
    let mut cache = LOG_CACHE.lock();
    *cache = Some(CString::new(record.to_string()).unwrap_or_default());
    cache.as_ref().map_or(ptr::null(), |line| line.as_ptr())
}

/// Nanoseconds on the process monotonic clock.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_monotonic_time_ns() -> u64 {
    monotonic_timestamp_ns()
}

/// Create a clock. Returns its handle, or `0` on failure.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_sync_clock_create() -> u64 {
    guarded("sync_clock_create", 0, || {
        Ok(CLOCKS.insert(SyncClock::new()).into_raw())
    })
}

/// Microseconds since the clock's origin, or `-1` on a bad handle.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_sync_clock_timestamp_us(clock: u64) -> i64 {
    guarded("sync_clock_timestamp_us", -1, || {
        Ok(CLOCKS.get(Handle::from_raw(clock))?.now_micros())
    })
}

/// Milliseconds since the clock's origin, or `-1` on a bad handle.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_sync_clock_timestamp_ms(clock: u64) -> i64 {
    guarded("sync_clock_timestamp_ms", -1, || {
        Ok(CLOCKS.get(Handle::from_raw(clock))?.now_millis())
    })
}

/// NTP time in milliseconds since 1900.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_sync_clock_ntp_ms(clock: u64) -> i64 {
    guarded("sync_clock_ntp_ms", -1, || {
        Ok(CLOCKS.get(Handle::from_raw(clock))?.now_ntp().to_millis())
    })
}

/// Dispose a clock. Disposing a null or already disposed handle is a no-op.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_sync_clock_dispose(clock: u64) -> i32 {
    status("sync_clock_dispose", || {
        let handle = Handle::from_raw(clock);
        if !handle.is_null() && CLOCKS.remove(handle).is_err() {
            debug!(?handle, "clock already disposed");
        }
        Ok(MEDIA_BRIDGE_OK)
    })
}

/// Create a push source stamped by `clock`. Returns `0` on failure.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_custom_audio_source_create(clock: u64) -> u64 {
    guarded("custom_audio_source_create", 0, || {
        let clock = CLOCKS.get(Handle::from_raw(clock))?;
        let source = CustomAudioSource::with_capture_delay(clock, CONFIG.capture_delay_us);
        let adapter = RefCountedAdapter::new("custom audio source", source, AUDIO_SOURCE_INTERFACES);
        Ok(AUDIO_SOURCES.insert_arc(adapter).into_raw())
    })
}

/// The source behind `handle` for calls made by the managed side.
fn audio_source(handle: u64) -> Result<Arc<CustomAudioSource>> {
    let adapter = AUDIO_SOURCES.get(Handle::from_raw(handle))?;
    if adapter.is_externally_disposed() {
        return Err(BridgeError::UseAfterRelease);
    }
    adapter.get()
}

/// Push interleaved PCM. Returns [`MEDIA_BRIDGE_OK`] or a negative status.
///
/// # Safety
/// `data` must be valid for `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn media_bridge_custom_audio_source_push(
    source: u64,
    data: *const u8,
    len: usize,
    bits_per_sample: u32,
    sample_rate: u32,
    channels: u32,
    frames: u32,
) -> i32 {
    status("custom_audio_source_push", || {
        let source = audio_source(source)?;
        let data = unsafe { input(data, len, "audio data")? };
        source.push_audio(data, bits_per_sample, sample_rate, usize_arg(channels), usize_arg(frames))?;
        Ok(MEDIA_BRIDGE_OK)
    })
}

/// Change the delay subtracted from capture timestamps.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_custom_audio_source_set_capture_delay(source: u64, delay_us: i64) -> i32 {
    status("custom_audio_source_set_capture_delay", || {
        audio_source(source)?.set_capture_delay_us(delay_us);
        Ok(MEDIA_BRIDGE_OK)
    })
}

/// Take a reference for the engine. Returns the new count.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_custom_audio_source_retain(source: u64) -> i32 {
    status("custom_audio_source_retain", || {
        let count = AUDIO_SOURCES.get(Handle::from_raw(source))?.add_ref()?;
        Ok(count as i32)
    })
}

/// Drop a reference. The release reaching zero frees the source and its handle.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_custom_audio_source_release(source: u64) -> i32 {
    status("custom_audio_source_release", || {
        let handle = Handle::from_raw(source);
        let remaining = AUDIO_SOURCES.get(handle)?.release()?;
        if remaining == 0 {
            AUDIO_SOURCES.remove(handle)?;
        }
        Ok(remaining as i32)
    })
}

/// Drop the creator's reference. Returns the references still held by the engine; the
/// handle stays valid for its `retain`/`release` until that count reaches zero, while
/// pushes through it fail. Repeat calls are no-ops.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_custom_audio_source_dispose(source: u64) -> i32 {
    status("custom_audio_source_dispose", || {
        let handle = Handle::from_raw(source);
        if handle.is_null() {
            return Ok(MEDIA_BRIDGE_OK);
        }
        let Ok(adapter) = AUDIO_SOURCES.get(handle) else {
            return Ok(MEDIA_BRIDGE_OK);
        };
        let remaining = adapter.dispose_external()?;
        if remaining == 0 {
            // A racing final release may already have removed it.
            let _ = AUDIO_SOURCES.remove(handle);
        }
        Ok(remaining as i32)
    })
}

/// `1` when a decoder exists for the format, `0` when not, or a negative status.
///
/// # Safety
/// `name` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn media_bridge_codec_is_supported(
    name: *const c_char,
    clock_rate: u32,
    channels: u32,
) -> i32 {
    status("codec_is_supported", || {
        if name.is_null() {
            return Err(BridgeError::invalid_argument("codec name is null"));
        }
        let name = unsafe { CStr::from_ptr(name) }
            .to_str()
            .map_err(|_| BridgeError::invalid_argument("codec name is not UTF-8"))?;
        let format = SdpAudioFormat::new(name, clock_rate, usize_arg(channels));
        Ok(i32::from(CODECS.is_supported(&format)))
    })
}

fn fourcc(value: u32) -> Result<FourCC> {
    FourCC::from_u32(value).ok_or_else(|| BridgeError::UnsupportedFormat(format!("fourcc {value:#010x}")))
}

/// Bytes a `width` x `height` frame needs in `fourcc`, or a negative status.
#[unsafe(no_mangle)]
pub extern "C" fn media_bridge_required_buffer_size(width: u32, height: u32, fourcc: u32) -> i64 {
    status("required_buffer_size", || {
        Ok(convert::required_buffer_size_raw(usize_arg(width), usize_arg(height), fourcc)? as i64)
    })
}

/// Convert I420 planes into a packed buffer. Returns bytes written or a negative status;
/// `dst` is untouched on failure.
///
/// # Safety
/// Every pointer must be valid for its paired length.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn media_bridge_i420_to_packed(
    src_y: *const u8,
    len_y: usize,
    stride_y: u32,
    src_u: *const u8,
    len_u: usize,
    stride_u: u32,
    src_v: *const u8,
    len_v: usize,
    stride_v: u32,
    dst: *mut u8,
    dst_len: usize,
    width: u32,
    height: u32,
    fourcc_value: u32,
) -> i64 {
    status("i420_to_packed", || {
        let format = fourcc(fourcc_value)?;
        let planes = unsafe {
            I420Planes {
                y: input(src_y, len_y, "y plane")?,
                stride_y: usize_arg(stride_y),
                u: input(src_u, len_u, "u plane")?,
                stride_u: usize_arg(stride_u),
                v: input(src_v, len_v, "v plane")?,
                stride_v: usize_arg(stride_v),
            }
        };
        let dst = unsafe { output(dst, dst_len, "destination")? };
        let written = convert::i420_to_packed(&planes, dst, usize_arg(width), usize_arg(height), format)?;
        Ok(written as i64)
    })
}

/// Convert a packed buffer into I420 planes. Returns [`MEDIA_BRIDGE_OK`] or a negative
/// status; the planes are untouched on failure.
///
/// # Safety
/// Every pointer must be valid for its paired length.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn media_bridge_packed_to_i420(
    src: *const u8,
    src_len: usize,
    dst_y: *mut u8,
    len_y: usize,
    stride_y: u32,
    dst_u: *mut u8,
    len_u: usize,
    stride_u: u32,
    dst_v: *mut u8,
    len_v: usize,
    stride_v: u32,
    width: u32,
    height: u32,
    fourcc_value: u32,
) -> i32 {
    status("packed_to_i420", || {
        let format = fourcc(fourcc_value)?;
        let src = unsafe { input(src, src_len, "source")? };
        let mut planes = unsafe {
            I420PlanesMut {
                y: output(dst_y, len_y, "y plane")?,
                stride_y: usize_arg(stride_y),
                u: output(dst_u, len_u, "u plane")?,
                stride_u: usize_arg(stride_u),
                v: output(dst_v, len_v, "v plane")?,
                stride_v: usize_arg(stride_v),
            }
        };
        convert::packed_to_i420(src, usize_arg(width), usize_arg(height), format, &mut planes)?;
        Ok(MEDIA_BRIDGE_OK)
    })
}
