#![deny(clippy::all)]

use std::sync::Arc;

use napi::bindgen_prelude::{Buffer, Error};
use napi_derive::napi;

use media_bridge::clock::{SyncClock, monotonic_timestamp_ns};
use media_bridge::handle::{self, HandleSlot, NativeOwner, resolve, store_handle};
use media_bridge::device::{DeviceKind, media_devices};
use media_bridge::video::{FourCC, I420Buffer, I420Planes, convert, required_buffer_size};
use media_bridge::{BridgeConfig, BridgeError, ffi, logging};

fn to_napi(err: BridgeError) -> Error {
    Error::from_reason(err.to_string())
}

fn parse_kind(kind: &str) -> napi::Result<DeviceKind> {
    match kind {
        "audioinput" | "audioCapture" => Ok(DeviceKind::AudioCapture),
        "audiooutput" | "audioRender" => Ok(DeviceKind::AudioRender),
        "videoinput" | "videoCapture" => Ok(DeviceKind::VideoCapture),
        other => Err(Error::from_reason(format!("unknown device kind '{other}'"))),
    }
}

fn parse_fourcc(name: &str) -> napi::Result<FourCC> {
    FourCC::from_name(name)
        .ok_or_else(|| Error::from_reason(format!("unsupported pixel format '{name}'")))
}

fn dimension(value: u32, what: &str) -> napi::Result<usize> {
    if value == 0 {
        return Err(Error::from_reason(format!("{what} must be greater than zero")));
    }
    Ok(value as usize)
}

/// Install the tracing subscriber configured from the environment.
#[napi]
pub fn init() {
    logging::init_tracing(&BridgeConfig::from_env());
}

/// Oldest buffered log line, if any.
#[napi]
pub fn take_log() -> Option<String> {
    logging::pop_log().map(|record| record.to_string())
}

#[napi]
pub fn monotonic_time_ns() -> napi::Result<f64> {
    Ok(monotonic_timestamp_ns() as f64)
}

#[napi(object)]
pub struct MediaDevice {
    pub name: String,
    pub descriptor: String,
    pub kind: String,
    pub is_default: bool,
}

#[napi]
pub fn list_devices(kind: String) -> napi::Result<Vec<MediaDevice>> {
    let kind = parse_kind(&kind)?;
    let manager = media_devices();
    let devices = manager.devices(kind).map_err(to_napi)?;
    let default = manager.default_device(kind).map_err(to_napi)?;
    Ok(devices
        .into_iter()
        .map(|device| MediaDevice {
            is_default: default.as_ref() == Some(&device),
            kind: device.kind.label().to_string(),
            name: device.name,
            descriptor: device.descriptor,
        })
        .collect())
}

/// Clock living in the native handle table; `dispose` invalidates it.
#[napi(js_name = "SyncClock")]
pub struct JsSyncClock {
    handle: HandleSlot,
}

impl Default for JsSyncClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeOwner for JsSyncClock {
    fn handle_slot(&self) -> &HandleSlot {
        &self.handle
    }
}

#[napi]
impl JsSyncClock {
    #[napi(constructor)]
    pub fn new() -> Self {
        let clock = Self {
            handle: HandleSlot::new(),
        };
        store_handle(&clock, ffi::sync_clocks().insert(SyncClock::new()));
        clock
    }

    fn clock(&self) -> napi::Result<Arc<SyncClock>> {
        resolve(self, ffi::sync_clocks())
            .map_err(|_| Error::from_reason("SyncClock has been disposed".to_string()))
    }

    #[napi]
    pub fn timestamp_us(&self) -> napi::Result<i64> {
        Ok(self.clock()?.now_micros())
    }

    #[napi]
    pub fn timestamp_ms(&self) -> napi::Result<i64> {
        Ok(self.clock()?.now_millis())
    }

    #[napi]
    pub fn ntp_ms(&self) -> napi::Result<i64> {
        Ok(self.clock()?.now_ntp().to_millis())
    }

    /// Release the native clock. Repeat calls are no-ops.
    #[napi]
    pub fn dispose(&self) {
        handle::dispose(self, ffi::sync_clocks());
    }
}

#[napi]
pub fn required_buffer_size_for(width: u32, height: u32, fourcc: String) -> napi::Result<u32> {
    let fourcc = parse_fourcc(&fourcc)?;
    let size = required_buffer_size(width as usize, height as usize, fourcc);
    u32::try_from(size).map_err(|_| Error::from_reason(format!("{size} bytes exceeds u32")))
}

#[napi(object)]
pub struct I420Frame {
    pub width: u32,
    pub height: u32,
    pub y: Buffer,
    pub u: Buffer,
    pub v: Buffer,
}

/// Pack tightly strided I420 planes into `fourcc`.
#[napi]
pub fn i420_to_packed(frame: I420Frame, fourcc: String) -> napi::Result<Buffer> {
    let fourcc = parse_fourcc(&fourcc)?;
    let width = dimension(frame.width, "width")?;
    let height = dimension(frame.height, "height")?;
    let chroma_width = width.div_ceil(2);
    let planes = I420Planes {
        y: &frame.y,
        stride_y: width,
        u: &frame.u,
        stride_u: chroma_width,
        v: &frame.v,
        stride_v: chroma_width,
    };
    let mut out = vec![0u8; required_buffer_size(width, height, fourcc)];
    convert::i420_to_packed(&planes, &mut out, width, height, fourcc).map_err(to_napi)?;
    Ok(out.into())
}

#[napi]
pub fn packed_to_i420(
    data: Buffer,
    width: u32,
    height: u32,
    fourcc: String,
) -> napi::Result<I420Frame> {
    let fourcc = parse_fourcc(&fourcc)?;
    let (w, h) = (dimension(width, "width")?, dimension(height, "height")?);
    let mut buffer = I420Buffer::new(w, h);
    let mut planes = buffer.planes_mut();
    convert::packed_to_i420(&data, w, h, fourcc, &mut planes).map_err(to_napi)?;
    Ok(I420Frame {
        width,
        height,
        y: buffer.data_y().to_vec().into(),
        u: buffer.data_u().to_vec().into(),
        v: buffer.data_v().to_vec().into(),
    })
}
