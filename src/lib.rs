#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! Native media bridge exposed to managed host runtimes.
//!
//! The crate carries the pieces a host-language binding needs around a real-time media
//! engine: a shared clock, push-style custom audio and video sources, pixel format
//! conversion, device enumeration with hotplug notifications, audio codec discovery and
//! adapters that forward engine callbacks into managed objects. Objects cross the C ABI in
//! [`ffi`] as generation-checked handles.

/// Push-based custom audio source.
pub mod audio_source;
/// Synchronized media clock.
pub mod clock;
/// Audio codec discovery and adapters.
pub mod codec;
/// Process configuration.
pub mod config;
/// Developer-facing control and TUI support.
pub mod control;
/// Device enumeration and hotplug.
pub mod device;
/// Error type.
pub mod error;
/// C ABI.
pub mod ffi;
/// Handles naming native objects.
pub mod handle;
/// Tracing setup and the host log queue.
pub mod logging;
/// Managed object mirrors.
pub mod mirror;
/// Reference counting for engine-held objects.
pub mod refcount;
/// Audio transport and track adapters.
pub mod transport;
/// Video frames, sources and pixel conversion.
pub mod video;

#[cfg(test)]
mod tests;

pub use audio_source::{AudioChunk, AudioTrackSink, CustomAudioSource};
pub use clock::{NtpTimestamp, SyncClock, monotonic_timestamp_ns};
pub use codec::{AudioCodecFactory, AudioDecoder, AudioEncoder, SdpAudioFormat};
pub use config::{BridgeConfig, CodecDefaults};
pub use device::{
    AudioDeviceManager, DeviceEvent, DeviceKind, DeviceManager, DeviceRecord, HotplugListener,
    VideoDeviceManager, media_devices,
};
pub use error::{BridgeError, Result};
pub use handle::{Handle, HandleRegistry};
pub use refcount::RefCountedAdapter;
pub use transport::{AudioTransport, AudioTransportBridge};
pub use video::{CustomVideoSource, FourCC, I420Buffer, VideoFrame, VideoSink};
