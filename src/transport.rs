//! Transport adapters between media engine pipeline threads and managed callbacks.
//!
//! Every call is synchronous: the pipeline thread blocks until the managed handler returns,
//! and native buffers are copied before the handler sees them.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::audio_source::{AudioChunk, AudioTrackSink};
use crate::clock::SyncClock;
use crate::error::{BridgeError, Result};
use crate::mirror::{
    AUDIO_SINK, AUDIO_SOURCE, AUDIO_TRACK_SINK, ManagedByteArray, ManagedObject,
    ManagedObjectMirror, ManagedRuntime, ManagedValue, ON_DATA, ON_PLAYBACK_DATA,
    ON_RECORDED_DATA, ON_VIDEO_FRAME, VIDEO_TRACK_SINK,
};
use crate::video::{VideoFrame, VideoSink};

/// Captured audio handed up by the device module.
#[derive(Clone, Copy, Debug)]
pub struct RecordedAudio<'a> {
    /// Interleaved PCM bytes.
    pub samples: &'a [u8],
    /// Frames per channel in `samples`.
    pub n_samples: usize,
    /// Bytes per frame across all channels.
    pub bytes_per_sample: usize,
    /// Channel count.
    pub channels: usize,
    /// Sample rate in Hertz.
    pub sample_rate: u32,
    /// Capture plus render delay reported by the device.
    pub total_delay_ms: u32,
    /// Clock drift between capture and render, in ppm.
    pub clock_drift: i32,
}

impl RecordedAudio<'_> {
    fn byte_len(&self) -> usize {
        self.n_samples * self.bytes_per_sample
    }
}

/// Playout request from the device module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlayoutRequest {
    /// Frames per channel wanted.
    pub n_samples: usize,
    /// Bytes per frame across all channels.
    pub bytes_per_sample: usize,
    /// Channel count.
    pub channels: usize,
    /// Sample rate in Hertz.
    pub sample_rate: u32,
}

impl PlayoutRequest {
    /// Bytes the request covers.
    pub fn byte_len(&self) -> usize {
        self.n_samples * self.bytes_per_sample
    }
}

/// Outcome of a playout pull.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlayoutResult {
    /// Sample count reported to the engine. The whole buffer is valid.
    pub samples_out: usize,
    /// Samples the managed source actually produced.
    pub provided: usize,
    /// Milliseconds on the attached clock, or zero.
    pub elapsed_time_ms: i64,
    /// NTP time in milliseconds, or zero.
    pub ntp_time_ms: i64,
}

/// The engine's audio transport contract.
pub trait AudioTransport: Send + Sync {
    /// Deliver captured audio. Returns the engine status.
    fn recorded_data_is_available(&self, recorded: &RecordedAudio<'_>) -> Result<i32> {
        let _ = recorded;
        Ok(0)
    }

    /// Fill `out` with `request.byte_len()` bytes of playout audio.
    fn need_more_play_data(&self, request: &PlayoutRequest, out: &mut [u8]) -> Result<PlayoutResult> {
        let len = checked_len(request, out)?;
        out[..len].fill(0);
        Ok(PlayoutResult {
            samples_out: request.n_samples,
            ..PlayoutResult::default()
        })
    }
}

fn checked_len(request: &PlayoutRequest, out: &[u8]) -> Result<usize> {
    let need = request.byte_len();
    if out.len() < need {
        return Err(BridgeError::InsufficientBuffer {
            has: out.len(),
            need,
        });
    }
    Ok(need)
}

fn int_arg(value: usize) -> ManagedValue {
    ManagedValue::Int(i32::try_from(value).unwrap_or(i32::MAX))
}

/// Delivers recorded audio to a managed `AudioSink`.
pub struct AudioTransportSink {
    mirror: ManagedObjectMirror,
}

impl AudioTransportSink {
    /// Resolve the managed sink's entry points.
    pub fn new(runtime: Arc<dyn ManagedRuntime>, sink: Arc<dyn ManagedObject>) -> Result<Self> {
        Ok(Self {
            mirror: ManagedObjectMirror::new(runtime, sink, &AUDIO_SINK)?,
        })
    }
}

impl AudioTransport for AudioTransportSink {
    fn recorded_data_is_available(&self, recorded: &RecordedAudio<'_>) -> Result<i32> {
        let len = recorded.byte_len();
        if recorded.samples.len() < len {
            return Err(BridgeError::InsufficientBuffer {
                has: recorded.samples.len(),
                need: len,
            });
        }
        let data = ManagedByteArray::from_slice(&recorded.samples[..len]);
        trace!(bytes = len, "recorded audio to managed sink");
        self.mirror.invoke(
            ON_RECORDED_DATA,
            &[
                ManagedValue::Bytes(data),
                int_arg(recorded.n_samples),
                int_arg(recorded.bytes_per_sample),
                int_arg(recorded.channels),
                ManagedValue::Int(recorded.sample_rate as i32),
                ManagedValue::Int(recorded.total_delay_ms as i32),
                ManagedValue::Int(recorded.clock_drift),
            ],
        )?;
        Ok(0)
    }
}

/// Pulls playout audio from a managed `AudioSource`.
pub struct AudioTransportSource {
    mirror: ManagedObjectMirror,
    buffer: Mutex<Option<ManagedByteArray>>,
    clock: Option<Arc<SyncClock>>,
}

impl AudioTransportSource {
    /// Resolve the managed source's entry points.
    pub fn new(runtime: Arc<dyn ManagedRuntime>, source: Arc<dyn ManagedObject>) -> Result<Self> {
        Ok(Self {
            mirror: ManagedObjectMirror::new(runtime, source, &AUDIO_SOURCE)?,
            buffer: Mutex::new(None),
            clock: None,
        })
    }

    /// Report elapsed and NTP time from `clock` instead of zero.
    pub fn with_clock(mut self, clock: Arc<SyncClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn cached_buffer(&self, len: usize) -> ManagedByteArray {
        let mut slot = self.buffer.lock();
        match slot.as_ref() {
            Some(buffer) => {
                buffer.reset(len);
                buffer.clone()
            }
            None => {
                let buffer = ManagedByteArray::new(len);
                *slot = Some(buffer.clone());
                buffer
            }
        }
    }
}

impl AudioTransport for AudioTransportSource {
    fn need_more_play_data(&self, request: &PlayoutRequest, out: &mut [u8]) -> Result<PlayoutResult> {
        let len = checked_len(request, out)?;
        let (elapsed_time_ms, ntp_time_ms) = match &self.clock {
            Some(clock) => {
                let reading = clock.snapshot();
                (reading.millis, reading.ntp.to_millis())
            }
            None => (0, 0),
        };

        let buffer = self.cached_buffer(len);
        let filled = self.mirror.invoke(
            ON_PLAYBACK_DATA,
            &[
                ManagedValue::Bytes(buffer.clone()),
                int_arg(request.n_samples),
                int_arg(request.bytes_per_sample),
                int_arg(request.channels),
                ManagedValue::Int(request.sample_rate as i32),
            ],
        );
        let filled = match filled {
            Ok(value) => value.as_int().unwrap_or(0),
            Err(err) => {
                out[..len].fill(0);
                return Err(err);
            }
        };

        let requested = i32::try_from(request.n_samples).unwrap_or(i32::MAX);
        let provided = filled.clamp(0, requested) as usize;
        let provided_bytes = provided * request.bytes_per_sample;
        if provided > 0 {
            buffer.read_into(&mut out[..provided_bytes]);
        }
        out[provided_bytes..len].fill(0);
        if provided < request.n_samples {
            debug!(provided, requested = request.n_samples, "short playout fill padded with silence");
        }

        Ok(PlayoutResult {
            samples_out: request.n_samples,
            provided,
            elapsed_time_ms,
            ntp_time_ms,
        })
    }
}

/// Routes recorded audio and playout requests to optional transports.
#[derive(Default)]
pub struct AudioTransportBridge {
    sink: RwLock<Option<Arc<dyn AudioTransport>>>,
    source: RwLock<Option<Arc<dyn AudioTransport>>>,
}

impl AudioTransportBridge {
    /// Bridge with neither sink nor source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route recorded audio to `sink`.
    pub fn set_sink(&self, sink: Option<Arc<dyn AudioTransport>>) {
        *self.sink.write() = sink;
    }

    /// Route playout requests to `source`.
    pub fn set_source(&self, source: Option<Arc<dyn AudioTransport>>) {
        *self.source.write() = source;
    }
}

impl AudioTransport for AudioTransportBridge {
    fn recorded_data_is_available(&self, recorded: &RecordedAudio<'_>) -> Result<i32> {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => sink.recorded_data_is_available(recorded),
            None => Ok(0),
        }
    }

    fn need_more_play_data(&self, request: &PlayoutRequest, out: &mut [u8]) -> Result<PlayoutResult> {
        let source = self.source.read().clone();
        match source {
            Some(source) => source.need_more_play_data(request, out),
            None => {
                let len = checked_len(request, out)?;
                out[..len].fill(0);
                Ok(PlayoutResult {
                    samples_out: request.n_samples,
                    ..PlayoutResult::default()
                })
            }
        }
    }
}

/// Audio track sink forwarding to a managed `onData` handler.
pub struct ManagedAudioTrackSink {
    mirror: ManagedObjectMirror,
}

impl ManagedAudioTrackSink {
    /// Resolve the managed sink's entry points.
    pub fn new(runtime: Arc<dyn ManagedRuntime>, sink: Arc<dyn ManagedObject>) -> Result<Self> {
        Ok(Self {
            mirror: ManagedObjectMirror::new(runtime, sink, &AUDIO_TRACK_SINK)?,
        })
    }
}

impl AudioTrackSink for ManagedAudioTrackSink {
    fn on_data(&self, chunk: &AudioChunk<'_>) {
        let result = self.mirror.invoke(
            ON_DATA,
            &[
                ManagedValue::Bytes(ManagedByteArray::from_slice(chunk.data)),
                ManagedValue::Int(chunk.bits_per_sample as i32),
                ManagedValue::Int(chunk.sample_rate as i32),
                int_arg(chunk.channels),
                int_arg(chunk.frames),
            ],
        );
        if let Err(err) = result {
            warn!(%err, "audio track sink failed");
        }
    }
}

/// Video sink forwarding to a managed `onVideoFrame` handler.
pub struct ManagedVideoSink {
    mirror: ManagedObjectMirror,
}

impl ManagedVideoSink {
    /// Resolve the managed sink's entry points.
    pub fn new(runtime: Arc<dyn ManagedRuntime>, sink: Arc<dyn ManagedObject>) -> Result<Self> {
        Ok(Self {
            mirror: ManagedObjectMirror::new(runtime, sink, &VIDEO_TRACK_SINK)?,
        })
    }
}

impl VideoSink for ManagedVideoSink {
    fn on_frame(&self, frame: &VideoFrame) {
        let result = self
            .mirror
            .invoke(ON_VIDEO_FRAME, &[ManagedValue::VideoFrame(Arc::new(frame.clone()))]);
        if let Err(err) = result {
            warn!(%err, id = frame.id, "video sink failed");
        }
    }
}
