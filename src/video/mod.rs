//! Video frames, pixel buffers and the push-based custom video source.

/// Pixel layouts and conversion to and from I420.
pub mod convert;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::clock::SyncClock;
use crate::error::{BridgeError, Result};

pub use convert::{FourCC, I420Planes, I420PlanesMut, required_buffer_size};
use convert::{chroma_dim, packed_to_i420};

/// Planar 4:2:0 buffer with explicit per-plane strides.
#[derive(Clone, PartialEq, Eq)]
pub struct I420Buffer {
    width: usize,
    height: usize,
    stride_y: usize,
    stride_u: usize,
    stride_v: usize,
    data_y: Vec<u8>,
    data_u: Vec<u8>,
    data_v: Vec<u8>,
}

impl I420Buffer {
    /// Zeroed buffer with tightly packed strides.
    pub fn new(width: usize, height: usize) -> Self {
        let cw = chroma_dim(width);
        Self::allocate(width, height, width, cw, cw)
    }

    /// Zeroed buffer with caller chosen strides.
    pub fn with_strides(
        width: usize,
        height: usize,
        stride_y: usize,
        stride_u: usize,
        stride_v: usize,
    ) -> Result<Self> {
        let cw = chroma_dim(width);
        if stride_y < width || stride_u < cw || stride_v < cw {
            return Err(BridgeError::invalid_argument(format!(
                "strides {stride_y}/{stride_u}/{stride_v} too small for width {width}"
            )));
        }
        Ok(Self::allocate(width, height, stride_y, stride_u, stride_v))
    }

    fn allocate(width: usize, height: usize, sy: usize, su: usize, sv: usize) -> Self {
        let ch = chroma_dim(height);
        Self {
            width,
            height,
            stride_y: sy,
            stride_u: su,
            stride_v: sv,
            data_y: vec![0; sy * height],
            data_u: vec![0; su * ch],
            data_v: vec![0; sv * ch],
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Bytes between luma rows.
    pub fn stride_y(&self) -> usize {
        self.stride_y
    }

    /// Bytes between Cb rows.
    pub fn stride_u(&self) -> usize {
        self.stride_u
    }

    /// Bytes between Cr rows.
    pub fn stride_v(&self) -> usize {
        self.stride_v
    }

    /// Luma plane.
    pub fn data_y(&self) -> &[u8] {
        &self.data_y
    }

    /// Cb plane.
    pub fn data_u(&self) -> &[u8] {
        &self.data_u
    }

    /// Cr plane.
    pub fn data_v(&self) -> &[u8] {
        &self.data_v
    }

    /// Borrowed planes.
    pub fn planes(&self) -> I420Planes<'_> {
        I420Planes {
            y: &self.data_y,
            stride_y: self.stride_y,
            u: &self.data_u,
            stride_u: self.stride_u,
            v: &self.data_v,
            stride_v: self.stride_v,
        }
    }

    /// Mutable planes.
    pub fn planes_mut(&mut self) -> I420PlanesMut<'_> {
        I420PlanesMut {
            y: &mut self.data_y,
            stride_y: self.stride_y,
            u: &mut self.data_u,
            stride_u: self.stride_u,
            v: &mut self.data_v,
            stride_v: self.stride_v,
        }
    }

    /// Set every visible sample; `f(plane, x, y)` with plane 0 = Y, 1 = U, 2 = V.
    pub fn fill_with(&mut self, mut f: impl FnMut(usize, usize, usize) -> u8) {
        let (cw, ch) = (chroma_dim(self.width), chroma_dim(self.height));
        let planes = [
            (&mut self.data_y, self.stride_y, self.width, self.height),
            (&mut self.data_u, self.stride_u, cw, ch),
            (&mut self.data_v, self.stride_v, cw, ch),
        ];
        for (index, (data, stride, w, h)) in planes.into_iter().enumerate() {
            for y in 0..h {
                for x in 0..w {
                    data[y * stride + x] = f(index, x, y);
                }
            }
        }
    }
}

impl fmt::Debug for I420Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I420Buffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("strides", &(self.stride_y, self.stride_u, self.stride_v))
            .finish()
    }
}

/// Pixel data carried by a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VideoFrameBuffer {
    /// Planar I420.
    I420(I420Buffer),
    /// Packed pixels in `fourcc`.
    Packed {
        /// Pixel layout of `data`.
        fourcc: FourCC,
        /// Width in pixels.
        width: usize,
        /// Height in pixels.
        height: usize,
        /// Packed rows without padding.
        data: Vec<u8>,
    },
}

impl VideoFrameBuffer {
    /// Wrap packed bytes, checking they cover the whole image.
    pub fn packed(fourcc: FourCC, width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        let need = required_buffer_size(width, height, fourcc);
        if data.len() < need {
            return Err(BridgeError::InsufficientBuffer {
                has: data.len(),
                need,
            });
        }
        Ok(VideoFrameBuffer::Packed {
            fourcc,
            width,
            height,
            data,
        })
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        match self {
            VideoFrameBuffer::I420(buffer) => buffer.width(),
            VideoFrameBuffer::Packed { width, .. } => *width,
        }
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        match self {
            VideoFrameBuffer::I420(buffer) => buffer.height(),
            VideoFrameBuffer::Packed { height, .. } => *height,
        }
    }

    /// Planar view of this buffer, converting packed data.
    pub fn to_i420(&self) -> Result<I420Buffer> {
        match self {
            VideoFrameBuffer::I420(buffer) => Ok(buffer.clone()),
            VideoFrameBuffer::Packed {
                fourcc,
                width,
                height,
                data,
            } => {
                let mut out = I420Buffer::new(*width, *height);
                packed_to_i420(data, *width, *height, *fourcc, &mut out.planes_mut())?;
                Ok(out)
            }
        }
    }
}

/// Clockwise rotation to apply before display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VideoRotation {
    /// Upright.
    #[default]
    Rotate0,
    /// Rotated 90 degrees clockwise.
    Rotate90,
    /// Upside down.
    Rotate180,
    /// Rotated 270 degrees clockwise.
    Rotate270,
}

impl VideoRotation {
    /// Rotation for `degrees`, a multiple of 90.
    pub fn from_degrees(degrees: i32) -> Result<Self> {
        match degrees.rem_euclid(360) {
            0 => Ok(VideoRotation::Rotate0),
            90 => Ok(VideoRotation::Rotate90),
            180 => Ok(VideoRotation::Rotate180),
            270 => Ok(VideoRotation::Rotate270),
            _ => Err(BridgeError::invalid_argument(format!(
                "rotation {degrees} is not a multiple of 90"
            ))),
        }
    }

    /// Clockwise angle in degrees.
    pub fn degrees(self) -> i32 {
        match self {
            VideoRotation::Rotate0 => 0,
            VideoRotation::Rotate90 => 90,
            VideoRotation::Rotate180 => 180,
            VideoRotation::Rotate270 => 270,
        }
    }
}

/// A frame travelling through the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoFrame {
    /// Pixel data.
    pub buffer: Arc<VideoFrameBuffer>,
    /// Rotation to apply for display.
    pub rotation: VideoRotation,
    /// Capture time in microseconds.
    pub timestamp_us: i64,
    /// 90 kHz media clock.
    pub rtp_timestamp: u32,
    /// NTP capture time in milliseconds.
    pub ntp_time_ms: i64,
    /// Source-assigned sequence number.
    pub id: u32,
}

impl VideoFrame {
    /// Frame with unset RTP, NTP and id fields.
    pub fn new(buffer: VideoFrameBuffer, rotation: VideoRotation, timestamp_us: i64) -> Self {
        Self {
            buffer: Arc::new(buffer),
            rotation,
            timestamp_us,
            rtp_timestamp: 0,
            ntp_time_ms: 0,
            id: 0,
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.buffer.width()
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.buffer.height()
    }
}

/// Receiver of frames from a video source.
pub trait VideoSink: Send + Sync {
    /// Receive one frame. Runs on the delivering thread.
    fn on_frame(&self, frame: &VideoFrame);
}

/// Externally observable state of a media source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    /// Producing media.
    Live,
    /// Finished for good.
    Ended,
}

/// Video source fed by the application.
pub struct CustomVideoSource {
    clock: Arc<SyncClock>,
    sinks: RwLock<Vec<Arc<dyn VideoSink>>>,
    next_id: AtomicU32,
    ended: AtomicBool,
}

impl CustomVideoSource {
    /// Source stamped by `clock`.
    pub fn new(clock: Arc<SyncClock>) -> Self {
        Self {
            clock,
            sinks: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(0),
            ended: AtomicBool::new(false),
        }
    }

    /// Deliver future frames to `sink` as well.
    pub fn add_sink(&self, sink: Arc<dyn VideoSink>) {
        self.sinks.write().push(sink);
    }

    /// Stop delivering to `sink`.
    pub fn remove_sink(&self, sink: &Arc<dyn VideoSink>) {
        self.sinks.write().retain(|s| !Arc::ptr_eq(s, sink));
    }

    /// Number of attached sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Whether the source has ended.
    pub fn state(&self) -> SourceState {
        if self.ended.load(Ordering::Acquire) {
            SourceState::Ended
        } else {
            SourceState::Live
        }
    }

    /// Mark the source as ended. Ended sources never become live again.
    pub fn end(&self) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            debug!("custom video source ended");
        }
    }

    /// Deliver a captured buffer whose timestamp is in nanoseconds.
    pub fn deliver_frame(
        &self,
        buffer: VideoFrameBuffer,
        rotation: VideoRotation,
        timestamp_ns: i64,
    ) -> Result<()> {
        let mut frame = VideoFrame::new(buffer, rotation, timestamp_ns / 1_000);
        frame.id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.dispatch(frame)
    }

    /// Stamp `frame` from the synchronized clock and deliver it.
    pub fn push_frame(&self, mut frame: VideoFrame) -> Result<()> {
        let reading = self.clock.snapshot();
        frame.timestamp_us = reading.micros;
        frame.rtp_timestamp = ((reading.micros * 90) / 1_000) as u32;
        frame.ntp_time_ms = reading.ntp.to_millis();
        frame.id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.dispatch(frame)
    }

    fn dispatch(&self, frame: VideoFrame) -> Result<()> {
        if self.state() == SourceState::Ended {
            return Err(BridgeError::SourceEnded);
        }
        trace!(id = frame.id, ts_us = frame.timestamp_us, "video frame");
        for sink in self.sinks.read().iter() {
            sink.on_frame(&frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualMonotonic, NTP_UNIX_OFFSET_SECS};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<VideoFrame>>);

    impl VideoSink for Collect {
        fn on_frame(&self, frame: &VideoFrame) {
            self.0.lock().push(frame.clone());
        }
    }

    fn source() -> (Arc<ManualMonotonic>, CustomVideoSource, Arc<Collect>) {
        let time = Arc::new(ManualMonotonic::new(0));
        let clock = Arc::new(SyncClock::with_origin(
            time.clone(),
            NTP_UNIX_OFFSET_SECS * 1_000_000,
        ));
        let source = CustomVideoSource::new(clock);
        let sink = Arc::new(Collect::default());
        source.add_sink(sink.clone());
        (time, source, sink)
    }

    #[test]
    fn deliver_frame_converts_nanoseconds() {
        let (_, source, sink) = source();
        let buffer = VideoFrameBuffer::I420(I420Buffer::new(4, 4));
        source
            .deliver_frame(buffer, VideoRotation::Rotate90, 33_366_999)
            .expect("deliver");
        let frames = sink.0.lock();
        assert_eq!(frames[0].timestamp_us, 33_366);
        assert_eq!(frames[0].rotation.degrees(), 90);
    }

    #[test]
    fn push_frame_stamps_from_clock() {
        let (time, source, sink) = source();
        for _ in 0..3 {
            time.advance(Duration::from_millis(10));
            let frame = VideoFrame::new(
                VideoFrameBuffer::I420(I420Buffer::new(2, 2)),
                VideoRotation::Rotate0,
                0,
            );
            source.push_frame(frame).expect("push");
        }
        let frames = sink.0.lock();
        let ids: Vec<u32> = frames.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(frames[1].timestamp_us, 20_000);
        assert_eq!(frames[1].rtp_timestamp, 1_800);
        assert_eq!(
            frames[2].ntp_time_ms,
            NTP_UNIX_OFFSET_SECS as i64 * 1_000 + 30
        );
    }

    #[test]
    fn ended_state_is_terminal() {
        let (_, source, sink) = source();
        assert_eq!(source.state(), SourceState::Live);
        source.end();
        source.end();
        assert_eq!(source.state(), SourceState::Ended);
        let result = source.deliver_frame(
            VideoFrameBuffer::I420(I420Buffer::new(2, 2)),
            VideoRotation::Rotate0,
            0,
        );
        assert_eq!(result, Err(BridgeError::SourceEnded));
        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn rotation_accepts_only_right_angles() {
        assert_eq!(VideoRotation::from_degrees(-90), Ok(VideoRotation::Rotate270));
        assert_eq!(VideoRotation::from_degrees(360), Ok(VideoRotation::Rotate0));
        assert!(VideoRotation::from_degrees(45).is_err());
    }

    #[test]
    fn packed_buffer_converts_to_i420() {
        let data = vec![128u8; required_buffer_size(4, 2, FourCC::UYVY)];
        let buffer = VideoFrameBuffer::packed(FourCC::UYVY, 4, 2, data).expect("packed");
        let planar = buffer.to_i420().expect("convert");
        assert!(planar.data_y().iter().all(|&y| y == 128));
        assert!(VideoFrameBuffer::packed(FourCC::ARGB, 4, 2, vec![0; 31]).is_err());
    }
}
