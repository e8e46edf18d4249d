//! Push-based audio source stamping every buffer with the synchronized clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use crate::clock::SyncClock;
use crate::error::{BridgeError, Result};
use crate::video::SourceState;

/// One block of interleaved PCM handed to audio track sinks.
#[derive(Clone, Copy, Debug)]
pub struct AudioChunk<'a> {
    /// Interleaved PCM bytes.
    pub data: &'a [u8],
    /// Bits per sample.
    pub bits_per_sample: u32,
    /// Sample rate in Hertz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: usize,
    /// Frames per channel in `data`.
    pub frames: usize,
    /// Capture time on the synchronized clock, capture delay already subtracted.
    pub capture_timestamp_us: i64,
    /// Wall-clock capture time, when the source knows it.
    pub absolute_capture_time_ms: Option<i64>,
}

/// Receiver of audio from a track or source.
pub trait AudioTrackSink: Send + Sync {
    /// Receive one chunk. Runs on the pushing thread.
    fn on_data(&self, chunk: &AudioChunk<'_>);
}

/// Audio source fed by the application through [`CustomAudioSource::push_audio`].
pub struct CustomAudioSource {
    clock: Arc<SyncClock>,
    sinks: RwLock<Vec<Arc<dyn AudioTrackSink>>>,
    capture_delay_us: AtomicI64,
    total_frames: AtomicU64,
}

impl CustomAudioSource {
    /// Source stamped by `clock` with no capture delay.
    pub fn new(clock: Arc<SyncClock>) -> Self {
        Self::with_capture_delay(clock, 0)
    }

    /// Source whose timestamps are moved back by `delay_us`.
    pub fn with_capture_delay(clock: Arc<SyncClock>, delay_us: i64) -> Self {
        Self {
            clock,
            sinks: RwLock::new(Vec::new()),
            capture_delay_us: AtomicI64::new(delay_us),
            total_frames: AtomicU64::new(0),
        }
    }

    /// Deliver future chunks to `sink` as well.
    pub fn add_sink(&self, sink: Arc<dyn AudioTrackSink>) {
        self.sinks.write().push(sink);
    }

    /// Stop delivering to `sink`.
    pub fn remove_sink(&self, sink: &Arc<dyn AudioTrackSink>) {
        self.sinks.write().retain(|s| !Arc::ptr_eq(s, sink));
    }

    /// Custom sources are always live and local.
    pub fn state(&self) -> SourceState {
        SourceState::Live
    }

    /// Change the delay subtracted from capture timestamps.
    pub fn set_capture_delay_us(&self, delay_us: i64) {
        self.capture_delay_us.store(delay_us, Ordering::Release);
    }

    /// Delay subtracted from capture timestamps.
    pub fn capture_delay_us(&self) -> i64 {
        self.capture_delay_us.load(Ordering::Acquire)
    }

    /// Frames pushed since creation.
    pub fn total_frames_captured(&self) -> u64 {
        self.total_frames.load(Ordering::Acquire)
    }

    /// Stamp and deliver one buffer of interleaved samples to every sink.
    /// Returns the capture timestamp in microseconds.
    pub fn push_audio(
        &self,
        data: &[u8],
        bits_per_sample: u32,
        sample_rate: u32,
        channels: usize,
        frames: usize,
    ) -> Result<i64> {
        if bits_per_sample == 0 || bits_per_sample % 8 != 0 {
            return Err(BridgeError::invalid_argument(format!(
                "bits per sample {bits_per_sample}"
            )));
        }
        if channels == 0 || sample_rate == 0 {
            return Err(BridgeError::invalid_argument("channels and sample rate must be non-zero"));
        }
        let need = frames * channels * (bits_per_sample as usize / 8);
        if data.len() < need {
            return Err(BridgeError::InsufficientBuffer {
                has: data.len(),
                need,
            });
        }

        let timestamp_us = self.clock.now_micros() - self.capture_delay_us();
        let chunk = AudioChunk {
            data: &data[..need],
            bits_per_sample,
            sample_rate,
            channels,
            frames,
            capture_timestamp_us: timestamp_us,
            absolute_capture_time_ms: Some(timestamp_us / 1_000),
        };
        for sink in self.sinks.read().iter() {
            sink.on_data(&chunk);
        }
        self.total_frames.fetch_add(frames as u64, Ordering::AcqRel);
        trace!(frames, timestamp_us, "custom audio pushed");
        Ok(timestamp_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualMonotonic;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Timestamps(Mutex<Vec<(i64, Option<i64>, usize)>>);

    impl AudioTrackSink for Timestamps {
        fn on_data(&self, chunk: &AudioChunk<'_>) {
            self.0.lock().push((
                chunk.capture_timestamp_us,
                chunk.absolute_capture_time_ms,
                chunk.data.len(),
            ));
        }
    }

    #[test]
    fn pushed_buffers_are_stamped_minus_capture_delay() {
        let time = Arc::new(ManualMonotonic::new(0));
        let clock = Arc::new(SyncClock::with_source(time.clone()));
        let source = CustomAudioSource::with_capture_delay(clock, 2_500);
        let sink = Arc::new(Timestamps::default());
        source.add_sink(sink.clone());

        let pcm = vec![0u8; 480 * 2 * 2];
        for _ in 0..5 {
            time.advance(Duration::from_millis(10));
            source.push_audio(&pcm, 16, 48_000, 2, 480).expect("push");
        }

        let seen = sink.0.lock();
        assert_eq!(seen.len(), 5);
        for (i, (us, ms, len)) in seen.iter().enumerate() {
            let expected = (i as i64 + 1) * 10_000 - 2_500;
            assert_eq!(*us, expected);
            assert_eq!(*ms, Some(expected / 1_000));
            assert_eq!(*len, pcm.len());
        }
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(source.total_frames_captured(), 5 * 480);
    }

    #[test]
    fn short_buffers_and_bad_formats_are_rejected() {
        let source = CustomAudioSource::new(Arc::new(SyncClock::new()));
        assert_eq!(
            source.push_audio(&[0; 10], 16, 48_000, 1, 6),
            Err(BridgeError::InsufficientBuffer { has: 10, need: 12 })
        );
        assert!(source.push_audio(&[0; 10], 12, 48_000, 1, 1).is_err());
        assert!(source.push_audio(&[0; 10], 16, 48_000, 0, 1).is_err());
        assert_eq!(source.total_frames_captured(), 0);
    }

    #[test]
    fn removed_sink_stops_receiving() {
        let source = CustomAudioSource::new(Arc::new(SyncClock::new()));
        let sink = Arc::new(Timestamps::default());
        let as_dyn: Arc<dyn AudioTrackSink> = sink.clone();
        source.add_sink(as_dyn.clone());
        source.push_audio(&[0; 4], 16, 8_000, 1, 2).expect("push");
        source.remove_sink(&as_dyn);
        source.push_audio(&[0; 4], 16, 8_000, 1, 2).expect("push");
        assert_eq!(sink.0.lock().len(), 1);
    }
}
