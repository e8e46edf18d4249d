//! Decoder adapter that normalizes library output to interleaved i16.

use tracing::trace;

use super::library::{CodecConfig, RawDecoder, SampleFormat};
use crate::error::{BridgeError, Result};

/// Samples as a codec produced them.
#[derive(Clone, Debug, PartialEq)]
pub enum SampleBuffer {
    /// Signed 16-bit.
    S16(Vec<i16>),
    /// Signed 32-bit.
    S32(Vec<i32>),
    /// 32-bit float in [-1.0, 1.0].
    F32(Vec<f32>),
    /// 64-bit float in [-1.0, 1.0].
    F64(Vec<f64>),
}

impl SampleBuffer {
    /// Samples across all channels.
    pub fn len(&self) -> usize {
        match self {
            SampleBuffer::S16(v) => v.len(),
            SampleBuffer::S32(v) => v.len(),
            SampleBuffer::F32(v) => v.len(),
            SampleBuffer::F64(v) => v.len(),
        }
    }

    /// Whether no samples were produced.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_s16(&self, index: usize) -> i16 {
        let wide = match self {
            SampleBuffer::S16(v) => v[index] as i32,
            SampleBuffer::S32(v) => v[index] >> 16,
            SampleBuffer::F32(v) => (v[index].clamp(-1.0, 1.0) * 32767.0) as i32,
            SampleBuffer::F64(v) => (v[index].clamp(-1.0, 1.0) * 32767.0) as i32,
        };
        wide.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }
}

/// One decoded packet. Planar data stores each channel's plane back to back.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFrame {
    /// Channel count.
    pub channels: usize,
    /// Whether channels are stored as separate planes.
    pub planar: bool,
    /// Decoded samples.
    pub data: SampleBuffer,
}

impl DecodedFrame {
    /// Frame with interleaved channels.
    pub fn interleaved(channels: usize, data: SampleBuffer) -> Self {
        Self {
            channels,
            planar: false,
            data,
        }
    }

    /// Frame with one plane per channel.
    pub fn planar(channels: usize, data: SampleBuffer) -> Self {
        Self {
            channels,
            planar: true,
            data,
        }
    }

    /// Sample format matching the buffer type and layout.
    pub fn format(&self) -> SampleFormat {
        match (&self.data, self.planar) {
            (SampleBuffer::S16(_), false) => SampleFormat::S16,
            (SampleBuffer::S16(_), true) => SampleFormat::S16P,
            (SampleBuffer::S32(_), false) => SampleFormat::S32,
            (SampleBuffer::S32(_), true) => SampleFormat::S32P,
            (SampleBuffer::F32(_), false) => SampleFormat::F32,
            (SampleBuffer::F32(_), true) => SampleFormat::F32P,
            (SampleBuffer::F64(_), false) => SampleFormat::F64,
            (SampleBuffer::F64(_), true) => SampleFormat::F64P,
        }
    }

    /// Samples in each channel.
    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels
        }
    }
}

/// Convert any decoded representation to interleaved signed 16-bit PCM.
///
/// Floats are clamped to [-1.0, 1.0] and scaled by 32767; 32-bit integers are
/// shifted down by 16 bits. Every result is clamped to the i16 range.
pub fn normalize_to_s16(frame: &DecodedFrame) -> Result<Vec<i16>> {
    if frame.channels == 0 || frame.data.len() % frame.channels != 0 {
        return Err(BridgeError::invalid_argument(format!(
            "{} samples do not split into {} channels",
            frame.data.len(),
            frame.channels
        )));
    }
    let per_channel = frame.samples_per_channel();
    let mut out = Vec::with_capacity(frame.data.len());
    for i in 0..per_channel {
        for c in 0..frame.channels {
            let index = if frame.planar {
                c * per_channel + i
            } else {
                i * frame.channels + c
            };
            out.push(frame.data.to_s16(index));
        }
    }
    Ok(out)
}

/// Decoder handed to the engine: raw codec output normalized to interleaved i16.
pub struct AudioDecoder {
    codec: String,
    config: CodecConfig,
    raw: Box<dyn RawDecoder>,
}

impl AudioDecoder {
    pub(crate) fn new(codec: String, config: CodecConfig, raw: Box<dyn RawDecoder>) -> Self {
        Self { codec, config, raw }
    }

    /// Library codec name.
    pub fn codec_name(&self) -> &str {
        &self.codec
    }

    /// Negotiated sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Negotiated channel count.
    pub fn channels(&self) -> usize {
        self.config.channels
    }

    /// Format the library was asked to produce.
    pub fn sample_format(&self) -> SampleFormat {
        self.config.sample_format
    }

    /// Packet-loss concealment is not provided by any library.
    pub fn has_decode_plc(&self) -> bool {
        false
    }

    /// Decode one packet to interleaved i16.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let frame = self.raw.decode(packet)?;
        let pcm = normalize_to_s16(&frame)?;
        trace!(codec = %self.codec, bytes = packet.len(), samples = pcm.len(), "packet decoded");
        Ok(pcm)
    }

    /// Drop decoder state between streams.
    pub fn reset(&mut self) {
        self.raw.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planar_floats_are_interleaved_scaled_and_clamped() {
        let left = [0.0f32, 0.5, 1.0, 2.0];
        let right = [-0.5f32, -1.0, -3.0, 0.25];
        let data: Vec<f32> = left.iter().chain(right.iter()).copied().collect();
        let frame = DecodedFrame::planar(2, SampleBuffer::F32(data));
        assert_eq!(frame.format(), SampleFormat::F32P);

        let pcm = normalize_to_s16(&frame).expect("normalize");
        assert_eq!(
            pcm,
            vec![0, -16383, 16383, -32767, 32767, -32767, 32767, 8191]
        );
    }

    #[test]
    fn wide_integers_shift_down_by_sixteen_bits() {
        let frame = DecodedFrame::interleaved(
            1,
            SampleBuffer::S32(vec![i32::MAX, i32::MIN, 0x0001_0000, -0x0001_0000]),
        );
        assert_eq!(
            normalize_to_s16(&frame).expect("normalize"),
            vec![i16::MAX, i16::MIN, 1, -1]
        );
    }

    #[test]
    fn doubles_follow_the_same_scale() {
        let frame = DecodedFrame::planar(1, SampleBuffer::F64(vec![-1.5, 0.1]));
        assert_eq!(normalize_to_s16(&frame).expect("normalize"), vec![-32767, 3276]);
    }

    #[test]
    fn ragged_frames_are_rejected() {
        let frame = DecodedFrame::interleaved(2, SampleBuffer::S16(vec![1, 2, 3]));
        assert!(normalize_to_s16(&frame).is_err());
    }
}
