//! Contract of an external codec library plus the built-in PCM library.

use crate::error::{BridgeError, Result};

use super::decoder::{DecodedFrame, SampleBuffer};

/// Native sample representation a codec can produce or consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Interleaved signed 16-bit.
    S16,
    /// Planar signed 16-bit.
    S16P,
    /// Interleaved signed 32-bit.
    S32,
    /// Planar signed 32-bit.
    S32P,
    /// Interleaved 32-bit float.
    F32,
    /// Planar 32-bit float.
    F32P,
    /// Interleaved 64-bit float.
    F64,
    /// Planar 64-bit float.
    F64P,
}

impl SampleFormat {
    /// Whether channels are stored as separate planes.
    pub fn is_planar(self) -> bool {
        matches!(
            self,
            SampleFormat::S16P | SampleFormat::S32P | SampleFormat::F32P | SampleFormat::F64P
        )
    }

    /// Size of one sample in bytes.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16 | SampleFormat::S16P => 2,
            SampleFormat::S32 | SampleFormat::S32P | SampleFormat::F32 | SampleFormat::F32P => 4,
            SampleFormat::F64 | SampleFormat::F64P => 8,
        }
    }

    /// Preference used when opening a decoder: 16-bit int, 32-bit int, 32-bit float,
    /// 64-bit float, else whatever the codec lists first.
    pub fn preferred(advertised: &[SampleFormat]) -> SampleFormat {
        const TIERS: [[SampleFormat; 2]; 4] = [
            [SampleFormat::S16, SampleFormat::S16P],
            [SampleFormat::S32, SampleFormat::S32P],
            [SampleFormat::F32, SampleFormat::F32P],
            [SampleFormat::F64, SampleFormat::F64P],
        ];
        TIERS
            .iter()
            .find_map(|tier| advertised.iter().copied().find(|f| tier.contains(f)))
            .or_else(|| advertised.first().copied())
            .unwrap_or(SampleFormat::S16)
    }
}

/// What a library advertises for one codec. Empty lists mean "anything".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecInfo {
    /// Library codec name.
    pub name: &'static str,
    /// Supported sample rates, preferred first.
    pub sample_rates: Vec<u32>,
    /// Supported channel counts.
    pub channel_layouts: Vec<usize>,
    /// Formats the codec can produce.
    pub sample_formats: Vec<SampleFormat>,
    /// Whether an encoder is available.
    pub encodes: bool,
    /// Whether a decoder is available.
    pub decodes: bool,
}

/// Concrete parameters a codec instance is opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    /// Sample rate in Hertz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: usize,
    /// Target bitrate in bits per second.
    pub bitrate_bps: u32,
    /// Packet duration, a multiple of 10 ms.
    pub frame_size_ms: u32,
    /// Sample format requested from the decoder.
    pub sample_format: SampleFormat,
}

impl CodecConfig {
    /// Interleaved samples in one 10 ms block.
    pub fn samples_per_10ms(&self) -> usize {
        self.sample_rate as usize / 100 * self.channels
    }
}

/// Stateful decoder instance owned by the bridge.
pub trait RawDecoder: Send {
    /// Decode one packet.
    fn decode(&mut self, packet: &[u8]) -> Result<DecodedFrame>;
    /// Drop state between streams.
    fn reset(&mut self) {}
}

/// Stateful encoder instance. Receives one whole packet's worth of interleaved PCM.
pub trait RawEncoder: Send {
    /// Encode exactly one packet of PCM.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;
    /// Drop state between streams.
    fn reset(&mut self) {}
}

/// A codec library the factory can draw implementations from.
pub trait CodecLibrary: Send + Sync {
    /// Library name for logs.
    fn name(&self) -> &'static str;
    /// Codecs this library provides.
    fn codecs(&self) -> Vec<CodecInfo>;
    /// Open a decoder for `codec`.
    fn open_decoder(&self, codec: &str, config: &CodecConfig) -> Result<Box<dyn RawDecoder>>;
    /// Open an encoder for `codec`.
    fn open_encoder(&self, codec: &str, config: &CodecConfig) -> Result<Box<dyn RawEncoder>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PcmKind {
    S16Le,
    S16Be,
    F32Le,
}

impl PcmKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "pcm_s16le" => Some(PcmKind::S16Le),
            "pcm_s16be" => Some(PcmKind::S16Be),
            "pcm_f32le" => Some(PcmKind::F32Le),
            _ => None,
        }
    }

    fn width(self) -> usize {
        match self {
            PcmKind::S16Le | PcmKind::S16Be => 2,
            PcmKind::F32Le => 4,
        }
    }
}

/// Uncompressed PCM codecs, always available.
#[derive(Debug, Default)]
pub struct PcmLibrary;

impl PcmLibrary {
    /// The PCM library.
    pub fn new() -> Self {
        Self
    }
}

struct PcmCodec {
    kind: PcmKind,
    channels: usize,
}

impl RawDecoder for PcmCodec {
    fn decode(&mut self, packet: &[u8]) -> Result<DecodedFrame> {
        let width = self.kind.width();
        if packet.len() % (width * self.channels) != 0 {
            return Err(BridgeError::invalid_argument(format!(
                "{} byte packet is not a whole number of {}-channel samples",
                packet.len(),
                self.channels
            )));
        }
        let chunks = packet.chunks_exact(width);
        let data = match self.kind {
            PcmKind::S16Le => SampleBuffer::S16(chunks.map(|b| i16::from_le_bytes([b[0], b[1]])).collect()),
            PcmKind::S16Be => SampleBuffer::S16(chunks.map(|b| i16::from_be_bytes([b[0], b[1]])).collect()),
            PcmKind::F32Le => {
                SampleBuffer::F32(chunks.map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect())
            }
        };
        Ok(DecodedFrame::interleaved(self.channels, data))
    }
}

impl RawEncoder for PcmCodec {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(pcm.len() * self.kind.width());
        for &sample in pcm {
            match self.kind {
                PcmKind::S16Le => out.extend_from_slice(&sample.to_le_bytes()),
                PcmKind::S16Be => out.extend_from_slice(&sample.to_be_bytes()),
                PcmKind::F32Le => out.extend_from_slice(&(sample as f32 / 32768.0).to_le_bytes()),
            }
        }
        Ok(out)
    }
}

impl PcmLibrary {
    fn open(&self, codec: &str, config: &CodecConfig) -> Result<PcmCodec> {
        let kind = PcmKind::from_name(codec).ok_or_else(|| BridgeError::UnsupportedCodec(codec.to_string()))?;
        if config.channels == 0 {
            return Err(BridgeError::UnsupportedFormat(format!("{codec} with 0 channels")));
        }
        Ok(PcmCodec {
            kind,
            channels: config.channels,
        })
    }
}

impl CodecLibrary for PcmLibrary {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn codecs(&self) -> Vec<CodecInfo> {
        [
            ("pcm_s16le", SampleFormat::S16),
            ("pcm_s16be", SampleFormat::S16),
            ("pcm_f32le", SampleFormat::F32),
        ]
        .into_iter()
        .map(|(name, format)| CodecInfo {
            name,
            sample_rates: Vec::new(),
            channel_layouts: vec![1, 2],
            sample_formats: vec![format],
            encodes: true,
            decodes: true,
        })
        .collect()
    }

    fn open_decoder(&self, codec: &str, config: &CodecConfig) -> Result<Box<dyn RawDecoder>> {
        Ok(Box::new(self.open(codec, config)?))
    }

    fn open_encoder(&self, codec: &str, config: &CodecConfig) -> Result<Box<dyn RawEncoder>> {
        Ok(Box::new(self.open(codec, config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_format_preference_follows_tiers() {
        use SampleFormat::*;
        assert_eq!(SampleFormat::preferred(&[F32P, S16P, S32]), S16P);
        assert_eq!(SampleFormat::preferred(&[F64, F32P, S32P]), S32P);
        assert_eq!(SampleFormat::preferred(&[F64P, F32]), F32);
        assert_eq!(SampleFormat::preferred(&[F64P]), F64P);
        assert_eq!(SampleFormat::preferred(&[]), S16);
    }

    #[test]
    fn big_endian_pcm_round_trips_through_the_library() {
        let library = PcmLibrary::new();
        let config = CodecConfig {
            sample_rate: 8_000,
            channels: 1,
            bitrate_bps: 128_000,
            frame_size_ms: 10,
            sample_format: SampleFormat::S16,
        };
        let mut encoder = library.open_encoder("pcm_s16be", &config).expect("encoder");
        let mut decoder = library.open_decoder("pcm_s16be", &config).expect("decoder");
        let packet = encoder.encode(&[1, -2, 0x1234]).expect("encode");
        assert_eq!(packet, vec![0x00, 0x01, 0xff, 0xfe, 0x12, 0x34]);
        let frame = decoder.decode(&packet).expect("decode");
        assert_eq!(frame.data, SampleBuffer::S16(vec![1, -2, 0x1234]));
    }

    #[test]
    fn ragged_packets_are_rejected() {
        let library = PcmLibrary::new();
        let config = CodecConfig {
            sample_rate: 8_000,
            channels: 2,
            bitrate_bps: 256_000,
            frame_size_ms: 10,
            sample_format: SampleFormat::S16,
        };
        let mut decoder = library.open_decoder("pcm_s16le", &config).expect("decoder");
        assert!(decoder.decode(&[0; 6]).is_err());
        assert!(library.open_decoder("pcm_mulaw", &config).is_err());
    }
}
