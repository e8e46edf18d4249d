//! Audio codec factory over pluggable codec libraries.
//!
//! Formats arrive as SDP-style descriptors (a name plus textual parameters). The factory
//! resolves the public name to a library codec, snaps the requested sample rate and
//! channel count to what the codec advertises, and hands out framed encoders and
//! normalizing decoders.

/// Decoder adapter normalizing library output.
pub mod decoder;
/// Encoder adapter framing 10 ms blocks into packets.
pub mod encoder;
/// Codec library contract and the built-in PCM library.
pub mod library;
/// Opus through libopus.
#[cfg(feature = "opus")]
pub mod opus;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, CodecDefaults};
use crate::error::{BridgeError, Result};

pub use decoder::{AudioDecoder, DecodedFrame, SampleBuffer, normalize_to_s16};
pub use encoder::{AudioEncoder, EncodedInfo};
pub use library::{CodecConfig, CodecInfo, CodecLibrary, PcmLibrary, SampleFormat};

/// Public codec format: name, RTP clock rate, channel count and SDP parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SdpAudioFormat {
    /// Format name as negotiated, e.g. `OPUS` or `L16`.
    pub name: String,
    /// RTP clock rate.
    pub clock_rate: u32,
    /// Channel count.
    pub num_channels: usize,
    /// SDP `fmtp` parameters.
    pub parameters: BTreeMap<String, String>,
}

impl SdpAudioFormat {
    /// Format without parameters.
    pub fn new(name: impl Into<String>, clock_rate: u32, num_channels: usize) -> Self {
        Self {
            name: name.into(),
            clock_rate,
            num_channels,
            parameters: BTreeMap::new(),
        }
    }

    /// Add or replace an SDP parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.parameters.insert(key.into(), value.to_string());
        self
    }
}

/// Requested parameters after applying defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecParams {
    /// Library codec name after synonym resolution.
    pub codec_name: String,
    /// Sample rate in Hertz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: usize,
    /// Bitrate in bits per second.
    pub bitrate_bps: u32,
    /// Packet duration in milliseconds.
    pub frame_size_ms: u32,
}

fn parse_param<T: std::str::FromStr>(format: &SdpAudioFormat, key: &str) -> Result<Option<T>> {
    format
        .parameters
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| BridgeError::invalid_argument(format!("{key}={raw}")))
        })
        .transpose()
}

impl CodecParams {
    /// Read `rate`, `channels`, `bitrate` and `frame_size_ms`, falling back to
    /// `defaults` and the format's own channel count.
    pub fn parse(format: &SdpAudioFormat, defaults: &CodecDefaults) -> Result<Self> {
        let params = Self {
            codec_name: resolve_codec_name(&format.name),
            sample_rate: parse_param(format, "rate")?.unwrap_or(defaults.sample_rate),
            channels: parse_param(format, "channels")?.unwrap_or(format.num_channels),
            bitrate_bps: parse_param(format, "bitrate")?.unwrap_or(defaults.bitrate_bps),
            frame_size_ms: parse_param(format, "frame_size_ms")?.unwrap_or(defaults.frame_size_ms),
        };
        if params.sample_rate == 0 || params.channels == 0 || params.bitrate_bps == 0 {
            return Err(BridgeError::UnsupportedFormat(format!("{params:?}")));
        }
        if params.frame_size_ms < 10 || params.frame_size_ms % 10 != 0 {
            return Err(BridgeError::UnsupportedFormat(format!(
                "frame size {} ms is not a whole number of 10 ms blocks",
                params.frame_size_ms
            )));
        }
        Ok(params)
    }
}

/// Map a public format name onto the library codec implementing it.
pub fn resolve_codec_name(name: &str) -> String {
    match name {
        "AAC" => "aac".into(),
        "MP3" => "mp3".into(),
        "OPUS" => "libopus".into(),
        "VORBIS" => "libvorbis".into(),
        "FLAC" => "flac".into(),
        "L16" => "pcm_s16be".into(),
        other => other.to_ascii_lowercase(),
    }
}

fn canonical(name: &str) -> &str {
    match name {
        "opus" => "libopus",
        "vorbis" => "libvorbis",
        other => other,
    }
}

fn same_codec(a: &str, b: &str) -> bool {
    canonical(a) == canonical(b)
}

/// Advertised value nearest to `wanted`; the first one wins a tie. An empty list
/// accepts anything.
pub fn closest<T>(wanted: T, advertised: &[T]) -> T
where
    T: Copy + Into<i64>,
{
    let target: i64 = wanted.into();
    advertised
        .iter()
        .copied()
        .min_by_key(|&candidate| {
            let candidate: i64 = candidate.into();
            (candidate - target).abs()
        })
        .unwrap_or(wanted)
}

fn closest_channels(wanted: usize, advertised: &[usize]) -> usize {
    advertised
        .iter()
        .copied()
        .min_by_key(|&candidate| candidate.abs_diff(wanted))
        .unwrap_or(wanted)
}

/// Summary reported for a negotiated codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioCodecInfo {
    /// Sample rate in Hertz.
    pub sample_rate: u32,
    /// Channel count.
    pub num_channels: usize,
    /// Bitrate in bits per second.
    pub bitrate_bps: u32,
}

/// A format the factory can serve, with what it would actually run at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioCodecSpec {
    /// Format to offer.
    pub format: SdpAudioFormat,
    /// Parameters an encoder would run at.
    pub info: AudioCodecInfo,
}

struct Negotiated {
    library: Arc<dyn CodecLibrary>,
    codec: CodecInfo,
    config: CodecConfig,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Decode,
    Encode,
}

/// Encoder and decoder factory shared with the engine.
pub struct AudioCodecFactory {
    libraries: Vec<Arc<dyn CodecLibrary>>,
    allowed: Option<Vec<String>>,
    defaults: CodecDefaults,
}

impl AudioCodecFactory {
    /// Factory over the built-in libraries: PCM always, libopus with the `opus` feature.
    pub fn new(defaults: CodecDefaults) -> Self {
        #[allow(unused_mut)]
        let mut libraries: Vec<Arc<dyn CodecLibrary>> = vec![Arc::new(PcmLibrary::new())];
        #[cfg(feature = "opus")]
        libraries.push(Arc::new(opus::OpusLibrary::new()));
        Self::with_libraries(libraries, defaults)
    }

    /// Factory over the built-in libraries using the configured codec fallbacks.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.codec_defaults)
    }

    /// Factory over caller supplied libraries.
    pub fn with_libraries(libraries: Vec<Arc<dyn CodecLibrary>>, defaults: CodecDefaults) -> Self {
        let factory = Self {
            libraries,
            allowed: None,
            defaults,
        };
        info!(
            libraries = factory.libraries.len(),
            codecs = factory.available().len(),
            "codec factory created"
        );
        factory
    }

    /// Only serve the named codecs. `opus`/`libopus` and `vorbis`/`libvorbis` are
    /// interchangeable here.
    pub fn restrict_to<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(names.into_iter().map(|n| n.into().to_ascii_lowercase()).collect());
        self
    }

    fn allows(&self, codec: &str) -> bool {
        self.allowed
            .as_ref()
            .is_none_or(|names| names.iter().any(|name| same_codec(name, codec)))
    }

    fn available(&self) -> Vec<(Arc<dyn CodecLibrary>, CodecInfo)> {
        self.libraries
            .iter()
            .flat_map(|library| library.codecs().into_iter().map(move |info| (library.clone(), info)))
            .filter(|(_, info)| self.allows(info.name))
            .collect()
    }

    fn negotiate(&self, format: &SdpAudioFormat, direction: Direction) -> Result<Negotiated> {
        let params = CodecParams::parse(format, &self.defaults)?;
        let (library, codec) = self
            .available()
            .into_iter()
            .filter(|(_, info)| match direction {
                Direction::Decode => info.decodes,
                Direction::Encode => info.encodes,
            })
            .find(|(_, info)| same_codec(info.name, &params.codec_name))
            .ok_or_else(|| BridgeError::UnsupportedCodec(params.codec_name.clone()))?;

        let config = CodecConfig {
            sample_rate: closest(params.sample_rate, &codec.sample_rates),
            channels: closest_channels(params.channels, &codec.channel_layouts),
            bitrate_bps: params.bitrate_bps,
            frame_size_ms: params.frame_size_ms,
            sample_format: SampleFormat::preferred(&codec.sample_formats),
        };
        if config.sample_rate != params.sample_rate || config.channels != params.channels {
            debug!(
                codec = codec.name,
                requested_rate = params.sample_rate,
                rate = config.sample_rate,
                requested_channels = params.channels,
                channels = config.channels,
                "snapped to closest supported parameters"
            );
        }
        Ok(Negotiated {
            library,
            codec,
            config,
        })
    }

    /// Every codec this factory can serve, at its first advertised rate and the
    /// channel layout closest to stereo.
    pub fn list_supported_codecs(&self) -> Vec<AudioCodecSpec> {
        self.available()
            .into_iter()
            .map(|(_, codec)| {
                let sample_rate = codec.sample_rates.first().copied().unwrap_or(self.defaults.sample_rate);
                let channels = closest_channels(2, &codec.channel_layouts);
                let format = SdpAudioFormat::new(codec.name.to_ascii_uppercase(), sample_rate, channels)
                    .with_param("rate", sample_rate)
                    .with_param("channels", channels);
                AudioCodecSpec {
                    format,
                    info: AudioCodecInfo {
                        sample_rate,
                        num_channels: channels,
                        bitrate_bps: self.defaults.bitrate_bps,
                    },
                }
            })
            .collect()
    }

    /// Whether a decoder can be created for `format`.
    pub fn is_supported(&self, format: &SdpAudioFormat) -> bool {
        self.negotiate(format, Direction::Decode).is_ok()
    }

    /// What an encoder for `format` would run at.
    pub fn query_encoder(&self, format: &SdpAudioFormat) -> Option<AudioCodecInfo> {
        self.negotiate(format, Direction::Encode).ok().map(|n| AudioCodecInfo {
            sample_rate: n.config.sample_rate,
            num_channels: n.config.channels,
            bitrate_bps: n.config.bitrate_bps,
        })
    }

    /// Decoder for `format`, or `None` when nothing can serve it.
    pub fn create_decoder(&self, format: &SdpAudioFormat) -> Option<AudioDecoder> {
        let opened = self.negotiate(format, Direction::Decode).and_then(|n| {
            let raw = n.library.open_decoder(n.codec.name, &n.config)?;
            Ok(AudioDecoder::new(n.codec.name.to_string(), n.config, raw))
        });
        match opened {
            Ok(decoder) => Some(decoder),
            Err(err) => {
                warn!(format = %format.name, %err, "no decoder");
                None
            }
        }
    }

    /// Encoder for `format` tagging its packets with `payload_type`, or `None`.
    pub fn create_encoder(&self, format: &SdpAudioFormat, payload_type: u8) -> Option<AudioEncoder> {
        let opened = self.negotiate(format, Direction::Encode).and_then(|n| {
            let raw = n.library.open_encoder(n.codec.name, &n.config)?;
            Ok(AudioEncoder::new(n.codec.name.to_string(), n.config, payload_type, raw))
        });
        match opened {
            Ok(encoder) => Some(encoder),
            Err(err) => {
                warn!(format = %format.name, %err, "no encoder");
                None
            }
        }
    }
}

impl Default for AudioCodecFactory {
    fn default() -> Self {
        Self::new(CodecDefaults::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_through_synonyms() {
        assert_eq!(resolve_codec_name("OPUS"), "libopus");
        assert_eq!(resolve_codec_name("L16"), "pcm_s16be");
        assert_eq!(resolve_codec_name("FLAC"), "flac");
        assert_eq!(resolve_codec_name("Pcm_S16LE"), "pcm_s16le");
        assert!(same_codec("opus", "libopus"));
        assert!(!same_codec("opus", "vorbis"));
    }

    #[test]
    fn closest_prefers_first_on_ties() {
        assert_eq!(closest(44_100u32, &[48_000, 32_000, 44_000]), 44_000);
        assert_eq!(closest(20u32, &[10, 30]), 10);
        assert_eq!(closest(20u32, &[30, 10]), 30);
        assert_eq!(closest(22_050u32, &[]), 22_050);
        assert_eq!(closest_channels(6, &[1, 2]), 2);
    }

    #[test]
    fn missing_parameters_take_defaults() {
        let format = SdpAudioFormat::new("L16", 8_000, 2);
        let params = CodecParams::parse(&format, &CodecDefaults::default()).expect("params");
        assert_eq!(
            params,
            CodecParams {
                codec_name: "pcm_s16be".into(),
                sample_rate: 48_000,
                channels: 2,
                bitrate_bps: 64_000,
                frame_size_ms: 20,
            }
        );
        let bad = format.clone().with_param("rate", "fast");
        assert!(CodecParams::parse(&bad, &CodecDefaults::default()).is_err());
        let odd = format.with_param("frame_size_ms", 25);
        assert!(CodecParams::parse(&odd, &CodecDefaults::default()).is_err());
    }

    #[test]
    fn unknown_and_disallowed_codecs_yield_none() {
        let factory = AudioCodecFactory::default();
        assert!(factory.create_decoder(&SdpAudioFormat::new("G729", 8_000, 1)).is_none());

        let restricted = AudioCodecFactory::default().restrict_to(["pcm_s16le"]);
        assert!(restricted.create_encoder(&SdpAudioFormat::new("L16", 48_000, 1), 96).is_none());
        assert!(restricted.is_supported(&SdpAudioFormat::new("PCM_S16LE", 48_000, 1)));
        assert_eq!(restricted.list_supported_codecs().len(), 1);
    }

    #[test]
    fn configured_fallbacks_reach_negotiation() {
        let mut config = BridgeConfig::default();
        config.codec_defaults.bitrate_bps = 32_000;
        config.codec_defaults.frame_size_ms = 40;
        let factory = AudioCodecFactory::from_config(&config);

        let format = SdpAudioFormat::new("L16", 16_000, 1).with_param("rate", 16_000);
        assert_eq!(factory.query_encoder(&format).map(|info| info.bitrate_bps), Some(32_000));
        assert!(factory.list_supported_codecs().iter().all(|codec| codec.info.bitrate_bps == 32_000));

        let mut encoder = factory.create_encoder(&format, 96).expect("encoder");
        let block = vec![0i16; 160];
        let partial: Vec<_> = (0..3)
            .map(|i| encoder.encode(i * 10, &block).expect("encode").encoded_bytes)
            .collect();
        assert_eq!(partial, vec![0, 0, 0], "a 40 ms packet needs four 10 ms blocks");
        assert!(encoder.encode(30, &block).expect("encode").encoded_bytes > 0);
    }

    #[test]
    fn channel_count_snaps_to_advertised_layouts() {
        let factory = AudioCodecFactory::default();
        let format = SdpAudioFormat::new("L16", 16_000, 6).with_param("rate", 16_000);
        let info = factory.query_encoder(&format).expect("info");
        assert_eq!(info.num_channels, 2);
        assert_eq!(info.sample_rate, 16_000);
    }
}
