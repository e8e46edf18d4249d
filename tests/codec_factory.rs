use std::sync::Arc;

use media_bridge::codec::library::{RawDecoder, RawEncoder};
use media_bridge::codec::{
    AudioCodecFactory, CodecConfig, CodecInfo, CodecLibrary, DecodedFrame, SampleBuffer,
    SampleFormat, SdpAudioFormat,
};
use media_bridge::{BridgeError, CodecDefaults, Result};

/// Decode-only stand-in producing planar float frames, like a Vorbis decoder would.
struct PlanarFloatLibrary;

struct PlanarDecoder {
    channels: usize,
}

impl RawDecoder for PlanarDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<DecodedFrame> {
        // One byte per sample per channel, channel-major, mapped to [-1, 1).
        let samples = packet.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect();
        Ok(DecodedFrame::planar(self.channels, SampleBuffer::F32(samples)))
    }
}

impl CodecLibrary for PlanarFloatLibrary {
    fn name(&self) -> &'static str {
        "planar-float"
    }

    fn codecs(&self) -> Vec<CodecInfo> {
        vec![CodecInfo {
            name: "libvorbis",
            sample_rates: vec![44_100, 22_050],
            channel_layouts: vec![1, 2],
            sample_formats: vec![SampleFormat::F32P],
            encodes: false,
            decodes: true,
        }]
    }

    fn open_decoder(&self, _: &str, config: &CodecConfig) -> Result<Box<dyn RawDecoder>> {
        Ok(Box::new(PlanarDecoder {
            channels: config.channels,
        }))
    }

    fn open_encoder(&self, codec: &str, _: &CodecConfig) -> Result<Box<dyn RawEncoder>> {
        Err(BridgeError::UnsupportedCodec(codec.to_string()))
    }
}

fn factory() -> AudioCodecFactory {
    AudioCodecFactory::with_libraries(
        vec![Arc::new(PlanarFloatLibrary)],
        CodecDefaults::default(),
    )
}

#[test]
fn decoder_runs_at_the_closest_advertised_shape() {
    let format = SdpAudioFormat::new("VORBIS", 48_000, 2).with_param("rate", 32_000);
    let mut decoder = factory().create_decoder(&format).expect("decoder");
    assert_eq!(decoder.codec_name(), "libvorbis");
    assert_eq!(decoder.sample_rate(), 22_050);
    assert_eq!(decoder.channels(), 2);
    assert_eq!(decoder.sample_format(), SampleFormat::F32P);
    assert!(!decoder.has_decode_plc());

    // Left 0, +0.5 ; right -1, +0.5 -> interleaved L R L R.
    let pcm = decoder.decode(&[128, 192, 0, 192]).expect("decode");
    assert_eq!(pcm, vec![0, -32767, 16383, 16383]);
}

#[test]
fn decode_only_codecs_have_no_encoder() {
    let format = SdpAudioFormat::new("vorbis", 44_100, 1);
    let factory = factory();
    assert!(factory.is_supported(&format));
    assert!(factory.query_encoder(&format).is_none());
    assert!(factory.create_encoder(&format, 100).is_none());
}

#[test]
fn allowlist_treats_vorbis_names_alike() {
    let allowed = factory().restrict_to(["vorbis"]);
    let listed = allowed.list_supported_codecs();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].format.name, "LIBVORBIS");
    assert_eq!(listed[0].info.sample_rate, 44_100);
    assert_eq!(listed[0].info.num_channels, 2);

    let none = factory().restrict_to(["opus"]);
    assert!(none.list_supported_codecs().is_empty());
}

#[test]
fn built_in_pcm_is_always_available() {
    let factory = AudioCodecFactory::new(CodecDefaults {
        frame_size_ms: 10,
        ..CodecDefaults::default()
    });
    let names: Vec<_> = factory
        .list_supported_codecs()
        .into_iter()
        .map(|codec| codec.format.name)
        .collect();
    for pcm in ["PCM_S16LE", "PCM_S16BE", "PCM_F32LE"] {
        assert!(names.iter().any(|n| n == pcm), "{pcm} missing from {names:?}");
    }

    let format = SdpAudioFormat::new("pcm_f32le", 8_000, 1).with_param("rate", 8_000);
    let mut encoder = factory.create_encoder(&format, 0).expect("encoder");
    let packet = encoder.encode(0, &[i16::MAX; 80]).expect("encode");
    assert_eq!(packet.encoded_bytes, 80 * 4);
    assert_eq!(encoder.target_bitrate(), 64_000);
}
