//! libopus through the `opus` crate.

use ::opus::{Application, Bitrate, Channels};
use tracing::warn;

use super::decoder::{DecodedFrame, SampleBuffer};
use super::library::{CodecConfig, CodecInfo, CodecLibrary, RawDecoder, RawEncoder, SampleFormat};
use crate::error::{BridgeError, Result};

/// Library name of the Opus codec.
pub const CODEC_NAME: &str = "libopus";

const SAMPLE_RATES: [u32; 5] = [48_000, 24_000, 16_000, 12_000, 8_000];
const FRAME_DURATIONS_MS: [u32; 4] = [10, 20, 40, 60];
/// 120 ms at 48 kHz, the longest packet libopus can return.
const MAX_SAMPLES_PER_CHANNEL: usize = 5_760;
const MAX_PACKET_BYTES: usize = 4_000;

fn opus_error(api: &'static str, err: ::opus::Error) -> BridgeError {
    BridgeError::platform(api, err.to_string())
}

fn channels(config: &CodecConfig) -> Result<Channels> {
    match config.channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        n => Err(BridgeError::UnsupportedFormat(format!("opus with {n} channels"))),
    }
}

fn check_codec(codec: &str) -> Result<()> {
    if codec == CODEC_NAME {
        Ok(())
    } else {
        Err(BridgeError::UnsupportedCodec(codec.to_string()))
    }
}

/// libopus codec library.
#[derive(Debug, Default)]
pub struct OpusLibrary;

impl OpusLibrary {
    /// The Opus library.
    pub fn new() -> Self {
        Self
    }
}

struct OpusDecoder {
    inner: ::opus::Decoder,
    channels: usize,
    scratch: Vec<i16>,
}

impl RawDecoder for OpusDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<DecodedFrame> {
        let per_channel = self
            .inner
            .decode(packet, &mut self.scratch, false)
            .map_err(|err| opus_error("opus_decode", err))?;
        let samples = self.scratch[..per_channel * self.channels].to_vec();
        Ok(DecodedFrame::interleaved(self.channels, SampleBuffer::S16(samples)))
    }

    fn reset(&mut self) {
        if let Err(err) = self.inner.reset_state() {
            warn!(%err, "opus decoder reset failed");
        }
    }
}

struct OpusEncoder {
    inner: ::opus::Encoder,
}

impl RawEncoder for OpusEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let mut packet = vec![0u8; MAX_PACKET_BYTES];
        let len = self
            .inner
            .encode(pcm, &mut packet)
            .map_err(|err| opus_error("opus_encode", err))?;
        packet.truncate(len);
        Ok(packet)
    }

    fn reset(&mut self) {
        if let Err(err) = self.inner.reset_state() {
            warn!(%err, "opus encoder reset failed");
        }
    }
}

impl CodecLibrary for OpusLibrary {
    fn name(&self) -> &'static str {
        "opus"
    }

    fn codecs(&self) -> Vec<CodecInfo> {
        vec![CodecInfo {
            name: CODEC_NAME,
            sample_rates: SAMPLE_RATES.to_vec(),
            channel_layouts: vec![1, 2],
            sample_formats: vec![SampleFormat::S16, SampleFormat::F32],
            encodes: true,
            decodes: true,
        }]
    }

    fn open_decoder(&self, codec: &str, config: &CodecConfig) -> Result<Box<dyn RawDecoder>> {
        check_codec(codec)?;
        let inner = ::opus::Decoder::new(config.sample_rate, channels(config)?)
            .map_err(|err| opus_error("opus_decoder_create", err))?;
        Ok(Box::new(OpusDecoder {
            inner,
            channels: config.channels,
            scratch: vec![0; MAX_SAMPLES_PER_CHANNEL * config.channels],
        }))
    }

    fn open_encoder(&self, codec: &str, config: &CodecConfig) -> Result<Box<dyn RawEncoder>> {
        check_codec(codec)?;
        if !FRAME_DURATIONS_MS.contains(&config.frame_size_ms) {
            return Err(BridgeError::UnsupportedFormat(format!(
                "opus frame of {} ms",
                config.frame_size_ms
            )));
        }
        let mut inner = ::opus::Encoder::new(config.sample_rate, channels(config)?, Application::Voip)
            .map_err(|err| opus_error("opus_encoder_create", err))?;
        inner
            .set_bitrate(Bitrate::Bits(config.bitrate_bps as i32))
            .map_err(|err| opus_error("opus_encoder_ctl", err))?;
        Ok(Box::new(OpusEncoder { inner }))
    }
}
