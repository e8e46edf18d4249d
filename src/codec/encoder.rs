//! Encoder adapter that frames 10 ms PCM blocks into packets.

use tracing::{debug, trace};

use super::library::{CodecConfig, RawEncoder};
use crate::error::{BridgeError, Result};

/// Outcome of one [`AudioEncoder::encode`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedInfo {
    /// Bytes in `payload`; zero while a packet is still filling.
    pub encoded_bytes: usize,
    /// RTP timestamp of the first 10 ms block in the current packet.
    pub encoded_timestamp: u32,
    /// RTP payload type given at creation.
    pub payload_type: u8,
    /// Encoded packet.
    pub payload: Vec<u8>,
}

/// Encoder handed to the engine. Accepts 10 ms blocks and emits one packet per
/// configured frame duration.
pub struct AudioEncoder {
    codec: String,
    config: CodecConfig,
    payload_type: u8,
    raw: Box<dyn RawEncoder>,
    pending: Vec<i16>,
    blocks_buffered: usize,
    first_timestamp: u32,
}

impl AudioEncoder {
    pub(crate) fn new(
        codec: String,
        config: CodecConfig,
        payload_type: u8,
        raw: Box<dyn RawEncoder>,
    ) -> Self {
        let pending = Vec::with_capacity(config.samples_per_10ms() * Self::blocks_for(&config));
        Self {
            codec,
            config,
            payload_type,
            raw,
            pending,
            blocks_buffered: 0,
            first_timestamp: 0,
        }
    }

    fn blocks_for(config: &CodecConfig) -> usize {
        (config.frame_size_ms as usize / 10).max(1)
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

    /// Requested bitrate in bits per second.
    pub fn target_bitrate(&self) -> u32 {
        self.config.bitrate_bps
    }

    /// RTP payload type stamped on packets.
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// 10 ms blocks that make up the next packet.
    pub fn num_10ms_frames_in_next_packet(&self) -> usize {
        Self::blocks_for(&self.config)
    }

    /// 10 ms blocks in the longest packet.
    pub fn max_10ms_frames_in_packet(&self) -> usize {
        Self::blocks_for(&self.config)
    }

    /// Buffer one 10 ms block of interleaved PCM. Returns a packet once enough
    /// blocks have accumulated, otherwise an empty result stamped with the first
    /// buffered block's timestamp.
    pub fn encode(&mut self, rtp_timestamp: u32, audio: &[i16]) -> Result<EncodedInfo> {
        let block = self.config.samples_per_10ms();
        if audio.len() != block {
            return Err(BridgeError::invalid_argument(format!(
                "expected {block} samples per 10 ms block, got {}",
                audio.len()
            )));
        }
        if self.blocks_buffered == 0 {
            self.first_timestamp = rtp_timestamp;
        }
        self.pending.extend_from_slice(audio);
        self.blocks_buffered += 1;

        let mut info = EncodedInfo {
            encoded_bytes: 0,
            encoded_timestamp: self.first_timestamp,
            payload_type: self.payload_type,
            payload: Vec::new(),
        };
        if self.blocks_buffered < Self::blocks_for(&self.config) {
            trace!(codec = %self.codec, buffered = self.blocks_buffered, "block buffered");
            return Ok(info);
        }

        let encoded = self.raw.encode(&self.pending);
        self.pending.clear();
        self.blocks_buffered = 0;
        info.payload = encoded?;
        info.encoded_bytes = info.payload.len();
        debug!(
            codec = %self.codec,
            bytes = info.encoded_bytes,
            timestamp = info.encoded_timestamp,
            "packet encoded"
        );
        Ok(info)
    }

    /// Drop any partially accumulated packet.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.blocks_buffered = 0;
        self.raw.reset();
    }
}
