use std::sync::Arc;
use std::time::Duration;

use dasp_signal::{self as signal, Signal};
use parking_lot::Mutex;

use crate::audio_source::{AudioTrackSink, CustomAudioSource};
use crate::clock::{ManualMonotonic, SyncClock};
use crate::codec::{AudioCodecFactory, SdpAudioFormat};
use crate::config::CodecDefaults;
use crate::mirror::{
    AUDIO_SOURCE, AUDIO_TRACK_SINK, DynamicObject, LocalRuntime, ManagedRuntime, ManagedValue,
};
use crate::transport::{
    AudioTransport, AudioTransportBridge, AudioTransportSource, ManagedAudioTrackSink,
    PlayoutRequest,
};

const RATE: u32 = 48_000;
const BLOCK: usize = 480;

fn tone(frames: usize) -> Vec<i16> {
    signal::rate(RATE as f64)
        .const_hz(1_000.0)
        .sine()
        .take(frames)
        .map(|s| (s * 0.5 * i16::MAX as f64) as i16)
        .collect()
}

fn le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[test]
fn pushed_tone_survives_capture_encode_decode_and_playout() {
    let runtime: Arc<dyn ManagedRuntime> = Arc::new(LocalRuntime::new());
    let time = Arc::new(ManualMonotonic::new(0));
    let clock = Arc::new(SyncClock::with_source(time.clone()));

    // Managed track sink collecting every pushed block.
    let captured: Arc<Mutex<Vec<(Vec<u8>, i32)>>> = Arc::default();
    let collected = captured.clone();
    let track_sink = DynamicObject::builder("test.TrackSink")
        .implement(&AUDIO_TRACK_SINK, move |_, args| {
            if let (ManagedValue::Bytes(data), ManagedValue::Int(frames)) = (&args[0], &args[4]) {
                collected.lock().push((data.to_vec(), *frames));
            }
            Ok(ManagedValue::Void)
        })
        .build();
    let sink: Arc<dyn AudioTrackSink> =
        Arc::new(ManagedAudioTrackSink::new(runtime.clone(), track_sink).expect("track sink"));

    let source = CustomAudioSource::new(clock.clone());
    source.add_sink(sink);

    let pcm = tone(BLOCK * 4);
    for block in pcm.chunks(BLOCK) {
        time.advance(Duration::from_millis(10));
        source
            .push_audio(&le_bytes(block), 16, RATE, 1, BLOCK)
            .expect("push");
    }
    let captured = captured.lock().clone();
    assert_eq!(captured.len(), 4);
    assert!(captured.iter().all(|(_, frames)| *frames == BLOCK as i32));

    // L16 at 20 ms per packet: one packet per two pushed blocks.
    let factory = AudioCodecFactory::new(CodecDefaults::default());
    let format = SdpAudioFormat::new("L16", RATE, 1).with_param("rate", RATE);
    let mut encoder = factory.create_encoder(&format, 96).expect("encoder");
    let mut decoder = factory.create_decoder(&format).expect("decoder");
    assert_eq!(encoder.num_10ms_frames_in_next_packet(), 2);

    let mut decoded = Vec::new();
    for (i, (bytes, _)) in captured.iter().enumerate() {
        let info = encoder
            .encode((i * BLOCK) as u32, &from_le_bytes(bytes))
            .expect("encode");
        if info.encoded_bytes > 0 {
            assert_eq!(info.payload_type, 96);
            assert_eq!(info.encoded_timestamp, ((i - 1) * BLOCK) as u32);
            decoded.extend(decoder.decode(&info.payload).expect("decode"));
        }
    }
    assert_eq!(decoded, pcm);

    // Managed playout source that only fills half of each request.
    let playout = le_bytes(&decoded);
    let audio_source = DynamicObject::builder("test.PlayoutSource")
        .implement(&AUDIO_SOURCE, move |_, args| {
            let (ManagedValue::Bytes(buffer), Some(samples)) = (&args[0], args[1].as_int()) else {
                return Ok(ManagedValue::Int(0));
            };
            let half = samples as usize / 2;
            buffer.write(&playout[..half * 2]);
            Ok(ManagedValue::Int(half as i32))
        })
        .build();
    let transport = AudioTransportSource::new(runtime, audio_source)
        .expect("transport source")
        .with_clock(clock);

    let bridge = AudioTransportBridge::new();
    bridge.set_source(Some(Arc::new(transport)));

    let request = PlayoutRequest {
        n_samples: BLOCK,
        bytes_per_sample: 2,
        channels: 1,
        sample_rate: RATE,
    };
    let mut out = vec![0xAAu8; request.byte_len()];
    let result = bridge.need_more_play_data(&request, &mut out).expect("playout");
    assert_eq!(result.samples_out, BLOCK);
    assert_eq!(result.provided, BLOCK / 2);
    assert_eq!(result.elapsed_time_ms, 40);
    assert_eq!(from_le_bytes(&out[..BLOCK]), pcm[..BLOCK / 2]);
    assert!(out[BLOCK..].iter().all(|&b| b == 0));
}
