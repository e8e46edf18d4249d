use media_bridge::video::{FourCC, I420Buffer, convert, required_buffer_size};
use proptest::prelude::*;

fn any_fourcc() -> impl Strategy<Value = FourCC> {
    prop::sample::select(FourCC::ALL.to_vec())
}

fn random_frame(width: usize, height: usize, seed: u8) -> I420Buffer {
    let mut frame = I420Buffer::new(width, height);
    frame.fill_with(|plane, x, y| {
        (x as u8)
            .wrapping_mul(31)
            .wrapping_add((y as u8).wrapping_mul(17))
            .wrapping_add(plane as u8 * 64)
            .wrapping_add(seed)
    });
    frame
}

proptest! {
    #[test]
    fn written_bytes_match_required_size(
        width in 1usize..40,
        height in 1usize..40,
        fourcc in any_fourcc(),
        seed in any::<u8>(),
    ) {
        let frame = random_frame(width, height, seed);
        let need = required_buffer_size(width, height, fourcc);
        let mut dst = vec![0u8; need + 7];
        let written = convert::i420_to_packed(&frame.planes(), &mut dst, width, height, fourcc)
            .expect("convert");
        prop_assert_eq!(written, need);
        prop_assert!(dst[need..].iter().all(|&b| b == 0));

        let mut short = vec![0xeeu8; need - 1];
        let refused = convert::i420_to_packed(&frame.planes(), &mut short, width, height, fourcc);
        prop_assert!(refused.is_err());
        prop_assert!(short.iter().all(|&b| b == 0xee));
    }

    #[test]
    fn yuv_layouts_round_trip_exactly(
        half_width in 1usize..20,
        height in 1usize..40,
        fourcc in any_fourcc().prop_filter("yuv only", |f| f.is_lossless_yuv()),
        seed in any::<u8>(),
    ) {
        let width = half_width * 2;
        let frame = random_frame(width, height, seed);
        let mut packed = vec![0u8; required_buffer_size(width, height, fourcc)];
        convert::i420_to_packed(&frame.planes(), &mut packed, width, height, fourcc)
            .expect("pack");

        let mut back = I420Buffer::new(width, height);
        convert::packed_to_i420(&packed, width, height, fourcc, &mut back.planes_mut())
            .expect("unpack");
        prop_assert_eq!(&back, &frame);
    }
}

#[test]
fn short_source_leaves_planes_untouched() {
    let (width, height) = (6, 4);
    let packed = vec![0u8; required_buffer_size(width, height, FourCC::NV12) - 1];
    let mut planes = I420Buffer::new(width, height);
    planes.fill_with(|_, _, _| 9);
    let before = planes.clone();
    assert!(
        convert::packed_to_i420(&packed, width, height, FourCC::NV12, &mut planes.planes_mut())
            .is_err()
    );
    assert_eq!(planes, before);
}
