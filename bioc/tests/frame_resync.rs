//! Frame recovery over noisy, fragmented byte streams.
//!
//! Garbage scenarios end with a run of non-head bytes: a stray head byte in
//! the noise may claim a payload long enough to swallow the real frame, and
//! is only rejected once that many bytes have arrived.

use std::sync::Once;

use proptest::prelude::*;

use bioc::frame::{pack, Frame, FrameContext, FrameLayout};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        bioc::init_tracing();
    });
}

const UART: FrameLayout = FrameLayout::UART;

fn flush() -> Vec<u8> {
    vec![0x00; UART.max_frame()]
}

fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=UART.max_payload)
}

fn frame() -> impl Strategy<Value = (u32, Vec<u8>)> {
    (any::<u16>().prop_map(u32::from), payload())
}

/// Feeds `stream` split at `cuts` and returns every dispatched frame.
fn run(stream: &[u8], cuts: &[usize]) -> (Vec<(u32, Vec<u8>)>, usize, FrameContext) {
    let mut ctx = FrameContext::uart();
    let mut seen = Vec::new();
    let mut sink = |f: Frame<'_>| seen.push((f.opcode, f.payload.to_vec()));
    let mut discarded = 0;
    let mut from = 0;
    for &cut in cuts.iter().chain(std::iter::once(&stream.len())) {
        let cut = cut.clamp(from, stream.len());
        discarded += ctx.feed(&stream[from..cut], &mut sink).discarded;
        from = cut;
    }
    (seen, discarded, ctx)
}

#[test]
fn state_report_in_three_chunks() {
    init_test_tracing();
    let mut ctx = FrameContext::uart();
    let mut seen = Vec::new();
    let mut sink = |f: Frame<'_>| seen.push((f.opcode, f.payload.to_vec()));

    assert_eq!(ctx.feed(&[0x64, 0x04], &mut sink).frames, 0);
    assert_eq!(ctx.feed(&[0xA1, 0x00, 0x04, 0x00], &mut sink).frames, 0);
    let report = ctx.feed(&[0x01, 0x02, 0x03, 0x9A, 0xCA, 0xEE], &mut sink);

    assert_eq!(report.frames, 1);
    assert_eq!(report.discarded, 0);
    assert!(ctx.buffered().is_empty());
    assert_eq!(seen, vec![(0x04A1, vec![0x00, 0x01, 0x02, 0x03])]);
}

#[test]
fn empty_payload_frame_decodes() {
    let (seen, discarded, _) = run(&[0x64, 0x04, 0xA0, 0x00, 0x00, 0xDA, 0x70, 0xEE], &[]);
    assert_eq!(seen, vec![(0x04A0, vec![])]);
    assert_eq!(discarded, 0);
}

proptest! {
    #[test]
    fn back_to_back_frames_survive_any_split(
        frames in prop::collection::vec(frame(), 1..6),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        init_test_tracing();
        let mut stream = Vec::new();
        for (opcode, payload) in &frames {
            stream.extend(pack(&UART, *opcode, payload).unwrap());
        }
        let mut cuts: Vec<usize> = cuts.iter().map(|i| i.index(stream.len() + 1)).collect();
        cuts.sort_unstable();

        let (seen, discarded, ctx) = run(&stream, &cuts);
        prop_assert_eq!(seen, frames);
        prop_assert_eq!(discarded, 0);
        prop_assert!(ctx.buffered().is_empty());
    }

    #[test]
    fn garbage_before_a_frame_is_skipped(
        garbage in prop::collection::vec(any::<u8>(), 0..300),
        (opcode, body) in frame(),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
    ) {
        init_test_tracing();
        let frame = pack(&UART, opcode, &body).unwrap();
        let mut stream = garbage.clone();
        stream.extend_from_slice(&frame);
        stream.extend(flush());
        let mut cuts: Vec<usize> = cuts.iter().map(|i| i.index(stream.len() + 1)).collect();
        cuts.sort_unstable();

        let (seen, discarded, ctx) = run(&stream, &cuts);
        prop_assert_eq!(seen, vec![(opcode, body)]);
        prop_assert_eq!(discarded + frame.len() + ctx.buffered().len(), stream.len());
    }

    #[test]
    fn corrupted_crc_costs_only_that_frame(
        first in frame(),
        second in frame(),
        flip in 1u8..=255,
        low_byte in any::<bool>(),
    ) {
        init_test_tracing();
        let mut bad = pack(&UART, first.0, &first.1).unwrap();
        let at = bad.len() - if low_byte { 2 } else { 3 };
        bad[at] ^= flip;
        let good = pack(&UART, second.0, &second.1).unwrap();

        let mut stream = bad;
        stream.extend_from_slice(&good);
        stream.extend(flush());

        let (seen, _, _) = run(&stream, &[]);
        prop_assert_eq!(seen, vec![second]);
    }
}

#[test]
fn noise_without_heads_keeps_only_a_partial_head_window() {
    let noise: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).filter(|&b| b != UART.head).collect();
    let (seen, discarded, ctx) = run(&noise, &[10, 400, 401]);
    assert!(seen.is_empty());
    assert!(ctx.buffered().len() < UART.min_frame());
    assert_eq!(discarded + ctx.buffered().len(), noise.len());
}
