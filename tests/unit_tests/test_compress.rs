// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use adler2::Adler32;
use anyconnect_client_rs::client::compress::{CompressViolation, CompressionPipeline};

#[test]
fn test_deflate_inflate_roundtrip() {
    let mut tx = CompressionPipeline::new();
    let mut rx = CompressionPipeline::new();

    let packets: Vec<Vec<u8>> = vec![
        b"GET / HTTP/1.1\r\nHost: inside.example\r\n\r\n".to_vec(),
        vec![0u8; 1400],
        (0..=255u8).cycle().take(1000).collect(),
        b"x".to_vec(),
    ];

    for packet in &packets {
        let frame = tx.deflate_pkt(packet).expect("deflate");
        let back = rx.inflate_pkt(&frame).expect("inflate");
        assert_eq!(&back, packet);
    }
}

#[test]
fn test_rolling_adler_covers_whole_direction() {
    let mut tx = CompressionPipeline::new();

    let first = b"first packet";
    let second = b"second packet";

    let _ = tx.deflate_pkt(first).expect("deflate");
    let _ = tx.deflate_pkt(second).expect("deflate");

    // The transmitted checksum is over every uncompressed byte so far, not
    // just the last packet.
    let mut reference = Adler32::new();
    reference.write_slice(first);
    reference.write_slice(second);
    assert_eq!(tx.tx_adler32(), reference.checksum());
}

#[test]
fn test_trailer_is_cumulative_checksum() {
    let mut tx = CompressionPipeline::new();

    let _ = tx.deflate_pkt(b"packet one").expect("deflate");
    let frame = tx.deflate_pkt(b"packet two").expect("deflate");

    let trailer = &frame[frame.len() - 4..];
    assert_eq!(trailer, tx.tx_adler32().to_be_bytes());
}

#[test]
fn test_checksum_mismatch_is_fatal() {
    let mut tx = CompressionPipeline::new();
    let mut rx = CompressionPipeline::new();

    let mut frame = tx.deflate_pkt(b"some payload").expect("deflate");
    let last = frame.len() - 1;
    frame[last] ^= 0xFF;

    let err = rx.inflate_pkt(&frame).expect_err("corrupt trailer must fail");
    match err.downcast_ref::<CompressViolation>() {
        Some(CompressViolation::ChecksumMismatch { .. }) => {},
        other => panic!("expected ChecksumMismatch, got {other:?}"),
    }
}

#[test]
fn test_truncated_frame_is_fatal() {
    let mut rx = CompressionPipeline::new();
    let err = rx.inflate_pkt(&[0x01, 0x02]).expect_err("too short");
    match err.downcast_ref::<CompressViolation>() {
        Some(CompressViolation::TruncatedTrailer(2)) => {},
        other => panic!("expected TruncatedTrailer, got {other:?}"),
    }
}

#[test]
fn test_streams_share_history_across_packets() {
    // The second occurrence of the same payload should compress far better
    // than the first because the stream dictionary persists.
    let mut tx = CompressionPipeline::new();
    let payload = vec![0x5A; 512];

    let first = tx.deflate_pkt(&payload).expect("deflate");
    let second = tx.deflate_pkt(&payload).expect("deflate");
    assert!(second.len() <= first.len());

    // And a fresh receiver that missed the first frame cannot decode the
    // second one consistently: its checksum will not match.
    let mut rx = CompressionPipeline::new();
    assert!(rx.inflate_pkt(&second).is_err());
}
