// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Stateful deflate pipeline for CSTP data payloads.
//!
//! Both directions keep their stream open for the whole session: each
//! compressed frame references the dictionary built up by every frame
//! before it, which is why a payload can never silently bypass the stream
//! once deflate has been negotiated. Each direction also carries a rolling
//! Adler-32 over the *uncompressed* byte stream; the transmitter appends
//! its current value to every compressed frame and the receiver verifies
//! it. A mismatch means the streams have diverged and the session cannot
//! continue.

use adler2::Adler32;
use anyhow::{Context, Result, bail};
use flate2::{
    Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status,
};
use thiserror::Error;

/// Largest payload a CSTP frame can carry; inflate output beyond this is a
/// corrupt or hostile stream.
const INFLATE_CAP: usize = u16::MAX as usize;

/// Fatal pipeline failures; either one ends the session.
#[derive(Debug, Error)]
pub enum CompressViolation {
    #[error("compressed packet Adler-32 mismatch: got {got:#010x}, expected {expected:#010x}")]
    ChecksumMismatch { got: u32, expected: u32 },
    #[error("compressed packet shorter than its checksum trailer ({0} bytes)")]
    TruncatedTrailer(usize),
    #[error("inflated payload exceeds {INFLATE_CAP} bytes")]
    Oversized,
}

pub struct CompressionPipeline {
    deflate: Compress,
    deflate_adler: Adler32,
    inflate: Decompress,
    inflate_adler: Adler32,
}

impl std::fmt::Debug for CompressionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionPipeline")
            .field("deflate_adler", &self.deflate_adler.checksum())
            .field("inflate_adler", &self.inflate_adler.checksum())
            .finish()
    }
}

impl CompressionPipeline {
    /// Raw deflate streams, no zlib wrapper; the checksum travels in the
    /// frame trailer instead.
    pub fn new() -> Self {
        Self {
            deflate: Compress::new(Compression::default(), false),
            deflate_adler: Adler32::new(),
            inflate: Decompress::new(false),
            inflate_adler: Adler32::new(),
        }
    }

    /// Compresses one egress payload, returning the COMPRESSED frame body:
    /// sync-flushed deflate output followed by the 4-byte big-endian rolling
    /// Adler-32 of every byte compressed so far in this direction.
    pub fn deflate_pkt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 64);
        let start_in = self.deflate.total_in();

        loop {
            let consumed = (self.deflate.total_in() - start_in) as usize;
            let status = self
                .deflate
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .context("deflate stream error")?;
            let consumed = (self.deflate.total_in() - start_in) as usize;

            match status {
                // A sync flush is complete once all input is consumed and
                // the output buffer still has room.
                Status::Ok | Status::BufError
                    if consumed == data.len() && out.len() < out.capacity() =>
                {
                    break;
                },
                Status::Ok | Status::BufError => out.reserve(256),
                Status::StreamEnd => break,
            }
        }

        self.deflate_adler.write_slice(data);
        out.extend_from_slice(&self.deflate_adler.checksum().to_be_bytes());
        Ok(out)
    }

    /// Current egress checksum, as appended to the last compressed frame.
    pub fn tx_adler32(&self) -> u32 {
        self.deflate_adler.checksum()
    }

    /// Inflates one COMPRESSED frame body and verifies its trailer against
    /// the rolling ingress checksum. Any error here is fatal to the session.
    pub fn inflate_pkt(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < 4 {
            bail!(CompressViolation::TruncatedTrailer(payload.len()));
        }
        let (body, trailer) = payload.split_at(payload.len() - 4);
        let got = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);

        let mut out = Vec::with_capacity(body.len() * 4 + 64);
        let start_in = self.inflate.total_in();

        loop {
            let consumed = (self.inflate.total_in() - start_in) as usize;
            let status = self
                .inflate
                .decompress_vec(&body[consumed..], &mut out, FlushDecompress::Sync)
                .context("inflate stream error")?;
            let consumed = (self.inflate.total_in() - start_in) as usize;

            match status {
                Status::Ok | Status::BufError
                    if consumed == body.len() && out.len() < out.capacity() =>
                {
                    break;
                },
                Status::Ok | Status::BufError => {
                    if out.len() >= INFLATE_CAP {
                        bail!(CompressViolation::Oversized);
                    }
                    out.reserve(1024);
                },
                Status::StreamEnd => break,
            }
        }

        self.inflate_adler.write_slice(&out);
        let expected = self.inflate_adler.checksum();
        if got != expected {
            bail!(CompressViolation::ChecksumMismatch { got, expected });
        }
        Ok(out)
    }
}

impl Default for CompressionPipeline {
    fn default() -> Self {
        Self::new()
    }
}
