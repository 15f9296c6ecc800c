// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CSTP wire framing.
//!
//! Every CSTP record on the TLS stream is an 8-byte preamble followed by
//! `len` payload bytes:
//!
//! ```text
//!  0    1    2    3    4       5       6      7
//! +----+----+----+----+-------+-------+------+------+
//! | 'S'| 'T'| 'F'|0x01| len_hi| len_lo| type | 0x00 |
//! +----+----+----+----+-------+-------+------+------+
//! ```
//!
//! A preamble whose first four bytes differ from the signature means the
//! stream has lost sync, which is unrecoverable for the session.

use anyhow::anyhow;
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use zerocopy::{BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, U16};

use crate::models::packet::{Pkt, PktType, UnknownPktType};

pub const CSTP_HDR_LEN: usize = 8;
pub const CSTP_MAGIC: [u8; 4] = [b'S', b'T', b'F', 0x01];

/// Fatal framing violations. Any of these ends the session (§ error table:
/// protocol violation → disconnect).
#[derive(Debug, Error)]
pub enum FrameViolation {
    #[error("bad CSTP signature: {0:02x?}")]
    BadSignature([u8; 4]),
    #[error(transparent)]
    UnknownType(#[from] UnknownPktType),
    #[error("compressed packet on a session without deflate negotiation")]
    UnnegotiatedCompression,
}

/// Wire-safe CSTP preamble.
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CstpHdr {
    pub magic: [u8; 4],
    pub len: U16<BigEndian>,
    pub ptype: u8,
    reserved: u8,
}

impl CstpHdr {
    pub fn new(ptype: PktType, len: u16) -> Self {
        Self {
            magic: CSTP_MAGIC,
            len: U16::new(len),
            ptype: ptype as u8,
            reserved: 0,
        }
    }
}

/// Writes a preamble for `ptype`/`len` into an 8-byte header area.
pub fn fill_preamble(hdr: &mut [u8], ptype: PktType, len: u16) {
    debug_assert_eq!(hdr.len(), CSTP_HDR_LEN);
    hdr.copy_from_slice(CstpHdr::new(ptype, len).as_bytes());
}

/// Framing codec for the CSTP stream.
///
/// Decoding yields `(type, payload)` pairs; encoding consumes a [`Pkt`],
/// filling its reserved header area so preamble and payload leave in one
/// write. The codec never splits or reorders: backpressure is the underlying
/// stream's.
#[derive(Debug, Default)]
pub struct CstpCodec;

impl Decoder for CstpCodec {
    type Error = anyhow::Error;
    type Item = (PktType, BytesMut);

    fn decode(&mut self, src: &mut BytesMut) -> anyhow::Result<Option<Self::Item>> {
        if src.len() < CSTP_HDR_LEN {
            return Ok(None);
        }

        let (magic, len, raw_type) = {
            let hdr = CstpHdr::ref_from_bytes(&src[..CSTP_HDR_LEN])
                .map_err(|e| anyhow!("failed to view CSTP preamble: {e}"))?;
            (hdr.magic, hdr.len.get() as usize, hdr.ptype)
        };
        if magic != CSTP_MAGIC {
            return Err(FrameViolation::BadSignature(magic).into());
        }

        if src.len() < CSTP_HDR_LEN + len {
            src.reserve(CSTP_HDR_LEN + len - src.len());
            return Ok(None);
        }

        let ptype =
            PktType::try_from(raw_type).map_err(FrameViolation::UnknownType)?;
        src.advance(CSTP_HDR_LEN);
        let payload = src.split_to(len);
        Ok(Some((ptype, payload)))
    }
}

impl Encoder<Pkt> for CstpCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, mut pkt: Pkt, dst: &mut BytesMut) -> anyhow::Result<()> {
        pkt.write_cstp_preamble();
        dst.extend_from_slice(pkt.cstp_frame());
        Ok(())
    }
}
