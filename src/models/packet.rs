// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory representation of one tunnel packet.
//!
//! Both transports move the same unit of work around: a typed payload of at
//! most MTU bytes. The buffer reserves the 8-byte CSTP preamble in front of
//! the payload so a packet can be written to the TLS socket as a single
//! contiguous slice, without re-allocating at send time.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::models::frame::{CSTP_HDR_LEN, fill_preamble};

/// Packet types shared by the CSTP and DTLS framings.
///
/// The numbering is part of the wire protocol and identical on both
/// transports; CSTP carries the type in byte 6 of its preamble, DTLS as the
/// first byte of every datagram.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PktType {
    /// Uncompressed IP payload.
    #[default]
    Data = 0,
    /// Dead-peer-detection probe.
    DpdOut = 3,
    /// Response to a probe.
    DpdResp = 4,
    /// Client leaving; payload carries the reason string.
    Disconn = 5,
    /// Liveness nudge, discarded by the peer.
    Keepalive = 7,
    /// Deflate-compressed IP payload with a trailing Adler-32.
    Compressed = 8,
    /// Server-initiated termination.
    TermServer = 9,
}

impl PktType {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Data,
            3 => Self::DpdOut,
            4 => Self::DpdResp,
            5 => Self::Disconn,
            7 => Self::Keepalive,
            8 => Self::Compressed,
            9 => Self::TermServer,
            _ => return None,
        })
    }

    /// Control packets bypass the data queues and are never compressed.
    #[inline]
    pub fn is_control(self) -> bool {
        !matches!(self, Self::Data | Self::Compressed)
    }
}

/// Returned when a frame carries a type byte outside the protocol table.
#[derive(Debug, Error)]
#[error("unknown packet type: 0x{0:02x}")]
pub struct UnknownPktType(pub u8);

impl TryFrom<u8> for PktType {
    type Error = UnknownPktType;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_u8(byte).ok_or(UnknownPktType(byte))
    }
}

/// A single tunnel packet: type plus payload in one allocation.
///
/// The first [`CSTP_HDR_LEN`] bytes of the buffer are the reserved header
/// area; the payload follows. Packets are moved, never shared: an endpoint
/// produces one, a queue or channel owns it, and it is consumed on transmit
/// or on delivery to the tun device.
#[derive(Debug)]
pub struct Pkt {
    ptype: PktType,
    buf: BytesMut,
}

impl Pkt {
    /// Builds a packet from a type and payload, copying the payload once
    /// behind the reserved header area.
    pub fn new(ptype: PktType, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(CSTP_HDR_LEN + payload.len());
        buf.resize(CSTP_HDR_LEN, 0);
        buf.extend_from_slice(payload);
        Self { ptype, buf }
    }

    #[inline]
    pub fn ptype(&self) -> PktType {
        self.ptype
    }

    /// Payload length in bytes (the CSTP `len` field).
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len() - CSTP_HDR_LEN
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[CSTP_HDR_LEN..]
    }

    /// Writes the CSTP preamble into the reserved header area in place.
    pub fn write_cstp_preamble(&mut self) {
        let len = self.len();
        let ptype = self.ptype;
        fill_preamble(&mut self.buf[..CSTP_HDR_LEN], ptype, len as u16);
    }

    /// The full preamble + payload slice, valid after
    /// [`Pkt::write_cstp_preamble`].
    #[inline]
    pub fn cstp_frame(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the packet, returning the payload without the header area.
    pub fn into_payload(self) -> Bytes {
        let mut buf = self.buf;
        let _ = buf.split_to(CSTP_HDR_LEN);
        buf.freeze()
    }
}
