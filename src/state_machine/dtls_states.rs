// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! DTLS channel sub-state.
//!
//! ```text
//! Disabled ──────────────────────────────► (terminal)
//! Closed ──attempt due──► Handshaking ──ok──► Running
//!   ▲                          │                 │
//!   └──────failure/timeout─────┘   DPD dead / IO ┘
//! ```
//!
//! `Disabled` is entered when the gateway never negotiated DTLS or when the
//! attempt period is configured to 0; nothing leaves it.

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    /// DTLS was not negotiated or is configured off; never attempted.
    Disabled,
    /// No datagram transport; the next attempt is due at `retry_at`.
    Closed { retry_at: Instant },
    /// A handshake task is in flight since `started`.
    Handshaking { started: Instant },
    /// The datagram transport carries data traffic.
    Running,
}

impl DtlsState {
    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self, DtlsState::Running)
    }

    #[inline]
    pub fn is_handshaking(&self) -> bool {
        matches!(self, DtlsState::Handshaking { .. })
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        matches!(self, DtlsState::Disabled)
    }

    /// True when the channel is closed and its retry timer has expired.
    pub fn attempt_due(&self, now: Instant) -> bool {
        matches!(self, DtlsState::Closed { retry_at } if now >= *retry_at)
    }

    /// The next instant at which this state needs the engine to wake up.
    pub fn deadline(&self, attempt_period: std::time::Duration) -> Option<Instant> {
        match self {
            DtlsState::Disabled | DtlsState::Running => None,
            DtlsState::Closed { retry_at } => Some(*retry_at),
            DtlsState::Handshaking { started } => Some(*started + attempt_period),
        }
    }
}
