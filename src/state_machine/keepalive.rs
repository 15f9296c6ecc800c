// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Keepalive / DPD / rekey timer logic, one instance per channel.
//!
//! The decision function is pure over `(now, state)` so the engine can call
//! it at any point of an iteration and tests can drive it with a paused
//! clock. Priorities, from highest: rekey, dead peer, DPD probe, keepalive.

use std::time::Duration;

use tokio::time::Instant;

/// What the channel must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KaAction {
    None,
    /// Send a DPD probe.
    Dpd,
    /// No traffic for 2x the DPD period: the peer is gone.
    DpdDead,
    /// Send a keepalive nudge.
    Keepalive,
    /// Renegotiate session keys.
    Rekey,
}

/// Timer state for one channel.
///
/// `last_dpd > last_rx` means a probe is outstanding and unanswered; a
/// repeat probe is withheld until half the DPD period has passed so a slow
/// peer is not flooded.
#[derive(Debug, Clone)]
pub struct KeepaliveTimes {
    pub dpd: Option<Duration>,
    pub keepalive: Option<Duration>,
    pub rekey: Option<Duration>,
    pub last_tx: Instant,
    pub last_rx: Instant,
    pub last_rekey: Instant,
    pub last_dpd: Instant,
}

impl KeepaliveTimes {
    pub fn new(now: Instant) -> Self {
        Self {
            dpd: None,
            keepalive: None,
            rekey: None,
            last_tx: now,
            last_rx: now,
            last_rekey: now,
            last_dpd: now,
        }
    }

    /// Re-arms every timer after a (re)connect with freshly negotiated
    /// periods. Zero-valued periods disable the respective timer.
    pub fn rearm(&mut self, now: Instant, dpd: u64, keepalive: u64, rekey: u64) {
        self.dpd = nonzero_secs(dpd);
        self.keepalive = nonzero_secs(keepalive);
        self.rekey = nonzero_secs(rekey);
        self.last_tx = now;
        self.last_rx = now;
        self.last_rekey = now;
        self.last_dpd = now;
    }

    #[inline]
    pub fn note_tx(&mut self, now: Instant) {
        self.last_tx = now;
    }

    #[inline]
    pub fn note_rx(&mut self, now: Instant) {
        self.last_rx = now;
    }

    /// Picks the next action and the deadline at which to re-check.
    ///
    /// Returns `(action, deadline)`; the deadline is `None` when every timer
    /// is disabled. A returned [`KaAction::Dpd`] records `last_dpd = now`,
    /// so at most one probe is outstanding per period.
    pub fn next_action(&mut self, now: Instant) -> (KaAction, Option<Instant>) {
        let mut deadline: Option<Instant> = None;

        if let Some(rekey) = self.rekey {
            let due = self.last_rekey + rekey;
            if now >= due {
                return (KaAction::Rekey, Some(now));
            }
            deadline = min_deadline(deadline, due);
        }

        // DPD is bidirectional: probe out, response back.
        if let Some(dpd) = self.dpd {
            let overdue = self.last_rx + 2 * dpd;
            if now > overdue {
                return (KaAction::DpdDead, Some(now));
            }
            // Death needs `now` strictly past the overdue mark, so the
            // wake-up lands one tick later to avoid a zero-length sleep.
            let overdue_wake = overdue + Duration::from_secs(1);

            // A probe is already outstanding; repeat only after half the
            // period.
            let due = if self.last_dpd > self.last_rx {
                self.last_dpd + dpd / 2
            } else {
                self.last_rx + dpd
            };

            if now >= due {
                self.last_dpd = now;
                return (
                    KaAction::Dpd,
                    min_deadline(Some(overdue_wake), now + dpd / 2),
                );
            }
            deadline = min_deadline(deadline, due);
            deadline = min_deadline(deadline, overdue_wake);
        }

        // Keepalive is client -> server only.
        if let Some(keepalive) = self.keepalive {
            let due = self.last_tx + keepalive;
            if now >= due {
                return (KaAction::Keepalive, deadline.or(Some(now + keepalive)));
            }
            deadline = min_deadline(deadline, due);
        }

        (KaAction::None, deadline)
    }

    /// Liveness check for a channel whose socket is unwritable: no probe
    /// can be sent, but the peer still counts as dead once `2 * dpd` passes
    /// without inbound traffic.
    pub fn stalled_dpd_dead(&self, now: Instant) -> bool {
        match self.dpd {
            Some(dpd) => now > self.last_rx + 2 * dpd,
            None => false,
        }
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn min_deadline(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(match current {
        Some(c) if c <= candidate => c,
        _ => candidate,
    })
}
