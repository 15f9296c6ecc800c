// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The connected-session engine.
//!
//! One task owns every per-session resource and multiplexes the three
//! endpoints (CSTP stream, DTLS transport, tun device) with a single
//! `select!`. An iteration mirrors the classic event loop: drive the DTLS
//! attempt machinery, run the keepalive decisions, move queued traffic,
//! then block until the earliest of inbound I/O, a timer deadline, or
//! cancellation. The tun read arm is gated on egress-queue capacity, which
//! is the whole backpressure story: a full queue simply leaves packets in
//! the kernel.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::OnceCell;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    client::{
        compress::CompressViolation,
        cstp::CstpChannel,
        dtls::{Datagram, DtlsChannel},
        session::Session,
        tls::CstpConnector,
        tun_dev::TunEndpoint,
    },
    models::{frame::FrameViolation, packet::PktType},
    script::run_script,
    state_machine::keepalive::KaAction,
};

/// First pause before a reconnect retry.
pub const RECONNECT_INTERVAL_MIN: Duration = Duration::from_secs(10);
/// Retry pauses double up to this ceiling.
pub const RECONNECT_INTERVAL_MAX: Duration = Duration::from_secs(100);
/// Wake-up cadence when every timer is disabled.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct EngineOpts {
    pub reconnect_timeout: Duration,
    pub script: Option<String>,
}

impl EngineOpts {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            reconnect_timeout: Duration::from_secs(cfg.tunnel.reconnect_timeout),
            script: cfg.script.path.clone(),
        }
    }
}

pub struct VpnEngine<C, T>
where
    C: CstpConnector,
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    sess: Session,
    cstp: CstpChannel<C::Stream>,
    dtls: DtlsChannel,
    dtls_handshake: Option<JoinHandle<Result<Arc<dyn Datagram>>>>,
    tun: TunEndpoint<T>,
    connector: C,
    opts: EngineOpts,
}

impl<C, T> VpnEngine<C, T>
where
    C: CstpConnector,
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        sess: Session,
        cstp: CstpChannel<C::Stream>,
        dtls: DtlsChannel,
        tun: TunEndpoint<T>,
        connector: C,
        opts: EngineOpts,
    ) -> Self {
        Self {
            sess,
            cstp,
            dtls,
            dtls_handshake: None,
            tun,
            connector,
            opts,
        }
    }

    /// Runs the session to completion. `Ok(reason)` is a clean,
    /// operator-initiated exit; everything else surfaces as an error after
    /// the shutdown sequence has run.
    pub async fn run(mut self) -> Result<String> {
        self.dtls.reset(&self.sess, Instant::now());

        while self.sess.quit_reason.is_none() {
            let now = Instant::now();

            // DTLS attempt/handshake progression.
            if self.dtls.expire_handshake(now)
                && let Some(handle) = self.dtls_handshake.take()
            {
                handle.abort();
            }
            if self.dtls_handshake.is_none()
                && let Some(handle) = self.dtls.begin_attempt(&self.sess, now)
            {
                self.dtls_handshake = Some(handle);
            }

            let deadline = self.run_keepalives(now).await?;
            if self.sess.quit_reason.is_some() {
                break;
            }

            self.flush_queues().await?;
            if self.sess.quit_reason.is_some() {
                break;
            }

            let egress_has_room = self.sess.egress_has_room();
            let handshake_pending = self.dtls_handshake.is_some();
            let dtls_running = self.dtls.is_running();
            let wake_at = deadline.unwrap_or_else(|| now + IDLE_WAKEUP);

            tokio::select! {
                biased;

                _ = self.sess.cancel.cancelled() => {
                    let reason = self
                        .sess
                        .cancel_reason
                        .get()
                        .cloned()
                        .unwrap_or_else(|| "Client killed".to_string());
                    self.sess.quit_clean = true;
                    self.sess.set_quit(reason);
                },

                res = self.cstp.recv() => match res {
                    Ok(Some((ptype, payload))) => {
                        if let Err(e) =
                            self.cstp.dispatch(&mut self.sess, ptype, payload)
                        {
                            self.sess.set_quit(format!("CSTP protocol error: {e}"));
                        }
                    },
                    Ok(None) => {
                        warn!("CSTP peer closed the stream");
                        self.reconnect_cstp("Server closed connection").await;
                    },
                    Err(e) => {
                        if is_protocol_violation(&e) {
                            self.sess.set_quit(format!("CSTP protocol error: {e}"));
                        } else {
                            warn!("CSTP receive error: {e}");
                            self.reconnect_cstp("SSL read error").await;
                        }
                    },
                },

                res = join_handshake(&mut self.dtls_handshake),
                    if handshake_pending =>
                {
                    self.dtls_handshake = None;
                    self.dtls.on_handshake(&self.sess, res, Instant::now());
                },

                res = self.dtls.recv(), if dtls_running => match res {
                    Ok((ptype, payload)) => {
                        self.dtls.dispatch(&mut self.sess, ptype, payload).await;
                    },
                    Err(e) => {
                        warn!("DTLS receive error, falling back to SSL: {e}");
                        self.dtls.close(Instant::now()).await;
                    },
                },

                res = self.tun.read_packet(), if egress_has_room => match res {
                    Ok(Some(pkt)) => self.sess.egress.enqueue(pkt),
                    Ok(None) => {},
                    Err(e) => self.sess.set_quit(format!("tun device error: {e}")),
                },

                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }

        self.shutdown().await
    }

    /// Applies the keepalive decision for both channels and returns the
    /// earliest deadline any timer wants.
    async fn run_keepalives(&mut self, now: Instant) -> Result<Option<Instant>> {
        let (action, mut deadline) = self.cstp.ka.next_action(now);
        match action {
            KaAction::Rekey => {
                info!("CSTP rekey interval reached; re-establishing the tunnel");
                self.reconnect_cstp("Rekey").await;
            },
            KaAction::DpdDead => {
                warn!("CSTP dead peer detected (no traffic for 2x DPD)");
                self.reconnect_cstp("DPD detected dead peer").await;
            },
            KaAction::Dpd => {
                debug!("sending CSTP DPD probe");
                if let Err(e) = self.cstp.send_control(PktType::DpdOut, &[]).await {
                    warn!("CSTP write error: {e}");
                    self.reconnect_cstp("SSL write error").await;
                }
            },
            KaAction::Keepalive => {
                debug!("sending CSTP keepalive");
                if let Err(e) = self.cstp.send_control(PktType::Keepalive, &[]).await
                {
                    warn!("CSTP write error: {e}");
                    self.reconnect_cstp("SSL write error").await;
                }
            },
            KaAction::None => {},
        }
        if self.sess.quit_reason.is_some() {
            return Ok(None);
        }

        if self.dtls.is_running() {
            let (action, dtls_deadline) = self.dtls.ka.next_action(now);
            match action {
                KaAction::DpdDead => {
                    warn!("DTLS dead peer; data falls back to SSL");
                    self.dtls.close(now).await;
                },
                KaAction::Dpd => {
                    debug!("sending DTLS DPD probe");
                    if let Err(e) = self.dtls.send_control(PktType::DpdOut).await {
                        warn!("DTLS write error: {e}");
                        self.dtls.close(now).await;
                    }
                },
                KaAction::Keepalive => {
                    debug!("sending DTLS keepalive");
                    if let Err(e) = self.dtls.send_control(PktType::Keepalive).await
                    {
                        warn!("DTLS write error: {e}");
                        self.dtls.close(now).await;
                    }
                },
                KaAction::Rekey => {
                    info!("DTLS rekey interval reached; restarting handshake");
                    if let Some(handle) = self.dtls_handshake.take() {
                        handle.abort();
                    }
                    self.dtls.restart(now).await;
                },
                KaAction::None => {},
            }
            deadline = min_opt(deadline, dtls_deadline);
        }

        deadline = min_opt(deadline, self.dtls.deadline());
        Ok(deadline)
    }

    /// Answers owed probes, then drains egress (datagram path preferred)
    /// and ingress. Control traffic always jumps ahead of queued data.
    async fn flush_queues(&mut self) -> Result<()> {
        if let Err(e) = self.cstp.flush_owed().await {
            warn!("CSTP write error: {e}");
            self.reconnect_cstp("SSL write error").await;
            return Ok(());
        }
        if self.dtls.is_running()
            && let Err(e) = self.dtls.flush_owed().await
        {
            warn!("DTLS write error: {e}");
            self.dtls.close(Instant::now()).await;
        }

        while let Some(pkt) = self.sess.egress.dequeue() {
            if self.dtls.is_running() {
                match self.dtls.send_data(&pkt).await {
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("DTLS send failed, falling back to SSL: {e}");
                        self.dtls.close(Instant::now()).await;
                    },
                }
            }
            if let Err(e) = self.cstp.send_data(&mut self.sess, pkt).await {
                if is_protocol_violation(&e) {
                    self.sess.set_quit(format!("CSTP protocol error: {e}"));
                } else {
                    warn!("CSTP send error: {e}");
                    self.reconnect_cstp("SSL write error").await;
                }
                return Ok(());
            }
        }

        while let Some(pkt) = self.sess.ingress.dequeue() {
            if let Err(e) = self.tun.write_packet(pkt.payload()).await {
                self.sess.set_quit(format!("tun write error: {e}"));
                return Ok(());
            }
        }
        Ok(())
    }

    /// Tears the TLS transport down and dials again with the session
    /// cookie, backing off between attempts. Gives up (and stops the
    /// session) once the total budget is spent.
    async fn reconnect_cstp(&mut self, why: &str) {
        // The resumed DTLS association is keyed to the old tunnel; drop it
        // and let the fresh handshake re-arm it.
        if let Some(handle) = self.dtls_handshake.take() {
            handle.abort();
        }
        self.dtls.close(Instant::now()).await;

        let started = Instant::now();
        let mut interval = RECONNECT_INTERVAL_MIN;
        let cancel = self.sess.cancel.clone();

        loop {
            if self.sess.cancel.is_cancelled() {
                self.quit_cancelled();
                return;
            }

            match self.try_connect_cstp(&cancel).await {
                Ok(channel) => {
                    self.cstp = channel;
                    self.dtls.reset(&self.sess, Instant::now());
                    info!("CSTP reconnected ({why})");
                    return;
                },
                Err(e) => warn!("CSTP reconnect failed: {e}"),
            }

            if started.elapsed() + interval > self.opts.reconnect_timeout {
                self.sess.set_quit(format!("Reconnect failed: {why}"));
                return;
            }
            debug!("retrying CSTP connect in {interval:?}");
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.quit_cancelled();
                    return;
                },
                _ = tokio::time::sleep(interval) => {},
            }
            interval = (interval * 2).min(RECONNECT_INTERVAL_MAX);
        }
    }

    async fn try_connect_cstp(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CstpChannel<C::Stream>> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => bail!("connect cancelled"),
            res = self.connector.connect(&self.sess.hostname, self.sess.port) => res?,
        };
        tokio::select! {
            _ = cancel.cancelled() => bail!("upgrade cancelled"),
            res = CstpChannel::upgrade(stream, &mut self.sess) => res,
        }
    }

    fn quit_cancelled(&mut self) {
        let reason = self
            .sess
            .cancel_reason
            .get()
            .cloned()
            .unwrap_or_else(|| "Client killed".to_string());
        self.sess.quit_clean = true;
        self.sess.set_quit(reason);
    }

    async fn shutdown(mut self) -> Result<String> {
        let reason = self
            .sess
            .quit_reason
            .clone()
            .unwrap_or_else(|| "Unknown".to_string());

        if self.sess.server_initiated {
            debug!("server initiated the shutdown; no disconnect notice owed");
        } else if let Err(e) = self.cstp.bye(&reason).await {
            debug!("could not send disconnect notice: {e}");
        } else {
            info!("Sent quit message: {reason}");
        }

        if let Some(handle) = self.dtls_handshake.take() {
            handle.abort();
        }
        self.dtls.close(Instant::now()).await;

        if let Some(script) = self.opts.script.clone() {
            let ifname = self.tun.ifname().to_string();
            if let Err(e) =
                run_script(&self.sess, &script, &ifname, "disconnect").await
            {
                warn!("disconnect script failed: {e}");
            }
        }

        if self.sess.quit_clean {
            Ok(reason)
        } else {
            Err(anyhow!("{reason}"))
        }
    }
}

/// Installs SIGINT/SIGHUP handlers that record the quit reason and trip the
/// injected cancellation token. The handlers never interrupt a mid-packet
/// write; the loop observes the token at its next suspension point.
pub fn spawn_signal_watcher(
    cancel: CancellationToken,
    reason: Arc<OnceCell<String>>,
) -> Result<()> {
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sighup =
        signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                let _ = reason.set("Client received SIGINT".to_string());
            },
            _ = sighup.recv() => {
                let _ = reason.set("Client received SIGHUP".to_string());
            },
        }
        cancel.cancel();
    });
    Ok(())
}

async fn join_handshake(
    handshake: &mut Option<JoinHandle<Result<Arc<dyn Datagram>>>>,
) -> Result<Arc<dyn Datagram>> {
    match handshake.as_mut() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("DTLS handshake task failed: {e}")),
        },
        None => std::future::pending().await,
    }
}

fn is_protocol_violation(e: &anyhow::Error) -> bool {
    e.downcast_ref::<FrameViolation>().is_some()
        || e.downcast_ref::<CompressViolation>().is_some()
}

fn min_opt(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (x, None) => x,
        (None, y) => y,
    }
}
