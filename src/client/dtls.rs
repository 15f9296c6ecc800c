// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! DTLS channel: the unreliable datagram transport for data traffic.
//!
//! Every datagram is one protocol record: a single type byte followed by
//! the payload, delimited by the datagram itself. The channel owns the
//! CLOSED -> HANDSHAKING -> RUNNING progression and its own keepalive
//! state; the handshake itself runs in a spawned task whose handle the
//! engine polls, so a slow or black-holed gateway never stalls the loop.
//!
//! Two seams keep the crypto out of the data path: [`Datagram`] is the
//! established transport (production: a webrtc-dtls association over a
//! connected UDP socket) and [`DtlsFactory`] produces one. Tests plug in
//! channel-backed implementations of both.

use std::{pin::Pin, sync::Arc, time::Duration};

use anyhow::{Result, anyhow, bail};
use dtls::{
    cipher_suite::CipherSuiteId,
    config::{Config as DtlsCryptoConfig, ExtendedMasterSecretType},
    conn::DTLSConn,
};
use tokio::{net::UdpSocket, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};
use util::conn::Conn;

use crate::{
    client::session::Session,
    models::packet::{Pkt, PktType},
    state_machine::{dtls_states::DtlsState, keepalive::KeepaliveTimes},
};

/// Upper bound for one inbound datagram; anything larger than the tunnel
/// MTU is a peer bug, but the buffer tolerates it and the dispatcher drops.
const DATAGRAM_BUF: usize = 65536;

/// An established datagram transport carrying raw protocol records.
pub trait Datagram: Send + Sync {
    fn send<'a>(
        &'a self,
        buf: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>>;

    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>>;

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// What the handshake needs from the session: where to go and the secrets
/// the CSTP upgrade negotiated for resumption.
#[derive(Debug, Clone)]
pub struct DtlsHandshakeParams {
    pub hostname: String,
    pub port: u16,
    pub psk: Vec<u8>,
    pub psk_identity: Vec<u8>,
}

/// Produces an established [`Datagram`] transport. The returned future is
/// spawned by the engine and raced against the attempt deadline.
pub trait DtlsFactory: Send + Sync {
    fn handshake(
        &self,
        params: DtlsHandshakeParams,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Datagram>>> + Send + 'static>>;
}

pub struct DtlsChannel {
    state: DtlsState,
    transport: Option<Arc<dyn Datagram>>,
    pub ka: KeepaliveTimes,
    attempt_period: Duration,
    owe_dpd_resp: bool,
    mtu: usize,
    factory: Arc<dyn DtlsFactory>,
}

impl std::fmt::Debug for DtlsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtlsChannel")
            .field("state", &self.state)
            .field("attempt_period", &self.attempt_period)
            .finish()
    }
}

impl DtlsChannel {
    /// `attempt_period_secs == 0` disables the channel permanently.
    pub fn new(factory: Arc<dyn DtlsFactory>, attempt_period_secs: u64) -> Self {
        Self {
            state: DtlsState::Disabled,
            transport: None,
            ka: KeepaliveTimes::new(Instant::now()),
            attempt_period: Duration::from_secs(attempt_period_secs),
            owe_dpd_resp: false,
            mtu: 0,
            factory,
        }
    }

    #[inline]
    pub fn state(&self) -> DtlsState {
        self.state
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Re-evaluates enablement after a CSTP (re)connect: the gateway must
    /// have negotiated DTLS and the attempt period must be non-zero,
    /// otherwise the channel stays off for good.
    pub fn reset(&mut self, sess: &Session, now: Instant) {
        self.transport = None;
        self.owe_dpd_resp = false;
        self.state = if sess.dtls.is_some() && !self.attempt_period.is_zero() {
            DtlsState::Closed { retry_at: now }
        } else {
            DtlsState::Disabled
        };
    }

    /// Spawns a handshake attempt when one is due. The engine stores the
    /// returned handle and feeds the outcome back via
    /// [`DtlsChannel::on_handshake`].
    pub fn begin_attempt(
        &mut self,
        sess: &Session,
        now: Instant,
    ) -> Option<JoinHandle<Result<Arc<dyn Datagram>>>> {
        if !self.state.attempt_due(now) {
            return None;
        }
        let negotiated = sess.dtls.as_ref()?;

        let params = DtlsHandshakeParams {
            hostname: sess.hostname.clone(),
            port: negotiated.port,
            psk: sess.dtls_secret.to_vec(),
            psk_identity: negotiated.session_id.clone(),
        };
        info!(
            "attempting DTLS to {}:{} (session id {} bytes)",
            params.hostname,
            params.port,
            params.psk_identity.len()
        );
        self.state = DtlsState::Handshaking { started: now };
        Some(tokio::spawn(self.factory.handshake(params)))
    }

    /// Abandons a handshake that outlived the attempt period. Returns true
    /// when the engine should drop the task handle.
    pub fn expire_handshake(&mut self, now: Instant) -> bool {
        if let DtlsState::Handshaking { started } = self.state
            && now.duration_since(started) >= self.attempt_period
        {
            warn!("DTLS handshake timed out; will retry");
            self.state = DtlsState::Closed {
                retry_at: now + self.attempt_period,
            };
            return true;
        }
        false
    }

    /// Feeds the handshake outcome into the state machine.
    pub fn on_handshake(
        &mut self,
        sess: &Session,
        result: Result<Arc<dyn Datagram>>,
        now: Instant,
    ) {
        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.mtu = sess.mtu as usize;
                self.state = DtlsState::Running;
                if let Some(negotiated) = &sess.dtls {
                    self.ka.rearm(
                        now,
                        negotiated.dpd,
                        negotiated.keepalive,
                        negotiated.rekey,
                    );
                }
                info!("DTLS running; data traffic moves off the TLS channel");
            },
            Err(e) => {
                warn!("DTLS handshake failed: {e}");
                self.state = DtlsState::Closed {
                    retry_at: now + self.attempt_period,
                };
            },
        }
    }

    /// Next inbound record. Pends forever while no transport exists, which
    /// lets the engine keep it in its select set unconditionally.
    pub async fn recv(&self) -> Result<(PktType, Vec<u8>)> {
        let Some(transport) = self.transport.clone() else {
            return std::future::pending().await;
        };
        let mut buf = vec![0u8; DATAGRAM_BUF];
        let n = transport.recv(&mut buf).await?;
        if n == 0 {
            bail!("DTLS transport closed by peer");
        }
        let ptype = PktType::try_from(buf[0])
            .map_err(|e| anyhow!("DTLS record with {e}"))?;
        let payload = buf[1..n].to_vec();
        Ok((ptype, payload))
    }

    /// Handles one inbound record. DTLS problems never kill the session:
    /// anything unexpected is answered by dropping the channel back to
    /// CLOSED and letting data flow over CSTP again.
    pub async fn dispatch(
        &mut self,
        sess: &mut Session,
        ptype: PktType,
        payload: Vec<u8>,
    ) {
        self.ka.note_rx(Instant::now());

        match ptype {
            PktType::Data => {
                debug!("DTLS data, {} bytes", payload.len());
                sess.ingress.enqueue(Pkt::new(PktType::Data, &payload));
            },
            PktType::DpdOut => {
                debug!("DTLS DPD request");
                self.owe_dpd_resp = true;
            },
            PktType::DpdResp => debug!("DTLS DPD response"),
            PktType::Keepalive => debug!("DTLS keepalive"),
            other => {
                warn!("unexpected {other:?} on DTLS; dropping channel");
                self.close(Instant::now()).await;
            },
        }
    }

    /// Sends one data record. `Ok(false)` means the packet exceeded the MTU
    /// and was dropped, per the datagram send policy.
    pub async fn send_data(&mut self, pkt: &Pkt) -> Result<bool> {
        if pkt.len() > self.mtu {
            debug!("dropping {}-byte packet over DTLS MTU {}", pkt.len(), self.mtu);
            return Ok(false);
        }
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| anyhow!("DTLS transport not running"))?;
        let mut record = Vec::with_capacity(1 + pkt.len());
        record.push(pkt.ptype() as u8);
        record.extend_from_slice(pkt.payload());
        transport.send(&record).await?;
        self.ka.note_tx(Instant::now());
        Ok(true)
    }

    /// Emits a bare control record (type byte only).
    pub async fn send_control(&mut self, ptype: PktType) -> Result<()> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| anyhow!("DTLS transport not running"))?;
        transport.send(&[ptype as u8]).await?;
        self.ka.note_tx(Instant::now());
        Ok(())
    }

    /// Answers an outstanding DPD probe, if one is owed.
    pub async fn flush_owed(&mut self) -> Result<()> {
        if self.owe_dpd_resp {
            self.send_control(PktType::DpdResp).await?;
            self.owe_dpd_resp = false;
        }
        Ok(())
    }

    /// Drops to CLOSED (or Disabled when attempts are off) and schedules
    /// the next attempt one full period out.
    pub async fn close(&mut self, now: Instant) {
        if let Some(transport) = self.transport.take() {
            let _ = transport.close().await;
        }
        self.owe_dpd_resp = false;
        self.state = if self.attempt_period.is_zero() {
            DtlsState::Disabled
        } else {
            DtlsState::Closed {
                retry_at: now + self.attempt_period,
            }
        };
    }

    /// Like [`DtlsChannel::close`] but with an immediate re-attempt; used
    /// for the DTLS rekey, which is just a fresh handshake.
    pub async fn restart(&mut self, now: Instant) {
        self.close(now).await;
        if let DtlsState::Closed { .. } = self.state {
            self.state = DtlsState::Closed { retry_at: now };
        }
    }

    /// Earliest instant at which this channel needs attention.
    pub fn deadline(&self) -> Option<Instant> {
        self.state.deadline(self.attempt_period)
    }
}

/// Production factory: connected UDP socket plus a webrtc-dtls association
/// keyed by the CSTP master secret (identity = the gateway's session id).
pub struct WebrtcDtlsFactory;

impl DtlsFactory for WebrtcDtlsFactory {
    fn handshake(
        &self,
        params: DtlsHandshakeParams,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Datagram>>> + Send + 'static>> {
        Box::pin(async move {
            let mut addrs =
                tokio::net::lookup_host((params.hostname.as_str(), params.port))
                    .await
                    .map_err(|e| anyhow!("DTLS resolve {}: {e}", params.hostname))?;
            let addr = addrs
                .next()
                .ok_or_else(|| anyhow!("no address for {}", params.hostname))?;

            let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await?;

            let psk = params.psk.clone();
            let config = DtlsCryptoConfig {
                psk: Some(Arc::new(move |_hint: &[u8]| Ok(psk.clone()))),
                psk_identity_hint: Some(params.psk_identity.clone()),
                cipher_suites: vec![
                    CipherSuiteId::Tls_Psk_With_Aes_128_Gcm_Sha256,
                    CipherSuiteId::Tls_Psk_With_Aes_128_Ccm_8,
                ],
                extended_master_secret: ExtendedMasterSecretType::Require,
                ..Default::default()
            };

            let conn: Arc<dyn Conn + Send + Sync> = Arc::new(socket);
            let dtls_conn = DTLSConn::new(conn, config, true, None)
                .await
                .map_err(|e| anyhow!("DTLS handshake with {addr}: {e}"))?;

            Ok(Arc::new(WebrtcDatagram(dtls_conn)) as Arc<dyn Datagram>)
        })
    }
}

struct WebrtcDatagram(DTLSConn);

impl Datagram for WebrtcDatagram {
    fn send<'a>(
        &'a self,
        buf: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            self.0.send(buf).await.map_err(|e| anyhow!("DTLS send: {e}"))
        })
    }

    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            self.0.recv(buf).await.map_err(|e| anyhow!("DTLS recv: {e}"))
        })
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.0.close().await.map_err(|e| anyhow!("DTLS close: {e}"))
        })
    }
}
