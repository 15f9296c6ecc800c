// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CSTP channel: the framed, reliable transport over the authenticated TLS
//! stream.
//!
//! The channel is generic over the byte stream so the whole upgrade and
//! framing path can be exercised against an in-process gateway in tests; in
//! production the stream is `tokio_rustls::client::TlsStream<TcpStream>`.
//!
//! Lifecycle: [`CstpChannel::upgrade`] performs the HTTP CONNECT-style
//! handshake on a fresh stream, parses every `X-CSTP-*`/`X-DTLS-*` response
//! header into the session's option vectors, derives the negotiated
//! addressing/keepalive parameters, and only then switches the stream into
//! framed mode. Reconnects build a whole new channel the same way, reusing
//! the session cookie.

use std::fmt::Write as _;

use anyhow::{Context, Result, anyhow, bail};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    client::session::{DtlsNegotiation, Session},
    models::{
        frame::{CstpCodec, FrameViolation},
        packet::{Pkt, PktType},
    },
    state_machine::keepalive::KeepaliveTimes,
};

/// Longest header line accepted from the gateway during the upgrade.
const MAX_HEADER_LINE: usize = 8192;

#[derive(Debug)]
pub struct CstpChannel<S> {
    framed: Framed<S, CstpCodec>,
    pub ka: KeepaliveTimes,
    owe_dpd_resp: bool,
}

impl<S> CstpChannel<S>
where S: AsyncRead + AsyncWrite + Unpin + Send
{
    /// Performs the CONNECT upgrade on an already-authenticated stream and
    /// returns the framed channel. Fills the session's option vectors and
    /// negotiated parameters as a side effect.
    pub async fn upgrade(mut stream: S, sess: &mut Session) -> Result<Self> {
        let req = build_connect_request(sess);
        stream
            .write_all(req.as_bytes())
            .await
            .context("failed to send CSTP CONNECT request")?;

        let status = read_header_line(&mut stream).await?;
        if !status.starts_with("HTTP/") || !status.contains(" 200") {
            bail!("CSTP upgrade refused by gateway: {status:?}");
        }

        sess.cstp_options.clear();
        sess.dtls_options.clear();
        let mut derived = Derived::default();

        loop {
            let line = read_header_line(&mut stream).await?;
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                warn!("malformed gateway header {line:?}");
                continue;
            };
            let name = name.trim();
            let value = value.trim();

            if let Some(rest) = strip_prefix_ci(name, "X-CSTP-") {
                sess.cstp_options.push(name, value);
                derived.apply_cstp(rest, value);
            } else if let Some(rest) = strip_prefix_ci(name, "X-DTLS-") {
                sess.dtls_options.push(name, value);
                derived.apply_dtls(rest, value);
            } else {
                debug!("ignoring gateway header {name}");
            }
        }

        let (dpd, keepalive, rekey) = (derived.dpd, derived.keepalive, derived.rekey);
        derived.commit(sess)?;

        let now = Instant::now();
        let mut ka = KeepaliveTimes::new(now);
        ka.rearm(now, dpd, keepalive, rekey);

        info!(
            "CSTP connected to {}: address {}, MTU {}",
            sess.hostname,
            sess.vpn_addr.map(|a| a.to_string()).unwrap_or_default(),
            sess.mtu
        );

        Ok(Self {
            framed: Framed::new(stream, CstpCodec),
            ka,
            owe_dpd_resp: false,
        })
    }

    /// Next inbound frame; `Ok(None)` on a clean EOF from the gateway.
    /// Cancel-safe: a partial frame stays buffered in the codec.
    pub async fn recv(&mut self) -> Result<Option<(PktType, BytesMut)>> {
        match self.framed.next().await {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Handles one inbound frame. Every call refreshes `last_rx`; errors
    /// out of here are fatal protocol violations.
    pub fn dispatch(
        &mut self,
        sess: &mut Session,
        ptype: PktType,
        payload: BytesMut,
    ) -> Result<()> {
        self.ka.note_rx(Instant::now());

        match ptype {
            PktType::Data => {
                debug!("CSTP data, {} bytes", payload.len());
                sess.ingress.enqueue(Pkt::new(PktType::Data, &payload));
            },
            PktType::Compressed => {
                let pipeline = sess
                    .compress
                    .as_mut()
                    .ok_or(FrameViolation::UnnegotiatedCompression)?;
                let body = pipeline.inflate_pkt(&payload)?;
                debug!("CSTP compressed data, {} -> {} bytes", payload.len(), body.len());
                sess.ingress.enqueue(Pkt::new(PktType::Data, &body));
            },
            PktType::DpdOut => {
                debug!("CSTP DPD request");
                self.owe_dpd_resp = true;
            },
            PktType::DpdResp => debug!("CSTP DPD response"),
            PktType::Keepalive => debug!("CSTP keepalive"),
            PktType::Disconn => {
                let msg = String::from_utf8_lossy(&payload).into_owned();
                info!("Server requested disconnect: {msg}");
                sess.server_initiated = true;
                sess.set_quit("Server closed connection");
            },
            PktType::TermServer => {
                info!("Server terminated session");
                sess.server_initiated = true;
                sess.set_quit("Server closed connection");
            },
        }
        Ok(())
    }

    /// Sends one data packet, compressing it when deflate was negotiated.
    pub async fn send_data(&mut self, sess: &mut Session, pkt: Pkt) -> Result<()> {
        let out = match sess.compress.as_mut() {
            Some(pipeline) if pkt.ptype() == PktType::Data => {
                let body = pipeline.deflate_pkt(pkt.payload())?;
                Pkt::new(PktType::Compressed, &body)
            },
            _ => pkt,
        };
        self.framed.send(out).await?;
        self.ka.note_tx(Instant::now());
        Ok(())
    }

    /// Emits a control frame directly, bypassing the data queues.
    pub async fn send_control(&mut self, ptype: PktType, payload: &[u8]) -> Result<()> {
        self.framed.send(Pkt::new(ptype, payload)).await?;
        self.ka.note_tx(Instant::now());
        Ok(())
    }

    /// Answers an outstanding DPD probe, if one is owed.
    pub async fn flush_owed(&mut self) -> Result<()> {
        if self.owe_dpd_resp {
            self.send_control(PktType::DpdResp, &[]).await?;
            self.owe_dpd_resp = false;
        }
        Ok(())
    }

    /// Client-side goodbye; the payload is the human-readable reason.
    pub async fn bye(&mut self, reason: &str) -> Result<()> {
        self.send_control(PktType::Disconn, reason.as_bytes()).await
    }
}

fn build_connect_request(sess: &Session) -> String {
    let mut req = String::with_capacity(512);
    let _ = write!(req, "CONNECT /CSCOSSLC/tunnel HTTP/1.1\r\n");
    let _ = write!(req, "Host: {}\r\n", sess.hostname);
    let _ = write!(req, "User-Agent: {}\r\n", sess.useragent);
    let _ = write!(req, "Cookie: webvpn={}\r\n", sess.cookie);
    let _ = write!(req, "X-CSTP-Version: 1\r\n");
    let _ = write!(req, "X-CSTP-Hostname: {}\r\n", sess.localname);
    if sess.deflate_requested {
        let _ = write!(req, "X-CSTP-Accept-Encoding: deflate;q=1.0\r\n");
    }
    let _ = write!(req, "X-CSTP-MTU: {}\r\n", sess.req_mtu);
    let _ = write!(req, "X-CSTP-Address-Type: IPv6,IPv4\r\n");
    let _ = write!(req, "X-DTLS-Master-Secret: {}\r\n", sess.dtls_secret_hex);
    let _ = write!(req, "X-DTLS-CipherSuite: PSK-NEGOTIATE\r\n");
    let _ = write!(req, "\r\n");
    req
}

/// Reads one CRLF-terminated header line, a byte at a time. The upgrade is
/// the only line-oriented phase; once framing starts the gateway never sends
/// text again, so overshooting here would corrupt the frame stream.
async fn read_header_line<S>(stream: &mut S) -> Result<String>
where S: AsyncRead + Unpin {
    let mut line = Vec::with_capacity(80);
    let mut byte = [0u8; 1];
    loop {
        stream
            .read_exact(&mut byte)
            .await
            .context("gateway closed the stream during the CSTP upgrade")?;
        match byte[0] {
            b'\n' => break,
            b'\r' => {},
            b => {
                line.push(b);
                if line.len() > MAX_HEADER_LINE {
                    bail!("oversized header line from gateway");
                }
            },
        }
    }
    String::from_utf8(line).context("non-UTF8 header line from gateway")
}

fn strip_prefix_ci<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    if name.len() >= prefix.len() && name[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&name[prefix.len()..])
    } else {
        None
    }
}

/// Typed view of the response headers the core consumes. Everything else
/// stays in the option vectors untouched.
#[derive(Debug, Default)]
struct Derived {
    addr: Option<std::net::Ipv4Addr>,
    netmask: Option<std::net::Ipv4Addr>,
    dns: Vec<std::net::IpAddr>,
    nbns: Vec<std::net::IpAddr>,
    domain: Option<String>,
    mtu: Option<u16>,
    dpd: u64,
    keepalive: u64,
    rekey: u64,
    deflate: bool,

    dtls_port: Option<u16>,
    dtls_session_id: Option<Vec<u8>>,
    dtls_cipher: Option<String>,
    dtls_dpd: u64,
    dtls_keepalive: u64,
    dtls_rekey: u64,
}

impl Derived {
    fn apply_cstp(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("Address") {
            self.addr = value.parse().ok();
        } else if name.eq_ignore_ascii_case("Netmask") {
            self.netmask = value.parse().ok();
        } else if name.eq_ignore_ascii_case("DNS") {
            if self.dns.len() < 3
                && let Ok(ip) = value.parse()
            {
                self.dns.push(ip);
            }
        } else if name.eq_ignore_ascii_case("NBNS") {
            if self.nbns.len() < 3
                && let Ok(ip) = value.parse()
            {
                self.nbns.push(ip);
            }
        } else if name.eq_ignore_ascii_case("Default-Domain") {
            self.domain = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("MTU") {
            self.mtu = value.parse().ok();
        } else if name.eq_ignore_ascii_case("DPD") {
            self.dpd = value.parse().unwrap_or(0);
        } else if name.eq_ignore_ascii_case("Keepalive") {
            self.keepalive = value.parse().unwrap_or(0);
        } else if name.eq_ignore_ascii_case("Rekey-Time") {
            self.rekey = value.parse().unwrap_or(0);
        } else if name.eq_ignore_ascii_case("Content-Encoding") {
            self.deflate = value.eq_ignore_ascii_case("deflate");
        }
    }

    fn apply_dtls(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("Session-ID") {
            match hex::decode(value) {
                Ok(sid) => self.dtls_session_id = Some(sid),
                Err(e) => warn!("undecodable X-DTLS-Session-ID: {e}"),
            }
        } else if name.eq_ignore_ascii_case("Port") {
            self.dtls_port = value.parse().ok();
        } else if name.eq_ignore_ascii_case("CipherSuite") {
            self.dtls_cipher = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("DPD") {
            self.dtls_dpd = value.parse().unwrap_or(0);
        } else if name.eq_ignore_ascii_case("Keepalive") {
            self.dtls_keepalive = value.parse().unwrap_or(0);
        } else if name.eq_ignore_ascii_case("Rekey-Time") {
            self.dtls_rekey = value.parse().unwrap_or(0);
        }
    }

    fn commit(self, sess: &mut Session) -> Result<()> {
        for opt in sess.cstp_options.iter() {
            debug!("CSTP option {opt}");
        }
        for opt in sess.dtls_options.iter() {
            debug!("DTLS option {opt}");
        }

        sess.vpn_addr =
            Some(self.addr.ok_or_else(|| anyhow!("no IP address received from gateway"))?);
        sess.vpn_netmask = self.netmask;
        sess.vpn_dns = self.dns;
        sess.vpn_nbns = self.nbns;
        sess.vpn_domain = self.domain;
        sess.mtu = self.mtu.unwrap_or(sess.req_mtu);

        if self.deflate && !sess.deflate_requested {
            bail!("gateway enabled deflate we never offered");
        }
        sess.compress = (self.deflate && sess.deflate_requested)
            .then(crate::client::compress::CompressionPipeline::new);

        sess.dtls = match (self.dtls_port, self.dtls_session_id, self.dtls_cipher) {
            (Some(port), Some(session_id), Some(cipher)) => Some(DtlsNegotiation {
                port,
                session_id,
                cipher,
                dpd: self.dtls_dpd,
                keepalive: self.dtls_keepalive,
                rekey: self.dtls_rekey,
            }),
            _ => None,
        };

        Ok(())
    }
}
