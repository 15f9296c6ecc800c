// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-process gateway plumbing shared by the engine scenarios.
//!
//! The CSTP side runs over `tokio::io::duplex` pairs handed out by
//! [`DuplexConnector`]; the DTLS side is a pair of cross-wired channel
//! transports produced by [`TestDtlsFactory`]. Nothing here touches the
//! network or a real tun device.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyconnect_client_rs::{
    cfg::config::{
        Config, DtlsConfig, RuntimeConfig, ScriptConfig, TlsConfig, TunnelConfig,
        VpnConfig,
    },
    client::{
        dtls::{Datagram, DtlsFactory, DtlsHandshakeParams},
        session::{AuthHandoff, Session},
        tls::CstpConnector,
    },
};
use anyhow::{Result, anyhow, ensure};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};

pub const TEST_MTU: u16 = 1406;

/// Baseline gateway answer: address + netmask, everything else off.
pub const BASE_HEADERS: &[(&str, &str)] = &[
    ("X-CSTP-Address", "10.20.0.5"),
    ("X-CSTP-Netmask", "255.255.255.0"),
    ("X-CSTP-DNS", "10.20.0.1"),
    ("X-CSTP-MTU", "1406"),
];

/// DTLS negotiation headers; the session id is 32 bytes of 0x42.
pub const DTLS_HEADERS: &[(&str, &str)] = &[
    ("X-DTLS-Port", "4433"),
    (
        "X-DTLS-Session-ID",
        "4242424242424242424242424242424242424242424242424242424242424242",
    ),
    ("X-DTLS-CipherSuite", "PSK-NEGOTIATE"),
    ("X-DTLS-DPD", "30"),
];

pub fn test_config(deflate: bool) -> Config {
    Config {
        vpn: VpnConfig {
            hostname: "gw.test".to_string(),
            port: 443,
            useragent: "Open AnyConnect VPN Agent".to_string(),
            localname: Some("testhost".to_string()),
            cookie: Some("deadbeef".to_string()),
            cookie_file: None,
        },
        tunnel: TunnelConfig {
            mtu: TEST_MTU,
            deflate,
            ..TunnelConfig::default()
        },
        dtls: DtlsConfig::default(),
        tls: TlsConfig::default(),
        script: ScriptConfig::default(),
        runtime: RuntimeConfig::default(),
    }
}

pub fn make_session(cfg: &Config) -> Session {
    Session::from_auth(
        AuthHandoff {
            hostname: cfg.vpn.hostname.clone(),
            port: cfg.vpn.port,
            cookie: cfg.resolve_cookie().expect("test cookie"),
        },
        cfg,
    )
}

/// Reads the CONNECT request off the gateway side and answers
/// `200 CONNECTED` with the given headers. Returns the raw request for
/// assertions.
pub async fn accept_upgrade(
    stream: &mut DuplexStream,
    headers: &[(&str, &str)],
) -> Result<String> {
    let mut req = Vec::with_capacity(512);
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        ensure!(n > 0, "client closed the stream during the upgrade");
        req.extend_from_slice(&buf[..n]);
        if req.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let req = String::from_utf8(req)?;
    ensure!(
        req.starts_with("CONNECT /CSCOSSLC/tunnel HTTP/1.1"),
        "unexpected request: {req:?}"
    );

    let mut resp = String::from("HTTP/1.1 200 CONNECTED\r\n");
    for (name, value) in headers {
        resp.push_str(&format!("{name}: {value}\r\n"));
    }
    resp.push_str("\r\n");
    stream.write_all(resp.as_bytes()).await?;
    Ok(req)
}

/// Writes one raw CSTP frame from the gateway side.
pub async fn send_frame(
    stream: &mut DuplexStream,
    ptype: u8,
    payload: &[u8],
) -> Result<()> {
    let len = u16::try_from(payload.len())?;
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&[b'S', b'T', b'F', 0x01]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(ptype);
    frame.push(0x00);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

/// Reads one raw CSTP frame on the gateway side.
pub async fn read_frame(stream: &mut DuplexStream) -> Result<(u8, Vec<u8>)> {
    let mut hdr = [0u8; 8];
    stream.read_exact(&mut hdr).await?;
    ensure!(hdr[..4] == [b'S', b'T', b'F', 0x01], "bad frame from client");
    let len = u16::from_be_bytes([hdr[4], hdr[5]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((hdr[6], payload))
}

/// Hands out pre-created duplex streams, one per connect. An empty queue
/// plays the part of an unreachable gateway.
pub struct DuplexConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
    pub connects: Arc<AtomicUsize>,
}

impl DuplexConnector {
    pub fn new(streams: Vec<DuplexStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl CstpConnector for DuplexConnector {
    type Stream = DuplexStream;

    async fn connect(&self, _hostname: &str, _port: u16) -> Result<DuplexStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.streams
            .lock()
            .expect("connector lock")
            .pop_front()
            .ok_or_else(|| anyhow!("gateway unreachable"))
    }
}

/// One side of a cross-wired datagram pair.
pub struct ChanDatagram {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChanDatagram {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx: a_tx,
                rx: tokio::sync::Mutex::new(b_rx),
            }),
            Arc::new(Self {
                tx: b_tx,
                rx: tokio::sync::Mutex::new(a_rx),
            }),
        )
    }
}

impl Datagram for ChanDatagram {
    fn send<'a>(
        &'a self,
        buf: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            self.tx
                .send(buf.to_vec())
                .map_err(|_| anyhow!("datagram peer closed"))?;
            Ok(buf.len())
        })
    }

    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            let datagram = self
                .rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| anyhow!("datagram peer closed"))?;
            ensure!(datagram.len() <= buf.len(), "datagram larger than buffer");
            buf[..datagram.len()].copy_from_slice(&datagram);
            Ok(datagram.len())
        })
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { Ok(()) })
    }
}

/// Factory that "handshakes" instantly by handing out pre-built client
/// transports, and counts how many attempts the engine made.
pub struct TestDtlsFactory {
    sides: Mutex<VecDeque<Arc<dyn Datagram>>>,
    pub calls: Arc<AtomicUsize>,
}

impl TestDtlsFactory {
    pub fn new(sides: Vec<Arc<dyn Datagram>>) -> Self {
        Self {
            sides: Mutex::new(sides.into()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl DtlsFactory for TestDtlsFactory {
    fn handshake(
        &self,
        _params: DtlsHandshakeParams,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Datagram>>> + Send + 'static>>
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let side = self.sides.lock().expect("factory lock").pop_front();
        Box::pin(async move {
            side.ok_or_else(|| anyhow!("no DTLS transport available"))
        })
    }
}
