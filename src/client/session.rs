// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The root session aggregate.
//!
//! One `Session` exists per process. The authentication front-end hands over
//! a hostname and a `webvpn` cookie; everything else is filled in by the
//! CSTP upgrade and mutated only from the engine task, so no locking is
//! needed anywhere in the data path.

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::config::Config,
    client::{compress::CompressionPipeline, queues::PktQueue},
    models::options::OptionSet,
    utils::generate_dtls_secret,
};

/// Everything the external authenticator must provide before the tunnel can
/// be opened. It must *not* have started the CSTP upgrade itself.
#[derive(Debug, Clone)]
pub struct AuthHandoff {
    pub hostname: String,
    pub port: u16,
    pub cookie: String,
}

/// DTLS parameters negotiated during the CSTP upgrade. Present only when
/// the gateway answered with a session id, port and cipher suite.
#[derive(Debug, Clone)]
pub struct DtlsNegotiation {
    pub port: u16,
    pub session_id: Vec<u8>,
    pub cipher: String,
    pub dpd: u64,
    pub keepalive: u64,
    pub rekey: u64,
}

#[derive(Debug)]
pub struct Session {
    pub hostname: String,
    pub port: u16,
    pub cookie: String,
    pub useragent: String,
    pub localname: String,

    /// MTU requested in the upgrade; `mtu` below is what the gateway
    /// granted.
    pub req_mtu: u16,
    pub mtu: u16,

    /// Whether deflate is offered in the upgrade request.
    pub deflate_requested: bool,
    /// Present only while the gateway accepted the deflate offer.
    pub compress: Option<CompressionPipeline>,

    pub vpn_addr: Option<Ipv4Addr>,
    pub vpn_netmask: Option<Ipv4Addr>,
    pub vpn_dns: Vec<IpAddr>,
    pub vpn_nbns: Vec<IpAddr>,
    pub vpn_domain: Option<String>,

    /// Negotiated options exactly as the gateway sent them, in order.
    pub cstp_options: OptionSet,
    pub dtls_options: OptionSet,

    pub ingress: PktQueue,
    pub egress: PktQueue,
    pub max_qlen: usize,

    /// Client-generated master secret offered for DTLS resumption; constant
    /// for the lifetime of the session, re-sent on every reconnect.
    pub dtls_secret: [u8; 48],
    pub dtls_secret_hex: String,
    pub dtls: Option<DtlsNegotiation>,

    /// Set once; the first reason wins and stops the engine loop.
    pub quit_reason: Option<String>,
    /// The peer initiated the shutdown, so no DISCONN is owed.
    pub server_initiated: bool,
    /// Quit came from an operator signal rather than a failure.
    pub quit_clean: bool,

    /// Injected signal flag: cancelling aborts any pending I/O and stops
    /// the loop with `cancel_reason`.
    pub cancel: CancellationToken,
    pub cancel_reason: Arc<OnceCell<String>>,
}

impl Session {
    /// Builds the session from the authenticator hand-off and local
    /// configuration. The CSTP tunnel is not yet open at this point.
    pub fn from_auth(handoff: AuthHandoff, cfg: &Config) -> Self {
        let (dtls_secret, dtls_secret_hex) = generate_dtls_secret();
        Self {
            hostname: handoff.hostname,
            port: handoff.port,
            cookie: handoff.cookie,
            useragent: cfg.vpn.useragent.clone(),
            localname: cfg.local_hostname(),
            req_mtu: cfg.tunnel.mtu,
            mtu: cfg.tunnel.mtu,
            deflate_requested: cfg.tunnel.deflate,
            compress: None,
            vpn_addr: None,
            vpn_netmask: None,
            vpn_dns: Vec::new(),
            vpn_nbns: Vec::new(),
            vpn_domain: None,
            cstp_options: OptionSet::new(),
            dtls_options: OptionSet::new(),
            ingress: PktQueue::new(),
            egress: PktQueue::new(),
            max_qlen: cfg.tunnel.max_qlen,
            dtls_secret,
            dtls_secret_hex,
            dtls: None,
            quit_reason: None,
            server_initiated: false,
            quit_clean: false,
            cancel: CancellationToken::new(),
            cancel_reason: Arc::new(OnceCell::new()),
        }
    }

    /// Records the terminal reason; only the first caller wins.
    pub fn set_quit(&mut self, reason: impl Into<String>) {
        if self.quit_reason.is_none() {
            self.quit_reason = Some(reason.into());
        }
    }

    /// True while the egress queue has room for another tun packet.
    #[inline]
    pub fn egress_has_room(&self) -> bool {
        self.egress.len() < self.max_qlen
    }
}
