// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Local tun endpoint.
//!
//! Reads and writes whole IP packets against the kernel virtual interface.
//! The endpoint never queues internally: an egress packet goes straight
//! onto the session's egress queue, and the engine stops calling
//! [`TunEndpoint::read_packet`] while that queue is full, which is the
//! backpressure mechanism (the kernel keeps the packet until we read).
//!
//! Generic over the device stream so tests can substitute a duplex pipe;
//! production uses the async `tun` device.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    client::session::Session,
    models::packet::{Pkt, PktType},
};

#[derive(Debug)]
pub struct TunEndpoint<T> {
    dev: T,
    mtu: usize,
    ifname: String,
}

impl TunEndpoint<tun::AsyncDevice> {
    /// Creates and configures the kernel interface from the session's
    /// negotiated addressing, bringing it up.
    pub fn setup(sess: &Session, ifname: Option<&str>) -> Result<Self> {
        let addr = sess
            .vpn_addr
            .context("gateway assigned no address; cannot configure tun")?;
        let netmask = sess
            .vpn_netmask
            .unwrap_or(std::net::Ipv4Addr::new(255, 255, 255, 255));

        let mut config = tun::Configuration::default();
        config
            .address(addr)
            .netmask(netmask)
            .mtu(i32::from(sess.mtu))
            .up();
        if let Some(name) = ifname {
            config.name(name);
        }
        #[cfg(target_os = "linux")]
        config.platform(|c| {
            c.packet_information(false);
        });

        let dev = tun::create_as_async(&config)
            .context("failed to open tun device (are we root?)")?;
        let name = {
            use tun::Device as _;
            dev.get_ref()
                .name()
                .context("failed to read tun interface name")?
        };
        debug!("tun interface {name} up: {addr}/{netmask}, mtu {}", sess.mtu);

        Ok(Self {
            dev,
            mtu: sess.mtu as usize,
            ifname: name,
        })
    }
}

impl<T> TunEndpoint<T>
where T: AsyncRead + AsyncWrite + Unpin + Send
{
    pub fn new(dev: T, mtu: usize, ifname: impl Into<String>) -> Self {
        Self {
            dev,
            mtu,
            ifname: ifname.into(),
        }
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Pulls one egress IP packet. `Ok(None)` means the packet exceeded
    /// the tunnel MTU and was rejected at the boundary.
    pub async fn read_packet(&mut self) -> Result<Option<Pkt>> {
        let mut buf = vec![0u8; self.mtu + 1];
        let n = self.dev.read(&mut buf).await?;
        if n == 0 {
            bail!("tun device closed");
        }
        if n > self.mtu {
            warn!("dropping {n}-byte packet over tunnel MTU {}", self.mtu);
            return Ok(None);
        }
        Ok(Some(Pkt::new(PktType::Data, &buf[..n])))
    }

    /// Delivers one ingress IP payload to the interface. Partial writes are
    /// unusual on tun devices but are completed here regardless.
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        self.dev
            .write_all(payload)
            .await
            .context("failed to write packet to tun")?;
        Ok(())
    }
}
