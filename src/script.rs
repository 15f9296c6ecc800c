// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Invocation of the external vpnc-style network-configuration script.
//!
//! The script owns routing, resolver updates and firewall plumbing; this
//! client only hands it the negotiated parameters through the conventional
//! environment variables, once with `reason=connect` after the interface is
//! up and once with `reason=disconnect` at shutdown. A failing script is
//! reported but never takes the tunnel down.

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::client::session::Session;

pub async fn run_script(
    sess: &Session,
    script: &str,
    ifname: &str,
    reason: &str,
) -> Result<()> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(script);

    cmd.env("TUNDEV", ifname)
        .env("reason", reason)
        .env("VPNGATEWAY", &sess.hostname);

    if let Some(addr) = sess.vpn_addr {
        cmd.env("INTERNAL_IP4_ADDRESS", addr.to_string());
    }
    if let Some(mask) = sess.vpn_netmask {
        cmd.env("INTERNAL_IP4_NETMASK", mask.to_string());
    }
    if !sess.vpn_dns.is_empty() {
        cmd.env("INTERNAL_IP4_DNS", join_addrs(&sess.vpn_dns));
    }
    if !sess.vpn_nbns.is_empty() {
        cmd.env("INTERNAL_IP4_NBNS", join_addrs(&sess.vpn_nbns));
    }
    if let Some(domain) = &sess.vpn_domain {
        cmd.env("CISCO_DEF_DOMAIN", domain);
    }

    debug!("running script {script:?} with reason={reason}");
    let status = cmd
        .status()
        .await
        .with_context(|| format!("failed to spawn script {script:?}"))?;
    if !status.success() {
        warn!("script {script:?} exited with {status} (reason={reason})");
    }
    Ok(())
}

fn join_addrs(addrs: &[std::net::IpAddr]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
