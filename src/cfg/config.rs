// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{TlsVerify, yes_no};

/// Requested tunnel MTU when the config does not override it.
pub const MTU_DEFAULT: u16 = 1406;
/// Egress queue cap; tun reads stall while the queue is at this length.
pub const MAX_QLEN_DEFAULT: usize = 10;
/// Total budget for CSTP reconnect attempts, in seconds.
pub const RECONNECT_TIMEOUT_DEFAULT: u64 = 300;
/// Pause between DTLS attempts while the channel is closed, in seconds.
pub const DTLS_ATTEMPT_PERIOD_DEFAULT: u64 = 60;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Gateway identity and the session hand-off from the authenticator.
    pub vpn: VpnConfig,
    /// Tunnel data-path parameters.
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Datagram transport parameters.
    #[serde(default)]
    pub dtls: DtlsConfig,
    /// Server certificate verification.
    #[serde(default)]
    pub tls: TlsConfig,
    /// External network-configuration script.
    #[serde(default)]
    pub script: ScriptConfig,
    /// Implementation/runtime parameters that never travel on the wire.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Where to connect and who we claim to be.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct VpnConfig {
    #[serde(rename = "Hostname")]
    /// Gateway host name or address (mandatory).
    pub hostname: String,

    #[serde(default = "default_port", rename = "Port")]
    pub port: u16,

    #[serde(default = "default_useragent", rename = "UserAgent")]
    pub useragent: String,

    #[serde(default, rename = "LocalHostname")]
    /// Value for `X-CSTP-Hostname`; falls back to `$HOSTNAME`.
    pub localname: Option<String>,

    #[serde(default, rename = "Cookie")]
    /// Inline `webvpn` session cookie produced by the authenticator.
    pub cookie: Option<String>,

    #[serde(default, rename = "CookieFile")]
    /// File holding the cookie, one line; preferred over `Cookie` for
    /// anything beyond lab use.
    pub cookie_file: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TunnelConfig {
    #[serde(default = "default_mtu", rename = "Mtu")]
    /// Requested MTU; the gateway may negotiate it down.
    pub mtu: u16,

    #[serde(default = "default_yes", rename = "Deflate", with = "yes_no")]
    /// Offer deflate compression during the CSTP handshake; written
    /// "Yes"/"No" in the config.
    pub deflate: bool,

    #[serde(default = "default_max_qlen", rename = "MaxQueueLen")]
    /// Egress queue cap.
    pub max_qlen: usize,

    #[serde(default = "default_reconnect_timeout", rename = "ReconnectTimeout")]
    /// Give up on CSTP reconnection after this many seconds.
    pub reconnect_timeout: u64,

    #[serde(default, rename = "IfName")]
    /// Tun interface name; the platform picks one when unset.
    pub ifname: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DtlsConfig {
    #[serde(default = "default_attempt_period", rename = "AttemptPeriod")]
    /// Seconds between DTLS attempts while closed; 0 disables DTLS.
    pub attempt_period: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default, rename = "Verify")]
    pub verify: TlsVerify,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ScriptConfig {
    #[serde(default, rename = "Path")]
    /// vpnc-style script run at connect and disconnect; nothing runs when
    /// unset.
    pub path: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_connect_timeout", rename = "ConnectTimeoutSecs")]
    /// TCP + TLS connect budget per attempt, in seconds.
    pub connect_timeout: u64,
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("failed to read config file {:?}", path.as_ref())
        })?;
        let cfg: Config = serde_yaml::from_str(&raw).with_context(|| {
            format!("failed to parse config file {:?}", path.as_ref())
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.vpn.hostname.is_empty(), "vpn.Hostname must be set");
        ensure!(
            (576..=16384).contains(&self.tunnel.mtu),
            "tunnel.Mtu {} out of range 576..=16384",
            self.tunnel.mtu
        );
        ensure!(self.tunnel.max_qlen >= 1, "tunnel.MaxQueueLen must be >= 1");
        Ok(())
    }

    /// Resolves the session cookie from the configured hand-off point:
    /// inline value, cookie file, or the `CSTP_COOKIE` environment variable.
    pub fn resolve_cookie(&self) -> Result<String> {
        if let Some(c) = &self.vpn.cookie {
            return Ok(c.trim().to_string());
        }
        if let Some(path) = &self.vpn.cookie_file {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read cookie file {path}"))?;
            let cookie = raw.trim();
            ensure!(!cookie.is_empty(), "cookie file {path} is empty");
            return Ok(cookie.to_string());
        }
        if let Ok(c) = std::env::var("CSTP_COOKIE") {
            return Ok(c.trim().to_string());
        }
        bail!("no session cookie: set vpn.Cookie, vpn.CookieFile or $CSTP_COOKIE")
    }

    /// Local hostname advertised in `X-CSTP-Hostname`.
    pub fn local_hostname(&self) -> String {
        self.vpn
            .localname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.connect_timeout)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            deflate: default_yes(),
            max_qlen: default_max_qlen(),
            reconnect_timeout: default_reconnect_timeout(),
            ifname: None,
        }
    }
}

impl Default for DtlsConfig {
    fn default() -> Self {
        Self {
            attempt_period: default_attempt_period(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_port() -> u16 {
    443
}

fn default_useragent() -> String {
    "Open AnyConnect VPN Agent".to_string()
}

fn default_mtu() -> u16 {
    MTU_DEFAULT
}

fn default_yes() -> bool {
    true
}

fn default_max_qlen() -> usize {
    MAX_QLEN_DEFAULT
}

fn default_reconnect_timeout() -> u64 {
    RECONNECT_TIMEOUT_DEFAULT
}

fn default_attempt_period() -> u64 {
    DTLS_ATTEMPT_PERIOD_DEFAULT
}

fn default_connect_timeout() -> u64 {
    30
}
