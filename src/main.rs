// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyconnect_client_rs::{
    cfg::{config::Config, logger::init_logger},
    client::{
        cstp::CstpChannel,
        dtls::{DtlsChannel, WebrtcDtlsFactory},
        engine::{EngineOpts, VpnEngine, spawn_signal_watcher},
        session::{AuthHandoff, Session},
        tls::{CstpConnector, TlsCstpConnector},
        tun_dev::TunEndpoint,
    },
    script::run_script,
};
use anyhow::{Context, Result};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.yaml".to_string());
    let logger_path = args.next().unwrap_or_else(|| "config_logger.yaml".to_string());

    let _init_logger = init_logger(&logger_path)?;

    let config_path = std::fs::canonicalize(&config_path)
        .with_context(|| format!("failed to resolve config path {config_path:?}"))?;
    let cfg = Config::load_from_file(&config_path)?;

    // The authentication front-end hands over hostname + cookie; this
    // binary reads that hand-off from the config.
    let cookie = cfg.resolve_cookie()?;
    let mut sess = Session::from_auth(
        AuthHandoff {
            hostname: cfg.vpn.hostname.clone(),
            port: cfg.vpn.port,
            cookie,
        },
        &cfg,
    );

    spawn_signal_watcher(sess.cancel.clone(), sess.cancel_reason.clone())?;

    let connector = TlsCstpConnector::from_config(&cfg)?;
    let stream = connector.connect(&sess.hostname, sess.port).await?;
    let cstp = CstpChannel::upgrade(stream, &mut sess).await?;

    let tun = TunEndpoint::setup(&sess, cfg.tunnel.ifname.as_deref())?;
    if let Some(script) = &cfg.script.path {
        run_script(&sess, script, tun.ifname(), "connect").await?;
    }

    let dtls = DtlsChannel::new(Arc::new(WebrtcDtlsFactory), cfg.dtls.attempt_period);

    let engine = VpnEngine::new(
        sess,
        cstp,
        dtls,
        tun,
        connector,
        EngineOpts::from_config(&cfg),
    );

    let reason = engine.run().await?;
    info!("Session finished: {reason}");
    Ok(())
}
