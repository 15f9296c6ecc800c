// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! With DTLS running, data traffic leaves on the datagram path and the TLS
//! channel stays quiet.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use anyconnect_client_rs::{
    client::{
        cstp::CstpChannel,
        dtls::{Datagram, DtlsChannel},
        engine::{EngineOpts, VpnEngine},
        tun_dev::TunEndpoint,
    },
    models::packet::PktType,
};
use anyhow::Result;
use tokio::{io::AsyncWriteExt, time::timeout};

use crate::integration_tests::common::{
    BASE_HEADERS, ChanDatagram, DTLS_HEADERS, DuplexConnector, TEST_MTU,
    TestDtlsFactory, accept_upgrade, make_session, read_frame, test_config,
};

fn headers_with_dtls() -> Vec<(&'static str, &'static str)> {
    BASE_HEADERS.iter().chain(DTLS_HEADERS).copied().collect()
}

#[tokio::test]
async fn test_data_prefers_dtls_when_running() -> Result<()> {
    let cfg = test_config(false);
    let mut sess = make_session(&cfg);
    let cancel = sess.cancel.clone();

    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let acceptor = tokio::spawn(async move {
        let headers = headers_with_dtls();
        accept_upgrade(&mut server, &headers).await?;
        Ok::<_, anyhow::Error>(server)
    });
    let cstp = CstpChannel::upgrade(client, &mut sess).await?;
    let mut gateway = acceptor.await??;
    assert!(sess.dtls.is_some(), "gateway offered DTLS");

    let (client_dg, server_dg) = ChanDatagram::pair();
    let factory = TestDtlsFactory::new(vec![client_dg]);
    let calls = factory.calls.clone();

    let (tun_dev, mut tun_peer) = tokio::io::duplex(64 * 1024);
    let engine = VpnEngine::new(
        sess,
        cstp,
        DtlsChannel::new(Arc::new(factory), 60),
        TunEndpoint::new(tun_dev, TEST_MTU as usize, "tun-test"),
        DuplexConnector::new(vec![]),
        EngineOpts {
            reconnect_timeout: Duration::from_secs(5),
            script: None,
        },
    );
    let run = tokio::spawn(engine.run());

    // Confirm the channel is up: a gateway DPD probe over the datagram
    // path gets its response on the datagram path.
    server_dg.send(&[PktType::DpdOut as u8]).await?;
    let mut buf = vec![0u8; 2048];
    let n = server_dg.recv(&mut buf).await?;
    assert_eq!(&buf[..n], &[PktType::DpdResp as u8]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Data from the tun device rides DTLS: one record, type byte 0, the
    // IP packet as payload.
    let ip_packet = b"ip packet over the datagram path";
    tun_peer.write_all(ip_packet).await?;

    let n = server_dg.recv(&mut buf).await?;
    assert_eq!(buf[0], PktType::Data as u8);
    assert_eq!(&buf[1..n], ip_packet);

    // And the TLS channel carried nothing meanwhile.
    let quiet = timeout(Duration::from_millis(200), read_frame(&mut gateway)).await;
    assert!(quiet.is_err(), "unexpected CSTP frame while DTLS is running");

    cancel.cancel();
    let _ = run.await?;
    Ok(())
}

#[tokio::test]
async fn test_dtls_ingress_reaches_tun() -> Result<()> {
    let cfg = test_config(false);
    let mut sess = make_session(&cfg);
    let cancel = sess.cancel.clone();

    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let acceptor = tokio::spawn(async move {
        let headers = headers_with_dtls();
        accept_upgrade(&mut server, &headers).await?;
        Ok::<_, anyhow::Error>(server)
    });
    let cstp = CstpChannel::upgrade(client, &mut sess).await?;
    let _gateway = acceptor.await??;

    let (client_dg, server_dg) = ChanDatagram::pair();
    let factory = TestDtlsFactory::new(vec![client_dg]);

    let (tun_dev, mut tun_peer) = tokio::io::duplex(64 * 1024);
    let engine = VpnEngine::new(
        sess,
        cstp,
        DtlsChannel::new(Arc::new(factory), 60),
        TunEndpoint::new(tun_dev, TEST_MTU as usize, "tun-test"),
        DuplexConnector::new(vec![]),
        EngineOpts {
            reconnect_timeout: Duration::from_secs(5),
            script: None,
        },
    );
    let run = tokio::spawn(engine.run());

    // Wait for RUNNING via a probe round-trip, then push a data record.
    server_dg.send(&[PktType::DpdOut as u8]).await?;
    let mut buf = vec![0u8; 2048];
    let _ = server_dg.recv(&mut buf).await?;

    let mut record = vec![PktType::Data as u8];
    record.extend_from_slice(b"gateway to tun via dtls");
    server_dg.send(&record).await?;

    use tokio::io::AsyncReadExt;
    let n = tun_peer.read(&mut buf).await?;
    assert_eq!(&buf[..n], b"gateway to tun via dtls");

    cancel.cancel();
    let _ = run.await?;
    Ok(())
}
