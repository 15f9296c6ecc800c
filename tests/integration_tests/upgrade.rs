// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyconnect_client_rs::client::cstp::CstpChannel;
use anyhow::Result;

use crate::integration_tests::common::{accept_upgrade, make_session, test_config};

const FULL_HEADERS: &[(&str, &str)] = &[
    ("X-CSTP-Version", "1"),
    ("X-CSTP-Address", "10.20.0.5"),
    ("X-CSTP-Netmask", "255.255.255.0"),
    ("X-CSTP-DNS", "10.20.0.1"),
    ("X-CSTP-DNS", "10.20.0.2"),
    ("X-CSTP-DNS", "10.20.0.3"),
    ("X-CSTP-DNS", "10.20.0.4"),
    ("X-CSTP-NBNS", "10.20.0.9"),
    ("X-CSTP-Default-Domain", "inside.example"),
    ("X-CSTP-MTU", "1300"),
    ("X-CSTP-DPD", "30"),
    ("X-CSTP-Keepalive", "20"),
    ("X-CSTP-Rekey-Time", "3600"),
    ("X-CSTP-Content-Encoding", "deflate"),
    ("X-CSTP-Quarantine-Bleep", "opaque-value"),
    ("X-DTLS-Port", "4433"),
    (
        "X-DTLS-Session-ID",
        "4242424242424242424242424242424242424242424242424242424242424242",
    ),
    ("X-DTLS-CipherSuite", "PSK-NEGOTIATE"),
    ("X-DTLS-DPD", "25"),
    ("X-DTLS-Keepalive", "15"),
];

#[tokio::test]
async fn test_upgrade_negotiates_session() -> Result<()> {
    let cfg = test_config(true);
    let mut sess = make_session(&cfg);

    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let gateway = tokio::spawn(async move {
        let req = accept_upgrade(&mut server, FULL_HEADERS).await?;
        Ok::<_, anyhow::Error>(req)
    });

    let _channel = CstpChannel::upgrade(client, &mut sess).await?;
    let request = gateway.await??;

    // Request side carries the hand-off and the DTLS resumption offer.
    assert!(request.contains("Cookie: webvpn=deadbeef\r\n"));
    assert!(request.contains("X-CSTP-Version: 1\r\n"));
    assert!(request.contains("X-CSTP-Hostname: testhost\r\n"));
    assert!(request.contains("X-CSTP-MTU: 1406\r\n"));
    assert!(request.contains("X-CSTP-Accept-Encoding: deflate;q=1.0\r\n"));
    assert!(request.contains(&format!(
        "X-DTLS-Master-Secret: {}\r\n",
        sess.dtls_secret_hex
    )));

    // Derived addressing.
    assert_eq!(sess.vpn_addr, Some("10.20.0.5".parse()?));
    assert_eq!(sess.vpn_netmask, Some("255.255.255.0".parse()?));
    assert_eq!(sess.vpn_domain.as_deref(), Some("inside.example"));
    assert_eq!(sess.mtu, 1300);

    // Repeatable headers are capped at three entries.
    assert_eq!(sess.vpn_dns.len(), 3);
    assert_eq!(sess.vpn_nbns.len(), 1);

    // Deflate was offered and accepted.
    assert!(sess.compress.is_some());

    // DTLS negotiation extracted from the X-DTLS-* set.
    let dtls = sess.dtls.as_ref().expect("DTLS negotiated");
    assert_eq!(dtls.port, 4433);
    assert_eq!(dtls.session_id, vec![0x42; 32]);
    assert_eq!(dtls.cipher, "PSK-NEGOTIATE");
    assert_eq!(dtls.dpd, 25);
    assert_eq!(dtls.keepalive, 15);

    // Option vectors keep everything verbatim, in order, unknowns included.
    let names: Vec<&str> =
        sess.cstp_options.iter().map(|o| o.option.as_str()).collect();
    assert_eq!(names[0], "X-CSTP-Version");
    assert_eq!(names[names.len() - 1], "X-CSTP-Quarantine-Bleep");
    assert_eq!(
        sess.cstp_options.get("X-CSTP-Quarantine-Bleep"),
        Some("opaque-value")
    );
    assert_eq!(sess.cstp_options.get_all("X-CSTP-DNS").count(), 4);

    Ok(())
}

#[tokio::test]
async fn test_upgrade_without_deflate_offer() -> Result<()> {
    let cfg = test_config(false);
    let mut sess = make_session(&cfg);

    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let gateway = tokio::spawn(async move {
        let req = accept_upgrade(&mut server, &[
            ("X-CSTP-Address", "10.20.0.5"),
            ("X-CSTP-Netmask", "255.255.255.0"),
        ])
        .await?;
        Ok::<_, anyhow::Error>(req)
    });

    let _channel = CstpChannel::upgrade(client, &mut sess).await?;
    let request = gateway.await??;

    assert!(!request.contains("X-CSTP-Accept-Encoding"));
    assert!(sess.compress.is_none());
    assert!(sess.dtls.is_none());
    Ok(())
}

#[tokio::test]
async fn test_upgrade_refused_by_gateway() {
    use tokio::io::AsyncWriteExt;

    let cfg = test_config(false);
    let mut sess = make_session(&cfg);

    let (client, mut server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let mut sink = [0u8; 512];
        use tokio::io::AsyncReadExt;
        let _ = server.read(&mut sink).await;
        let _ = server
            .write_all(b"HTTP/1.1 503 Service Unavailable\r\n\r\n")
            .await;
    });

    let err = CstpChannel::upgrade(client, &mut sess)
        .await
        .expect_err("503 must refuse the upgrade");
    assert!(err.to_string().contains("refused"), "got: {err}");
}
