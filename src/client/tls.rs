// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HTTPS connector for the CSTP channel.
//!
//! Gateways in the field run everything from publicly-issued certificates
//! to ancient self-signed ones, so the trust decision is configurable:
//! platform roots, an operator CA bundle, a SHA-256 pin on the server
//! certificate, or no verification at all for lab setups.

use std::{fs::File, io::BufReader, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
};
use tracing::debug;

use crate::cfg::{config::Config, enums::TlsVerify};

/// Anything that can produce a fresh authenticated stream for the CSTP
/// upgrade. The engine uses it for the initial connect and for every
/// reconnect; tests substitute an in-process duplex stream.
pub trait CstpConnector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn connect(
        &self,
        hostname: &str,
        port: u16,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;
}

pub struct TlsCstpConnector {
    connector: tokio_rustls::TlsConnector,
    connect_timeout: Duration,
}

impl TlsCstpConnector {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let tls_config = match &cfg.tls.verify {
            TlsVerify::System => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            },
            TlsVerify::CaFile { path } => {
                let mut roots = rustls::RootCertStore::empty();
                let file = File::open(path)
                    .with_context(|| format!("failed to open CA file {path}"))?;
                let mut rd = BufReader::new(file);
                for cert in rustls_pemfile::certs(&mut rd) {
                    roots
                        .add(cert.with_context(|| format!("bad PEM in {path}"))?)
                        .with_context(|| format!("unusable CA cert in {path}"))?;
                }
                if roots.is_empty() {
                    bail!("CA file {path} contains no certificates");
                }
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            },
            TlsVerify::Pin { sha256 } => {
                let pin = hex::decode(sha256)
                    .context("tls.Verify.Sha256 is not valid hex")?;
                if pin.len() != 32 {
                    bail!("tls.Verify.Sha256 must be 32 bytes of hex");
                }
                rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(PinVerifier { pin }))
                    .with_no_client_auth()
            },
            TlsVerify::Insecure => rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth(),
        };

        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(tls_config)),
            connect_timeout: cfg.connect_timeout(),
        })
    }
}

impl CstpConnector for TlsCstpConnector {
    type Stream = tokio_rustls::client::TlsStream<TcpStream>;

    async fn connect(&self, hostname: &str, port: u16) -> Result<Self::Stream> {
        debug!("TLS negotiation with {hostname}:{port}");
        let tcp = timeout(self.connect_timeout, TcpStream::connect((hostname, port)))
            .await
            .with_context(|| format!("TCP connect to {hostname}:{port} timed out"))?
            .with_context(|| format!("TCP connect to {hostname}:{port} failed"))?;
        tcp.set_nodelay(true)?;

        let name = ServerName::try_from(hostname.to_string())
            .with_context(|| format!("invalid server name {hostname}"))?;
        let tls = timeout(self.connect_timeout, self.connector.connect(name, tcp))
            .await
            .with_context(|| format!("TLS handshake with {hostname} timed out"))?
            .with_context(|| format!("TLS handshake with {hostname} failed"))?;
        Ok(tls)
    }
}

/// Pins the end-entity certificate by SHA-256 digest of its DER encoding.
/// Chain and hostname are deliberately not checked: the pin is the trust
/// decision.
#[derive(Debug)]
struct PinVerifier {
    pin: Vec<u8>,
}

impl ServerCertVerifier for PinVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let digest = Sha256::digest(end_entity.as_ref());
        if digest.as_slice() == self.pin.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "server certificate does not match pin (got {})",
                hex::encode(digest)
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        supported_schemes()
    }
}

/// Accepts any certificate. Only reachable through an explicit
/// `Mode: Insecure` in the config.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        supported_schemes()
    }
}

fn supported_schemes() -> Vec<rustls::SignatureScheme> {
    vec![
        rustls::SignatureScheme::RSA_PKCS1_SHA256,
        rustls::SignatureScheme::RSA_PKCS1_SHA384,
        rustls::SignatureScheme::RSA_PKCS1_SHA512,
        rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
        rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
        rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
        rustls::SignatureScheme::RSA_PSS_SHA256,
        rustls::SignatureScheme::RSA_PSS_SHA384,
        rustls::SignatureScheme::RSA_PSS_SHA512,
        rustls::SignatureScheme::ED25519,
    ]
}
