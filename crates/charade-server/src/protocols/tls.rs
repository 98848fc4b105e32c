//! TLS setup for HTTPS imposters: PEM loading, mutual auth wiring, and
//! self-signed certificate generation.

use crate::imposter::ImposterConfig;
use anyhow::{anyhow, bail, Context};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// What an HTTPS imposter serves with, plus the fingerprint the control
/// plane exposes. The private key never leaves this module's callers.
pub struct TlsMaterial {
    pub acceptor: TlsAcceptor,
    pub fingerprint: String,
}

fn parse_certs(pem: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<_, _>>()
        .context("failed to parse certificate PEM")?;
    if certs.is_empty() {
        bail!("no certificates found in PEM");
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .context("failed to parse private key PEM")?
        .ok_or_else(|| anyhow!("no private key found in PEM"))
}

/// SHA-256 over the DER certificate, as 64 lowercase hex chars.
pub fn fingerprint(cert: &CertificateDer) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, cert.as_ref());
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Generate a self-signed RSA-2048 certificate for localhost, valid 365
/// days; returns (cert PEM, key PEM).
pub fn generate_self_signed() -> anyhow::Result<(String, String)> {
    use chrono::Datelike;
    use rcgen::{CertificateParams, DistinguishedName, DnType, SanType};
    use rsa::pkcs8::EncodePrivateKey;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    // rcgen signs with an imported RSA key but does not generate one
    let mut rng = rand::thread_rng();
    let rsa_key =
        rsa::RsaPrivateKey::new(&mut rng, 2048).context("RSA key generation failed")?;
    let key_der = rsa_key
        .to_pkcs8_der()
        .context("PKCS#8 encoding of the generated key failed")?;
    let pkcs8 = rustls::pki_types::PrivatePkcs8KeyDer::from(key_der.as_bytes().to_vec());
    let key = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256)
        .context("importing the generated RSA key failed")?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "localhost");
    params.distinguished_name = dn;
    params.subject_alt_names = vec![
        SanType::DnsName("localhost".try_into()?),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];

    // day clamped to 28 so the one-year shift stays a valid date
    let now = chrono::Utc::now();
    let day = now.day().min(28) as u8;
    params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, day);
    params.not_after = rcgen::date_time_ymd(now.year() + 1, now.month() as u8, day);

    let cert = params.self_signed(&key).context("self-signing failed")?;
    Ok((cert.pem(), key.serialize_pem()))
}

/// Build the TLS acceptor for an HTTPS imposter from its configuration,
/// generating a self-signed certificate when none is provided.
pub fn build(config: &ImposterConfig) -> anyhow::Result<TlsMaterial> {
    let (cert_pem, key_pem) = match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => (cert.clone(), key.clone()),
        _ => generate_self_signed()?,
    };

    let certs = parse_certs(&cert_pem)?;
    let key = parse_key(&key_pem)?;
    let fingerprint = fingerprint(&certs[0]);

    let builder = rustls::ServerConfig::builder();
    let server_config = if config.mutual_auth {
        let mut roots = RootCertStore::empty();
        if config.ca.is_empty() {
            // no CA list: trust our own certificate chain
            for cert in &certs {
                roots.add(cert.clone()).context("adding own cert as CA")?;
            }
        } else {
            for pem in &config.ca {
                for cert in parse_certs(pem)? {
                    roots.add(cert).context("adding configured CA")?;
                }
            }
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots));
        let verifier = if config.reject_unauthorized {
            verifier.build()?
        } else {
            verifier.allow_unauthenticated().build()?
        };
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)?
    };

    Ok(TlsMaterial {
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
        fingerprint,
    })
}
