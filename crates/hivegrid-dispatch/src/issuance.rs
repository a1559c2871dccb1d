//! Certificate issuance for tasks.
//!
//! Loads a CA's PEM material, generates a fresh keypair, and signs a
//! leaf certificate for the task's host set. The signed bundle is
//! emitted as materialized configs; nothing touches the store.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use thiserror::Error;

use hivegrid_state::CertificateAuthority;

/// Leaf certificates are valid for at most one year.
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Root CA certificates are valid for ten years.
const ROOT_VALIDITY_DAYS: i64 = 3650;

#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("certificate authority material is not valid PEM")]
    InvalidCaMaterial,

    #[error("invalid certificate host {0:?}")]
    InvalidHost(String),

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
}

/// A certificate bundle issued to one task.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM-encoded CA certificate (as stored).
    pub ca_pem: Vec<u8>,
    /// PEM-encoded private key of the new leaf.
    pub key_pem: Vec<u8>,
    /// PEM-encoded signed leaf certificate.
    pub cert_pem: Vec<u8>,
}

/// Generate a self-signed root CA certificate and key.
pub fn generate_ca(name: &str) -> Result<(Vec<u8>, Vec<u8>), IssuanceError> {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        format!("{name} Root Certificate Authority"),
    );
    params.distinguished_name = dn;
    params.not_after =
        time::OffsetDateTime::now_utc() + time::Duration::days(ROOT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok((
        cert.pem().into_bytes(),
        key_pair.serialize_pem().into_bytes(),
    ))
}

/// Sign a leaf certificate for `hosts` with the given CA.
///
/// The CA's stored certificate and key are rebuilt into an in-memory
/// signer; the caller gets back the CA certificate as stored, plus the
/// new key and signed certificate.
pub fn issue_certificate(
    ca: &CertificateAuthority,
    common_name: &str,
    hosts: &[String],
) -> Result<IssuedCertificate, IssuanceError> {
    let ca_cert_pem =
        std::str::from_utf8(&ca.cert).map_err(|_| IssuanceError::InvalidCaMaterial)?;
    let ca_key_pem = std::str::from_utf8(&ca.key).map_err(|_| IssuanceError::InvalidCaMaterial)?;

    let ca_key = KeyPair::from_pem(ca_key_pem)?;
    let ca_params = CertificateParams::from_ca_cert_pem(ca_cert_pem)?;
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    for host in hosts {
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            let dns = host
                .clone()
                .try_into()
                .map_err(|_| IssuanceError::InvalidHost(host.clone()))?;
            params.subject_alt_names.push(SanType::DnsName(dns));
        }
    }

    params.not_after =
        time::OffsetDateTime::now_utc() + time::Duration::days(LEAF_VALIDITY_DAYS);

    let leaf_key = KeyPair::generate()?;
    let leaf_cert = params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

    Ok(IssuedCertificate {
        ca_pem: ca.cert.clone(),
        key_pem: leaf_key.serialize_pem().into_bytes(),
        cert_pem: leaf_cert.pem().into_bytes(),
    })
}
