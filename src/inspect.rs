//! Certificate inspection.
//!
//! Turns a stored certificate into a flat [`CertificateDetails`] record. Only
//! the public certificate is read; private keys never pass through here.

use crate::error::{CryptoContext, Result};
use crate::pki_generator::{common_name_of, serial_hex};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::x509::X509Ref;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const SECONDS_PER_DAY: i64 = 86_400;

/// How a certificate relates to the CA it names as issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssuerStatus {
    /// A CA certificate; it is its own issuer.
    SelfSigned,
    /// The named CA exists and its key verifies the signature.
    Resolved,
    /// The named CA is no longer in the store.
    Orphaned,
    /// A CA with the issuer's name exists but did not sign this certificate.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDetails {
    pub identifier: String,
    pub subject_common_name: String,
    pub issuer_common_name: String,
    pub not_before: String,
    pub not_after: String,
    pub not_before_unix: i64,
    pub not_after_unix: i64,
    pub serial_number: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub sha256_fingerprint: String,
    pub issuer_status: IssuerStatus,
}

/// Describe `certificate`.
///
/// For a CA pass `self_signed = true`. For a device certificate `issuer` is
/// the stored certificate of the CA named in its identifier, if any.
pub fn describe(
    identifier: &str,
    certificate: &X509Ref,
    self_signed: bool,
    issuer: Option<&X509Ref>,
) -> Result<CertificateDetails> {
    let issuer_status = if self_signed {
        IssuerStatus::SelfSigned
    } else {
        issuer_status(certificate, issuer)
    };

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Some(names) = certificate.subject_alt_names() {
        for name in names.iter() {
            if let Some(dns) = name.dnsname() {
                dns_names.push(dns.to_string());
            } else if let Some(ip) = name.ipaddress().and_then(ip_from_bytes) {
                ip_addresses.push(ip);
            }
        }
    }

    let details = CertificateDetails {
        identifier: identifier.to_string(),
        subject_common_name: common_name_of(certificate.subject_name()).unwrap_or_default(),
        issuer_common_name: common_name_of(certificate.issuer_name()).unwrap_or_default(),
        not_before: certificate.not_before().to_string(),
        not_after: certificate.not_after().to_string(),
        not_before_unix: asn1_to_unix(certificate.not_before())?,
        not_after_unix: asn1_to_unix(certificate.not_after())?,
        serial_number: serial_hex(certificate.serial_number())?,
        dns_names,
        ip_addresses,
        sha256_fingerprint: sha256_fingerprint(certificate)?,
        issuer_status,
    };
    tracing::debug!(identifier, status = ?details.issuer_status, "inspected certificate");
    Ok(details)
}

/// Resolve the relationship between a device certificate and its named CA.
pub fn issuer_status(certificate: &X509Ref, issuer: Option<&X509Ref>) -> IssuerStatus {
    let Some(issuer) = issuer else {
        return IssuerStatus::Orphaned;
    };
    if verifies(certificate, issuer) {
        IssuerStatus::Resolved
    } else {
        IssuerStatus::Superseded
    }
}

/// `issuer`'s public key verifies `certificate`'s signature.
pub fn verifies(certificate: &X509Ref, issuer: &X509Ref) -> bool {
    issuer
        .public_key()
        .and_then(|key| certificate.verify(&key))
        .unwrap_or(false)
}

/// Upper-case hex SHA-256 over the DER encoding.
pub fn sha256_fingerprint(certificate: &X509Ref) -> Result<String> {
    let der = certificate.to_der().crypto_context("encode certificate")?;
    Ok(hex::encode_upper(Sha256::digest(&der)))
}

fn asn1_to_unix(time: &Asn1TimeRef) -> Result<i64> {
    let epoch = Asn1Time::from_unix(0).crypto_context("create epoch")?;
    let diff = epoch.diff(time).crypto_context("compare timestamps")?;
    Ok(i64::from(diff.days) * SECONDS_PER_DAY + i64::from(diff.secs))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes)
            .ok()
            .map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes)
            .ok()
            .map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_device_cert::RsaDeviceCertBuilder;
    use crate::generate_root_ca::RsaRootCABuilder;
    use crate::pki_generator::{generate_rsa_key, SubjectFields, ValidityWindow};
    use crate::san::SanList;
    use openssl::pkey::{PKey, Private};
    use openssl::x509::X509;

    fn ca(cn: &str) -> (PKey<Private>, X509) {
        let key = generate_rsa_key(2048).unwrap();
        let cert = RsaRootCABuilder::new(SubjectFields::new(cn))
            .validity(ValidityWindow::starting_at(1_700_000_000, 3650).unwrap())
            .build(&key)
            .unwrap();
        (key, cert)
    }

    #[test]
    fn test_describe_ca() {
        let (_key, cert) = ca("Root-A");
        let details = describe("Root-A", &cert, true, None).unwrap();
        assert_eq!(details.subject_common_name, "Root-A");
        assert_eq!(details.issuer_common_name, "Root-A");
        assert_eq!(details.not_before_unix, 1_700_000_000);
        assert_eq!(details.not_after_unix - details.not_before_unix, 3650 * 86_400);
        assert_eq!(details.issuer_status, IssuerStatus::SelfSigned);
        assert_eq!(details.sha256_fingerprint.len(), 64);
        assert!(details.dns_names.is_empty());
    }

    #[test]
    fn test_describe_leaf_sans() {
        let (ca_key, ca_cert) = ca("Root-A");
        let device_key = generate_rsa_key(2048).unwrap();
        let leaf = RsaDeviceCertBuilder::new(&ca_key, &ca_cert)
            .subject_common_name("device1.local")
            .subject_alt_names(SanList::parse("device1.local,10.0.0.5,fe80::1"))
            .build(&device_key)
            .unwrap();

        let details = describe(
            "device1.local_signed-by_Root-A",
            &leaf,
            false,
            Some(&ca_cert),
        )
        .unwrap();
        assert_eq!(details.issuer_common_name, "Root-A");
        assert_eq!(details.dns_names, vec!["device1.local"]);
        assert_eq!(
            details.ip_addresses,
            vec![
                "10.0.0.5".parse::<IpAddr>().unwrap(),
                "fe80::1".parse::<IpAddr>().unwrap()
            ]
        );
        assert_eq!(details.issuer_status, IssuerStatus::Resolved);
    }

    #[test]
    fn test_issuer_status() {
        let (ca_key, ca_cert) = ca("Root-A");
        let (_other_key, replacement) = ca("Root-A");
        let device_key = generate_rsa_key(2048).unwrap();
        let leaf = RsaDeviceCertBuilder::new(&ca_key, &ca_cert)
            .subject_common_name("nas.lan")
            .build(&device_key)
            .unwrap();

        assert_eq!(issuer_status(&leaf, Some(&ca_cert)), IssuerStatus::Resolved);
        assert_eq!(issuer_status(&leaf, None), IssuerStatus::Orphaned);
        assert_eq!(
            issuer_status(&leaf, Some(&replacement)),
            IssuerStatus::Superseded
        );
    }

    #[test]
    fn test_status_serialises_kebab_case() {
        let json = serde_json::to_string(&IssuerStatus::SelfSigned).unwrap();
        assert_eq!(json, "\"self-signed\"");
    }
}
