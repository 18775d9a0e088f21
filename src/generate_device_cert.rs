//! Device Certificate Generation Module
//!
//! Builds end-entity certificates for hosts and devices, signed by one of the
//! locally managed CAs.
//!
//! # Certificate Properties
//! - **Basic Constraints**: CA=false, critical
//! - **Key Usage**: digitalSignature, keyEncipherment, critical
//! - **Extended Key Usage**: serverAuth, clientAuth
//! - **Subject Alternative Name**: DNS names and IP addresses from a [`SanList`]
//! - **Authority Key Identifier**: copied from the signing CA
//!
//! # Example
//! ```rust,no_run
//! # use openssl::pkey::{PKey, Private};
//! # use openssl::x509::X509;
//! use pki_forge::generate_device_cert::RsaDeviceCertBuilder;
//! use pki_forge::pki_generator::{generate_rsa_key, ValidityWindow};
//! use pki_forge::san::SanList;
//! # fn example(ca_key: PKey<Private>, ca_cert: X509) -> pki_forge::Result<()> {
//! let device_key = generate_rsa_key(2048)?;
//! let certificate = RsaDeviceCertBuilder::new(&ca_key, &ca_cert)
//!     .subject_common_name("device1.local")
//!     .subject_alt_names(SanList::parse("device1.local,10.0.0.5"))
//!     .validity(ValidityWindow::starting_now(730)?)
//!     .build(&device_key)?;
//! # Ok(())
//! # }
//! ```

use crate::error::{CryptoContext, Result};
use crate::pki_generator::{
    random_serial, validate_common_name, ValidityWindow, X509_VERSION_3,
};
use crate::san::{SanEntry, SanList};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509Ref, X509};

const DEFAULT_VALIDITY_DAYS: u32 = 730;

/// Builder for device certificates signed by a CA
pub struct RsaDeviceCertBuilder<'a> {
    subject_common_name: String,
    subject_alt_names: SanList,
    validity: Option<ValidityWindow>,
    serial: Option<BigNum>,
    signing_key: &'a PKeyRef<Private>,
    signing_cert: &'a X509Ref,
}

impl<'a> RsaDeviceCertBuilder<'a> {
    /// # Arguments
    /// * `ca_key` - the issuing CA's private key
    /// * `ca_cert` - the issuing CA's certificate (issuer name and key identifier)
    pub fn new(ca_key: &'a PKeyRef<Private>, ca_cert: &'a X509Ref) -> Self {
        Self {
            subject_common_name: String::new(),
            subject_alt_names: SanList::new(),
            validity: None,
            serial: None,
            signing_key: ca_key,
            signing_cert: ca_cert,
        }
    }

    pub fn subject_common_name(mut self, cn: impl Into<String>) -> Self {
        self.subject_common_name = cn.into();
        self
    }

    /// Set the SAN extension contents. An empty list omits the extension.
    pub fn subject_alt_names(mut self, sans: SanList) -> Self {
        self.subject_alt_names = sans;
        self
    }

    /// Defaults to two years from now.
    pub fn validity(mut self, window: ValidityWindow) -> Self {
        self.validity = Some(window);
        self
    }

    pub fn serial(mut self, serial: BigNum) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Assemble the certificate for `device_key` and sign it with the CA key.
    pub fn build(self, device_key: &PKey<Private>) -> Result<X509> {
        validate_common_name(&self.subject_common_name)?;
        let validity = match self.validity {
            Some(window) => window,
            None => ValidityWindow::starting_now(DEFAULT_VALIDITY_DAYS)?,
        };
        let serial = match self.serial {
            Some(serial) => serial,
            None => random_serial()?,
        };

        let mut builder = X509::builder().crypto_context("create X509 builder")?;
        builder
            .set_version(X509_VERSION_3)
            .crypto_context("set version")?;

        let asn1_serial = serial.to_asn1_integer().crypto_context("encode serial")?;
        builder
            .set_serial_number(&asn1_serial)
            .crypto_context("set serial")?;

        let mut name_builder = X509Name::builder().crypto_context("create name builder")?;
        name_builder
            .append_entry_by_nid(Nid::COMMONNAME, self.subject_common_name.trim())
            .crypto_context("set CN")?;
        let subject_name = name_builder.build();
        builder
            .set_subject_name(&subject_name)
            .crypto_context("set subject")?;

        // Issuer is the CA's subject
        builder
            .set_issuer_name(self.signing_cert.subject_name())
            .crypto_context("set issuer")?;

        let (not_before, not_after) = validity.asn1_times()?;
        builder
            .set_not_before(&not_before)
            .crypto_context("set not_before")?;
        builder
            .set_not_after(&not_after)
            .crypto_context("set not_after")?;

        builder
            .set_pubkey(device_key)
            .crypto_context("set public key")?;

        let bc = BasicConstraints::new()
            .critical()
            .build()
            .crypto_context("build BasicConstraints")?;
        builder
            .append_extension(bc)
            .crypto_context("add BasicConstraints")?;

        let ku = KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()
            .crypto_context("build KeyUsage")?;
        builder
            .append_extension(ku)
            .crypto_context("add KeyUsage")?;

        let eku = ExtendedKeyUsage::new()
            .server_auth()
            .client_auth()
            .build()
            .crypto_context("build ExtendedKeyUsage")?;
        builder
            .append_extension(eku)
            .crypto_context("add ExtendedKeyUsage")?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(self.signing_cert), None))
            .crypto_context("build SubjectKeyIdentifier")?;
        builder
            .append_extension(ski)
            .crypto_context("add SubjectKeyIdentifier")?;

        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(self.signing_cert), None))
            .crypto_context("build AuthorityKeyIdentifier")?;
        builder
            .append_extension(aki)
            .crypto_context("add AuthorityKeyIdentifier")?;

        if !self.subject_alt_names.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for entry in self.subject_alt_names.entries() {
                match entry {
                    SanEntry::Dns(name) => san.dns(name),
                    SanEntry::Ip(ip) => san.ip(&ip.to_string()),
                };
            }
            let san = san
                .build(&builder.x509v3_context(Some(self.signing_cert), None))
                .crypto_context("build SubjectAlternativeName")?;
            builder
                .append_extension(san)
                .crypto_context("add SubjectAlternativeName")?;
        }

        builder
            .sign(self.signing_key, MessageDigest::sha256())
            .crypto_context("sign device certificate")?;

        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_root_ca::RsaRootCABuilder;
    use crate::pki_generator::{common_name_of, generate_rsa_key, SubjectFields};
    use openssl::stack::Stack;
    use openssl::x509::store::X509StoreBuilder;
    use openssl::x509::X509StoreContext;

    fn test_ca() -> (PKey<Private>, X509) {
        let key = generate_rsa_key(2048).unwrap();
        let cert = RsaRootCABuilder::new(SubjectFields::new("Test Root"))
            .build(&key)
            .unwrap();
        (key, cert)
    }

    #[test]
    fn test_signed_by_ca() {
        let (ca_key, ca_cert) = test_ca();
        let device_key = generate_rsa_key(2048).unwrap();
        let cert = RsaDeviceCertBuilder::new(&ca_key, &ca_cert)
            .subject_common_name("device1.local")
            .build(&device_key)
            .unwrap();

        assert!(cert.verify(&ca_key).unwrap());
        assert_eq!(
            common_name_of(cert.issuer_name()).as_deref(),
            Some("Test Root")
        );
        assert_eq!(
            common_name_of(cert.subject_name()).as_deref(),
            Some("device1.local")
        );
        assert!(cert.public_key().unwrap().public_eq(&device_key));
    }

    #[test]
    fn test_chain_verifies() {
        let (ca_key, ca_cert) = test_ca();
        let device_key = generate_rsa_key(2048).unwrap();
        let cert = RsaDeviceCertBuilder::new(&ca_key, &ca_cert)
            .subject_common_name("nas.lan")
            .subject_alt_names(SanList::parse("nas.lan"))
            .build(&device_key)
            .unwrap();

        let mut store_builder = X509StoreBuilder::new().unwrap();
        store_builder.add_cert(ca_cert.clone()).unwrap();
        let store = store_builder.build();
        let chain: Stack<X509> = Stack::new().unwrap();
        let mut context = X509StoreContext::new().unwrap();
        let verified = context
            .init(&store, &cert, &chain, |c| c.verify_cert())
            .unwrap();
        assert!(verified);
    }

    #[test]
    fn test_san_extension_contents() {
        let (ca_key, ca_cert) = test_ca();
        let device_key = generate_rsa_key(2048).unwrap();
        let cert = RsaDeviceCertBuilder::new(&ca_key, &ca_cert)
            .subject_common_name("device1.local")
            .subject_alt_names(SanList::parse("device1.local 10.0.0.5 ::1"))
            .build(&device_key)
            .unwrap();

        let names = cert.subject_alt_names().unwrap();
        let dns: Vec<&str> = names.iter().filter_map(|n| n.dnsname()).collect();
        let ips: Vec<&[u8]> = names.iter().filter_map(|n| n.ipaddress()).collect();
        assert_eq!(dns, vec!["device1.local"]);
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0], &[10, 0, 0, 5]);
        assert_eq!(ips[1].len(), 16);
    }

    #[test]
    fn test_no_sans_omits_extension() {
        let (ca_key, ca_cert) = test_ca();
        let device_key = generate_rsa_key(2048).unwrap();
        let cert = RsaDeviceCertBuilder::new(&ca_key, &ca_cert)
            .subject_common_name("My Device")
            .build(&device_key)
            .unwrap();
        assert!(cert.subject_alt_names().is_none());
    }
}
