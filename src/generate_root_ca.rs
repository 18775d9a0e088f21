//! Root CA Certificate Generation Module
//!
//! Builds the self-signed certificate of a local certificate authority. The
//! key pair is generated by the caller beforehand so the expensive RSA step
//! can run outside the store lock; the builder only assembles and signs.
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same
//! - **Basic Constraints**: CA=true, pathlen=0, critical (signs device certificates only)
//! - **Key Usage**: keyCertSign, digitalSignature, critical
//! - **Extended Key Usage**: serverAuth, clientAuth
//! - **Subject Key Identifier**: hash of the public key
//! - **Signature**: SHA-256 with RSA
//!
//! # Example
//! ```rust,no_run
//! use pki_forge::generate_root_ca::RsaRootCABuilder;
//! use pki_forge::pki_generator::{generate_rsa_key, SubjectFields, ValidityWindow};
//! # fn example() -> pki_forge::Result<()> {
//! let key = generate_rsa_key(4096)?;
//! let subject = SubjectFields {
//!     country: "GB".to_string(),
//!     common_name: "Root-A".to_string(),
//!     ..SubjectFields::default()
//! };
//! let certificate = RsaRootCABuilder::new(subject)
//!     .validity(ValidityWindow::starting_now(3650)?)
//!     .build(&key)?;
//! # Ok(())
//! # }
//! ```

use crate::error::{CryptoContext, Result};
use crate::pki_generator::{random_serial, SubjectFields, ValidityWindow, X509_VERSION_3};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::X509;

const ROOT_CA_PATH_LENGTH: u32 = 0;
const DEFAULT_VALIDITY_DAYS: u32 = 3650;

/// Builder for self-signed CA certificates
///
/// The subject is expected to be validated and defaulted already
/// (see [`SubjectFields::with_defaults`]). Without an explicit serial a fresh
/// random one is drawn; the manager always passes one it has checked against
/// the store.
pub struct RsaRootCABuilder {
    subject: SubjectFields,
    validity: Option<ValidityWindow>,
    serial: Option<BigNum>,
}

impl RsaRootCABuilder {
    pub fn new(subject: SubjectFields) -> Self {
        Self {
            subject,
            validity: None,
            serial: None,
        }
    }

    /// Set the validity window. Defaults to ten years from now.
    pub fn validity(mut self, window: ValidityWindow) -> Self {
        self.validity = Some(window);
        self
    }

    /// Set the serial number
    pub fn serial(mut self, serial: BigNum) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Assemble the certificate around `private_key`'s public half and self-sign it.
    ///
    /// # Errors
    /// `Validation` for an empty common name or a zero-day window, `Crypto`
    /// when any OpenSSL step fails.
    pub fn build(self, private_key: &PKey<Private>) -> Result<X509> {
        self.subject.validate()?;
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

        let name = self.subject.to_x509_name()?;
        builder
            .set_subject_name(&name)
            .crypto_context("set subject")?;
        builder.set_issuer_name(&name).crypto_context("set issuer")?;

        let (not_before, not_after) = validity.asn1_times()?;
        builder
            .set_not_before(&not_before)
            .crypto_context("set not_before")?;
        builder
            .set_not_after(&not_after)
            .crypto_context("set not_after")?;

        builder
            .set_pubkey(private_key)
            .crypto_context("set public key")?;

        let bc = BasicConstraints::new()
            .critical()
            .ca()
            .pathlen(ROOT_CA_PATH_LENGTH)
            .build()
            .crypto_context("build BasicConstraints")?;
        builder
            .append_extension(bc)
            .crypto_context("add BasicConstraints")?;

        let ku = KeyUsage::new()
            .critical()
            .key_cert_sign()
            .digital_signature()
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
            .build(&builder.x509v3_context(None, None))
            .crypto_context("build SubjectKeyIdentifier")?;
        builder
            .append_extension(ski)
            .crypto_context("add SubjectKeyIdentifier")?;

        builder
            .sign(private_key, MessageDigest::sha256())
            .crypto_context("sign CA certificate")?;

        Ok(builder.build())
    }
}
