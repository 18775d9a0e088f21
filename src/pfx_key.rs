//! PKCS#12 (PFX) bundles.
//!
//! A bundle carries a device certificate, its private key and the issuing CA
//! certificate as the chain, protected by a caller-supplied password.

use crate::error::{CryptoContext, PkiError, Result};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::stack::Stack;
use openssl::x509::{X509Ref, X509};
use secrecy::{ExposeSecret, SecretString};

/// Encryption settings for a bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PfxOptions {
    /// PBE-SHA1-3DES for keys and certificates plus a SHA-1 MAC, for
    /// importers that predate the AES/PBKDF2 defaults.
    pub legacy_algorithms: bool,
}

/// Contents of a parsed bundle.
pub struct PfxContents {
    pub certificate: X509,
    pub private_key: PKey<Private>,
    pub chain: Vec<X509>,
}

/// Build a PKCS#12 bundle and return its DER encoding.
///
/// The empty password is accepted.
pub fn save_pfx(
    friendly_name: &str,
    certificate: &X509Ref,
    private_key: &PKeyRef<Private>,
    chain: &[&X509Ref],
    password: &SecretString,
    options: PfxOptions,
) -> Result<Vec<u8>> {
    let mut ca_stack = Stack::new().crypto_context("allocate certificate stack")?;
    for cert in chain {
        ca_stack
            .push((*cert).to_owned())
            .crypto_context("add chain certificate")?;
    }

    let mut builder = Pkcs12::builder();
    builder
        .name(friendly_name)
        .pkey(private_key)
        .cert(certificate)
        .ca(ca_stack);
    if options.legacy_algorithms {
        builder
            .key_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
            .cert_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
            .mac_md(MessageDigest::sha1());
    }

    let pkcs12 = builder
        .build2(password.expose_secret())
        .crypto_context("build PKCS#12 bundle")?;
    let der = pkcs12.to_der().crypto_context("encode PKCS#12 bundle")?;
    tracing::debug!(
        friendly_name,
        chain_len = chain.len(),
        legacy = options.legacy_algorithms,
        "built PKCS#12 bundle"
    );
    Ok(der)
}

/// Decrypt a DER-encoded bundle.
pub fn load_pfx(der: &[u8], password: &SecretString) -> Result<PfxContents> {
    let pkcs12 = Pkcs12::from_der(der).crypto_context("decode PKCS#12 bundle")?;
    let parsed = pkcs12
        .parse2(password.expose_secret())
        .crypto_context("decrypt PKCS#12 bundle")?;

    let certificate = parsed
        .cert
        .ok_or_else(|| PkiError::crypto("read PKCS#12 bundle", "no certificate"))?;
    let private_key = parsed
        .pkey
        .ok_or_else(|| PkiError::crypto("read PKCS#12 bundle", "no private key"))?;
    let chain = parsed
        .ca
        .map(|stack| stack.into_iter().collect())
        .unwrap_or_default();

    Ok(PfxContents {
        certificate,
        private_key,
        chain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_device_cert::RsaDeviceCertBuilder;
    use crate::generate_root_ca::RsaRootCABuilder;
    use crate::pki_generator::{common_name_of, generate_rsa_key, SubjectFields};

    struct Fixture {
        ca_cert: X509,
        leaf: X509,
        leaf_key: PKey<Private>,
    }

    fn fixture() -> Fixture {
        let ca_key = generate_rsa_key(2048).unwrap();
        let ca_cert = RsaRootCABuilder::new(SubjectFields::new("Root-A"))
            .build(&ca_key)
            .unwrap();
        let leaf_key = generate_rsa_key(2048).unwrap();
        let leaf = RsaDeviceCertBuilder::new(&ca_key, &ca_cert)
            .subject_common_name("device1.local")
            .build(&leaf_key)
            .unwrap();
        Fixture {
            ca_cert,
            leaf,
            leaf_key,
        }
    }

    #[test]
    fn test_bundle_parses_back() {
        let f = fixture();
        let password = SecretString::from("hunter2");
        let der = save_pfx(
            "device1.local",
            &f.leaf,
            &f.leaf_key,
            &[&*f.ca_cert],
            &password,
            PfxOptions::default(),
        )
        .unwrap();

        let contents = load_pfx(&der, &password).unwrap();
        assert_eq!(contents.certificate.to_der().unwrap(), f.leaf.to_der().unwrap());
        assert!(contents.private_key.public_eq(&f.leaf_key));
        assert_eq!(contents.chain.len(), 1);
        assert_eq!(
            common_name_of(contents.chain[0].subject_name()).as_deref(),
            Some("Root-A")
        );
    }

    #[test]
    fn test_wrong_password_fails() {
        let f = fixture();
        let der = save_pfx(
            "device1.local",
            &f.leaf,
            &f.leaf_key,
            &[&*f.ca_cert],
            &SecretString::from("right"),
            PfxOptions::default(),
        )
        .unwrap();
        let err = load_pfx(&der, &SecretString::from("wrong")).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::CryptoError);
    }

    #[test]
    fn test_empty_password_and_legacy_algorithms() {
        let f = fixture();
        let empty = SecretString::from("");
        let der = save_pfx(
            "device1.local",
            &f.leaf,
            &f.leaf_key,
            &[&*f.ca_cert],
            &empty,
            PfxOptions {
                legacy_algorithms: true,
            },
        )
        .unwrap();
        let contents = load_pfx(&der, &empty).unwrap();
        assert!(contents.private_key.public_eq(&f.leaf_key));
    }
}
