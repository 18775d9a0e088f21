//! pki-forge - Local Certificate Authority Manager
//!
//! A small Public Key Infrastructure for home labs and internal networks. It
//! creates self-signed root CAs, issues device certificates with Subject
//! Alternative Names, keeps every certificate/key pair as PEM files in one
//! output directory, and gets the CAs onto the machines that need to trust
//! them.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed, pathlen=0)        Root-A.pem / Root-A.key
//!   └── Device certificate (CA=false)     device1.local_signed-by_Root-A.pem / .key
//! ```
//!
//! Device certificates refer to their CA by name. Deleting a CA leaves its
//! device certificates in place; they are then reported as orphaned.
//!
//! # Features
//!
//! - **CA creation**: RSA keys (4096-bit by default), SHA-256, ten-year validity
//! - **Device certificates**: DNS and IP SANs parsed from free-form input
//! - **Inspection**: subject, issuer, validity, serial, SANs, SHA-256 fingerprint
//! - **PKCS#12 export**: certificate, key and CA chain behind a password
//! - **Trust store install**: Linux anchors, macOS System keychain, Windows ROOT store
//! - **Installer archives**: CA certificate plus install scripts for other machines
//!
//! # Quick Start
//!
//! ```no_run
//! use pki_forge::configs::AppConfig;
//! use pki_forge::manager::{CertificateRequest, PkiManager};
//! use pki_forge::pki_generator::SubjectFields;
//!
//! fn main() -> pki_forge::Result<()> {
//!     let manager = PkiManager::new(AppConfig::default())?;
//!
//!     let subject = SubjectFields {
//!         country: "GB".to_string(),
//!         common_name: "Root-A".to_string(),
//!         ..SubjectFields::default()
//!     };
//!     manager.create_ca(&subject, Some(3650))?;
//!
//!     let id = manager.create_certificate(&CertificateRequest {
//!         common_name: "device1.local".to_string(),
//!         subject_alt_names: "device1.local,10.0.0.5".to_string(),
//!         issuer: "Root-A".to_string(),
//!         expiry_days: Some(730),
//!         replace: false,
//!     })?;
//!
//!     let details = manager.inspect_certificate(&id)?;
//!     println!("{} issued by {}", details.subject_common_name, details.issuer_common_name);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`manager`]: the operation facade used by the CLI and the socket server
//! - [`storage`]: the on-disk certificate/key store
//! - [`generate_root_ca`] / [`generate_device_cert`]: certificate builders
//! - [`pki_generator`]: keys, subjects, validity windows, serial numbers
//! - [`san`]: Subject Alternative Name parsing
//! - [`inspect`]: certificate metadata
//! - [`pfx_key`]: PKCS#12 bundles
//! - [`trust_store`]: operating-system trust store integration
//! - [`installer`]: distributable installer archives
//! - [`protocol`] / `external_interface`: the Unix socket API
//!
//! # Error Handling
//!
//! Library operations return [`Result<T>`] with a [`PkiError`]. Each error has
//! an [`ErrorKind`] (`NotFound`, `Conflict`, `ValidationError`, ...) that
//! callers can match on; the socket protocol sends the kind alongside the
//! message.

pub mod configs;
pub mod error;
#[cfg(unix)]
pub mod external_interface;
pub mod generate_device_cert;
pub mod generate_root_ca;
pub mod inspect;
pub mod installer;
pub mod manager;
pub mod pfx_key;
pub mod pki_generator;
pub mod protocol;
pub mod san;
pub mod storage;
pub mod trust_store;

pub use error::{ErrorKind, PkiError, Result};
