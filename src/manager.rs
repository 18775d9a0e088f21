//! The certificate lifecycle facade.
//!
//! [`PkiManager`] owns the store, the configuration and the platform trust
//! store, and exposes one method per operation. The CLI, the socket server and
//! library users all go through it.

use crate::configs::AppConfig;
use crate::error::{PkiError, Result};
use crate::generate_device_cert::RsaDeviceCertBuilder;
use crate::generate_root_ca::RsaRootCABuilder;
use crate::inspect::{self, CertificateDetails};
use crate::installer::{build_installer, InstallerPackage};
use crate::pfx_key::{save_pfx, PfxOptions};
use crate::pki_generator::{
    common_name_of, generate_rsa_key, pick_unique_serial, validate_common_name,
    validate_validity_days, SubjectFields, ValidityWindow,
};
use crate::san::{SanEntry, SanList};
use crate::storage::{write_atomic, write_secret_atomic, EntryId, ReadView, Storage, StoredPair};
use crate::trust_store::{platform_trust_store, InstallOutcome, TrustStore};
use openssl::x509::X509;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Parameters for a device certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub common_name: String,
    /// Free-form SAN input, comma and/or whitespace separated.
    #[serde(default)]
    pub subject_alt_names: String,
    pub issuer: String,
    #[serde(default)]
    pub expiry_days: Option<u32>,
    /// Overwrite an existing certificate with the same identifier.
    #[serde(default)]
    pub replace: bool,
}

pub struct PkiManager {
    config: AppConfig,
    storage: Storage,
    trust_store: Box<dyn TrustStore>,
}

impl PkiManager {
    /// Open the store at `config.store.output_dir` with the native trust store.
    pub fn new(config: AppConfig) -> Result<Self> {
        let trust_store = platform_trust_store(&config.trust_store);
        Self::with_trust_store(config, trust_store)
    }

    pub fn with_trust_store(config: AppConfig, trust_store: Box<dyn TrustStore>) -> Result<Self> {
        let storage = Storage::open(&config.store.output_dir)?;
        tracing::info!(
            output_dir = %config.store.output_dir.display(),
            trust_store = trust_store.platform(),
            "PKI manager ready"
        );
        Ok(Self {
            config,
            storage,
            trust_store,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Create a self-signed CA and return its name.
    ///
    /// Blank subject fields fall back to `[ca_defaults]`; `expiry_days`
    /// defaults to `ca_defaults.validity_days`.
    pub fn create_ca(&self, subject: &SubjectFields, expiry_days: Option<u32>) -> Result<String> {
        let defaults = &self.config.ca_defaults;
        let subject = subject.with_defaults(defaults);
        subject.validate()?;
        let id = EntryId::ca(&subject.common_name)?;
        let days = expiry_days.unwrap_or(defaults.validity_days);
        validate_validity_days(days)?;

        // Cheap early exit before the key generation
        if self.storage.read(|view| Ok(view.exists(&id)))? {
            return Err(PkiError::conflict("CA", id.file_stem()));
        }

        let private_key = generate_rsa_key(defaults.key_bits)?;

        self.storage.write(|txn| {
            if txn.exists(&id) {
                return Err(PkiError::conflict("CA", id.file_stem()));
            }
            let serial = pick_unique_serial(&txn.ca_serials()?)?;
            let certificate = RsaRootCABuilder::new(subject)
                .validity(ValidityWindow::starting_now(days)?)
                .serial(serial)
                .build(&private_key)?;
            txn.save(
                &id,
                &StoredPair {
                    certificate,
                    private_key,
                },
                false,
            )
        })?;

        tracing::info!(ca = %id, days, "created CA");
        Ok(id.file_stem())
    }

    /// Issue a device certificate and return its identifier.
    pub fn create_certificate(&self, request: &CertificateRequest) -> Result<String> {
        let defaults = &self.config.certificate_defaults;
        let common_name = request.common_name.trim();
        validate_common_name(common_name)?;
        let ca_id = ca_id(&request.issuer)?;
        let id = EntryId::leaf(common_name, ca_id.issuer_name())?;
        let days = request.expiry_days.unwrap_or(defaults.validity_days);
        validate_validity_days(days)?;

        let mut sans = SanList::parse(&request.subject_alt_names);
        if defaults.include_common_name_in_sans && !common_name.contains(char::is_whitespace) {
            if let Some(entry) = SanEntry::parse(common_name) {
                sans.push_front(entry);
            }
        }

        self.storage.read(|view| {
            require_complete(view, &ca_id)?;
            if view.exists(&id) && !request.replace {
                return Err(PkiError::conflict("certificate", id.file_stem()));
            }
            Ok(())
        })?;

        let private_key = generate_rsa_key(defaults.key_bits)?;

        self.storage.write(|txn| {
            let ca = txn.load_pair(&ca_id)?;
            if txn.exists(&id) && !request.replace {
                return Err(PkiError::conflict("certificate", id.file_stem()));
            }
            let serial = pick_unique_serial(&txn.issued_serials(ca_id.issuer_name())?)?;
            let certificate = RsaDeviceCertBuilder::new(&ca.private_key, &ca.certificate)
                .subject_common_name(common_name)
                .subject_alt_names(sans)
                .validity(ValidityWindow::starting_now(days)?)
                .serial(serial)
                .build(&private_key)?;
            txn.save(
                &id,
                &StoredPair {
                    certificate,
                    private_key,
                },
                request.replace,
            )
        })?;

        tracing::info!(certificate = %id, days, "issued device certificate");
        Ok(id.file_stem())
    }

    pub fn list_cas(&self) -> Result<Vec<String>> {
        self.storage.list_cas()
    }

    pub fn list_certificates(&self) -> Result<Vec<String>> {
        self.storage.list_certificates()
    }

    /// Delete a CA. Its device certificates stay in place; their identifiers
    /// are returned so callers can report them as orphaned.
    pub fn delete_ca(&self, name: &str) -> Result<Vec<String>> {
        let id = ca_id(name)?;
        let orphaned = self.storage.write(|txn| {
            let orphaned = txn.leaves_signed_by(id.issuer_name())?;
            txn.delete(&id)?;
            Ok(orphaned)
        })?;
        if !orphaned.is_empty() {
            tracing::warn!(ca = %id, count = orphaned.len(), "device certificates are now orphaned");
        }
        Ok(orphaned)
    }

    pub fn delete_certificate(&self, identifier: &str) -> Result<()> {
        let id = leaf_id(identifier)?;
        self.storage.delete(&id)
    }

    /// Describe a stored CA or device certificate.
    pub fn inspect_certificate(&self, identifier: &str) -> Result<CertificateDetails> {
        let id = EntryId::parse(identifier)?;
        self.storage.read(|view| {
            let certificate = view.load_certificate(&id)?;
            if id.is_ca() {
                return inspect::describe(&id.file_stem(), &certificate, true, None);
            }
            let issuer = stored_issuer(view, &id);
            inspect::describe(&id.file_stem(), &certificate, false, issuer.as_deref())
        })
    }

    /// PKCS#12 bundle of a device certificate, its key and its issuing CA.
    pub fn export_bundle(&self, identifier: &str, password: &SecretString) -> Result<Vec<u8>> {
        let id = leaf_id(identifier)?;
        let options = PfxOptions {
            legacy_algorithms: self.config.export.legacy_algorithms,
        };
        self.storage.read(|view| {
            let leaf = view.load_pair(&id)?;
            let issuer = EntryId::ca(id.issuer_name())?;
            require_complete(view, &issuer)?;
            let ca_cert = view.load_certificate(&issuer)?;
            if !inspect::verifies(&leaf.certificate, &ca_cert) {
                tracing::warn!(certificate = %id, "stored CA did not sign this certificate");
                return Err(PkiError::not_found("issuing CA", id.issuer_name()));
            }
            let friendly_name =
                common_name_of(leaf.certificate.subject_name()).unwrap_or_else(|| id.file_stem());
            let der = save_pfx(
                &friendly_name,
                &leaf.certificate,
                &leaf.private_key,
                &[&*ca_cert],
                password,
                options,
            )?;
            tracing::info!(certificate = %id, "exported PKCS#12 bundle");
            Ok(der)
        })
    }

    /// Export to `out`, or `<output_dir>/<identifier>.pfx` when `out` is
    /// `None`. Nothing is written when the export fails.
    pub fn export_bundle_to(
        &self,
        identifier: &str,
        password: &SecretString,
        out: Option<&Path>,
    ) -> Result<PathBuf> {
        let der = self.export_bundle(identifier, password)?;
        let path = match out {
            Some(path) => path.to_path_buf(),
            None => self
                .storage
                .root()
                .join(format!("{}.pfx", leaf_id(identifier)?.file_stem())),
        };
        write_secret_atomic(&path, &der)?;
        Ok(path)
    }

    /// Install a CA into the operating-system trust store.
    pub fn install_ca(&self, name: &str) -> Result<InstallOutcome> {
        let id = ca_id(name)?;
        let certificate = self.storage.read(|view| {
            require_complete(view, &id)?;
            view.load_certificate(&id)
        })?;

        if !self.trust_store.supported() {
            return Err(PkiError::Unsupported {
                operation: "installing a CA into the trust store",
                platform: self.trust_store.platform(),
            });
        }
        if !self.trust_store.is_privileged() {
            return Err(PkiError::PermissionDenied {
                operation: "installing a CA into the trust store",
            });
        }
        let name = id.file_stem();
        if self.trust_store.is_installed(&name, &certificate)? {
            tracing::info!(ca = %name, "CA already trusted");
            return Ok(InstallOutcome::AlreadyInstalled);
        }
        self.trust_store.install(&name, &certificate)?;
        tracing::info!(ca = %name, platform = self.trust_store.platform(), "installed CA");
        Ok(InstallOutcome::Installed)
    }

    /// Installer archive for distributing a CA to other machines.
    pub fn generate_installer(&self, name: &str) -> Result<InstallerPackage> {
        let id = ca_id(name)?;
        let certificate = self.storage.read(|view| {
            require_complete(view, &id)?;
            view.load_certificate(&id)
        })?;
        build_installer(&id.file_stem(), &certificate)
    }

    /// Write the installer archive to `out_dir` (default: the output directory).
    pub fn generate_installer_to(&self, name: &str, out_dir: Option<&Path>) -> Result<PathBuf> {
        let package = self.generate_installer(name)?;
        let dir = out_dir.unwrap_or_else(|| self.storage.root());
        let path = dir.join(&package.file_name);
        write_atomic(&path, &package.bytes)?;
        Ok(path)
    }

    pub fn is_privileged(&self) -> bool {
        self.trust_store.is_privileged()
    }
}

fn ca_id(name: &str) -> Result<EntryId> {
    let id = EntryId::parse(name)?;
    if !id.is_ca() {
        return Err(PkiError::validation(
            "CA name",
            format!("'{}' names a device certificate", name.trim()),
        ));
    }
    Ok(id)
}

fn leaf_id(identifier: &str) -> Result<EntryId> {
    let id = EntryId::parse(identifier)?;
    if id.is_ca() {
        return Err(PkiError::validation(
            "certificate identifier",
            format!("'{}' names a CA, expected <CN>_signed-by_<CA>", identifier.trim()),
        ));
    }
    Ok(id)
}

/// Both files of `id` exist; otherwise `NotFound`.
fn require_complete(view: &ReadView<'_>, id: &EntryId) -> Result<()> {
    if view.cert_path(id).is_file() && view.key_path(id).is_file() {
        Ok(())
    } else {
        Err(PkiError::not_found(id.entity(), id.file_stem()))
    }
}

/// The stored certificate of the CA named by a device certificate, if any.
fn stored_issuer(view: &ReadView<'_>, leaf: &EntryId) -> Option<X509> {
    let issuer = EntryId::ca(leaf.issuer_name()).ok()?;
    require_complete(view, &issuer).ok()?;
    match view.load_certificate(&issuer) {
        Ok(cert) => Some(cert),
        Err(e) => {
            tracing::warn!(ca = %issuer, error = %e, "issuing CA is unreadable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn test_manager() -> (PkiManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.store.output_dir = dir.path().join("output");
        config.ca_defaults.key_bits = 2048;
        let manager = PkiManager::with_trust_store(
            config,
            Box::new(crate::trust_store::UnsupportedTrustStore),
        )
        .unwrap();
        (manager, dir)
    }

    #[test]
    fn test_manager_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PkiManager>();
    }

    #[test]
    fn test_common_name_leads_sans() {
        let (manager, _dir) = test_manager();
        manager.create_ca(&SubjectFields::new("Root-A"), None).unwrap();
        let id = manager
            .create_certificate(&CertificateRequest {
                common_name: "nas.lan".into(),
                subject_alt_names: "10.0.0.9 NAS.lan".into(),
                issuer: "Root-A".into(),
                ..CertificateRequest::default()
            })
            .unwrap();
        let details = manager.inspect_certificate(&id).unwrap();
        assert_eq!(details.dns_names, vec!["nas.lan"]);
        assert_eq!(details.ip_addresses.len(), 1);
    }

    #[test]
    fn test_multi_word_common_name_not_in_sans() {
        let (manager, _dir) = test_manager();
        manager.create_ca(&SubjectFields::new("Root-A"), None).unwrap();
        let id = manager
            .create_certificate(&CertificateRequest {
                common_name: "Living Room TV".into(),
                issuer: "Root-A".into(),
                ..CertificateRequest::default()
            })
            .unwrap();
        assert_eq!(id, "Living Room TV_signed-by_Root-A");
        let details = manager.inspect_certificate(&id).unwrap();
        assert!(details.dns_names.is_empty());
    }

    #[test]
    fn test_identifier_kinds_are_checked() {
        let (manager, _dir) = test_manager();
        assert_eq!(
            manager.delete_certificate("Root-A").unwrap_err().kind(),
            ErrorKind::ValidationError
        );
        assert_eq!(
            manager.delete_ca("x_signed-by_Root-A").unwrap_err().kind(),
            ErrorKind::ValidationError
        );
    }

    #[test]
    fn test_unsupported_platform_install() {
        let (manager, _dir) = test_manager();
        manager.create_ca(&SubjectFields::new("Root-A"), None).unwrap();
        let err = manager.install_ca("Root-A").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(!manager.is_privileged());
    }

    #[test]
    fn test_issue_against_missing_ca() {
        let (manager, _dir) = test_manager();
        let err = manager
            .create_certificate(&CertificateRequest {
                common_name: "device".into(),
                issuer: "Nope".into(),
                ..CertificateRequest::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(manager.list_certificates().unwrap().is_empty());
    }
}
