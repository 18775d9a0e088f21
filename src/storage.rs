//! Filesystem-backed certificate and key store.
//!
//! Every entry is a pair of files in the output directory:
//!
//! ```text
//! output/
//!   Root-A.pem                              CA certificate
//!   Root-A.key                              CA private key (PKCS#8 PEM, 0600)
//!   device1.local_signed-by_Root-A.pem      device certificate
//!   device1.local_signed-by_Root-A.key      device private key
//! ```
//!
//! Listing is pure directory enumeration. Writes go through temporary files in
//! the same directory and are renamed into place; a failed second rename rolls
//! back the first, so readers see either a complete pair or nothing. One
//! `RwLock` per store serialises writers against everything else.

use crate::error::{CryptoContext, PkiError, Result};
use crate::pki_generator::{serial_hex, validate_common_name};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tempfile::NamedTempFile;

pub const SIGNED_BY_MARKER: &str = "_signed-by_";
pub const WILDCARD_REPLACEMENT: &str = "_wildcard";
const CERT_EXTENSION: &str = "pem";
const KEY_EXTENSION: &str = "key";
const TEMP_PREFIX: &str = ".pki-forge-";
const FORBIDDEN_CHARS: &[char] = &['/', '\\', '<', '>', ':', '"', '|', '?', '*'];

/// Identity of a store entry, derived from (and convertible back to) its file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryId {
    Ca { name: String },
    Leaf { stem: String, issuer: String },
}

impl EntryId {
    pub fn ca(name: &str) -> Result<EntryId> {
        let name = name.trim();
        validate_common_name(name)?;
        validate_component("CA name", name)?;
        Ok(EntryId::Ca {
            name: name.to_string(),
        })
    }

    /// Identity of the device certificate `common_name` signed by `issuer`.
    pub fn leaf(common_name: &str, issuer: &str) -> Result<EntryId> {
        let common_name = common_name.trim();
        validate_common_name(common_name)?;
        let stem = common_name.replace('*', WILDCARD_REPLACEMENT);
        validate_component("common name", &stem)?;
        let issuer = issuer.trim();
        validate_component("CA name", issuer)?;
        Ok(EntryId::Leaf {
            stem,
            issuer: issuer.to_string(),
        })
    }

    /// Parse a caller-supplied identifier. A trailing `.pem` is accepted.
    pub fn parse(identifier: &str) -> Result<EntryId> {
        let id = identifier.trim();
        let id = id
            .strip_suffix(&format!(".{}", CERT_EXTENSION))
            .unwrap_or(id);
        match id.split_once(SIGNED_BY_MARKER) {
            Some((stem, issuer)) => {
                validate_component("common name", stem)?;
                validate_component("CA name", issuer)?;
                Ok(EntryId::Leaf {
                    stem: stem.to_string(),
                    issuer: issuer.to_string(),
                })
            }
            None => {
                validate_component("CA name", id)?;
                Ok(EntryId::Ca {
                    name: id.to_string(),
                })
            }
        }
    }

    pub fn file_stem(&self) -> String {
        match self {
            EntryId::Ca { name } => name.clone(),
            EntryId::Leaf { stem, issuer } => format!("{}{}{}", stem, SIGNED_BY_MARKER, issuer),
        }
    }

    /// Name of the issuing CA; a CA is its own issuer.
    pub fn issuer_name(&self) -> &str {
        match self {
            EntryId::Ca { name } => name,
            EntryId::Leaf { issuer, .. } => issuer,
        }
    }

    pub fn is_ca(&self) -> bool {
        matches!(self, EntryId::Ca { .. })
    }

    pub fn entity(&self) -> &'static str {
        match self {
            EntryId::Ca { .. } => "CA",
            EntryId::Leaf { .. } => "certificate",
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

/// Reject anything that could escape the output directory or confuse the
/// `<cn>_signed-by_<ca>` naming scheme.
fn validate_component(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(PkiError::validation(field, "must not be empty"));
    }
    if value == "." || value == ".." || value.contains("..") {
        return Err(PkiError::validation(
            field,
            format!("'{}' contains a relative path segment", value),
        ));
    }
    if value.starts_with('.') {
        return Err(PkiError::validation(
            field,
            format!("'{}' must not start with '.'", value),
        ));
    }
    if let Some(c) = value
        .chars()
        .find(|c| c.is_control() || FORBIDDEN_CHARS.contains(c))
    {
        return Err(PkiError::validation(
            field,
            format!("'{}' contains the forbidden character {:?}", value, c),
        ));
    }
    let lower = value.to_ascii_lowercase();
    if [CERT_EXTENSION, KEY_EXTENSION]
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
    {
        return Err(PkiError::validation(
            field,
            format!("'{}' must not end in a store file extension", value),
        ));
    }
    if value.contains(SIGNED_BY_MARKER) {
        return Err(PkiError::validation(
            field,
            format!("'{}' must not contain '{}'", value, SIGNED_BY_MARKER),
        ));
    }
    Ok(())
}

/// A certificate together with its private key.
pub struct StoredPair {
    pub certificate: X509,
    pub private_key: PKey<Private>,
}

impl fmt::Debug for StoredPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredPair")
            .field("certificate", &self.certificate.subject_name())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

pub struct Storage {
    root: PathBuf,
    lock: RwLock<()>,
}

impl Storage {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PkiError::io(&root, e))?;
        tracing::debug!(root = %root.display(), "opened certificate store");
        Ok(Storage {
            root,
            lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `f` holding the shared (reader) side of the store lock.
    pub fn read<T>(&self, f: impl FnOnce(&ReadView<'_>) -> Result<T>) -> Result<T> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        f(&ReadView { root: &self.root })
    }

    /// Run `f` holding the exclusive (writer) side of the store lock.
    pub fn write<T>(&self, f: impl FnOnce(&WriteView<'_>) -> Result<T>) -> Result<T> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        f(&WriteView {
            view: ReadView { root: &self.root },
        })
    }

    pub fn list_cas(&self) -> Result<Vec<String>> {
        self.read(|view| view.list_cas())
    }

    pub fn list_certificates(&self) -> Result<Vec<String>> {
        self.read(|view| view.list_certificates())
    }

    pub fn load_ca(&self, name: &str) -> Result<StoredPair> {
        let id = EntryId::ca(name)?;
        self.read(|view| view.load_pair(&id))
    }

    pub fn load_pair(&self, id: &EntryId) -> Result<StoredPair> {
        self.read(|view| view.load_pair(id))
    }

    pub fn load_certificate(&self, id: &EntryId) -> Result<X509> {
        self.read(|view| view.load_certificate(id))
    }

    pub fn save(&self, id: &EntryId, pair: &StoredPair, overwrite: bool) -> Result<()> {
        self.write(|view| view.save(id, pair, overwrite))
    }

    pub fn delete(&self, id: &EntryId) -> Result<()> {
        self.write(|view| view.delete(id))
    }
}

/// Store operations valid under the reader lock.
pub struct ReadView<'a> {
    root: &'a Path,
}

impl<'a> ReadView<'a> {
    pub fn cert_path(&self, id: &EntryId) -> PathBuf {
        self.root
            .join(format!("{}.{}", id.file_stem(), CERT_EXTENSION))
    }

    pub fn key_path(&self, id: &EntryId) -> PathBuf {
        self.root
            .join(format!("{}.{}", id.file_stem(), KEY_EXTENSION))
    }

    /// Either half of the pair is present.
    pub fn exists(&self, id: &EntryId) -> bool {
        self.cert_path(id).is_file() || self.key_path(id).is_file()
    }

    /// Complete pairs in the directory, sorted by file stem.
    fn complete_entries(&self) -> Result<Vec<EntryId>> {
        let dir = fs::read_dir(self.root).map_err(|e| PkiError::io(self.root, e))?;
        let mut entries = Vec::new();
        for dir_entry in dir {
            let dir_entry = dir_entry.map_err(|e| PkiError::io(self.root, e))?;
            let file_name = dir_entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(stem) = file_name.strip_suffix(&format!(".{}", CERT_EXTENSION)) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            let id = match EntryId::parse(stem) {
                Ok(id) => id,
                Err(e) => {
                    tracing::debug!(file = file_name, error = %e, "skipping unrecognised file");
                    continue;
                }
            };
            if !self.key_path(&id).is_file() {
                tracing::warn!(entry = %id, "certificate has no matching key file, not listed");
                continue;
            }
            entries.push(id);
        }
        entries.sort_by_key(|id| id.file_stem());
        Ok(entries)
    }

    pub fn list_cas(&self) -> Result<Vec<String>> {
        Ok(self
            .complete_entries()?
            .into_iter()
            .filter(EntryId::is_ca)
            .map(|id| id.file_stem())
            .collect())
    }

    pub fn list_certificates(&self) -> Result<Vec<String>> {
        Ok(self
            .complete_entries()?
            .into_iter()
            .filter(|id| !id.is_ca())
            .map(|id| id.file_stem())
            .collect())
    }

    /// Identifiers of device certificates naming `ca_name` as issuer.
    pub fn leaves_signed_by(&self, ca_name: &str) -> Result<Vec<String>> {
        Ok(self
            .complete_entries()?
            .into_iter()
            .filter(|id| !id.is_ca() && id.issuer_name() == ca_name)
            .map(|id| id.file_stem())
            .collect())
    }

    pub fn load_certificate(&self, id: &EntryId) -> Result<X509> {
        let path = self.cert_path(id);
        let pem = read_entry_file(&path, id)?;
        X509::from_pem(&pem).map_err(|e| PkiError::corrupt("certificate", &path, e))
    }

    fn load_private_key(&self, id: &EntryId) -> Result<PKey<Private>> {
        let path = self.key_path(id);
        let pem = read_entry_file(&path, id)?;
        // Accepts PKCS#8 as well as the PKCS#1 "RSA PRIVATE KEY" form
        PKey::private_key_from_pem(&pem).map_err(|e| PkiError::corrupt("private key", &path, e))
    }

    /// Load both halves and check that they belong together.
    pub fn load_pair(&self, id: &EntryId) -> Result<StoredPair> {
        if !self.cert_path(id).is_file() || !self.key_path(id).is_file() {
            return Err(PkiError::not_found(id.entity(), id.file_stem()));
        }
        let certificate = self.load_certificate(id)?;
        let private_key = self.load_private_key(id)?;
        let public_key = certificate
            .public_key()
            .map_err(|e| PkiError::corrupt("certificate", &self.cert_path(id), e))?;
        if !public_key.public_eq(&private_key) {
            return Err(PkiError::corrupt(
                "private key",
                &self.key_path(id),
                "does not match the certificate's public key",
            ));
        }
        tracing::debug!(entry = %id, "loaded key pair");
        Ok(StoredPair {
            certificate,
            private_key,
        })
    }

    /// Serials already used by `ca_name`: its own and its device certificates'.
    pub fn issued_serials(&self, ca_name: &str) -> Result<HashSet<String>> {
        let mut ids = vec![EntryId::Ca {
            name: ca_name.to_string(),
        }];
        for leaf in self.leaves_signed_by(ca_name)? {
            ids.push(EntryId::parse(&leaf)?);
        }
        self.serials_of(&ids)
    }

    /// Serials of every stored CA certificate.
    pub fn ca_serials(&self) -> Result<HashSet<String>> {
        let ids = self
            .list_cas()?
            .into_iter()
            .map(|name| EntryId::Ca { name })
            .collect::<Vec<_>>();
        self.serials_of(&ids)
    }

    fn serials_of(&self, ids: &[EntryId]) -> Result<HashSet<String>> {
        let mut serials = HashSet::new();
        for id in ids {
            match self.load_certificate(id) {
                Ok(cert) => {
                    serials.insert(serial_hex(cert.serial_number())?);
                }
                Err(e @ PkiError::Io { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(entry = %id, error = %e, "ignoring unreadable certificate");
                }
            }
        }
        Ok(serials)
    }
}

/// Store operations that need the writer lock.
pub struct WriteView<'a> {
    view: ReadView<'a>,
}

impl<'a> Deref for WriteView<'a> {
    type Target = ReadView<'a>;

    fn deref(&self) -> &Self::Target {
        &self.view
    }
}

impl<'a> WriteView<'a> {
    /// Persist a certificate/key pair.
    ///
    /// With `overwrite == false` an existing entry (either file) is a
    /// `Conflict`. With `overwrite == true` the old pair is moved aside first
    /// and restored if the new pair cannot be committed.
    pub fn save(&self, id: &EntryId, pair: &StoredPair, overwrite: bool) -> Result<()> {
        let cert_pem = pair
            .certificate
            .to_pem()
            .crypto_context("encode certificate")?;
        let key_pem = pair
            .private_key
            .private_key_to_pem_pkcs8()
            .crypto_context("encode private key")?;

        let existed = self.exists(id);
        if existed && !overwrite {
            return Err(PkiError::conflict(id.entity(), id.file_stem()));
        }

        // Stage both files before touching the final names
        let staged_key = self.stage(&key_pem, 0o600)?;
        let staged_cert = self.stage(&cert_pem, 0o644)?;

        let backups = if existed {
            Some(self.move_aside(id)?)
        } else {
            None
        };

        match self.commit(id, staged_key, staged_cert) {
            Ok(()) => {
                if let Some(backups) = backups {
                    backups.discard();
                }
                tracing::info!(entry = %id, replaced = existed, "stored key pair");
                Ok(())
            }
            Err(e) => {
                if let Some(backups) = backups {
                    backups.restore();
                }
                Err(e)
            }
        }
    }

    fn stage(&self, contents: &[u8], mode: u32) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(self.root)
            .map_err(|e| PkiError::io(self.root, e))?;
        file.write_all(contents)
            .and_then(|_| file.as_file().sync_all())
            .map_err(|e| PkiError::io(file.path(), e))?;
        set_mode(file.path(), mode)?;
        Ok(file)
    }

    fn commit(&self, id: &EntryId, key: NamedTempFile, cert: NamedTempFile) -> Result<()> {
        let key_path = self.key_path(id);
        let cert_path = self.cert_path(id);
        key.persist_noclobber(&key_path)
            .map_err(|e| persist_error(id, &key_path, e.error))?;
        if let Err(e) = cert.persist_noclobber(&cert_path) {
            // Never leave a key without its certificate
            if let Err(remove_err) = fs::remove_file(&key_path) {
                tracing::error!(path = %key_path.display(), error = %remove_err, "rollback failed");
            }
            return Err(persist_error(id, &cert_path, e.error));
        }
        Ok(())
    }

    fn move_aside(&self, id: &EntryId) -> Result<Backups> {
        let mut moved = Vec::new();
        for path in [self.key_path(id), self.cert_path(id)] {
            if !path.exists() {
                continue;
            }
            let backup = self.root.join(format!(
                "{}{}",
                TEMP_PREFIX,
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ));
            if let Err(e) = fs::rename(&path, &backup) {
                Backups { moved }.restore();
                return Err(PkiError::io(&path, e));
            }
            moved.push((path, backup));
        }
        Ok(Backups { moved })
    }

    /// Remove both files of an entry. Missing halves are tolerated as long
    /// as at least one file existed.
    pub fn delete(&self, id: &EntryId) -> Result<()> {
        let mut removed = 0;
        for path in [self.cert_path(id), self.key_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(PkiError::io(&path, e)),
            }
        }
        if removed == 0 {
            return Err(PkiError::not_found(id.entity(), id.file_stem()));
        }
        tracing::info!(entry = %id, "deleted key pair");
        Ok(())
    }
}

struct Backups {
    moved: Vec<(PathBuf, PathBuf)>,
}

impl Backups {
    fn restore(self) {
        for (original, backup) in self.moved {
            if let Err(e) = fs::rename(&backup, &original) {
                tracing::error!(path = %original.display(), error = %e, "failed to restore previous file");
            }
        }
    }

    fn discard(self) {
        for (_, backup) in self.moved {
            if let Err(e) = fs::remove_file(&backup) {
                tracing::warn!(path = %backup.display(), error = %e, "failed to remove replaced file");
            }
        }
    }
}

fn read_entry_file(path: &Path, id: &EntryId) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        if e.kind() == IoErrorKind::NotFound {
            PkiError::not_found(id.entity(), id.file_stem())
        } else {
            PkiError::io(path, e)
        }
    })
}

fn persist_error(id: &EntryId, path: &Path, error: std::io::Error) -> PkiError {
    if error.kind() == IoErrorKind::AlreadyExists {
        PkiError::conflict(id.entity(), id.file_stem())
    } else {
        PkiError::io(path, error)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| PkiError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Write `contents` to `path` through a temporary file in the same directory.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    write_atomic_with_mode(path, contents, 0o644)
}

/// Like [`write_atomic`], readable by the owner only. For files holding keys.
pub fn write_secret_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    write_atomic_with_mode(path, contents, 0o600)
}

fn write_atomic_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| PkiError::io(dir, e))?;
    file.write_all(contents)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| PkiError::io(file.path(), e))?;
    set_mode(file.path(), mode)?;
    file.persist(path).map_err(|e| PkiError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::generate_root_ca::RsaRootCABuilder;
    use crate::pki_generator::{generate_rsa_key, SubjectFields};
    use tempfile::TempDir;

    fn test_pair(cn: &str) -> StoredPair {
        let private_key = generate_rsa_key(2048).unwrap();
        let certificate = RsaRootCABuilder::new(SubjectFields::new(cn))
            .build(&private_key)
            .unwrap();
        StoredPair {
            certificate,
            private_key,
        }
    }

    fn test_storage() -> (Storage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("output")).unwrap();
        (storage, dir)
    }

    #[test]
    fn test_entry_id_naming() {
        let leaf = EntryId::leaf("device1.local", "Root-A").unwrap();
        assert_eq!(leaf.file_stem(), "device1.local_signed-by_Root-A");
        assert_eq!(leaf.issuer_name(), "Root-A");

        let wildcard = EntryId::leaf("*.lan", "Root-A").unwrap();
        assert_eq!(wildcard.file_stem(), "_wildcard.lan_signed-by_Root-A");

        assert_eq!(
            EntryId::parse("device1.local_signed-by_Root-A.pem").unwrap(),
            leaf
        );
        assert_eq!(
            EntryId::parse("Root-A").unwrap(),
            EntryId::Ca {
                name: "Root-A".into()
            }
        );
    }

    #[test]
    fn test_path_traversal_rejected() {
        for bad in [
            "../etc/passwd",
            "..",
            "a/b",
            "a\\b",
            ".hidden",
            "x_signed-by_y_signed-by_z",
            "tab\tname",
            "",
        ] {
            let err = EntryId::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValidationError, "{:?}", bad);
        }
        assert!(EntryId::ca("Root/../../x").is_err());
        for reserved in ["Lab.pem", "Lab.key", "Lab.PEM"] {
            let err = EntryId::ca(reserved).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValidationError, "{:?}", reserved);
            assert!(EntryId::leaf(reserved, "Root-A").is_err());
        }
        // A single trailing .pem is the identifier form; two are not
        assert_eq!(EntryId::parse("Lab.pem").unwrap(), EntryId::ca("Lab").unwrap());
        assert!(EntryId::parse("Lab.pem.pem").is_err());
        assert!(EntryId::leaf("device", "../Root").is_err());
    }

    #[test]
    fn test_save_load_and_list() {
        let (storage, _dir) = test_storage();
        assert!(storage.list_cas().unwrap().is_empty());

        let id = EntryId::ca("Root-B").unwrap();
        storage.save(&id, &test_pair("Root-B"), false).unwrap();
        let id_a = EntryId::ca("Root-A").unwrap();
        storage.save(&id_a, &test_pair("Root-A"), false).unwrap();

        assert_eq!(storage.list_cas().unwrap(), vec!["Root-A", "Root-B"]);
        assert!(storage.list_certificates().unwrap().is_empty());

        let loaded = storage.load_ca("Root-A").unwrap();
        assert!(loaded
            .certificate
            .public_key()
            .unwrap()
            .public_eq(&loaded.private_key));
    }

    #[test]
    fn test_save_conflict_keeps_original() {
        let (storage, _dir) = test_storage();
        let id = EntryId::ca("Root-A").unwrap();
        let first = test_pair("Root-A");
        storage.save(&id, &first, false).unwrap();

        let err = storage.save(&id, &test_pair("Root-A"), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let loaded = storage.load_ca("Root-A").unwrap();
        assert_eq!(
            loaded.certificate.to_der().unwrap(),
            first.certificate.to_der().unwrap()
        );
    }

    #[test]
    fn test_overwrite_replaces_pair() {
        let (storage, _dir) = test_storage();
        let id = EntryId::ca("Root-A").unwrap();
        storage.save(&id, &test_pair("Root-A"), false).unwrap();
        let second = test_pair("Root-A");
        storage.save(&id, &second, true).unwrap();

        let loaded = storage.load_ca("Root-A").unwrap();
        assert_eq!(
            loaded.certificate.to_der().unwrap(),
            second.certificate.to_der().unwrap()
        );
        // No staging or backup files left behind
        let stray: Vec<_> = fs::read_dir(storage.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(stray.is_empty());
    }

    #[test]
    fn test_missing_and_corrupt_entries() {
        let (storage, _dir) = test_storage();
        let err = storage.load_ca("Nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        fs::write(storage.root().join("Broken.pem"), b"not a certificate").unwrap();
        fs::write(storage.root().join("Broken.key"), b"not a key").unwrap();
        let err = storage.load_ca("Broken").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn test_mismatched_key_is_corrupt() {
        let (storage, _dir) = test_storage();
        let a = test_pair("Root-A");
        let b = test_pair("Root-B");
        fs::write(storage.root().join("Mixed.pem"), a.certificate.to_pem().unwrap()).unwrap();
        fs::write(
            storage.root().join("Mixed.key"),
            b.private_key.private_key_to_pem_pkcs8().unwrap(),
        )
        .unwrap();
        let err = storage.load_ca("Mixed").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn test_pkcs1_keys_load() {
        let (storage, _dir) = test_storage();
        let pair = test_pair("Legacy");
        let rsa = pair.private_key.rsa().unwrap();
        fs::write(storage.root().join("Legacy.pem"), pair.certificate.to_pem().unwrap()).unwrap();
        fs::write(
            storage.root().join("Legacy.key"),
            rsa.private_key_to_pem().unwrap(),
        )
        .unwrap();
        assert!(storage.load_ca("Legacy").is_ok());
    }

    #[test]
    fn test_half_pairs_are_not_listed() {
        let (storage, _dir) = test_storage();
        let pair = test_pair("Lonely");
        fs::write(storage.root().join("Lonely.pem"), pair.certificate.to_pem().unwrap()).unwrap();
        fs::write(storage.root().join("notes.txt"), b"hello").unwrap();
        assert!(storage.list_cas().unwrap().is_empty());
        assert_eq!(
            storage.load_ca("Lonely").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_delete_is_scoped() {
        let (storage, _dir) = test_storage();
        let root = EntryId::ca("Root-A").unwrap();
        let other = EntryId::ca("Root-AB").unwrap();
        storage.save(&root, &test_pair("Root-A"), false).unwrap();
        storage.save(&other, &test_pair("Root-AB"), false).unwrap();

        storage.delete(&root).unwrap();
        assert_eq!(storage.list_cas().unwrap(), vec!["Root-AB"]);
        assert!(!storage.root().join("Root-A.key").exists());

        let err = storage.delete(&root).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let (storage, _dir) = test_storage();
        let id = EntryId::ca("Root-A").unwrap();
        storage.save(&id, &test_pair("Root-A"), false).unwrap();
        let mode = fs::metadata(storage.root().join("Root-A.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_issued_serials() {
        let (storage, _dir) = test_storage();
        let pair = test_pair("Root-A");
        let ca_serial = serial_hex(pair.certificate.serial_number()).unwrap();
        storage
            .save(&EntryId::ca("Root-A").unwrap(), &pair, false)
            .unwrap();

        let serials = storage.read(|view| view.issued_serials("Root-A")).unwrap();
        assert!(serials.contains(&ca_serial));
        let all = storage.read(|view| view.ca_serials()).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_write_atomic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bundle.pfx");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bundle.pfx");
        write_secret_atomic(&path, b"der").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
