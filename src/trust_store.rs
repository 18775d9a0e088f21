//! Operating-system trust store integration.
//!
//! [`TrustStore`] is the seam between the manager and the host: one
//! implementation per platform, picked once by [`platform_trust_store`].
//! Every external command runs through [`run_command`], which bounds the wait
//! and kills the child when the deadline passes.

use crate::configs::TrustStoreConfig;
use crate::error::{CryptoContext, PkiError, Result};
use crate::inspect::sha256_fingerprint;
use openssl::x509::X509Ref;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallOutcome {
    Installed,
    AlreadyInstalled,
}

/// Platform trust store capability.
///
/// The manager checks [`supported`](TrustStore::supported) and
/// [`is_privileged`](TrustStore::is_privileged) before calling
/// [`install`](TrustStore::install), and skips the install when
/// [`is_installed`](TrustStore::is_installed) already finds the certificate.
pub trait TrustStore: Send + Sync {
    fn platform(&self) -> &'static str;

    fn supported(&self) -> bool {
        true
    }

    fn is_privileged(&self) -> bool;

    /// A certificate with the same fingerprint is already trusted.
    fn is_installed(&self, name: &str, certificate: &X509Ref) -> Result<bool>;

    fn install(&self, name: &str, certificate: &X509Ref) -> Result<()>;
}

/// Trust store for the platform this binary was compiled for.
pub fn platform_trust_store(config: &TrustStoreConfig) -> Box<dyn TrustStore> {
    let timeout = Duration::from_secs(config.command_timeout_secs);
    native_trust_store(config, timeout)
}

#[cfg(target_os = "linux")]
fn native_trust_store(config: &TrustStoreConfig, timeout: Duration) -> Box<dyn TrustStore> {
    Box::new(LinuxTrustStore {
        anchor_dir: config.linux_anchor_dir.clone(),
        timeout,
    })
}

#[cfg(target_os = "macos")]
fn native_trust_store(_config: &TrustStoreConfig, timeout: Duration) -> Box<dyn TrustStore> {
    Box::new(MacTrustStore { timeout })
}

#[cfg(windows)]
fn native_trust_store(_config: &TrustStoreConfig, timeout: Duration) -> Box<dyn TrustStore> {
    Box::new(WindowsTrustStore { timeout })
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn native_trust_store(_config: &TrustStoreConfig, _timeout: Duration) -> Box<dyn TrustStore> {
    Box::new(UnsupportedTrustStore)
}

/// Captured result of an external command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// One-line description of a failed run.
    pub fn failure_summary(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.status.code() {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Run `program` with `args`, waiting at most `timeout`.
///
/// A program that cannot be started surfaces as `Io` with the program name
/// as path; an expired deadline kills the child and returns `OperationTimeout`.
pub fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    let command_line = format!("{} {}", program, args.join(" "));
    tracing::debug!(command = %command_line, "running external command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PkiError::io(Path::new(program), e))?;

    // Drain both pipes on their own threads so a chatty child cannot block
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(command = %command_line, seconds = timeout.as_secs(), "command timed out");
                return Err(PkiError::OperationTimeout {
                    command: command_line,
                    seconds: timeout.as_secs(),
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(PkiError::io(Path::new(program), e)),
        }
    };

    Ok(CommandOutput {
        status,
        stdout: join_reader(stdout_reader),
        stderr: join_reader(stderr_reader),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Run a command and turn a non-zero exit into an error naming it.
fn run_checked(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    let output = run_command(program, args, timeout)?;
    if !output.success() {
        return Err(PkiError::io(
            Path::new(program),
            std::io::Error::other(format!(
                "`{} {}` failed: {}",
                program,
                args.join(" "),
                output.failure_summary()
            )),
        ));
    }
    Ok(output)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn effective_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Copies the CA into the distribution anchor directory and refreshes the
/// system bundle.
#[cfg(target_os = "linux")]
pub struct LinuxTrustStore {
    pub anchor_dir: std::path::PathBuf,
    pub timeout: Duration,
}

#[cfg(target_os = "linux")]
impl LinuxTrustStore {
    fn refresh(&self) -> Result<()> {
        match run_checked("update-ca-certificates", &[], self.timeout) {
            Ok(_) => Ok(()),
            Err(PkiError::Io { ref source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                tracing::info!("update-ca-certificates not found, trying trust extract-compat");
                run_checked("trust", &["extract-compat"], self.timeout).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(target_os = "linux")]
impl TrustStore for LinuxTrustStore {
    fn platform(&self) -> &'static str {
        "linux"
    }

    fn is_privileged(&self) -> bool {
        effective_root()
    }

    fn is_installed(&self, _name: &str, certificate: &X509Ref) -> Result<bool> {
        let wanted = sha256_fingerprint(certificate)?;
        let entries = match std::fs::read_dir(&self.anchor_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(PkiError::io(&self.anchor_dir, e)),
        };
        for entry in entries.flatten() {
            let Ok(pem) = std::fs::read(entry.path()) else {
                continue;
            };
            let Ok(existing) = openssl::x509::X509::from_pem(&pem) else {
                continue;
            };
            if sha256_fingerprint(&existing)? == wanted {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn install(&self, name: &str, certificate: &X509Ref) -> Result<()> {
        std::fs::create_dir_all(&self.anchor_dir)
            .map_err(|e| PkiError::io(&self.anchor_dir, e))?;
        let anchor = self.anchor_dir.join(format!("{}.crt", name));
        let pem = certificate.to_pem().crypto_context("encode certificate")?;
        crate::storage::write_atomic(&anchor, &pem)?;
        if let Err(e) = self.refresh() {
            let _ = std::fs::remove_file(&anchor);
            return Err(e);
        }
        tracing::info!(anchor = %anchor.display(), "installed CA into system trust store");
        Ok(())
    }
}

/// Adds the CA to the System keychain as a trusted root.
#[cfg(target_os = "macos")]
pub struct MacTrustStore {
    pub timeout: Duration,
}

#[cfg(target_os = "macos")]
const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

#[cfg(target_os = "macos")]
impl TrustStore for MacTrustStore {
    fn platform(&self) -> &'static str {
        "macos"
    }

    fn is_privileged(&self) -> bool {
        effective_root()
    }

    fn is_installed(&self, _name: &str, certificate: &X509Ref) -> Result<bool> {
        let wanted = sha256_fingerprint(certificate)?;
        let common_name =
            crate::pki_generator::common_name_of(certificate.subject_name()).unwrap_or_default();
        let output = run_command(
            "security",
            &["find-certificate", "-a", "-Z", "-c", &common_name, SYSTEM_KEYCHAIN],
            self.timeout,
        )?;
        Ok(output.success() && output.stdout.to_ascii_uppercase().contains(&wanted))
    }

    fn install(&self, _name: &str, certificate: &X509Ref) -> Result<()> {
        let staged = stage_certificate(certificate, ".pem")?;
        let path = staged.path().to_string_lossy().into_owned();
        run_checked(
            "security",
            &["add-trusted-cert", "-d", "-r", "trustRoot", "-k", SYSTEM_KEYCHAIN, &path],
            self.timeout,
        )?;
        tracing::info!("installed CA into the System keychain");
        Ok(())
    }
}

/// Adds the CA to the machine ROOT store with certutil.
#[cfg(windows)]
pub struct WindowsTrustStore {
    pub timeout: Duration,
}

#[cfg(windows)]
impl TrustStore for WindowsTrustStore {
    fn platform(&self) -> &'static str {
        "windows"
    }

    fn is_privileged(&self) -> bool {
        // `net session` only succeeds from an elevated prompt
        run_command("net", &["session"], self.timeout)
            .map(|output| output.success())
            .unwrap_or(false)
    }

    fn is_installed(&self, _name: &str, certificate: &X509Ref) -> Result<bool> {
        let thumbprint = certificate
            .digest(openssl::hash::MessageDigest::sha1())
            .crypto_context("compute thumbprint")?;
        let thumbprint = hex::encode(thumbprint);
        let output = run_command("certutil", &["-store", "ROOT", &thumbprint], self.timeout)?;
        Ok(output.success())
    }

    fn install(&self, _name: &str, certificate: &X509Ref) -> Result<()> {
        let staged = stage_certificate(certificate, ".cer")?;
        let path = staged.path().to_string_lossy().into_owned();
        run_checked("certutil", &["-addstore", "-f", "ROOT", &path], self.timeout)?;
        tracing::info!("installed CA into the ROOT store");
        Ok(())
    }
}

#[cfg(any(target_os = "macos", windows))]
fn stage_certificate(certificate: &X509Ref, suffix: &str) -> Result<tempfile::NamedTempFile> {
    use std::io::Write;
    let pem = certificate.to_pem().crypto_context("encode certificate")?;
    let mut file = tempfile::Builder::new()
        .prefix("pki-forge-ca-")
        .suffix(suffix)
        .tempfile()
        .map_err(|e| PkiError::io(&std::env::temp_dir(), e))?;
    file.write_all(&pem)
        .map_err(|e| PkiError::io(file.path(), e))?;
    Ok(file)
}

/// Fallback for targets without a known trust store.
pub struct UnsupportedTrustStore;

impl TrustStore for UnsupportedTrustStore {
    fn platform(&self) -> &'static str {
        std::env::consts::OS
    }

    fn supported(&self) -> bool {
        false
    }

    fn is_privileged(&self) -> bool {
        false
    }

    fn is_installed(&self, _name: &str, _certificate: &X509Ref) -> Result<bool> {
        Ok(false)
    }

    fn install(&self, _name: &str, _certificate: &X509Ref) -> Result<()> {
        Err(PkiError::Unsupported {
            operation: "installing a CA into the trust store",
            platform: std::env::consts::OS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[cfg(unix)]
    #[test]
    fn test_run_command_captures_output() {
        let output = run_command("sh", &["-c", "echo out; echo err >&2"], Duration::from_secs(10))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_times_out() {
        let started = Instant::now();
        let err = run_command("sleep", &["5"], Duration::from_millis(200)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationTimeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_summary_prefers_stderr() {
        let output = run_command("sh", &["-c", "echo nope >&2; exit 3"], Duration::from_secs(10))
            .unwrap();
        assert!(!output.success());
        assert_eq!(output.failure_summary(), "nope");

        let output = run_command("sh", &["-c", "exit 4"], Duration::from_secs(10)).unwrap();
        assert_eq!(output.failure_summary(), "exit code 4");
    }

    #[test]
    fn test_missing_program_is_io_error() {
        let err = run_command(
            "pki-forge-definitely-not-a-command",
            &[],
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IOError);
    }

    #[test]
    fn test_unsupported_store() {
        let store = UnsupportedTrustStore;
        assert!(!store.supported());
        assert!(!store.is_privileged());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_fingerprint_lookup() {
        use crate::generate_root_ca::RsaRootCABuilder;
        use crate::pki_generator::{generate_rsa_key, SubjectFields};

        let dir = tempfile::TempDir::new().unwrap();
        let store = LinuxTrustStore {
            anchor_dir: dir.path().join("anchors"),
            timeout: Duration::from_secs(5),
        };
        let key = generate_rsa_key(2048).unwrap();
        let cert = RsaRootCABuilder::new(SubjectFields::new("Root-A"))
            .build(&key)
            .unwrap();
        assert!(!store.is_installed("Root-A", &cert).unwrap());

        std::fs::create_dir_all(&store.anchor_dir).unwrap();
        // Installed under a different file name still counts
        std::fs::write(
            store.anchor_dir.join("renamed.crt"),
            cert.to_pem().unwrap(),
        )
        .unwrap();
        assert!(store.is_installed("Root-A", &cert).unwrap());
    }
}
