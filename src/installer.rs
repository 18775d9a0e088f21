//! Stand-alone CA installer archives.
//!
//! The archive is meant to be copied to another machine and run there. It
//! holds only public material:
//!
//! ```text
//! <name>_Installer.tar
//!   <name>.pem        CA certificate
//!   install-ca.bat    Windows: admin check, certutil -addstore ROOT
//!   install-ca.sh     Linux/macOS: root check, platform install
//!   README.txt        instructions and SHA-256 fingerprint
//! ```

use crate::error::{CryptoContext, PkiError, Result};
use crate::inspect::sha256_fingerprint;
use openssl::x509::X509Ref;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tar::{Builder, Header};

#[derive(Debug)]
pub struct InstallerPackage {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub fn installer_file_name(ca_name: &str) -> String {
    format!("{}_Installer.tar", ca_name)
}

/// Build the installer archive for `ca_name` in memory.
pub fn build_installer(ca_name: &str, certificate: &X509Ref) -> Result<InstallerPackage> {
    let file_name = installer_file_name(ca_name);
    let cert_pem = certificate.to_pem().crypto_context("encode certificate")?;
    let fingerprint = sha256_fingerprint(certificate)?;
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let files: [(String, Vec<u8>, u32); 4] = [
        (format!("{}.pem", ca_name), cert_pem, 0o644),
        ("install-ca.bat".to_string(), windows_script(ca_name).into_bytes(), 0o644),
        ("install-ca.sh".to_string(), unix_script(ca_name).into_bytes(), 0o755),
        ("README.txt".to_string(), readme(ca_name, &fingerprint).into_bytes(), 0o644),
    ];

    let archive_err = |e: std::io::Error| PkiError::io(Path::new(&file_name), e);
    let mut builder = Builder::new(Vec::new());
    for (path, data, mode) in &files {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_mtime(mtime);
        header.set_cksum();
        builder
            .append_data(&mut header, path, data.as_slice())
            .map_err(archive_err)?;
    }
    let bytes = builder.into_inner().map_err(archive_err)?;

    tracing::info!(ca = ca_name, file = %file_name, size = bytes.len(), "built installer archive");
    Ok(InstallerPackage { file_name, bytes })
}

/// `%` doubles inside batch files; `^` and `&` need a caret outside quotes.
fn batch_escape(value: &str, quoted: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%%"),
            '^' | '&' if !quoted => {
                out.push('^');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn windows_script(ca_name: &str) -> String {
    let lines = [
        "@echo off".to_string(),
        "setlocal".to_string(),
        String::new(),
        "net session >nul 2>&1".to_string(),
        "if %errorLevel% neq 0 (".to_string(),
        "    echo Failure: run this script as Administrator.".to_string(),
        "    pause >nul".to_string(),
        "    exit /b 1".to_string(),
        ")".to_string(),
        String::new(),
        format!(
            "echo [*] Installing the {} certificate...",
            batch_escape(ca_name, false)
        ),
        format!(
            "certutil.exe -addstore -f \"ROOT\" \"%~dp0{}.pem\"",
            batch_escape(ca_name, true)
        ),
        "echo.".to_string(),
        "pause".to_string(),
        "endlocal".to_string(),
    ];
    let mut script = lines.join("\r\n");
    script.push_str("\r\n");
    script
}

fn unix_script(ca_name: &str) -> String {
    format!(
        r#"#!/bin/sh
set -e

CA_NAME={name}
DIR="$(cd "$(dirname "$0")" && pwd)"
CERT="$DIR/$CA_NAME.pem"

if [ "$(id -u)" -ne 0 ]; then
    echo "Failure: run this script as root (sudo $0)." >&2
    exit 1
fi

case "$(uname -s)" in
    Darwin)
        security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain "$CERT"
        ;;
    Linux)
        if command -v update-ca-certificates >/dev/null 2>&1; then
            cp "$CERT" "/usr/local/share/ca-certificates/$CA_NAME.crt"
            update-ca-certificates
        elif command -v trust >/dev/null 2>&1; then
            trust anchor "$CERT"
        else
            echo "Failure: neither update-ca-certificates nor trust is available." >&2
            exit 1
        fi
        ;;
    *)
        echo "Failure: unsupported system $(uname -s)." >&2
        exit 1
        ;;
esac

echo "Installed the $CA_NAME certificate."
"#,
        name = shell_quote(ca_name)
    )
}

fn readme(ca_name: &str, fingerprint: &str) -> String {
    format!(
        "{name} CA installer\n\
         \n\
         This archive adds the {name} certificate authority to a machine's\n\
         trusted root store. It contains no private key.\n\
         \n\
         Windows:      right-click install-ca.bat and choose \"Run as administrator\".\n\
         Linux/macOS:  sudo ./install-ca.sh\n\
         \n\
         Before installing, check that the certificate fingerprint matches:\n\
         \n\
         SHA-256: {fingerprint}\n",
        name = ca_name,
        fingerprint = fingerprint
    )
}
