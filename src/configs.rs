use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "pki-forge.toml";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ca_defaults: CADefaults,
    #[serde(default)]
    pub certificate_defaults: CertificateDefaults,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub trust_store: TrustStoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// Fallbacks for blank CA subject fields. A field that is blank both in the
/// request and here is left out of the distinguished name.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CADefaults {
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default = "default_ca_validity")]
    pub validity_days: u32,
    #[serde(default = "default_ca_key_bits")]
    pub key_bits: u32,
}

impl Default for CADefaults {
    fn default() -> Self {
        Self {
            country: String::new(),
            state: String::new(),
            locality: String::new(),
            organization: String::new(),
            validity_days: default_ca_validity(),
            key_bits: default_ca_key_bits(),
        }
    }
}

fn default_ca_validity() -> u32 {
    3650 // 10 years
}

fn default_ca_key_bits() -> u32 {
    4096
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CertificateDefaults {
    #[serde(default = "default_cert_validity")]
    pub validity_days: u32,
    #[serde(default = "default_cert_key_bits")]
    pub key_bits: u32,
    #[serde(default = "default_true")]
    pub include_common_name_in_sans: bool,
}

impl Default for CertificateDefaults {
    fn default() -> Self {
        Self {
            validity_days: default_cert_validity(),
            key_bits: default_cert_key_bits(),
            include_common_name_in_sans: true,
        }
    }
}

fn default_cert_validity() -> u32 {
    730 // 2 years
}

fn default_cert_key_bits() -> u32 {
    2048
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ExportConfig {
    /// PBE-SHA1-3DES + SHA-1 MAC instead of the OpenSSL 3 AES/PBKDF2 defaults.
    #[serde(default)]
    pub legacy_algorithms: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TrustStoreConfig {
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_linux_anchor_dir")]
    pub linux_anchor_dir: PathBuf,
}

impl Default for TrustStoreConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            linux_anchor_dir: default_linux_anchor_dir(),
        }
    }
}

fn default_command_timeout() -> u64 {
    60
}

fn default_linux_anchor_dir() -> PathBuf {
    PathBuf::from("/usr/local/share/ca-certificates")
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/pki_forge.sock")
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration from `path`, or fall back to defaults when the file
    /// does not exist. A file that exists but fails to parse is still an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }
}
