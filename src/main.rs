//! pki-forge - Local Certificate Authority Manager
//!
//! Command line front end over [`PkiManager`]. Every subcommand maps onto one
//! manager operation; `serve` exposes the same operations over a Unix socket.
//!
//! Results go to stdout (plain text, or JSON with `--json`); logs go to
//! stderr and are filtered with `RUST_LOG` (default `pki_forge=info`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pki_forge::configs::{AppConfig, DEFAULT_CONFIG_PATH};
use pki_forge::manager::{CertificateRequest, PkiManager};
use pki_forge::pki_generator::SubjectFields;
use pki_forge::trust_store::InstallOutcome;
use secrecy::SecretString;
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pki-forge")]
#[command(about = "Local certificate authority manager", long_about = None)]
struct Cli {
    /// Configuration file (missing file means defaults)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the certificate output directory
    #[arg(short, long, global = true)]
    output_dir: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a self-signed root CA
    CreateCa {
        /// Common name, also the CA's name in the store
        #[arg(long)]
        cn: String,
        #[arg(long, default_value = "")]
        country: String,
        #[arg(long, default_value = "")]
        state: String,
        #[arg(long, default_value = "")]
        locality: String,
        #[arg(long, default_value = "")]
        organization: String,
        /// Validity in days (default from config)
        #[arg(long)]
        days: Option<u32>,
    },
    /// Issue a device certificate signed by a CA
    CreateCert {
        #[arg(long)]
        cn: String,
        /// Subject Alternative Names, comma or space separated
        #[arg(long, default_value = "")]
        sans: String,
        /// Name of the signing CA
        #[arg(long)]
        ca: String,
        #[arg(long)]
        days: Option<u32>,
        /// Replace an existing certificate with the same identifier
        #[arg(long)]
        replace: bool,
    },
    /// List CA names
    ListCas,
    /// List device certificate identifiers
    ListCerts,
    /// Delete a CA (its device certificates are kept)
    DeleteCa { name: String },
    /// Delete a device certificate
    DeleteCert { identifier: String },
    /// Show certificate details
    Inspect { identifier: String },
    /// Export a device certificate, key and CA chain as PKCS#12
    Export {
        identifier: String,
        /// Destination file (default: <output-dir>/<identifier>.pfx)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Bundle password; prompted for when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Install a CA into this machine's trust store
    InstallCa { name: String },
    /// Build an installer archive for distributing a CA
    GenerateInstaller {
        name: String,
        /// Destination directory (default: the output directory)
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Report whether trust store installs are possible
    IsPrivileged,
    /// Serve the JSON protocol on a Unix socket
    Serve {
        /// Socket path (default from config)
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pki_forge=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(dir) = &cli.output_dir {
        config.store.output_dir = dir.clone();
    }
    let manager = PkiManager::new(config).context("Failed to open certificate store")?;

    run(cli.command, manager, cli.json)
}

fn run(command: Commands, manager: PkiManager, json: bool) -> Result<()> {
    match command {
        Commands::CreateCa {
            cn,
            country,
            state,
            locality,
            organization,
            days,
        } => {
            let subject = SubjectFields {
                country,
                state,
                locality,
                organization,
                common_name: cn,
            };
            let name = manager.create_ca(&subject, days)?;
            emit(json, &serde_json::json!({ "name": name }), || {
                format!("Created CA '{}'", name)
            })
        }
        Commands::CreateCert {
            cn,
            sans,
            ca,
            days,
            replace,
        } => {
            let identifier = manager.create_certificate(&CertificateRequest {
                common_name: cn,
                subject_alt_names: sans,
                issuer: ca,
                expiry_days: days,
                replace,
            })?;
            emit(json, &serde_json::json!({ "identifier": identifier }), || {
                format!("Created certificate '{}'", identifier)
            })
        }
        Commands::ListCas => {
            let names = manager.list_cas()?;
            emit(json, &names, || names.join("\n"))
        }
        Commands::ListCerts => {
            let identifiers = manager.list_certificates()?;
            emit(json, &identifiers, || identifiers.join("\n"))
        }
        Commands::DeleteCa { name } => {
            let orphaned = manager.delete_ca(&name)?;
            emit(
                json,
                &serde_json::json!({ "name": name, "orphaned": orphaned }),
                || {
                    let mut text = format!("Deleted CA '{}'", name);
                    if !orphaned.is_empty() {
                        text.push_str("\nOrphaned certificates:");
                        for id in &orphaned {
                            text.push_str("\n  ");
                            text.push_str(id);
                        }
                    }
                    text
                },
            )
        }
        Commands::DeleteCert { identifier } => {
            manager.delete_certificate(&identifier)?;
            emit(json, &serde_json::json!({ "identifier": identifier }), || {
                format!("Deleted certificate '{}'", identifier)
            })
        }
        Commands::Inspect { identifier } => {
            let d = manager.inspect_certificate(&identifier)?;
            emit(json, &d, || {
                let ips: Vec<String> = d.ip_addresses.iter().map(|ip| ip.to_string()).collect();
                format!(
                    "Identifier:   {}\nSubject CN:   {}\nIssuer CN:    {}\nIssuer:       {:?}\nNot before:   {}\nNot after:    {}\nSerial:       {}\nDNS names:    {}\nIP addresses: {}\nSHA-256:      {}",
                    d.identifier,
                    d.subject_common_name,
                    d.issuer_common_name,
                    d.issuer_status,
                    d.not_before,
                    d.not_after,
                    d.serial_number,
                    d.dns_names.join(", "),
                    ips.join(", "),
                    d.sha256_fingerprint
                )
            })
        }
        Commands::Export {
            identifier,
            out,
            password,
        } => {
            let password = match password {
                Some(password) => SecretString::from(password),
                None => SecretString::from(
                    rpassword::prompt_password("PKCS#12 password: ")
                        .context("Failed to read password")?,
                ),
            };
            let path = manager.export_bundle_to(&identifier, &password, out.as_deref())?;
            emit(json, &serde_json::json!({ "path": path }), || {
                format!("Exported '{}' to {}", identifier, path.display())
            })
        }
        Commands::InstallCa { name } => {
            let outcome = manager.install_ca(&name)?;
            emit(
                json,
                &serde_json::json!({ "name": name, "outcome": outcome }),
                || match outcome {
                    InstallOutcome::Installed => format!("Installed CA '{}'", name),
                    InstallOutcome::AlreadyInstalled => {
                        format!("CA '{}' is already installed", name)
                    }
                },
            )
        }
        Commands::GenerateInstaller { name, out_dir } => {
            let path = manager.generate_installer_to(&name, out_dir.as_deref())?;
            emit(json, &serde_json::json!({ "path": path }), || {
                format!("Installer written to {}", path.display())
            })
        }
        Commands::IsPrivileged => {
            let privileged = manager.is_privileged();
            emit(json, &serde_json::json!({ "privileged": privileged }), || {
                privileged.to_string()
            })
        }
        Commands::Serve { socket } => serve(manager, socket),
    }
}

#[cfg(unix)]
fn serve(manager: PkiManager, socket: Option<PathBuf>) -> Result<()> {
    let socket = socket.unwrap_or_else(|| manager.config().server.socket_path.clone());
    pki_forge::external_interface::start_socket_server(std::sync::Arc::new(manager), &socket)
}

#[cfg(not(unix))]
fn serve(_manager: PkiManager, _socket: Option<PathBuf>) -> Result<()> {
    anyhow::bail!("The socket server needs Unix domain sockets")
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("Failed to encode output")?
        );
    } else {
        let text = text();
        if !text.is_empty() {
            println!("{}", text);
        }
    }
    Ok(())
}
