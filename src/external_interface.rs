//! External Interface Module
//!
//! Unix socket IPC for external applications. Each connection carries one
//! framed [`Request`] and receives one framed [`Response`]; connections are
//! served on their own threads against a shared [`PkiManager`].

use crate::error::PkiError;
use crate::manager::PkiManager;
use crate::protocol::{
    deserialize_request, read_frame, serialize_response, write_frame, Request, Response,
};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secrecy::SecretString;
use std::fs;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long a connected client may take to send its request.
pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind `socket_path` and serve requests until the listener fails.
///
/// A stale socket file from a previous run is removed first.
pub fn start_socket_server(manager: Arc<PkiManager>, socket_path: &Path) -> Result<()> {
    if socket_path.exists() {
        fs::remove_file(socket_path).with_context(|| {
            format!(
                "Failed to remove existing socket at {}",
                socket_path.display()
            )
        })?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind Unix socket at {}", socket_path.display()))?;
    tracing::info!(socket = %socket_path.display(), "socket server listening");

    serve(listener, manager);
    Ok(())
}

/// Accept loop; one thread per connection.
pub fn serve(listener: UnixListener, manager: Arc<PkiManager>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &manager) {
                        tracing::warn!(error = %format!("{:#}", e), "error handling client request");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "error accepting connection");
            }
        }
    }
}

/// Handle an individual client connection
pub fn handle_client(stream: UnixStream, manager: &PkiManager) -> Result<()> {
    handle_client_with_timeout(stream, manager, CLIENT_READ_TIMEOUT)
}

/// Like [`handle_client`], giving up when no request arrives within `timeout`.
pub fn handle_client_with_timeout(
    mut stream: UnixStream,
    manager: &PkiManager,
    timeout: Duration,
) -> Result<()> {
    stream
        .set_read_timeout(Some(timeout))
        .context("Failed to set socket read timeout")?;
    let payload = read_frame(&mut stream)?;
    let response = match deserialize_request(&payload) {
        Ok(request) => {
            let operation = request.operation();
            tracing::debug!(operation, "received request");
            let response = dispatch(manager, request);
            if let Response::Error { kind, message } = &response {
                tracing::warn!(operation, ?kind, message = %message, "request failed");
            }
            response
        }
        Err(e) => Response::Error {
            kind: crate::error::ErrorKind::ValidationError,
            message: format!("{:#}", e),
        },
    };

    let (_, framed) = serialize_response(&response)?;
    write_frame(&mut stream, &framed)
}

/// Map a request onto the manager and its outcome onto a response.
pub fn dispatch(manager: &PkiManager, request: Request) -> Response {
    let result = match request {
        Request::CreateCA {
            subject,
            expiry_days,
        } => manager
            .create_ca(&subject, expiry_days)
            .map(|name| Response::CreateCAResponse { name }),
        Request::CreateCertificate { request } => manager
            .create_certificate(&request)
            .map(|identifier| Response::CreateCertificateResponse { identifier }),
        Request::ListCAs => manager
            .list_cas()
            .map(|names| Response::ListCAsResponse { names }),
        Request::ListCertificates => manager
            .list_certificates()
            .map(|identifiers| Response::ListCertificatesResponse { identifiers }),
        Request::DeleteCA { name } => manager
            .delete_ca(&name)
            .map(|orphaned| Response::DeleteCAResponse { name, orphaned }),
        Request::DeleteCertificate { identifier } => manager
            .delete_certificate(&identifier)
            .map(|()| Response::DeleteCertificateResponse { identifier }),
        Request::InspectCertificate { identifier } => manager
            .inspect_certificate(&identifier)
            .map(|details| Response::InspectCertificateResponse { details }),
        Request::ExportBundle {
            identifier,
            password,
        } => {
            let password = SecretString::from(password);
            manager
                .export_bundle(&identifier, &password)
                .map(|der| Response::ExportBundleResponse {
                    identifier,
                    pkcs12_base64: BASE64.encode(der),
                })
        }
        Request::InstallCA { name } => manager
            .install_ca(&name)
            .map(|outcome| Response::InstallCAResponse { name, outcome }),
        Request::GenerateInstaller { name } => {
            manager
                .generate_installer(&name)
                .map(|package| Response::GenerateInstallerResponse {
                    file_name: package.file_name,
                    archive_base64: BASE64.encode(package.bytes),
                })
        }
        Request::IsPrivileged => Ok(Response::IsPrivilegedResponse {
            privileged: manager.is_privileged(),
        }),
    };
    result.unwrap_or_else(|e| error_response(&e))
}

fn error_response(error: &PkiError) -> Response {
    Response::Error {
        kind: error.kind(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::AppConfig;
    use crate::error::ErrorKind;
    use crate::pki_generator::SubjectFields;
    use crate::protocol::{deserialize_response, serialize_request};
    use crate::trust_store::UnsupportedTrustStore;
    use tempfile::TempDir;

    fn test_manager() -> (Arc<PkiManager>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.store.output_dir = dir.path().join("output");
        config.ca_defaults.key_bits = 2048;
        let manager =
            PkiManager::with_trust_store(config, Box::new(UnsupportedTrustStore)).unwrap();
        (Arc::new(manager), dir)
    }

    fn round_trip(manager: &Arc<PkiManager>, request: &Request) -> Response {
        let (client, server) = UnixStream::pair().unwrap();
        let manager = Arc::clone(manager);
        let worker = thread::spawn(move || handle_client(server, &manager));

        let mut client = client;
        let (_, framed) = serialize_request(request).unwrap();
        write_frame(&mut client, &framed).unwrap();
        let payload = read_frame(&mut client).unwrap();
        worker.join().unwrap().unwrap();
        deserialize_response(&payload).unwrap()
    }

    #[test]
    fn test_create_and_list_over_socket() {
        let (manager, _dir) = test_manager();
        let response = round_trip(
            &manager,
            &Request::CreateCA {
                subject: SubjectFields::new("Root-A"),
                expiry_days: Some(365),
            },
        );
        assert!(matches!(response, Response::CreateCAResponse { ref name } if name == "Root-A"));

        match round_trip(&manager, &Request::ListCAs) {
            Response::ListCAsResponse { names } => assert_eq!(names, vec!["Root-A"]),
            other => panic!("Wrong response type: {:?}", other),
        }
    }

    #[test]
    fn test_errors_carry_kind() {
        let (manager, _dir) = test_manager();
        let response = round_trip(
            &manager,
            &Request::InspectCertificate {
                identifier: "ghost_signed-by_Root-A".into(),
            },
        );
        match response {
            Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
            other => panic!("Wrong response type: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_request() {
        let (manager, _dir) = test_manager();
        let (mut client, server) = UnixStream::pair().unwrap();
        let manager_clone = Arc::clone(&manager);
        let worker = thread::spawn(move || handle_client(server, &manager_clone));

        let body = br#"{"type":"Nope"}"#;
        let mut framed = (body.len() as u32).to_le_bytes().to_vec();
        framed.extend_from_slice(body);
        write_frame(&mut client, &framed).unwrap();
        let payload = read_frame(&mut client).unwrap();
        worker.join().unwrap().unwrap();

        match deserialize_response(&payload).unwrap() {
            Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::ValidationError),
            other => panic!("Wrong response type: {:?}", other),
        }
    }

    #[test]
    fn test_silent_client_times_out() {
        let (manager, _dir) = test_manager();
        let (client, server) = UnixStream::pair().unwrap();
        let started = std::time::Instant::now();
        let result = handle_client_with_timeout(server, &manager, Duration::from_millis(200));
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(client);
    }

    #[test]
    fn test_installer_is_base64() {
        let (manager, _dir) = test_manager();
        manager
            .create_ca(&SubjectFields::new("Root-A"), None)
            .unwrap();
        match dispatch(&manager, Request::GenerateInstaller { name: "Root-A".into() }) {
            Response::GenerateInstallerResponse {
                file_name,
                archive_base64,
            } => {
                assert_eq!(file_name, "Root-A_Installer.tar");
                assert!(!BASE64.decode(archive_base64).unwrap().is_empty());
            }
            other => panic!("Wrong response type: {:?}", other),
        }
    }
}
