//! Protocol Module
//!
//! Defines the IPC protocol for pki-forge: request/response types and the
//! length-prefixed framing used on the socket.
//!
//! Every message is a 4-byte little-endian length followed by that many bytes
//! of JSON. Requests and responses are tagged by a `"type"` field. Binary
//! payloads (PKCS#12 bundles, installer archives) travel base64-encoded.

use crate::error::ErrorKind;
use crate::inspect::CertificateDetails;
use crate::manager::CertificateRequest;
use crate::pki_generator::SubjectFields;
use crate::trust_store::InstallOutcome;
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Upper bound on a single frame; installer archives are a few KiB.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Operations a socket client can ask for.
#[derive(Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Request {
    CreateCA {
        subject: SubjectFields,
        #[serde(default)]
        expiry_days: Option<u32>,
    },
    CreateCertificate {
        request: CertificateRequest,
    },
    ListCAs,
    ListCertificates,
    DeleteCA {
        name: String,
    },
    DeleteCertificate {
        identifier: String,
    },
    InspectCertificate {
        identifier: String,
    },
    ExportBundle {
        identifier: String,
        #[serde(default)]
        password: String,
    },
    InstallCA {
        name: String,
    },
    GenerateInstaller {
        name: String,
    },
    IsPrivileged,
}

impl Request {
    /// Variant name, for logs. Requests themselves are never logged since
    /// they can carry an export password.
    pub fn operation(&self) -> &'static str {
        match self {
            Request::CreateCA { .. } => "CreateCA",
            Request::CreateCertificate { .. } => "CreateCertificate",
            Request::ListCAs => "ListCAs",
            Request::ListCertificates => "ListCertificates",
            Request::DeleteCA { .. } => "DeleteCA",
            Request::DeleteCertificate { .. } => "DeleteCertificate",
            Request::InspectCertificate { .. } => "InspectCertificate",
            Request::ExportBundle { .. } => "ExportBundle",
            Request::InstallCA { .. } => "InstallCA",
            Request::GenerateInstaller { .. } => "GenerateInstaller",
            Request::IsPrivileged => "IsPrivileged",
        }
    }
}

/// One response per request; failures come back as `Error`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Response {
    CreateCAResponse {
        name: String,
    },
    CreateCertificateResponse {
        identifier: String,
    },
    ListCAsResponse {
        names: Vec<String>,
    },
    ListCertificatesResponse {
        identifiers: Vec<String>,
    },
    DeleteCAResponse {
        name: String,
        orphaned: Vec<String>,
    },
    DeleteCertificateResponse {
        identifier: String,
    },
    InspectCertificateResponse {
        details: CertificateDetails,
    },
    ExportBundleResponse {
        identifier: String,
        pkcs12_base64: String,
    },
    InstallCAResponse {
        name: String,
        outcome: InstallOutcome,
    },
    GenerateInstallerResponse {
        file_name: String,
        archive_base64: String,
    },
    IsPrivilegedResponse {
        privileged: bool,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// JSON-encode `message` and prepend its little-endian length.
fn encode<T: Serialize>(message: &T, what: &str) -> Result<(u32, Vec<u8>)> {
    let body = serde_json::to_vec(message).with_context(|| format!("Failed to encode {}", what))?;
    let length = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .with_context(|| format!("Encoded {} is too large for one frame", what))?;

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&length.to_le_bytes());
    framed.extend_from_slice(&body);
    Ok((length, framed))
}

fn decode<T: DeserializeOwned>(payload: &[u8], what: &str) -> Result<T> {
    let text = std::str::from_utf8(payload)
        .with_context(|| format!("{} payload is not UTF-8", what))?;
    serde_json::from_str(text).with_context(|| format!("Malformed {}", what))
}

/// Frame a request for the socket.
///
/// Returns the payload length and the framed bytes (length prefix included).
///
/// ```no_run
/// use pki_forge::protocol::{serialize_request, Request};
///
/// let (len, framed) = serialize_request(&Request::ListCAs)?;
/// assert_eq!(framed.len(), 4 + len as usize);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn serialize_request(request: &Request) -> Result<(u32, Vec<u8>)> {
    encode(request, "request")
}

/// Parse a request payload (length prefix already stripped).
pub fn deserialize_request(payload: &[u8]) -> Result<Request> {
    decode(payload, "request")
}

pub fn serialize_response(response: &Response) -> Result<(u32, Vec<u8>)> {
    encode(response, "response")
}

/// Parse a response payload (length prefix already stripped).
///
/// ```no_run
/// use pki_forge::protocol::{deserialize_response, Response};
///
/// let response = deserialize_response(br#"{"type":"IsPrivilegedResponse","privileged":false}"#)?;
/// assert!(matches!(response, Response::IsPrivilegedResponse { privileged: false }));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn deserialize_response(payload: &[u8]) -> Result<Response> {
    decode(payload, "response")
}

/// Read one length-prefixed frame and return its payload.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .context("Failed to read frame length")?;
    let length = u32::from_le_bytes(len_buf);
    if length > MAX_FRAME_LEN {
        bail!("Frame of {} bytes exceeds the {} byte limit", length, MAX_FRAME_LEN);
    }
    let mut buf = vec![0u8; length as usize];
    reader
        .read_exact(&mut buf)
        .context("Failed to read frame payload")?;
    Ok(buf)
}

/// Write an already framed message and flush.
pub fn write_frame<W: Write>(writer: &mut W, framed: &[u8]) -> Result<()> {
    writer
        .write_all(framed)
        .context("Failed to write frame")?;
    writer.flush().context("Failed to flush frame")?;
    Ok(())
}
