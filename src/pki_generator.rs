//! Building blocks shared by the CA and device certificate builders:
//! key generation, subject names, validity windows and serial numbers.

use crate::configs::CADefaults;
use crate::error::{CryptoContext, PkiError, Result};
use openssl::asn1::{Asn1IntegerRef, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Name, X509NameRef};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const SERIAL_BITS: i32 = 127;
pub(crate) const MAX_SERIAL_ATTEMPTS: usize = 8;
const SECONDS_PER_DAY: i64 = 86_400;
pub const MAX_VALIDITY_DAYS: u32 = 36_500;
/// RFC 5280 ub-common-name
pub const MAX_COMMON_NAME_LEN: usize = 64;
const MIN_RSA_BITS: u32 = 2048;

/// Distinguished name fields for a CA subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectFields {
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub organization: String,
    pub common_name: String,
}

impl SubjectFields {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Self::default()
        }
    }

    /// Trim every field and fill blank ones from the configured defaults.
    pub fn with_defaults(&self, defaults: &CADefaults) -> SubjectFields {
        fn pick(value: &str, fallback: &str) -> String {
            let value = value.trim();
            if value.is_empty() {
                fallback.trim().to_string()
            } else {
                value.to_string()
            }
        }
        SubjectFields {
            country: pick(&self.country, &defaults.country).to_ascii_uppercase(),
            state: pick(&self.state, &defaults.state),
            locality: pick(&self.locality, &defaults.locality),
            organization: pick(&self.organization, &defaults.organization),
            common_name: self.common_name.trim().to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_common_name(&self.common_name)?;
        if !self.country.is_empty()
            && (self.country.len() != 2 || !self.country.chars().all(|c| c.is_ascii_alphabetic()))
        {
            return Err(PkiError::validation(
                "country",
                format!("'{}' is not a two-letter ISO 3166 code", self.country),
            ));
        }
        for (field, value) in [
            ("state", &self.state),
            ("locality", &self.locality),
            ("organization", &self.organization),
        ] {
            if value.chars().count() > 128 {
                return Err(PkiError::validation(field, "longer than 128 characters"));
            }
        }
        Ok(())
    }

    /// Build the X.509 name, skipping blank fields.
    pub(crate) fn to_x509_name(&self) -> Result<X509Name> {
        let mut name_builder = X509Name::builder().crypto_context("create name builder")?;
        for (nid, value) in [
            (Nid::COUNTRYNAME, &self.country),
            (Nid::STATEORPROVINCENAME, &self.state),
            (Nid::LOCALITYNAME, &self.locality),
            (Nid::ORGANIZATIONNAME, &self.organization),
            (Nid::COMMONNAME, &self.common_name),
        ] {
            if value.is_empty() {
                continue;
            }
            name_builder
                .append_entry_by_nid(nid, value)
                .crypto_context("append subject entry")?;
        }
        Ok(name_builder.build())
    }
}

pub fn validate_common_name(common_name: &str) -> Result<()> {
    let cn = common_name.trim();
    if cn.is_empty() {
        return Err(PkiError::validation("common name", "must not be empty"));
    }
    if cn.chars().count() > MAX_COMMON_NAME_LEN {
        return Err(PkiError::validation(
            "common name",
            format!("longer than {} characters", MAX_COMMON_NAME_LEN),
        ));
    }
    Ok(())
}

pub fn validate_validity_days(days: u32) -> Result<()> {
    if days == 0 {
        return Err(PkiError::validation("expiry", "must be at least one day"));
    }
    if days > MAX_VALIDITY_DAYS {
        return Err(PkiError::validation(
            "expiry",
            format!("must not exceed {} days", MAX_VALIDITY_DAYS),
        ));
    }
    Ok(())
}

/// Generate an RSA private key of `bits` size
pub fn generate_rsa_key(bits: u32) -> Result<PKey<Private>> {
    if bits < MIN_RSA_BITS {
        return Err(PkiError::validation(
            "key size",
            format!("{} bits is below the {}-bit minimum", bits, MIN_RSA_BITS),
        ));
    }
    let rsa = openssl::rsa::Rsa::generate(bits).crypto_context("generate RSA keypair")?;
    PKey::from_rsa(rsa).crypto_context("wrap RSA keypair")
}

/// Absolute validity window computed from a single clock reading, so
/// `not_after - not_before` is exactly the requested number of days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    pub not_before: i64,
    pub not_after: i64,
}

impl ValidityWindow {
    pub fn starting_now(days: u32) -> Result<Self> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| PkiError::crypto("read system clock", e))?
            .as_secs() as i64;
        Self::starting_at(now, days)
    }

    pub fn starting_at(not_before: i64, days: u32) -> Result<Self> {
        validate_validity_days(days)?;
        Ok(Self {
            not_before,
            not_after: not_before + i64::from(days) * SECONDS_PER_DAY,
        })
    }

    pub(crate) fn asn1_times(&self) -> Result<(Asn1Time, Asn1Time)> {
        let not_before =
            Asn1Time::from_unix(self.not_before as _).crypto_context("create not_before")?;
        let not_after =
            Asn1Time::from_unix(self.not_after as _).crypto_context("create not_after")?;
        Ok((not_before, not_after))
    }
}

/// Random 127-bit serial number; the DER encoding stays within 16 octets.
pub(crate) fn random_serial() -> Result<BigNum> {
    let mut serial = BigNum::new().crypto_context("allocate serial number")?;
    serial
        .rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)
        .crypto_context("generate serial number")?;
    Ok(serial)
}

/// Upper-case hex rendering of a serial number, the form used for collision checks.
pub fn serial_hex(serial: &Asn1IntegerRef) -> Result<String> {
    let bn = serial.to_bn().crypto_context("decode serial number")?;
    bn_hex(&bn)
}

fn bn_hex(bn: &BigNum) -> Result<String> {
    Ok(bn
        .to_hex_str()
        .crypto_context("encode serial number")?
        .to_string())
}

/// Draw serials until one is non-zero and absent from `existing`.
pub(crate) fn pick_unique_serial(existing: &HashSet<String>) -> Result<BigNum> {
    pick_unique_serial_with(existing, random_serial)
}

pub(crate) fn pick_unique_serial_with(
    existing: &HashSet<String>,
    mut generate: impl FnMut() -> Result<BigNum>,
) -> Result<BigNum> {
    for attempt in 1..=MAX_SERIAL_ATTEMPTS {
        let serial = generate()?;
        let hex = bn_hex(&serial)?;
        if serial.num_bits() == 0 || existing.contains(&hex) {
            tracing::warn!(attempt, serial = %hex, "serial number collision, retrying");
            continue;
        }
        return Ok(serial);
    }
    Err(PkiError::crypto(
        "allocate a unique serial number",
        format!("{} consecutive collisions", MAX_SERIAL_ATTEMPTS),
    ))
}

/// First common name entry of an X.509 name, if any.
pub fn common_name_of(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}
