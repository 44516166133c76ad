use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use time::{Duration, OffsetDateTime};

/// Lifetime we assume for an issued certificate. The chain is kept as opaque PEM, so the actual
/// `notAfter` is never parsed.
pub const DEFAULT_CERTIFICATE_VALIDITY: Duration = Duration::days(90);

const SECONDS_PER_DAY: f64 = 86_400.0;

/// An issued certificate chain together with its private key.
///
/// This is also the wire format of the distribution endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBundle {
    #[serde(rename = "cert")]
    pub cert_chain_pem: String,
    #[serde(rename = "key")]
    pub private_key_pem: String,
    pub domain: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

impl CertificateBundle {
    pub fn new(
        domain: String,
        cert_chain_pem: String,
        private_key_pem: String,
        issued_at: OffsetDateTime,
        validity: Duration,
    ) -> Self {
        Self {
            cert_chain_pem,
            private_key_pem,
            domain,
            expires_at: issued_at + validity,
            issued_at,
        }
    }

    pub fn meta(&self) -> CachedCertificateMeta {
        CachedCertificateMeta {
            domain: self.domain.clone(),
            expires_at: self.expires_at,
            issued_at: self.issued_at,
        }
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        is_expired(self.expires_at, now)
    }

    pub fn days_until_expiry(&self, now: OffsetDateTime) -> f64 {
        days_until(self.expires_at, now)
    }
}

// Keep private key material out of logs
impl Debug for CertificateBundle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("domain", &self.domain)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("cert_chain_pem", &format!("<{} bytes>", self.cert_chain_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Bundle metadata without secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCertificateMeta {
    pub domain: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

impl CachedCertificateMeta {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        is_expired(self.expires_at, now)
    }

    pub fn days_until_expiry(&self, now: OffsetDateTime) -> f64 {
        days_until(self.expires_at, now)
    }
}

fn is_expired(expires_at: OffsetDateTime, now: OffsetDateTime) -> bool {
    now >= expires_at
}

/// Fractional days, negative once expired.
fn days_until(expires_at: OffsetDateTime, now: OffsetDateTime) -> f64 {
    (expires_at - now).as_seconds_f64() / SECONDS_PER_DAY
}
