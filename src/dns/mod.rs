//! DNS-01 challenge records.
//!
//! [`DnsProvider`] is the boundary to whatever hosts the zone. [`DnsProvisioner`] builds the challenge record
//! on top of it and owns the cleanup rules.

use crate::crypto::sha256;
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use std::fmt::Display;
use tracing::{debug, info, warn};

pub mod cloudflare;

const CHALLENGE_LABEL: &str = "_acme-challenge";
/// TTL for challenge records. Short, since the record only lives for one validation attempt.
pub const CHALLENGE_RECORD_TTL: u32 = 60;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("DNS provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("DNS provider rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("DNS provider response is malformed: {0}")]
    MalformedResponse(String),
}

/// Identifier the provider assigned to a record it created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId(pub String);

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtRecord {
    pub id: RecordId,
    pub name: String,
    pub content: String,
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn list_txt(&self, name: &str) -> Result<Vec<TxtRecord>, Error>;

    async fn create_txt(&self, name: &str, content: &str, ttl: u32) -> Result<RecordId, Error>;

    async fn delete(&self, id: &RecordId) -> Result<(), Error>;
}

/// `_acme-challenge.<domain>`
pub fn challenge_record_name(domain: &str) -> String {
    format!("{CHALLENGE_LABEL}.{}", domain.trim_end_matches('.'))
}

/// The TXT value for DNS-01: `base64url(SHA-256(key_authorization))`, unpadded.
pub fn challenge_txt_value(key_authorization: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(sha256(key_authorization.as_bytes()))
}

pub struct DnsProvisioner {
    provider: Box<dyn DnsProvider>,
}

impl DnsProvisioner {
    pub fn new(provider: Box<dyn DnsProvider>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Removes every TXT record left at the challenge name of `domain`, e.g. from an aborted earlier run.
    /// Returns how many records were deleted.
    pub async fn cleanup_existing(&self, domain: &str) -> Result<usize, Error> {
        let name = challenge_record_name(domain);
        let stale = self.provider.list_txt(&name).await?;
        for record in &stale {
            info!("Removing stale challenge record {} ({name})", record.id);
            self.provider.delete(&record.id).await?;
        }
        Ok(stale.len())
    }

    pub async fn create(&self, name: &str, value: &str) -> Result<RecordId, Error> {
        let id = self
            .provider
            .create_txt(name, value, CHALLENGE_RECORD_TTL)
            .await?;
        debug!("Created TXT record {id} at {name}");
        Ok(id)
    }

    pub async fn delete(&self, id: &RecordId) -> Result<(), Error> {
        self.provider.delete(id).await?;
        debug!("Deleted TXT record {id}");
        Ok(())
    }

    /// Deletes a record, logging instead of failing. Used on the cleanup path, where the primary outcome
    /// of the attempt must not be replaced by a cleanup error.
    pub async fn delete_logged(&self, id: &RecordId) {
        if let Err(e) = self.delete(id).await {
            warn!(
                "Could not delete challenge record {id} at {}: {e}. It will be removed before the next attempt.",
                self.provider_name()
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory provider that records what happened to it.
    #[derive(Default, Clone)]
    pub(crate) struct MemoryProvider {
        pub records: Arc<Mutex<Vec<TxtRecord>>>,
        pub deletes: Arc<AtomicUsize>,
        next_id: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DnsProvider for MemoryProvider {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn list_txt(&self, name: &str) -> Result<Vec<TxtRecord>, Error> {
            Ok(self
                .records
                .lock()
                .iter()
                .filter(|record| record.name == name)
                .cloned()
                .collect())
        }

        async fn create_txt(&self, name: &str, content: &str, _ttl: u32) -> Result<RecordId, Error> {
            let id = RecordId(format!("rec-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
            self.records.lock().push(TxtRecord {
                id: id.clone(),
                name: name.to_string(),
                content: content.to_string(),
            });
            Ok(id)
        }

        async fn delete(&self, id: &RecordId) -> Result<(), Error> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            let mut records = self.records.lock();
            let before = records.len();
            records.retain(|record| &record.id != id);
            if records.len() == before {
                return Err(Error::Rejected {
                    status: 404,
                    message: format!("no record {id}"),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_challenge_record_name() {
        assert_eq!(
            challenge_record_name("local.example.com"),
            "_acme-challenge.local.example.com"
        );
        assert_eq!(
            challenge_record_name("local.example.com."),
            "_acme-challenge.local.example.com"
        );
    }

    #[test]
    fn test_challenge_txt_value() {
        // RFC 8555 Section 8.4 computes the value the same way
        let key_authorization = "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA.9jg46WB3rR_AHD-EBXdN7cBkH1WOu0tA3M9fm21mqTI";
        let value = challenge_txt_value(key_authorization);
        assert_eq!(value.len(), 43);
        assert!(!value.contains('='));
        assert_eq!(
            value,
            BASE64_URL_SAFE_NO_PAD.encode(sha256(key_authorization.as_bytes()))
        );
        assert_ne!(value, challenge_txt_value("other.thumbprint"));
    }

    #[tokio::test]
    async fn test_cleanup_existing_only_touches_challenge_name() {
        let provider = MemoryProvider::default();
        provider.create_txt("_acme-challenge.a.example.com", "old-1", 60).await.unwrap();
        provider.create_txt("_acme-challenge.a.example.com", "old-2", 60).await.unwrap();
        provider.create_txt("_acme-challenge.b.example.com", "other", 60).await.unwrap();
        let provisioner = DnsProvisioner::new(Box::new(provider.clone()));

        let removed = provisioner.cleanup_existing("a.example.com").await.unwrap();

        assert_eq!(removed, 2);
        let remaining = provider.records.lock().clone();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "_acme-challenge.b.example.com");
    }

    #[tokio::test]
    async fn test_create_then_delete() {
        let provider = MemoryProvider::default();
        let provisioner = DnsProvisioner::new(Box::new(provider.clone()));
        let name = challenge_record_name("a.example.com");

        let id = provisioner.create(&name, "value").await.unwrap();
        assert_eq!(provider.records.lock().len(), 1);
        provisioner.delete(&id).await.unwrap();
        assert!(provider.records.lock().is_empty());
    }

    #[tokio::test]
    async fn test_delete_logged_swallows_errors() {
        let provider = MemoryProvider::default();
        let provisioner = DnsProvisioner::new(Box::new(provider.clone()));

        provisioner.delete_logged(&RecordId("missing".to_string())).await;

        assert_eq!(provider.deletes.load(Ordering::SeqCst), 1);
    }
}
