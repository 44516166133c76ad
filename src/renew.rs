use crate::cert::{CachedCertificateMeta, CertificateBundle};
use crate::crypto::asymmetric::KeyPair;
use crate::error::{IssueContext, IssueError, IssueResult};
use crate::issuer::Issuer;
use crate::state::{Database, FileLock, InFlight};
use anyhow::{Context, anyhow};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use time::{OffsetDateTime, Time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A certificate this close to expiry (in days, inclusive) is renewed.
pub const RENEWAL_THRESHOLD_DAYS: f64 = 30.0;
const RENEWAL_LOCK_FILE: &str = "renew.lock";

pub fn needs_renewal(bundle: Option<&CertificateBundle>, now: OffsetDateTime) -> bool {
    match bundle {
        None => true,
        Some(bundle) => bundle.days_until_expiry(now) <= RENEWAL_THRESHOLD_DAYS,
    }
}

/// The next time the daily check runs: today at `at` if that is still ahead of `now`, else tomorrow.
pub fn next_daily_run(now: OffsetDateTime, at: Time) -> OffsetDateTime {
    let now = now.to_offset(time::UtcOffset::UTC);
    let today = now.replace_time(at);
    if today > now {
        today
    } else {
        today + time::Duration::days(1)
    }
}

#[derive(Debug)]
pub enum RenewalOutcome {
    NotDue(CachedCertificateMeta),
    Renewed(CachedCertificateMeta),
    /// Another attempt for the same domain is still running; this trigger did nothing.
    AlreadyRunning,
    Failed(IssueError),
}

impl RenewalOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RenewalOutcome::Failed(_))
    }

    pub fn report(&self) -> RenewalReport {
        match self {
            RenewalOutcome::NotDue(meta) => RenewalReport {
                outcome: "not_due",
                expires_at: Some(meta.expires_at),
                error_kind: None,
                error: None,
            },
            RenewalOutcome::Renewed(meta) => RenewalReport {
                outcome: "renewed",
                expires_at: Some(meta.expires_at),
                error_kind: None,
                error: None,
            },
            RenewalOutcome::AlreadyRunning => RenewalReport {
                outcome: "already_running",
                expires_at: None,
                error_kind: None,
                error: None,
            },
            RenewalOutcome::Failed(err) => RenewalReport {
                outcome: "failed",
                expires_at: None,
                error_kind: Some(err.kind()),
                error: Some(format!("{:#}", err.inner())),
            },
        }
    }
}

/// JSON view of a [`RenewalOutcome`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenewalReport {
    pub outcome: &'static str,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Loads the account key, generating and storing one on first use.
pub async fn load_or_create_account_key(db: &Database) -> IssueResult<KeyPair> {
    let stored = db
        .get_account_key()
        .await
        .context("Reading account key from state database")
        .transient()?;
    if let Some(pem) = stored {
        return KeyPair::from_pem(&pem)
            .map_err(anyhow::Error::new)
            .context("Stored account key is unusable")
            .crypto_failure();
    }
    let key = KeyPair::generate()
        .and_then(|key| key.to_pem_string().map(|pem| (key, pem)))
        .map_err(anyhow::Error::new)
        .context("Generating account key")
        .crypto_failure();
    let (key, pem) = key?;
    let inserted = db
        .insert_account_key(&pem)
        .await
        .context("Storing account key")
        .transient()?;
    if inserted {
        info!("Generated a new ACME account key");
        return Ok(key);
    }
    // Someone else stored a key first. There is only ever one account key, so use theirs.
    match db.get_account_key().await.context("Reading account key").transient()? {
        Some(pem) => KeyPair::from_pem(&pem)
            .map_err(anyhow::Error::new)
            .context("Stored account key is unusable")
            .crypto_failure(),
        None => anyhow!("Account key vanished from state database").transient(),
    }
}

/// Decides whether the certificate for one domain is due and, if so, renews it.
pub struct RenewService {
    domain: String,
    db: Database,
    issuer: Issuer,
    in_flight: InFlight,
    lock_directory: Option<PathBuf>,
}

impl RenewService {
    pub fn new(domain: String, db: Database, issuer: Issuer) -> Self {
        Self {
            domain,
            db,
            issuer,
            in_flight: InFlight::new(),
            lock_directory: None,
        }
    }

    /// Also serialize against other processes using a lock file in `directory`.
    #[must_use]
    pub fn with_lock_directory(mut self, directory: PathBuf) -> Self {
        self.lock_directory = Some(directory);
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn current_bundle(&self) -> anyhow::Result<Option<CertificateBundle>> {
        self.db.get_bundle(&self.domain).await
    }

    /// Runs one renewal check. With `force`, a certificate is issued even if the current one is not due.
    ///
    /// Only store errors are returned as `Err`; a failed issuance is a [`RenewalOutcome::Failed`].
    pub async fn check(&self, force: bool, cancel: &CancellationToken) -> anyhow::Result<RenewalOutcome> {
        let domain = &self.domain;
        let Some(_guard) = self.in_flight.try_acquire(domain) else {
            info!("Renewal for {domain} is already running, ignoring trigger");
            return Ok(RenewalOutcome::AlreadyRunning);
        };
        let _file_lock = match &self.lock_directory {
            Some(directory) => Some(
                FileLock::exclusive(directory.join(RENEWAL_LOCK_FILE))
                    .await
                    .context("Acquiring renewal lock")?,
            ),
            None => None,
        };

        // Read only after locking, a concurrent run may just have stored a fresh bundle
        let current = self.db.get_bundle(domain).await?;
        let now = OffsetDateTime::now_utc();
        if let Some(bundle) = &current {
            debug!(
                "Certificate for {domain} expires at {} ({:.1} days)",
                bundle.expires_at,
                bundle.days_until_expiry(now)
            );
        }
        if !force && !needs_renewal(current.as_ref(), now) {
            if let Some(bundle) = &current {
                info!(
                    "Certificate for {domain} is not due for renewal ({:.0} days left)",
                    bundle.days_until_expiry(now)
                );
                return Ok(RenewalOutcome::NotDue(bundle.meta()));
            }
        }
        match current {
            None => info!("No certificate for {domain} yet, issuing"),
            Some(_) if force => info!("Forced renewal for {domain}"),
            Some(_) => info!("Certificate for {domain} is due for renewal"),
        }

        let issued = match load_or_create_account_key(&self.db).await {
            Ok(account_key) => self.issuer.issue(domain, account_key, cancel).await,
            Err(e) => Err(e),
        };
        match issued {
            Ok(bundle) => {
                self.db
                    .set_bundle(&bundle)
                    .await
                    .context(format!("Storing new certificate for {domain}"))?;
                Ok(RenewalOutcome::Renewed(bundle.meta()))
            }
            Err(err) => {
                if err.is_transient() {
                    warn!("Renewal for {domain} failed, will try again on the next run: {err}");
                } else {
                    error!("Renewal for {domain} failed ({}): {err}", err.kind());
                }
                Ok(RenewalOutcome::Failed(err))
            }
        }
    }

    /// Checks at startup, then once a day at `at` (UTC), until `cancel` fires.
    pub async fn run_daily(self: Arc<Self>, at: Time, cancel: CancellationToken) {
        loop {
            if let Err(e) = self.check(false, &cancel).await {
                error!("Renewal check for {} failed: {e:#}", self.domain);
            }
            let now = OffsetDateTime::now_utc();
            let next = next_daily_run(now, at);
            info!("Next renewal check at {next}");
            let wait = (next - now).try_into().unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Renewal scheduler stopped");
                    return;
                }
                () = tokio::time::sleep(wait) => {}
            }
        }
    }
}
