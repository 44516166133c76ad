use crate::cert::{CachedCertificateMeta, CertificateBundle};
use crate::state::FileLock;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

/// A cached certificate with fewer days left than this is refreshed from the feed.
pub const REFRESH_THRESHOLD_DAYS: f64 = 7.0;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const META_FILE: &str = "meta.json";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("certificate feed unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("certificate feed returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("certificate feed returned an unusable bundle: {0}")]
    InvalidBundle(String),
    #[error("certificate directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// A certificate that is on disk and ready to be loaded by a TLS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCertificate {
    pub paths: CertificatePaths,
    pub meta: CachedCertificateMeta,
}

#[derive(Debug)]
pub enum CertificateOutcome {
    /// The cache was fresh, or was just refreshed from the feed.
    Fresh(CachedCertificate),
    /// The feed could not be reached, but the cached certificate has not expired yet.
    Stale {
        certificate: CachedCertificate,
        reason: FetchError,
    },
    /// No usable certificate. The caller should fall back to plain HTTP.
    Unavailable(FetchError),
}

impl CertificateOutcome {
    pub fn certificate(&self) -> Option<&CachedCertificate> {
        match self {
            CertificateOutcome::Fresh(certificate) | CertificateOutcome::Stale { certificate, .. } => {
                Some(certificate)
            }
            CertificateOutcome::Unavailable(_) => None,
        }
    }
}

/// Consumer side copy of the certificate served by the distribution endpoint.
///
/// Layout of the certificate directory: `cert.pem`, `key.pem` (owner-only) and `meta.json`.
/// [`CertificateCache::ensure_certificate`] is a critical section, both within this process and against
/// other processes sharing the directory.
#[derive(Debug)]
pub struct CertificateCache {
    feed_url: Url,
    directory: PathBuf,
    client: reqwest::Client,
    guard: Mutex<()>,
}

impl CertificateCache {
    pub fn try_new(feed_url: Url, directory: PathBuf) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            feed_url,
            directory,
            client,
            guard: Mutex::new(()),
        })
    }

    pub fn paths(&self) -> CertificatePaths {
        CertificatePaths {
            cert: self.directory.join(CERT_FILE),
            key: self.directory.join(KEY_FILE),
        }
    }

    fn meta_path(&self) -> PathBuf {
        self.directory.join(META_FILE)
    }

    /// Makes sure a usable certificate is on disk, fetching a new one only when needed.
    ///
    /// Never fails outright: a feed error degrades to the cached certificate while it is still valid.
    pub async fn ensure_certificate(&self) -> CertificateOutcome {
        let _guard = self.guard.lock().await;
        if let Err(e) = create_directory(&self.directory).await {
            return CertificateOutcome::Unavailable(e.into());
        }
        let _lock = match FileLock::exclusive(self.directory.join(LOCK_FILE)).await {
            Ok(lock) => lock,
            Err(e) => return CertificateOutcome::Unavailable(e.into()),
        };

        let now = OffsetDateTime::now_utc();
        let mut cached = self.load_cached().await;
        if let Some(cached) = &cached {
            let days_left = cached.meta.days_until_expiry(now);
            if cached.meta.is_expired(now) {
                info!("Cached certificate for {} has expired, fetching a new one", cached.meta.domain);
            } else if days_left < REFRESH_THRESHOLD_DAYS {
                info!("Cached certificate expires in {days_left:.1} days, fetching a refresh");
            } else {
                debug!(
                    "Using cached certificate for {}, expires in {days_left:.1} days",
                    cached.meta.domain
                );
                return CertificateOutcome::Fresh(cached.clone());
            }
        }

        let fetched = match self.fetch().await {
            Ok(bundle) => match self.store(&bundle).await {
                Ok(()) => Ok(bundle),
                Err(e) => {
                    // Whatever the failed store left behind decides whether a cache remains
                    cached = self.load_cached().await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };
        match (fetched, cached) {
            (Ok(bundle), _) => CertificateOutcome::Fresh(CachedCertificate {
                paths: self.paths(),
                meta: bundle.meta(),
            }),
            (Err(reason), Some(cached)) if !cached.meta.is_expired(now) => {
                warn!(
                    "Failed to fetch a new certificate, using cached certificate (expires in {:.1} days): {reason}",
                    cached.meta.days_until_expiry(now)
                );
                CertificateOutcome::Stale {
                    certificate: cached,
                    reason,
                }
            }
            (Err(reason), _) => {
                warn!("No usable certificate available: {reason}");
                CertificateOutcome::Unavailable(reason)
            }
        }
    }

    async fn load_cached(&self) -> Option<CachedCertificate> {
        let paths = self.paths();
        let meta_path = self.meta_path();
        for path in [&meta_path, &paths.cert, &paths.key] {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                debug!("No cached certificate: {} is missing", path.display());
                return None;
            }
        }
        let raw = match tokio::fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to read {}: {e}", meta_path.display());
                return None;
            }
        };
        match serde_json::from_slice::<CachedCertificateMeta>(&raw) {
            Ok(meta) => Some(CachedCertificate { paths, meta }),
            Err(e) => {
                warn!("Ignoring corrupt {}: {e}", meta_path.display());
                None
            }
        }
    }

    async fn fetch(&self) -> Result<CertificateBundle, FetchError> {
        info!("Fetching certificate from {}", self.feed_url);
        let response = self.client.get(self.feed_url.clone()).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        let bundle: CertificateBundle = response
            .json()
            .await
            .map_err(|e| FetchError::InvalidBundle(e.to_string()))?;
        if bundle.cert_chain_pem.trim().is_empty() || bundle.private_key_pem.trim().is_empty() {
            return Err(FetchError::InvalidBundle("empty certificate or key".to_string()));
        }
        Ok(bundle)
    }

    /// Replaces the cached bundle as a whole.
    ///
    /// All three files are staged next to their targets first. Nothing is replaced unless every
    /// staged write succeeded.
    async fn store(&self, bundle: &CertificateBundle) -> Result<(), FetchError> {
        let meta = serde_json::to_vec_pretty(&bundle.meta())
            .map_err(|e| FetchError::InvalidBundle(e.to_string()))?;
        let paths = self.paths();
        let meta_path = self.meta_path();
        let files: [(&Path, &[u8], u32); 3] = [
            (&paths.cert, bundle.cert_chain_pem.as_bytes(), 0o644),
            (&paths.key, bundle.private_key_pem.as_bytes(), 0o600),
            (&meta_path, &meta, 0o644),
        ];

        let mut staged = Vec::with_capacity(files.len());
        for (path, contents, mode) in files {
            match stage_file(path, contents, mode).await {
                Ok(temporary) => staged.push((temporary, path)),
                Err(e) => {
                    discard(staged.iter().map(|(temporary, _)| temporary)).await;
                    return Err(e.into());
                }
            }
        }
        // An interrupted swap leaves no meta.json behind, so it is never loaded as a cache
        if let Err(e) = remove_if_exists(&meta_path).await {
            discard(staged.iter().map(|(temporary, _)| temporary)).await;
            return Err(e.into());
        }
        for (temporary, path) in &staged {
            tokio::fs::rename(temporary, path).await?;
        }
        info!(
            "Saved certificate for {}, expires {}",
            bundle.domain, bundle.expires_at
        );
        Ok(())
    }
}

/// The `error` field of a JSON error body, or the body itself.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("error")?.as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Creates the certificate directory. An existing directory keeps the mode it has.
async fn create_directory(directory: &Path) -> std::io::Result<()> {
    if tokio::fs::try_exists(directory).await? {
        return Ok(());
    }
    tokio::fs::create_dir_all(directory).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(directory, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut temporary = path.as_os_str().to_owned();
    temporary.push(".tmp");
    PathBuf::from(temporary)
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Writes `contents` to a fresh temporary file next to `path` and returns the temporary path.
///
/// The file is created with `mode` already set, a leftover from an earlier run is removed first.
async fn stage_file(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<PathBuf> {
    let temporary = temporary_path(path);
    remove_if_exists(&temporary).await?;
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    let written = async {
        let mut file = options.open(&temporary).await?;
        file.write_all(contents).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = written {
        discard([&temporary]).await;
        return Err(e);
    }
    Ok(temporary)
}

async fn discard<'a>(temporaries: impl IntoIterator<Item = &'a PathBuf>) {
    for temporary in temporaries {
        if let Err(e) = remove_if_exists(temporary).await {
            warn!("Could not remove {}: {e}", temporary.display());
        }
    }
}
