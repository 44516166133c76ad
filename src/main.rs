use anyhow::{Context, bail};
use certrelay::cache::{CertificateCache, CertificateOutcome};
use certrelay::config::{self, DEFAULT_CONFIG_FILE, SchedulerConfiguration};
use certrelay::daemon::{self, DistributionState};
use certrelay::dns::DnsProvisioner;
use certrelay::issuer::Issuer;
use certrelay::renew::{RenewService, RenewalOutcome};
use certrelay::state::{DATABASE_FILE_NAME, Database};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ENV_FILTER_NAME: &str = "CERTRELAY_LOG";

#[derive(Debug, Parser)]
#[command(version, about, long_about = "")]
struct CommandLineArguments {
    /// Path to the configuration file
    #[arg(short, long, env = "CERTRELAY_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
    /// Shorthand option to enable debug logging (logging can be fine-tuned via `CERTRELAY_LOG` environment variable)
    #[clap(long, short, action)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Keep the certificate renewed and serve it to consumers
    Serve,
    /// Check the certificate once and renew it if it is due
    Renew {
        /// Issue a new certificate even if the current one is not due
        #[arg(long)]
        force: bool,
    },
    /// Consumer: make sure a usable certificate is cached locally
    Fetch,
    /// Show the stored certificate
    Status,
}

async fn open_database(config: &SchedulerConfiguration) -> anyhow::Result<Database> {
    tokio::fs::create_dir_all(&config.state_directory)
        .await
        .context(format!("Creating state directory {}", config.state_directory.display()))?;
    Database::open(&config.state_directory, DATABASE_FILE_NAME).await
}

async fn build_renew_service(config: &SchedulerConfiguration) -> anyhow::Result<RenewService> {
    let db = open_database(config).await?;
    let provisioner = DnsProvisioner::new(config.dns.build_provider()?);
    let issuer = Issuer::try_new(config.acme_directory.clone(), provisioner)?;
    Ok(RenewService::new(config.domain.clone(), db, issuer).with_lock_directory(config.state_directory.clone()))
}

/// A token that is cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down"),
            Err(e) => warn!("Cannot listen for Ctrl-C: {e}"),
        }
        trigger.cancel();
    });
    cancel
}

async fn serve(config: &SchedulerConfiguration) -> anyhow::Result<()> {
    let service = Arc::new(build_renew_service(config).await?);
    let cancel = shutdown_token();
    let listener = TcpListener::bind(config.listen_address)
        .await
        .context(format!("Binding {}", config.listen_address))?;
    if config.admin_token.is_none() {
        info!("No admin token configured, POST /renew is disabled");
    }
    let scheduler = tokio::spawn(service.clone().run_daily(config.renew_at_utc, cancel.clone()));
    let state = DistributionState::new(service, config.admin_token.clone(), cancel.clone());
    let served = daemon::serve(listener, state, cancel.clone()).await;
    cancel.cancel();
    scheduler.await.context("Renewal scheduler panicked")?;
    served
}

async fn renew(config: &SchedulerConfiguration, force: bool) -> anyhow::Result<()> {
    let service = build_renew_service(config).await?;
    let cancel = shutdown_token();
    let outcome = service.check(force, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&outcome.report())?);
    if let RenewalOutcome::Failed(err) = outcome {
        bail!("Renewal failed: {err}");
    }
    Ok(())
}

async fn status(config: &SchedulerConfiguration) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let bundle = db.get_bundle(&config.domain).await?;
    db.close().await;
    let Some(bundle) = bundle else {
        println!("No certificate for {} has been issued yet", config.domain);
        return Ok(());
    };
    let now = OffsetDateTime::now_utc();
    println!("Domain:     {}", bundle.domain);
    println!("Issued:     {}", bundle.issued_at);
    println!("Expires:    {}", bundle.expires_at);
    if bundle.is_expired(now) {
        println!("Days left:  expired");
    } else {
        println!("Days left:  {:.1}", bundle.days_until_expiry(now));
    }
    Ok(())
}

async fn fetch(config: &config::ConsumerConfiguration) -> anyhow::Result<()> {
    let cache = CertificateCache::try_new(config.feed_url.clone(), config.cert_directory.clone())?;
    let outcome = cache.ensure_certificate().await;
    let (state, certificate) = match &outcome {
        CertificateOutcome::Fresh(certificate) => ("fresh", certificate),
        CertificateOutcome::Stale { certificate, .. } => ("stale", certificate),
        CertificateOutcome::Unavailable(err) => bail!("No usable certificate: {err}"),
    };
    println!("Outcome:    {state}");
    println!("Domain:     {}", certificate.meta.domain);
    println!("Expires:    {}", certificate.meta.expires_at);
    println!("Cert:       {}", certificate.paths.cert.display());
    println!("Key:        {}", certificate.paths.key.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CommandLineArguments::parse();
    let filter = EnvFilter::try_from_env(ENV_FILTER_NAME).unwrap_or_else(|_| {
        EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "certrelay=debug,info" } else { "info" }))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let config = config::load(&cli.config)?;
    match cli.command {
        Command::Serve => serve(config.scheduler()?).await,
        Command::Renew { force } => renew(config.scheduler()?, force).await,
        Command::Fetch => fetch(config.consumer()?).await,
        Command::Status => status(config.scheduler()?).await,
    }
}
