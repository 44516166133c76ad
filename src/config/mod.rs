use crate::config::toml::TomlConfiguration;
use crate::dns::DnsProvider;
use crate::dns::cloudflare::{self, Cloudflare};
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use time::Time;
use url::Url;

mod toml;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/certrelay/certrelay.toml";
const LETSENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";
const DEFAULT_STATE_DIRECTORY: &str = "/var/lib/certrelay";
const DEFAULT_CERT_DIRECTORY: &str = "/var/lib/certrelay/consumer";
const DEFAULT_LISTEN_PORT: u16 = 8443;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer: Option<ConsumerConfiguration>,
}

impl Configuration {
    pub fn scheduler(&self) -> anyhow::Result<&SchedulerConfiguration> {
        match &self.scheduler {
            Some(scheduler) => Ok(scheduler),
            None => bail!("This command needs a [scheduler] section in the configuration file"),
        }
    }

    pub fn consumer(&self) -> anyhow::Result<&ConsumerConfiguration> {
        match &self.consumer {
            Some(consumer) => Ok(consumer),
            None => bail!("This command needs a [consumer] section in the configuration file"),
        }
    }
}

/// The issuing side: renews the certificate and serves it to consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfiguration {
    pub domain: String,
    #[serde(default = "default_acme_directory")]
    pub acme_directory: Url,
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,
    /// Time of day (UTC) of the daily renewal check
    #[serde(default = "default_renew_at", with = "hour_minute")]
    pub renew_at_utc: Time,
    /// Bearer token for `POST /renew`. The endpoint is disabled without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    pub dns: DnsConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum DnsConfiguration {
    Cloudflare(CloudflareConfiguration),
}

impl DnsConfiguration {
    pub fn build_provider(&self) -> anyhow::Result<Box<dyn DnsProvider>> {
        match self {
            DnsConfiguration::Cloudflare(config) => Ok(Box::new(
                Cloudflare::try_new(
                    config.api_url.clone(),
                    config.zone_id.clone(),
                    config.api_token.clone(),
                )
                .context("Setting up Cloudflare DNS client")?,
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudflareConfiguration {
    pub api_token: String,
    pub zone_id: String,
    #[serde(default = "default_cloudflare_api")]
    pub api_url: Url,
}

/// The consuming side: keeps a local copy of the certificate fetched from the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfiguration {
    pub feed_url: Url,
    #[serde(default = "default_cert_directory")]
    pub cert_directory: PathBuf,
}

fn default_acme_directory() -> Url {
    Url::parse(LETSENCRYPT_DIRECTORY).expect("BUG: Let's Encrypt directory URL is invalid")
}

fn default_cloudflare_api() -> Url {
    Url::parse(cloudflare::DEFAULT_API_URL).expect("BUG: Cloudflare API URL is invalid")
}

fn default_state_directory() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIRECTORY)
}

fn default_cert_directory() -> PathBuf {
    PathBuf::from(DEFAULT_CERT_DIRECTORY)
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_LISTEN_PORT)
}

fn default_renew_at() -> Time {
    time::macros::time!(03:00)
}

mod hour_minute {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Time;
    use time::format_description::FormatItem;
    use time::macros::format_description;

    const FORMAT: &[FormatItem<'static>] = format_description!("[hour]:[minute]");

    pub fn serialize<S: Serializer>(time: &Time, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = time.format(FORMAT).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Time, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Time::parse(&raw, FORMAT)
            .map_err(|e| serde::de::Error::custom(format!("expected HH:MM, got {raw:?}: {e}")))
    }
}

pub trait ConfigBackend {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error>;
}

pub fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error> {
    let file = file.as_ref();
    if !file.exists() {
        bail!("Configuration file {} does not exist", file.display());
    }
    TomlConfiguration::load(file).context(format!("Loading configuration {}", file.display()))
}
