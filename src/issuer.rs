use crate::acme::client::{AcmeClient, AcmeClientBuilder, PollPolicy};
use crate::acme::http::HttpClient;
use crate::acme::object::{AccountStatus, AuthorizationStatus, Identifier, NewOrderRequest, Order, OrderStatus};
use crate::cert::{CertificateBundle, DEFAULT_CERTIFICATE_VALIDITY};
use crate::crypto::asymmetric::KeyPair;
use crate::crypto::jws::JsonWebKey;
use crate::csr::build_csr_with_new_key;
use crate::dns::{DnsProvisioner, RecordId, challenge_record_name, challenge_txt_value};
use crate::error::{IssueContext, IssueError, IssueResult};
use anyhow::{Context, anyhow};
use std::future::Future;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Knobs for the waiting parts of an issuance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IssuanceTiming {
    pub poll: PollPolicy,
    /// Time between creating the TXT record and asking the CA to look at it
    pub propagation_delay: Duration,
    pub validity: time::Duration,
}

impl Default for IssuanceTiming {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            propagation_delay: Duration::from_secs(5),
            validity: DEFAULT_CERTIFICATE_VALIDITY,
        }
    }
}

/// Runs one DNS-01 issuance against a CA, start to finish.
///
/// Every call is a self-contained attempt: the directory is fetched fresh, the account is looked up by its
/// key and a new order is placed. Nothing is retried here; a failed attempt is reported and the caller decides
/// whether to try again later.
pub struct Issuer {
    directory_url: Url,
    http_client: HttpClient,
    provisioner: DnsProvisioner,
    timing: IssuanceTiming,
}

impl Issuer {
    pub fn try_new(directory_url: Url, provisioner: DnsProvisioner) -> anyhow::Result<Self> {
        Ok(Self {
            directory_url,
            http_client: HttpClient::try_new()?,
            provisioner,
            timing: IssuanceTiming::default(),
        })
    }

    #[must_use]
    pub fn with_http_client(mut self, http_client: HttpClient) -> Self {
        self.http_client = http_client;
        self
    }

    #[must_use]
    pub fn with_timing(mut self, timing: IssuanceTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn directory_url(&self) -> &Url {
        &self.directory_url
    }

    pub async fn issue(
        &self,
        domain: &str,
        account_key: KeyPair,
        cancel: &CancellationToken,
    ) -> IssueResult<CertificateBundle> {
        info!("Issuing certificate for {domain} at {}", self.directory_url);
        let (client, jwk, order_url, order) =
            cancellable(cancel, domain, self.place_order(domain, account_key)).await?;

        let mut records = Vec::new();
        if order.status == OrderStatus::Pending {
            for authz_url in &order.authorizations {
                match self.authorize(&client, &jwk, authz_url, cancel).await {
                    Ok(record) => records.extend(record),
                    Err(e) => {
                        self.remove_records(&records).await;
                        return Err(e);
                    }
                }
            }
            info!("{domain} is authorized");
        }

        // Challenge records stay up until the certificate is downloaded
        let downloaded =
            cancellable(cancel, domain, self.finalize_and_download(&client, &jwk, domain, &order_url)).await;
        self.remove_records(&records).await;
        let (cert_chain_pem, private_key_pem) = downloaded?;
        let bundle = CertificateBundle::new(
            domain.to_string(),
            cert_chain_pem,
            private_key_pem,
            OffsetDateTime::now_utc(),
            self.timing.validity,
        );
        info!(
            "Successfully issued a certificate for {domain}, valid until {}",
            bundle.expires_at
        );
        Ok(bundle)
    }

    async fn place_order(
        &self,
        domain: &str,
        account_key: KeyPair,
    ) -> IssueResult<(AcmeClient, JsonWebKey, Url, Order)> {
        let client = AcmeClientBuilder::new(self.directory_url.clone())
            .with_http_client(self.http_client.clone())
            .try_build()
            .await
            .context(format!("Establishing connection to CA {}", self.directory_url))?;
        let (jwk, account_url, account) = client
            .register_account(account_key)
            .await
            .context("Looking up ACME account")?;
        if account.status != AccountStatus::Valid {
            return anyhow!("ACME account {account_url} has status {:?}", account.status).ca_rejected();
        }
        debug!("Using ACME account {account_url}");

        let request = NewOrderRequest {
            identifiers: vec![Identifier::dns(domain)],
        };
        let (order_url, order) = client
            .new_order(&jwk, &request)
            .await
            .context(format!("Creating new order for {domain}"))?;
        debug!("Order URL: {order_url} ({:?})", order.status);
        if order.status == OrderStatus::Invalid {
            return Err(order_error(order, "New order has unacceptable status (invalid)"));
        }
        Ok((client, jwk, order_url, order))
    }

    async fn remove_records(&self, records: &[RecordId]) {
        for record_id in records {
            self.provisioner.delete_logged(record_id).await;
        }
    }

    /// Completes one authorization. Returns the challenge record that was created for it, which the
    /// caller removes once the order is done. On failure the record is already removed.
    async fn authorize(
        &self,
        client: &AcmeClient,
        jwk: &JsonWebKey,
        authz_url: &Url,
        cancel: &CancellationToken,
    ) -> IssueResult<Option<RecordId>> {
        debug!("Checking authorization @ {authz_url}");
        let authz = cancellable(cancel, authz_url.as_str(), async {
            Ok::<_, IssueError>(
                client
                    .get_authorization(jwk, authz_url)
                    .await
                    .context("Retrieving authorization from CA")?,
            )
        })
        .await?;
        let Identifier::Dns { value: domain } = &authz.identifier else {
            return anyhow!("Authorization {authz_url} is not for a DNS identifier").ca_rejected();
        };
        match authz.status {
            AuthorizationStatus::Valid => {
                debug!("Authorization for {domain} is already valid, skipping DNS-01");
                return Ok(None);
            }
            AuthorizationStatus::Pending => {}
            status => {
                return anyhow!("Authorization for {domain} has unacceptable status {status:?}")
                    .ca_rejected();
            }
        }
        let Some((challenge, token)) = authz.dns_challenge() else {
            return anyhow!("CA did not offer a dns-01 challenge for {domain}").ca_rejected();
        };

        let record_name = challenge_record_name(domain);
        let record_value = challenge_txt_value(&jwk.key_authorization(token.as_str()));
        self.provisioner
            .cleanup_existing(domain)
            .await
            .context(format!("Removing stale challenge records for {domain}"))
            .dns_failure()?;
        let record_id = self
            .provisioner
            .create(&record_name, &record_value)
            .await
            .context(format!("Creating challenge record {record_name}"))
            .dns_failure()?;
        info!(
            "Created {record_name} at {}, waiting {:?} for propagation",
            self.provisioner.provider_name(),
            self.timing.propagation_delay
        );

        let validation = async {
            tokio::time::sleep(self.timing.propagation_delay).await;
            client
                .trigger_challenge(jwk, &challenge.url)
                .await
                .context(format!("Triggering dns-01 challenge for {domain}"))?;
            client
                .poll_authorization(jwk, authz_url, self.timing.poll)
                .await
                .context(format!("Validating dns-01 challenge for {domain}"))?;
            Ok::<(), IssueError>(())
        };
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(IssueError::Cancelled(anyhow!("Issuance for {domain} was cancelled during validation"))),
            result = validation => result,
        };
        match outcome {
            Ok(()) => {
                info!("Successfully validated challenge for {domain}");
                Ok(Some(record_id))
            }
            Err(e) => {
                self.provisioner.delete_logged(&record_id).await;
                Err(e)
            }
        }
    }

    async fn finalize_and_download(
        &self,
        client: &AcmeClient,
        jwk: &JsonWebKey,
        domain: &str,
        order_url: &Url,
    ) -> IssueResult<(String, String)> {
        let order = client
            .get_order(jwk, order_url)
            .await
            .context("Re-fetching authorized order")?;
        let (order, private_key) = match order.status {
            OrderStatus::Ready => {
                let csr = build_csr_with_new_key(domain)
                    .map_err(anyhow::Error::new)
                    .context(format!("Building CSR for {domain}"))
                    .crypto_failure()?;
                debug!("Finalizing order {order_url}");
                client
                    .finalize_order(jwk, &order, csr.to_base64url())
                    .await
                    .context("Finalizing order")?;
                let order = client
                    .poll_order(jwk, order_url, self.timing.poll)
                    .await
                    .context("Waiting for certificate issuance")?;
                (order, csr.into_private_key())
            }
            OrderStatus::Pending => {
                return Err(order_error(
                    order,
                    "Order is still pending after having authorized all identifiers",
                ));
            }
            OrderStatus::Invalid => return Err(order_error(order, "Order has invalid status")),
            OrderStatus::Processing | OrderStatus::Valid => {
                // Without our CSR we would not hold the certificate's private key
                return anyhow!("Order {order_url} was finalized by someone else ({:?})", order.status)
                    .ca_rejected();
            }
        };
        let certificate_url = order
            .certificate
            .as_ref()
            .ok_or(anyhow!("CA did not provide a certificate URL for final order"))
            .ca_rejected()?;
        debug!("Final certificate available @ {certificate_url}");
        let cert_chain_pem = client
            .download_certificate(jwk, certificate_url)
            .await
            .context("Downloading certificate")?;
        let private_key_pem = private_key
            .to_pem_string()
            .map_err(anyhow::Error::new)
            .context("Exporting certificate key")
            .crypto_failure()?;
        Ok((cert_chain_pem, private_key_pem))
    }
}

fn order_error(order: Order, message: &'static str) -> IssueError {
    match order.error {
        Some(problem) => IssueError::CaRejected(
            anyhow::Error::new(crate::acme::error::Error::from(problem)).context(message),
        ),
        None => IssueError::CaRejected(anyhow!(message)),
    }
}

/// Races a step that holds no external state against cancellation.
async fn cancellable<T>(
    cancel: &CancellationToken,
    what: &str,
    step: impl Future<Output = IssueResult<T>>,
) -> IssueResult<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(IssueError::Cancelled(anyhow!("Issuance for {what} was cancelled"))),
        result = step => result,
    }
}
