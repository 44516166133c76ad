use crate::acme::error::{Error, ProtocolResult};
use crate::acme::http::{CONTENT_TYPE_PEM_CHAIN, HttpClient};
use crate::acme::object::{
    Account, AccountRequest, Authorization, AuthorizationStatus, Challenge, Directory, EmptyObject,
    FinalizeRequest, NewOrderRequest, Nonce, Order, OrderStatus,
};
use crate::crypto::asymmetric::KeyPair;
use crate::crypto::jws::{EMPTY_PAYLOAD, JsonWebKey, ProtectedHeader};
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

/// The maximum number of retries we do per request after a `badNonce` rejection
const MAX_RETRIES: usize = 3;

/// How often, and how long, to ask the CA whether an authorization or order progressed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 30,
        }
    }
}

pub struct AcmeClientBuilder {
    server_url: Url,
    http_client: Option<HttpClient>,
}

impl AcmeClientBuilder {
    pub fn new(acme_server_url: Url) -> AcmeClientBuilder {
        Self {
            server_url: acme_server_url,
            http_client: None,
        }
    }

    #[must_use]
    pub fn with_http_client(mut self, http_client: HttpClient) -> Self {
        self.http_client = Some(http_client);
        self
    }

    pub async fn try_build(self) -> ProtocolResult<AcmeClient> {
        AcmeClient::try_new(self).await
    }
}

/// An ACME session against one CA directory.
///
/// The directory is fetched once when the client is built, so a fresh client should be built for every
/// issuance attempt. No nonces are pooled: every signed request is preceded by its own `newNonce` round trip.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct AcmeClient {
    http_client: HttpClient,
    directory: Directory,
}

impl AcmeClient {
    async fn try_new(builder: AcmeClientBuilder) -> ProtocolResult<Self> {
        let http_client = match builder.http_client {
            Some(client) => client,
            None => HttpClient::try_new()?,
        };
        debug!("Fetching ACME directory {}", builder.server_url);
        let directory_response = http_client.get(builder.server_url).await?;
        let directory = match directory_response.status() {
            StatusCode::OK => serde_json::from_slice(&directory_response.bytes().await?)?,
            _ => return Err(Error::get_error_from_http(directory_response).await),
        };
        Ok(Self {
            http_client,
            directory,
        })
    }

    pub fn get_directory(&self) -> &Directory {
        &self.directory
    }

    pub async fn get_nonce(&self) -> ProtocolResult<Nonce> {
        let response = self
            .http_client
            .head(self.directory.new_nonce.clone())
            .await?;
        if let Some(nonce) = HttpClient::extract_nonce(&response) {
            return Ok(nonce);
        }
        if response.status().is_success() {
            return Err(Error::ProtocolViolation(
                "CA did not provide a (valid) Replay-Nonce for newNonce",
            ));
        }
        Err(Error::get_error_from_http(response).await)
    }

    async fn post_with_retry<T: Serialize>(
        &self,
        target_url: &Url,
        key: &JsonWebKey,
        payload: Option<&T>,
        accept: Option<&'static str>,
    ) -> ProtocolResult<RawResponse> {
        let mut retry = 0;
        loop {
            // A nonce is only ever used once. After a badNonce rejection we fetch a fresh one.
            let header = ProtectedHeader::new(
                key.get_algorithm(),
                self.get_nonce().await?,
                target_url.clone(),
                key.get_parameters().clone(),
            );
            let signed = key.sign(&header, payload)?;
            trace!("POST {target_url}");
            let response = self
                .http_client
                .post(target_url.clone(), &signed, accept)
                .await?;
            let status = response.status();
            if matches!(status, StatusCode::OK | StatusCode::CREATED) {
                let location = HttpClient::extract_location(&response);
                return Ok(RawResponse {
                    status,
                    location,
                    response,
                });
            }
            let error = Error::get_error_from_http(response).await;
            match &error {
                Error::AcmeProblem(problem) if problem.is_bad_nonce() && retry < MAX_RETRIES => {
                    retry += 1;
                    debug!("CA rejected nonce for {target_url}, retrying ({retry}/{MAX_RETRIES})");
                }
                _ => return Err(error),
            }
        }
    }

    async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        target_url: &Url,
        key: &JsonWebKey,
        payload: Option<&T>,
    ) -> ProtocolResult<AcmeResponse<R>> {
        let raw = self
            .post_with_retry(target_url, key, payload, None)
            .await?;
        let bytes = raw.response.bytes().await?;
        let body = serde_json::from_slice(&bytes)?;
        Ok(AcmeResponse {
            status: raw.status,
            location: raw.location,
            body,
        })
    }

    /// Registers (or looks up) the account for `key`. Returns the key bound to its account URL.
    pub async fn register_account(&self, key: KeyPair) -> ProtocolResult<(JsonWebKey, Url, Account)> {
        let jwk = JsonWebKey::new(key);
        let target_url = &self.get_directory().new_account;
        let payload = AccountRequest {
            contact: vec![],
            terms_of_service_agreed: true,
        };
        let response = self.post_json(target_url, &jwk, Some(&payload)).await?;
        let account_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an account URL for created account",
        ))?;
        let account_key = jwk.into_existing(account_url.clone());
        Ok((account_key, account_url, response.body))
    }

    pub async fn new_order(
        &self,
        account_key: &JsonWebKey,
        request: &NewOrderRequest,
    ) -> ProtocolResult<(Url, Order)> {
        let target_url = &self.get_directory().new_order;
        let response = self
            .post_json(target_url, account_key, Some(request))
            .await?;
        let order_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an order URL for created order",
        ))?;
        Ok((order_url, response.body))
    }

    pub async fn get_order(&self, account_key: &JsonWebKey, order_url: &Url) -> ProtocolResult<Order> {
        let response = self.post_json(order_url, account_key, EMPTY_PAYLOAD).await?;
        Ok(response.body)
    }

    pub async fn get_authorization(
        &self,
        account_key: &JsonWebKey,
        authz_url: &Url,
    ) -> ProtocolResult<Authorization> {
        let response = self.post_json(authz_url, account_key, EMPTY_PAYLOAD).await?;
        Ok(response.body)
    }

    /// Tells the CA the challenge is ready to be validated.
    pub async fn trigger_challenge(
        &self,
        account_key: &JsonWebKey,
        challenge_url: &Url,
    ) -> ProtocolResult<Challenge> {
        let response = self
            .post_json(challenge_url, account_key, Some(&EmptyObject {}))
            .await?;
        Ok(response.body)
    }

    /// Polls the authorization until the CA considers it `valid`.
    pub async fn poll_authorization(
        &self,
        account_key: &JsonWebKey,
        authz_url: &Url,
        policy: PollPolicy,
    ) -> ProtocolResult<Authorization> {
        for attempt in 1..=policy.max_attempts {
            let authorization = self.get_authorization(account_key, authz_url).await?;
            match authorization.status {
                AuthorizationStatus::Valid => return Ok(authorization),
                AuthorizationStatus::Pending => {
                    debug!(
                        "Authorization {authz_url} still pending (attempt {attempt}/{})",
                        policy.max_attempts
                    );
                }
                AuthorizationStatus::Invalid
                | AuthorizationStatus::Deactivated
                | AuthorizationStatus::Expired
                | AuthorizationStatus::Revoked => {
                    return match authorization.challenge_error() {
                        Some(problem) => Err(problem.clone().into()),
                        None => Err(Error::ProtocolViolation(
                            "authorization is invalid, but CA did not provide an error message why",
                        )),
                    };
                }
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        Err(Error::TimedOut("Timed out waiting for authorization to become valid"))
    }

    pub async fn finalize_order(
        &self,
        account_key: &JsonWebKey,
        order: &Order,
        csr_base64url: String,
    ) -> ProtocolResult<Order> {
        let request = FinalizeRequest { csr: csr_base64url };
        let response = self
            .post_json(&order.finalize, account_key, Some(&request))
            .await?;
        Ok(response.body)
    }

    /// Polls the order until it is `valid`, i.e. the certificate can be downloaded.
    pub async fn poll_order(
        &self,
        account_key: &JsonWebKey,
        order_url: &Url,
        policy: PollPolicy,
    ) -> ProtocolResult<Order> {
        for attempt in 1..=policy.max_attempts {
            let order = self.get_order(account_key, order_url).await?;
            match order.status {
                OrderStatus::Valid => return Ok(order),
                OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing => {
                    debug!(
                        "Order {order_url} is {:?} (attempt {attempt}/{})",
                        order.status, policy.max_attempts
                    );
                }
                OrderStatus::Invalid => {
                    return match order.error {
                        Some(problem) => Err(problem.into()),
                        None => Err(Error::ProtocolViolation(
                            "Order is invalid, but CA did not provide an error message",
                        )),
                    };
                }
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        Err(Error::TimedOut("Timed out waiting for order finalization"))
    }

    /// Downloads the issued chain as PEM text.
    pub async fn download_certificate(
        &self,
        account_key: &JsonWebKey,
        certificate_url: &Url,
    ) -> ProtocolResult<String> {
        let raw = self
            .post_with_retry(
                certificate_url,
                account_key,
                EMPTY_PAYLOAD,
                Some(CONTENT_TYPE_PEM_CHAIN),
            )
            .await?;
        let pem = raw.response.text().await?;
        if !pem.contains("-----BEGIN CERTIFICATE-----") {
            return Err(Error::ProtocolViolation(
                "CA returned a certificate download that is not a PEM certificate chain",
            ));
        }
        Ok(pem)
    }
}

#[derive(Debug)]
struct RawResponse {
    status: StatusCode,
    location: Option<Url>,
    response: reqwest::Response,
}

#[derive(Debug)]
pub struct AcmeResponse<T> {
    pub status: StatusCode,
    pub location: Option<Url>,
    pub body: T,
}
