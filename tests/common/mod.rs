#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use certrelay::acme::client::PollPolicy;
use certrelay::acme::http::HttpClient;
use certrelay::cert::DEFAULT_CERTIFICATE_VALIDITY;
use certrelay::dns::{DnsProvider, DnsProvisioner, Error, RecordId, TxtRecord};
use certrelay::issuer::{IssuanceTiming, Issuer};
use mockito::{Mock, Server, ServerGuard};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

pub const DOMAIN: &str = "local.example.com";
pub const TOKEN: &str = "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA";
pub const CERTIFICATE_CHAIN: &str = "-----BEGIN CERTIFICATE-----\nMIIBleaf\n-----END CERTIFICATE-----\n-----BEGIN CERTIFICATE-----\nMIIBintermediate\n-----END CERTIFICATE-----\n";

/// What the mock CA does with the authorization once the challenge was triggered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Validation {
    Succeeds,
    StaysPending,
    Fails,
}

/// An ACME CA that walks one order through pending, ready and valid.
pub struct MockCa {
    server: ServerGuard,
    _mocks: Vec<Mock>,
    triggered: Arc<AtomicBool>,
    finalized: Arc<AtomicBool>,
    new_orders: Arc<AtomicUsize>,
    csr: Arc<Mutex<Option<Vec<u8>>>>,
    /// Records of the provider handed to [`MockCa::issuer`]
    watched: Arc<Mutex<Option<Arc<Mutex<Vec<TxtRecord>>>>>>,
    records_at_download: Arc<Mutex<Option<usize>>>,
}

/// Decodes the payload of a flattened JWS request body.
fn jws_payload(body: &[u8]) -> Value {
    let jws: Value = serde_json::from_slice(body).expect("request body is not JSON");
    let payload = BASE64_URL_SAFE_NO_PAD
        .decode(jws["payload"].as_str().expect("JWS without payload"))
        .expect("payload is not base64url");
    serde_json::from_slice(&payload).expect("payload is not JSON")
}

impl MockCa {
    pub async fn start(validation: Validation) -> Self {
        let mut server = Server::new_async().await;
        let base = server.url();
        let triggered = Arc::new(AtomicBool::new(false));
        let finalized = Arc::new(AtomicBool::new(false));
        let new_orders = Arc::new(AtomicUsize::new(0));
        let csr = Arc::new(Mutex::new(None));
        let watched: Arc<Mutex<Option<Arc<Mutex<Vec<TxtRecord>>>>>> = Arc::new(Mutex::new(None));
        let records_at_download = Arc::new(Mutex::new(None));
        let mut mocks = Vec::new();

        mocks.push(
            server
                .mock("GET", "/directory")
                .with_body(
                    json!({
                        "newNonce": format!("{base}/nonce"),
                        "newAccount": format!("{base}/new-account"),
                        "newOrder": format!("{base}/new-order"),
                    })
                    .to_string(),
                )
                .create_async()
                .await,
        );
        mocks.push(
            server
                .mock("HEAD", "/nonce")
                .with_header("Replay-Nonce", "bm9uY2U")
                .create_async()
                .await,
        );
        mocks.push(
            server
                .mock("POST", "/new-account")
                .with_status(201)
                .with_header("Location", &format!("{base}/acct/1"))
                .with_body(json!({"status": "valid"}).to_string())
                .create_async()
                .await,
        );
        mocks.push({
            let base = base.clone();
            let new_orders = new_orders.clone();
            server
                .mock("POST", "/new-order")
                .with_status(201)
                .with_header("Location", &format!("{base}/order/1"))
                .with_body_from_request(move |_| {
                    new_orders.fetch_add(1, Ordering::SeqCst);
                    json!({
                        "status": "pending",
                        "identifiers": [{"type": "dns", "value": DOMAIN}],
                        "authorizations": [format!("{base}/authz/1")],
                        "finalize": format!("{base}/finalize/1"),
                    })
                    .to_string()
                    .into_bytes()
                })
                .create_async()
                .await
        });
        mocks.push({
            let base = base.clone();
            let triggered = triggered.clone();
            server
                .mock("POST", "/authz/1")
                .with_body_from_request(move |_| {
                    let status = match (triggered.load(Ordering::SeqCst), validation) {
                        (false, _) | (true, Validation::StaysPending) => "pending",
                        (true, Validation::Succeeds) => "valid",
                        (true, Validation::Fails) => "invalid",
                    };
                    let mut challenge = json!({
                        "type": "dns-01",
                        "url": format!("{base}/chall/1"),
                        "status": status,
                        "token": TOKEN,
                    });
                    if status == "invalid" {
                        challenge["error"] = json!({
                            "type": "urn:ietf:params:acme:error:unauthorized",
                            "detail": "Incorrect TXT record found at _acme-challenge.local.example.com",
                        });
                    }
                    json!({
                        "identifier": {"type": "dns", "value": DOMAIN},
                        "status": status,
                        "challenges": [challenge],
                    })
                    .to_string()
                    .into_bytes()
                })
                .create_async()
                .await
        });
        mocks.push({
            let base = base.clone();
            let triggered = triggered.clone();
            server
                .mock("POST", "/chall/1")
                .with_body_from_request(move |_| {
                    triggered.store(true, Ordering::SeqCst);
                    json!({
                        "type": "dns-01",
                        "url": format!("{base}/chall/1"),
                        "status": "processing",
                        "token": TOKEN,
                    })
                    .to_string()
                    .into_bytes()
                })
                .create_async()
                .await
        });
        mocks.push({
            let base = base.clone();
            let triggered = triggered.clone();
            let finalized = finalized.clone();
            server
                .mock("POST", "/order/1")
                .with_body_from_request(move |_| {
                    let mut order = json!({
                        "status": "pending",
                        "identifiers": [{"type": "dns", "value": DOMAIN}],
                        "authorizations": [format!("{base}/authz/1")],
                        "finalize": format!("{base}/finalize/1"),
                    });
                    if finalized.load(Ordering::SeqCst) {
                        order["status"] = json!("valid");
                        order["certificate"] = json!(format!("{base}/cert/1"));
                    } else if triggered.load(Ordering::SeqCst) && validation == Validation::Succeeds {
                        order["status"] = json!("ready");
                    }
                    order.to_string().into_bytes()
                })
                .create_async()
                .await
        });
        mocks.push({
            let base = base.clone();
            let finalized = finalized.clone();
            let csr = csr.clone();
            server
                .mock("POST", "/finalize/1")
                .with_body_from_request(move |request| {
                    let payload = jws_payload(request.body().expect("finalize without body"));
                    let der = payload["csr"]
                        .as_str()
                        .and_then(|csr| BASE64_URL_SAFE_NO_PAD.decode(csr).ok());
                    *csr.lock() = der;
                    finalized.store(true, Ordering::SeqCst);
                    json!({
                        "status": "processing",
                        "identifiers": [{"type": "dns", "value": DOMAIN}],
                        "authorizations": [format!("{base}/authz/1")],
                        "finalize": format!("{base}/finalize/1"),
                    })
                    .to_string()
                    .into_bytes()
                })
                .create_async()
                .await
        });
        mocks.push({
            let watched = watched.clone();
            let records_at_download = records_at_download.clone();
            server
                .mock("POST", "/cert/1")
                .match_header("accept", "application/pem-certificate-chain")
                .with_header("content-type", "application/pem-certificate-chain")
                .with_body_from_request(move |_| {
                    if let Some(records) = watched.lock().as_ref() {
                        *records_at_download.lock() = Some(records.lock().len());
                    }
                    CERTIFICATE_CHAIN.as_bytes().to_vec()
                })
                .create_async()
                .await
        });

        Self {
            server,
            _mocks: mocks,
            triggered,
            finalized,
            new_orders,
            csr,
            watched,
            records_at_download,
        }
    }

    pub fn directory_url(&self) -> Url {
        Url::parse(&format!("{}/directory", self.server.url())).unwrap()
    }

    pub fn challenge_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// The DER CSR submitted with the finalize request, if any.
    pub fn submitted_csr(&self) -> Option<Vec<u8>> {
        self.csr.lock().clone()
    }

    /// How many orders were placed.
    pub fn new_orders(&self) -> usize {
        self.new_orders.load(Ordering::SeqCst)
    }

    /// How many DNS records existed while the certificate was downloaded.
    pub fn records_at_download(&self) -> Option<usize> {
        *self.records_at_download.lock()
    }

    /// An issuer for this CA that does not wait for DNS and gives up polling quickly.
    pub fn issuer(&self, provider: &RecordingProvider) -> Issuer {
        *self.watched.lock() = Some(provider.records.clone());
        Issuer::try_new(
            self.directory_url(),
            DnsProvisioner::new(Box::new(provider.clone())),
        )
        .unwrap()
        .with_http_client(HttpClient::try_new_allow_http().unwrap())
        .with_timing(IssuanceTiming {
            poll: PollPolicy {
                interval: Duration::from_millis(20),
                max_attempts: 5,
            },
            propagation_delay: Duration::from_millis(50),
            validity: DEFAULT_CERTIFICATE_VALIDITY,
        })
    }
}

/// DNS provider that keeps records in memory and counts what was done to them.
#[derive(Default, Clone)]
pub struct RecordingProvider {
    pub records: Arc<Mutex<Vec<TxtRecord>>>,
    pub created: Arc<Mutex<Vec<TxtRecord>>>,
    pub deletes: Arc<AtomicUsize>,
    pub fail_create: Arc<AtomicBool>,
    next_id: Arc<AtomicUsize>,
}

impl RecordingProvider {
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Plants a record as if an earlier attempt had crashed before cleaning up.
    pub fn plant(&self, name: &str, content: &str) {
        self.records.lock().push(TxtRecord {
            id: RecordId("leftover".to_string()),
            name: name.to_string(),
            content: content.to_string(),
        });
    }
}

#[async_trait]
impl DnsProvider for RecordingProvider {
    fn name(&self) -> &'static str {
        "recording"
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
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Rejected {
                status: 403,
                message: "token lacks DNS edit permission".to_string(),
            });
        }
        let record = TxtRecord {
            id: RecordId(format!("rec-{}", self.next_id.fetch_add(1, Ordering::SeqCst))),
            name: name.to_string(),
            content: content.to_string(),
        };
        self.records.lock().push(record.clone());
        self.created.lock().push(record.clone());
        Ok(record.id)
    }

    async fn delete(&self, id: &RecordId) -> Result<(), Error> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.records.lock().retain(|record| &record.id != id);
        Ok(())
    }
}
