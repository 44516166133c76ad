use crate::dns::{DnsProvider, Error, RecordId, TxtRecord};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.cloudflare.com/client/v4";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// TXT records in one Cloudflare zone, managed through the v4 REST API with a scoped API token.
#[derive(Debug, Clone)]
pub struct Cloudflare {
    client: reqwest::Client,
    api_url: Url,
    zone_id: String,
    api_token: String,
}

impl Cloudflare {
    pub fn try_new(api_url: Url, zone_id: String, api_token: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_url,
            zone_id,
            api_token,
        })
    }

    fn records_url(&self) -> String {
        format!(
            "{}/zones/{}/dns_records",
            self.api_url.as_str().trim_end_matches('/'),
            self.zone_id
        )
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, Error> {
        let status = response.status();
        let bytes = response.bytes().await?;
        let envelope: Envelope<T> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => return Err(Error::MalformedResponse(e.to_string())),
            Err(_) => {
                return Err(Error::Rejected {
                    status: status.as_u16(),
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
        };
        if status != StatusCode::OK || !envelope.success {
            let message = envelope
                .errors
                .iter()
                .map(|error| format!("{} (code {})", error.message, error.code))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        envelope
            .result
            .ok_or_else(|| Error::MalformedResponse("missing result".to_string()))
    }
}

#[async_trait]
impl DnsProvider for Cloudflare {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    async fn list_txt(&self, name: &str) -> Result<Vec<TxtRecord>, Error> {
        let response = self
            .client
            .get(self.records_url())
            .bearer_auth(&self.api_token)
            .query(&[("type", "TXT"), ("name", name)])
            .send()
            .await?;
        let records: Vec<DnsRecord> = Self::parse(response).await?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn create_txt(&self, name: &str, content: &str, ttl: u32) -> Result<RecordId, Error> {
        let body = NewDnsRecord {
            record_type: "TXT",
            name,
            content,
            ttl,
        };
        let response = self
            .client
            .post(self.records_url())
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;
        let record: DnsRecord = Self::parse(response).await?;
        Ok(RecordId(record.id))
    }

    async fn delete(&self, id: &RecordId) -> Result<(), Error> {
        let response = self
            .client
            .delete(format!("{}/{}", self.records_url(), id.0))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let _: DeletedRecord = Self::parse(response).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
    name: String,
    #[serde(default)]
    content: String,
}

impl From<DnsRecord> for TxtRecord {
    fn from(record: DnsRecord) -> Self {
        TxtRecord {
            id: RecordId(record.id),
            name: record.name,
            content: record.content,
        }
    }
}

#[derive(Debug, Serialize)]
struct NewDnsRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct DeletedRecord {
    #[allow(dead_code)]
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    const ZONE: &str = "023e105f4ecef8ad9ca31a8372d0c353";
    const TOKEN: &str = "test-token";

    fn provider(server: &ServerGuard) -> Cloudflare {
        Cloudflare::try_new(
            Url::parse(&server.url()).unwrap(),
            ZONE.to_string(),
            TOKEN.to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_txt() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", format!("/zones/{ZONE}/dns_records").as_str())
            .match_header("authorization", format!("Bearer {TOKEN}").as_str())
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("type".into(), "TXT".into()),
                Matcher::UrlEncoded("name".into(), "_acme-challenge.a.example.com".into()),
            ]))
            .with_status(200)
            .with_body(
                json!({
                    "success": true,
                    "errors": [],
                    "result": [
                        {"id": "372e6795", "type": "TXT", "name": "_acme-challenge.a.example.com", "content": "abc"}
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let records = provider(&server)
            .list_txt("_acme-challenge.a.example.com")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(
            records,
            vec![TxtRecord {
                id: RecordId("372e6795".to_string()),
                name: "_acme-challenge.a.example.com".to_string(),
                content: "abc".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_create_txt() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", format!("/zones/{ZONE}/dns_records").as_str())
            .match_body(Matcher::Json(json!({
                "type": "TXT",
                "name": "_acme-challenge.a.example.com",
                "content": "value",
                "ttl": 60
            })))
            .with_status(200)
            .with_body(
                json!({
                    "success": true,
                    "errors": [],
                    "result": {"id": "new-record", "name": "_acme-challenge.a.example.com", "content": "value"}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let id = provider(&server)
            .create_txt("_acme-challenge.a.example.com", "value", 60)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(id, RecordId("new-record".to_string()));
    }

    #[tokio::test]
    async fn test_delete() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("DELETE", format!("/zones/{ZONE}/dns_records/abc").as_str())
            .with_status(200)
            .with_body(json!({"success": true, "errors": [], "result": {"id": "abc"}}).to_string())
            .create_async()
            .await;

        provider(&server)
            .delete(&RecordId("abc".to_string()))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", format!("/zones/{ZONE}/dns_records").as_str())
            .with_status(403)
            .with_body(
                json!({
                    "success": false,
                    "errors": [{"code": 10000, "message": "Authentication error"}],
                    "result": null
                })
                .to_string(),
            )
            .create_async()
            .await;

        let err = provider(&server)
            .create_txt("_acme-challenge.a.example.com", "value", 60)
            .await
            .unwrap_err();

        match err {
            Error::Rejected { status, message } => {
                assert_eq!(status, 403);
                assert!(message.contains("Authentication error"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
