use crate::acme::error::ProtocolResult;
use crate::acme::object::Nonce;
use reqwest::header::HeaderValue;
use reqwest::{ClientBuilder, Method, Request, Response};
use serde::Serialize;
use std::time::Duration;
use url::Url;

// As per RFC8555 Section 6.1, we should conform both to RFC 7525 and supply the name + version
// of our HTTP library.
const USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " reqwest/",
    env!("REQWEST_VERSION"),
    " ( +",
    env!("CARGO_PKG_REPOSITORY"),
    " )"
);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const REPLAY_NONCE: &str = "Replay-Nonce";
pub const CONTENT_TYPE_JOSE_JSON: &str = "application/jose+json";
pub const CONTENT_TYPE_PEM_CHAIN: &str = "application/pem-certificate-chain";

#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn try_new() -> ProtocolResult<Self> {
        // RFC8555 Section 6, "Communications [...] are done over HTTPS [...]", except for test runs where we allow HTTP
        Self::try_new_with_builder(ClientBuilder::new(), !cfg!(test))
    }

    /// A client that also talks to plain `http://` endpoints, e.g. a CA test server on loopback.
    pub fn try_new_allow_http() -> ProtocolResult<Self> {
        Self::try_new_with_builder(ClientBuilder::new(), false)
    }

    fn try_new_with_builder(
        client_builder: ClientBuilder,
        https_only: bool,
    ) -> ProtocolResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        // RFC8555 Section 6.1, "clients SHOULD send an Accept-Language header field in
        // accordance with RFC7231"
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en"),
        );
        let client_builder = client_builder
            .https_only(https_only)
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            // Make TRACE logs available for test or debug builds (still needs to be enabled separately)
            .connection_verbose(cfg!(any(test, debug_assertions)));
        Ok(Self {
            client: client_builder.build()?,
        })
    }

    pub fn extract_nonce(res: &Response) -> Option<Nonce> {
        res.headers()
            .get(REPLAY_NONCE)
            .and_then(|header| header.to_str().ok())
            .and_then(|nonce_value| Nonce::try_from(nonce_value.to_string()).ok())
    }

    pub fn extract_location(res: &Response) -> Option<Url> {
        res.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|header| header.to_str().ok())
            .and_then(|location_str| parse_url(res.url(), location_str))
    }

    async fn execute(&self, req: Request) -> ProtocolResult<Response> {
        Ok(self.client.execute(req).await?)
    }

    pub async fn get(&self, url: Url) -> ProtocolResult<Response> {
        self.execute(Request::new(Method::GET, url)).await
    }

    pub async fn head(&self, url: Url) -> ProtocolResult<Response> {
        self.execute(Request::new(Method::HEAD, url)).await
    }

    /// POSTs a JWS body. `accept` overrides the response media type, which is only needed for the
    /// certificate download.
    pub async fn post<T: Serialize>(
        &self,
        url: Url,
        body: &T,
        accept: Option<&'static str>,
    ) -> ProtocolResult<Response> {
        // RFC8555 Section 6.2, "[clients] must have the Content-Type header field set
        // to "application/jose+json""
        let mut request_builder = self
            .client
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                HeaderValue::from_static(CONTENT_TYPE_JOSE_JSON),
            )
            .json(body);
        if let Some(accept) = accept {
            request_builder =
                request_builder.header(reqwest::header::ACCEPT, HeaderValue::from_static(accept));
        }
        self.execute(request_builder.build()?).await
    }
}

fn parse_url(base_url: &Url, raw_url: &str) -> Option<Url> {
    // As per RFC7231, the Location header may contain relative URLs as well as absolute URLs.
    // Fortunately, the Url crate already contains the logic for joining both.
    base_url.join(raw_url).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn url(server: &mockito::ServerGuard, path: &str) -> Url {
        Url::parse(&format!("{}{path}", server.url())).unwrap()
    }

    #[test]
    fn test_try_new() {
        let _ = HttpClient::try_new().unwrap();
        let _ = HttpClient::try_new_allow_http().unwrap();
    }

    #[tokio::test]
    async fn test_sends_user_agent_and_accept_language() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("HEAD", "/")
            .match_header("user-agent", USER_AGENT)
            .match_header("accept-language", "en")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let post_mock = server
            .mock("POST", "/")
            .match_header("user-agent", USER_AGENT)
            .match_header("accept-language", "en")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let client = HttpClient::try_new().unwrap();
        client.head(url(&server, "/")).await.unwrap();
        client.post(url(&server, "/"), &(), None).await.unwrap();
        mock.assert_async().await;
        post_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_sends_content_type_and_accept() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/cert")
            .match_header("content-type", CONTENT_TYPE_JOSE_JSON)
            .match_header("accept", CONTENT_TYPE_PEM_CHAIN)
            .with_status(200)
            .create_async()
            .await;

        let client = HttpClient::try_new().unwrap();
        client
            .post(url(&server, "/cert"), &(), Some(CONTENT_TYPE_PEM_CHAIN))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_extract_nonce() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("HEAD", "/")
            .with_status(200)
            .with_header(REPLAY_NONCE, "nonceValue")
            .create_async()
            .await;

        let client = HttpClient::try_new().unwrap();
        let response = client.head(url(&server, "/")).await.unwrap();
        let nonce = HttpClient::extract_nonce(&response).expect("No nonce found");
        assert_eq!(nonce.to_string(), "nonceValue");
    }

    #[tokio::test]
    async fn test_extract_nonce_with_invalid_nonce() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("HEAD", "/")
            .with_status(200)
            .with_header(REPLAY_NONCE, "!invalid-nonce!")
            .create_async()
            .await;

        let client = HttpClient::try_new().unwrap();
        let response = client.head(url(&server, "/")).await.unwrap();
        assert!(HttpClient::extract_nonce(&response).is_none());
    }

    #[tokio::test]
    async fn test_extract_location() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(201)
            .with_header("Location", "https://example.com/look-here")
            .create_async()
            .await;

        let client = HttpClient::try_new().unwrap();
        let response = client.post(url(&server, "/"), &(), None).await.unwrap();
        let location = HttpClient::extract_location(&response).unwrap();
        assert_eq!(location.as_str(), "https://example.com/look-here");
    }

    #[tokio::test]
    async fn test_extract_location_with_relative_url() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(201)
            .with_header("Location", "/everything-is-relative")
            .create_async()
            .await;

        let client = HttpClient::try_new().unwrap();
        let response = client.post(url(&server, "/"), &(), None).await.unwrap();
        let location = HttpClient::extract_location(&response).unwrap();
        assert_eq!(location, url(&server, "/everything-is-relative"));
    }
}
