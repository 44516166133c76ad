use crate::acme::object::Nonce;
use crate::crypto::asymmetric::{AsymmetricKeyOperation, KeyPair};
use crate::crypto::{SignatureError, sha256};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    #[serde(rename = "alg")]
    algorithm: Algorithm,
    #[serde(skip_serializing_if = "Nonce::is_empty")]
    pub nonce: Nonce,
    #[serde(rename = "url")]
    target_url: Url,
    #[serde(flatten)]
    key: KeyParameters,
}

impl ProtectedHeader {
    pub fn new(algorithm: Algorithm, nonce: Nonce, target_url: Url, key: KeyParameters) -> Self {
        Self {
            algorithm,
            nonce,
            target_url,
            key,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Algorithm {
    #[serde(rename = "ES256")]
    EcdsaP256Sha256,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum KeyParameters {
    #[serde(rename = "jwk")]
    FullKey(JsonWebKeyEcdsa),
    #[serde(rename = "kid")]
    AccountUrl(Url),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonWebKeyEcdsa {
    #[serde(rename = "kty")]
    key_type: String,
    #[serde(rename = "crv")]
    curve: String,
    #[serde(rename = "x")]
    x_coordinate: String,
    #[serde(rename = "y")]
    y_coordinate: String,
}

impl JsonWebKeyEcdsa {
    pub fn new(x_coordinate: String, y_coordinate: String) -> Self {
        Self {
            key_type: "EC".to_string(),
            curve: "P-256".to_string(),
            x_coordinate,
            y_coordinate,
        }
    }

    /// RFC 7638 thumbprint, base64url encoded without padding.
    pub fn thumbprint(&self) -> String {
        // serde_json doesn't guarantee any particular member order, while the thumbprint relies on
        // the lexicographic order crv, kty, x, y. So we do the serialization manually here.
        let crv = &self.curve;
        let kty = &self.key_type;
        let x = &self.x_coordinate;
        let y = &self.y_coordinate;
        let fixed_serialization = format!(r#"{{"crv":"{crv}","kty":"{kty}","x":"{x}","y":"{y}"}}"#);
        BASE64_URL_SAFE_NO_PAD.encode(sha256(fixed_serialization.as_bytes()))
    }
}

pub const EMPTY_PAYLOAD: Option<&()> = None;

/// The ACME account key together with how the CA knows it.
///
/// Before registration, the full public key is embedded in each request (`jwk`). Afterwards, the account
/// URL returned by the CA is used as key id (`kid`).
#[derive(Debug)]
pub struct JsonWebKey {
    keypair: KeyPair,
    parameters: KeyParameters,
    thumbprint: String,
}

impl JsonWebKey {
    pub fn new(keypair: KeyPair) -> Self {
        let parameters = keypair.to_jwk_parameters();
        let thumbprint = parameters.thumbprint();
        Self {
            keypair,
            parameters: KeyParameters::FullKey(parameters),
            thumbprint,
        }
    }

    pub fn new_existing(keypair: KeyPair, account_url: Url) -> Self {
        let thumbprint = keypair.to_jwk_parameters().thumbprint();
        Self {
            keypair,
            parameters: KeyParameters::AccountUrl(account_url),
            thumbprint,
        }
    }

    #[must_use]
    pub fn into_existing(self, account_url: Url) -> Self {
        Self::new_existing(self.keypair, account_url)
    }

    pub fn get_algorithm(&self) -> Algorithm {
        Algorithm::EcdsaP256Sha256
    }

    pub fn get_parameters(&self) -> &KeyParameters {
        &self.parameters
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// Produces a flattened JWS over `payload`. `None` yields an empty payload segment (POST-as-GET).
    pub fn sign<T: Serialize>(
        &self,
        header: &ProtectedHeader,
        payload: Option<&T>,
    ) -> Result<FlatJsonWebSignature, SignatureError> {
        let header = serde_json::to_string(header)?;
        let header = BASE64_URL_SAFE_NO_PAD.encode(header);
        let payload = match payload {
            None => String::new(),
            Some(payload) => {
                let payload = serde_json::to_string(payload)?;
                BASE64_URL_SAFE_NO_PAD.encode(payload)
            }
        };
        let to_sign = format!("{header}.{payload}");
        // JOSE wants the raw r || s form, which is exactly what the key pair produces
        let signature = self.keypair.sign(to_sign.as_bytes())?;
        let signature = BASE64_URL_SAFE_NO_PAD.encode(signature);
        Ok(FlatJsonWebSignature {
            header,
            payload,
            signature,
        })
    }

    pub fn get_acme_thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// `token "." thumbprint`, as published (hashed) for DNS-01.
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.thumbprint)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlatJsonWebSignature {
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

impl FlatJsonWebSignature {
    fn parse_base64_json(value: &str) -> anyhow::Result<serde_json::Value> {
        let raw_json = BASE64_URL_SAFE_NO_PAD.decode(value)?;
        Ok(serde_json::from_slice(&raw_json)?)
    }

    pub fn header_json(&self) -> anyhow::Result<serde_json::Value> {
        Self::parse_base64_json(&self.header)
    }

    /// `None` for POST-as-GET requests, whose payload segment is empty.
    pub fn payload_json(&self) -> anyhow::Result<Option<serde_json::Value>> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        Self::parse_base64_json(&self.payload).map(Some)
    }

    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.header, self.payload)
    }

    pub fn signature_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(BASE64_URL_SAFE_NO_PAD.decode(&self.signature)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::asymmetric::tests::TEST_EC_256;
    use aws_lc_rs::signature::{ECDSA_P256_SHA256_FIXED, UnparsedPublicKey};
    use rstest::rstest;

    const TEST_X: &str = "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4";
    const TEST_Y: &str = "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM";

    fn test_jwk() -> JsonWebKeyEcdsa {
        JsonWebKeyEcdsa::new(TEST_X.to_string(), TEST_Y.to_string())
    }

    #[test]
    fn test_serialize_protected_header_with_jwk() {
        let header = ProtectedHeader {
            algorithm: Algorithm::EcdsaP256Sha256,
            nonce: Nonce::try_from("QWERTZ".to_string()).unwrap(),
            target_url: Url::parse("https://example.com/protected-header-test").unwrap(),
            key: KeyParameters::FullKey(test_jwk()),
        };
        let expected_header = r#"{
  "alg": "ES256",
  "nonce": "QWERTZ",
  "url": "https://example.com/protected-header-test",
  "jwk": {
    "kty": "EC",
    "crv": "P-256",
    "x": "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4",
    "y": "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM"
  }
}"#;
        let actual_header = serde_json::to_string_pretty(&header).unwrap();
        assert_eq!(
            expected_header, actual_header,
            "serialization failed, expected {expected_header}, got {actual_header}"
        );
    }

    #[test]
    fn test_serialize_protected_header_with_kid() {
        let header = ProtectedHeader::new(
            Algorithm::EcdsaP256Sha256,
            Nonce::try_from("QWERTZ".to_string()).unwrap(),
            Url::parse("https://example.com/order").unwrap(),
            KeyParameters::AccountUrl(Url::parse("https://example.com/acct/1").unwrap()),
        );
        let actual_header = serde_json::to_string(&header).unwrap();
        assert_eq!(
            actual_header,
            r#"{"alg":"ES256","nonce":"QWERTZ","url":"https://example.com/order","kid":"https://example.com/acct/1"}"#
        );
    }

    #[test]
    fn test_compute_account_thumbprint() {
        assert_eq!(
            test_jwk().thumbprint(),
            "cn-I_WNMClehiVp51i_0VpOENW1upEerA8sEam5hn-s"
        );
    }

    #[test]
    fn test_thumbprint_is_stable() {
        let keypair = KeyPair::from_pem(TEST_EC_256).unwrap();
        let first = JsonWebKey::new(keypair);
        let again = JsonWebKey::new(KeyPair::from_pem(TEST_EC_256).unwrap());
        assert_eq!(first.get_acme_thumbprint(), again.get_acme_thumbprint());
        assert_eq!(
            first.get_acme_thumbprint(),
            first.keypair().to_jwk_parameters().thumbprint()
        );
        let registered = first.into_existing(Url::parse("https://example.com/acct/1").unwrap());
        assert_eq!(registered.get_acme_thumbprint(), again.get_acme_thumbprint());
    }

    #[rstest]
    #[case::kty("OKP", "P-256", TEST_X, TEST_Y)]
    #[case::crv("EC", "P-384", TEST_X, TEST_Y)]
    #[case::x("EC", "P-256", TEST_Y, TEST_Y)]
    #[case::y("EC", "P-256", TEST_X, TEST_X)]
    fn test_thumbprint_changes_with_any_member(
        #[case] kty: &str,
        #[case] crv: &str,
        #[case] x: &str,
        #[case] y: &str,
    ) {
        let modified = JsonWebKeyEcdsa {
            key_type: kty.to_string(),
            curve: crv.to_string(),
            x_coordinate: x.to_string(),
            y_coordinate: y.to_string(),
        };
        assert_ne!(modified.thumbprint(), test_jwk().thumbprint());
    }

    #[test]
    fn test_key_authorization() {
        let key = JsonWebKey::new(KeyPair::from_pem(TEST_EC_256).unwrap());
        let key_authorization = key.key_authorization("tok3n");
        assert_eq!(
            key_authorization,
            format!("tok3n.{}", key.get_acme_thumbprint())
        );
    }

    #[test]
    fn test_sign_with_empty_payload() {
        let key = JsonWebKey::new(KeyPair::from_pem(TEST_EC_256).unwrap());
        let header = ProtectedHeader::new(
            key.get_algorithm(),
            Nonce::try_from("n0nce".to_string()).unwrap(),
            Url::parse("https://example.com/authz/1").unwrap(),
            key.get_parameters().clone(),
        );
        let jws = key.sign(&header, EMPTY_PAYLOAD).unwrap();
        let serialized = serde_json::to_value(&jws).unwrap();
        assert_eq!(serialized["payload"], "");
        assert!(jws.payload_json().unwrap().is_none());
        let header_json = jws.header_json().unwrap();
        assert_eq!(header_json["alg"], "ES256");
        assert_eq!(header_json["nonce"], "n0nce");
        assert_eq!(header_json["url"], "https://example.com/authz/1");
        assert_eq!(header_json["jwk"]["crv"], "P-256");
        assert!(header_json.get("kid").is_none());
    }

    #[test]
    fn test_sign_verifies_with_raw_signature() {
        let key = JsonWebKey::new(KeyPair::from_pem(TEST_EC_256).unwrap())
            .into_existing(Url::parse("https://example.com/acct/7").unwrap());
        let header = ProtectedHeader::new(
            key.get_algorithm(),
            Nonce::try_from("abc".to_string()).unwrap(),
            Url::parse("https://example.com/new-order").unwrap(),
            key.get_parameters().clone(),
        );
        let payload = serde_json::json!({"identifiers": [{"type": "dns", "value": "a.example.com"}]});
        let jws = key.sign(&header, Some(&payload)).unwrap();
        assert_eq!(jws.payload_json().unwrap(), Some(payload));
        assert_eq!(jws.header_json().unwrap()["kid"], "https://example.com/acct/7");

        let signature = jws.signature_bytes().unwrap();
        assert_eq!(signature.len(), 64);
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, key.keypair().public_point())
            .verify(jws.signing_input().as_bytes(), &signature)
            .expect("JWS signature must verify");
    }
}
