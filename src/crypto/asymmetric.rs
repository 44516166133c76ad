use crate::crypto::SignatureError;
use crate::crypto::jws::JsonWebKeyEcdsa;
use aws_lc_rs::encoding::{self, AsBigEndian};
use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{self, ECDSA_P256_SHA256_FIXED_SIGNING};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use pem::Pem;
use std::sync::OnceLock;

/// Length of an X9.62 uncompressed P-256 point: `0x04 ‖ X ‖ Y`
pub const P256_UNCOMPRESSED_POINT_LENGTH: usize = 65;
const P256_COORDINATE_LENGTH: usize = 32;
const PEM_TAG_PRIVATE_KEY: &str = "PRIVATE KEY";

/// An ECDSA P-256 key pair.
///
/// Used both as the long-lived ACME account key and as the per-certificate key. Signatures are always
/// produced in the fixed-width IEEE P1363 form (`r ‖ s`); callers that need ASN.1 must convert.
#[derive(Debug)]
pub struct KeyPair {
    keypair: signature::EcdsaKeyPair,
    public_point: OnceLock<[u8; P256_UNCOMPRESSED_POINT_LENGTH]>,
}

#[allow(clippy::module_name_repetitions)]
pub trait AsymmetricKeyOperation
where
    Self: Sized,
{
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError>;
    fn to_pem(&self) -> Result<Pem, SignatureError>;
    fn to_jwk_parameters(&self) -> JsonWebKeyEcdsa;
}

impl KeyPair {
    fn new(keypair: signature::EcdsaKeyPair) -> Self {
        Self {
            keypair,
            public_point: OnceLock::new(),
        }
    }

    pub fn generate() -> Result<Self, SignatureError> {
        let keypair = signature::EcdsaKeyPair::generate(&ECDSA_P256_SHA256_FIXED_SIGNING)
            .map_err(|_| SignatureError::KeyRejected("Could not generate ECDSA P-256 key"))?;
        Ok(Self::new(keypair))
    }

    pub fn from_pkcs8(der: &[u8]) -> Result<Self, SignatureError> {
        let keypair = signature::EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, der)
            .map_err(|_| {
                SignatureError::KeyRejected("ECDSA P-256 private key is corrupted or invalid")
            })?;
        Ok(Self::new(keypair))
    }

    /// Imports a PKCS#8 `PRIVATE KEY` PEM document as produced by [`AsymmetricKeyOperation::to_pem`].
    pub fn from_pem(pem: &str) -> Result<Self, SignatureError> {
        let pem = pem::parse(pem)
            .map_err(|_| SignatureError::KeyRejected("private key is not valid PEM"))?;
        if pem.tag() != PEM_TAG_PRIVATE_KEY {
            return Err(SignatureError::KeyRejected(
                "private key PEM must be of type PRIVATE KEY (PKCS#8)",
            ));
        }
        Self::from_pkcs8(pem.contents())
    }

    /// The public key as X9.62 uncompressed point, i.e. `0x04 ‖ X ‖ Y`.
    pub fn public_point(&self) -> &[u8; P256_UNCOMPRESSED_POINT_LENGTH] {
        self.public_point.get_or_init(|| {
            let pub_key = signature::KeyPair::public_key(&self.keypair);
            let uncompressed =
                AsBigEndian::<encoding::EcPublicKeyUncompressedBin>::as_be_bytes(pub_key)
                    .expect("BUG: Crypto engine failed to provide public key in uncompressed form");
            uncompressed
                .as_ref()
                .try_into()
                .expect("BUG: P-256 uncompressed point is not 65 bytes")
        })
    }

    /// PKCS#8 PEM text with LF line endings, the form we persist and distribute.
    pub fn to_pem_string(&self) -> Result<String, SignatureError> {
        let pem = self.to_pem()?;
        Ok(pem::encode_config(
            &pem,
            pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        ))
    }
}

impl AsymmetricKeyOperation for KeyPair {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let random = SystemRandom::new();
        let signature = self
            .keypair
            .sign(&random, message)
            .map_err(|_| SignatureError::SignatureGeneration("ECDSA signing failed"))?;
        Ok(signature.as_ref().to_vec())
    }

    fn to_pem(&self) -> Result<Pem, SignatureError> {
        let data = self
            .keypair
            .to_pkcs8v1()
            .map_err(|_| SignatureError::EncodingFailed("Serializing ECDSA keypair failed"))?;
        Ok(Pem::new(PEM_TAG_PRIVATE_KEY, data.as_ref()))
    }

    fn to_jwk_parameters(&self) -> JsonWebKeyEcdsa {
        let point = self.public_point();
        // Uncompressed public key - both coordinates present
        assert_eq!(point[0], 0x04);
        let x = &point[1..=P256_COORDINATE_LENGTH];
        let y = &point[(1 + P256_COORDINATE_LENGTH)..];
        JsonWebKeyEcdsa::new(
            BASE64_URL_SAFE_NO_PAD.encode(x),
            BASE64_URL_SAFE_NO_PAD.encode(y),
        )
    }
}
