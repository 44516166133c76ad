//! PKCS#10 certificate signing requests for a single domain.
//!
//! The request is assembled by hand from the primitives in [`crate::crypto::der`]. Only what a CA needs
//! to issue a DNS-validated certificate is included: a subject containing just the common name, the
//! P-256 public key and an empty attribute set. The CA derives the subjectAltName from the order
//! identifiers, so no extension request is sent.

use crate::crypto::SignatureError;
use crate::crypto::asymmetric::{AsymmetricKeyOperation, KeyPair, P256_UNCOMPRESSED_POINT_LENGTH};
use crate::crypto::der::{
    der_bit_string, der_integer, der_oid, der_sequence, der_set, der_tlv, der_utf8_string,
    ecdsa_p256_signature_to_der,
};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;

const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];
const OID_ECDSA_WITH_SHA256: &[u64] = &[1, 2, 840, 10045, 4, 3, 2];
/// Context-specific, constructed tag `[0]` used for the attributes of a CertificationRequestInfo
const TAG_ATTRIBUTES: u8 = 0xA0;

/// DER prefix of a P-256 SubjectPublicKeyInfo, up to and including the unused-bits octet of the BIT STRING:
/// `SEQUENCE(89) { SEQUENCE(19) { OID ecPublicKey, OID prime256v1 }, BIT STRING(66) { 0x00, ... } }`.
/// Appending the 65 byte uncompressed point yields the complete 91 byte structure.
const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01, 0x06, 0x08, 0x2A,
    0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];
pub const P256_SPKI_LENGTH: usize = P256_SPKI_PREFIX.len() + P256_UNCOMPRESSED_POINT_LENGTH;

/// A signed CSR together with the freshly generated certificate key it certifies.
#[derive(Debug)]
pub struct CertificateRequest {
    private_key: KeyPair,
    der: Vec<u8>,
}

impl CertificateRequest {
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The CSR as transmitted in an ACME finalize request.
    pub fn to_base64url(&self) -> String {
        BASE64_URL_SAFE_NO_PAD.encode(&self.der)
    }

    pub fn private_key(&self) -> &KeyPair {
        &self.private_key
    }

    pub fn into_private_key(self) -> KeyPair {
        self.private_key
    }
}

pub fn subject_public_key_info(public_point: &[u8; P256_UNCOMPRESSED_POINT_LENGTH]) -> Vec<u8> {
    let mut spki = Vec::with_capacity(P256_SPKI_LENGTH);
    spki.extend_from_slice(&P256_SPKI_PREFIX);
    spki.extend_from_slice(public_point);
    spki
}

fn subject_name(domain: &str) -> Vec<u8> {
    let common_name = der_sequence(&[&der_oid(OID_COMMON_NAME), &der_utf8_string(domain)]);
    let relative_distinguished_name = der_set(&[&common_name]);
    der_sequence(&[&relative_distinguished_name])
}

/// Builds and self-signs a CSR for `domain` with `keypair`, which must not be the account key.
pub fn build_csr(domain: &str, keypair: KeyPair) -> Result<CertificateRequest, SignatureError> {
    if domain.is_empty() {
        return Err(SignatureError::EncodingFailed(
            "CSR subject must have a non-empty common name",
        ));
    }
    let version = der_integer(&[0]);
    let subject = subject_name(domain);
    let spki = subject_public_key_info(keypair.public_point());
    let attributes = der_tlv(TAG_ATTRIBUTES, &[]);
    let request_info = der_sequence(&[&version, &subject, &spki, &attributes]);

    let raw_signature = keypair.sign(&request_info)?;
    let signature = ecdsa_p256_signature_to_der(&raw_signature)?;
    let signature_algorithm = der_sequence(&[&der_oid(OID_ECDSA_WITH_SHA256)]);

    let der = der_sequence(&[
        &request_info,
        &signature_algorithm,
        &der_bit_string(&signature),
    ]);
    Ok(CertificateRequest {
        private_key: keypair,
        der,
    })
}

/// Generates a new certificate key and a CSR for it.
pub fn build_csr_with_new_key(domain: &str) -> Result<CertificateRequest, SignatureError> {
    build_csr(domain, KeyPair::generate()?)
}
