//! Minimal DER (X.690) encoders.
//!
//! Only the handful of universal types needed to assemble a PKCS#10 request for an ECDSA P-256 key are
//! supported. Every function is pure and allocates its own output, so callers compose structures
//! bottom-up: encode the innermost values first and wrap them in constructed types afterwards.

use crate::crypto::SignatureError;

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0C;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// Length of a single P-256 scalar in bytes
const P256_SCALAR_LENGTH: usize = 32;

/// Encodes a length in DER: short form below 128, long form with the minimal number of octets otherwise.
pub fn der_length(length: usize) -> Vec<u8> {
    if length < 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        return vec![length as u8];
    }
    let be = length.to_be_bytes();
    let first_nonzero = be.iter().position(|b| *b != 0).unwrap_or(be.len() - 1);
    let significant = &be[first_nonzero..];
    let mut encoded = Vec::with_capacity(1 + significant.len());
    #[allow(clippy::cast_possible_truncation)]
    encoded.push(0x80 | significant.len() as u8);
    encoded.extend_from_slice(significant);
    encoded
}

/// Encodes a complete tag-length-value triple.
pub fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let length = der_length(content.len());
    let mut encoded = Vec::with_capacity(1 + length.len() + content.len());
    encoded.push(tag);
    encoded.extend_from_slice(&length);
    encoded.extend_from_slice(content);
    encoded
}

/// Encodes an unsigned big-endian integer as a DER INTEGER.
///
/// Redundant leading zero bytes are removed (keeping one for the value zero). If the most significant
/// remaining bit is set, a single `0x00` is prepended so the value stays non-negative.
pub fn der_integer(unsigned_be: &[u8]) -> Vec<u8> {
    let first_nonzero = unsigned_be.iter().position(|b| *b != 0);
    let stripped = match first_nonzero {
        Some(index) => &unsigned_be[index..],
        None => &[0u8][..],
    };
    let mut content = Vec::with_capacity(stripped.len() + 1);
    if stripped[0] & 0x80 != 0 {
        content.push(0x00);
    }
    content.extend_from_slice(stripped);
    der_tlv(TAG_INTEGER, &content)
}

fn concat(elements: &[&[u8]]) -> Vec<u8> {
    let total = elements.iter().map(|e| e.len()).sum();
    let mut content = Vec::with_capacity(total);
    for element in elements {
        content.extend_from_slice(element);
    }
    content
}

/// Wraps already encoded elements into a SEQUENCE.
pub fn der_sequence(elements: &[&[u8]]) -> Vec<u8> {
    der_tlv(TAG_SEQUENCE, &concat(elements))
}

/// Wraps already encoded elements into a SET. The caller is responsible for DER ordering.
pub fn der_set(elements: &[&[u8]]) -> Vec<u8> {
    der_tlv(TAG_SET, &concat(elements))
}

/// Encodes a BIT STRING whose content is a whole number of octets (zero unused bits).
pub fn der_bit_string(content: &[u8]) -> Vec<u8> {
    let mut with_unused_bits = Vec::with_capacity(content.len() + 1);
    with_unused_bits.push(0x00);
    with_unused_bits.extend_from_slice(content);
    der_tlv(TAG_BIT_STRING, &with_unused_bits)
}

pub fn der_utf8_string(value: &str) -> Vec<u8> {
    der_tlv(TAG_UTF8_STRING, value.as_bytes())
}

/// Encodes an OBJECT IDENTIFIER from its arcs, e.g. `&[2, 5, 4, 3]` for `id-at-commonName`.
///
/// # Panics
///
/// If fewer than two arcs are given, or the first two arcs are out of range. OIDs are compile-time
/// constants in this crate, so this indicates a programming error.
pub fn der_oid(arcs: &[u64]) -> Vec<u8> {
    assert!(arcs.len() >= 2, "BUG: OID needs at least two arcs");
    assert!(
        arcs[0] <= 2 && (arcs[0] == 2 || arcs[1] < 40),
        "BUG: invalid leading OID arcs"
    );
    let mut content = Vec::new();
    push_base128(&mut content, arcs[0] * 40 + arcs[1]);
    for arc in &arcs[2..] {
        push_base128(&mut content, *arc);
    }
    der_tlv(TAG_OID, &content)
}

fn push_base128(out: &mut Vec<u8>, mut value: u64) {
    let mut groups = [0u8; 10];
    let mut count = 0;
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let group = (value & 0x7F) as u8;
        groups[count] = group;
        count += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for i in (0..count).rev() {
        let continuation = if i == 0 { 0x00 } else { 0x80 };
        out.push(groups[i] | continuation);
    }
}

/// Converts a fixed-width IEEE P1363 ECDSA P-256 signature (`r ‖ s`, 32 bytes each) into the
/// ASN.1 form `SEQUENCE { INTEGER r, INTEGER s }` used by X.509 and PKCS#10.
pub fn ecdsa_p256_signature_to_der(raw_signature: &[u8]) -> Result<Vec<u8>, SignatureError> {
    if raw_signature.len() != 2 * P256_SCALAR_LENGTH {
        return Err(SignatureError::EncodingFailed(
            "ECDSA P-256 signature must be exactly 64 bytes (r || s)",
        ));
    }
    let (r, s) = raw_signature.split_at(P256_SCALAR_LENGTH);
    Ok(der_sequence(&[&der_integer(r), &der_integer(s)]))
}
