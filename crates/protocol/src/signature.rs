use std::{fmt, str::FromStr};

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};

use crate::{CodecError, SignatureError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignatureScheme {
    #[default]
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl SignatureScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            SignatureScheme::HmacSha256 => "hmac-sha256",
            SignatureScheme::HmacSha384 => "hmac-sha384",
            SignatureScheme::HmacSha512 => "hmac-sha512",
        }
    }
}

impl FromStr for SignatureScheme {
    type Err = SignatureError;

    /// Accepts the algorithm after the last `-`, so both `hmac-sha256` and
    /// `hmac1-sha256` select SHA-256.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let unsupported = || SignatureError::UnsupportedScheme(s.to_string());

        if !lowered.starts_with("hmac") {
            return Err(unsupported());
        }

        match lowered.rsplit('-').next() {
            Some("sha256") => Ok(SignatureScheme::HmacSha256),
            Some("sha384") => Ok(SignatureScheme::HmacSha384),
            Some("sha512") => Ok(SignatureScheme::HmacSha512),
            _ => Err(unsupported()),
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
enum KeyedMac {
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
    Sha512(Hmac<Sha512>),
}

impl KeyedMac {
    fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            KeyedMac::Sha256(mac) => finish(mac.clone(), parts),
            KeyedMac::Sha384(mac) => finish(mac.clone(), parts),
            KeyedMac::Sha512(mac) => finish(mac.clone(), parts),
        }
    }

    fn verify(&self, parts: &[&[u8]], expected: &[u8]) -> Result<(), CodecError> {
        match self {
            KeyedMac::Sha256(mac) => check(mac.clone(), parts, expected),
            KeyedMac::Sha384(mac) => check(mac.clone(), parts, expected),
            KeyedMac::Sha512(mac) => check(mac.clone(), parts, expected),
        }
    }
}

fn feed<M: Mac>(mut mac: M, parts: &[&[u8]]) -> M {
    for part in parts {
        mac.update(part);
    }
    mac
}

fn finish<M: Mac>(mac: M, parts: &[&[u8]]) -> Vec<u8> {
    feed(mac, parts).finalize().into_bytes().to_vec()
}

fn check<M: Mac>(mac: M, parts: &[&[u8]], expected: &[u8]) -> Result<(), CodecError> {
    feed(mac, parts)
        .verify_slice(expected)
        .map_err(|_| CodecError::Auth)
}

/// Signs and verifies the four json frames of a message.
///
/// A signer built from an empty key is unsigned: it produces an empty
/// signature and accepts anything. Whether that mode is allowed at all is
/// decided by the kernel configuration, not here.
#[derive(Clone)]
pub struct Signer {
    scheme: SignatureScheme,
    mac: Option<KeyedMac>,
}

impl Signer {
    pub fn new(scheme: SignatureScheme, key: &[u8]) -> Result<Self, SignatureError> {
        if key.is_empty() {
            return Ok(Self {
                scheme,
                mac: None,
            });
        }

        let mac = match scheme {
            SignatureScheme::HmacSha256 => KeyedMac::Sha256(
                Hmac::<Sha256>::new_from_slice(key).map_err(|_| SignatureError::InvalidKey)?,
            ),
            SignatureScheme::HmacSha384 => KeyedMac::Sha384(
                Hmac::<Sha384>::new_from_slice(key).map_err(|_| SignatureError::InvalidKey)?,
            ),
            SignatureScheme::HmacSha512 => KeyedMac::Sha512(
                Hmac::<Sha512>::new_from_slice(key).map_err(|_| SignatureError::InvalidKey)?,
            ),
        };

        Ok(Self {
            scheme,
            mac: Some(mac),
        })
    }

    pub fn unsigned() -> Self {
        Self {
            scheme: SignatureScheme::default(),
            mac: None,
        }
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    pub fn is_signed(&self) -> bool {
        self.mac.is_some()
    }

    /// Hex encoded digest over `parts` concatenated, or an empty string when unsigned.
    pub fn sign(&self, parts: &[&[u8]]) -> String {
        match &self.mac {
            Some(mac) => hex::encode(mac.digest(parts)),
            None => String::new(),
        }
    }

    pub fn verify(&self, parts: &[&[u8]], signature: &[u8]) -> Result<(), CodecError> {
        let Some(mac) = &self.mac else {
            return Ok(());
        };

        let expected = hex::decode(signature).map_err(|_| CodecError::Auth)?;
        mac.verify(parts, &expected)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("scheme", &self.scheme)
            .field("signed", &self.is_signed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[googletest::test]
    fn scheme_is_parsed_from_its_algorithm_suffix() {
        expect_that!(
            "hmac-sha256".parse::<SignatureScheme>(),
            pat!(Ok(eq(SignatureScheme::HmacSha256)))
        );
        expect_that!(
            "hmac1-sha256".parse::<SignatureScheme>(),
            pat!(Ok(eq(SignatureScheme::HmacSha256)))
        );
        expect_that!(
            "HMAC-SHA512".parse::<SignatureScheme>(),
            pat!(Ok(eq(SignatureScheme::HmacSha512)))
        );
        expect_that!("md5".parse::<SignatureScheme>(), pat!(Err(_)));
        expect_that!("hmac-md5".parse::<SignatureScheme>(), pat!(Err(_)));
    }

    #[googletest::test]
    fn signature_matches_known_hmac_sha256_vector() {
        // RFC 4231, test case 2
        let signer = Signer::new(SignatureScheme::HmacSha256, b"Jefe").unwrap();
        let signature = signer.sign(&[b"what do ya want ", b"for nothing?"]);

        expect_that!(
            signature,
            eq("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
        );
    }

    #[googletest::test]
    fn signature_verifies_only_with_the_same_key() {
        let signer = Signer::new(SignatureScheme::HmacSha256, b"secret").unwrap();
        let other = Signer::new(SignatureScheme::HmacSha256, b"other").unwrap();
        let signature = signer.sign(&[b"{}", b"{}"]);

        expect_that!(signer.verify(&[b"{}", b"{}"], signature.as_bytes()), pat!(Ok(_)));
        expect_that!(other.verify(&[b"{}", b"{}"], signature.as_bytes()), pat!(Err(_)));
        expect_that!(signer.verify(&[b"{}", b"{}"], b"not-hex"), pat!(Err(_)));
    }

    #[googletest::test]
    fn unsigned_signer_produces_empty_signature_and_accepts_anything() {
        let signer = Signer::new(SignatureScheme::HmacSha256, b"").unwrap();

        expect_that!(signer.is_signed(), eq(false));
        expect_that!(signer.sign(&[b"{}"]), eq(""));
        expect_that!(signer.verify(&[b"{}"], b"garbage"), pat!(Ok(_)));
    }
}
