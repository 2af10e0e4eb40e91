//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! Only the S256 method is supported. `plain` is rejected outright: it offers
//! no protection if the authorization request is observed.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use constant_time_eq::constant_time_eq;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Shortest verifier RFC 7636 allows.
pub const MIN_VERIFIER_LEN: usize = 43;
/// Longest verifier RFC 7636 allows.
pub const MAX_VERIFIER_LEN: usize = 128;

/// RFC 3986 unreserved characters: `[A-Za-z0-9-._~]`.
const UNRESERVED: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Code challenge transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeMethod {
    S256,
}

impl ChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeMethod::S256 => "S256",
        }
    }
}

impl FromStr for ChallengeMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "S256" => Ok(ChallengeMethod::S256),
            other => Err(Error::UnsupportedMethod(format!(
                "code_challenge_method {other:?} is not supported, use S256"
            ))),
        }
    }
}

impl fmt::Display for ChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a 43-character verifier.
pub fn generate_verifier() -> String {
    generate_verifier_with_len(MIN_VERIFIER_LEN)
}

/// Generate a verifier of `len` characters, clamped into `43..=128`.
pub fn generate_verifier_with_len(len: usize) -> String {
    let len = len.clamp(MIN_VERIFIER_LEN, MAX_VERIFIER_LEN);
    let mut rng = rand::rng();
    (0..len)
        .map(|_| UNRESERVED[rng.random_range(0..UNRESERVED.len())] as char)
        .collect()
}

/// Whether `verifier` has a legal length and alphabet.
pub fn is_well_formed_verifier(verifier: &str) -> bool {
    (MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len())
        && verifier.bytes().all(|b| UNRESERVED.contains(&b))
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn derive_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Check `verifier` against a stored `challenge`.
///
/// Fails with `UnsupportedMethod` for anything but `S256`. The comparison
/// runs in constant time over the encoded challenge.
pub fn verify(verifier: &str, challenge: &str, method: &str) -> Result<bool> {
    match method.parse::<ChallengeMethod>()? {
        ChallengeMethod::S256 => {
            let computed = derive_challenge(verifier);
            Ok(constant_time_eq(computed.as_bytes(), challenge.as_bytes()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // RFC 7636 Appendix B
    const RFC_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const RFC_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn derive_matches_rfc_vector() {
        assert_eq!(derive_challenge(RFC_VERIFIER), RFC_CHALLENGE);
    }

    #[test]
    fn verify_accepts_rfc_vector() {
        assert!(verify(RFC_VERIFIER, RFC_CHALLENGE, "S256").unwrap());
    }

    #[test]
    fn verify_rejects_wrong_verifier() {
        assert!(!verify("wrong-verifier", RFC_CHALLENGE, "S256").unwrap());
    }

    #[test]
    fn verify_rejects_wrong_challenge() {
        assert!(!verify(RFC_VERIFIER, "wrong-challenge", "S256").unwrap());
    }

    #[test]
    fn plain_method_is_unsupported() {
        let err = verify(RFC_VERIFIER, RFC_VERIFIER, "plain").unwrap_err();
        assert!(matches!(err, Error::UnsupportedMethod(_)));
        assert_eq!(err.oauth_code(), "unsupported_challenge_method");
    }

    #[test]
    fn method_parsing_is_case_sensitive() {
        assert!("S256".parse::<ChallengeMethod>().is_ok());
        assert!("s256".parse::<ChallengeMethod>().is_err());
        assert_eq!(ChallengeMethod::S256.to_string(), "S256");
    }

    #[test]
    fn method_serializes_as_s256() {
        assert_eq!(serde_json::to_string(&ChallengeMethod::S256).unwrap(), "\"S256\"");
        assert!(serde_json::from_str::<ChallengeMethod>("\"plain\"").is_err());
    }

    #[test]
    fn default_verifier_is_43_chars() {
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), MIN_VERIFIER_LEN);
        assert!(is_well_formed_verifier(&verifier));
    }

    #[test]
    fn verifier_length_is_clamped() {
        assert_eq!(generate_verifier_with_len(1).len(), MIN_VERIFIER_LEN);
        assert_eq!(generate_verifier_with_len(500).len(), MAX_VERIFIER_LEN);
    }

    #[test]
    fn generated_verifier_roundtrips() {
        let verifier = generate_verifier_with_len(96);
        let challenge = derive_challenge(&verifier);
        assert_eq!(challenge.len(), 43);
        assert!(verify(&verifier, &challenge, "S256").unwrap());
    }

    #[test]
    fn malformed_verifiers_are_detected() {
        assert!(!is_well_formed_verifier("short"));
        assert!(!is_well_formed_verifier(&"a".repeat(129)));
        assert!(!is_well_formed_verifier(&format!("{}!", "a".repeat(43))));
        assert!(is_well_formed_verifier(RFC_VERIFIER));
    }

    proptest! {
        #[test]
        fn generated_verifiers_stay_in_alphabet(len in 0usize..300) {
            let verifier = generate_verifier_with_len(len);
            prop_assert!(verifier.len() >= MIN_VERIFIER_LEN);
            prop_assert!(verifier.len() <= MAX_VERIFIER_LEN);
            prop_assert!(verifier.bytes().all(|b| b.is_ascii_alphanumeric() || b"-._~".contains(&b)));
        }

        #[test]
        fn challenge_is_deterministic(verifier in "[A-Za-z0-9._~-]{43,128}") {
            prop_assert_eq!(derive_challenge(&verifier), derive_challenge(&verifier));
            prop_assert!(verify(&verifier, &derive_challenge(&verifier), "S256").unwrap());
        }
    }
}
