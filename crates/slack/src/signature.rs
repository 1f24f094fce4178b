use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_VERSION: &str = "v0";
pub const MAX_REQUEST_AGE_SECS: i64 = 60 * 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing request signature headers")]
    MissingHeaders,
    #[error("invalid request timestamp `{0}`")]
    InvalidTimestamp(String),
    #[error("request timestamp is outside the accepted window")]
    Stale,
    #[error("request signature mismatch")]
    Mismatch,
    #[error("signing secret is not usable as an HMAC key")]
    InvalidKey,
}

/// Verifies `X-Slack-Signature` against `v0:{timestamp}:{body}`.
pub struct SignatureVerifier {
    secret: Vec<u8>,
    max_age_secs: i64,
}

impl SignatureVerifier {
    pub fn new(signing_secret: &str) -> Self {
        Self { secret: signing_secret.as_bytes().to_vec(), max_age_secs: MAX_REQUEST_AGE_SECS }
    }

    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now_unix: i64,
    ) -> Result<(), SignatureError> {
        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            return Err(SignatureError::MissingHeaders);
        };
        let sent_at: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp(timestamp.to_string()))?;
        if now_unix.abs_diff(sent_at) > self.max_age_secs.unsigned_abs() {
            return Err(SignatureError::Stale);
        }

        let provided = signature
            .trim()
            .strip_prefix(SIGNATURE_VERSION)
            .and_then(|rest| rest.strip_prefix('='))
            .and_then(|digest| hex::decode(digest).ok())
            .ok_or(SignatureError::Mismatch)?;
        self.mac(timestamp.trim(), body)?
            .verify_slice(&provided)
            .map_err(|_| SignatureError::Mismatch)
    }

    pub fn sign(&self, timestamp: &str, body: &[u8]) -> Result<String, SignatureError> {
        let digest = self.mac(timestamp, body)?.finalize().into_bytes();
        Ok(format!("{SIGNATURE_VERSION}={}", hex::encode(digest)))
    }

    fn mac(&self, timestamp: &str, body: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| SignatureError::InvalidKey)?;
        mac.update(format!("{SIGNATURE_VERSION}:{timestamp}:").as_bytes());
        mac.update(body);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::{SignatureError, SignatureVerifier};

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";
    const BODY: &[u8] = b"token=xyzz0WbapA4vBCDEFasx0q6G&team_id=T1DC2JH3J";

    #[test]
    fn accepts_own_signature_inside_window() {
        let verifier = SignatureVerifier::new(SECRET);
        let signature = verifier.sign("1531420618", BODY).expect("sign");

        assert!(signature.starts_with("v0="));
        assert_eq!(signature.len(), 3 + 64);
        assert_eq!(verifier.verify(Some("1531420618"), Some(&signature), BODY, 1531420618 + 60), Ok(()));
    }

    #[test]
    fn rejects_stale_tampered_and_missing() {
        let verifier = SignatureVerifier::new(SECRET);
        let signature = verifier.sign("1531420618", BODY).expect("sign");

        assert_eq!(
            verifier.verify(Some("1531420618"), Some(&signature), BODY, 1531420618 + 301),
            Err(SignatureError::Stale)
        );
        assert_eq!(
            verifier.verify(Some("1531420618"), Some(&signature), b"tampered", 1531420618),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(verifier.verify(None, Some(&signature), BODY, 0), Err(SignatureError::MissingHeaders));
        assert!(matches!(
            verifier.verify(Some("soon"), Some(&signature), BODY, 0),
            Err(SignatureError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn extreme_timestamps_are_stale_not_a_panic() {
        let verifier = SignatureVerifier::new(SECRET);
        let signature = verifier.sign("1531420618", BODY).expect("sign");

        for timestamp in [i64::MIN.to_string(), i64::MAX.to_string()] {
            assert_eq!(
                verifier.verify(Some(&timestamp), Some(&signature), BODY, 1531420618),
                Err(SignatureError::Stale)
            );
        }
    }

    #[test]
    fn malformed_signatures_are_mismatches() {
        let verifier = SignatureVerifier::new(SECRET);
        let signature = verifier.sign("1531420618", BODY).expect("sign");
        let uppercase = signature.to_uppercase().replacen("V0", "v0", 1);

        assert_eq!(verifier.verify(Some("1531420618"), Some(&uppercase), BODY, 1531420618), Ok(()));
        for bad in ["v0=zz", "v1=abcd", &signature[3..]] {
            assert_eq!(
                verifier.verify(Some("1531420618"), Some(bad), BODY, 1531420618),
                Err(SignatureError::Mismatch)
            );
        }
    }
}
