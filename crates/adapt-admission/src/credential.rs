//! Bearer credential issuance and verification using HMAC-SHA256.
//!
//! A credential is `base64url(claims JSON)` and a hex HMAC of that first
//! segment, joined by a dot. Verification is a pure function of the
//! credential, the shared key and the clock reading.

use crate::clock::Clock;
use crate::error::{AdmissionError, CredentialError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TTL_SECONDS: u64 = 3600; // 1 hour

/// Role carried in a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Authenticated subject derived from a verified credential.
///
/// Built per request and never persisted by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject_id: String,
    pub role: Role,
    pub verified: bool,
}

/// Signed claims carried by a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identifier.
    pub sub: String,
    pub role: Role,
    #[serde(default)]
    pub verified: bool,
    /// Issue time, epoch milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub iat: DateTime<Utc>,
    /// Expiry time, epoch milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub exp: DateTime<Utc>,
}

impl Claims {
    fn into_identity(self) -> Identity {
        Identity {
            subject_id: self.sub,
            role: self.role,
            verified: self.verified,
        }
    }
}

/// Validates bearer credentials against a fixed verification key.
#[derive(Clone)]
pub struct CredentialVerifier {
    mac: HmacSha256,
    clock: Arc<dyn Clock>,
}

impl CredentialVerifier {
    /// Create a verifier for credentials signed with `secret`.
    pub fn new(secret: &str, clock: Arc<dyn Clock>) -> Result<Self, AdmissionError> {
        Ok(Self {
            mac: keyed_mac(secret)?,
            clock,
        })
    }

    /// Verify `credential` against the current clock reading.
    pub fn verify(&self, credential: &str) -> Result<Identity, CredentialError> {
        self.verify_at(credential, self.clock.now())
    }

    /// Verify `credential` as of `now`.
    ///
    /// Checks run in order: structure, signature, expiry.
    pub fn verify_at(
        &self,
        credential: &str,
        now: DateTime<Utc>,
    ) -> Result<Identity, CredentialError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(CredentialError::Missing);
        }

        let (payload, signature) = credential
            .split_once('.')
            .filter(|(p, s)| !p.is_empty() && !s.is_empty() && !s.contains('.'))
            .ok_or_else(|| {
                CredentialError::Malformed("expected '<claims>.<signature>'".to_string())
            })?;

        let claims = decode_claims(payload)?;

        let sig_bytes = hex::decode(signature).map_err(|_| CredentialError::InvalidSignature)?;
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        // Constant-time comparison via HMAC verify
        mac.verify_slice(&sig_bytes)
            .map_err(|_| CredentialError::InvalidSignature)?;

        if now >= claims.exp {
            return Err(CredentialError::Expired(claims.exp));
        }

        Ok(claims.into_identity())
    }
}

impl fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVerifier").finish_non_exhaustive()
    }
}

/// Signs new credentials with the shared key.
#[derive(Clone)]
pub struct CredentialIssuer {
    mac: HmacSha256,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(secret: &str, clock: Arc<dyn Clock>) -> Result<Self, AdmissionError> {
        Ok(Self {
            mac: keyed_mac(secret)?,
            clock,
            ttl: Duration::from_secs(DEFAULT_TTL_SECONDS),
        })
    }

    /// Set the lifetime of issued credentials.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Issue a credential for `subject` valid from now for the configured ttl.
    pub fn issue(&self, subject: &str, role: Role, verified: bool) -> Result<String, AdmissionError> {
        if subject.is_empty() {
            return Err(AdmissionError::Configuration(
                "subject must not be empty".to_string(),
            ));
        }
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AdmissionError::Configuration(format!("credential ttl: {}", e)))?;
        let iat = self.clock.now();

        self.sign(&Claims {
            sub: subject.to_string(),
            role,
            verified,
            iat,
            exp: iat + ttl,
        })
    }

    /// Encode and sign arbitrary claims.
    pub fn sign(&self, claims: &Claims) -> Result<String, AdmissionError> {
        let json = serde_json::to_vec(claims)
            .map_err(|e| AdmissionError::Configuration(format!("claims encoding: {}", e)))?;
        let payload = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", payload, signature))
    }
}

impl fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn keyed_mac(secret: &str) -> Result<HmacSha256, AdmissionError> {
    if secret.is_empty() {
        return Err(AdmissionError::Configuration(
            "credential secret must not be empty".to_string(),
        ));
    }
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AdmissionError::Configuration(format!("HMAC error: {}", e)))
}

fn decode_claims(payload: &str) -> Result<Claims, CredentialError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| CredentialError::Malformed("claims are not base64url".to_string()))?;
    let claims: Claims = serde_json::from_slice(&bytes)
        .map_err(|e| CredentialError::Malformed(format!("claims: {}", e)))?;

    if claims.sub.is_empty() {
        return Err(CredentialError::Malformed("subject is empty".to_string()));
    }
    if claims.exp <= claims.iat {
        return Err(CredentialError::Malformed(
            "expiry is not after issue time".to_string(),
        ));
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const SECRET: &str = "my-secret-key";

    fn setup() -> (Arc<ManualClock>, CredentialIssuer, CredentialVerifier) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let issuer = CredentialIssuer::new(SECRET, clock.clone()).unwrap();
        let verifier = CredentialVerifier::new(SECRET, clock.clone()).unwrap();
        (clock, issuer, verifier)
    }

    #[test]
    fn test_issue_and_verify() {
        let (_clock, issuer, verifier) = setup();
        let token = issuer.issue("u1", Role::Admin, true).unwrap();

        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity.subject_id, "u1");
        assert_eq!(identity.role, Role::Admin);
        assert!(identity.verified);
    }

    #[test]
    fn test_expiry_boundary() {
        let (clock, issuer, verifier) = setup();
        let issuer = issuer.with_ttl(Duration::from_secs(60));
        let token = issuer.issue("u1", Role::User, true).unwrap();

        clock.advance(Duration::from_millis(59_999));
        assert!(verifier.verify(&token).is_ok());

        clock.advance(Duration::from_millis(1));
        assert!(matches!(
            verifier.verify(&token),
            Err(CredentialError::Expired(_))
        ));
    }

    #[test]
    fn test_wrong_secret() {
        let (clock, issuer, _) = setup();
        let token = issuer.issue("u1", Role::User, true).unwrap();
        let other = CredentialVerifier::new("wrong-secret", clock).unwrap();

        assert_eq!(
            other.verify(&token).unwrap_err(),
            CredentialError::InvalidSignature
        );
    }

    #[test]
    fn test_tampered_claims_fail_signature() {
        let (clock, issuer, verifier) = setup();
        let token = issuer.issue("u1", Role::User, true).unwrap();
        let (_, signature) = token.split_once('.').unwrap();

        let forged = Claims {
            sub: "u1".to_string(),
            role: Role::Admin,
            verified: true,
            iat: clock.now(),
            exp: clock.now() + chrono::Duration::hours(1),
        };
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let forged_token = format!("{}.{}", forged_payload, signature);

        assert_eq!(
            verifier.verify(&forged_token).unwrap_err(),
            CredentialError::InvalidSignature
        );
    }

    #[test]
    fn test_non_hex_signature_is_invalid() {
        let (_clock, issuer, verifier) = setup();
        let token = issuer.issue("u1", Role::User, true).unwrap();
        let (payload, _) = token.split_once('.').unwrap();

        assert_eq!(
            verifier.verify(&format!("{}.not-hex", payload)).unwrap_err(),
            CredentialError::InvalidSignature
        );
    }

    #[test]
    fn test_malformed_inputs() {
        let (_clock, _issuer, verifier) = setup();

        for input in ["garbage", "a.b.c", ".abc", "abc.", "!!!.deadbeef"] {
            assert!(
                matches!(verifier.verify(input), Err(CredentialError::Malformed(_))),
                "expected malformed for {input:?}"
            );
        }

        let not_claims = URL_SAFE_NO_PAD.encode(br#"{"hello":"world"}"#);
        assert!(matches!(
            verifier.verify(&format!("{}.deadbeef", not_claims)),
            Err(CredentialError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_credential_is_missing() {
        let (_clock, _issuer, verifier) = setup();
        assert_eq!(verifier.verify("  ").unwrap_err(), CredentialError::Missing);
    }

    #[test]
    fn test_expiry_not_after_issue_is_malformed() {
        let (clock, issuer, verifier) = setup();
        let now = clock.now();
        let token = issuer
            .sign(&Claims {
                sub: "u1".to_string(),
                role: Role::User,
                verified: true,
                iat: now,
                exp: now,
            })
            .unwrap();

        assert!(matches!(
            verifier.verify(&token),
            Err(CredentialError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_secret_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch());
        assert!(CredentialVerifier::new("", clock.clone()).is_err());
        assert!(CredentialIssuer::new("", clock).is_err());
    }

    #[test]
    fn test_empty_subject_rejected() {
        let (_clock, issuer, _) = setup();
        assert!(issuer.issue("", Role::User, true).is_err());
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(Role::User.to_string(), "user");
        assert!("root".parse::<Role>().is_err());
    }
}
