//! HMAC-signed JWT implementation of [`AuthGate`].
//!
//! Only the configured algorithm is accepted. The header's `alg` is checked
//! before any signature work, so `none` and algorithm substitution are
//! refused as [`AuthError::UnsupportedAlgorithm`]. Expiry is checked against
//! the validation instant with no leeway.

use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use courier_core::{AuthError, AuthGate, Principal};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Claims carried by relay credentials.
///
/// `sub` is the principal. Older clients put it in `username` instead; it is
/// used when `sub` is absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    fn principal(&self) -> Option<Principal> {
        self.sub
            .as_deref()
            .or(self.username.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Principal::from)
    }
}

/// HMAC family accepted as configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HmacAlgorithm {
    #[default]
    HS256,
    HS384,
    HS512,
}

impl HmacAlgorithm {
    fn as_jwt(self) -> Algorithm {
        match self {
            Self::HS256 => Algorithm::HS256,
            Self::HS384 => Algorithm::HS384,
            Self::HS512 => Algorithm::HS512,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::HS256 => "HS256",
            Self::HS384 => "HS384",
            Self::HS512 => "HS512",
        }
    }
}

impl FromStr for HmacAlgorithm {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HS256" => Ok(Self::HS256),
            "HS384" => Ok(Self::HS384),
            "HS512" => Ok(Self::HS512),
            other => Err(format!("unsupported jwt algorithm: {other}")),
        }
    }
}

/// Signing configuration.
#[derive(Clone, Debug)]
pub struct JwtConfig {
    pub secret: SecretString,
    pub algorithm: HmacAlgorithm,
}

impl JwtConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: SecretString::from(secret.into()),
            algorithm: HmacAlgorithm::default(),
        }
    }
}

/// Bearer-token gate for the upgrade endpoint.
pub struct JwtGate {
    algorithm: HmacAlgorithm,
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
}

impl JwtGate {
    pub fn new(config: &JwtConfig) -> Self {
        let secret = config.secret.expose_secret().as_bytes();
        Self {
            algorithm: config.algorithm,
            decoding_key: DecodingKey::from_secret(secret),
            encoding_key: EncodingKey::from_secret(secret),
        }
    }

    /// Validate `token` as of `now`.
    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<Principal, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let alg = header_algorithm(token)?;
        if alg != self.algorithm.name() {
            return Err(AuthError::UnsupportedAlgorithm(alg));
        }

        let mut validation = Validation::new(self.algorithm.as_jwt());
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => AuthError::SignatureInvalid,
                ErrorKind::InvalidAlgorithm => {
                    AuthError::UnsupportedAlgorithm(self.algorithm.name().to_owned())
                }
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Malformed(e.to_string()),
            })?;

        if data.claims.exp <= now.timestamp() {
            return Err(AuthError::Expired);
        }

        let principal = data
            .claims
            .principal()
            .ok_or_else(|| AuthError::Malformed("no subject claim".into()))?;
        debug!(principal = %principal, "credential validated");
        Ok(principal)
    }

    /// Mint a token for local development and tests.
    pub fn issue(&self, principal: &Principal, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: Some(principal.to_string()),
            username: None,
            device_id: None,
            email: None,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        jsonwebtoken::encode(&Header::new(self.algorithm.as_jwt()), claims, &self.encoding_key)
            .map_err(|e| AuthError::Malformed(e.to_string()))
    }
}

impl AuthGate for JwtGate {
    fn validate(&self, token: &str) -> Result<Principal, AuthError> {
        self.validate_at(token, Utc::now())
    }
}

#[derive(Deserialize)]
struct RawHeader {
    alg: Option<String>,
}

/// Read `alg` from the header segment without trusting any of it.
fn header_algorithm(token: &str) -> Result<String, AuthError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(AuthError::Malformed("expected three segments".into()));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(segments[0].trim_end_matches('='))
        .map_err(|e| AuthError::Malformed(format!("header encoding: {e}")))?;
    let header: RawHeader = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::Malformed(format!("header json: {e}")))?;
    header
        .alg
        .ok_or_else(|| AuthError::Malformed("header has no alg".into()))
}
