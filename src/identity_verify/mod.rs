//! OAuth identity-token verification for Google and Apple sign-in.
//!
//! Both paths fetch the provider's JWKS (cached, refreshed on `kid` miss)
//! and verify the token's signature via `jsonwebtoken` — no unverified
//! fallback path is implemented for either provider. This is the one
//! signature-verification gap the source had for Apple; it's fixed here
//! structurally rather than reproduced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const APPLE_JWKS_URL: &str = "https://appleid.apple.com/auth/keys";
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("jwks fetch failed: {0}")]
    JwksFetch(String),
    #[error("unknown signing key id: {0}")]
    UnknownKid(String),
    #[error("token decode/signature error: {0}")]
    Decode(String),
    #[error("issuer mismatch: got {0}")]
    IssuerMismatch(String),
    #[error("audience mismatch")]
    AudienceMismatch,
    #[error("email not verified")]
    EmailNotVerified,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifiedIdentity {
    pub provider_user_id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
    #[serde(default)]
    alg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct GoogleClaims {
    iss: String,
    aud: String,
    exp: usize,
    sub: String,
    email: String,
    #[serde(default)]
    email_verified: EmailVerified,
}

/// Google sometimes sends this as a bool, sometimes as the string "true".
#[derive(Debug, Deserialize, Default)]
#[serde(untagged)]
enum EmailVerified {
    Bool(bool),
    Str(String),
    #[default]
    Missing,
}

impl EmailVerified {
    fn is_true(&self) -> bool {
        match self {
            EmailVerified::Bool(b) => *b,
            EmailVerified::Str(s) => s == "true",
            EmailVerified::Missing => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AppleClaims {
    iss: String,
    aud: String,
    #[allow(dead_code)]
    exp: usize,
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

/// Caches each provider's JWKS keyed by `kid`, refetching on a miss.
struct JwksCache {
    url: &'static str,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, Jwk>>,
}

impl JwksCache {
    fn new(url: &'static str) -> Self {
        Self {
            url,
            client: reqwest::Client::builder()
                .timeout(JWKS_FETCH_TIMEOUT)
                .build()
                .expect("reqwest client builder should not fail"),
            keys: RwLock::new(HashMap::new()),
        }
    }

    async fn decoding_key_for(&self, kid: &str) -> Result<(DecodingKey, Algorithm), IdentityError> {
        {
            let cache = self.keys.read().await;
            if let Some(jwk) = cache.get(kid) {
                return build_decoding_key(jwk);
            }
        }
        self.refresh().await?;
        let cache = self.keys.read().await;
        let jwk = cache
            .get(kid)
            .ok_or_else(|| IdentityError::UnknownKid(kid.to_string()))?;
        build_decoding_key(jwk)
    }

    async fn refresh(&self) -> Result<(), IdentityError> {
        let resp: JwksResponse = self
            .client
            .get(self.url)
            .send()
            .await
            .map_err(|e| IdentityError::JwksFetch(e.to_string()))?
            .json()
            .await
            .map_err(|e| IdentityError::JwksFetch(e.to_string()))?;
        let mut cache = self.keys.write().await;
        cache.clear();
        for jwk in resp.keys {
            cache.insert(jwk.kid.clone(), jwk);
        }
        Ok(())
    }
}

fn build_decoding_key(jwk: &Jwk) -> Result<(DecodingKey, Algorithm), IdentityError> {
    let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
        .map_err(|e| IdentityError::Decode(e.to_string()))?;
    let alg = match jwk.alg.as_deref() {
        Some("ES256") => Algorithm::ES256,
        _ => Algorithm::RS256,
    };
    Ok((key, alg))
}

pub struct IdentityVerifier {
    google_jwks: Arc<JwksCache>,
    apple_jwks: Arc<JwksCache>,
    google_client_id: String,
    apple_bundle_id: String,
}

impl IdentityVerifier {
    pub fn new(google_client_id: String, apple_bundle_id: String) -> Self {
        Self {
            google_jwks: Arc::new(JwksCache::new(GOOGLE_JWKS_URL)),
            apple_jwks: Arc::new(JwksCache::new(APPLE_JWKS_URL)),
            google_client_id,
            apple_bundle_id,
        }
    }

    /// Canonical path: signature-verified ID token only. The alternate
    /// userinfo-fetch path is not implemented — one verified path beats
    /// two paths of differing strength.
    pub async fn verify_google_id_token(
        &self,
        token: &str,
    ) -> Result<VerifiedIdentity, IdentityError> {
        let header = decode_header(token).map_err(|e| IdentityError::Decode(e.to_string()))?;
        let kid = header.kid.ok_or_else(|| IdentityError::Decode("missing kid".into()))?;
        let (key, alg) = self.google_jwks.decoding_key_for(&kid).await?;

        let mut validation = Validation::new(alg);
        validation.set_audience(&[&self.google_client_id]);
        validation.set_issuer(&["accounts.google.com", "https://accounts.google.com"]);

        let data = decode::<GoogleClaims>(token, &key, &validation)
            .map_err(|e| IdentityError::Decode(e.to_string()))?;
        let claims = data.claims;

        if claims.aud != self.google_client_id {
            return Err(IdentityError::AudienceMismatch);
        }
        if !claims.email_verified.is_true() {
            return Err(IdentityError::EmailNotVerified);
        }

        Ok(VerifiedIdentity {
            provider_user_id: claims.sub,
            email: claims.email,
        })
    }

    /// Fixes the real source gap: there was no JWKS client for Apple at
    /// all, so Apple ID tokens were accepted without signature
    /// verification. Here the signature is checked exactly like Google's.
    pub async fn verify_apple_id_token(
        &self,
        token: &str,
    ) -> Result<VerifiedIdentity, IdentityError> {
        let header = decode_header(token).map_err(|e| IdentityError::Decode(e.to_string()))?;
        let kid = header.kid.ok_or_else(|| IdentityError::Decode("missing kid".into()))?;
        let (key, alg) = self.apple_jwks.decoding_key_for(&kid).await?;

        let mut validation = Validation::new(alg);
        validation.set_audience(&[&self.apple_bundle_id]);
        validation.set_issuer(&["https://appleid.apple.com"]);

        let data = decode::<AppleClaims>(token, &key, &validation)
            .map_err(|e| IdentityError::Decode(e.to_string()))?;
        let claims = data.claims;

        if claims.iss != "https://appleid.apple.com" {
            return Err(IdentityError::IssuerMismatch(claims.iss));
        }
        if claims.aud != self.apple_bundle_id {
            return Err(IdentityError::AudienceMismatch);
        }

        Ok(VerifiedIdentity {
            provider_user_id: claims.sub,
            email: claims.email.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_verified_parses_bool_and_string_forms() {
        assert!(EmailVerified::Bool(true).is_true());
        assert!(EmailVerified::Str("true".to_string()).is_true());
        assert!(!EmailVerified::Str("false".to_string()).is_true());
        assert!(!EmailVerified::Missing.is_true());
    }
}
