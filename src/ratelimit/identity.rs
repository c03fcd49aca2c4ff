//! Caller identification.
//!
//! A request is attributed to the strongest identity it carries: a verified
//! bearer token, then an API key, then the client address. Any failure to
//! parse or verify a credential falls through to the next tier.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use super::rules::CallerClass;

/// Header carrying a raw API key.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header carrying the proxy chain, client first.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Claims extracted from a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaims {
    pub subject: String,
    pub role: Option<String>,
}

/// Verifies bearer tokens. Token issuance lives elsewhere; this is only the
/// consuming side.
pub trait TokenVerifier: Send + Sync {
    /// Return the token's claims, or `None` if it does not verify.
    fn verify(&self, token: &str) -> Option<VerifiedClaims>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    role: Option<String>,
    exp: u64,
}

/// HMAC-signed JWT verifier.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Verify HS256 tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Additionally require the `iss` claim to match.
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Option<VerifiedClaims> {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Some(VerifiedClaims {
                subject: data.claims.sub,
                role: data.claims.role,
            }),
            Err(e) => {
                debug!(error = %e, "Bearer token did not verify");
                None
            }
        }
    }
}

/// The identity a request is rate limited under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable key such as `user:42`, `api_key:<sha256>` or `ip:10.0.0.1`
    pub id: String,
    pub caller_class: CallerClass,
}

/// Derives an [`Identity`] from request headers and the peer address.
#[derive(Clone, Default)]
pub struct ClientIdentifier {
    verifier: Option<Arc<dyn TokenVerifier>>,
}

impl ClientIdentifier {
    /// An identifier that never trusts bearer tokens.
    pub fn new() -> Self {
        Self::default()
    }

    /// An identifier that accepts bearer tokens passing `verifier`.
    pub fn with_verifier(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            verifier: Some(verifier),
        }
    }

    pub fn identify(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Identity {
        if let Some(claims) = self.bearer_claims(headers) {
            let caller_class = claims
                .role
                .as_deref()
                .map(CallerClass::from_role)
                .unwrap_or(CallerClass::Regular);
            return Identity {
                id: format!("user:{}", claims.subject),
                caller_class,
            };
        }

        if let Some(api_key) = header_str(headers, API_KEY_HEADER) {
            return Identity {
                id: format!("api_key:{}", hash_api_key(api_key)),
                caller_class: CallerClass::Guest,
            };
        }

        let ip = forwarded_for(headers).or(peer);
        Identity {
            id: match ip {
                Some(ip) => format!("ip:{}", ip),
                None => "ip:unknown".to_string(),
            },
            caller_class: CallerClass::Guest,
        }
    }

    fn bearer_claims(&self, headers: &HeaderMap) -> Option<VerifiedClaims> {
        let verifier = self.verifier.as_ref()?;
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))?
            .trim();
        if token.is_empty() {
            return None;
        }
        verifier.verify(token)
    }
}

impl std::fmt::Debug for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentifier")
            .field("verifies_bearer", &self.verifier.is_some())
            .finish()
    }
}

/// One-way hash of an API key so the raw secret never reaches store keys or
/// logs.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Left-most address in `X-Forwarded-For`, if it parses.
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = header_str(headers, FORWARDED_FOR_HEADER)?;
    let first = value.split(',').next()?.trim();
    match first.parse::<IpAddr>() {
        Ok(ip) => Some(ip),
        Err(_) => {
            debug!(value = %first, "Ignoring unparseable X-Forwarded-For entry");
            None
        }
    }
}
