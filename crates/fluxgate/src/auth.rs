//! Tenant authentication: bearer tokens issued from an `(app_id, secret)`
//! pair and verified on the data path.
//!
//! Tokens are HS256 JWTs carrying the tenant id as `iss` and an absolute
//! expiry. The signing secret is process configuration, shared between
//! issuance and verification.

use std::time::{SystemTime, UNIX_EPOCH};

use fluxgate_core::prelude::*;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
	#[error("the token is invalid or expired: {0}")]
	Invalid(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
	/// The tenant's `app_id`.
	pub iss: String,
	/// Expiry, seconds since the epoch.
	pub exp: u64,
}

/// Body of a successful `POST /oauth/tokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
	pub access_token: String,
	pub token_type: String,
	pub expires_in: u64,
	pub scope: String,
}

pub struct TokenSigner {
	encoding: EncodingKey,
	decoding: DecodingKey,
	validation: Validation,
	ttl: Duration,
}

impl TokenSigner {
	pub fn new(secret: &str, ttl: Duration) -> Self {
		TokenSigner {
			encoding: EncodingKey::from_secret(secret.as_bytes()),
			decoding: DecodingKey::from_secret(secret.as_bytes()),
			validation: Validation::new(Algorithm::HS256),
			ttl,
		}
	}

	pub fn ttl(&self) -> Duration {
		self.ttl
	}

	pub fn issue(&self, app_id: &str) -> Result<String, TokenError> {
		self.issue_expiring_at(app_id, unix_now() + self.ttl.as_secs())
	}

	fn issue_expiring_at(&self, app_id: &str, exp: u64) -> Result<String, TokenError> {
		let claims = Claims {
			iss: app_id.to_string(),
			exp,
		};
		Ok(jsonwebtoken::encode(
			&Header::new(Algorithm::HS256),
			&claims,
			&self.encoding,
		)?)
	}

	pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
		let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?;
		Ok(data.claims)
	}
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// Pulls the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
	header.strip_prefix("Bearer ").map(str::trim)
}

/// Decodes an `Authorization: Basic base64(app_id:secret)` header value.
pub fn basic_credentials(header: &str) -> Option<(String, String)> {
	use base64::Engine;
	let encoded = header.strip_prefix("Basic ")?.trim();
	let decoded = base64::engine::general_purpose::STANDARD
		.decode(encoded)
		.ok()?;
	let decoded = String::from_utf8(decoded).ok()?;
	let (app_id, secret) = decoded.split_once(':')?;
	Some((app_id.to_string(), secret.to_string()))
}
