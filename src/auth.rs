use crate::error::Error;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::Mutex;

pub const DBM_SCOPE: &str = "https://www.googleapis.com/auth/doubleclickbidmanager";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
// Cached tokens are treated as expired this many seconds early.
const REFRESH_MARGIN_SECS: i64 = 60;

/// The fields of a Google service-account key file this tool needs.
#[derive(Deserialize, Clone, Debug)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    /// Loads a service-account key from a JSON file.
    ///
    /// # Returns
    /// [`Error::Configuration`] when the file is absent or not a key file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Err(Error::configuration(format!(
                "API key {} does not exist",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|err| {
            Error::configuration(format!(
                "{} is not a service account key: {}",
                path.display(),
                err
            ))
        })
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct CachedToken {
    value: String,
    expires_at: i64,
}

pub enum Credentials {
    Static(String),
    ServiceAccount {
        key: ServiceAccountKey,
        cached: Mutex<Option<CachedToken>>,
    },
}

impl Credentials {
    pub fn service_account(key: ServiceAccountKey) -> Self {
        Credentials::ServiceAccount {
            key,
            cached: Mutex::new(None),
        }
    }

    /// Returns a bearer token, exchanging a fresh JWT assertion when the cached
    /// token is missing or close to expiry.
    pub async fn bearer(&self, client: &Client) -> Result<String, Error> {
        match self {
            Credentials::Static(token) => Ok(token.clone()),
            Credentials::ServiceAccount { key, cached } => {
                let mut cached = cached.lock().await;
                let now = Utc::now().timestamp();

                if let Some(token) = cached.as_ref() {
                    if token.expires_at - REFRESH_MARGIN_SECS > now {
                        return Ok(token.value.clone());
                    }
                }

                let token = exchange_assertion(client, key, now).await?;
                let value = token.value.clone();
                *cached = Some(token);
                Ok(value)
            }
        }
    }
}

fn sign_assertion(key: &ServiceAccountKey, now: i64) -> Result<String, Error> {
    let claims = Claims {
        iss: &key.client_email,
        scope: DBM_SCOPE,
        aud: &key.token_uri,
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };
    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;

    Ok(encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)?)
}

async fn exchange_assertion(
    client: &Client,
    key: &ServiceAccountKey,
    now: i64,
) -> Result<CachedToken, Error> {
    let assertion = sign_assertion(key, now)?;
    debug!("Requesting access token for {}", key.client_email);

    let resp = client
        .post(&key.token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::Auth {
            message: format!("token endpoint returned {}: {}", status, body),
        });
    }

    let token: TokenResponse = resp.json().await?;

    Ok(CachedToken {
        value: token.access_token,
        expires_at: now + token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS),
    })
}
