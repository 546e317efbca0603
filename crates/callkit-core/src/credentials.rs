//! Join-credential acquisition.
//!
//! A [`CredentialIssuer`] picks one policy per request, in a fixed order:
//! backend fetch, static token, client-side signing, token-less. The policy
//! is re-evaluated on every call; nothing is cached between calls.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::errors::CredentialError;

type HmacSha256 = Hmac<Sha256>;

/// Default credential lifetime (24 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Client-side timeout for the backend credential endpoint.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Version prefix of locally signed credentials.
const SIGNED_VERSION: &str = "007";

/// Random salt length in bytes (hex-encoded to 64 characters).
const SALT_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Subscriber,
}

/// A credential authorizing one participant on one channel.
///
/// `value` is opaque to the controller; it is empty for token-less joins.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinCredential {
    pub value: String,
    pub channel: String,
    pub participant_id: u32,
    pub role: Role,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl JoinCredential {
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Token-less credentials never expire from the caller's point of view.
    pub fn is_expired_at(&self, now: u64) -> bool {
        !self.is_empty() && now >= self.expires_at
    }
}

impl std::fmt::Debug for JoinCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinCredential")
            .field("value", &if self.is_empty() { "<none>" } else { "[REDACTED]" })
            .field("channel", &self.channel)
            .field("participant_id", &self.participant_id)
            .field("role", &self.role)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The acquisition strategy selected for a single request.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialPolicy {
    BackendFetch { url: String },
    StaticToken { value: String },
    ClientSigned { app_id: String, signing_key: String },
    TokenLess,
}

impl std::fmt::Debug for CredentialPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BackendFetch { url } => f.debug_struct("BackendFetch").field("url", url).finish(),
            Self::StaticToken { .. } => f.write_str("StaticToken"),
            Self::ClientSigned { app_id, .. } => {
                f.debug_struct("ClientSigned").field("app_id", app_id).finish()
            }
            Self::TokenLess => f.write_str("TokenLess"),
        }
    }
}

/// Everything the issuer may draw on. Any subset may be configured.
#[derive(Clone, Default)]
pub struct CredentialConfig {
    pub server_url: Option<String>,
    pub static_token: Option<String>,
    /// Channel the static token was minted for, if known.
    pub static_token_channel: Option<String>,
    pub app_id: Option<String>,
    pub signing_key: Option<String>,
    pub http_timeout: Option<Duration>,
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("server_url", &self.server_url)
            .field("static_token", &self.static_token.as_ref().map(|_| "[REDACTED]"))
            .field("static_token_channel", &self.static_token_channel)
            .field("app_id", &self.app_id)
            .field("signing_key", &self.signing_key.as_ref().map(|_| "[REDACTED]"))
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl CredentialConfig {
    /// Select the first applicable policy.
    ///
    /// A configured signing key selects client-side signing; an app id is
    /// then mandatory. Empty strings count as absent except for the key,
    /// where an empty value is a misconfiguration.
    pub fn policy(&self) -> Result<CredentialPolicy, CredentialError> {
        if let Some(url) = non_empty(&self.server_url) {
            return Ok(CredentialPolicy::BackendFetch { url: url.to_string() });
        }
        if let Some(value) = non_empty(&self.static_token) {
            return Ok(CredentialPolicy::StaticToken { value: value.to_string() });
        }
        if let Some(signing_key) = self.signing_key.as_deref() {
            if signing_key.is_empty() {
                return Err(CredentialError::Misconfigured("signing key is empty".into()));
            }
            let app_id = non_empty(&self.app_id)
                .ok_or_else(|| CredentialError::Misconfigured("client signing requires an app id".into()))?;
            return Ok(CredentialPolicy::ClientSigned {
                app_id: app_id.to_string(),
                signing_key: signing_key.to_string(),
            });
        }
        Ok(CredentialPolicy::TokenLess)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    channel_name: &'a str,
    uid: u32,
    role: Role,
    expire_time: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Issues join credentials according to a [`CredentialConfig`].
pub struct CredentialIssuer {
    config: CredentialConfig,
    http: reqwest::Client,
}

impl CredentialIssuer {
    pub fn new(config: CredentialConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub async fn issue_credential(
        &self,
        channel: &str,
        participant_id: u32,
        role: Role,
        ttl: Duration,
    ) -> Result<JoinCredential, CredentialError> {
        self.issue_credential_at(channel, participant_id, role, ttl, unix_now())
            .await
    }

    /// Same as [`issue_credential`](Self::issue_credential) with an explicit clock.
    pub async fn issue_credential_at(
        &self,
        channel: &str,
        participant_id: u32,
        role: Role,
        ttl: Duration,
        now: u64,
    ) -> Result<JoinCredential, CredentialError> {
        let ttl_secs = ttl.as_secs();
        if ttl_secs == 0 {
            return Err(CredentialError::Misconfigured("ttl must be at least one second".into()));
        }
        let expires_at = now
            .checked_add(ttl_secs)
            .ok_or_else(|| CredentialError::Misconfigured("ttl too large".into()))?;

        let policy = self.config.policy()?;
        tracing::debug!(channel, uid = participant_id, ?role, ?policy, "issuing credential");

        let value = match policy {
            CredentialPolicy::BackendFetch { url } => {
                self.fetch_from_backend(&url, channel, participant_id, role, ttl_secs)
                    .await?
            }
            CredentialPolicy::StaticToken { value } => {
                if let Some(pinned) = non_empty(&self.config.static_token_channel) {
                    if pinned != channel {
                        tracing::warn!(
                            channel,
                            pinned,
                            "static token was minted for another channel; returning it unchanged"
                        );
                    }
                }
                value
            }
            CredentialPolicy::ClientSigned { app_id, signing_key } => {
                sign_credential(&app_id, &signing_key, channel, participant_id, role, expires_at)?.value
            }
            CredentialPolicy::TokenLess => String::new(),
        };

        Ok(JoinCredential {
            value,
            channel: channel.to_string(),
            participant_id,
            role,
            issued_at: now,
            expires_at,
        })
    }

    async fn fetch_from_backend(
        &self,
        url: &str,
        channel: &str,
        participant_id: u32,
        role: Role,
        ttl_secs: u64,
    ) -> Result<String, CredentialError> {
        tracing::info!(channel, uid = participant_id, "requesting credential from backend: {url}");

        let timeout = self.config.http_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT);
        let resp = self
            .http
            .post(url)
            .timeout(timeout)
            .json(&TokenRequest {
                channel_name: channel,
                uid: participant_id,
                role,
                expire_time: ttl_secs,
            })
            .send()
            .await
            .map_err(|e| network_failure(e, timeout))?;

        if !resp.status().is_success() {
            return Err(CredentialError::ServerRejected(format!(
                "backend returned status {}",
                resp.status()
            )));
        }

        // The timeout also covers reading the body.
        let data: TokenResponse = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                network_failure(e, timeout)
            } else {
                CredentialError::ServerRejected(format!("invalid backend response: {e}"))
            }
        })?;

        if data.token.is_empty() {
            return Err(CredentialError::ServerRejected("backend returned an empty token".into()));
        }
        Ok(data.token)
    }
}

fn network_failure(e: reqwest::Error, timeout: Duration) -> CredentialError {
    if e.is_timeout() {
        CredentialError::NetworkFailure(format!("timed out after {}s", timeout.as_secs()))
    } else {
        CredentialError::NetworkFailure(e.to_string())
    }
}

/// Output of local signing, with the intermediate parts exposed for verification.
#[derive(Debug, Clone)]
pub struct SignedCredential {
    pub message: String,
    pub signature: String,
    pub salt: String,
    pub value: String,
}

/// Per-privilege expiry timestamps: publish audio, publish video,
/// subscribe audio, subscribe video.
pub fn privilege_expiries(role: Role, expires_at: u64) -> [u64; 4] {
    let publish = match role {
        Role::Publisher => expires_at,
        Role::Subscriber => 0,
    };
    [publish, publish, expires_at, expires_at]
}

/// The colon-joined string covered by the signature.
pub fn signing_message(app_id: &str, channel: &str, participant_id: u32, privileges: [u64; 4]) -> String {
    let [pub_audio, pub_video, sub_audio, sub_video] = privileges;
    format!("{app_id}:{channel}:{participant_id}:{pub_audio}:{pub_video}:{sub_audio}:{sub_video}")
}

/// Hex-encoded HMAC-SHA256 of `message` under `key`.
pub fn sign_message(key: &str, message: &str) -> Result<String, CredentialError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| CredentialError::Misconfigured(format!("unusable signing key: {e}")))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Sign a credential locally, valid until `expires_at` (Unix seconds).
pub fn sign_credential(
    app_id: &str,
    signing_key: &str,
    channel: &str,
    participant_id: u32,
    role: Role,
    expires_at: u64,
) -> Result<SignedCredential, CredentialError> {
    let privileges = privilege_expiries(role, expires_at);
    let message = signing_message(app_id, channel, participant_id, privileges);
    let signature = sign_message(signing_key, &message)?;

    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let salt = hex::encode(salt);

    let [pub_audio, pub_video, sub_audio, sub_video] = privileges;
    let payload = format!(
        "{SIGNED_VERSION}:{app_id}:{channel}:{participant_id}:{salt}:{pub_audio}:{pub_video}:{sub_audio}:{sub_video}:{signature}"
    );

    Ok(SignedCredential {
        message,
        signature,
        salt,
        value: BASE64.encode(payload.as_bytes()),
    })
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
