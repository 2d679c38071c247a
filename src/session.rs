//! OAuth2 session shared across transfer workers.
//!
//! One [`Session`] backs every request of a container handle.  Workers call
//! [`Session::fresh_token`] before each attempt: inside the 10-minute grace
//! window the current bearer is returned from a read lock; once the window
//! is entered, refreshers coalesce on a gate mutex so exactly one POST hits
//! the token endpoint while the rest wait and re-check.  Refreshes only
//! ever widen the expiry.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::errors::{AzError, Result};
use crate::rest::RestClient;
use crate::retry::with_retry;

/// Seconds before expiry at which a token counts as stale.
pub const EXPIRY_GRACE_SECONDS: u64 = 600;

/// Capacity reserved for bearer tokens; service tokens can be large.
pub(crate) const TOKEN_BUFFER_CAPACITY: usize = 16_000;

const TOKEN_ENDPOINT_BASE: &str = "https://login.microsoft.com";

/// Form-body encode set matching what libcurl escapes: everything except
/// unreserved characters.
const FORM_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// How the session can mint a new bearer token.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Confidential-client flow: the client secret buys new tokens.
    ClientCredentials { client_secret: String },
    /// Auth-code or device-code flow: the rotating refresh token held in
    /// session state buys new tokens.
    AuthorizationCode,
    /// Externally managed token (e.g. managed identity); this client cannot
    /// refresh it.
    ManagedIdentity,
}

/// Initial session contents handed over by the authentication library.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tenant: String,
    pub client_id: String,
    pub scope: String,
    pub resource: String,
    pub credential: Credential,
    /// Bearer token acquired by the initial flow.
    pub bearer: String,
    /// Refresh token, for flows that issue one.
    pub refresh_token: Option<String>,
    /// Unix seconds at which `bearer` expires.
    pub expiry_unix_seconds: u64,
}

#[derive(Debug, Clone)]
struct SessionState {
    bearer: String,
    refresh_token: Option<String>,
    expiry: u64,
    credential: Credential,
}

/// Shared refreshable credential holder.  Cloning is cheap and clones share
/// state, so a refresh performed by one worker is visible to all.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    tenant: String,
    client_id: String,
    scope: String,
    resource: String,
    state: RwLock<SessionState>,
    refresh_gate: Mutex<()>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let mut bearer = String::with_capacity(TOKEN_BUFFER_CAPACITY.max(config.bearer.len()));
        bearer.push_str(&config.bearer);
        Session {
            inner: Arc::new(SessionInner {
                tenant: config.tenant,
                client_id: config.client_id,
                scope: config.scope,
                resource: config.resource,
                state: RwLock::new(SessionState {
                    bearer,
                    refresh_token: config.refresh_token,
                    expiry: config.expiry_unix_seconds,
                    credential: config.credential,
                }),
                refresh_gate: Mutex::new(()),
            }),
        }
    }

    /// Current bearer token, without freshness checks.
    pub async fn bearer(&self) -> String {
        self.inner.state.read().await.bearer.clone()
    }

    /// Current expiry in Unix seconds.
    pub async fn expiry(&self) -> u64 {
        self.inner.state.read().await.expiry
    }

    /// Force the expiry to `expiry_unix_seconds`.  Intended for embedders
    /// that learn about revocation out of band.
    pub async fn set_expiry(&self, expiry_unix_seconds: u64) {
        self.inner.state.write().await.expiry = expiry_unix_seconds;
    }

    /// Zero the credentials held by this session in place.
    pub async fn scrub(&self) {
        let mut state = self.inner.state.write().await;
        scrub_string(&mut state.bearer);
        if let Some(refresh_token) = state.refresh_token.as_mut() {
            scrub_string(refresh_token);
        }
        state.refresh_token = None;
        if let Credential::ClientCredentials { client_secret } = &mut state.credential {
            scrub_string(client_secret);
        }
        state.expiry = 0;
    }

    /// Return a bearer token valid for at least the grace window, refreshing
    /// it through `rest` when necessary.
    pub(crate) async fn fresh_token(&self, rest: &RestClient, n_retries: u32) -> Result<String> {
        let now = unix_now();
        {
            let state = self.inner.state.read().await;
            if within_grace(now, state.expiry) {
                return Ok(state.bearer.clone());
            }
        }

        let _gate = self.inner.refresh_gate.lock().await;

        // Another worker may have completed the refresh while we queued.
        let now = unix_now();
        {
            let state = self.inner.state.read().await;
            if within_grace(now, state.expiry) {
                return Ok(state.bearer.clone());
            }
        }

        self.refresh(rest, n_retries).await
    }

    /// POST the token endpoint and write the new token back.  Callers must
    /// hold the refresh gate; the state lock is never held across the
    /// request itself.
    async fn refresh(&self, rest: &RestClient, n_retries: u32) -> Result<String> {
        let snapshot = self.inner.state.read().await.clone();
        let body = refresh_request_body(
            &self.inner.client_id,
            &self.inner.scope,
            &self.inner.resource,
            &snapshot,
        )?;
        let url = format!("{TOKEN_ENDPOINT_BASE}/{}/oauth2/token", self.inner.tenant);
        let resource = format!("login.microsoft.com/{}", self.inner.tenant);

        let response = with_retry("token refresh", &resource, n_retries, || {
            let body = body.clone();
            let url = &url;
            async move { rest.form_post(url, body).await }
        })
        .await
        .map_err(|err| match err {
            AzError::Service { status, code, .. } => AzError::Auth {
                status,
                detail: code.unwrap_or_default(),
            },
            other => other,
        })?;

        let parsed: TokenResponse =
            serde_json::from_slice(&response.body).map_err(|e| AzError::InvalidResponse {
                operation: "token refresh",
                detail: e.to_string(),
            })?;

        let mut state = self.inner.state.write().await;
        apply_token_response(&mut state, parsed);
        info!(expiry = state.expiry, "bearer token refreshed");
        Ok(state.bearer.clone())
    }
}

fn within_grace(now: u64, expiry: u64) -> bool {
    now < expiry.saturating_sub(EXPIRY_GRACE_SECONDS)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn scrub_string(value: &mut String) {
    let zeros = "\0".repeat(value.len());
    value.replace_range(.., &zeros);
    value.clear();
}

/// Build the token-endpoint form body for the credential at hand.  A refresh
/// token always wins; the client-credentials grant escapes the secret and
/// resource the way libcurl would.
fn refresh_request_body(
    client_id: &str,
    scope: &str,
    resource: &str,
    state: &SessionState,
) -> Result<String> {
    match (&state.refresh_token, &state.credential) {
        (Some(refresh_token), _) => Ok(format!(
            "client_id={client_id}&refresh_token={refresh_token}&grant_type=refresh_token&scope={scope}&resource={resource}"
        )),
        (None, Credential::ClientCredentials { client_secret }) => Ok(format!(
            "grant_type=client_credentials&client_id={client_id}&client_secret={}&resource={}",
            utf8_percent_encode(client_secret, FORM_ENCODE_SET),
            utf8_percent_encode(resource, FORM_ENCODE_SET),
        )),
        (None, _) => Err(AzError::NoRefreshableCredential),
    }
}

/// Fold a token-endpoint response into session state.  The refresh token
/// rotates when a new one is issued and the expiry never moves backwards.
fn apply_token_response(state: &mut SessionState, response: TokenResponse) {
    let mut bearer =
        String::with_capacity(TOKEN_BUFFER_CAPACITY.max(response.access_token.len()));
    bearer.push_str(&response.access_token);
    state.bearer = bearer;
    if let Some(refresh_token) = response.refresh_token {
        state.refresh_token = Some(refresh_token);
    }
    state.expiry = state.expiry.max(response.expires_on);
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(deserialize_with = "deserialize_unix_seconds")]
    expires_on: u64,
}

/// The v1 token endpoint returns `expires_on` as a string of Unix seconds;
/// accept a bare number as well.
fn deserialize_unix_seconds<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(value) => value.trim().parse::<u64>().map_err(serde::de::Error::custom),
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn state(
        refresh_token: Option<&str>,
        credential: Credential,
    ) -> SessionState {
        SessionState {
            bearer: "tok".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expiry: 1_700_000_000,
            credential,
        }
    }

    #[test]
    fn test_refresh_token_grant_body() {
        let body = refresh_request_body(
            "client-1",
            "offline_access",
            "https://storage.azure.com",
            &state(Some("rt-xyz"), Credential::AuthorizationCode),
        )
        .unwrap();
        assert_eq!(
            body,
            "client_id=client-1&refresh_token=rt-xyz&grant_type=refresh_token\
             &scope=offline_access&resource=https://storage.azure.com"
        );
    }

    #[test]
    fn test_client_credentials_grant_body_escapes() {
        let body = refresh_request_body(
            "client-1",
            "",
            "https://storage.azure.com",
            &state(
                None,
                Credential::ClientCredentials {
                    client_secret: "s3cr=t&plus".to_string(),
                },
            ),
        )
        .unwrap();
        assert!(body.starts_with("grant_type=client_credentials&client_id=client-1"));
        assert!(body.contains("client_secret=s3cr%3Dt%26plus"));
        assert!(body.contains("resource=https%3A%2F%2Fstorage.azure.com"));
    }

    #[test]
    fn test_refresh_token_wins_over_secret() {
        let body = refresh_request_body(
            "c",
            "s",
            "r",
            &state(
                Some("rt"),
                Credential::ClientCredentials {
                    client_secret: "secret".to_string(),
                },
            ),
        )
        .unwrap();
        assert!(body.contains("grant_type=refresh_token"));
    }

    #[test]
    fn test_no_refreshable_credential() {
        let outcome = refresh_request_body("c", "s", "r", &state(None, Credential::ManagedIdentity));
        assert!(matches!(outcome, Err(AzError::NoRefreshableCredential)));
    }

    #[test]
    fn test_token_response_expiry_as_string() {
        let parsed: TokenResponse = serde_json::from_str(
            r#"{"access_token":"abc","refresh_token":"def","expires_on":"1700000123"}"#,
        )
        .unwrap();
        assert_eq!(parsed.expires_on, 1_700_000_123);
        assert_eq!(parsed.refresh_token.as_deref(), Some("def"));
    }

    #[test]
    fn test_token_response_expiry_as_number() {
        let parsed: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","expires_on":1700000123}"#).unwrap();
        assert_eq!(parsed.expires_on, 1_700_000_123);
        assert_eq!(parsed.refresh_token, None);
    }

    #[test]
    fn test_apply_rotates_refresh_token_and_widens_expiry() {
        let mut current = state(Some("old-rt"), Credential::AuthorizationCode);
        apply_token_response(
            &mut current,
            TokenResponse {
                access_token: "new-bearer".to_string(),
                refresh_token: Some("new-rt".to_string()),
                expires_on: 1_800_000_000,
            },
        );
        assert_eq!(current.bearer, "new-bearer");
        assert_eq!(current.refresh_token.as_deref(), Some("new-rt"));
        assert_eq!(current.expiry, 1_800_000_000);
    }

    #[test]
    fn test_apply_never_shortens_expiry() {
        let mut current = state(None, Credential::AuthorizationCode);
        let before = current.expiry;
        apply_token_response(
            &mut current,
            TokenResponse {
                access_token: "b".to_string(),
                refresh_token: None,
                expires_on: before - 100,
            },
        );
        assert_eq!(current.expiry, before);
    }

    #[test]
    fn test_grace_window() {
        assert!(within_grace(1000, 1000 + EXPIRY_GRACE_SECONDS + 1));
        assert!(!within_grace(1000, 1000 + EXPIRY_GRACE_SECONDS));
        assert!(!within_grace(1000, 1000));
        // Saturating: an expiry inside the first grace window never underflows.
        assert!(!within_grace(0, 100));
    }

    #[tokio::test]
    async fn test_scrub_clears_credentials() {
        let session = Session::new(SessionConfig {
            tenant: "t".to_string(),
            client_id: "c".to_string(),
            scope: "s".to_string(),
            resource: "r".to_string(),
            credential: Credential::ClientCredentials {
                client_secret: "secret".to_string(),
            },
            bearer: "bearer".to_string(),
            refresh_token: Some("rt".to_string()),
            expiry_unix_seconds: u64::MAX,
        });
        session.scrub().await;
        assert!(session.bearer().await.is_empty());
        assert_eq!(session.expiry().await, 0);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let session = Session::new(SessionConfig {
            tenant: "t".to_string(),
            client_id: "c".to_string(),
            scope: "s".to_string(),
            resource: "r".to_string(),
            credential: Credential::ManagedIdentity,
            bearer: "bearer".to_string(),
            refresh_token: None,
            expiry_unix_seconds: 500,
        });
        let clone = session.clone();
        session.set_expiry(12_345).await;
        assert_eq!(clone.expiry().await, 12_345);
    }
}
