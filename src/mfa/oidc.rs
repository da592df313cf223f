//! Single sign-on through an OpenID Connect provider.
//!
//! Authorization-code flow with the callback landing on the same
//! `/authorise/oidc/` path the prompt was served from. Instead of local
//! token validation the identity is confirmed against the provider's
//! `userinfo` endpoint, which keeps the contract at HTTP + JSON.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use crate::session::AuthError;
use crate::store::{Device, Store, User};

use super::PromptOutcome;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OidcSettings {
    /// Issuer base URL; discovery is `<issuer>/.well-known/openid-configuration`.
    pub issuer: String,
    pub client_id: String,
    pub client_secret: SecretString,
    /// Claim compared against the gateway username.
    pub username_claim: String,
    /// Where the provider redirects back to, as the peer reaches it.
    pub redirect_url: String,
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            client_id: String::new(),
            client_secret: SecretString::default(),
            username_claim: "preferred_username".to_string(),
            redirect_url: String::new(),
        }
    }
}

impl std::fmt::Debug for Oidc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oidc").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Endpoints {
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Default)]
pub struct Oidc {
    settings: RwLock<Option<OidcSettings>>,
    endpoints: RwLock<Option<Endpoints>>,
    /// state parameter -> username that requested it.
    pending: Mutex<HashMap<String, String>>,
}

fn validation(err: impl std::fmt::Display) -> AuthError {
    AuthError::Validation(anyhow!("{err}"))
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(crate::APP_USER_AGENT)
        .timeout(Duration::from_secs(2))
        .build()
        .context("building oidc client")
}

fn random_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Oidc {
    /// Fetch the provider's discovery document.
    ///
    /// # Errors
    /// Returns an error when the method is unconfigured or discovery
    /// fails; the registry leaves the method disabled in that case.
    pub async fn init(&self, store: &Store) -> Result<()> {
        let settings: OidcSettings = store
            .method_settings("oidc")
            .await?
            .ok_or_else(|| anyhow!("oidc is not configured"))?;

        if settings.issuer.is_empty() || settings.client_id.is_empty() {
            return Err(anyhow!("oidc needs issuer and client_id"));
        }

        let discovery = format!(
            "{}/.well-known/openid-configuration",
            settings.issuer.trim_end_matches('/')
        );
        let endpoints: Endpoints = http_client()?
            .get(&discovery)
            .send()
            .await
            .context("fetching oidc discovery document")?
            .error_for_status()
            .context("oidc discovery document")?
            .json()
            .await
            .context("decoding oidc discovery document")?;

        *self.endpoints.write().await = Some(endpoints);
        *self.settings.write().await = Some(settings);
        Ok(())
    }

    async fn config(&self) -> Result<(OidcSettings, Endpoints), AuthError> {
        let settings = self
            .settings
            .read()
            .await
            .clone()
            .ok_or_else(|| validation("oidc is not initialised"))?;
        let endpoints = self
            .endpoints
            .read()
            .await
            .clone()
            .ok_or_else(|| validation("oidc is not initialised"))?;
        Ok((settings, endpoints))
    }

    /// Serve the redirect, or complete the flow when the provider has
    /// called back with `code` and `state`.
    ///
    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn prompt(
        &self,
        _store: &Store,
        user: &User,
        _device: &Device,
        query: &HashMap<String, String>,
    ) -> Result<PromptOutcome, AuthError> {
        if let (Some(code), Some(state)) = (query.get("code"), query.get("state")) {
            let claims = self.exchange_claims(user, code, state).await?;
            self.check_identity(user, &claims).await?;
            return Ok(PromptOutcome::Authorized);
        }

        let (settings, endpoints) = self.config().await?;

        let state = random_state();
        self.pending
            .lock()
            .await
            .insert(state.clone(), user.username.clone());

        let url = format!(
            "{}?response_type=code&scope=openid%20profile&client_id={}&state={}&redirect_uri={}",
            endpoints.authorization_endpoint, settings.client_id, state, settings.redirect_url,
        );

        Ok(PromptOutcome::Ui(json!({ "type": "oidc", "url": url })))
    }

    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn authorize(&self, user: &User, body: &Value) -> Result<(), AuthError> {
        let code = body
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| validation("missing code"))?;
        let state = body
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| validation("missing state"))?;

        let claims = self.exchange_claims(user, code, state).await?;
        self.check_identity(user, &claims).await
    }

    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn registration_prompt(
        &self,
        user: &User,
        _device: &Device,
    ) -> Result<Value, AuthError> {
        let (settings, endpoints) = self.config().await?;

        let state = random_state();
        self.pending
            .lock()
            .await
            .insert(state.clone(), user.username.clone());

        let url = format!(
            "{}?response_type=code&scope=openid%20profile&client_id={}&state={}&redirect_uri={}",
            endpoints.authorization_endpoint, settings.client_id, state, settings.redirect_url,
        );
        Ok(json!({ "type": "oidc", "url": url }))
    }

    /// Registration is the first completed round trip; the pinned subject
    /// becomes the secret blob.
    ///
    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn register(
        &self,
        _store: &Store,
        user: &User,
        body: &Value,
    ) -> Result<String, AuthError> {
        let code = body
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| validation("missing code"))?;
        let state = body
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| validation("missing state"))?;

        let claims = self.exchange_claims(user, code, state).await?;
        self.check_identity(user, &claims).await?;

        claims
            .get("sub")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| validation("provider returned no subject"))
    }

    /// Redeem the authorization code and read the identity from
    /// `userinfo`.
    async fn exchange_claims(
        &self,
        user: &User,
        code: &str,
        state: &str,
    ) -> Result<Value, AuthError> {
        {
            let mut pending = self.pending.lock().await;
            match pending.remove(state) {
                Some(owner) if owner == user.username => {}
                _ => return Err(validation("login state is not valid")),
            }
        }

        let (settings, endpoints) = self.config().await?;
        let client = http_client().map_err(AuthError::Validation)?;

        let token: TokenResponse = client
            .post(&endpoints.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", settings.client_id.as_str()),
                ("client_secret", settings.client_secret.expose_secret().as_str()),
                ("redirect_uri", settings.redirect_url.as_str()),
            ])
            .send()
            .await
            .map_err(validation)?
            .error_for_status()
            .map_err(validation)?
            .json()
            .await
            .map_err(validation)?;

        client
            .get(&endpoints.userinfo_endpoint)
            .bearer_auth(token.access_token)
            .send()
            .await
            .map_err(validation)?
            .error_for_status()
            .map_err(validation)?
            .json()
            .await
            .map_err(validation)
    }

    async fn check_identity(&self, user: &User, claims: &Value) -> Result<(), AuthError> {
        let (settings, _) = self.config().await?;

        let value = claims
            .get(&settings.username_claim)
            .and_then(Value::as_str)
            .ok_or_else(|| validation("provider returned no usable identity claim"))?;

        if value != user.username {
            return Err(validation("identity claim does not match this device's user"));
        }

        // A registered user is additionally pinned to the provider
        // subject captured at registration.
        if user.mfa_method == "oidc" && !user.mfa_secret.is_empty() {
            let subject = claims.get("sub").and_then(Value::as_str).unwrap_or_default();
            if subject != user.mfa_secret {
                return Err(validation("subject does not match the registered identity"));
            }
        }

        Ok(())
    }
}
