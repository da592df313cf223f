//! Time-based one-time codes.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::session::AuthError;
use crate::store::{Store, User};

use super::PromptOutcome;

const STEP_SECONDS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TotpSettings {
    /// Issuer shown in authenticator apps.
    pub issuer: String,
}

impl Default for TotpSettings {
    fn default() -> Self {
        Self {
            issuer: "pordisto".to_string(),
        }
    }
}

pub struct Totp {
    settings: RwLock<TotpSettings>,
    /// Secrets generated but not yet confirmed with a first code.
    pending: Mutex<HashMap<String, String>>,
    /// Last accepted time step per user; a code is valid once.
    last_step: Mutex<HashMap<String, u64>>,
}

impl Default for Totp {
    fn default() -> Self {
        Self {
            settings: RwLock::new(TotpSettings::default()),
            pending: Mutex::new(HashMap::new()),
            last_step: Mutex::new(HashMap::new()),
        }
    }
}

fn validation(err: impl std::fmt::Display) -> AuthError {
    AuthError::Validation(anyhow!("{err}"))
}

fn code_from(body: &Value) -> Result<&str, AuthError> {
    body.get("code")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .ok_or_else(|| validation("missing code"))
}

fn current_step() -> Result<u64, AuthError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|now| now.as_secs() / STEP_SECONDS)
        .map_err(validation)
}

impl Totp {
    /// # Errors
    /// Returns an error when the replicated settings cannot be read.
    pub async fn init(&self, store: &Store) -> Result<()> {
        if let Some(settings) = store.method_settings::<TotpSettings>("totp").await? {
            *self.settings.write().await = settings;
        }
        Ok(())
    }

    fn instance(&self, issuer: String, account: &str, encoded: &str) -> Result<TOTP, AuthError> {
        let secret = Secret::Encoded(encoded.to_string())
            .to_bytes()
            .map_err(validation)?;

        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            STEP_SECONDS,
            secret,
            Some(issuer),
            account.to_string(),
        )
        .map_err(validation)
    }

    pub async fn prompt(&self, _user: &User) -> Result<PromptOutcome, AuthError> {
        Ok(PromptOutcome::Ui(json!({ "type": "totp" })))
    }

    /// Check a code against the stored secret, one step either side, each
    /// step accepted at most once.
    ///
    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn authorize(&self, user: &User, body: &Value) -> Result<(), AuthError> {
        if user.mfa_method != "totp" {
            return Err(validation("totp is not this user's registered method"));
        }

        let code = code_from(body)?;
        let issuer = self.settings.read().await.issuer.clone();
        let totp = self.instance(issuer, &user.username, &user.mfa_secret)?;

        if !totp.check_current(code).map_err(validation)? {
            return Err(validation("incorrect code"));
        }

        let step = current_step()?;
        let mut last = self.last_step.lock().await;
        if last.get(&user.username).copied() == Some(step) {
            return Err(validation("code already used"));
        }
        last.insert(user.username.clone(), step);

        Ok(())
    }

    /// Mint a fresh secret and hand back the provisioning URL and QR so
    /// the UI can show it; the secret is pending until a first code
    /// confirms the enrollment.
    ///
    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn registration_prompt(&self, user: &User) -> Result<Value, AuthError> {
        let secret_bytes = Secret::generate_secret().to_bytes().map_err(validation)?;

        let issuer = self.settings.read().await.issuer.clone();
        let totp = TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            STEP_SECONDS,
            secret_bytes,
            Some(issuer),
            user.username.clone(),
        )
        .map_err(validation)?;

        let encoded = totp.get_secret_base32();
        self.pending
            .lock()
            .await
            .insert(user.username.clone(), encoded.clone());

        let qr = totp.get_qr_base64().map_err(validation)?;
        Ok(json!({
            "type": "totp",
            "secret": encoded,
            "url": totp.get_url(),
            "qr": format!("data:image/png;base64,{qr}"),
        }))
    }

    /// Confirm the pending secret with a first code; returns the secret
    /// blob to persist.
    ///
    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn register(&self, user: &User, body: &Value) -> Result<String, AuthError> {
        let code = code_from(body)?;

        let encoded = self
            .pending
            .lock()
            .await
            .get(&user.username)
            .cloned()
            .ok_or_else(|| validation("no registration in progress"))?;

        let issuer = self.settings.read().await.issuer.clone();
        let totp = self.instance(issuer, &user.username, &encoded)?;

        if !totp.check_current(code).map_err(validation)? {
            return Err(validation("incorrect code"));
        }

        self.pending.lock().await.remove(&user.username);
        self.last_step
            .lock()
            .await
            .insert(user.username.clone(), current_step()?);

        Ok(encoded)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn user_with_secret(secret: &str) -> User {
        User {
            username: "alice".to_string(),
            mfa_method: "totp".to_string(),
            mfa_secret: secret.to_string(),
            ..User::default()
        }
    }

    #[tokio::test]
    async fn register_then_authorize_roundtrip() {
        let method = Totp::default();
        let mut user = user_with_secret("");
        user.mfa_method = String::new();

        let prompt = method.registration_prompt(&user).await.unwrap();
        let encoded = prompt["secret"].as_str().unwrap().to_string();
        assert!(prompt["url"].as_str().unwrap().starts_with("otpauth://"));

        // Compute the current valid code the way an authenticator would.
        let totp = method
            .instance("pordisto".to_string(), "alice", &encoded)
            .unwrap();
        let code = totp.generate_current().unwrap();

        let secret = method
            .register(&user, &json!({ "code": code }))
            .await
            .unwrap();
        assert_eq!(secret, encoded);
    }

    #[tokio::test]
    async fn replayed_codes_are_rejected() {
        let method = Totp::default();

        let secret_bytes = Secret::generate_secret().to_bytes().unwrap();
        let totp = TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            STEP_SECONDS,
            secret_bytes,
            Some("pordisto".to_string()),
            "alice".to_string(),
        )
        .unwrap();
        let user = user_with_secret(&totp.get_secret_base32());
        let code = totp.generate_current().unwrap();

        method
            .authorize(&user, &json!({ "code": code }))
            .await
            .unwrap();
        let replay = method.authorize(&user, &json!({ "code": code })).await;
        assert!(replay.is_err());
    }

    #[tokio::test]
    async fn wrong_method_is_rejected() {
        let method = Totp::default();
        let mut user = user_with_secret("whatever");
        user.mfa_method = "webauthn".to_string();

        assert!(method
            .authorize(&user, &json!({ "code": "123456" }))
            .await
            .is_err());
    }
}
