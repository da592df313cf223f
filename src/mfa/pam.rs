//! Host account passwords.
//!
//! Verification is delegated to the host's setuid checker helper (the
//! same one PAM's own modules use), so the daemon never links libpam and
//! never reads the shadow file itself. The helper path is replicated with
//! the method settings.

use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::session::AuthError;
use crate::store::{Store, User};

use super::PromptOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PamSettings {
    /// Password-checking helper invoked as `<helper> <user> nullok`.
    pub helper_path: String,
}

impl Default for PamSettings {
    fn default() -> Self {
        Self {
            helper_path: "/sbin/unix_chkpwd".to_string(),
        }
    }
}

pub struct Pam {
    settings: RwLock<PamSettings>,
}

impl Default for Pam {
    fn default() -> Self {
        Self {
            settings: RwLock::new(PamSettings::default()),
        }
    }
}

fn validation(err: impl std::fmt::Display) -> AuthError {
    AuthError::Validation(anyhow!("{err}"))
}

fn password_from(body: &Value) -> Result<&str, AuthError> {
    body.get("password")
        .and_then(Value::as_str)
        .filter(|password| !password.is_empty())
        .ok_or_else(|| validation("missing password"))
}

async fn check_password(helper: &str, username: &str, password: &str) -> Result<bool> {
    let mut child = Command::new(helper)
        .arg(username)
        .arg("nullok")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawning password helper {helper}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        // The helper reads a NUL-terminated password from stdin.
        stdin
            .write_all(password.as_bytes())
            .await
            .context("writing to password helper")?;
        stdin
            .write_all(b"\0")
            .await
            .context("writing to password helper")?;
    }

    let status = child.wait().await.context("waiting for password helper")?;
    Ok(status.success())
}

impl Pam {
    /// # Errors
    /// Returns an error when the replicated settings cannot be read.
    pub async fn init(&self, store: &Store) -> Result<()> {
        if let Some(settings) = store.method_settings::<PamSettings>("pam").await? {
            *self.settings.write().await = settings;
        }
        Ok(())
    }

    pub async fn prompt(&self, _user: &User) -> Result<PromptOutcome, AuthError> {
        Ok(PromptOutcome::Ui(json!({ "type": "pam" })))
    }

    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn authorize(
        &self,
        _store: &Store,
        user: &User,
        body: &Value,
    ) -> Result<(), AuthError> {
        if user.mfa_method != "pam" {
            return Err(validation("pam is not this user's registered method"));
        }

        let password = password_from(body)?;
        let helper = self.settings.read().await.helper_path.clone();

        match check_password(&helper, &user.username, password).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(validation("incorrect password")),
            Err(err) => Err(AuthError::Validation(err)),
        }
    }

    pub async fn registration_prompt(&self, _user: &User) -> Result<Value, AuthError> {
        Ok(json!({ "type": "pam" }))
    }

    /// Registration is a first successful password check; there is no
    /// per-user secret to mint, so the blob is a marker.
    ///
    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn register(
        &self,
        _store: &Store,
        user: &User,
        body: &Value,
    ) -> Result<String, AuthError> {
        let password = password_from(body)?;
        let helper = self.settings.read().await.helper_path.clone();

        match check_password(&helper, &user.username, password).await {
            Ok(true) => Ok("pam".to_string()),
            Ok(false) => Err(validation("incorrect password")),
            Err(err) => Err(AuthError::Validation(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_helper_is_an_error_not_a_pass() {
        let got = check_password("/nonexistent/helper", "alice", "pw").await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn body_without_password_is_rejected() {
        assert!(password_from(&json!({})).is_err());
        assert!(password_from(&json!({ "password": "" })).is_err());
        assert_eq!(password_from(&json!({ "password": "pw" })).ok(), Some("pw"));
    }
}
