//! Security keys and passkeys.
//!
//! The ceremony state between start and finish lives in memory on the
//! node that issued the challenge; the finished credential list is the
//! user's replicated secret blob.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webauthn_rs::prelude::{
    Passkey, PasskeyAuthentication, PasskeyRegistration, PublicKeyCredential,
    RegisterPublicKeyCredential, Url, Webauthn, WebauthnBuilder,
};

use crate::session::AuthError;
use crate::store::{Store, User};

use super::PromptOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebauthnSettings {
    /// Relying-party id, normally the gateway's public hostname.
    pub rp_id: String,
    /// Origin the browser reports, e.g. `https://vpn.example.org`.
    pub origin: String,
    pub display_name: String,
}

impl Default for WebauthnSettings {
    fn default() -> Self {
        Self {
            rp_id: String::new(),
            origin: String::new(),
            display_name: "Pordisto VPN".to_string(),
        }
    }
}

#[derive(Default)]
pub struct WebauthnMethod {
    webauthn: RwLock<Option<Arc<Webauthn>>>,
    registrations: Mutex<HashMap<String, PasskeyRegistration>>,
    authentications: Mutex<HashMap<String, PasskeyAuthentication>>,
}

fn validation(err: impl std::fmt::Display) -> AuthError {
    AuthError::Validation(anyhow!("{err}"))
}

impl WebauthnMethod {
    /// Build the relying party from the replicated settings.
    ///
    /// # Errors
    /// Returns an error when the method is unconfigured or the origin does
    /// not parse; the registry leaves the method disabled in that case.
    pub async fn init(&self, store: &Store) -> Result<()> {
        let settings: WebauthnSettings = store
            .method_settings("webauthn")
            .await?
            .ok_or_else(|| anyhow!("webauthn is not configured"))?;

        if settings.rp_id.is_empty() || settings.origin.is_empty() {
            return Err(anyhow!("webauthn needs rp_id and origin"));
        }

        let origin = Url::parse(&settings.origin).context("parsing webauthn origin")?;
        let webauthn = WebauthnBuilder::new(&settings.rp_id, &origin)
            .context("building webauthn relying party")?
            .rp_name(&settings.display_name)
            .build()
            .context("building webauthn relying party")?;

        *self.webauthn.write().await = Some(Arc::new(webauthn));
        Ok(())
    }

    async fn relying_party(&self) -> Result<Arc<Webauthn>, AuthError> {
        self.webauthn
            .read()
            .await
            .clone()
            .ok_or_else(|| validation("webauthn is not initialised"))
    }

    fn credentials(user: &User) -> Result<Vec<Passkey>, AuthError> {
        if user.mfa_method != "webauthn" || user.mfa_secret.is_empty() {
            return Err(validation("webauthn is not this user's registered method"));
        }
        serde_json::from_str(&user.mfa_secret).map_err(validation)
    }

    /// Issue an authentication challenge over the user's registered
    /// credentials.
    ///
    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn prompt(&self, user: &User) -> Result<PromptOutcome, AuthError> {
        let webauthn = self.relying_party().await?;
        let credentials = Self::credentials(user)?;

        let (challenge, state) = webauthn
            .start_passkey_authentication(&credentials)
            .map_err(validation)?;

        self.authentications
            .lock()
            .await
            .insert(user.username.clone(), state);

        Ok(PromptOutcome::Ui(json!({
            "type": "webauthn",
            "challenge": serde_json::to_value(challenge).map_err(validation)?,
        })))
    }

    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn authorize(&self, user: &User, body: &Value) -> Result<(), AuthError> {
        let webauthn = self.relying_party().await?;

        let credential: PublicKeyCredential =
            serde_json::from_value(body.clone()).map_err(validation)?;

        let state = self
            .authentications
            .lock()
            .await
            .remove(&user.username)
            .ok_or_else(|| validation("no authentication in progress"))?;

        webauthn
            .finish_passkey_authentication(&credential, &state)
            .map_err(validation)?;

        Ok(())
    }

    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn registration_prompt(&self, user: &User) -> Result<Value, AuthError> {
        let webauthn = self.relying_party().await?;

        let (challenge, state) = webauthn
            .start_passkey_registration(
                Uuid::new_v4(),
                &user.username,
                &user.username,
                None,
            )
            .map_err(validation)?;

        self.registrations
            .lock()
            .await
            .insert(user.username.clone(), state);

        Ok(json!({
            "type": "webauthn",
            "challenge": serde_json::to_value(challenge).map_err(validation)?,
        }))
    }

    /// Finish the ceremony; the returned blob is the user's credential
    /// list.
    ///
    /// # Errors
    /// Collapses every failure to a validation error.
    pub async fn register(&self, user: &User, body: &Value) -> Result<String, AuthError> {
        let webauthn = self.relying_party().await?;

        let credential: RegisterPublicKeyCredential =
            serde_json::from_value(body.clone()).map_err(validation)?;

        let state = self
            .registrations
            .lock()
            .await
            .remove(&user.username)
            .ok_or_else(|| validation("no registration in progress"))?;

        let passkey = webauthn
            .finish_passkey_registration(&credential, &state)
            .map_err(validation)?;

        serde_json::to_string(&vec![passkey]).map_err(validation)
    }
}
