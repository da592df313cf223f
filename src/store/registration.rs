//! Registration tokens.
//!
//! A token binds a pending username, optional group overrides, and an
//! optional overwrite target; each redemption burns one use and the record
//! disappears with the last one.

use anyhow::{anyhow, bail, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{Store, TOKENS_PREFIX};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub username: String,
    /// Address of an existing device this registration replaces the key of.
    pub overwrites: Option<String>,
    pub groups: Vec<String>,
    pub uses: u32,
}

#[must_use]
pub fn token_key(token: &str) -> String {
    format!("{TOKENS_PREFIX}{token}")
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Store {
    /// Create a registration token; a random one is minted when `token` is
    /// empty. Returns the stored record.
    ///
    /// # Errors
    /// Returns an error on invalid arguments or when the write fails.
    pub async fn add_registration_token(
        &self,
        token: &str,
        username: &str,
        overwrites: Option<String>,
        groups: Vec<String>,
        uses: u32,
    ) -> Result<RegistrationToken> {
        if username.is_empty() {
            bail!("registration token needs a username");
        }
        if uses == 0 {
            bail!("invalid number of uses for registration token: {uses}");
        }
        for group in &groups {
            if !group.starts_with("group:") {
                bail!("group did not have the 'group:' prefix '{group}'");
            }
        }

        let record = RegistrationToken {
            token: if token.is_empty() {
                random_token()
            } else {
                token.to_string()
            },
            username: username.to_string(),
            overwrites,
            groups,
            uses,
        };

        self.put_json(token_key(&record.token), &record).await?;
        Ok(record)
    }

    /// # Errors
    /// Returns an error when the range read fails.
    pub async fn registration_tokens(&self) -> Result<Vec<RegistrationToken>> {
        Ok(self
            .get_prefix_json::<RegistrationToken>(TOKENS_PREFIX)
            .await?
            .into_iter()
            .map(|(_, token)| token)
            .collect())
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub async fn delete_registration_token(&self, token: &str) -> Result<bool> {
        self.delete(token_key(token)).await
    }

    /// Burn one use of a token, deleting it when none remain.
    ///
    /// # Errors
    /// Returns an error for unknown tokens or failed writes.
    pub async fn redeem_registration_token(&self, token: &str) -> Result<RegistrationToken> {
        let record: RegistrationToken = self
            .get_json(token_key(token))
            .await?
            .ok_or_else(|| anyhow!("registration token is not valid"))?;

        if record.uses <= 1 {
            self.delete(token_key(token)).await?;
        } else {
            let mut spent = record.clone();
            spent.uses -= 1;
            self.put_json(token_key(token), &spent).await?;
        }

        Ok(record)
    }
}
