//! Replicated ACL rules and group membership.
//!
//! A rule is keyed by a policy name: `*` applies to everyone, `group:<g>`
//! to a group's members, anything else to the user with that name. The
//! effective ACL of a user is the deterministic merge of every rule that
//! applies.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::firewall::Acl;

use super::{Store, ACLS_PREFIX, GROUPS_PREFIX};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    pub allow: Vec<String>,
    pub mfa: Vec<String>,
}

#[must_use]
pub fn acl_key(policy: &str) -> String {
    format!("{ACLS_PREFIX}{policy}")
}

#[must_use]
pub fn group_key(group: &str) -> String {
    format!("{GROUPS_PREFIX}{group}")
}

impl Store {
    /// # Errors
    /// Returns an error when the read fails or the record is corrupt.
    pub async fn get_acl(&self, policy: &str) -> Result<Option<AclRule>> {
        self.get_json(acl_key(policy)).await
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub async fn set_acl(&self, policy: &str, rule: &AclRule) -> Result<()> {
        self.put_json(acl_key(policy), rule).await
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub async fn delete_acl(&self, policy: &str) -> Result<bool> {
        self.delete(acl_key(policy)).await
    }

    /// Membership list of a group.
    ///
    /// # Errors
    /// Returns an error when the read fails or the record is corrupt.
    pub async fn get_group(&self, group: &str) -> Result<Option<Vec<String>>> {
        self.get_json(group_key(group)).await
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub async fn set_group(&self, group: &str, members: &[String]) -> Result<()> {
        self.put_json(group_key(group), &members.to_vec()).await
    }

    /// Add a user to a group, creating the group when needed.
    ///
    /// # Errors
    /// Returns an error when a read or write fails.
    pub async fn add_group_member(&self, group: &str, username: &str) -> Result<()> {
        let mut members = self.get_group(group).await?.unwrap_or_default();
        if !members.iter().any(|member| member == username) {
            members.push(username.to_string());
            self.set_group(group, &members).await?;
        }
        Ok(())
    }

    /// Groups the user is a member of.
    ///
    /// # Errors
    /// Returns an error when the range read fails.
    pub async fn groups_of(&self, username: &str) -> Result<Vec<String>> {
        let groups = self.get_prefix_json::<Vec<String>>(GROUPS_PREFIX).await?;
        Ok(groups
            .into_iter()
            .filter(|(_, members)| members.iter().any(|member| member == username))
            .map(|(key, _)| key.trim_start_matches(GROUPS_PREFIX).to_string())
            .collect())
    }

    /// Derive the user's effective ACL from every applicable rule.
    ///
    /// The output is deduplicated and sorted so every node derives the same
    /// table for the same inputs.
    ///
    /// # Errors
    /// Returns an error when a rule fails to parse or a read fails.
    pub async fn effective_acl(&self, username: &str) -> Result<Acl> {
        let mut allow = BTreeSet::new();
        let mut mfa = BTreeSet::new();

        let mut policies = vec!["*".to_string(), username.to_string()];
        policies.extend(self.groups_of(username).await?);

        for policy in policies {
            if let Some(rule) = self.get_acl(&policy).await? {
                let parsed = Acl::parse(&rule.allow, &rule.mfa)?;
                allow.extend(parsed.allow);
                mfa.extend(parsed.mfa);
            }
        }

        Ok(Acl {
            allow: allow.into_iter().collect(),
            mfa: mfa.into_iter().collect(),
        })
    }
}
