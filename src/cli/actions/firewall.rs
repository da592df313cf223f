use std::path::PathBuf;

use anyhow::Result;
use serde_json::Value;

use crate::control::ControlClient;
use crate::firewall::RuleSnapshot;

pub struct Args {
    pub socket: PathBuf,
    pub action: FirewallAction,
}

pub enum FirewallAction {
    List,
    Digest,
}

/// # Errors
/// Returns an error when the daemon is unreachable or rejects the
/// request.
pub async fn execute(args: Args) -> Result<()> {
    let client = ControlClient::new(args.socket);

    match args.action {
        FirewallAction::List => {
            let rules: Vec<RuleSnapshot> = client.get("/firewall/rules").await?;
            println!("{}", serde_json::to_string_pretty(&rules)?);
        }
        FirewallAction::Digest => {
            let digest: Value = client.get("/firewall/digest").await?;
            println!(
                "{}",
                digest.get("digest").and_then(Value::as_str).unwrap_or("-")
            );
        }
    }

    Ok(())
}
