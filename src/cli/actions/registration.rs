use std::path::PathBuf;

use anyhow::Result;
use serde_json::{json, Value};

use crate::control::ControlClient;
use crate::store::RegistrationToken;

pub struct Args {
    pub socket: PathBuf,
    pub action: RegistrationAction,
}

pub enum RegistrationAction {
    List,
    Add {
        username: String,
        token: String,
        groups: Vec<String>,
        uses: u32,
        overwrite: Option<String>,
    },
    Delete {
        token: String,
    },
}

/// # Errors
/// Returns an error when the daemon is unreachable or rejects the
/// request.
pub async fn execute(args: Args) -> Result<()> {
    let client = ControlClient::new(args.socket);

    match args.action {
        RegistrationAction::List => {
            let tokens: Vec<RegistrationToken> = client.get("/registration").await?;
            println!("token,username,groups,overwrites,uses");
            for token in tokens {
                println!(
                    "{},{},{},{},{}",
                    token.token,
                    token.username,
                    token.groups.join(" "),
                    token.overwrites.as_deref().unwrap_or("-"),
                    token.uses
                );
            }
        }
        RegistrationAction::Add {
            username,
            token,
            groups,
            uses,
            overwrite,
        } => {
            let created: RegistrationToken = client
                .post(
                    "/registration",
                    &json!({
                        "username": username,
                        "token": token,
                        "groups": groups,
                        "uses": uses,
                        "overwrite": overwrite,
                    }),
                )
                .await?;
            println!("{}", created.token);
        }
        RegistrationAction::Delete { token } => {
            let _: Value = client.delete("/registration", &json!({ "id": token })).await?;
            println!("OK");
        }
    }

    Ok(())
}
