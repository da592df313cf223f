use std::path::PathBuf;

use anyhow::Result;
use serde_json::{json, Value};

use crate::control::ControlClient;

pub struct Args {
    pub socket: PathBuf,
    pub action: WebadminAction,
}

pub enum WebadminAction {
    List,
    Add { username: String, password: String },
    Delete { username: String },
    Lock { username: String },
    Unlock { username: String },
}

/// # Errors
/// Returns an error when the daemon is unreachable or rejects the
/// request.
pub async fn execute(args: Args) -> Result<()> {
    let client = ControlClient::new(args.socket);

    match args.action {
        WebadminAction::List => {
            let admins: Vec<Value> = client.get("/admin_user/list").await?;
            println!("username,locked,added");
            for admin in admins {
                println!(
                    "{},{},{}",
                    admin.get("username").and_then(Value::as_str).unwrap_or("-"),
                    admin
                        .get("locked")
                        .and_then(Value::as_bool)
                        .unwrap_or_default(),
                    admin.get("added").and_then(Value::as_str).unwrap_or("-"),
                );
            }
        }
        WebadminAction::Add { username, password } => {
            let _: Value = client
                .post(
                    "/admin_user/add",
                    &json!({ "username": username, "password": password }),
                )
                .await?;
            println!("OK");
        }
        WebadminAction::Delete { username } => {
            let _: Value = client
                .post("/admin_user/del", &json!({ "username": username }))
                .await?;
            println!("OK");
        }
        WebadminAction::Lock { username } => {
            let _: Value = client
                .post("/admin_user/lock", &json!({ "username": username }))
                .await?;
            println!("OK");
        }
        WebadminAction::Unlock { username } => {
            let _: Value = client
                .post("/admin_user/unlock", &json!({ "username": username }))
                .await?;
            println!("OK");
        }
    }

    Ok(())
}
