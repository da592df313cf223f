use std::path::PathBuf;

use anyhow::Result;
use serde_json::{json, Value};

use crate::cluster::NodeInfo;
use crate::control::ControlClient;
use crate::store::EventError;

pub struct Args {
    pub socket: PathBuf,
    pub action: ClusterAction,
}

pub enum ClusterAction {
    List,
    Drain { node: String, drained: bool },
    Promote { node: String },
    Remove { node: String },
    StepDown,
    Errors,
    Resolve { error_id: String },
}

/// # Errors
/// Returns an error when the daemon is unreachable or rejects the
/// request.
pub async fn execute(args: Args) -> Result<()> {
    let client = ControlClient::new(args.socket);

    match args.action {
        ClusterAction::List => {
            let members: Vec<NodeInfo> = client.get("/cluster/members").await?;
            println!("id,name,role,drained,peer_urls");
            for member in members {
                println!(
                    "{},{},{:?},{},{}",
                    member.id,
                    member.name,
                    member.role,
                    member.drained,
                    member.peer_urls.join(" ")
                );
            }
        }
        ClusterAction::Drain { node, drained } => {
            let _: Value = client
                .post("/cluster/drain", &json!({ "node": node, "drained": drained }))
                .await?;
            println!("OK");
        }
        ClusterAction::Promote { node } => {
            let _: Value = client
                .post("/cluster/promote", &json!({ "node": node }))
                .await?;
            println!("OK");
        }
        ClusterAction::Remove { node } => {
            let _: Value = client
                .post("/cluster/remove", &json!({ "node": node }))
                .await?;
            println!("OK");
        }
        ClusterAction::StepDown => {
            let _: Value = client.post("/cluster/step_down", &json!({})).await?;
            println!("OK");
        }
        ClusterAction::Errors => {
            let errors: Vec<EventError> = client.get("/cluster/errors").await?;
            for error in errors {
                println!(
                    "{} node={} time={}\n  payload: {}\n  error: {}",
                    error.error_id, error.node_id, error.time, error.failed_event_data, error.error
                );
            }
        }
        ClusterAction::Resolve { error_id } => {
            let _: Value = client
                .post("/cluster/errors/resolve", &json!({ "error_id": error_id }))
                .await?;
            println!("OK");
        }
    }

    Ok(())
}
