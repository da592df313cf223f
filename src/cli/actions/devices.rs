use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Result;
use serde_json::{json, Value};

use crate::control::{ControlClient, DeviceSummary, SessionSummary};

pub struct Args {
    pub socket: PathBuf,
    pub action: DeviceAction,
}

pub enum DeviceAction {
    List,
    Sessions,
    Delete(Ipv4Addr),
    Lock(Ipv4Addr),
    Reset(Ipv4Addr),
}

/// # Errors
/// Returns an error when the daemon is unreachable or rejects the
/// request.
pub async fn execute(args: Args) -> Result<()> {
    let client = ControlClient::new(args.socket);

    match args.action {
        DeviceAction::List => {
            let devices: Vec<DeviceSummary> = client.get("/device/list").await?;
            println!("username,address,publickey,attempts,state");
            for device in devices {
                println!(
                    "{},{},{},{},{}",
                    device.username,
                    device.address,
                    device.public_key,
                    device.attempts,
                    device.state
                );
            }
        }
        DeviceAction::Sessions => {
            let sessions: Vec<SessionSummary> = client.get("/device/sessions").await?;
            println!("vpn_address,actual_endpoint");
            for session in sessions {
                let endpoint = session
                    .endpoint
                    .map_or_else(|| "-".to_string(), |endpoint| endpoint.to_string());
                println!("{},{endpoint}", session.address);
            }
        }
        DeviceAction::Delete(address) => {
            let _: Value = client
                .delete("/device", &json!({ "address": address }))
                .await?;
            println!("OK");
        }
        DeviceAction::Lock(address) => {
            let _: Value = client
                .post("/device/lock", &json!({ "address": address }))
                .await?;
            println!("OK");
        }
        DeviceAction::Reset(address) => {
            let _: Value = client
                .post("/device/unlock", &json!({ "address": address }))
                .await?;
            println!("OK");
        }
    }

    Ok(())
}
