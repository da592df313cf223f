use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::ArgMatches;

use crate::cli::actions::{
    cluster, devices, firewall, registration, server, webadmin, Action,
};
use crate::cli::commands::{start::ARG_CONFIG, ARG_SOCKET};

/// Map parsed arguments onto the action to run.
///
/// # Errors
///
/// Returns an error for missing or malformed argument values; flag
/// exclusivity is already enforced by the command definitions.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    let socket: PathBuf = matches
        .get_one::<String>(ARG_SOCKET)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(crate::config::DEFAULT_CONTROL_SOCKET));

    match matches.subcommand() {
        Some(("start", sub)) => {
            let config_path = sub
                .get_one::<String>(ARG_CONFIG)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(crate::config::DEFAULT_CONFIG_PATH));
            Ok(Action::Start(server::Args { config_path }))
        }

        Some(("devices", sub)) => {
            let action = if sub.get_flag("list") {
                devices::DeviceAction::List
            } else if sub.get_flag("sessions") {
                devices::DeviceAction::Sessions
            } else if sub.get_flag("del") {
                devices::DeviceAction::Delete(device_arg(sub)?)
            } else if sub.get_flag("lock") {
                devices::DeviceAction::Lock(device_arg(sub)?)
            } else if sub.get_flag("reset") {
                devices::DeviceAction::Reset(device_arg(sub)?)
            } else {
                bail!("invalid action choice");
            };
            Ok(Action::Devices(devices::Args { socket, action }))
        }

        Some(("registration", sub)) => {
            let action = if sub.get_flag("list") {
                registration::RegistrationAction::List
            } else if sub.get_flag("add") {
                registration::RegistrationAction::Add {
                    username: required(sub, "username")?,
                    token: sub.get_one::<String>("token").cloned().unwrap_or_default(),
                    groups: sub
                        .get_many::<String>("groups")
                        .map(|values| values.cloned().collect())
                        .unwrap_or_default(),
                    uses: sub.get_one::<u32>("uses").copied().unwrap_or(1),
                    overwrite: sub.get_one::<String>("overwrite").cloned(),
                }
            } else if sub.get_flag("del") {
                registration::RegistrationAction::Delete {
                    token: required(sub, "token")?,
                }
            } else {
                bail!("invalid action choice");
            };
            Ok(Action::Registration(registration::Args { socket, action }))
        }

        Some(("cluster", sub)) => {
            let action = if sub.get_flag("list") {
                cluster::ClusterAction::List
            } else if sub.get_flag("drain") {
                cluster::ClusterAction::Drain {
                    node: required(sub, "node")?,
                    drained: true,
                }
            } else if sub.get_flag("undrain") {
                cluster::ClusterAction::Drain {
                    node: required(sub, "node")?,
                    drained: false,
                }
            } else if sub.get_flag("promote") {
                cluster::ClusterAction::Promote {
                    node: required(sub, "node")?,
                }
            } else if sub.get_flag("remove") {
                cluster::ClusterAction::Remove {
                    node: required(sub, "node")?,
                }
            } else if sub.get_flag("step-down") {
                cluster::ClusterAction::StepDown
            } else if sub.get_flag("errors") {
                cluster::ClusterAction::Errors
            } else if sub.get_flag("resolve") {
                cluster::ClusterAction::Resolve {
                    error_id: required(sub, "error-id")?,
                }
            } else {
                bail!("invalid action choice");
            };
            Ok(Action::Cluster(cluster::Args { socket, action }))
        }

        Some(("firewall", sub)) => {
            let action = if sub.get_flag("list") {
                firewall::FirewallAction::List
            } else if sub.get_flag("digest") {
                firewall::FirewallAction::Digest
            } else {
                bail!("invalid action choice");
            };
            Ok(Action::Firewall(firewall::Args { socket, action }))
        }

        Some(("webadmin", sub)) => {
            let action = if sub.get_flag("list") {
                webadmin::WebadminAction::List
            } else if sub.get_flag("add") {
                webadmin::WebadminAction::Add {
                    username: required(sub, "username")?,
                    password: required(sub, "password")?,
                }
            } else if sub.get_flag("del") {
                webadmin::WebadminAction::Delete {
                    username: required(sub, "username")?,
                }
            } else if sub.get_flag("lock") {
                webadmin::WebadminAction::Lock {
                    username: required(sub, "username")?,
                }
            } else if sub.get_flag("unlock") {
                webadmin::WebadminAction::Unlock {
                    username: required(sub, "username")?,
                }
            } else {
                bail!("invalid action choice");
            };
            Ok(Action::Webadmin(webadmin::Args { socket, action }))
        }

        _ => bail!("unknown subcommand"),
    }
}

fn required(matches: &ArgMatches, name: &str) -> Result<String> {
    matches
        .get_one::<String>(name)
        .cloned()
        .ok_or_else(|| anyhow!("--{name} must be supplied"))
}

fn device_arg(matches: &ArgMatches) -> Result<Ipv4Addr> {
    required(matches, "device")?
        .parse()
        .context("device must be an IPv4 tunnel address")
}
