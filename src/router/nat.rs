//! Host-firewall scaffolding around the data path.
//!
//! The XDP program only decides tunnel-sourced forwards; the host chains
//! provide the conntrack return path, the input policy on the tunnel
//! interface, and optional MASQUERADE. Teardown removes exactly the rules
//! setup added and logs anything it cannot undo rather than aborting.

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::config::Config;

type IptResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn fmt_err(err: Box<dyn std::error::Error>) -> anyhow::Error {
    anyhow!("{err}")
}

fn forward_rules(config: &Config) -> Vec<(&'static str, &'static str, String)> {
    let dev = &config.wireguard.dev_name;
    let mut rules = vec![
        (
            "filter",
            "FORWARD",
            "-m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT".to_string(),
        ),
        ("filter", "FORWARD", format!("-i {dev} -j ACCEPT")),
        ("filter", "FORWARD", format!("-o {dev} -j ACCEPT")),
    ];

    if config.nat {
        if let Ok(network) = config.tunnel_network() {
            rules.push((
                "nat",
                "POSTROUTING",
                format!("-s {} -j MASQUERADE", network.trunc()),
            ));
        }
    }

    rules
}

fn input_rules(config: &Config) -> Vec<(&'static str, &'static str, String)> {
    let dev = &config.wireguard.dev_name;
    let mut rules = vec![(
        "filter",
        "INPUT",
        format!(
            "-m tcp -p tcp -i {dev} --dport {} -j ACCEPT",
            config.webserver.tunnel_port
        ),
    )];

    for port in &config.expose_ports {
        let Some((range, proto)) = port.split_once('/') else {
            warn!("{port} is not in a valid port format, e.g. 80/tcp, 100-200/tcp");
            continue;
        };
        // iptables spells ranges with a colon.
        let range = range.replacen('-', ":", 1);
        rules.push((
            "filter",
            "INPUT",
            format!("-m {proto} -p {proto} -i {dev} --dport {range} -j ACCEPT"),
        ));
    }

    rules.push(("filter", "INPUT", format!("-p icmp -i {dev} -j ACCEPT")));
    rules.push((
        "filter",
        "INPUT",
        format!("-i {dev} -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT"),
    ));
    rules.push(("filter", "INPUT", format!("-i {dev} -j DROP")));

    rules
}

/// Install the forward policy and the tunnel input rules.
///
/// # Errors
///
/// Returns the first rule that could not be installed.
pub fn setup(config: &Config) -> Result<()> {
    let ipt = iptables::new(false).map_err(fmt_err)?;

    ipt.set_policy("filter", "FORWARD", "DROP")
        .map_err(fmt_err)
        .context("setting FORWARD policy to DROP")?;

    for (table, chain, rule) in forward_rules(config).into_iter().chain(input_rules(config)) {
        append_once(&ipt, table, chain, &rule)
            .map_err(fmt_err)
            .with_context(|| format!("installing {table}/{chain} rule: {rule}"))?;
    }

    info!(
        nat = config.nat,
        interface = %config.wireguard.dev_name,
        "host firewall scaffolding installed"
    );
    Ok(())
}

fn append_once(ipt: &iptables::IPTables, table: &str, chain: &str, rule: &str) -> IptResult<()> {
    // Re-running setup after a crash must not stack duplicates.
    if ipt.exists(table, chain, rule)? {
        return Ok(());
    }
    ipt.append(table, chain, rule)
}

/// Remove everything [`setup`] added; failures are logged, never fatal.
pub fn teardown(config: &Config) {
    let ipt = match iptables::new(false) {
        Ok(ipt) => ipt,
        Err(err) => {
            warn!("unable to clean up firewall rules: {err}");
            return;
        }
    };

    for (table, chain, rule) in forward_rules(config).into_iter().chain(input_rules(config)) {
        if let Err(err) = ipt.delete(table, chain, &rule) {
            warn!("unable to clean up {table}/{chain} rule {rule}: {err}");
        }
    }

    info!("host firewall scaffolding removed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config() -> Config {
        let mut config = Config::default();
        config.wireguard.dev_name = "wgtest".to_string();
        config.wireguard.address = "192.0.2.1/24".to_string();
        config.expose_ports = vec!["53/udp".to_string(), "100-200/tcp".to_string()];
        config
    }

    #[test]
    fn masquerade_follows_the_nat_flag() {
        let mut config = config();
        assert!(forward_rules(&config)
            .iter()
            .any(|(table, _, rule)| *table == "nat" && rule.contains("MASQUERADE")));

        config.nat = false;
        assert!(!forward_rules(&config)
            .iter()
            .any(|(table, _, _)| *table == "nat"));
    }

    #[test]
    fn exposed_ranges_use_iptables_syntax() {
        let rules = input_rules(&config());
        assert!(rules
            .iter()
            .any(|(_, _, rule)| rule.contains("--dport 100:200")));
        assert!(rules.iter().any(|(_, _, rule)| rule.contains("-m udp")));
        // The interface drop comes last so the accepts above it win.
        assert!(rules
            .last()
            .is_some_and(|(_, _, rule)| rule.ends_with("-j DROP")));
    }
}
