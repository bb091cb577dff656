//! Port listing.

use anyhow::Result;
use bmsboot::{
    Connector, NativeConnector, PortInfo, SerialConfig, default_candidates, describe_port,
    scan_ports,
};
use console::style;

use crate::Cli;

fn list(connector: &dyn Connector, scan: bool, baud: Option<u32>) -> Result<Vec<PortInfo>> {
    let known = connector.list_ports()?;
    if !scan {
        return Ok(known);
    }

    let mut config = SerialConfig::default();
    if let Some(baud) = baud {
        config.baud_rate = baud;
    }
    let found = scan_ports(connector, &config, default_candidates(connector), None);
    Ok(found
        .into_iter()
        .map(|name| {
            known
                .iter()
                .find(|p| p.name == name)
                .cloned()
                .unwrap_or_else(|| PortInfo::named(name))
        })
        .collect())
}

/// List-ports command implementation.
pub(crate) fn cmd_list_ports(cli: &Cli, scan: bool, json: bool) -> Result<()> {
    let ports = list(&NativeConnector, scan, cli.baud)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if ports.is_empty() {
        if !cli.quiet {
            eprintln!("{} No serial ports found", style("⚠").yellow());
        }
        return Ok(());
    }
    for port in &ports {
        println!("{}", describe_port(port));
    }
    Ok(())
}
