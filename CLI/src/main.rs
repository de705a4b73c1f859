mod config;

use std::{collections::HashSet, path::Path, path::PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use bhk_bridge::{
    discovery::{discover, discover_new, DiscoveryOptions},
    logging::{parse_level, setup_logger},
    protocol::normalize_mac,
    Bridge, BridgeConfig, DeviceEvent, DeviceState, EntrySetup,
};
use tokio::{
    sync::mpsc,
    time::{timeout, Duration},
};

const USAGE: &str = "usage: bhk-bridge-cli [--config <path>] [discover | run | open-join <mac>]";

#[derive(Debug, PartialEq)]
enum Command {
    Discover,
    Run,
    OpenJoin(String),
}

#[derive(Debug, PartialEq)]
struct Invocation {
    command: Command,
    config: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => bail!(USAGE),
            _ => positional.push(arg.as_str()),
        }
    }

    let command = match positional.as_slice() {
        [] | ["run"] => Command::Run,
        ["discover"] => Command::Discover,
        ["open-join", mac] => Command::OpenJoin(mac.to_string()),
        _ => bail!(USAGE),
    };
    Ok(Invocation { command, config })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = parse_args(&args)?;

    let cfg = config::load(invocation.config.as_deref())?;
    setup_logger(
        parse_level(&cfg.log_level),
        cfg.log_file.as_deref().map(Path::new),
    )?;

    match invocation.command {
        Command::Discover => run_discover(&cfg).await,
        Command::Run => run_bridge(cfg).await,
        Command::OpenJoin(mac) => run_open_join(cfg, &mac).await,
    }
}

async fn run_discover(cfg: &BridgeConfig) -> Result<()> {
    let options = DiscoveryOptions::from_config(cfg);
    println!(
        "Discovering gateways for {}s...",
        options.window.as_secs()
    );
    let found = discover(&options).await?;
    if found.is_empty() {
        println!("No gateway answered.");
        return Ok(());
    }
    let mut gateways: Vec<_> = found.into_values().collect();
    gateways.sort_by(|a, b| a.mac.cmp(&b.mac));
    for gw in gateways {
        println!(
            "{}  {}  type={}  hw={}",
            gw.mac,
            gw.ip,
            gw.model.as_deref().unwrap_or("-"),
            gw.hardware_version.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn entry_setups(cfg: &BridgeConfig) -> Result<Vec<EntrySetup>> {
    if !cfg.gateways.is_empty() {
        return Ok(cfg
            .gateways
            .iter()
            .map(|gw| EntrySetup::from_config(gw, &cfg.websocket))
            .collect());
    }
    println!("No gateways configured, discovering...");
    let found = discover_new(&DiscoveryOptions::from_config(cfg), &HashSet::new())
        .await
        .context("gateway discovery failed")?;
    Ok(found.into_iter().map(EntrySetup::new).collect())
}

async fn run_bridge(cfg: BridgeConfig) -> Result<()> {
    let setups = entry_setups(&cfg).await?;
    let mut bridge = Bridge::new(cfg);
    let (tx, mut rx) = mpsc::unbounded_channel();

    for setup in setups {
        let entry_id = setup.entry_id.clone();
        bridge
            .add_entry(setup, tx.clone())
            .with_context(|| format!("failed to start entry {}", entry_id))?;
    }
    drop(tx);
    println!(
        "Bridge running for {} gateway(s). Press Ctrl-C to stop.",
        bridge.entry_ids().len()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping...");
                break;
            }
            event = rx.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            }
        }
    }

    bridge.shutdown().await;
    log::info!("Bridge stopped");
    Ok(())
}

async fn run_open_join(cfg: BridgeConfig, mac: &str) -> Result<()> {
    let mac = normalize_mac(mac);
    let gateway = cfg
        .gateways
        .iter()
        .find(|gw| normalize_mac(&gw.mac) == mac)
        .ok_or_else(|| anyhow!("gateway {} is not configured", mac))?;
    let setup = EntrySetup::from_config(gateway, &cfg.websocket);
    let entry_id = setup.entry_id.clone();

    let mut bridge = Bridge::new(cfg);
    let (tx, mut rx) = mpsc::unbounded_channel();
    bridge.add_entry(setup, tx)?;
    bridge.open_join_window(&entry_id).await?;
    println!("Join window requested on {}", mac);

    // Wait briefly for the gateway to confirm.
    let confirmed = timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            if let DeviceEvent::JoinWindowOpened { duration_s, .. } = event {
                return Some(duration_s);
            }
        }
        None
    })
    .await;
    match confirmed {
        Ok(Some(duration_s)) => println!("Gateway opened its join window for {}s", duration_s),
        _ => println!("No confirmation from the gateway"),
    }

    bridge.shutdown().await;
    Ok(())
}

fn print_event(event: &DeviceEvent) {
    match event {
        DeviceEvent::Added(record) => {
            println!("+ {} {} \"{}\"", record.kind, record.unique_id, record.name)
        }
        DeviceEvent::Updated(record) => {
            let state = match record.state {
                DeviceState::Light { is_on } => format!("on={}", is_on),
                DeviceState::Cover(cover) => format!(
                    "closed={} position={}",
                    cover
                        .is_closed
                        .map_or("?".to_string(), |c| c.to_string()),
                    cover.position.map_or("?".to_string(), |p| p.to_string())
                ),
            };
            println!(
                "~ {} {} {} available={}",
                record.kind, record.unique_id, state, record.available
            );
        }
        DeviceEvent::Removed { unique_id } => println!("- {}", unique_id),
        DeviceEvent::ConnectionChanged {
            gateway_mac,
            connected,
        } => println!(
            "* {} websocket {}",
            gateway_mac,
            if *connected { "connected" } else { "disconnected" }
        ),
        DeviceEvent::JoinWindowOpened {
            gateway_mac,
            duration_s,
        } => println!("* {} join window open for {}s", gateway_mac, duration_s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn run_is_the_default_command() {
        assert_eq!(parse_args(&args(&[])).unwrap().command, Command::Run);
        assert_eq!(parse_args(&args(&["run"])).unwrap().command, Command::Run);
    }

    #[test]
    fn parses_subcommands_and_config_path() {
        let inv = parse_args(&args(&["--config", "/tmp/b.toml", "open-join", "AA:BB"])).unwrap();
        assert_eq!(inv.command, Command::OpenJoin("AA:BB".into()));
        assert_eq!(inv.config, Some(PathBuf::from("/tmp/b.toml")));
        assert_eq!(
            parse_args(&args(&["discover"])).unwrap().command,
            Command::Discover
        );
    }

    #[test]
    fn rejects_unknown_usage() {
        assert!(parse_args(&args(&["open-join"])).is_err());
        assert!(parse_args(&args(&["frobnicate"])).is_err());
        assert!(parse_args(&args(&["--config"])).is_err());
    }
}
