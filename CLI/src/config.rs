use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Result};
use bhk_bridge::BridgeConfig;

const TEMPLATE: &str = r#"# bhk-bridge configuration
# Leave [[gateways]] out to discover gateways on every start.

# local_bind_ip = "192.168.1.5"   # listen / send commands from this address
# listen_port = 50002
# command_port = 50000
# join_window_secs = 120
log_level = "info"
# log_file = "logs/bhk-bridge.log"

[discovery]
# broadcast_port = 50000
# response_port = 50002
# retry_interval_secs = 10
# window_secs = 30
# targets = ["192.168.1.255:50000"]

[watchdog]
# timeout_secs = 60
# tick_secs = 15

[websocket]
# port = 80
# path = "/ws"
# backoff_floor_secs = 1
# backoff_ceiling_secs = 30
# connect_timeout_secs = 10

# [[gateways]]
# mac = "aa:bb:cc:dd:ee:ff"
# ip = "192.168.1.20"
# type = "BHK-GW2"
# websocket = false
# platforms = ["light", "cover"]
"#;

/// `config.toml` in the working directory unless a path is given.
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(std::env::current_dir()?.join("config.toml")),
    }
}

/// Load the bridge config. A missing file is replaced by a commented
/// template and reported as an error so the user can edit it first.
pub fn load(explicit: Option<&Path>) -> Result<BridgeConfig> {
    let config_file = config_path(explicit)?;
    if !config_file.exists() {
        fs::write(&config_file, TEMPLATE)?;
        return Err(anyhow!(
            "Default config created at {:?}. Please update it and rerun.",
            config_file
        ));
    }
    BridgeConfig::load(&config_file)
}
