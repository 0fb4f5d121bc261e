use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::RwLock;

/// Configuration for the desk bridge, loaded from `LC_*` environment
/// variables once at startup. `base_height` and `max_height` may be left
/// open and are back-filled exactly once during driver initialization from
/// the hardware-reported base offset.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bluetooth MAC address of the desk.
    pub mac_address: String,

    /// Height of the desk at its lowest position, in mm above the floor.
    pub base_height: Option<u16>,

    /// Maximum height the REST surface will accept, in mm above the floor.
    pub max_height: Option<u16>,

    /// Bluetooth adapter name (ignored on platforms without named adapters).
    pub adapter_name: String,

    /// Seconds to scan for the desk before giving up.
    pub scan_timeout: u64,

    /// Seconds to wait for a connection attempt.
    pub connection_timeout: u64,

    /// Address the REST server binds to.
    pub server_address: String,

    /// Port the REST server binds to.
    pub server_port: u16,

    /// Seconds between reference input refreshes during a move.
    pub move_command_period: f64,

    /// Whether the REST surface accepts targets below the current height.
    pub allow_downward_movement: bool,

    /// URL to PUT the human height to whenever telemetry settles.
    pub webhook_put_height: Option<String>,

    /// Extra headers for the webhook request.
    pub webhook_put_height_headers: HashMap<String, String>,

    /// Raise the log filter to debug.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mac_address: String::new(),
            base_height: None,
            max_height: None,
            adapter_name: "hci0".to_string(),
            scan_timeout: 5,
            connection_timeout: 10,
            server_address: "127.0.0.1".to_string(),
            server_port: 9123,
            move_command_period: 0.4,
            allow_downward_movement: true,
            webhook_put_height: None,
            webhook_put_height_headers: HashMap::new(),
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration from the environment. The MAC address is the only
    /// required value.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(mac_address) = env::var("LC_MAC_ADDRESS").ok().filter(|s| !s.is_empty()) {
            config.mac_address = mac_address.trim().to_lowercase();
        } else {
            bail!("LC_MAC_ADDRESS must be provided");
        }

        config.base_height = parse_var("LC_BASE_HEIGHT")?;
        config.max_height = parse_var("LC_MAX_HEIGHT")?;
        if let Ok(adapter_name) = env::var("LC_ADAPTER_NAME") {
            config.adapter_name = adapter_name.trim().to_string();
        }
        if let Some(scan_timeout) = parse_var("LC_SCAN_TIMEOUT")? {
            config.scan_timeout = scan_timeout;
        }
        if let Some(connection_timeout) = parse_var("LC_CONNECTION_TIMEOUT")? {
            config.connection_timeout = connection_timeout;
        }
        if let Ok(server_address) = env::var("LC_SERVER_ADDRESS") {
            config.server_address = server_address.trim().to_string();
        }
        if let Some(server_port) = parse_var("LC_SERVER_PORT")? {
            config.server_port = server_port;
        }
        if let Some(move_command_period) = parse_var("LC_MOVE_COMMAND_PERIOD")? {
            config.move_command_period = move_command_period;
        }
        if let Ok(allow) = env::var("LC_ALLOW_DOWNWARD_MOVEMENT") {
            config.allow_downward_movement = truthy(&allow);
        }
        config.webhook_put_height = env::var("LC_WEBHOOK_PUT_HEIGHT")
            .ok()
            .filter(|s| !s.is_empty());
        if let Ok(headers) = env::var("LC_WEBHOOK_PUT_HEIGHT_HEADERS") {
            config.webhook_put_height_headers = serde_json::from_str(&headers)
                .context("LC_WEBHOOK_PUT_HEIGHT_HEADERS must be a JSON object of strings")?;
        }
        if let Ok(debug) = env::var("LC_DEBUG") {
            config.debug = truthy(&debug);
        }

        Ok(config)
    }

    pub fn move_command_duration(&self) -> Duration {
        Duration::from_secs_f64(self.move_command_period)
    }
}

/// Shared handle: read-mostly, written once by driver initialization.
pub type SharedConfig = Arc<RwLock<Config>>;

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid value for {}: {:?}", name, value))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

fn truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_lowercase().as_str(),
        "" | "0" | "false" | "no"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_rejects_falsy_strings() {
        assert!(!truthy("0"));
        assert!(!truthy("false"));
        assert!(!truthy("No"));
        assert!(!truthy(""));
        assert!(truthy("1"));
        assert!(truthy("true"));
        assert!(truthy("yes"));
    }

    #[test]
    fn move_command_duration_converts_seconds() {
        let config = Config {
            move_command_period: 0.4,
            ..Config::default()
        };
        assert_eq!(config.move_command_duration(), Duration::from_millis(400));
    }
}
