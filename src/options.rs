//! Command line options
//!
//! ```text
//! --id <num>                 ID of the local player (required)
//! --login <string>           login of the local player (required)
//! --rpc-port <port>          JSON-RPC server port (default 7236)
//! --gpgnet-port <port>       GPGNet server port (default 7237)
//! --lobby-port <port>        UDP port the game lobby receives relayed traffic on (default 7238)
//! --log-file <path>          also log to this file
//! --log-level <level>        error, warn, info, debug or trace (default debug)
//! --connect-timeout-ms <ms>  connection attempt timeout / watchdog period (default 10000)
//! --stuck-states <list>      states the watchdog restarts from (default new,failed)
//! ```
//!
//! Every flag also accepts its underscore spelling (`--rpc_port`).

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::relay::session::ConnectionState;
use crate::relay::{RelayConfig, DEFAULT_CONNECT_TIMEOUT};
use crate::PlayerId;

pub const DEFAULT_RPC_PORT: u16 = 7236;
pub const DEFAULT_GPGNET_PORT: u16 = 7237;
pub const DEFAULT_LOBBY_PORT: u16 = 7238;
pub const DEFAULT_LOG_LEVEL: &str = "debug";

pub const USAGE: &str = "Usage: ice-adapter --id [num] --login [string] \
[--rpc-port 7236] [--gpgnet-port 7237] [--lobby-port 7238] [--log-file path] \
[--log-level debug] [--connect-timeout-ms 10000] [--stuck-states new,failed]";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required argument {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {flag}: {reason}")]
    Invalid {
        flag: &'static str,
        value: String,
        reason: String,
    },
}

/// Adapter settings, fixed for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub id: PlayerId,
    pub login: String,
    pub rpc_port: u16,
    pub gpgnet_port: u16,
    pub lobby_port: u16,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub connect_timeout: Duration,
    pub stuck_states: Vec<ConnectionState>,
}

impl Options {
    /// Defaults for everything but the local player
    pub fn new(id: PlayerId, login: impl Into<String>) -> Self {
        Self {
            id,
            login: login.into(),
            rpc_port: DEFAULT_RPC_PORT,
            gpgnet_port: DEFAULT_GPGNET_PORT,
            lobby_port: DEFAULT_LOBBY_PORT,
            log_file: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stuck_states: vec![ConnectionState::New, ConnectionState::Failed],
        }
    }

    /// Parse from `std::env::args()`-style arguments (program name first)
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let id = parse_arg(args, "--id").ok_or(ConfigError::Missing("--id"))?;
        let login = parse_arg(args, "--login").ok_or(ConfigError::Missing("--login"))?;

        let mut options = Options::new(parse_value("--id", &id)?, login);

        if let Some(v) = parse_arg(args, "--rpc-port") {
            options.rpc_port = parse_value("--rpc-port", &v)?;
        }
        if let Some(v) = parse_arg(args, "--gpgnet-port") {
            options.gpgnet_port = parse_value("--gpgnet-port", &v)?;
        }
        if let Some(v) = parse_arg(args, "--lobby-port") {
            options.lobby_port = parse_value("--lobby-port", &v)?;
        }
        options.log_file = parse_arg(args, "--log-file")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        if let Some(v) = parse_arg(args, "--log-level") {
            options.log_level = normalize_log_level(&v);
        }
        if let Some(v) = parse_arg(args, "--connect-timeout-ms") {
            let ms: u64 = parse_value("--connect-timeout-ms", &v)?;
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    flag: "--connect-timeout-ms",
                    value: v,
                    reason: "must be positive".into(),
                });
            }
            options.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = parse_arg(args, "--stuck-states") {
            options.stuck_states = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| {
                    s.parse().map_err(|reason| ConfigError::Invalid {
                        flag: "--stuck-states",
                        value: v.clone(),
                        reason,
                    })
                })
                .collect::<Result<_, _>>()?;
        }

        Ok(options)
    }

    /// Settings handed to every relay
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            lobby_port: self.lobby_port,
            game_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: self.connect_timeout,
            stuck_states: self.stuck_states.clone(),
        }
    }
}

/// Value following `flag` or its underscore spelling
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    let alias = flag.replace('-', "_").replacen("__", "--", 1);
    args.iter()
        .position(|a| a == flag || *a == alias)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_value<T>(flag: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        flag,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Map the old `verbose` level name onto the `log` crate's levels
fn normalize_log_level(level: &str) -> String {
    match level {
        "verbose" => "trace".to_string(),
        other => other.to_string(),
    }
}
