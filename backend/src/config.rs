use std::env;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use wheel_core::{Wheel, WheelError};

use crate::rest::DEFAULT_TABLE;
use crate::spinner::DEFAULT_REVEAL_DELAY;

pub const DEFAULT_BIND_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 3000));
pub const DEFAULT_CLIENT_IDLE: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq)]
pub enum StoreConfig {
    Memory {
        persist_path: Option<PathBuf>,
    },
    Rest {
        url: String,
        api_key: String,
        table: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub store: StoreConfig,
    pub reveal_delay: Duration,
    pub spin_seed: Option<u64>,
    pub wheel: Wheel,
    pub client_idle: Duration,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("WHEEL_EMOJIS: {0}")]
    Wheel(#[from] WheelError),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = parse("BIND_ADDR", get("BIND_ADDR"))?
            .unwrap_or(DEFAULT_BIND_ADDR);

        let store = match get("STORE_URL") {
            Some(url) => StoreConfig::Rest {
                url,
                api_key: get("STORE_API_KEY").ok_or(ConfigError::Missing("STORE_API_KEY"))?,
                table: get("STORE_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            },
            None => StoreConfig::Memory {
                persist_path: get("PERSIST_PATH").map(PathBuf::from),
            },
        };

        let reveal_delay = parse::<u64>("REVEAL_DELAY_MS", get("REVEAL_DELAY_MS"))?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REVEAL_DELAY);

        let spin_seed = parse("SPIN_SEED", get("SPIN_SEED"))?;

        let client_idle = parse::<u64>("CLIENT_IDLE_SECS", get("CLIENT_IDLE_SECS"))?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CLIENT_IDLE);

        let wheel = match get("WHEEL_EMOJIS") {
            Some(list) => Wheel::from_emojis(
                list.split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty()),
            )?,
            None => Wheel::default(),
        };

        Ok(Self {
            bind_addr,
            store,
            reveal_delay,
            spin_seed,
            wheel,
            client_idle,
        })
    }
}

fn parse<T>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}
