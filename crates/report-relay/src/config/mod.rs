use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use thiserror::Error;
use url::Url;

/// Broker URL variable used by older deployments and their `.env` files.
/// Read when `REPORT_RELAY_AMQP_URL` is absent.
const LEGACY_AMQP_URL: &str = "RABBITMQ_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("REPORT_RELAY_AMQP_URL is required but not set")]
    AmqpUrlMissing,

    #[error("REPORT_RELAY_AMQP_URL is not a valid AMQP URL: {0}")]
    AmqpUrlInvalid(String),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("REPORT_RELAY_BIND_ADDRESS is not a valid IP address: {0}")]
    InvalidBindAddress(String),

    #[error("REPORT_RELAY_QUEUE must not be empty")]
    QueueNameEmpty,

    #[error("failed to read .env file: {0}")]
    DotEnv(#[from] dotenvy::Error),
}

/// Load a `.env` file from the working directory or one of its parents into
/// the process environment. Variables already set are not overridden.
///
/// Returns the path that was loaded, or `None` when there is no file.
pub fn load_dotenv() -> Result<Option<PathBuf>, ConfigError> {
    dotenv_outcome(dotenvy::dotenv())
}

fn dotenv_outcome(
    result: Result<PathBuf, dotenvy::Error>,
) -> Result<Option<PathBuf>, ConfigError> {
    match result {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(ConfigError::DotEnv(e)),
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub amqp_url: Url,
    pub queue: String,
    pub bind_address: IpAddr,
    pub listener_port: u16,
    pub buffer_max_reports: Option<usize>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with("REPORT_RELAY_") || k == LEGACY_AMQP_URL)
            .collect();
        Self::parse(&vars)
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let amqp_url = parse_amqp_url(vars)?;
        let queue = parse_queue(vars)?;
        let bind_address = parse_bind_address(vars)?;
        let listener_port = parse_port(vars, "REPORT_RELAY_LISTENER_PORT", 9090)?;
        let buffer_max_reports = parse_max_reports(vars, "REPORT_RELAY_BUFFER_MAX_REPORTS")?;

        Ok(Self {
            amqp_url,
            queue,
            bind_address,
            listener_port,
            buffer_max_reports,
        })
    }
}

fn parse_amqp_url(vars: &HashMap<String, String>) -> Result<Url, ConfigError> {
    let raw = vars
        .get("REPORT_RELAY_AMQP_URL")
        .filter(|s| !s.is_empty())
        .or_else(|| vars.get(LEGACY_AMQP_URL).filter(|s| !s.is_empty()))
        .ok_or(ConfigError::AmqpUrlMissing)?;

    let url = Url::parse(raw).map_err(|_| ConfigError::AmqpUrlInvalid(raw.clone()))?;
    match url.scheme() {
        "amqp" | "amqps" if url.has_host() => Ok(url),
        _ => Err(ConfigError::AmqpUrlInvalid(raw.clone())),
    }
}

fn parse_queue(vars: &HashMap<String, String>) -> Result<String, ConfigError> {
    match vars.get("REPORT_RELAY_QUEUE") {
        Some(name) if name.trim().is_empty() => Err(ConfigError::QueueNameEmpty),
        Some(name) => Ok(name.clone()),
        None => Ok("report_queue".to_owned()),
    }
}

fn parse_bind_address(vars: &HashMap<String, String>) -> Result<IpAddr, ConfigError> {
    match vars.get("REPORT_RELAY_BIND_ADDRESS") {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(val.clone())),
        None => Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
    }
}

fn parse_port(
    vars: &HashMap<String, String>,
    name: &str,
    default: u16,
) -> Result<u16, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_max_reports(
    vars: &HashMap<String, String>,
    name: &str,
) -> Result<Option<usize>, ConfigError> {
    match vars.get(name) {
        Some(val) => {
            let max: usize = val
                .parse()
                .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone()))?;
            if max == 0 { Ok(None) } else { Ok(Some(max)) }
        }
        None => Ok(None),
    }
}
