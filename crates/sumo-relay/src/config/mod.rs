use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::buffer::DEFAULT_CHUNK_SIZE;
use crate::uploader::DEFAULT_GZIP_THRESHOLD;

const PREFIX: &str = "SUMO_RELAY_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SUMO_RELAY_URL is required but not set")]
    UrlMissing,

    #[error("SUMO_RELAY_URL is not a valid URL: {0}")]
    UrlInvalid(String),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("{0} must be greater than zero")]
    ZeroValue(String),

    #[error("SUMO_RELAY_SOURCE has invalid value: {0} (expected \"file\" or \"journal\")")]
    UnknownSource(String),

    #[error("SUMO_RELAY_FILE is required when SUMO_RELAY_SOURCE is \"file\"")]
    FileMissing,
}

/// Where log lines come from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Tail a single file, sending every line under one tag.
    File { path: PathBuf, tag: String },
    /// Follow the systemd journal, tagging entries by one of their fields.
    Journal {
        directory: PathBuf,
        name_field: String,
        window: Duration,
    },
}

#[derive(Debug)]
pub struct Config {
    pub url: Url,
    pub gzip_threshold: usize,
    pub buffer_chunk: usize,
    pub flush_interval: Duration,
    pub source: Source,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> =
            env::vars().filter(|(k, _)| k.starts_with(PREFIX)).collect();
        Self::parse(&vars)
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let url = parse_url(vars)?;
        let gzip_threshold =
            parse_number(vars, "SUMO_RELAY_GZIP_THRESHOLD", DEFAULT_GZIP_THRESHOLD)?;
        let buffer_chunk = parse_nonzero(vars, "SUMO_RELAY_BUFFER_CHUNK", DEFAULT_CHUNK_SIZE)?;
        let flush_interval =
            Duration::from_millis(parse_nonzero(vars, "SUMO_RELAY_FLUSH_INTERVAL_MS", 5000)?);
        let source = parse_source(vars)?;

        Ok(Self {
            url,
            gzip_threshold,
            buffer_chunk,
            flush_interval,
            source,
        })
    }
}

fn parse_url(vars: &HashMap<String, String>) -> Result<Url, ConfigError> {
    let raw = vars
        .get("SUMO_RELAY_URL")
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::UrlMissing)?;

    Url::parse(raw).map_err(|_| ConfigError::UrlInvalid(raw.clone()))
}

fn parse_number<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_nonzero<T: FromStr + Default + PartialEq>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    let value = parse_number(vars, name, default)?;
    if value == T::default() {
        return Err(ConfigError::ZeroValue(name.to_owned()));
    }
    Ok(value)
}

fn parse_source(vars: &HashMap<String, String>) -> Result<Source, ConfigError> {
    match vars.get("SUMO_RELAY_SOURCE").map(|s| s.as_str()) {
        Some("journal") | Some("") | None => {
            let directory = vars
                .get("SUMO_RELAY_JOURNAL_DIR")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/log/journal"));
            let name_field = vars
                .get("SUMO_RELAY_JOURNAL_NAME_FIELD")
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| "_SYSTEMD_UNIT".to_owned());
            let window = Duration::from_secs(parse_number(
                vars,
                "SUMO_RELAY_JOURNAL_WINDOW_SECS",
                30,
            )?);
            Ok(Source::Journal {
                directory,
                name_field,
                window,
            })
        }
        Some("file") => {
            let path = vars
                .get("SUMO_RELAY_FILE")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .ok_or(ConfigError::FileMissing)?;
            let tag = vars.get("SUMO_RELAY_FILE_TAG").cloned().unwrap_or_default();
            Ok(Source::File { path, tag })
        }
        Some(other) => Err(ConfigError::UnknownSource(other.to_owned())),
    }
}
