use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, io};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CONFIG_FILE_NAME: &str = "distmon.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config file '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("Could not parse toml config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Please supply all required configuration values, missing or invalid: {}", .0.join(", "))]
    Incomplete(Vec<String>),
}

/// The wifi network that has to be associated before any probing is done
#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(default)]
pub struct NetworkSpec {
    pub ssid: String,
}

/// Where, and with what credentials, batches are uploaded
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct StoreSpec {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub content_type: String,
    pub acl: String,
    /// Number of further attempts after a transient upload failure
    pub retries: u32,
    pub retry_delay_seconds: u64,
}

impl Default for StoreSpec {
    fn default() -> Self {
        StoreSpec {
            endpoint: String::new(),
            bucket: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            content_type: "text/plain".into(),
            acl: "private".into(),
            retries: 10,
            retry_delay_seconds: 5,
        }
    }
}

/// The local directory measurements are buffered in, and its size limits
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct BufferSpec {
    pub path: PathBuf,
    /// Consolidate and upload once the buffered records exceed this many bytes
    pub threshold_bytes: u64,
    /// Refuse to run once the buffered records exceed this many bytes
    pub ceiling_bytes: u64,
    /// Suffix naming this installation's batches. Derived from the machine id when empty.
    pub installation: String,
}

impl Default for BufferSpec {
    fn default() -> Self {
        BufferSpec {
            path: PathBuf::from("/tmp/dist-wifi-mon"),
            threshold_bytes: 4000,
            ceiling_bytes: 99999,
            installation: String::new(),
        }
    }
}

/// What is probed. One entry of each pool is picked at random per cycle.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ProbeSpec {
    pub ping_timeout_ms: u64,
    /// Resolver to send lookups to, instead of the one provided by the network
    pub resolver: Option<String>,
    pub ping_addresses: Vec<String>,
    pub hosts: Vec<String>,
    pub urls: Vec<String>,
}

impl Default for ProbeSpec {
    fn default() -> Self {
        ProbeSpec {
            ping_timeout_ms: 10000,
            resolver: None,
            ping_addresses: vec![
                "8.8.8.8".into(),        // Google's public DNS server
                "4.2.2.2".into(),        // b.resolvers.Level3.net
                "208.67.222.222".into(), // resolver1.opendns.com
            ],
            hosts: vec!["google.com".into(), "bbc.co.uk".into(), "slashdot.org".into()],
            urls: vec![
                "http://bbc.co.uk".into(),
                "http://google.com".into(),
                "http://slashdot.org".into(),
            ],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ScheduleSpec {
    pub period_seconds: Option<u64>,
}

#[derive(Default, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    pub network: NetworkSpec,
    pub store: StoreSpec,
    pub buffer: BufferSpec,
    pub probes: ProbeSpec,
    pub schedule: ScheduleSpec,
    pub debug: bool,
    #[serde(skip)]
    pub endpoint_url: Option<Url>,
    #[serde(skip)]
    pub retry_delay: Duration,
    #[serde(skip)]
    pub period_duration: Option<Duration>,
}

impl Config {
    pub fn from_toml(config_string: &str) -> Result<Config, ConfigError> {
        let mut config: Config = toml::from_str(config_string)?;
        config.derive();
        Ok(config)
    }

    fn derive(&mut self) {
        self.endpoint_url = Url::parse(&self.store.endpoint).ok();
        self.retry_delay = Duration::from_secs(self.store.retry_delay_seconds);
        self.period_duration = self.schedule.period_seconds.map(Duration::from_secs);
    }

    /// Check every value needed to run a cycle is present, naming all that are not
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = vec![];

        for (name, value) in [
            ("network.ssid", &self.network.ssid),
            ("store.endpoint", &self.store.endpoint),
            ("store.bucket", &self.store.bucket),
            ("store.access_key", &self.store.access_key),
            ("store.secret_key", &self.store.secret_key),
            ("store.content_type", &self.store.content_type),
            ("buffer.installation", &self.buffer.installation),
        ] {
            if value.trim().is_empty() {
                missing.push(name.to_owned());
            }
        }

        if !self.store.endpoint.is_empty() && self.endpoint_url.is_none() {
            missing.push(format!("store.endpoint (not a url: '{}')", self.store.endpoint));
        }

        if !self
            .buffer
            .installation
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            missing.push("buffer.installation (only letters, digits, '-' and '_')".into());
        }

        if self.buffer.threshold_bytes >= self.buffer.ceiling_bytes {
            missing.push("buffer.threshold_bytes (must be below buffer.ceiling_bytes)".into());
        }

        for (name, pool) in [
            ("probes.ping_addresses", &self.probes.ping_addresses),
            ("probes.hosts", &self.probes.hosts),
            ("probes.urls", &self.probes.urls),
        ] {
            if pool.is_empty() {
                missing.push(name.to_owned());
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Incomplete(missing))
        }
    }
}

pub fn find_config_file(file_name: &str) -> Result<PathBuf, io::Error> {
    let mut dir = env::current_dir().ok();

    // Loop until no parent director exists. (i.e. stop at "/")
    while let Some(directory) = dir {
        let config_path = directory.join(file_name);

        if config_path.exists() {
            return Ok(config_path);
        }

        dir = directory.parent().map(|p| p.to_path_buf());
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "distmon toml config file not found",
    ))
}

pub fn read_config(config_file_path: &Path) -> Result<Config, ConfigError> {
    let config_string =
        std::fs::read_to_string(config_file_path).map_err(|source| ConfigError::Read {
            path: config_file_path.to_path_buf(),
            source,
        })?;
    Config::from_toml(&config_string)
}
