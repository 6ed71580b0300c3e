// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Configuration module for the server binary, `dyndns`.

use std::{fs, io, net::IpAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use dyndns_server::auth::AuthPolicy;
use dyndns_server::fqdn::{Fqdn, FqdnError};


/// Server configuration
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// DNS listeners and the served root domains
    #[serde(default, alias = "DNS")]
    pub dns: DnsConfig,
    /// HTTP update interface
    #[serde(default, alias = "HTTP")]
    pub http: HttpConfig,
    /// Authentication of updates
    #[serde(default, alias = "Auth")]
    pub auth: AuthConfig,
    /// Record files
    #[serde(default, alias = "Persistence")]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// read a Config file from the file specified at path.
    pub fn read_config(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// Reads the file at `path`, writing and returning the default configuration if it does
    /// not exist.
    pub fn read_or_create(path: &Path) -> Result<Self, ConfigError> {
        match Self::read_config(path) {
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                warn!("configuration file {path:?} does not exist, creating it");
                let config = Self::default();
                if let Err(e) = fs::write(path, config.to_toml()?) {
                    warn!("using default configuration without file, {path:?} could not be written: {e}");
                }
                Ok(config)
            }
            Ok(config) => {
                info!("loaded configuration file {path:?}");
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }

    /// Read a [`Config`] from the given TOML string.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml)?)
    }

    /// The configuration as written to a new file
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// DNS server configuration
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    /// Address to listen on
    #[serde(default = "default_dns_host", alias = "Host")]
    pub host: String,
    /// Port to listen on, for UDP and TCP
    #[serde(default = "default_dns_port", alias = "Port")]
    pub port: u16,
    /// Root domains, names are assigned to the first one that contains them
    #[serde(default, alias = "Domains")]
    pub domains: Vec<String>,
    /// Also listen on TCP
    #[serde(default = "default_true", alias = "TCP")]
    pub tcp: bool,
    /// Seconds an idle TCP connection is kept open
    #[serde(default = "default_request_timeout", alias = "TCPRequestTimeout")]
    pub tcp_request_timeout: u64,
}

impl DnsConfig {
    /// The address to bind
    pub fn listen_addr(&self) -> Result<IpAddr, ConfigError> {
        self.host.parse().map_err(|_| {
            ConfigError::Invalid(format!("dns.host is not an IP address: {}", self.host))
        })
    }

    /// The root domains in their canonical form, in configuration order
    pub fn domains(&self) -> Result<Vec<Fqdn>, ConfigError> {
        Ok(self
            .domains
            .iter()
            .map(|d| Fqdn::new(d))
            .collect::<Result<Vec<_>, FqdnError>>()?)
    }

    /// Timeout of idle TCP connections
    pub fn tcp_request_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_request_timeout)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            host: default_dns_host(),
            port: default_dns_port(),
            domains: Vec::new(),
            tcp: true,
            tcp_request_timeout: default_request_timeout(),
        }
    }
}

/// HTTP server configuration
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Host to listen on, empty disables the TCP listener
    #[serde(default = "default_http_host", alias = "Host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_http_port", alias = "Port")]
    pub port: u16,
    /// Path of a Unix socket to listen on, empty disables it
    #[serde(default, alias = "Socket")]
    pub socket: String,
    /// Permissions of the Unix socket file
    #[serde(default = "default_socket_file_mode", alias = "SocketFileMode")]
    pub socket_file_mode: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            socket: String::new(),
            socket_file_mode: default_socket_file_mode(),
        }
    }
}

/// Authentication configuration
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// How unknown users and foreign domains are reported
    #[serde(default, alias = "Policy")]
    pub policy: AuthPolicy,
}

/// Record file configuration
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfig {
    /// Seconds between two flushes of changed records
    #[serde(default = "default_flush_interval", alias = "FlushIntervalSecs")]
    pub flush_interval_secs: u64,
}

impl PersistenceConfig {
    /// Period of the flush task, must not be zero
    pub fn flush_interval(&self) -> Result<Duration, ConfigError> {
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "persistence.flush_interval_secs must be greater than 0".to_string(),
            ));
        }

        Ok(Duration::from_secs(self.flush_interval_secs))
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
        }
    }
}

/// The error kind for errors that get returned in the crate
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    // foreign
    /// An error got returned from IO
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An error occurred while decoding toml data
    #[error("toml decode error: {0}")]
    TomlDecode(#[from] toml::de::Error),

    /// An error occurred while encoding toml data
    #[error("toml encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    /// A configured root domain is not a valid name
    #[error("invalid domain: {0}")]
    Domain(#[from] FqdnError),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_dns_host() -> String {
    "0.0.0.0".to_string()
}

fn default_dns_port() -> u16 {
    5353
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    5
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_socket_file_mode() -> u32 {
    0o644
}

fn default_flush_interval() -> u64 {
    1
}
