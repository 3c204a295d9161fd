//! Driver configuration: key=value parameters from the host, validated into
//! frozen connection settings.

use std::env;
use std::path::PathBuf;

use color_eyre::eyre::{bail, ensure, WrapErr};
use color_eyre::Result;
use nix::sys::socket::UnixAddr;

use crate::proto::DEFAULT_PORT;

/// Where the server listens.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { host: String, port: String },
}

/// Raw parameters as the host hands them over, one `key=value` at a time.
///
/// Exactly one of `socket` and `hostname` must be supplied; everything else
/// is optional.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Unix socket to connect to.
    pub socket: Option<PathBuf>,
    /// Hostname for a TCP connection.
    pub hostname: Option<String>,
    /// TCP port or service name (default 10809).
    pub port: Option<String>,
    /// Export name to request (default "", ignored for oldstyle servers).
    pub export: Option<String>,
    /// Number of 1-second retries on connect failure (default 0).
    pub retry: u32,
    /// Share a single server connection among all clients (default false).
    pub shared: bool,
}

impl Config {
    /// Apply one `key=value` parameter.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "socket" => self.socket = Some(PathBuf::from(value)),
            "hostname" => self.hostname = Some(value.to_string()),
            "port" => self.port = Some(value.to_string()),
            "export" => self.export = Some(value.to_string()),
            "retry" => {
                self.retry = value
                    .parse()
                    .wrap_err_with(|| format!("could not parse 'retry' value {value:?}"))?
            }
            "shared" => self.shared = parse_bool(value)?,
            _ => bail!("unknown parameter '{key}'"),
        }
        Ok(())
    }

    /// Check that exactly one endpoint was described and freeze the
    /// configuration into connection settings.
    pub fn finish(self) -> Result<Settings> {
        let endpoint = match self.socket {
            Some(path) => {
                ensure!(
                    self.hostname.is_none() && self.port.is_none(),
                    "cannot mix Unix socket and TCP hostname/port parameters"
                );
                let path = if path.is_absolute() {
                    path
                } else {
                    env::current_dir()?.join(path)
                };
                UnixAddr::new(&path)
                    .wrap_err_with(|| format!("invalid socket path {}", path.display()))?;
                Endpoint::Unix(path)
            }
            None => {
                let host = match self.hostname {
                    Some(host) => host,
                    None => bail!("must supply socket= or hostname= of external NBD server"),
                };
                let port = self.port.unwrap_or_else(|| DEFAULT_PORT.to_string());
                Endpoint::Tcp { host, port }
            }
        };
        let server = match &endpoint {
            Endpoint::Unix(path) => path.display().to_string(),
            Endpoint::Tcp { host, port } if host.contains(':') => format!("[{host}]:{port}"),
            Endpoint::Tcp { host, port } => format!("{host}:{port}"),
        };
        Ok(Settings {
            endpoint,
            server,
            export: self.export.unwrap_or_default(),
            retry: self.retry,
            shared: self.shared,
        })
    }
}

/// Validated endpoint plus session options, fixed for the driver's lifetime.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Where to connect.
    pub endpoint: Endpoint,
    /// Human-readable server description for log messages.
    pub server: String,
    /// Export name to request.
    pub export: String,
    /// Connect retry budget.
    pub retry: u32,
    /// One eagerly opened connection shared by every client.
    pub shared: bool,
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => bail!("could not parse '{value}' as a boolean"),
    }
}
