//! Remote-endpoint configuration.
//!
//! The on-disk format is an INI file with `[common]` and `[remote]`
//! sections, shared with the gateway side of the deployment. PaaS-style
//! environment variables override the file so the same image can run behind
//! platform-injected ports.

use std::path::Path;
use std::str::FromStr;

use ini::Ini;

/// Default downlink read chunk and UDP receive buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config file: {0}")]
    Load(#[from] ini::Error),

    #[error("invalid value for '{key}': {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("this executable only supports 'remote' mode, found mode: '{0}'")]
    UnsupportedMode(String),

    #[error("remote port (port_ws_svr) is not configured")]
    MissingPort,
}

/// Runtime configuration of the remote endpoint.
#[derive(Debug, Clone)]
pub struct Config {
    /// Operating mode; only `remote` is accepted.
    pub mode: String,

    /// Downlink read chunk and UDP receive buffer size in bytes.
    pub buffer_size: usize,

    /// Seed for the symmetric key derivation; must match the gateway.
    pub crypt: u64,

    /// TCP and UDP listen port.
    pub port: u16,

    /// Require the `/tunnel` path on WebSocket upgrades. Off by default:
    /// the gateway historically dials arbitrary paths and the server
    /// accepts any upgrade.
    pub strict_tunnel_path: bool,
}

impl Config {
    /// Load configuration from an INI file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path.as_ref())?;
        let mut config = Self::from_ini(&ini)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mode = ini
            .get_from(Some("common"), "mode")
            .unwrap_or_default()
            .to_owned();
        let buffer_size =
            parse_or_default(ini.get_from(Some("common"), "bufferSize"), "bufferSize")?
                .unwrap_or(DEFAULT_BUFFER_SIZE);
        let crypt =
            parse_or_default(ini.get_from(Some("common"), "crypt"), "crypt")?.unwrap_or(0);
        let port = parse_or_default(ini.get_from(Some("remote"), "port_ws_svr"), "port_ws_svr")?
            .unwrap_or(0);
        let strict_tunnel_path = parse_or_default(
            ini.get_from(Some("remote"), "strict_tunnel_path"),
            "strict_tunnel_path",
        )?
        .unwrap_or(false);

        Ok(Config {
            mode,
            buffer_size,
            crypt,
            port,
            strict_tunnel_path,
        })
    }

    /// Apply PaaS environment overrides: `PORT` replaces the listen port,
    /// `CRYPT_KEY` the key seed, and `REMOTE_PORT` takes precedence over
    /// both the file and `PORT`. Unparsable values are ignored.
    fn apply_env_overrides(&mut self) {
        override_from_env(&mut self.port, "PORT");
        override_from_env(&mut self.crypt, "CRYPT_KEY");
        override_from_env(&mut self.port, "REMOTE_PORT");
    }

    /// Check that the loaded configuration can actually run a remote server.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode != "remote" {
            return Err(ConfigError::UnsupportedMode(self.mode.clone()));
        }
        if self.port == 0 {
            return Err(ConfigError::MissingPort);
        }
        Ok(())
    }
}

fn parse_or_default<T: FromStr>(
    raw: Option<&str>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
        }),
    }
}

fn override_from_env<T: FromStr>(target: &mut T, name: &str) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(parsed) = raw.parse() {
            *target = parsed;
        }
    }
}
