//! Bot configuration.
//!
//! The on-disk format is TOML ([`ConfigFile`]). It is resolved once into a
//! [`BotConfig`] which stays read-only for the lifetime of the process.
//!
//! ```toml
//! server = "irc.libera.chat"
//! nick = "mybot"
//! channels = ["#mybot"]
//! admins = ["alice"]
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BotError, Result};

/// Default TLS port.
pub const DEFAULT_PORT: u16 = 6697;
/// Seconds of silence before the idle watchdog fires.
pub const DEFAULT_RECEIVE_TIMEOUT_SECS: u64 = 600;
/// Seconds between the handshake and the JOIN burst.
pub const DEFAULT_JOIN_DELAY_SECS: u64 = 20;
/// Local address of the control listener.
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:9999";

/// Configuration as written in the TOML file. Every field may be omitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    /// Server hostname. Also used as the PONG payload and TLS server name.
    pub server: String,
    pub port: u16,
    /// Bot nickname.
    pub nick: String,
    /// Channels to join and to accept directed messages from.
    pub channels: Vec<String>,
    /// NickServ password, sent as `IDENTIFY` after registration.
    pub password: Option<String>,
    /// PEM bundle of trusted CA certificates. Bundled web roots when unset.
    pub ca_file: Option<PathBuf>,
    /// Nicks allowed to trigger admin-only handlers.
    pub admins: Vec<String>,
    /// Plain TCP when false (local test servers).
    pub tls: bool,
    /// Disable certificate verification when the trust store fails to load.
    pub tls_insecure_fallback: bool,
    pub receive_timeout_secs: u64,
    pub join_delay_secs: u64,
    /// Control listener address; an empty string disables it.
    pub control_addr: String,
    /// Exit instead of reconnecting on a closed or silent connection.
    pub strict: bool,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: DEFAULT_PORT,
            nick: String::new(),
            channels: Vec::new(),
            password: None,
            ca_file: None,
            admins: Vec::new(),
            tls: true,
            tls_insecure_fallback: false,
            receive_timeout_secs: DEFAULT_RECEIVE_TIMEOUT_SECS,
            join_delay_secs: DEFAULT_JOIN_DELAY_SECS,
            control_addr: DEFAULT_CONTROL_ADDR.to_string(),
            strict: false,
        }
    }
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BotError::Config(format!("can't read {}: {e}", path.display())))?;
        Self::parse(&text)
            .map_err(|e| BotError::Config(format!("bad config file {}: {e}", path.display())))
    }

    pub fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Validate and convert into the runtime configuration.
    pub fn resolve(self) -> Result<BotConfig> {
        if self.server.trim().is_empty() {
            return Err(BotError::Config("server must be set".into()));
        }
        if self.nick.trim().is_empty() {
            return Err(BotError::Config("nick must be set".into()));
        }
        if self.port == 0 {
            return Err(BotError::Config("port must be non-zero".into()));
        }
        if self.receive_timeout_secs == 0 {
            return Err(BotError::Config("receive_timeout_secs must be non-zero".into()));
        }
        let channels: Vec<String> = self
            .channels
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if channels.is_empty() {
            return Err(BotError::Config("at least one channel is required".into()));
        }
        let control_addr = match self.control_addr.trim() {
            "" => None,
            addr => Some(addr.parse::<SocketAddr>().map_err(|e| {
                BotError::Config(format!("invalid control_addr {addr:?}: {e}"))
            })?),
        };

        Ok(BotConfig {
            server: self.server.trim().to_string(),
            port: self.port,
            nick: self.nick.trim().to_string(),
            channels,
            password: self.password.filter(|p| !p.is_empty()),
            ca_file: self.ca_file,
            admins: self.admins.into_iter().collect(),
            tls: self.tls,
            tls_insecure_fallback: self.tls_insecure_fallback,
            receive_timeout: Duration::from_secs(self.receive_timeout_secs),
            join_delay: Duration::from_secs(self.join_delay_secs),
            control_addr,
            strict: self.strict,
        })
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub server: String,
    pub port: u16,
    pub nick: String,
    pub channels: Vec<String>,
    pub password: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub admins: HashSet<String>,
    pub tls: bool,
    pub tls_insecure_fallback: bool,
    pub receive_timeout: Duration,
    pub join_delay: Duration,
    pub control_addr: Option<SocketAddr>,
    pub strict: bool,
}

impl BotConfig {
    /// Minimal configuration with defaults for everything but identity.
    pub fn new(server: &str, nick: &str, channels: &[&str]) -> Self {
        Self {
            server: server.to_string(),
            port: DEFAULT_PORT,
            nick: nick.to_string(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            password: None,
            ca_file: None,
            admins: HashSet::new(),
            tls: true,
            tls_insecure_fallback: false,
            receive_timeout: Duration::from_secs(DEFAULT_RECEIVE_TIMEOUT_SECS),
            join_delay: Duration::from_secs(DEFAULT_JOIN_DELAY_SECS),
            control_addr: None,
            strict: false,
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    pub fn is_channel(&self, name: &str) -> bool {
        self.channels.iter().any(|c| c == name)
    }
}
