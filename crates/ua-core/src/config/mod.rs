//! Configuration for the user-agent core
//!
//! ```text
//! UaConfig
//!    ├── user_agent / firewall_ip / forced_local_ip
//!    ├── Timing        (retry windows, refresh margins, loop ceiling)
//!    ├── NetOptions    (keep-alive, learned port, HTTP tunnel)
//!    └── TimerSettings (RFC 3261 T1/T2/T4 for the transaction layer)
//! ```
//!
//! Every field has a default, so a TOML file only needs to list what it
//! changes:
//!
//! ```toml
//! user_agent = "softphone/2.0"
//!
//! [timing]
//! auth_retry_window = 60
//!
//! [network]
//! keep_alive_ms = 15000
//! ```
//!
//! The network options can also be changed while the user agent runs, see
//! [`UaOption`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use sipua_sip_core::TimerSettings;

use crate::errors::{Error, Result};

/// Maximum number of accepted TCP connections
pub const DEFAULT_MAX_SOCKETS: usize = 200;

/// Time windows used by the automatic-action sweep and garbage collection.
///
/// All values are in seconds except where noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// A 401/407/3xx older than this is no longer retried
    pub auth_retry_window: u64,
    /// Unterminated INVITEs and garbage transactions older than this are reclaimed
    pub abandon_window: u64,
    /// Credentialed retries per call, dialog, subscription or registration
    pub max_retries: u32,
    /// Refresh this long before a registration or subscription expires
    pub refresh_margin: u64,
    /// Registrations are refreshed at least this often whatever their period
    pub registration_ceiling: u64,
    /// An un-REGISTER is forgotten this long after it was sent
    pub unregister_linger: u64,
    /// A registration without a 2xx is re-sent after this long
    pub pending_retry_after: u64,
    /// Upper bound on one wait of the network loop
    pub max_select_wait: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            auth_retry_window: 120,
            abandon_window: 180,
            max_retries: 3,
            refresh_margin: 60,
            registration_ceiling: 900,
            unregister_linger: 60,
            pending_retry_after: 120,
            max_select_wait: 15,
        }
    }
}

/// Options that may change while running
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetOptions {
    /// Interval of UDP keep-alive datagrams to registrars, 0 disables
    pub keep_alive_ms: u64,
    /// Learn the public UDP port from `rport` in responses
    pub learn_port: bool,
    /// Local port of an HTTP tunnel to connect through, 0 disables
    pub http_tunnel_port: u16,
    /// `host:port` of the HTTP proxy carrying the tunnel
    pub http_proxy: String,
    /// SIP proxy the tunnel is asked to reach
    pub http_outbound_proxy: String,
}

/// Runtime option surface, applied with [`crate::UserAgent::set_option`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UaOption {
    UdpKeepAlive(u64),
    UdpLearnPort(bool),
    HttpTunnelPort(u16),
    HttpTunnelProxy(String),
    HttpOutboundProxy(String),
}

impl NetOptions {
    pub fn apply(&mut self, option: UaOption) {
        match option {
            UaOption::UdpKeepAlive(ms) => self.keep_alive_ms = ms,
            UaOption::UdpLearnPort(on) => self.learn_port = on,
            UaOption::HttpTunnelPort(port) => self.http_tunnel_port = port,
            UaOption::HttpTunnelProxy(proxy) => self.http_proxy = proxy,
            UaOption::HttpOutboundProxy(proxy) => self.http_outbound_proxy = proxy,
        }
    }
}

/// Top-level configuration of one user agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UaConfig {
    /// Value of the User-Agent header on everything we send
    pub user_agent: String,
    /// Public address written into Contact and Via when behind NAT
    pub firewall_ip: Option<String>,
    /// Local address to advertise instead of the guessed one
    pub forced_local_ip: Option<String>,
    pub timing: Timing,
    pub network: NetOptions,
    /// Size of the accepted TCP connection table
    pub max_sockets: usize,
    pub substrate: TimerSettings,
}

impl Default for UaConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("sipua/{}", crate::VERSION),
            firewall_ip: None,
            forced_local_ip: None,
            timing: Timing::default(),
            network: NetOptions::default(),
            max_sockets: DEFAULT_MAX_SOCKETS,
            substrate: TimerSettings::default(),
        }
    }
}

impl UaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: UaConfig =
            toml::from_str(s).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_firewall_ip(mut self, ip: impl Into<String>) -> Self {
        self.firewall_ip = Some(ip.into());
        self
    }

    pub fn with_local_ip(mut self, ip: impl Into<String>) -> Self {
        self.forced_local_ip = Some(ip.into());
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_network(mut self, network: NetOptions) -> Self {
        self.network = network;
        self
    }

    pub fn with_max_sockets(mut self, max: usize) -> Self {
        self.max_sockets = max;
        self
    }

    pub fn with_substrate(mut self, settings: TimerSettings) -> Self {
        self.substrate = settings;
        self
    }

    /// Reject settings that would stall the sweep or the network loop.
    pub fn validate(&self) -> Result<()> {
        if self.user_agent.trim().is_empty() {
            return Err(Error::Config("user_agent must not be empty".into()));
        }
        if self.timing.max_select_wait == 0 {
            return Err(Error::Config("timing.max_select_wait must be > 0".into()));
        }
        if self.timing.abandon_window == 0 || self.timing.auth_retry_window == 0 {
            return Err(Error::Config("retry and abandon windows must be > 0".into()));
        }
        if self.max_sockets == 0 {
            return Err(Error::Config("max_sockets must be > 0".into()));
        }
        Ok(())
    }
}
