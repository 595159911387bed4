//! Environment-driven server configuration.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: `{value}`")]
    Invalid { var: String, value: String },
}

/// Which transports to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Stdio,
    Both,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(TransportKind::Http),
            "stdio" => Ok(TransportKind::Stdio),
            "both" => Ok(TransportKind::Both),
            other => Err(format!("unknown transport `{other}`")),
        }
    }
}

/// Server knobs, resolved from the environment over built-in defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub session_ttl: Duration,
    pub invocation_timeout: Duration,
    pub max_inflight_per_session: usize,
    pub max_inflight_global: usize,
    pub transport: TransportKind,
    pub rate_limit_per_min: u32,
    pub reaper_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            session_ttl: Duration::from_secs(3600),
            invocation_timeout: Duration::from_secs(30),
            max_inflight_per_session: 64,
            max_inflight_global: 1024,
            transport: TransportKind::Http,
            rate_limit_per_min: 600,
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Read `MCP_*` variables over the defaults. Unset variables keep
    /// their defaults; set-but-unparseable values are configuration
    /// errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ServerConfig::default();

        if let Some(host) = read("MCP_HOST") {
            config.host = host;
        }
        if let Some(port) = read("MCP_PORT") {
            config.port = parse("MCP_PORT", &port)?;
        }
        if let Some(ttl) = read("MCP_SESSION_TTL_S") {
            config.session_ttl = Duration::from_secs(parse("MCP_SESSION_TTL_S", &ttl)?);
        }
        if let Some(timeout) = read("MCP_INVOCATION_TIMEOUT_S") {
            config.invocation_timeout =
                Duration::from_secs(parse("MCP_INVOCATION_TIMEOUT_S", &timeout)?);
        }
        if let Some(cap) = read("MCP_MAX_INFLIGHT_PER_SESSION") {
            config.max_inflight_per_session = parse("MCP_MAX_INFLIGHT_PER_SESSION", &cap)?;
        }
        if let Some(cap) = read("MCP_MAX_INFLIGHT_GLOBAL") {
            config.max_inflight_global = parse("MCP_MAX_INFLIGHT_GLOBAL", &cap)?;
        }
        if let Some(transport) = read("MCP_TRANSPORT") {
            config.transport =
                transport
                    .parse()
                    .map_err(|_| ConfigError::Invalid {
                        var: "MCP_TRANSPORT".to_owned(),
                        value: transport,
                    })?;
        }
        if let Some(limit) = read("MCP_RATE_LIMIT_PER_MIN") {
            config.rate_limit_per_min = parse("MCP_RATE_LIMIT_PER_MIN", &limit)?;
        }

        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn read(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        var: var.to_owned(),
        value: value.to_owned(),
    })
}
