use std::str::FromStr;

use serde::Deserialize;

use crate::error::{NocturneError, NocturneResult};
use crate::reactor::ACCEPT_BATCH;
use crate::ws::WS_MAX_FRAME;

/// Address family of the listening sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    /// IPv6 socket accepting IPv4-mapped peers too.
    #[default]
    Dual,
    IPv4,
    IPv6,
    Unix,
}

impl FromStr for SocketType {
    type Err = NocturneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dual" => Ok(SocketType::Dual),
            "ipv4" => Ok(SocketType::IPv4),
            "ipv6" => Ok(SocketType::IPv6),
            "unix" => Ok(SocketType::Unix),
            _ => Err(NocturneError::InvalidConfig(format!("unknown socket type '{s}'"))),
        }
    }
}

/// Where the client address reported to handlers comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressMode {
    #[default]
    Socket,
    XForwardedFor,
    XRealIp,
}

impl FromStr for AddressMode {
    type Err = NocturneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "socket" => Ok(AddressMode::Socket),
            "x-forwarded-for" | "xforwardedfor" => Ok(AddressMode::XForwardedFor),
            "x-real-ip" | "xrealip" => Ok(AddressMode::XRealIp),
            _ => Err(NocturneError::InvalidConfig(format!("unknown client address mode '{s}'"))),
        }
    }
}

/// Daemon configuration. Durations are in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sock_type: SocketType,
    /// Address to bind, all interfaces when absent.
    pub bind_addr: Option<String>,
    /// TCP port; 0 lets the kernel choose one shared by all listeners.
    pub port: u16,
    pub unix_path: Option<String>,
    pub addr_mode: AddressMode,

    /// Number of reactor threads.
    pub workers: usize,
    /// Number of SO_REUSEPORT listeners. Reactors share them round-robin.
    pub listeners: usize,
    /// Pin reactor threads to cores.
    pub pin_cores: bool,

    pub idle_timeout: u64,
    /// Maximum lifetime of a keep-alive connection, 0 disables keep-alive.
    pub keepalive_time: u64,
    pub send_timeout: u64,
    pub stop_timeout: u64,

    pub max_request_size: usize,
    pub max_url_len: usize,
    pub max_request_headers: usize,
    pub max_request_cookies: usize,

    pub ws_max_frame: u64,
    pub accept_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        let workers = 2 * num_cpus::get().max(1);
        Self {
            sock_type: SocketType::Dual,
            bind_addr: None,
            port: 8889,
            unix_path: None,
            addr_mode: AddressMode::Socket,
            workers,
            listeners: workers,
            pin_cores: false,
            idle_timeout: 10_000,
            keepalive_time: 20_000,
            send_timeout: 60_000,
            stop_timeout: 30_000,
            max_request_size: 40 * 1024,
            max_url_len: 32 * 1024,
            max_request_headers: 64,
            max_request_cookies: 64,
            ws_max_frame: WS_MAX_FRAME,
            accept_batch: ACCEPT_BATCH,
        }
    }
}

impl Config {
    /// Load configuration from `NOCTURNE_*` environment variables (with .env support).
    pub fn from_env() -> NocturneResult<Self> {
        // Missing .env is fine
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from defaults overridden by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> NocturneResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(sock) = lookup("NOCTURNE_SOCKET") {
            config.sock_type = sock.parse()?;
        }
        if let Some(port) = lookup("NOCTURNE_PORT") {
            config.set_port_or_path(&port)?;
        }
        if let Some(path) = lookup("NOCTURNE_UNIX_PATH") {
            config.unix_path = Some(path);
        }
        config.bind_addr = lookup("NOCTURNE_BIND").or(config.bind_addr);
        if let Some(mode) = lookup("NOCTURNE_CLIENT_ADDRESS") {
            config.addr_mode = mode.parse()?;
        }
        if let Some(workers) = parse_var(&lookup, "NOCTURNE_WORKERS")? {
            config.workers = workers;
            config.listeners = workers;
        }
        if let Some(listeners) = parse_var(&lookup, "NOCTURNE_LISTENERS")? {
            config.listeners = listeners;
        }
        if let Some(v) = parse_var(&lookup, "NOCTURNE_IDLE_TIMEOUT")? {
            config.idle_timeout = v;
        }
        if let Some(v) = parse_var(&lookup, "NOCTURNE_KEEPALIVE_TIME")? {
            config.keepalive_time = v;
        }
        if let Some(v) = parse_var(&lookup, "NOCTURNE_SEND_TIMEOUT")? {
            config.send_timeout = v;
        }
        if let Some(v) = parse_var(&lookup, "NOCTURNE_STOP_TIMEOUT")? {
            config.stop_timeout = v;
        }
        if let Some(v) = parse_var(&lookup, "NOCTURNE_MAX_REQUEST_SIZE")? {
            config.max_request_size = v;
        }

        Ok(config)
    }

    /// All-digit strings select a TCP port, anything else a Unix socket path.
    pub fn set_port_or_path(&mut self, value: &str) -> NocturneResult<()> {
        if !value.is_empty() && value.bytes().all(|c| c.is_ascii_digit()) {
            self.port = value
                .parse()
                .map_err(|_| NocturneError::InvalidConfig(format!("invalid port '{value}'")))?;
            if self.sock_type == SocketType::Unix {
                self.sock_type = SocketType::Dual;
            }
        } else {
            self.sock_type = SocketType::Unix;
            self.unix_path = Some(value.to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> NocturneResult<()> {
        let invalid = |msg: String| Err(NocturneError::InvalidConfig(msg));

        if self.sock_type == SocketType::Unix {
            match &self.unix_path {
                None => return invalid("Unix socket path must be set".into()),
                Some(path) if path.is_empty() => return invalid("Unix socket path must be set".into()),
                Some(path) if path.len() >= UNIX_PATH_MAX => {
                    return invalid(format!("Unix socket path '{path}' is too long"));
                }
                Some(_) => {}
            }
        } else if let Some(addr) = &self.bind_addr {
            match addr.parse::<std::net::IpAddr>() {
                Ok(std::net::IpAddr::V6(_)) if self.sock_type == SocketType::IPv4 => {
                    return invalid(format!("cannot bind IPv6 address '{addr}' to an IPv4 socket"));
                }
                Ok(std::net::IpAddr::V4(_)) if self.sock_type == SocketType::IPv6 => {
                    return invalid(format!("cannot bind IPv4 address '{addr}' to an IPv6 socket"));
                }
                Ok(_) => {}
                Err(_) => return invalid(format!("invalid bind address '{addr}'")),
            }
        }

        if self.workers < 1 {
            return invalid("workers must be at least 1".into());
        }
        if self.listeners < 1 {
            return invalid("listeners must be at least 1".into());
        }
        if self.idle_timeout < 1000 {
            return invalid("idle_timeout must be >= 1000 ms".into());
        }
        if self.keepalive_time != 0 && self.keepalive_time < 5000 {
            return invalid("keepalive_time must be 0 or >= 5000 ms".into());
        }
        if self.send_timeout < 1000 {
            return invalid("send_timeout must be >= 1000 ms".into());
        }
        if self.stop_timeout < 1000 {
            return invalid("stop_timeout must be >= 1000 ms".into());
        }
        if self.max_request_size < 1024 {
            return invalid("max_request_size must be >= 1024 bytes".into());
        }
        if self.max_url_len < 512 || self.max_url_len >= self.max_request_size {
            return invalid("max_url_len must be >= 512 and below max_request_size".into());
        }
        if self.max_request_headers < 16 {
            return invalid("max_request_headers must be >= 16".into());
        }
        if self.max_request_cookies < 16 {
            return invalid("max_request_cookies must be >= 16".into());
        }
        if self.ws_max_frame < 125 {
            return invalid("ws_max_frame must be >= 125 bytes".into());
        }
        if self.accept_batch < 1 {
            return invalid("accept_batch must be at least 1".into());
        }

        Ok(())
    }

    /// Number of listening sockets the daemon will open.
    pub fn listener_count(&self) -> usize {
        if self.sock_type == SocketType::Unix {
            1
        } else {
            self.listeners.clamp(1, self.workers.max(1))
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            idle_timeout: self.idle_timeout as i64,
            keepalive_time: self.keepalive_time as i64,
            send_timeout: self.send_timeout as i64,
            max_request_size: self.max_request_size,
            max_url_len: self.max_url_len,
            max_request_headers: self.max_request_headers,
            max_request_cookies: self.max_request_cookies,
            addr_mode: self.addr_mode,
            ws_max_frame: self.ws_max_frame,
        }
    }
}

/// Per-connection view of the configuration.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub idle_timeout: i64,
    pub keepalive_time: i64,
    pub send_timeout: i64,
    pub max_request_size: usize,
    pub max_url_len: usize,
    pub max_request_headers: usize,
    pub max_request_cookies: usize,
    pub addr_mode: AddressMode,
    pub ws_max_frame: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Config::default().limits()
    }
}

const UNIX_PATH_MAX: usize = 104;

fn parse_var<T, F>(lookup: &F, key: &str) -> NocturneResult<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| NocturneError::InvalidConfig(format!("{key}: invalid value '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 8889);
        assert_eq!(config.idle_timeout, 10_000);
        assert_eq!(config.ws_max_frame, 4 * 1024 * 1024);
        assert_eq!(config.accept_batch, 8);
    }

    #[test]
    fn test_validate_rejects_short_timeouts() {
        let config = Config { idle_timeout: 500, ..Config::default() };
        assert!(matches!(config.validate(), Err(NocturneError::InvalidConfig(_))));

        let config = Config { keepalive_time: 2000, ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config { keepalive_time: 0, ..Config::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_unix_requires_path() {
        let config = Config { sock_type: SocketType::Unix, ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config {
            sock_type: SocketType::Unix,
            unix_path: Some("/tmp/nocturne.sock".into()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.listener_count(), 1);
    }

    #[test]
    fn test_validate_bind_family_mismatch() {
        let config = Config {
            sock_type: SocketType::IPv4,
            bind_addr: Some("::1".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("NOCTURNE_PORT", "9000"),
            ("NOCTURNE_WORKERS", "3"),
            ("NOCTURNE_CLIENT_ADDRESS", "X-Real-IP"),
            ("NOCTURNE_IDLE_TIMEOUT", "2500"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.workers, 3);
        assert_eq!(config.listeners, 3);
        assert_eq!(config.addr_mode, AddressMode::XRealIp);
        assert_eq!(config.idle_timeout, 2500);
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let result = Config::from_lookup(lookup(&[("NOCTURNE_WORKERS", "many")]));
        assert!(matches!(result, Err(NocturneError::InvalidConfig(_))));
    }

    #[test]
    fn test_set_port_or_path() {
        let mut config = Config::default();
        config.set_port_or_path("/run/app.sock").unwrap();
        assert_eq!(config.sock_type, SocketType::Unix);
        assert_eq!(config.unix_path.as_deref(), Some("/run/app.sock"));

        config.set_port_or_path("8080").unwrap();
        assert_eq!(config.sock_type, SocketType::Dual);
        assert_eq!(config.port, 8080);
    }
}
