use std::env;
#[cfg(test)]
use std::sync::Mutex;

use crate::relay::pusher::PusherConfig;

pub const SERVER_ENV: &str = "PEER_MEET_SERVER";
pub const PUSHER_KEY_ENV: &str = "PEER_MEET_PUSHER_KEY";
pub const PUSHER_CLUSTER_ENV: &str = "PEER_MEET_PUSHER_CLUSTER";
pub const ICE_SERVERS_ENV: &str = "PEER_MEET_ICE_SERVERS";

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";
pub const DEFAULT_PUSHER_CLUSTER: &str = "ap2";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Runtime configuration read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Base URL of the room server.
    pub server: String,
    pub pusher_key: Option<String>,
    pub pusher_cluster: String,
    pub ice_servers: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let server = env::var(SERVER_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| normalize_server(&value))
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());
        let pusher_key = env::var(PUSHER_KEY_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let pusher_cluster = env::var(PUSHER_CLUSTER_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_PUSHER_CLUSTER.to_string());
        let ice_servers = match env::var(ICE_SERVERS_ENV) {
            Ok(value) => parse_ice_servers(&value),
            Err(_) => vec![DEFAULT_ICE_SERVER.to_string()],
        };
        Self {
            server,
            pusher_key,
            pusher_cluster,
            ice_servers,
        }
    }

    pub fn pusher(&self) -> Option<PusherConfig> {
        self.pusher_key
            .as_ref()
            .map(|key| PusherConfig::new(key.clone(), self.pusher_cluster.clone()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            pusher_key: None,
            pusher_cluster: DEFAULT_PUSHER_CLUSTER.to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
        }
    }
}

/// Rewrites `localhost` to the IPv4 loopback so clients do not prefer `::1`
/// when the server only listens on IPv4.
pub fn normalize_server(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    for scheme in ["http://", "https://"] {
        if let Some(rest) = server.strip_prefix(scheme) {
            if rest == "localhost" || rest.starts_with("localhost:") || rest.starts_with("localhost/") {
                return format!("{scheme}{}", rest.replacen("localhost", "127.0.0.1", 1));
            }
            return server.to_string();
        }
    }
    if server == "localhost" || server.starts_with("localhost:") {
        return format!("http://{}", server.replacen("localhost", "127.0.0.1", 1));
    }
    format!("http://{server}")
}

fn parse_ice_servers(value: &str) -> Vec<String> {
    if value.trim().eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
