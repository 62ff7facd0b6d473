use std::env;

/// One STUN/TURN server entry. Plain strings here; only the peer-link
/// binding converts them to engine types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Websocket address of the signaling relay.
    pub relay_url: String,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Config {
    pub fn from_env() -> Self {
        let relay_url = env::var("PARLEY_RELAY_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string());

        let mut ice_servers = Vec::new();
        match env::var("PARLEY_STUN_URLS") {
            Ok(urls) => ice_servers.push(IceServerConfig {
                urls: split_urls(&urls),
                username: None,
                credential: None,
            }),
            Err(_) => ice_servers.push(default_stun()),
        }
        match env::var("PARLEY_TURN_URLS") {
            Ok(urls) => ice_servers.push(IceServerConfig {
                urls: split_urls(&urls),
                username: env::var("PARLEY_TURN_USERNAME").ok(),
                credential: env::var("PARLEY_TURN_CREDENTIAL").ok(),
            }),
            Err(_) => ice_servers.push(default_turn()),
        }

        Self {
            relay_url,
            ice_servers,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/ws".to_string(),
            ice_servers: vec![default_stun(), default_turn()],
        }
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_stun() -> IceServerConfig {
    IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }
}

fn default_turn() -> IceServerConfig {
    IceServerConfig {
        urls: vec![
            "turn:openrelay.metered.ca:80".to_string(),
            "turn:openrelay.metered.ca:443".to_string(),
            "turn:openrelay.metered.ca:443?transport=tcp".to_string(),
        ],
        username: Some("openrelayproject".to_string()),
        credential: Some("openrelayproject".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not run in parallel.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn default_config_has_stun_and_turn() {
        let config = Config::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
        assert!(config.ice_servers[1].credential.is_some());
    }

    #[test]
    fn env_overrides_relay_and_stun() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("PARLEY_RELAY_URL", "ws://relay.example:9000/ws");
            env::set_var("PARLEY_STUN_URLS", "stun:a.example:3478, stun:b.example:3478");
        }
        let config = Config::from_env();
        assert_eq!(config.relay_url, "ws://relay.example:9000/ws");
        assert_eq!(
            config.ice_servers[0].urls,
            vec!["stun:a.example:3478", "stun:b.example:3478"]
        );
        unsafe {
            env::remove_var("PARLEY_RELAY_URL");
            env::remove_var("PARLEY_STUN_URLS");
        }
    }
}
