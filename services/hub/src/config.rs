use serde_derive::Deserialize;
use std::path::PathBuf;

fn default_name() -> String {
    "VCI Server".to_owned()
}

fn default_port() -> u16 {
    conduit::protocol::DEFAULT_PORT
}

/// One plug-in protocol to load at startup.
#[derive(Debug, Deserialize)]
pub struct PluginSpec {
    pub name: String,
    #[serde(default = "one")]
    pub version: u16,
}

fn one() -> u16 {
    1
}

/// Hub configuration, read from a JSON file.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Session password; absent or empty disables authentication
    /// (clients then hash the bare nonce).
    #[serde(default)]
    pub password: Option<String>,
    /// Named FIFO to read operator commands from, besides stdin.
    #[serde(default)]
    pub command_pipe: Option<PathBuf>,
    /// Plug-ins to load before the first client connects.
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.name, "VCI Server");
        assert_eq!(config.port, 26000);
        assert_eq!(config.password, None);
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let config: Config = serde_json::from_str(
            r#"{
                "name": "lab",
                "port": 31337,
                "password": "swordfish",
                "command_pipe": "/tmp/hub.pipe",
                "plugins": [
                    { "name": "Koinonia" },
                    { "name": "Agora", "version": 1 }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.name, "lab");
        assert_eq!(config.port, 31337);
        assert_eq!(config.password.as_deref(), Some("swordfish"));
        assert_eq!(config.plugins.len(), 2);
        assert_eq!(config.plugins[0].version, 1);
    }
}
