//! Configuration: optional TOML file plus environment overrides.
//!
//! Every value has a sane local-dev default, so the dashboard starts with no
//! config at all and talks to a broker on localhost.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub topics: Topics,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "irrigation-dashboard".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub command: String,
    pub status: String,
    pub sensor: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            command: "garden/command".to_string(),
            status: "garden/status".to_string(),
            sensor: "garden/sensor".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Sqlx connection string, or the literal "memory" for the in-process
    /// backend.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:dashboard.db?mode=rwc".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the config. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.broker.host.trim().is_empty() {
            errors.push("broker.host is empty".to_string());
        }
        if self.broker.port == 0 {
            errors.push("broker.port must be non-zero".to_string());
        }
        if self.broker.client_id.trim().is_empty() {
            errors.push("broker.client_id is empty".to_string());
        }
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }
        if self.database.url.trim().is_empty() {
            errors.push("database.url is empty".to_string());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (name, topic) in [
            ("topics.command", &self.topics.command),
            ("topics.status", &self.topics.status),
            ("topics.sensor", &self.topics.sensor),
        ] {
            if topic.trim().is_empty() {
                errors.push(format!("{name} is empty"));
            } else if topic.contains('+') || topic.contains('#') {
                // Fixed topics on both directions; wildcards would subscribe
                // to (or publish into) someone else's tree.
                errors.push(format!("{name} '{topic}' contains an MQTT wildcard"));
            } else if !seen.insert(topic.as_str()) {
                errors.push(format!("{name} '{topic}' duplicates another topic"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read the TOML file if it exists, else start from defaults.
pub fn load(path: &str) -> Result<Config> {
    let config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        Config::default()
    };
    Ok(config)
}

/// File config (CONFIG_PATH, default ./config.toml) with environment
/// overrides applied on top, validated.
pub fn from_env() -> Result<Config> {
    let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut config = load(&path)?;
    apply_env(&mut config, |key| env::var(key).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Environment overrides, injectable for tests.
fn apply_env(config: &mut Config, get: impl Fn(&str) -> Option<String>) {
    if let Some(host) = get("MQTT_HOST") {
        config.broker.host = host;
    }
    if let Some(port) = get("MQTT_PORT").and_then(|s| s.parse().ok()) {
        config.broker.port = port;
    }
    if let Some(user) = get("MQTT_USERNAME") {
        config.broker.username = Some(user);
    }
    if let Some(pass) = get("MQTT_PASSWORD") {
        config.broker.password = Some(pass);
    }
    if let Some(url) = get("DB_URL") {
        config.database.url = url;
    }
    if let Some(port) = get("WEB_PORT").and_then(|s| s.parse().ok()) {
        config.web.port = port;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_validation_err(config: &Config, needle: &str) {
        let err = config.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parse_full_file() {
        let toml_str = r#"
[broker]
host = "broker.example.com"
port = 8883
client_id = "dash-1"
username = "dash"
password = "secret"

[topics]
command = "garden/command"
status = "garden/status"
sensor = "garden/sensor"

[web]
port = 9090

[database]
url = "sqlite:/var/lib/dash.db?mode=rwc"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.broker.host, "broker.example.com");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.username.as_deref(), Some("dash"));
        assert_eq!(config.web.port, 9090);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_file_keeps_defaults() {
        let config: Config = toml::from_str("[broker]\nhost = \"10.0.0.2\"\n").unwrap();
        assert_eq!(config.broker.host, "10.0.0.2");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.topics.command, "garden/command");
    }

    #[test]
    fn parse_empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.web.port, 8080);
        config.validate().unwrap();
    }

    #[test]
    fn empty_host_rejected() {
        let mut config = Config::default();
        config.broker.host = "  ".into();
        assert_validation_err(&config, "broker.host is empty");
    }

    #[test]
    fn zero_ports_rejected() {
        let mut config = Config::default();
        config.broker.port = 0;
        config.web.port = 0;
        assert_validation_err(&config, "broker.port must be non-zero");
        assert_validation_err(&config, "web.port must be non-zero");
    }

    #[test]
    fn empty_topic_rejected() {
        let mut config = Config::default();
        config.topics.status = "".into();
        assert_validation_err(&config, "topics.status is empty");
    }

    #[test]
    fn wildcard_topic_rejected() {
        let mut config = Config::default();
        config.topics.sensor = "garden/+/sensor".into();
        assert_validation_err(&config, "contains an MQTT wildcard");
    }

    #[test]
    fn duplicate_topics_rejected() {
        let mut config = Config::default();
        config.topics.sensor = config.topics.status.clone();
        assert_validation_err(&config, "duplicates another topic");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut config = Config::default();
        config.broker.host = "".into();
        config.broker.client_id = "".into();
        config.topics.command = "#".into();
        let err = config.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("broker.host is empty"), "{msg}");
        assert!(msg.contains("broker.client_id is empty"), "{msg}");
        assert!(msg.contains("wildcard"), "{msg}");
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        apply_env(&mut config, |key| match key {
            "MQTT_HOST" => Some("192.168.1.50".to_string()),
            "MQTT_PORT" => Some("8883".to_string()),
            "DB_URL" => Some("memory".to_string()),
            "WEB_PORT" => Some("3000".to_string()),
            _ => None,
        });
        assert_eq!(config.broker.host, "192.168.1.50");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.database.url, "memory");
        assert_eq!(config.web.port, 3000);
    }

    #[test]
    fn env_bad_port_ignored() {
        let mut config = Config::default();
        apply_env(&mut config, |key| match key {
            "MQTT_PORT" => Some("not-a-port".to_string()),
            _ => None,
        });
        assert_eq!(config.broker.port, 1883);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let config = load("/nonexistent/config.toml").unwrap();
        assert_eq!(config.broker.host, "127.0.0.1");
    }
}
