//! Configuration loader and validator for the telemetry relay.
use lettre::message::Mailbox;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub broker: Broker,
    pub workers: Workers,
    pub store: StoreConfig,
    pub smtp: Smtp,
    #[serde(default)]
    pub reminders: Reminders,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Broker {
    pub host: String,
    pub port: u16,
    pub keepalive_seconds: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Largest packet accepted from or sent to the broker. A publish above
    /// this limit breaks the connection, not just the one message.
    #[serde(default = "default_max_packet_bytes")]
    pub max_packet_bytes: usize,
    /// Absent means a dropped connection is fatal to the worker.
    #[serde(default)]
    pub reconnect: Option<Reconnect>,
}

/// Capped exponential backoff between broker reconnect attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reconnect {
    pub initial_delay_ms: u64,
    pub max_delay_seconds: u64,
    pub max_attempts: u32,
}

impl Reconnect {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.initial_delay_ms);
        let cap = Duration::from_secs(self.max_delay_seconds);
        let factor = 1_u32 << attempt.saturating_sub(1).min(16);
        base.saturating_mul(factor).min(cap)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workers {
    pub health: WorkerConfig,
    pub feeding: WorkerConfig,
}

/// One subscription: a fixed topic and the client id used on the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    pub topic: String,
    pub client_id: String,
}

/// Which store backend receives records and serves reminder configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    Supabase { url: String, api_key: String },
    Sqlite { database_url: String },
}

/// Outbound mail relay settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Smtp {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reminders {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_dedup")]
    pub dedup: bool,
}

/// 1 MiB. rumqttc's own default is 10 KiB.
pub const DEFAULT_MAX_PACKET_BYTES: usize = 1024 * 1024;
/// Upper bound of the MQTT remaining-length field.
const MQTT_MAX_PACKET_BYTES: usize = 268_435_455;

fn default_max_packet_bytes() -> usize {
    DEFAULT_MAX_PACKET_BYTES
}

fn default_poll_interval() -> u64 {
    30
}

fn default_dedup() -> bool {
    true
}

impl Default for Reminders {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            dedup: default_dedup(),
        }
    }
}

impl Reminders {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

impl Config {
    /// Apply secrets and overrides from the environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        match &mut self.store {
            StoreConfig::Sqlite { database_url } => {
                if let Some(url) = lookup("DATABASE_URL") {
                    *database_url = url;
                }
            }
            StoreConfig::Supabase { api_key, .. } => {
                if let Some(key) = lookup("SUPABASE_KEY") {
                    *api_key = key;
                }
            }
        }
        if let Some(password) = lookup("SMTP_PASSWORD") {
            self.smtp.password = password;
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.broker.host.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.host must be non-empty"));
    }
    if cfg.broker.port == 0 {
        return Err(ConfigError::Invalid("broker.port must be > 0"));
    }
    if cfg.broker.keepalive_seconds == 0 {
        return Err(ConfigError::Invalid("broker.keepalive_seconds must be > 0"));
    }
    if cfg.broker.max_packet_bytes == 0 || cfg.broker.max_packet_bytes > MQTT_MAX_PACKET_BYTES {
        return Err(ConfigError::Invalid(
            "broker.max_packet_bytes must be between 1 and 268435455",
        ));
    }
    if let Some(rc) = &cfg.broker.reconnect {
        if rc.initial_delay_ms == 0 || rc.max_delay_seconds == 0 {
            return Err(ConfigError::Invalid("broker.reconnect delays must be > 0"));
        }
        if Duration::from_millis(rc.initial_delay_ms) > Duration::from_secs(rc.max_delay_seconds) {
            return Err(ConfigError::Invalid(
                "broker.reconnect.initial_delay_ms must not exceed max_delay_seconds",
            ));
        }
    }

    for (worker, topic_msg, client_msg) in [
        (
            &cfg.workers.health,
            "workers.health.topic must be non-empty",
            "workers.health.client_id must be non-empty",
        ),
        (
            &cfg.workers.feeding,
            "workers.feeding.topic must be non-empty",
            "workers.feeding.client_id must be non-empty",
        ),
    ] {
        if worker.topic.trim().is_empty() {
            return Err(ConfigError::Invalid(topic_msg));
        }
        if worker.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid(client_msg));
        }
    }
    if cfg.workers.health.client_id == cfg.workers.feeding.client_id {
        return Err(ConfigError::Invalid("workers must use distinct client ids"));
    }

    match &cfg.store {
        StoreConfig::Supabase { url, api_key } => {
            if url.trim().is_empty() {
                return Err(ConfigError::Invalid("store.url must be non-empty"));
            }
            if api_key.trim().is_empty() {
                return Err(ConfigError::Invalid("store.api_key must be non-empty"));
            }
        }
        StoreConfig::Sqlite { database_url } => {
            if database_url.trim().is_empty() {
                return Err(ConfigError::Invalid("store.database_url must be non-empty"));
            }
        }
    }

    if cfg.smtp.host.trim().is_empty() {
        return Err(ConfigError::Invalid("smtp.host must be non-empty"));
    }
    if cfg.smtp.port == 0 {
        return Err(ConfigError::Invalid("smtp.port must be > 0"));
    }
    if cfg.smtp.username.trim().is_empty() {
        return Err(ConfigError::Invalid("smtp.username must be non-empty"));
    }
    if cfg.smtp.from.parse::<Mailbox>().is_err() {
        return Err(ConfigError::Invalid("smtp.from must be a valid mailbox"));
    }

    // Each poll evaluates only the minute it wakes in.
    if cfg.reminders.poll_interval_seconds == 0 || cfg.reminders.poll_interval_seconds >= 60 {
        return Err(ConfigError::Invalid(
            "reminders.poll_interval_seconds must be between 1 and 59",
        ));
    }

    Ok(())
}

/// Returns the example YAML content shipped with the service.
pub fn example() -> &'static str {
    r#"broker:
  host: "broker.emqx.io"
  port: 1883
  keepalive_seconds: 60
  max_packet_bytes: 1048576
  # reconnect:
  #   initial_delay_ms: 1000
  #   max_delay_seconds: 60
  #   max_attempts: 10

workers:
  health:
    topic: "pet/manager/topic/collar"
    client_id: "health_records_client"
  feeding:
    topic: "pet/manager/topic/feeding"
    client_id: "feeding_records_client"

store:
  backend: supabase
  url: "https://YOUR_PROJECT.supabase.co"
  api_key: "YOUR_SERVICE_ROLE_KEY"

smtp:
  host: "smtp.gmail.com"
  port: 587
  username: "reminders@example.com"
  password: "YOUR_APP_PASSWORD"
  from: "Pet Reminders <reminders@example.com>"

reminders:
  poll_interval_seconds: 30
  dedup: true
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.workers.health.topic, "pet/manager/topic/collar");
        assert!(cfg.broker.reconnect.is_none());
        assert!(matches!(cfg.store, StoreConfig::Supabase { .. }));
    }

    #[test]
    fn reminders_section_defaults_when_absent() {
        let yaml = example().split("reminders:").next().unwrap().to_string();
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.reminders, Reminders::default());
        assert_eq!(cfg.reminders.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn invalid_broker() {
        let mut cfg = example_cfg();
        cfg.broker.host = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("broker.host")), _ => panic!("wrong error") }

        let mut cfg = example_cfg();
        cfg.broker.keepalive_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_poll_interval() {
        for secs in [0, 60, 120] {
            let mut cfg = example_cfg();
            cfg.reminders.poll_interval_seconds = secs;
            let err = validate(&cfg).unwrap_err();
            match err { ConfigError::Invalid(msg) => assert!(msg.contains("poll_interval_seconds")), _ => panic!("wrong error") }
        }
        let mut cfg = example_cfg();
        cfg.reminders.poll_interval_seconds = 59;
        validate(&cfg).unwrap();
    }

    #[test]
    fn max_packet_size_defaults_and_bounds() {
        let yaml = example().replace("  max_packet_bytes: 1048576\n", "");
        assert!(!yaml.contains("max_packet_bytes"));
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.broker.max_packet_bytes, DEFAULT_MAX_PACKET_BYTES);

        let mut cfg = example_cfg();
        cfg.broker.max_packet_bytes = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
        cfg.broker.max_packet_bytes = MQTT_MAX_PACKET_BYTES + 1;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_reconnect_policy() {
        let mut cfg = example_cfg();
        cfg.broker.reconnect = Some(Reconnect {
            initial_delay_ms: 0,
            max_delay_seconds: 10,
            max_attempts: 3,
        });
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        cfg.broker.reconnect = Some(Reconnect {
            initial_delay_ms: 20_000,
            max_delay_seconds: 10,
            max_attempts: 3,
        });
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("initial_delay_ms")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_workers() {
        let mut cfg = example_cfg();
        cfg.workers.feeding.topic = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("feeding.topic")), _ => panic!("wrong error") }

        let mut cfg = example_cfg();
        cfg.workers.feeding.client_id = cfg.workers.health.client_id.clone();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_smtp_from() {
        let mut cfg = example_cfg();
        cfg.smtp.from = "not an address".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("smtp.from")), _ => panic!("wrong error") }
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let rc = Reconnect {
            initial_delay_ms: 500,
            max_delay_seconds: 3,
            max_attempts: 5,
        };
        assert_eq!(rc.delay_for(1), Duration::from_millis(500));
        assert_eq!(rc.delay_for(2), Duration::from_millis(1000));
        assert_eq!(rc.delay_for(3), Duration::from_millis(2000));
        assert_eq!(rc.delay_for(4), Duration::from_secs(3));
        assert_eq!(rc.delay_for(40), Duration::from_secs(3));
    }

    #[test]
    fn env_overrides_secrets() {
        let mut cfg = example_cfg();
        cfg.apply_overrides(|key| match key {
            "SUPABASE_KEY" => Some("from-env".into()),
            "SMTP_PASSWORD" => Some("smtp-env".into()),
            _ => None,
        });
        assert_eq!(
            cfg.store,
            StoreConfig::Supabase {
                url: "https://YOUR_PROJECT.supabase.co".into(),
                api_key: "from-env".into(),
            }
        );
        assert_eq!(cfg.smtp.password, "smtp-env");

        let mut cfg = example_cfg();
        cfg.store = StoreConfig::Sqlite { database_url: "sqlite://a.db".into() };
        cfg.apply_overrides(|key| (key == "DATABASE_URL").then(|| "sqlite::memory:".to_string()));
        assert_eq!(cfg.store, StoreConfig::Sqlite { database_url: "sqlite::memory:".into() });
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.workers.feeding.client_id, "feeding_records_client");
    }
}
