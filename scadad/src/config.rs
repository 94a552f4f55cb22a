//! Process settings, read from `SCADA_` environment variables after an
//! optional `.env` file. Nested fields are separated by `__`, so the local
//! broker's host is `SCADA_LOCAL_MQTT__HOST`.
use scada_link::{MqttSettings, TlsSettings};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

pub const ENV_PREFIX: &str = "SCADA_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
    #[error("Unable to load env file {path}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
    #[error("Env file {0} does not exist")]
    MissingEnvFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScadaSettings {
    pub layout_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub seconds_per_pat: f64,
    pub snapshot_period_s: u64,
    pub local_mqtt: MqttSettings,
    pub gridworks_mqtt: MqttSettings,
}

fn config_dir(home: Option<String>) -> PathBuf {
    home.map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/gridworks/scada")
}

/// `$HOME/.config/gridworks/scada/.env`
pub fn default_env_file() -> PathBuf {
    config_dir(std::env::var("HOME").ok()).join(".env")
}

/// Load `path` into the environment without overriding variables that are
/// already set. A missing default file is fine, a missing explicit one is
/// not. Returns the file that was loaded.
pub fn load_env_file(path: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (default_env_file(), false),
    };
    if !path.exists() {
        if explicit {
            return Err(ConfigError::MissingEnvFile(path));
        }
        return Ok(None);
    }
    dotenvy::from_path(&path).map_err(|source| ConfigError::EnvFile {
        path: path.clone(),
        source,
    })?;
    Ok(Some(path))
}

/// Reads prefixed keys through a lookup function so tests need not touch
/// the process environment
struct Env<F> {
    get: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.get)(&format!("{ENV_PREFIX}{key}")).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.raw(key)
            .map(|value| {
                value.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: format!("{ENV_PREFIX}{key}"),
                    value,
                })
            })
            .transpose()
    }

    fn or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    fn mqtt(&self, prefix: &str) -> Result<MqttSettings, ConfigError> {
        let defaults = MqttSettings::default();
        let key = |field: &str| format!("{prefix}__{field}");
        Ok(MqttSettings {
            host: self.or(&key("HOST"), defaults.host)?,
            port: self.or(&key("PORT"), defaults.port)?,
            keepalive_s: self.or(&key("KEEPALIVE"), defaults.keepalive_s)?,
            username: self.raw(&key("USERNAME")),
            password: self.raw(&key("PASSWORD")),
            tls: TlsSettings {
                ca_cert: self.raw(&key("TLS__CA_CERT")).map(PathBuf::from),
                cert: self.raw(&key("TLS__CERT")).map(PathBuf::from),
                key: self.raw(&key("TLS__KEY")).map(PathBuf::from),
                ciphers: self.raw(&key("TLS__CIPHERS")),
            },
        })
    }
}

impl ScadaSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = get("HOME");
        let env = Env { get };
        Ok(Self {
            layout_path: env
                .raw("LAYOUT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| config_dir(home).join("hardware-layout.json")),
            log_dir: env.or("LOG_DIR", PathBuf::from("./logs"))?,
            log_level: env.or("LOG_LEVEL", "info".to_string())?,
            seconds_per_pat: env.or("SECONDS_PER_PAT", 10.0)?,
            snapshot_period_s: env.or("SNAPSHOT_PERIOD_S", 60)?,
            local_mqtt: env.mqtt("LOCAL_MQTT")?,
            gridworks_mqtt: env.mqtt("GRIDWORKS_MQTT")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, io::Write};

    fn settings(vars: &[(&str, &str)]) -> Result<ScadaSettings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ScadaSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let s = settings(&[("HOME", "/home/pi")]).unwrap();
        assert_eq!(
            s.layout_path,
            PathBuf::from("/home/pi/.config/gridworks/scada/hardware-layout.json")
        );
        assert_eq!(s.seconds_per_pat, 10.0);
        assert_eq!(s.local_mqtt, MqttSettings::default());
        assert!(!s.gridworks_mqtt.tls.enabled());
    }

    #[test]
    fn nested_broker_settings() {
        let s = settings(&[
            ("SCADA_LOCAL_MQTT__HOST", "192.168.1.10"),
            ("SCADA_GRIDWORKS_MQTT__HOST", "mqtt.example.org"),
            ("SCADA_GRIDWORKS_MQTT__PORT", "8883"),
            ("SCADA_GRIDWORKS_MQTT__USERNAME", "beech"),
            ("SCADA_GRIDWORKS_MQTT__PASSWORD", "secret"),
            ("SCADA_GRIDWORKS_MQTT__TLS__CA_CERT", "/etc/scada/ca.pem"),
            ("SCADA_SECONDS_PER_PAT", "2.5"),
        ])
        .unwrap();
        assert_eq!(s.local_mqtt.host, "192.168.1.10");
        assert_eq!(s.local_mqtt.port, 1883);
        assert_eq!(s.gridworks_mqtt.port, 8883);
        assert_eq!(s.gridworks_mqtt.username.as_deref(), Some("beech"));
        assert!(s.gridworks_mqtt.tls.enabled());
        assert_eq!(s.seconds_per_pat, 2.5);
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = settings(&[("SCADA_LOCAL_MQTT__PORT", "eighteen")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key, .. } if key == "SCADA_LOCAL_MQTT__PORT"
        ));
    }

    #[test]
    fn env_file_does_not_override_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "SCADA_TEST_ENV_FILE_ONLY=from-file").unwrap();
        writeln!(file, "SCADA_TEST_ENV_FILE_BOTH=from-file").unwrap();
        std::env::set_var("SCADA_TEST_ENV_FILE_BOTH", "from-env");

        let loaded = load_env_file(Some(file.path())).unwrap();
        assert_eq!(loaded.as_deref(), Some(file.path()));
        assert_eq!(std::env::var("SCADA_TEST_ENV_FILE_ONLY").unwrap(), "from-file");
        assert_eq!(std::env::var("SCADA_TEST_ENV_FILE_BOTH").unwrap(), "from-env");

        assert!(matches!(
            load_env_file(Some(Path::new("/nonexistent/.env"))),
            Err(ConfigError::MissingEnvFile(_))
        ));
    }
}
