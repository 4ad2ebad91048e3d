//! # Application Configuration
//!
//! One TOML file, `~/.config/trena/config.toml` unless `TRENA_CONFIG` points
//! elsewhere. A missing file is created with defaults on first start; missing
//! keys fall back to their defaults so old files keep working.
//!
//! ```toml
//! [mqtt]
//! command_topic = "projeto_trena/comando"
//! result_topic = "projeto_trena/resultado"
//! correlation = "untokened"
//!
//! [mqtt.server]
//! url = "broker.hivemq.com:1883"
//!
//! [report]
//! output_dir = "/home/me/medidas"
//! ```

use color_eyre::owo_colors::OwoColorize;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn, Level};

use crate::mqtt::{ConnectionStatus, MqttConfig};

const CONFIG_DIR: &str = ".config/trena";
const CONFIG_FILE: &str = "config.toml";
pub const CONFIG_ENV: &str = "TRENA_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub report: ReportConfig,
    pub log: LogConfig,
    pub theme: Theme,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ReportConfig {
    /// Finished reports are written here; printed only when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    pub fn level(&self) -> Level {
        Level::from_str(self.level.trim()).unwrap_or_else(|_| {
            warn!("Unknown log level '{}', using info", self.level);
            Level::INFO
        })
    }
}

/// Status colors for the console, as RGB tuples.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Theme {
    pub connected: (u8, u8, u8),
    pub connecting: (u8, u8, u8),
    pub failed: (u8, u8, u8),
    pub highlight: (u8, u8, u8),
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            connected: (0x00, 0xE6, 0x76),
            connecting: (0xFF, 0xEB, 0x3B),
            failed: (0xEF, 0x53, 0x50),
            highlight: (0xFF, 0xA0, 0x00),
        }
    }
}

impl Theme {
    pub fn status_color(&self, status: ConnectionStatus) -> (u8, u8, u8) {
        match status {
            ConnectionStatus::Connected => self.connected,
            ConnectionStatus::Connecting => self.connecting,
            ConnectionStatus::Disconnected | ConnectionStatus::ConnectFailed => self.failed,
        }
    }

    /// Wraps `text` in a 24-bit ANSI foreground color.
    pub fn paint(color: (u8, u8, u8), text: &str) -> String {
        text.truecolor(color.0, color.1, color.2).to_string()
    }
}

impl AppConfig {
    /// `$TRENA_CONFIG`, or the file under the home directory.
    pub fn default_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }

    /// Loads `path`, writing a default file first if there is none.
    pub async fn ensure_default_config(path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Self::load(path).await;
        }

        info!("Creating default configuration at {}", path.display());
        let config = Self::default();
        if let Err(e) = config.save(path).await {
            warn!("Could not write default config, continuing with defaults: {}", e);
        }
        Ok(config)
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::CorrelationMode;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = AppConfig::ensure_default_config(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(
            &path,
            "[mqtt]\ncorrelation = \"tokened\"\n\n[mqtt.server]\nurl = \"localhost:1884\"\n\n[log]\nlevel = \"debug\"\n",
        )
        .await
        .unwrap();

        let config = AppConfig::ensure_default_config(&path).await.unwrap();
        assert_eq!(config.mqtt.correlation, CorrelationMode::Tokened);
        assert_eq!(config.mqtt.server.url, "localhost:1884");
        assert_eq!(config.mqtt.result_topic, "projeto_trena/resultado");
        assert_eq!(config.log.level(), Level::DEBUG);
        assert_eq!(config.theme, Theme::default());
    }

    #[tokio::test]
    async fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[mqtt\nurl=").await.unwrap();
        assert!(AppConfig::ensure_default_config(&path).await.is_err());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn startup_notices_are_logged() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::ensure_default_config(&dir.path().join(CONFIG_FILE))
            .await
            .unwrap();
        let bad = LogConfig {
            level: "chatty".to_string(),
        };
        assert_eq!(bad.level(), config.log.level());

        let logged = String::from_utf8_lossy(&captured.0.lock().unwrap()).into_owned();
        assert!(logged.contains("Creating default configuration"), "{logged}");
        assert!(logged.contains("Unknown log level 'chatty'"), "{logged}");
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        let log = LogConfig {
            level: "chatty".to_string(),
        };
        assert_eq!(log.level(), Level::INFO);
    }

    #[test]
    fn status_colors() {
        let theme = Theme::default();
        assert_eq!(
            theme.status_color(ConnectionStatus::Connected),
            theme.connected
        );
        assert_eq!(
            theme.status_color(ConnectionStatus::ConnectFailed),
            theme.failed
        );
        let painted = Theme::paint((1, 2, 3), "ready");
        assert!(painted.starts_with("\x1b[38;2;1;2;3m"));
        assert!(painted.contains("ready"));
        assert_ne!(painted, "ready");
    }
}
