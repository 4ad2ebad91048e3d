use serde::{Deserialize, Serialize};
use std::fmt;

use super::mqtt_handler::ChannelError;

/// Broker endpoint plus optional credentials.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MqttServer {
    /// `host:port`, port defaults to 1883 when omitted
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pw: Option<String>,
}

impl Default for MqttServer {
    fn default() -> Self {
        Self {
            url: "broker.hivemq.com:1883".to_string(),
            user: None,
            pw: None,
        }
    }
}

impl fmt::Display for MqttServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}@{}", user, self.url),
            None => write!(f, "{}", self.url),
        }
    }
}

impl MqttServer {
    /// Splits the url into host and port.
    pub fn address(&self) -> Result<(String, u16), ChannelError> {
        let url = self.url.trim();
        let url = url.strip_prefix("tcp://").unwrap_or(url);
        let mut parts = url.splitn(2, ':');
        let host = parts.next().unwrap_or_default().trim();
        if host.is_empty() {
            return Err(ChannelError::InvalidBroker(self.url.clone()));
        }
        let port = match parts.next() {
            Some(port) => port
                .trim()
                .parse::<u16>()
                .map_err(|_| ChannelError::InvalidBroker(self.url.clone()))?,
            None => 1883,
        };
        Ok((host.to_string(), port))
    }
}

/// How result messages are matched to the request that caused them.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMode {
    /// Bare command literal, every result is accepted (stock device firmware).
    #[default]
    Untokened,
    /// `MEDIR:<token>` out, `<token>:<value>` back; mismatches are dropped.
    Tokened,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub command_topic: String,
    pub result_topic: String,
    pub command_literal: String,
    pub keep_alive_secs: u64,
    pub client_id_prefix: String,
    /// Capacity of the rumqttc request queue and of the event channel
    pub event_capacity: usize,
    pub correlation: CorrelationMode,
    pub server: MqttServer,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            command_topic: "projeto_trena/comando".to_string(),
            result_topic: "projeto_trena/resultado".to_string(),
            command_literal: "MEDIR".to_string(),
            keep_alive_secs: 5,
            client_id_prefix: "trena".to_string(),
            event_capacity: 100,
            correlation: CorrelationMode::Untokened,
            server: MqttServer::default(),
        }
    }
}
