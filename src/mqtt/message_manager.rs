use chrono::NaiveDateTime;
use std::fmt;

use super::config::CorrelationMode;

/// A message delivered on the result topic, payload kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MQTTMessage {
    topic: String,
    content: String,
    timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(24).collect();
        write!(f, "{} - {}", self.timestamp.format("%H:%M:%S"), preview)
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: String, content: String) -> Self {
        MQTTMessage {
            topic,
            content,
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }
}

/// Identifier of one outstanding measure request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestToken(u32);

impl RequestToken {
    pub fn random() -> Self {
        RequestToken(rand::random())
    }

    pub fn from_raw(raw: u32) -> Self {
        RequestToken(raw)
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Builds the command payload for a measure request.
pub fn encode_command(literal: &str, token: Option<RequestToken>) -> String {
    match token {
        Some(token) => format!("{}:{}", literal, token),
        None => literal.to_string(),
    }
}

/// Result payload split into its token and measured text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultPayload<'a> {
    pub token: Option<RequestToken>,
    pub body: &'a str,
}

/// Splits a result payload according to the correlation mode.
///
/// In tokened mode a payload without a well-formed `<token>:` prefix yields
/// `None`; untokened payloads are always accepted as a bare body.
pub fn decode_result(payload: &str, mode: CorrelationMode) -> Option<ResultPayload<'_>> {
    match mode {
        CorrelationMode::Untokened => Some(ResultPayload {
            token: None,
            body: payload.trim(),
        }),
        CorrelationMode::Tokened => {
            let (token, body) = payload.split_once(':')?;
            let token = u32::from_str_radix(token.trim(), 16).ok()?;
            Some(ResultPayload {
                token: Some(RequestToken::from_raw(token)),
                body: body.trim(),
            })
        }
    }
}
