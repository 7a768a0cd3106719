//! HTTP implementation of the external message channel.
//!
//! Talks to an inbox-style REST API: `GET {base_url}/messages?address=...`
//! returning a JSON array of messages. The poller in `stepline-core` owns
//! all timing; this type only fetches and decodes.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use stepline_core::poller::{ChannelMessage, MessageSource, PollError};

/// Message source backed by an HTTP inbox API.
pub struct HttpMessageSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMessageSource {
    /// Create a source for the given API base URL (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageDto {
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
    date: DateTime<Utc>,
}

impl From<MessageDto> for ChannelMessage {
    fn from(dto: MessageDto) -> Self {
        Self {
            subject: dto.subject,
            body: dto.body,
            date: dto.date,
        }
    }
}

fn decode_messages(body: &str) -> Result<Vec<ChannelMessage>, PollError> {
    let dtos: Vec<MessageDto> =
        serde_json::from_str(body).map_err(|e| PollError::Request(e.to_string()))?;
    Ok(dtos.into_iter().map(ChannelMessage::from).collect())
}

impl MessageSource for HttpMessageSource {
    async fn fetch(&self, address: &str) -> Result<Vec<ChannelMessage>, PollError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("address", address)])
            .send()
            .await
            .map_err(|e| PollError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(PollError::AccessDenied(format!("HTTP {}", response.status())))
            }
            status if !status.is_success() => {
                Err(PollError::Request(format!("HTTP {status}")))
            }
            _ => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| PollError::Request(e.to_string()))?;
                decode_messages(&body)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_message_list() {
        let body = r#"[
            {"subject": "Verify", "body": "your code is 123456", "date": "2026-08-23T10:00:00Z"},
            {"body": "no subject line", "date": "2026-08-23T10:05:00Z"}
        ]"#;
        let messages = decode_messages(body).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].subject, "Verify");
        assert_eq!(messages[1].subject, "");
        assert!(messages[1].date > messages[0].date);
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let result = decode_messages(r#"{"not": "a list"}"#);
        assert!(matches!(result, Err(PollError::Request(_))));
    }
}
